//! Streaming pull parser for the XML stanza stream.
//!
//! Reads the `<stream:stream>` header once, then yields fully-buffered
//! top-level elements one at a time. Inter-stanza text (whitespace
//! keep-alives) is dropped. `</stream:stream>` surfaces as
//! [`Error::StreamClosed`], `<stream:error>` as [`Error::StreamFatal`].

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tokio::io::{AsyncRead, BufReader};
use tracing::trace;

use crate::error::Error;
use crate::ns;
use crate::xml::Element;

/// Parsed attributes of the server's `<stream:stream>` response header.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    pub id: Option<String>,
    pub from: Option<String>,
    /// Server default language from `xml:lang`.
    pub lang: Option<String>,
    pub version: Option<String>,
}

/// Builds the opening `<stream:stream>` header the client sends.
pub fn stream_open_xml(domain: &str) -> String {
    format!(
        "<?xml version='1.0'?>\
         <stream:stream \
         xmlns='jabber:client' \
         xmlns:stream='http://etherx.jabber.org/streams' \
         to='{domain}' \
         version='1.0'>"
    )
}

type Scope = HashMap<String, String>;

pub struct XmlStream<R> {
    reader: Reader<BufReader<R>>,
    buf: Vec<u8>,
    /// Prefix binding frames; index 0 holds the built-ins, index 1 the
    /// bindings declared on `<stream:stream>` once the header is read.
    scopes: Vec<Scope>,
    header: Option<StreamHeader>,
}

impl<R: AsyncRead + Unpin> XmlStream<R> {
    pub fn new(inner: R) -> Self {
        let mut reader = Reader::from_reader(BufReader::new(inner));
        reader.config_mut().expand_empty_elements = true;
        let mut builtins = Scope::new();
        builtins.insert(String::new(), String::new());
        builtins.insert("xml".to_owned(), ns::XML.to_owned());
        XmlStream {
            reader,
            buf: Vec::with_capacity(4096),
            scopes: vec![builtins],
            header: None,
        }
    }

    /// Gives the underlying byte stream back, for a TLS upgrade or a
    /// stream restart. Any parser state is discarded.
    pub fn into_inner(self) -> R {
        self.reader.into_inner().into_inner()
    }

    pub fn header(&self) -> Option<&StreamHeader> {
        self.header.as_ref()
    }

    /// Reads up to and including the server's `<stream:stream>` header,
    /// skipping the XML declaration and any leading whitespace.
    pub async fn read_header(&mut self) -> Result<StreamHeader, Error> {
        loop {
            self.buf.clear();
            let event = self
                .reader
                .read_event_into_async(&mut self.buf)
                .await
                .map_err(map_xml_error)?;
            match event {
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
                Event::Text(_) => {}
                Event::Start(start) => {
                    let element = begin_element(&mut self.scopes, &start)?;
                    if !element.is("stream", ns::STREAM) {
                        return Err(Error::StreamXml(format!(
                            "expected stream header, got <{}>",
                            element.name()
                        )));
                    }
                    let header = StreamHeader {
                        id: element.attr("id").map(str::to_owned),
                        from: element.attr("from").map(str::to_owned),
                        lang: element.attr("xml:lang").map(str::to_owned),
                        version: element.attr("version").map(str::to_owned),
                    };
                    trace!(?header, "stream header");
                    self.header = Some(header.clone());
                    return Ok(header);
                }
                Event::Eof => return Err(Error::StreamClosed),
                _ => {
                    return Err(Error::StreamXml(
                        "unexpected content before stream header".into(),
                    ))
                }
            }
        }
    }

    /// Yields the next fully-buffered top-level element.
    pub async fn next_element(&mut self) -> Result<Element, Error> {
        if self.header.is_none() {
            return Err(Error::InvalidState("stream header not read yet"));
        }
        let mut stack: Vec<Element> = Vec::new();
        loop {
            self.buf.clear();
            let event = self
                .reader
                .read_event_into_async(&mut self.buf)
                .await
                .map_err(map_xml_error)?;
            match event {
                Event::Start(start) => {
                    let element = begin_element(&mut self.scopes, &start)?;
                    stack.push(element);
                }
                Event::End(end) => {
                    match stack.pop() {
                        Some(element) => {
                            self.scopes.pop();
                            match stack.last_mut() {
                                Some(parent) => parent.append_child(element),
                                None => return finish_top_level(element),
                            }
                        }
                        None => {
                            // An end tag with no open element can only be
                            // the stream closing.
                            let raw = String::from_utf8_lossy(end.name().as_ref()).to_string();
                            let (namespace, local) = resolve(&self.scopes, &raw)?;
                            if namespace == ns::STREAM && local == "stream" {
                                return Err(Error::StreamClosed);
                            }
                            return Err(Error::StreamXml(format!(
                                "unexpected end tag </{raw}>"
                            )));
                        }
                    }
                }
                Event::Text(text) => {
                    if let Some(element) = stack.last_mut() {
                        let unescaped = text.unescape().map_err(map_xml_error)?;
                        element.append_text(unescaped.into_owned());
                    }
                    // Top-level text is whitespace keep-alive; drop it.
                }
                Event::CData(data) => {
                    if let Some(element) = stack.last_mut() {
                        let raw = data.into_inner();
                        element.append_text(String::from_utf8_lossy(&raw).into_owned());
                    }
                }
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
                Event::Eof => return Err(Error::StreamClosed),
                // expand_empty_elements turns Empty into Start+End
                Event::Empty(_) => unreachable!("empty elements are expanded"),
            }
        }
    }
}

/// Resolves a raw qualified name against the binding stack.
fn resolve(scopes: &[Scope], raw: &str) -> Result<(String, String), Error> {
    let (prefix, local) = match raw.split_once(':') {
        Some((prefix, local)) => (prefix, local),
        None => ("", raw),
    };
    for scope in scopes.iter().rev() {
        if let Some(uri) = scope.get(prefix) {
            return Ok((uri.clone(), local.to_owned()));
        }
    }
    Err(Error::StreamXml(format!("unbound namespace prefix '{prefix}'")))
}

/// Pushes the element's binding frame and returns the element shell with
/// its resolved namespace and non-xmlns attributes.
fn begin_element(scopes: &mut Vec<Scope>, start: &BytesStart) -> Result<Element, Error> {
    let mut bindings = Scope::new();
    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| Error::StreamXml(e.to_string()))?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).to_string();
        let value = attribute
            .unescape_value()
            .map_err(map_xml_error)?
            .into_owned();
        if key == "xmlns" {
            bindings.insert(String::new(), value);
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            bindings.insert(prefix.to_owned(), value);
        } else {
            attributes.push((key, value));
        }
    }
    scopes.push(bindings);
    let raw = String::from_utf8_lossy(start.name().as_ref()).to_string();
    let (namespace, local) = resolve(scopes, &raw)?;
    let mut element = Element::new(local, namespace);
    for (key, value) in attributes {
        element.set_attr(key, value);
    }
    Ok(element)
}

/// Maps a completed top-level element, turning `<stream:error>` into the
/// latched fatal error.
fn finish_top_level(element: Element) -> Result<Element, Error> {
    if element.is("error", ns::STREAM) {
        let condition = element
            .children()
            .find(|c| c.namespace() == ns::STREAMS && c.name() != "text")
            .map(|c| c.name().to_owned())
            .unwrap_or_else(|| "undefined-condition".to_owned());
        return Err(Error::StreamFatal(condition));
    }
    Ok(element)
}

fn map_xml_error(e: quick_xml::Error) -> Error {
    match e {
        quick_xml::Error::Io(io) => Error::Transport(std::io::Error::new(
            io.kind(),
            io.to_string(),
        )),
        other => Error::StreamXml(other.to_string()),
    }
}
