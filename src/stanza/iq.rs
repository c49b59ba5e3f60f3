//! IQ request/response envelopes.

use crate::error::{Error, StanzaError};
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{jid_attr, set_jid_attr};
use crate::xml::Element;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "get" => IqType::Get,
            "set" => IqType::Set,
            "result" => IqType::Result,
            "error" => IqType::Error,
            _ => return None,
        })
    }

    /// Whether this is a request (`get`/`set`) as opposed to a response.
    pub fn is_request(&self) -> bool {
        matches!(self, IqType::Get | IqType::Set)
    }
}

#[derive(Debug, Clone)]
pub struct Iq {
    element: Element,
    iq_type: IqType,
}

impl Iq {
    /// A `get` request carrying the given payload.
    pub fn get(payload: Element) -> Iq {
        Iq::request(IqType::Get, payload)
    }

    /// A `set` request carrying the given payload.
    pub fn set(payload: Element) -> Iq {
        Iq::request(IqType::Set, payload)
    }

    fn request(iq_type: IqType, payload: Element) -> Iq {
        let mut element = Element::new("iq", ns::CLIENT);
        element.set_attr("type", iq_type.as_str());
        element.append_child(payload);
        Iq { element, iq_type }
    }

    /// A `result` response to `request`, echoing its id and reversing the
    /// addressing.
    pub fn result(request: &Iq, payload: Option<Element>) -> Iq {
        let mut element = Element::new("iq", ns::CLIENT);
        element.set_attr("type", "result");
        if let Some(id) = request.id() {
            element.set_attr("id", id);
        }
        if let Some(from) = request.from() {
            element.set_attr("to", from.to_string());
        }
        if let Some(payload) = payload {
            element.append_child(payload);
        }
        Iq {
            element,
            iq_type: IqType::Result,
        }
    }

    /// An `error` response to `request`.
    pub fn error_reply(request: &Iq, error: StanzaError) -> Iq {
        let mut element = Element::new("iq", ns::CLIENT);
        element.set_attr("type", "error");
        if let Some(id) = request.id() {
            element.set_attr("id", id);
        }
        if let Some(from) = request.from() {
            element.set_attr("to", from.to_string());
        }
        element.append_child(error.to_element());
        Iq {
            element,
            iq_type: IqType::Error,
        }
    }

    pub fn from_element(element: Element) -> Result<Iq, Element> {
        let iq_type = match element.attr("type").and_then(IqType::from_str) {
            Some(t) => t,
            None => return Err(element),
        };
        Ok(Iq { element, iq_type })
    }

    pub fn iq_type(&self) -> IqType {
        self.iq_type
    }

    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    pub fn set_id(&mut self, id: &str) {
        self.element.set_attr("id", id);
    }

    pub fn to(&self) -> Option<Jid> {
        jid_attr(&self.element, "to")
    }

    pub fn set_to(&mut self, to: Option<&Jid>) {
        set_jid_attr(&mut self.element, "to", to);
    }

    /// Builder-style destination setter.
    pub fn with_to(mut self, to: &Jid) -> Iq {
        self.set_to(Some(to));
        self
    }

    pub fn from(&self) -> Option<Jid> {
        jid_attr(&self.element, "from")
    }

    /// The request/response payload: the first child that is not the
    /// `<error/>` element.
    pub fn payload(&self) -> Option<&Element> {
        self.element
            .children()
            .find(|c| !(c.name() == "error" && c.namespace() == ns::CLIENT))
    }

    /// Parses the `<error/>` child of an error response.
    pub fn error(&self) -> Option<StanzaError> {
        self.element
            .child("error", ns::CLIENT)
            .map(StanzaError::from_element)
    }

    /// The typed error for an `error` response, or the payload check for
    /// a `result`. Used by the engine to map responses onto callers.
    pub fn into_response_result(self) -> Result<Iq, Error> {
        if self.iq_type == IqType::Error {
            let error = self
                .error()
                .unwrap_or_else(|| StanzaError::new(crate::error::DefinedCondition::UndefinedCondition));
            return Err(Error::Xmpp(error));
        }
        Ok(self)
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn element_mut(&mut self) -> &mut Element {
        &mut self.element
    }

    pub fn into_element(self) -> Element {
        self.element
    }
}
