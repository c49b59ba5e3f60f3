//! Owned XML element tree used as the stanza payload representation.
//!
//! Elements carry a resolved namespace; serialization re-derives `xmlns`
//! attributes by eliding the parent default namespace, which is how the
//! stanzas travel on a `jabber:client` stream.

pub mod parser;

pub use parser::{StreamHeader, XmlStream};

use std::collections::BTreeMap;

/// A child of an element: nested element or character data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    namespace: String,
    attributes: BTreeMap<String, String>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Element {
            name: name.into(),
            namespace: namespace.into(),
            attributes: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether this element has the given name and namespace.
    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace == namespace
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        self.attributes.remove(name)
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Builder-style child append.
    pub fn with_child(mut self, child: Element) -> Self {
        self.append_child(child);
        self
    }

    /// Builder-style text append.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.append_text(text);
        self
    }

    pub fn append_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn append_text(&mut self, text: impl Into<String>) {
        self.children.push(Node::Text(text.into()));
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.children.iter()
    }

    /// Child elements in document order.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn children_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First child matching name and namespace.
    pub fn child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.children().find(|c| c.is(name, namespace))
    }

    /// First child in the given namespace, regardless of name.
    pub fn child_in_ns(&self, namespace: &str) -> Option<&Element> {
        self.children().find(|c| c.namespace == namespace)
    }

    /// Removes and returns the first child matching name and namespace.
    pub fn remove_child(&mut self, name: &str, namespace: &str) -> Option<Element> {
        let pos = self.children.iter().position(|n| match n {
            Node::Element(e) => e.is(name, namespace),
            Node::Text(_) => false,
        })?;
        match self.children.remove(pos) {
            Node::Element(e) => Some(e),
            Node::Text(_) => unreachable!(),
        }
    }

    /// Concatenated character data of this element (direct text nodes only).
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        out
    }

    /// Serializes the subtree. The root always carries its `xmlns`.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out, "");
        out
    }

    /// Serializes the subtree assuming `parent_ns` is the inherited
    /// default namespace: `xmlns` is emitted only where it changes.
    pub fn write_xml(&self, out: &mut String, parent_ns: &str) {
        out.push('<');
        out.push_str(&self.name);
        if self.namespace != parent_ns {
            out.push_str(" xmlns='");
            push_escaped_attr(out, &self.namespace);
            out.push('\'');
        }
        for (key, value) in &self.attributes {
            out.push(' ');
            out.push_str(key);
            out.push_str("='");
            push_escaped_attr(out, value);
            out.push('\'');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(e) => e.write_xml(out, &self.namespace),
                Node::Text(t) => push_escaped_text(out, t),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

fn push_escaped_text(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

fn push_escaped_attr(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ns;

    #[test]
    fn test_serialize_self_closing() {
        let el = Element::new("presence", ns::CLIENT);
        assert_eq!(el.to_xml(), "<presence xmlns='jabber:client'/>");
    }

    #[test]
    fn test_serialize_child_inherits_namespace() {
        let mut msg = Element::new("message", ns::CLIENT);
        msg.set_attr("to", "bob@xmpp.example");
        let mut body = Element::new("body", ns::CLIENT);
        body.append_text("hello");
        msg.append_child(body);
        assert_eq!(
            msg.to_xml(),
            "<message xmlns='jabber:client' to='bob@xmpp.example'><body>hello</body></message>"
        );
    }

    #[test]
    fn test_serialize_foreign_namespace_child() {
        let mut msg = Element::new("message", ns::CLIENT);
        msg.append_child(Element::new("active", ns::CHATSTATES));
        assert_eq!(
            msg.to_xml(),
            "<message xmlns='jabber:client'>\
             <active xmlns='http://jabber.org/protocol/chatstates'/></message>"
        );
    }

    #[test]
    fn test_serialize_with_parent_ns_elides_root_xmlns() {
        let el = Element::new("presence", ns::CLIENT);
        let mut out = String::new();
        el.write_xml(&mut out, ns::CLIENT);
        assert_eq!(out, "<presence/>");
    }

    #[test]
    fn test_text_escaping() {
        let mut body = Element::new("body", ns::CLIENT);
        body.append_text("a < b & c > d");
        assert!(body.to_xml().contains("a &lt; b &amp; c &gt; d"));
    }

    #[test]
    fn test_attr_escaping() {
        let el = Element::new("x", ns::CLIENT).with_attr("v", "it's \"quoted\" & <odd>");
        let xml = el.to_xml();
        assert!(xml.contains("&apos;"));
        assert!(xml.contains("&quot;"));
        assert!(xml.contains("&amp;"));
        assert!(xml.contains("&lt;odd&gt;"));
    }

    #[test]
    fn test_attrs_sorted_deterministically() {
        let el = Element::new("x", ns::CLIENT)
            .with_attr("zeta", "1")
            .with_attr("alpha", "2");
        let xml = el.to_xml();
        assert!(xml.find("alpha").unwrap() < xml.find("zeta").unwrap());
    }

    #[test]
    fn test_child_lookup_by_namespace() {
        let msg = Element::new("message", ns::CLIENT)
            .with_child(Element::new("composing", ns::CHATSTATES));
        assert!(msg.child_in_ns(ns::CHATSTATES).is_some());
        assert!(msg.child("composing", ns::CHATSTATES).is_some());
        assert!(msg.child("composing", ns::CLIENT).is_none());
    }

    #[test]
    fn test_remove_child() {
        let mut msg = Element::new("message", ns::CLIENT)
            .with_child(Element::new("body", ns::CLIENT))
            .with_child(Element::new("active", ns::CHATSTATES));
        let removed = msg.remove_child("active", ns::CHATSTATES).unwrap();
        assert_eq!(removed.name(), "active");
        assert!(msg.child("active", ns::CHATSTATES).is_none());
        assert!(msg.child("body", ns::CLIENT).is_some());
    }

    #[test]
    fn test_mixed_text_nodes() {
        let mut el = Element::new("body", ns::CLIENT);
        el.append_text("one ");
        el.append_text("two");
        assert_eq!(el.text(), "one two");
    }
}
