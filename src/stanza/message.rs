//! Message stanzas with per-language subjects and bodies.

use chrono::{DateTime, Utc};

use crate::jid::Jid;
use crate::ns;
use crate::stanza::{
    delay_timestamp, jid_attr, localized_child_text, localized_children, set_jid_attr,
    set_localized_child,
};
use crate::xml::Element;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    #[default]
    Normal,
    Chat,
    Groupchat,
    Headline,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Normal => "normal",
            MessageType::Chat => "chat",
            MessageType::Groupchat => "groupchat",
            MessageType::Headline => "headline",
            MessageType::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "normal" => MessageType::Normal,
            "chat" => MessageType::Chat,
            "groupchat" => MessageType::Groupchat,
            "headline" => MessageType::Headline,
            "error" => MessageType::Error,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    element: Element,
    /// Delayed-delivery stamp when present, local receive time otherwise.
    timestamp: DateTime<Utc>,
}

impl Message {
    /// A chat message with an untagged body.
    pub fn chat(to: &Jid, body: &str) -> Message {
        let mut element = Element::new("message", ns::CLIENT);
        element.set_attr("to", to.to_string());
        element.set_attr("type", "chat");
        let mut message = Message {
            element,
            timestamp: Utc::now(),
        };
        message.set_body(None, body);
        message
    }

    pub fn new(message_type: MessageType) -> Message {
        let mut element = Element::new("message", ns::CLIENT);
        if message_type != MessageType::Normal {
            element.set_attr("type", message_type.as_str());
        }
        Message {
            element,
            timestamp: Utc::now(),
        }
    }

    pub fn from_element(element: Element) -> Message {
        let timestamp = delay_timestamp(&element).unwrap_or_else(Utc::now);
        Message { element, timestamp }
    }

    pub fn message_type(&self) -> MessageType {
        self.element
            .attr("type")
            .and_then(MessageType::from_str)
            .unwrap_or_default()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
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

    pub fn from(&self) -> Option<Jid> {
        jid_attr(&self.element, "from")
    }

    pub fn thread(&self) -> Option<String> {
        self.element
            .child("thread", ns::CLIENT)
            .map(|t| t.text())
    }

    pub fn set_thread(&mut self, thread: &str) {
        self.element.remove_child("thread", ns::CLIENT);
        let mut t = Element::new("thread", ns::CLIENT);
        t.append_text(thread);
        self.element.append_child(t);
    }

    /// Body for the given language, falling back to the first body.
    pub fn body(&self, lang: Option<&str>) -> Option<String> {
        localized_child_text(&self.element, "body", lang)
    }

    /// All bodies as `(language, text)`; the untagged body has an empty
    /// language key.
    pub fn bodies(&self) -> Vec<(String, String)> {
        localized_children(&self.element, "body")
    }

    pub fn set_body(&mut self, lang: Option<&str>, text: &str) {
        set_localized_child(&mut self.element, "body", lang, text);
    }

    pub fn subject(&self, lang: Option<&str>) -> Option<String> {
        localized_child_text(&self.element, "subject", lang)
    }

    pub fn subjects(&self) -> Vec<(String, String)> {
        localized_children(&self.element, "subject")
    }

    pub fn set_subject(&mut self, lang: Option<&str>, text: &str) {
        set_localized_child(&mut self.element, "subject", lang, text);
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
