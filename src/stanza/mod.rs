//! Typed stanza containers over the owned XML element tree.
//!
//! Each stanza type wraps an [`Element`] and exposes accessors for the
//! RFC 3920 attributes; payload children stay opaque to the core.

pub mod iq;
pub mod message;
pub mod presence;

pub use iq::{Iq, IqType};
pub use message::{Message, MessageType};
pub use presence::{Presence, PresenceType, Show};

use crate::jid::Jid;
use crate::ns;
use crate::xml::Element;

/// Any of the three stanza kinds.
#[derive(Debug, Clone)]
pub enum Stanza {
    Iq(Iq),
    Message(Message),
    Presence(Presence),
}

impl Stanza {
    /// Classifies a top-level element from the stream. Elements that are
    /// not stanzas (nonzas like `<stream:features>`) come back unchanged
    /// in the `Err` variant.
    pub fn from_element(element: Element) -> Result<Stanza, Element> {
        if element.namespace() != ns::CLIENT {
            return Err(element);
        }
        match element.name() {
            "iq" => Iq::from_element(element).map(Stanza::Iq),
            "message" => Ok(Stanza::Message(Message::from_element(element))),
            "presence" => Ok(Stanza::Presence(Presence::from_element(element))),
            _ => Err(element),
        }
    }

    pub fn element(&self) -> &Element {
        match self {
            Stanza::Iq(iq) => iq.element(),
            Stanza::Message(message) => message.element(),
            Stanza::Presence(presence) => presence.element(),
        }
    }
}

pub(crate) fn jid_attr(element: &Element, name: &str) -> Option<Jid> {
    element.attr(name).and_then(|v| v.parse().ok())
}

pub(crate) fn set_jid_attr(element: &mut Element, name: &str, jid: Option<&Jid>) {
    match jid {
        Some(jid) => element.set_attr(name, jid.to_string()),
        None => {
            element.remove_attr(name);
        }
    }
}

/// Text of the first matching child carrying the given `xml:lang`, where
/// `None` matches a child without a language tag. Falls back to the first
/// matching child when the requested language is absent.
pub(crate) fn localized_child_text(
    element: &Element,
    name: &str,
    lang: Option<&str>,
) -> Option<String> {
    let mut fallback = None;
    for child in element.children() {
        if !child.is(name, ns::CLIENT) {
            continue;
        }
        if child.attr("xml:lang") == lang {
            return Some(child.text());
        }
        if fallback.is_none() {
            fallback = Some(child.text());
        }
    }
    fallback
}

/// All `(language, text)` pairs for the named child; the untagged variant
/// appears with an empty language key.
pub(crate) fn localized_children(
    element: &Element,
    name: &str,
) -> Vec<(String, String)> {
    element
        .children()
        .filter(|c| c.is(name, ns::CLIENT))
        .map(|c| {
            (
                c.attr("xml:lang").unwrap_or_default().to_owned(),
                c.text(),
            )
        })
        .collect()
}

pub(crate) fn set_localized_child(
    element: &mut Element,
    name: &str,
    lang: Option<&str>,
    text: &str,
) {
    let mut child = Element::new(name, ns::CLIENT);
    if let Some(lang) = lang {
        child.set_attr("xml:lang", lang);
    }
    child.append_text(text);
    element.append_child(child);
}

/// Parses a `urn:xmpp:delay` stamp if the stanza carries one.
pub(crate) fn delay_timestamp(element: &Element) -> Option<chrono::DateTime<chrono::Utc>> {
    let delay = element.child("delay", ns::DELAY)?;
    let stamp = delay.attr("stamp")?;
    chrono::DateTime::parse_from_rfc3339(stamp)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_stanzas() {
        let iq = Element::new("iq", ns::CLIENT).with_attr("type", "get").with_attr("id", "1");
        assert!(matches!(Stanza::from_element(iq), Ok(Stanza::Iq(_))));

        let message = Element::new("message", ns::CLIENT);
        assert!(matches!(Stanza::from_element(message), Ok(Stanza::Message(_))));

        let presence = Element::new("presence", ns::CLIENT);
        assert!(matches!(Stanza::from_element(presence), Ok(Stanza::Presence(_))));
    }

    #[test]
    fn test_nonza_rejected() {
        let features = Element::new("features", ns::STREAM);
        assert!(Stanza::from_element(features).is_err());
    }

    #[test]
    fn test_localized_child_lookup() {
        let mut message = Element::new("message", ns::CLIENT);
        set_localized_child(&mut message, "body", None, "hello");
        set_localized_child(&mut message, "body", Some("fr"), "bonjour");
        assert_eq!(
            localized_child_text(&message, "body", None).as_deref(),
            Some("hello")
        );
        assert_eq!(
            localized_child_text(&message, "body", Some("fr")).as_deref(),
            Some("bonjour")
        );
        // Unknown language falls back to the first body.
        assert_eq!(
            localized_child_text(&message, "body", Some("de")).as_deref(),
            Some("hello")
        );
    }

    #[test]
    fn test_delay_timestamp_parsed() {
        let mut message = Element::new("message", ns::CLIENT);
        message.append_child(
            Element::new("delay", ns::DELAY).with_attr("stamp", "2024-03-01T12:00:00Z"),
        );
        let ts = delay_timestamp(&message).unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-01T12:00:00+00:00");
    }

    #[test]
    fn test_delay_timestamp_absent() {
        let message = Element::new("message", ns::CLIENT);
        assert!(delay_timestamp(&message).is_none());
    }
}
