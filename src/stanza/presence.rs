//! Presence stanzas: availability, show, priority, status texts.

use crate::jid::Jid;
use crate::ns;
use crate::stanza::{
    jid_attr, localized_child_text, localized_children, set_jid_attr, set_localized_child,
};
use crate::xml::Element;

/// The `type` attribute; absence means `Available`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceType {
    #[default]
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Error,
}

impl PresenceType {
    /// Attribute value; `Available` has none.
    pub fn as_attr(&self) -> Option<&'static str> {
        Some(match self {
            PresenceType::Available => return None,
            PresenceType::Unavailable => "unavailable",
            PresenceType::Subscribe => "subscribe",
            PresenceType::Subscribed => "subscribed",
            PresenceType::Unsubscribe => "unsubscribe",
            PresenceType::Unsubscribed => "unsubscribed",
            PresenceType::Probe => "probe",
            PresenceType::Error => "error",
        })
    }

    pub fn from_attr(value: Option<&str>) -> Self {
        match value {
            None => PresenceType::Available,
            Some("unavailable") => PresenceType::Unavailable,
            Some("subscribe") => PresenceType::Subscribe,
            Some("subscribed") => PresenceType::Subscribed,
            Some("unsubscribe") => PresenceType::Unsubscribe,
            Some("unsubscribed") => PresenceType::Unsubscribed,
            Some("probe") => PresenceType::Probe,
            Some("error") => PresenceType::Error,
            Some(_) => PresenceType::Available,
        }
    }
}

/// The `<show/>` availability sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Show {
    Chat,
    Away,
    Dnd,
    Xa,
}

impl Show {
    pub fn as_str(&self) -> &'static str {
        match self {
            Show::Chat => "chat",
            Show::Away => "away",
            Show::Dnd => "dnd",
            Show::Xa => "xa",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "chat" => Show::Chat,
            "away" => Show::Away,
            "dnd" => Show::Dnd,
            "xa" => Show::Xa,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Presence {
    element: Element,
}

impl Presence {
    pub fn new(presence_type: PresenceType) -> Presence {
        let mut element = Element::new("presence", ns::CLIENT);
        if let Some(attr) = presence_type.as_attr() {
            element.set_attr("type", attr);
        }
        Presence { element }
    }

    /// A directed presence of the given type, the subscription workflow
    /// building block.
    pub fn directed(presence_type: PresenceType, to: &Jid) -> Presence {
        let mut presence = Presence::new(presence_type);
        presence.set_to(Some(to));
        presence
    }

    pub fn from_element(element: Element) -> Presence {
        Presence { element }
    }

    pub fn presence_type(&self) -> PresenceType {
        PresenceType::from_attr(self.element.attr("type"))
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

    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    pub fn show(&self) -> Option<Show> {
        self.element
            .child("show", ns::CLIENT)
            .and_then(|s| Show::from_str(s.text().trim()))
    }

    pub fn set_show(&mut self, show: Show) {
        self.element.remove_child("show", ns::CLIENT);
        let mut child = Element::new("show", ns::CLIENT);
        child.append_text(show.as_str());
        self.element.append_child(child);
    }

    /// `-128..=127`; out-of-range or malformed values read as 0.
    pub fn priority(&self) -> i8 {
        self.element
            .child("priority", ns::CLIENT)
            .and_then(|p| p.text().trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn set_priority(&mut self, priority: i8) {
        self.element.remove_child("priority", ns::CLIENT);
        let mut child = Element::new("priority", ns::CLIENT);
        child.append_text(priority.to_string());
        self.element.append_child(child);
    }

    pub fn status(&self, lang: Option<&str>) -> Option<String> {
        localized_child_text(&self.element, "status", lang)
    }

    pub fn statuses(&self) -> Vec<(String, String)> {
        localized_children(&self.element, "status")
    }

    pub fn set_status(&mut self, lang: Option<&str>, text: &str) {
        set_localized_child(&mut self.element, "status", lang, text);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_has_no_type_attr() {
        let presence = Presence::new(PresenceType::Available);
        assert_eq!(presence.element().to_xml(), "<presence xmlns='jabber:client'/>");
        assert_eq!(presence.presence_type(), PresenceType::Available);
    }

    #[test]
    fn test_directed_subscribe() {
        let to: Jid = "bob@xmpp.example".parse().unwrap();
        let presence = Presence::directed(PresenceType::Subscribe, &to);
        let xml = presence.element().to_xml();
        assert!(xml.contains("to='bob@xmpp.example'"));
        assert!(xml.contains("type='subscribe'"));
    }

    #[test]
    fn test_type_round_trip() {
        for t in [
            PresenceType::Available,
            PresenceType::Unavailable,
            PresenceType::Subscribe,
            PresenceType::Subscribed,
            PresenceType::Unsubscribe,
            PresenceType::Unsubscribed,
            PresenceType::Probe,
            PresenceType::Error,
        ] {
            assert_eq!(PresenceType::from_attr(t.as_attr()), t);
        }
    }

    #[test]
    fn test_show_and_priority() {
        let mut presence = Presence::new(PresenceType::Available);
        presence.set_show(Show::Dnd);
        presence.set_priority(-5);
        assert_eq!(presence.show(), Some(Show::Dnd));
        assert_eq!(presence.priority(), -5);
    }

    #[test]
    fn test_priority_bounds() {
        let mut presence = Presence::new(PresenceType::Available);
        presence.set_priority(i8::MIN);
        assert_eq!(presence.priority(), -128);
        presence.set_priority(i8::MAX);
        assert_eq!(presence.priority(), 127);
    }

    #[test]
    fn test_missing_priority_is_zero() {
        let presence = Presence::new(PresenceType::Available);
        assert_eq!(presence.priority(), 0);
    }

    #[test]
    fn test_status_per_language() {
        let mut presence = Presence::new(PresenceType::Available);
        presence.set_status(None, "out for lunch");
        presence.set_status(Some("fr"), "parti manger");
        assert_eq!(presence.status(None).as_deref(), Some("out for lunch"));
        assert_eq!(presence.status(Some("fr")).as_deref(), Some("parti manger"));
        assert_eq!(presence.statuses().len(), 2);
    }

    #[test]
    fn test_unknown_type_reads_available() {
        let element = Element::new("presence", ns::CLIENT).with_attr("type", "nonsense");
        assert_eq!(
            Presence::from_element(element).presence_type(),
            PresenceType::Available
        );
    }
}
