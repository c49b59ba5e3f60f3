//! Roster items and their wire form (`jabber:iq:roster`).

use std::collections::BTreeSet;

use crate::jid::Jid;
use crate::ns;
use crate::xml::Element;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subscription {
    #[default]
    None,
    To,
    From,
    Both,
    /// Only ever seen in pushes; deletes the item.
    Remove,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
            Subscription::Remove => "remove",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "none" => Subscription::None,
            "to" => Subscription::To,
            "from" => Subscription::From,
            "both" => Subscription::Both,
            "remove" => Subscription::Remove,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterItem {
    pub jid: Jid,
    pub name: Option<String>,
    pub subscription: Subscription,
    /// An outbound subscription request is pending (`ask='subscribe'`).
    pub ask_pending_subscribe: bool,
    pub groups: BTreeSet<String>,
}

impl RosterItem {
    pub fn new(jid: Jid) -> RosterItem {
        RosterItem {
            jid,
            name: None,
            subscription: Subscription::None,
            ask_pending_subscribe: false,
            groups: BTreeSet::new(),
        }
    }

    pub fn from_element(item: &Element) -> Option<RosterItem> {
        let jid: Jid = item.attr("jid")?.parse().ok()?;
        Some(RosterItem {
            jid,
            name: item.attr("name").map(str::to_owned),
            subscription: item
                .attr("subscription")
                .and_then(Subscription::from_str)
                .unwrap_or_default(),
            ask_pending_subscribe: item.attr("ask") == Some("subscribe"),
            groups: item
                .children()
                .filter(|c| c.is("group", ns::ROSTER))
                .map(|g| g.text())
                .collect(),
        })
    }

    pub fn to_element(&self) -> Element {
        let mut item = Element::new("item", ns::ROSTER);
        item.set_attr("jid", self.jid.to_string());
        if let Some(name) = &self.name {
            item.set_attr("name", name);
        }
        if self.subscription != Subscription::None {
            item.set_attr("subscription", self.subscription.as_str());
        }
        for group in &self.groups {
            item.append_child(Element::new("group", ns::ROSTER).with_text(group));
        }
        item
    }
}

/// Parses the items of a roster query element.
pub fn items_of(query: &Element) -> Vec<RosterItem> {
    query
        .children()
        .filter(|c| c.is("item", ns::ROSTER))
        .filter_map(RosterItem::from_element)
        .collect()
}
