//! Privacy lists (XEP-0016) and contact blocking.
//!
//! Blocking prefers the XEP-0191 blocking command when the server
//! advertises it, and otherwise maintains a privacy list named
//! `blocklist` made both default and active.

use crate::error::{DefinedCondition, Error};
use crate::im::roster::Subscription;
use crate::im::ImSession;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::Iq;
use crate::xml::Element;

/// Which stanza kinds a rule applies to. All false means the rule
/// covers everything, per XEP-0016.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Granularity {
    pub message: bool,
    pub iq: bool,
    pub presence_in: bool,
    pub presence_out: bool,
}

impl Granularity {
    fn is_everything(&self) -> bool {
        !(self.message || self.iq || self.presence_in || self.presence_out)
    }

    fn covers(&self, class: StanzaClass) -> bool {
        self.is_everything()
            || match class {
                StanzaClass::Message => self.message,
                StanzaClass::Iq => self.iq,
                StanzaClass::PresenceIn => self.presence_in,
                StanzaClass::PresenceOut => self.presence_out,
            }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaClass {
    Message,
    Iq,
    PresenceIn,
    PresenceOut,
}

/// What a rule matches against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleScope {
    Jid(Jid),
    Group(String),
    Subscription(Subscription),
    /// Matches every stanza.
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivacyRule {
    pub allow: bool,
    /// Unique within a list; rules evaluate in ascending order.
    pub order: u32,
    pub scope: RuleScope,
    pub granularity: Granularity,
}

impl PrivacyRule {
    /// A full deny rule for one bare JID.
    pub fn deny_jid(jid: &Jid, order: u32) -> PrivacyRule {
        PrivacyRule {
            allow: false,
            order,
            scope: RuleScope::Jid(jid.bare()),
            granularity: Granularity::default(),
        }
    }

    pub fn from_element(item: &Element) -> Option<PrivacyRule> {
        let allow = match item.attr("action")? {
            "allow" => true,
            "deny" => false,
            _ => return None,
        };
        let order: u32 = item.attr("order")?.parse().ok()?;
        let value = item.attr("value");
        let scope = match item.attr("type") {
            None => RuleScope::Any,
            Some("jid") => RuleScope::Jid(value?.parse().ok()?),
            Some("group") => RuleScope::Group(value?.to_owned()),
            Some("subscription") => {
                RuleScope::Subscription(Subscription::from_str(value?)?)
            }
            Some(_) => return None,
        };
        Some(PrivacyRule {
            allow,
            order,
            scope,
            granularity: Granularity {
                message: item.child("message", ns::PRIVACY).is_some(),
                iq: item.child("iq", ns::PRIVACY).is_some(),
                presence_in: item.child("presence-in", ns::PRIVACY).is_some(),
                presence_out: item.child("presence-out", ns::PRIVACY).is_some(),
            },
        })
    }

    pub fn to_element(&self) -> Element {
        let mut item = Element::new("item", ns::PRIVACY);
        item.set_attr("action", if self.allow { "allow" } else { "deny" });
        item.set_attr("order", self.order.to_string());
        match &self.scope {
            RuleScope::Any => {}
            RuleScope::Jid(jid) => {
                item.set_attr("type", "jid");
                item.set_attr("value", jid.to_string());
            }
            RuleScope::Group(group) => {
                item.set_attr("type", "group");
                item.set_attr("value", group);
            }
            RuleScope::Subscription(subscription) => {
                item.set_attr("type", "subscription");
                item.set_attr("value", subscription.as_str());
            }
        }
        if self.granularity.message {
            item.append_child(Element::new("message", ns::PRIVACY));
        }
        if self.granularity.iq {
            item.append_child(Element::new("iq", ns::PRIVACY));
        }
        if self.granularity.presence_in {
            item.append_child(Element::new("presence-in", ns::PRIVACY));
        }
        if self.granularity.presence_out {
            item.append_child(Element::new("presence-out", ns::PRIVACY));
        }
        item
    }
}

/// Evaluation context for one peer.
pub struct PeerContext<'a> {
    pub jid: &'a Jid,
    pub subscription: Subscription,
    pub groups: &'a std::collections::BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivacyList {
    pub name: String,
    pub rules: Vec<PrivacyRule>,
}

impl PrivacyList {
    pub fn new(name: &str) -> PrivacyList {
        PrivacyList {
            name: name.to_owned(),
            rules: Vec::new(),
        }
    }

    /// A stored list must carry at least one rule and no duplicate
    /// orders.
    pub fn validate(&self) -> Result<(), Error> {
        if self.rules.is_empty() {
            return Err(Error::InvalidState("a privacy list needs at least one rule"));
        }
        let mut orders: Vec<u32> = self.rules.iter().map(|r| r.order).collect();
        orders.sort_unstable();
        orders.dedup();
        if orders.len() != self.rules.len() {
            return Err(Error::InvalidState("privacy rule orders must be unique"));
        }
        Ok(())
    }

    /// Rules sorted by ascending `order`, the evaluation sequence.
    pub fn rules_in_order(&self) -> Vec<&PrivacyRule> {
        let mut rules: Vec<&PrivacyRule> = self.rules.iter().collect();
        rules.sort_by_key(|r| r.order);
        rules
    }

    /// First-match evaluation; stanzas with no matching rule pass.
    pub fn evaluate(&self, peer: &PeerContext, class: StanzaClass) -> bool {
        for rule in self.rules_in_order() {
            if !rule.granularity.covers(class) {
                continue;
            }
            let matched = match &rule.scope {
                RuleScope::Any => true,
                // A bare rule JID covers every resource of the peer; a
                // full rule JID names exactly one.
                RuleScope::Jid(jid) if jid.is_bare() => jid.bare_eq(peer.jid),
                RuleScope::Jid(jid) => jid == peer.jid,
                RuleScope::Group(group) => peer.groups.contains(group),
                RuleScope::Subscription(subscription) => *subscription == peer.subscription,
            };
            if matched {
                return rule.allow;
            }
        }
        true
    }

    pub fn from_element(list: &Element) -> Option<PrivacyList> {
        if !list.is("list", ns::PRIVACY) {
            return None;
        }
        Some(PrivacyList {
            name: list.attr("name")?.to_owned(),
            rules: list
                .children()
                .filter(|c| c.is("item", ns::PRIVACY))
                .filter_map(PrivacyRule::from_element)
                .collect(),
        })
    }

    pub fn to_element(&self) -> Element {
        let mut list = Element::new("list", ns::PRIVACY);
        list.set_attr("name", &self.name);
        for rule in &self.rules {
            list.append_child(rule.to_element());
        }
        list
    }
}

/// Names returned by a privacy-lists query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivacyListNames {
    pub names: Vec<String>,
    pub active: Option<String>,
    pub default: Option<String>,
}

impl ImSession {
    /// Fetches the list names plus the active and default markers.
    pub async fn get_privacy_lists(&self) -> Result<PrivacyListNames, Error> {
        let engine = self.engine()?;
        let response = engine
            .request(Iq::get(Element::new("query", ns::PRIVACY)))
            .await?;
        let mut names = PrivacyListNames::default();
        let Some(query) = response.payload().filter(|p| p.is("query", ns::PRIVACY)) else {
            return Ok(names);
        };
        for child in query.children() {
            match child.name() {
                "list" => {
                    if let Some(name) = child.attr("name") {
                        names.names.push(name.to_owned());
                    }
                }
                "active" => names.active = child.attr("name").map(str::to_owned),
                "default" => names.default = child.attr("name").map(str::to_owned),
                _ => {}
            }
        }
        Ok(names)
    }

    /// Fetches one list with its rules.
    pub async fn get_privacy_list(&self, name: &str) -> Result<PrivacyList, Error> {
        let engine = self.engine()?;
        let query = Element::new("query", ns::PRIVACY)
            .with_child(Element::new("list", ns::PRIVACY).with_attr("name", name));
        let response = engine.request(Iq::get(query)).await?;
        response
            .payload()
            .and_then(|p| p.child("list", ns::PRIVACY))
            .and_then(PrivacyList::from_element)
            .ok_or(Error::Xmpp(crate::error::StanzaError::new(
                DefinedCondition::ItemNotFound,
            )))
    }

    /// Creates or replaces a list. The list must validate.
    pub async fn edit_privacy_list(&self, list: &PrivacyList) -> Result<(), Error> {
        list.validate()?;
        let engine = self.engine()?;
        let query = Element::new("query", ns::PRIVACY).with_child(list.to_element());
        engine.request(Iq::set(query)).await?;
        Ok(())
    }

    /// Removes a list by submitting it empty.
    pub async fn remove_privacy_list(&self, name: &str) -> Result<(), Error> {
        let engine = self.engine()?;
        let query = Element::new("query", ns::PRIVACY)
            .with_child(Element::new("list", ns::PRIVACY).with_attr("name", name));
        engine.request(Iq::set(query)).await?;
        Ok(())
    }

    /// Selects the session-scoped active list; `None` declines any.
    pub async fn set_active_privacy_list(&self, name: Option<&str>) -> Result<(), Error> {
        self.set_privacy_selector("active", name).await
    }

    /// Selects the account-scoped default list; `None` declines any.
    pub async fn set_default_privacy_list(&self, name: Option<&str>) -> Result<(), Error> {
        self.set_privacy_selector("default", name).await
    }

    async fn set_privacy_selector(
        &self,
        selector: &str,
        name: Option<&str>,
    ) -> Result<(), Error> {
        let engine = self.engine()?;
        let mut marker = Element::new(selector, ns::PRIVACY);
        if let Some(name) = name {
            marker.set_attr("name", name);
        }
        let query = Element::new("query", ns::PRIVACY).with_child(marker);
        engine.request(Iq::set(query)).await?;
        Ok(())
    }

    async fn server_supports_blocking(&self) -> Result<bool, Error> {
        let Some(disco) = self.disco.get() else {
            return Ok(false);
        };
        let engine = self.engine()?;
        let Some(own) = engine.jid()? else {
            return Ok(false);
        };
        let server = Jid::new(None, own.domain(), None)?;
        disco.supports(&server, ns::BLOCKING).await
    }

    /// Blocks all traffic from a contact, via the blocking command when
    /// the server has it, else the `blocklist` privacy list.
    pub async fn block_contact(&self, jid: &Jid) -> Result<(), Error> {
        let engine = self.engine()?;
        if self.server_supports_blocking().await.unwrap_or(false) {
            let block = Element::new("block", ns::BLOCKING).with_child(
                Element::new("item", ns::BLOCKING).with_attr("jid", jid.bare().to_string()),
            );
            engine.request(Iq::set(block)).await?;
            return Ok(());
        }

        let mut list = match self.get_privacy_list("blocklist").await {
            Ok(list) => list,
            Err(Error::Xmpp(e)) if e.condition == DefinedCondition::ItemNotFound => {
                PrivacyList::new("blocklist")
            }
            Err(e) => return Err(e),
        };
        let bare = jid.bare();
        let already = list
            .rules
            .iter()
            .any(|r| matches!(&r.scope, RuleScope::Jid(j) if j.bare_eq(&bare)));
        if !already {
            let order = list.rules.iter().map(|r| r.order).max().map_or(1, |o| o + 1);
            list.rules.push(PrivacyRule::deny_jid(&bare, order));
        }
        self.edit_privacy_list(&list).await?;
        self.set_default_privacy_list(Some("blocklist")).await?;
        self.set_active_privacy_list(Some("blocklist")).await
    }

    /// Reverses [`ImSession::block_contact`].
    pub async fn unblock_contact(&self, jid: &Jid) -> Result<(), Error> {
        let engine = self.engine()?;
        if self.server_supports_blocking().await.unwrap_or(false) {
            let unblock = Element::new("unblock", ns::BLOCKING).with_child(
                Element::new("item", ns::BLOCKING).with_attr("jid", jid.bare().to_string()),
            );
            engine.request(Iq::set(unblock)).await?;
            return Ok(());
        }

        let mut list = match self.get_privacy_list("blocklist").await {
            Ok(list) => list,
            Err(Error::Xmpp(e)) if e.condition == DefinedCondition::ItemNotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let bare = jid.bare();
        list.rules
            .retain(|r| !matches!(&r.scope, RuleScope::Jid(j) if j.bare_eq(&bare)));
        if list.rules.is_empty() {
            self.set_default_privacy_list(None).await?;
            self.set_active_privacy_list(None).await?;
            self.remove_privacy_list("blocklist").await
        } else {
            self.edit_privacy_list(&list).await
        }
    }
}
