//! Jabber identifiers (`node@domain/resource`).
//!
//! Immutable once constructed. Equality and hashing cover the full JID;
//! use [`Jid::bare`] where bare-JID semantics are required (roster keys,
//! push trust checks).

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(
        node: Option<&str>,
        domain: &str,
        resource: Option<&str>,
    ) -> Result<Self, Error> {
        if domain.is_empty() {
            return Err(Error::InvalidState("JID domain must not be empty"));
        }
        if node.is_some_and(str::is_empty) || resource.is_some_and(str::is_empty) {
            return Err(Error::InvalidState("JID parts must not be empty"));
        }
        Ok(Jid {
            node: node.map(str::to_owned),
            domain: domain.to_owned(),
            resource: resource.map(str::to_owned),
        })
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The JID without its resource part.
    pub fn bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// A copy of this JID carrying the given resource.
    pub fn with_resource(&self, resource: &str) -> Result<Jid, Error> {
        Jid::new(self.node.as_deref(), &self.domain, Some(resource))
    }

    /// Bare-JID equality, the trust comparison for roster pushes.
    pub fn bare_eq(&self, other: &Jid) -> bool {
        self.node == other.node && self.domain == other.domain
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (rest, resource) = match s.split_once('/') {
            Some((rest, resource)) => (rest, Some(resource)),
            None => (s, None),
        };
        let (node, domain) = match rest.split_once('@') {
            Some((node, domain)) => (Some(node), domain),
            None => (None, rest),
        };
        Jid::new(node, domain, resource)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{node}@")?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}

impl Serialize for Jid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Jid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct JidVisitor;

        impl Visitor<'_> for JidVisitor {
            type Value = Jid;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JID string like user@domain/resource")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Jid, E> {
                v.parse().map_err(|e| E::custom(format!("{e}")))
            }
        }

        deserializer.deserialize_str(JidVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_jid() {
        let jid: Jid = "alice@xmpp.example/home".parse().unwrap();
        assert_eq!(jid.node(), Some("alice"));
        assert_eq!(jid.domain(), "xmpp.example");
        assert_eq!(jid.resource(), Some("home"));
    }

    #[test]
    fn test_parse_bare_jid() {
        let jid: Jid = "alice@xmpp.example".parse().unwrap();
        assert!(jid.is_bare());
        assert_eq!(jid.node(), Some("alice"));
    }

    #[test]
    fn test_parse_domain_only() {
        let jid: Jid = "xmpp.example".parse().unwrap();
        assert_eq!(jid.node(), None);
        assert_eq!(jid.domain(), "xmpp.example");
        assert!(jid.is_bare());
    }

    #[test]
    fn test_resource_may_contain_slash() {
        let jid: Jid = "alice@xmpp.example/home/desk".parse().unwrap();
        assert_eq!(jid.resource(), Some("home/desk"));
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["alice@xmpp.example/home", "alice@xmpp.example", "xmpp.example"] {
            let jid: Jid = s.parse().unwrap();
            assert_eq!(jid.to_string(), s);
        }
    }

    #[test]
    fn test_bare_strips_resource() {
        let jid: Jid = "alice@xmpp.example/home".parse().unwrap();
        assert_eq!(jid.bare().to_string(), "alice@xmpp.example");
    }

    #[test]
    fn test_bare_eq_ignores_resource() {
        let a: Jid = "alice@xmpp.example/home".parse().unwrap();
        let b: Jid = "alice@xmpp.example/work".parse().unwrap();
        assert!(a.bare_eq(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_domain_rejected() {
        assert!("alice@".parse::<Jid>().is_err());
        assert!("".parse::<Jid>().is_err());
    }

    #[test]
    fn test_empty_node_rejected() {
        assert!("@xmpp.example".parse::<Jid>().is_err());
    }
}
