//! XEP-0030 service discovery.
//!
//! Registered as `"disco"`. Answers inbound `disco#info` queries with the
//! client identity and every namespace the registry advertises, and
//! issues outbound info/items queries.

use std::any::Any;
use std::sync::{Arc, OnceLock, RwLock as StdRwLock};

use async_trait::async_trait;

use crate::engine::EngineHandle;
use crate::error::Error;
use crate::ext::{Extension, ExtensionRegistry, FilterOutcome};
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Iq, IqType};
use crate::xml::Element;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub category: String,
    pub type_: String,
    pub name: Option<String>,
}

impl Identity {
    pub fn new(category: &str, type_: &str, name: Option<&str>) -> Identity {
        Identity {
            category: category.to_owned(),
            type_: type_.to_owned(),
            name: name.map(str::to_owned),
        }
    }

    /// The default client identity.
    pub fn client(name: &str) -> Identity {
        Identity::new("client", "pc", Some(name))
    }

    fn to_element(&self) -> Element {
        let mut identity = Element::new("identity", ns::DISCO_INFO);
        identity.set_attr("category", &self.category);
        identity.set_attr("type", &self.type_);
        if let Some(name) = &self.name {
            identity.set_attr("name", name);
        }
        identity
    }

    fn from_element(identity: &Element) -> Option<Identity> {
        Some(Identity {
            category: identity.attr("category")?.to_owned(),
            type_: identity.attr("type")?.to_owned(),
            name: identity.attr("name").map(str::to_owned),
        })
    }
}

/// A peer's advertised identity and feature set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoInfo {
    pub identities: Vec<Identity>,
    pub features: Vec<String>,
}

impl DiscoInfo {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    pub fn from_query(query: &Element) -> DiscoInfo {
        DiscoInfo {
            identities: query
                .children()
                .filter(|c| c.is("identity", ns::DISCO_INFO))
                .filter_map(Identity::from_element)
                .collect(),
            features: query
                .children()
                .filter(|c| c.is("feature", ns::DISCO_INFO))
                .filter_map(|f| f.attr("var").map(str::to_owned))
                .collect(),
        }
    }

    pub fn to_query(&self, node: Option<&str>) -> Element {
        let mut query = Element::new("query", ns::DISCO_INFO);
        if let Some(node) = node {
            query.set_attr("node", node);
        }
        for identity in &self.identities {
            query.append_child(identity.to_element());
        }
        for feature in &self.features {
            query.append_child(
                Element::new("feature", ns::DISCO_INFO).with_attr("var", feature),
            );
        }
        query
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoItem {
    pub jid: Jid,
    pub node: Option<String>,
    pub name: Option<String>,
}

pub struct ServiceDiscovery {
    handle: OnceLock<EngineHandle>,
    identity: Identity,
    features: StdRwLock<Vec<String>>,
}

impl ServiceDiscovery {
    pub fn new(identity: Identity) -> ServiceDiscovery {
        ServiceDiscovery {
            handle: OnceLock::new(),
            identity,
            features: StdRwLock::new(Vec::new()),
        }
    }

    fn engine(&self) -> Result<&EngineHandle, Error> {
        self.handle
            .get()
            .ok_or(Error::InvalidState("disco not initialized"))
    }

    /// Our own advertised identity and features, the disco#info response
    /// body and the entity-caps hash input.
    pub fn own_info(&self) -> DiscoInfo {
        DiscoInfo {
            identities: vec![self.identity.clone()],
            features: self.features.read().expect("features lock").clone(),
        }
    }

    /// Queries a peer's identities and features.
    pub async fn info(&self, jid: &Jid, node: Option<&str>) -> Result<DiscoInfo, Error> {
        let engine = self.engine()?;
        let mut query = Element::new("query", ns::DISCO_INFO);
        if let Some(node) = node {
            query.set_attr("node", node);
        }
        let response = engine.request(Iq::get(query).with_to(jid)).await?;
        let payload = response
            .payload()
            .filter(|p| p.is("query", ns::DISCO_INFO))
            .ok_or_else(|| Error::StreamXml("disco#info response without query".into()))?;
        Ok(DiscoInfo::from_query(payload))
    }

    /// Queries a peer's child items.
    pub async fn items(&self, jid: &Jid) -> Result<Vec<DiscoItem>, Error> {
        let engine = self.engine()?;
        let query = Element::new("query", ns::DISCO_ITEMS);
        let response = engine.request(Iq::get(query).with_to(jid)).await?;
        let Some(payload) = response
            .payload()
            .filter(|p| p.is("query", ns::DISCO_ITEMS))
        else {
            return Ok(Vec::new());
        };
        Ok(payload
            .children()
            .filter(|c| c.is("item", ns::DISCO_ITEMS))
            .filter_map(|item| {
                Some(DiscoItem {
                    jid: item.attr("jid")?.parse().ok()?,
                    node: item.attr("node").map(str::to_owned),
                    name: item.attr("name").map(str::to_owned),
                })
            })
            .collect())
    }

    /// Whether the peer advertises `feature`.
    pub async fn supports(&self, jid: &Jid, feature: &str) -> Result<bool, Error> {
        Ok(self.info(jid, None).await?.has_feature(feature))
    }
}

#[async_trait]
impl Extension for ServiceDiscovery {
    fn id(&self) -> &'static str {
        "disco"
    }

    fn namespaces(&self) -> &'static [&'static str] {
        &[ns::DISCO_INFO, ns::DISCO_ITEMS]
    }

    async fn initialize(
        &self,
        engine: &EngineHandle,
        registry: &ExtensionRegistry,
    ) -> Result<(), Error> {
        let _ = self.handle.set(engine.clone());
        *self.features.write().expect("features lock") = registry.all_features();
        Ok(())
    }

    async fn filter_iq(&self, engine: &EngineHandle, iq: &Iq) -> Result<FilterOutcome, Error> {
        if iq.iq_type() != IqType::Get {
            return Ok(FilterOutcome::Pass);
        }
        let Some(payload) = iq.payload() else {
            return Ok(FilterOutcome::Pass);
        };
        if payload.is("query", ns::DISCO_INFO) {
            let node = payload.attr("node");
            let response = self.own_info().to_query(node);
            engine.send_iq(Iq::result(iq, Some(response))).await?;
            return Ok(FilterOutcome::Handled);
        }
        if payload.is("query", ns::DISCO_ITEMS) {
            // A plain client has no child items.
            let response = Element::new("query", ns::DISCO_ITEMS);
            engine.send_iq(Iq::result(iq, Some(response))).await?;
            return Ok(FilterOutcome::Handled);
        }
        Ok(FilterOutcome::Pass)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_query_round_trip() {
        let info = DiscoInfo {
            identities: vec![Identity::client("Artalk")],
            features: vec![ns::CAPS.to_owned(), ns::DISCO_INFO.to_owned()],
        };
        let parsed = DiscoInfo::from_query(&info.to_query(None));
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_query_node_attr() {
        let info = DiscoInfo::default();
        let query = info.to_query(Some("http://example/client#v1"));
        assert_eq!(query.attr("node"), Some("http://example/client#v1"));
    }

    #[test]
    fn test_has_feature() {
        let info = DiscoInfo {
            identities: vec![],
            features: vec![ns::IBB.to_owned()],
        };
        assert!(info.has_feature(ns::IBB));
        assert!(!info.has_feature(ns::BYTESTREAMS));
    }

    #[test]
    fn test_identity_without_name() {
        let identity = Identity::new("proxy", "bytestreams", None);
        let parsed = Identity::from_element(&identity.to_element()).unwrap();
        assert_eq!(parsed, identity);
    }

    #[test]
    fn test_malformed_identity_skipped() {
        let query = Element::new("query", ns::DISCO_INFO)
            .with_child(Element::new("identity", ns::DISCO_INFO).with_attr("category", "x"))
            .with_child(
                Element::new("identity", ns::DISCO_INFO)
                    .with_attr("category", "client")
                    .with_attr("type", "pc"),
            );
        let info = DiscoInfo::from_query(&query);
        assert_eq!(info.identities.len(), 1);
    }
}
