//! XEP-0115 entity capabilities.
//!
//! Outbound presence carries a `<c/>` element with our verification
//! hash; inbound `<c/>` elements map peers to `ver` strings so each
//! distinct feature set is discovered only once. Cached disco results
//! are re-verified by recomputing their hash before they are trusted.

use std::any::Any;
use std::sync::{Arc, OnceLock, RwLock as StdRwLock};

use async_trait::async_trait;
use base64::Engine as _;
use dashmap::DashMap;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::disco::{DiscoInfo, Identity, ServiceDiscovery};
use crate::engine::EngineHandle;
use crate::error::Error;
use crate::ext::{Extension, ExtensionRegistry, FilterOutcome};
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Presence, PresenceType};
use crate::xml::Element;

/// Default node URI advertised in our `<c/>` element.
pub const CLIENT_NODE: &str = "https://fluux.io/fluux-xmpp";

/// XEP-0115 §5 verification string: sorted identity lines then sorted
/// features, each terminated by `<`, SHA-1, base64. A pure function of
/// its inputs.
pub fn verification_hash(identities: &[Identity], features: &[String]) -> String {
    let mut identity_lines: Vec<String> = identities
        .iter()
        .map(|i| {
            format!(
                "{}/{}//{}",
                i.category,
                i.type_,
                i.name.as_deref().unwrap_or_default()
            )
        })
        .collect();
    identity_lines.sort();

    let mut sorted_features = features.to_vec();
    sorted_features.sort();

    let mut input = String::new();
    for line in identity_lines {
        input.push_str(&line);
        input.push('<');
    }
    for feature in sorted_features {
        input.push_str(&feature);
        input.push('<');
    }
    base64::engine::general_purpose::STANDARD.encode(Sha1::digest(input.as_bytes()))
}

pub struct EntityCaps {
    handle: OnceLock<EngineHandle>,
    disco: OnceLock<Arc<ServiceDiscovery>>,
    node: String,
    /// Latest announced `ver` per full JID.
    by_jid: DashMap<Jid, String>,
    /// Verified feature sets per `ver`.
    by_ver: DashMap<String, Arc<DiscoInfo>>,
    own_ver: StdRwLock<Option<String>>,
}

impl EntityCaps {
    pub fn new() -> EntityCaps {
        EntityCaps::with_node(CLIENT_NODE)
    }

    pub fn with_node(node: &str) -> EntityCaps {
        EntityCaps {
            handle: OnceLock::new(),
            disco: OnceLock::new(),
            node: node.to_owned(),
            by_jid: DashMap::new(),
            by_ver: DashMap::new(),
            own_ver: StdRwLock::new(None),
        }
    }

    fn disco(&self) -> Result<&Arc<ServiceDiscovery>, Error> {
        self.disco
            .get()
            .ok_or(Error::InvalidState("caps requires the disco extension"))
    }

    /// The `ver` a peer most recently announced.
    pub fn ver_of(&self, jid: &Jid) -> Option<String> {
        self.by_jid.get(jid).map(|v| v.clone())
    }

    /// The peer's feature set: served from the by-`ver` cache when the
    /// peer announced caps, otherwise (or on hash mismatch) a direct
    /// discovery query.
    pub async fn extensions_of(&self, jid: &Jid) -> Result<Arc<DiscoInfo>, Error> {
        let Some(ver) = self.ver_of(jid) else {
            debug!("{jid} never announced caps, querying directly");
            return Ok(Arc::new(self.disco()?.info(jid, None).await?));
        };
        if let Some(cached) = self.by_ver.get(&ver) {
            return Ok(cached.clone());
        }
        let node = format!("{}#{ver}", self.node);
        let info = self.disco()?.info(jid, Some(&node)).await?;
        // Guard the shared cache against spoofed feature sets: only a
        // result whose recomputed hash matches the announced ver is
        // cached under it.
        let computed = verification_hash(&info.identities, &info.features);
        if computed == ver {
            let info = Arc::new(info);
            self.by_ver.insert(ver, info.clone());
            Ok(info)
        } else {
            warn!("caps hash mismatch for {jid}: announced {ver}, computed {computed}");
            Ok(Arc::new(self.disco()?.info(jid, None).await?))
        }
    }
}

impl Default for EntityCaps {
    fn default() -> Self {
        EntityCaps::new()
    }
}

#[async_trait]
impl Extension for EntityCaps {
    fn id(&self) -> &'static str {
        "caps"
    }

    fn namespaces(&self) -> &'static [&'static str] {
        &[ns::CAPS]
    }

    async fn initialize(
        &self,
        engine: &EngineHandle,
        registry: &ExtensionRegistry,
    ) -> Result<(), Error> {
        let _ = self.handle.set(engine.clone());
        let disco = registry.get_as::<ServiceDiscovery>("disco")?;
        let own = disco.own_info();
        let ver = verification_hash(&own.identities, &own.features);
        *self.own_ver.write().expect("own ver lock") = Some(ver);
        let _ = self.disco.set(disco);
        Ok(())
    }

    async fn filter_presence(
        &self,
        _engine: &EngineHandle,
        presence: &Presence,
    ) -> Result<FilterOutcome, Error> {
        if let (Some(from), Some(c)) = (
            presence.from(),
            presence.element().child("c", ns::CAPS),
        ) {
            if c.attr("hash") == Some("sha-1") {
                if let Some(ver) = c.attr("ver") {
                    self.by_jid.insert(from, ver.to_owned());
                }
            }
        }
        // Observation only; presence semantics belong to the IM session.
        Ok(FilterOutcome::Pass)
    }

    fn filter_presence_out(&self, presence: &mut Presence) {
        if presence.presence_type() != PresenceType::Available {
            return;
        }
        let Some(ver) = self.own_ver.read().expect("own ver lock").clone() else {
            return;
        };
        if presence.element().child("c", ns::CAPS).is_some() {
            return;
        }
        let c = Element::new("c", ns::CAPS)
            .with_attr("hash", "sha-1")
            .with_attr("node", &self.node)
            .with_attr("ver", ver);
        presence.element_mut().append_child(c);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artalk_inputs() -> (Vec<Identity>, Vec<String>) {
        (
            vec![Identity::client("Artalk")],
            vec![ns::CAPS.to_owned(), ns::DISCO_INFO.to_owned()],
        )
    }

    #[test]
    fn test_verification_hash_known_vector() {
        // SHA-1 of "client/pc//Artalk<http://jabber.org/protocol/caps<
        // http://jabber.org/protocol/disco#info<", base64.
        let (identities, features) = artalk_inputs();
        assert_eq!(
            verification_hash(&identities, &features),
            "m8Y6xkGGDK7Dnkye7DdvpMPfmx4="
        );
    }

    #[test]
    fn test_verification_hash_deterministic() {
        let (identities, features) = artalk_inputs();
        assert_eq!(
            verification_hash(&identities, &features),
            verification_hash(&identities, &features)
        );
    }

    #[test]
    fn test_verification_hash_sorts_features() {
        let (identities, mut features) = artalk_inputs();
        features.reverse();
        assert_eq!(
            verification_hash(&identities, &features),
            "m8Y6xkGGDK7Dnkye7DdvpMPfmx4="
        );
    }

    #[test]
    fn test_verification_hash_depends_on_inputs() {
        let (identities, features) = artalk_inputs();
        let other = vec![Identity::client("NotArtalk")];
        assert_ne!(
            verification_hash(&identities, &features),
            verification_hash(&other, &features)
        );
    }

    #[test]
    fn test_inbound_caps_recorded() {
        let caps = EntityCaps::new();
        let from: Jid = "bob@xmpp.example/desk".parse().unwrap();
        let element = Element::new("presence", ns::CLIENT)
            .with_attr("from", from.to_string())
            .with_child(
                Element::new("c", ns::CAPS)
                    .with_attr("hash", "sha-1")
                    .with_attr("node", "https://example/client")
                    .with_attr("ver", "abc="),
            );
        let presence = Presence::from_element(element);
        // Feed through the synchronous part of the filter.
        futures::executor::block_on(async {
            let handle = dangling_handle();
            caps.filter_presence(&handle, &presence).await.unwrap();
        });
        assert_eq!(caps.ver_of(&from).as_deref(), Some("abc="));
    }

    #[test]
    fn test_inbound_caps_unknown_hash_ignored() {
        let caps = EntityCaps::new();
        let from: Jid = "bob@xmpp.example/desk".parse().unwrap();
        let element = Element::new("presence", ns::CLIENT)
            .with_attr("from", from.to_string())
            .with_child(
                Element::new("c", ns::CAPS)
                    .with_attr("hash", "md2")
                    .with_attr("ver", "abc="),
            );
        let presence = Presence::from_element(element);
        futures::executor::block_on(async {
            let handle = dangling_handle();
            caps.filter_presence(&handle, &presence).await.unwrap();
        });
        assert_eq!(caps.ver_of(&from), None);
    }

    #[test]
    fn test_outbound_presence_gets_c_element() {
        let caps = EntityCaps::new();
        *caps.own_ver.write().unwrap() = Some("VER=".to_owned());
        let mut presence = Presence::new(PresenceType::Available);
        caps.filter_presence_out(&mut presence);
        let c = presence.element().child("c", ns::CAPS).unwrap();
        assert_eq!(c.attr("hash"), Some("sha-1"));
        assert_eq!(c.attr("node"), Some(CLIENT_NODE));
        assert_eq!(c.attr("ver"), Some("VER="));
    }

    #[test]
    fn test_outbound_subscribe_not_tagged() {
        let caps = EntityCaps::new();
        *caps.own_ver.write().unwrap() = Some("VER=".to_owned());
        let mut presence = Presence::new(PresenceType::Subscribe);
        caps.filter_presence_out(&mut presence);
        assert!(presence.element().child("c", ns::CAPS).is_none());
    }

    #[test]
    fn test_cached_ver_served_without_query() {
        let caps = EntityCaps::new();
        let from: Jid = "bob@xmpp.example/desk".parse().unwrap();
        caps.by_jid.insert(from.clone(), "V1".to_owned());
        let info = Arc::new(DiscoInfo {
            identities: vec![Identity::client("X")],
            features: vec![ns::IBB.to_owned()],
        });
        caps.by_ver.insert("V1".to_owned(), info.clone());
        let got = futures::executor::block_on(caps.extensions_of(&from)).unwrap();
        assert_eq!(got, info);
    }

    fn dangling_handle() -> EngineHandle {
        // A handle whose engine is gone; good enough for filters that
        // only observe.
        crate::engine::EngineHandle::dangling()
    }
}
