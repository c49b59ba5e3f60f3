//! Extension registry and stanza filter chain.
//!
//! Extensions are registered under a stable string identifier before the
//! engine connects. Input filters run in registration order and the first
//! to return [`FilterOutcome::Handled`] short-circuits the chain; output
//! filters always all run and may mutate the stanza.
//!
//! Cross-extension dependencies are resolved in `initialize`, which runs
//! once per extension after the stream is established, with explicit
//! lookup failures instead of type-keyed service location.

pub mod chatstates;

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::EngineHandle;
use crate::error::Error;
use crate::stanza::{Iq, Message, Presence};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    /// The stanza was consumed; stop the chain and skip default handling.
    Handled,
    /// Not interested; keep going.
    Pass,
}

/// A protocol module plugged into the engine.
///
/// Filters run on the dispatcher task and must not block on I/O whose
/// progress depends on the read loop; offload long work with
/// `tokio::spawn`.
#[async_trait]
pub trait Extension: Send + Sync + 'static {
    /// Stable identifier, unique within a registry.
    fn id(&self) -> &'static str;

    /// XML namespaces implemented, advertised through service discovery.
    fn namespaces(&self) -> &'static [&'static str] {
        &[]
    }

    /// Called once after the stream is up and every extension is
    /// registered. Resolve dependencies on other extensions here.
    async fn initialize(
        &self,
        _engine: &EngineHandle,
        _registry: &ExtensionRegistry,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn filter_iq(&self, _engine: &EngineHandle, _iq: &Iq) -> Result<FilterOutcome, Error> {
        Ok(FilterOutcome::Pass)
    }

    async fn filter_message(
        &self,
        _engine: &EngineHandle,
        _message: &Message,
    ) -> Result<FilterOutcome, Error> {
        Ok(FilterOutcome::Pass)
    }

    async fn filter_presence(
        &self,
        _engine: &EngineHandle,
        _presence: &Presence,
    ) -> Result<FilterOutcome, Error> {
        Ok(FilterOutcome::Pass)
    }

    fn filter_iq_out(&self, _iq: &mut Iq) {}

    fn filter_message_out(&self, _message: &mut Message) {}

    fn filter_presence_out(&self, _presence: &mut Presence) {}

    /// Downcast support for [`ExtensionRegistry::get_as`].
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct Entry {
    extension: Arc<dyn Extension>,
}

/// Registry keyed by extension identifier, iterated in registration order.
#[derive(Default)]
pub struct ExtensionRegistry {
    entries: Vec<Entry>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        ExtensionRegistry::default()
    }

    pub fn register<T: Extension>(&mut self, extension: Arc<T>) -> Result<(), Error> {
        if self.get(extension.id()).is_some() {
            return Err(Error::InvalidState("duplicate extension id"));
        }
        self.entries.push(Entry { extension });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Extension>> {
        self.entries
            .iter()
            .find(|e| e.extension.id() == id)
            .map(|e| e.extension.clone())
    }

    /// Looks up an extension by id and concrete type. Both a missing id
    /// and a type mismatch are explicit failures.
    pub fn get_as<T: Extension>(&self, id: &str) -> Result<Arc<T>, Error> {
        let extension = self
            .get(id)
            .ok_or(Error::InvalidState("extension not registered"))?;
        extension
            .as_any()
            .downcast::<T>()
            .map_err(|_| Error::InvalidState("extension id bound to a different type"))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Extension>> {
        self.entries.iter().map(|e| &e.extension)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every namespace advertised by registered extensions, for the
    /// disco#info responder and the entity-caps hash.
    pub fn all_features(&self) -> Vec<String> {
        let mut features: Vec<String> = self
            .iter()
            .flat_map(|e| e.namespaces().iter().map(|s| s.to_string()))
            .collect();
        features.sort();
        features.dedup();
        features
    }
}
