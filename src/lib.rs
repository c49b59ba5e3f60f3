//! An asynchronous XMPP (RFC 3920/3921) client engine.
//!
//! The engine owns the TCP/TLS/SASL-negotiated XML stream, correlates
//! IQ requests with their responses, and fans inbound stanzas out
//! through an extension filter chain. On top of it sit the IM session
//! semantics (roster, presence, subscriptions, privacy lists), service
//! discovery with entity-capabilities caching, and SI file transfer
//! over SOCKS5 bytestreams with an in-band fallback.
//!
//! ```no_run
//! use std::sync::Arc;
//! use fluux_xmpp::{
//!     caps::EntityCaps,
//!     config::Config,
//!     disco::{Identity, ServiceDiscovery},
//!     engine::Engine,
//!     ext::{chatstates::ChatStates, ExtensionRegistry},
//!     ft::{ibb::InBandBytestreams, socks5::Socks5Bytestreams, FileTransfer},
//!     im::ImSession,
//!     si::StreamInitiation,
//! };
//!
//! # async fn run() -> Result<(), fluux_xmpp::Error> {
//! let config = Config::load("config/client.toml")?;
//!
//! let mut registry = ExtensionRegistry::new();
//! let disco = Arc::new(ServiceDiscovery::new(Identity::client("fluux")));
//! let caps = Arc::new(EntityCaps::new());
//! let im = Arc::new(ImSession::new());
//! let si = Arc::new(StreamInitiation::new());
//! let ft = Arc::new(FileTransfer::new(config.file_transfer.clone()));
//! registry.register(disco)?;
//! registry.register(caps)?;
//! registry.register(im.clone())?;
//! registry.register(si)?;
//! registry.register(ft.clone())?;
//! registry.register(Arc::new(Socks5Bytestreams::new(config.file_transfer.clone())))?;
//! registry.register(Arc::new(InBandBytestreams::new()))?;
//! registry.register(Arc::new(ChatStates::new()))?;
//!
//! let (engine, mut events) = Engine::connect(config, registry).await?;
//! println!("connected as {:?}", engine.jid());
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod caps;
pub mod config;
pub mod dataforms;
pub mod disco;
pub mod engine;
pub mod error;
pub mod event;
pub mod ext;
pub mod ft;
pub mod im;
pub mod jid;
pub mod ns;
pub mod si;
pub mod stanza;
pub mod xml;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::Config;
pub use engine::{Engine, EngineHandle};
pub use error::Error;
pub use event::Event;
pub use jid::Jid;
pub use stanza::{Iq, Message, Presence};
