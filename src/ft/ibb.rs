//! XEP-0047 in-band bytestreams, the IQ-carried fallback transport.
//!
//! Chunks are 4096 raw bytes, base64-encoded into `<data/>` elements
//! with a 16-bit wrapping sequence number. Message-mode streams are
//! refused; every chunk rides an `<iq type='set'>` and its result.

use std::any::Any;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use base64::Engine as _;
use dashmap::DashMap;
use tracing::debug;

use crate::engine::EngineHandle;
use crate::error::{DefinedCondition, Error, StanzaError};
use crate::event::Event;
use crate::ext::{Extension, ExtensionRegistry, FilterOutcome};
use crate::ft::{finish_session, Bytestream, FileTransfer, SiSession};
use crate::ns;
use crate::stanza::{Iq, IqType};
use crate::xml::Element;

/// Raw bytes per chunk; roughly 5.7 kB once base64-encoded.
pub const BLOCK_SIZE: usize = 4096;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

pub struct InBandBytestreams {
    handle: OnceLock<EngineHandle>,
    ft: OnceLock<Arc<FileTransfer>>,
    /// Next expected `seq` per receiving stream.
    expected_seq: DashMap<String, u16>,
}

impl Default for InBandBytestreams {
    fn default() -> Self {
        InBandBytestreams::new()
    }
}

impl InBandBytestreams {
    pub fn new() -> InBandBytestreams {
        InBandBytestreams {
            handle: OnceLock::new(),
            ft: OnceLock::new(),
            expected_seq: DashMap::new(),
        }
    }

    fn file_transfer(&self) -> Result<&Arc<FileTransfer>, Error> {
        self.ft
            .get()
            .ok_or(Error::InvalidState("ibb not initialized"))
    }

    async fn handle_open(
        &self,
        engine: &EngineHandle,
        iq: &Iq,
        open: &Element,
    ) -> Result<(), Error> {
        let session = open
            .attr("sid")
            .and_then(|sid| self.file_transfer().ok().and_then(|ft| ft.session(sid)))
            .filter(|s| s.receiving);
        let Some(session) = session else {
            let reply = Iq::error_reply(iq, StanzaError::new(DefinedCondition::NotAcceptable));
            return engine.send_iq(reply).await;
        };
        // Message-carried chunks are disallowed.
        if open.attr("stanza") == Some("message") {
            let reply = Iq::error_reply(
                iq,
                StanzaError::with_text(DefinedCondition::NotAcceptable, "iq stanzas only"),
            );
            return engine.send_iq(reply).await;
        }
        self.expected_seq.insert(session.sid.clone(), 0);
        debug!("ibb stream {} opened", session.sid);
        engine.send_iq(Iq::result(iq, None)).await
    }

    async fn handle_data(
        &self,
        engine: &EngineHandle,
        iq: &Iq,
        data: &Element,
    ) -> Result<(), Error> {
        let ft = self.file_transfer()?.clone();
        let session = data
            .attr("sid")
            .and_then(|sid| ft.session(sid))
            .filter(|s| s.receiving);
        let Some(session) = session else {
            let reply = Iq::error_reply(iq, StanzaError::new(DefinedCondition::ItemNotFound));
            return engine.send_iq(reply).await;
        };

        let seq: Option<u16> = data.attr("seq").and_then(|s| s.parse().ok());
        let expected = self.expected_seq.get(&session.sid).map(|e| *e);
        if seq.is_none() || expected.is_none() || seq != expected {
            let reply = Iq::error_reply(
                iq,
                StanzaError::with_text(DefinedCondition::UnexpectedRequest, "bad sequence"),
            );
            engine.send_iq(reply).await?;
            self.expected_seq.remove(&session.sid);
            finish_session(
                &ft.sessions(),
                engine,
                &session,
                Err(Error::InvalidState("out-of-order ibb chunk")),
            )
            .await;
            return Ok(());
        }

        let decoded = match B64.decode(session_text(data)) {
            Ok(decoded) => decoded,
            Err(_) => {
                let reply = Iq::error_reply(iq, StanzaError::new(DefinedCondition::BadRequest));
                return engine.send_iq(reply).await;
            }
        };
        if let Err(e) = session.write_chunk(&decoded).await {
            let reply = Iq::error_reply(iq, StanzaError::new(DefinedCondition::NotAcceptable));
            engine.send_iq(reply).await?;
            self.expected_seq.remove(&session.sid);
            finish_session(&ft.sessions(), engine, &session, Err(e)).await;
            return Ok(());
        }

        self.expected_seq
            .insert(session.sid.clone(), expected.unwrap_or(0).wrapping_add(1));
        engine
            .emit(Event::FileTransferProgress {
                sid: session.sid.clone(),
                transferred: session.transferred(),
                total: session.size,
            })
            .await;
        engine.send_iq(Iq::result(iq, None)).await
    }

    async fn handle_close(
        &self,
        engine: &EngineHandle,
        iq: &Iq,
        close: &Element,
    ) -> Result<(), Error> {
        let ft = self.file_transfer()?.clone();
        let session = close.attr("sid").and_then(|sid| ft.session(sid));
        let Some(session) = session else {
            // The stream may have completed and been reaped already.
            return engine.send_iq(Iq::result(iq, None)).await;
        };
        self.expected_seq.remove(&session.sid);
        engine.send_iq(Iq::result(iq, None)).await?;
        // Closing at the advertised size is completion; earlier is not.
        finish_session(&ft.sessions(), engine, &session, Ok(())).await;
        Ok(())
    }
}

/// Text content of a `<data/>` element with surrounding whitespace
/// stripped, as emitted by line-wrapping encoders.
fn session_text(data: &Element) -> String {
    data.text().split_whitespace().collect()
}

#[async_trait]
impl Bytestream for InBandBytestreams {
    fn method(&self) -> &'static str {
        ns::IBB
    }

    async fn transfer(&self, engine: &EngineHandle, session: Arc<SiSession>) -> Result<(), Error> {
        let peer = session.peer().clone();

        let open = Element::new("open", ns::IBB)
            .with_attr("sid", &session.sid)
            .with_attr("block-size", BLOCK_SIZE.to_string())
            .with_attr("stanza", "iq");
        engine.request(Iq::set(open).with_to(&peer)).await?;

        let mut seq: u16 = 0;
        loop {
            if session.is_cancelled() {
                let close = Element::new("close", ns::IBB).with_attr("sid", &session.sid);
                let _ = engine.request(Iq::set(close).with_to(&peer)).await;
                return Err(Error::InvalidState("transfer cancelled"));
            }
            let chunk = session.read_chunk(BLOCK_SIZE).await?;
            if chunk.is_empty() {
                break;
            }
            let data = Element::new("data", ns::IBB)
                .with_attr("sid", &session.sid)
                .with_attr("seq", seq.to_string())
                .with_text(B64.encode(&chunk));
            engine.request(Iq::set(data).with_to(&peer)).await?;
            seq = seq.wrapping_add(1);
            engine
                .emit(Event::FileTransferProgress {
                    sid: session.sid.clone(),
                    transferred: session.transferred(),
                    total: session.size,
                })
                .await;
        }

        let close = Element::new("close", ns::IBB).with_attr("sid", &session.sid);
        engine.request(Iq::set(close).with_to(&peer)).await?;
        Ok(())
    }
}

#[async_trait]
impl Extension for InBandBytestreams {
    fn id(&self) -> &'static str {
        "ibb"
    }

    fn namespaces(&self) -> &'static [&'static str] {
        &[ns::IBB]
    }

    async fn initialize(
        &self,
        engine: &EngineHandle,
        registry: &ExtensionRegistry,
    ) -> Result<(), Error> {
        let _ = self.handle.set(engine.clone());
        let ft = registry.get_as::<FileTransfer>("file-transfer")?;
        ft.register_method(registry.get_as::<InBandBytestreams>("ibb")?);
        let _ = self.ft.set(ft);
        Ok(())
    }

    async fn filter_iq(&self, engine: &EngineHandle, iq: &Iq) -> Result<FilterOutcome, Error> {
        if iq.iq_type() != IqType::Set {
            return Ok(FilterOutcome::Pass);
        }
        let Some(payload) = iq.payload().filter(|p| p.namespace() == ns::IBB) else {
            return Ok(FilterOutcome::Pass);
        };
        match payload.name() {
            "open" => self.handle_open(engine, iq, payload).await?,
            "data" => self.handle_data(engine, iq, payload).await?,
            "close" => self.handle_close(engine, iq, payload).await?,
            _ => return Ok(FilterOutcome::Pass),
        }
        Ok(FilterOutcome::Handled)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
