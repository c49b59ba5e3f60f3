//! XEP-0096 SI file transfer: offer/accept, the session registry,
//! progress and abort reporting, cancellation, and the seams to the
//! excluded collaborators (UPnP port mapping, external address
//! discovery).

pub mod ibb;
pub mod socks5;

pub use socks5::StreamHost;

use std::any::Any;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock as StdRwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

use crate::config::FileTransferConfig;
use crate::engine::EngineHandle;
use crate::error::{DefinedCondition, Error, StanzaError};
use crate::event::Event;
use crate::ext::{Extension, ExtensionRegistry};
use crate::jid::Jid;
use crate::ns;
use crate::si::{accept_element, SiProfileHandler, SiRequest, StreamInitiation};
use crate::xml::Element;

/// Hook for the external UPnP collaborator: request a TCP port mapping
/// on the gateway. Failures are non-fatal.
#[async_trait]
pub trait PortMapper: Send + Sync {
    async fn map_port(&self, port: u16) -> Result<(), Error>;
}

/// Hook for the external STUN / server-IP-check collaborator, plus the
/// set of up-interface addresses the NAT heuristic compares against.
#[async_trait]
pub trait AddressSource: Send + Sync {
    /// Addresses reachable from outside (STUN, server IP check).
    async fn external_addresses(&self) -> Vec<IpAddr> {
        Vec::new()
    }

    /// Unicast addresses of the up network interfaces.
    async fn local_addresses(&self) -> Vec<IpAddr>;
}

/// Discovers the primary local address with a connected UDP socket and
/// reports no external addresses.
pub struct DefaultAddressSource;

#[async_trait]
impl AddressSource for DefaultAddressSource {
    async fn local_addresses(&self) -> Vec<IpAddr> {
        let Ok(socket) = tokio::net::UdpSocket::bind("0.0.0.0:0").await else {
            return Vec::new();
        };
        if socket.connect("8.8.8.8:53").await.is_err() {
            return Vec::new();
        }
        socket
            .local_addr()
            .map(|a| vec![a.ip()])
            .unwrap_or_default()
    }
}

/// A local address counts as NATed when it is not among the
/// up-interface unicast addresses.
pub fn behind_nat(address: &IpAddr, interface_addresses: &[IpAddr]) -> bool {
    !interface_addresses.contains(address)
}

enum SessionIo {
    Reading(Box<dyn AsyncRead + Send + Unpin>),
    Writing(Box<dyn AsyncWrite + Send + Unpin>),
    Closed,
}

/// One negotiated transfer. `transferred` never exceeds `size`; the
/// session ends at `transferred == size`, on cancellation, or when the
/// bytestream closes or errors.
pub struct SiSession {
    pub sid: String,
    /// Full JID of the offering side.
    pub initiator: Jid,
    /// Full JID of the receiving side.
    pub target: Jid,
    pub name: String,
    pub size: u64,
    pub receiving: bool,
    /// Namespace of the negotiated bytestream method.
    pub method: String,
    transferred: AtomicU64,
    cancelled: AtomicBool,
    io: TokioMutex<SessionIo>,
}

impl SiSession {
    pub fn sending(
        sid: String,
        initiator: Jid,
        target: Jid,
        name: String,
        size: u64,
        method: String,
        source: Box<dyn AsyncRead + Send + Unpin>,
    ) -> SiSession {
        SiSession {
            sid,
            initiator,
            target,
            name,
            size,
            receiving: false,
            method,
            transferred: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            io: TokioMutex::new(SessionIo::Reading(source)),
        }
    }

    pub fn receiving(
        sid: String,
        initiator: Jid,
        target: Jid,
        name: String,
        size: u64,
        method: String,
        sink: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> SiSession {
        SiSession {
            sid,
            initiator,
            target,
            name,
            size,
            receiving: true,
            method,
            transferred: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            io: TokioMutex::new(SessionIo::Writing(sink)),
        }
    }

    /// The other party, from our perspective.
    pub fn peer(&self) -> &Jid {
        if self.receiving {
            &self.initiator
        } else {
            &self.target
        }
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub fn remaining(&self) -> u64 {
        self.size - self.transferred()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Reads the next chunk from the source, capped to the bytes still
    /// owed. An empty chunk means the transfer is complete.
    pub(crate) async fn read_chunk(&self, max: usize) -> Result<Vec<u8>, Error> {
        let want = (self.remaining().min(max as u64)) as usize;
        if want == 0 {
            return Ok(Vec::new());
        }
        let mut guard = self.io.lock().await;
        let SessionIo::Reading(source) = &mut *guard else {
            return Err(Error::InvalidState("session source already closed"));
        };
        let mut chunk = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = source.read(&mut chunk[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Err(Error::InvalidState("source ended before the advertised size"));
        }
        chunk.truncate(filled);
        self.transferred.fetch_add(filled as u64, Ordering::Relaxed);
        Ok(chunk)
    }

    /// Writes received bytes to the sink, enforcing the size bound.
    pub(crate) async fn write_chunk(&self, data: &[u8]) -> Result<(), Error> {
        if data.len() as u64 > self.remaining() {
            return Err(Error::InvalidState("peer sent more bytes than advertised"));
        }
        let mut guard = self.io.lock().await;
        let SessionIo::Writing(sink) = &mut *guard else {
            return Err(Error::InvalidState("session sink already closed"));
        };
        sink.write_all(data).await?;
        self.transferred.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Flushes and drops the underlying stream.
    pub(crate) async fn finish(&self) -> Result<(), Error> {
        let mut guard = self.io.lock().await;
        if let SessionIo::Writing(sink) = &mut *guard {
            sink.flush().await?;
            sink.shutdown().await?;
        }
        *guard = SessionIo::Closed;
        Ok(())
    }
}

/// Descriptor handed to the receive-request callback.
#[derive(Debug, Clone)]
pub struct FileTransferRequest {
    pub sid: String,
    pub from: Jid,
    pub name: String,
    pub size: u64,
    pub mime: Option<String>,
    pub description: Option<String>,
}

type RequestHandler = Box<dyn Fn(&FileTransferRequest) -> Option<PathBuf> + Send + Sync>;
type SessionMap = Arc<DashMap<String, Arc<SiSession>>>;

/// A negotiated bytestream transport (SOCKS5 or IBB).
#[async_trait]
pub trait Bytestream: Send + Sync {
    /// The stream-method namespace this transport negotiates under.
    fn method(&self) -> &'static str;

    /// Runs the sending side of `session` to completion.
    async fn transfer(&self, engine: &EngineHandle, session: Arc<SiSession>) -> Result<(), Error>;
}

pub struct FileTransfer {
    handle: OnceLock<EngineHandle>,
    si: OnceLock<Arc<StreamInitiation>>,
    config: FileTransferConfig,
    sessions: SessionMap,
    /// Registered transports in preference order.
    methods: StdRwLock<Vec<Arc<dyn Bytestream>>>,
    request_handler: StdRwLock<Option<RequestHandler>>,
}

impl FileTransfer {
    pub fn new(config: FileTransferConfig) -> FileTransfer {
        FileTransfer {
            handle: OnceLock::new(),
            si: OnceLock::new(),
            config,
            sessions: Arc::new(DashMap::new()),
            methods: StdRwLock::new(Vec::new()),
            request_handler: StdRwLock::new(None),
        }
    }

    fn engine(&self) -> Result<&EngineHandle, Error> {
        self.handle
            .get()
            .ok_or(Error::InvalidState("file transfer not initialized"))
    }

    /// Decides whether to accept an inbound offer; returning a path
    /// accepts and names the destination file.
    pub fn set_request_handler(
        &self,
        handler: impl Fn(&FileTransferRequest) -> Option<PathBuf> + Send + Sync + 'static,
    ) {
        *self.request_handler.write().expect("request handler lock") = Some(Box::new(handler));
    }

    /// Called by bytestream modules at initialize.
    pub(crate) fn register_method(&self, method: Arc<dyn Bytestream>) {
        self.methods.write().expect("methods lock").push(method);
    }

    pub(crate) fn session(&self, sid: &str) -> Option<Arc<SiSession>> {
        self.sessions.get(sid).map(|s| s.clone())
    }

    pub(crate) fn sessions(&self) -> SessionMap {
        self.sessions.clone()
    }

    /// Number of transfers currently in flight.
    pub fn active_transfers(&self) -> usize {
        self.sessions.len()
    }

    fn method_names(&self) -> Vec<String> {
        let methods = self.methods.read().expect("methods lock");
        if self.config.force_in_band {
            methods
                .iter()
                .filter(|m| m.method() == ns::IBB)
                .map(|m| m.method().to_owned())
                .collect()
        } else {
            methods.iter().map(|m| m.method().to_owned()).collect()
        }
    }

    fn method_by_name(&self, name: &str) -> Option<Arc<dyn Bytestream>> {
        self.methods
            .read()
            .expect("methods lock")
            .iter()
            .find(|m| m.method() == name)
            .cloned()
    }

    /// Offers a file on disk to `to` (a full JID).
    pub async fn send_file(
        &self,
        to: &Jid,
        path: &Path,
        description: Option<&str>,
    ) -> Result<String, Error> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_owned());
        self.send_stream(to, Box::new(file), &name, size, description)
            .await
    }

    /// Offers `size` bytes from an arbitrary source. Returns the session
    /// id once negotiation succeeds; the transfer itself runs on its own
    /// task, reporting through `FileTransferProgress`,
    /// `FileTransferCompleted` and `FileTransferAborted` events.
    pub async fn send_stream(
        &self,
        to: &Jid,
        source: Box<dyn AsyncRead + Send + Unpin>,
        name: &str,
        size: u64,
        description: Option<&str>,
    ) -> Result<String, Error> {
        let engine = self.engine()?.clone();
        let si = self
            .si
            .get()
            .ok_or(Error::InvalidState("file transfer not initialized"))?;
        let own = engine.jid()?.ok_or(Error::InvalidState("not connected"))?;

        let method_names = self.method_names();
        if method_names.is_empty() {
            return Err(Error::InvalidState("no bytestream transport registered"));
        }
        let offered: Vec<&str> = method_names.iter().map(String::as_str).collect();

        let mut file = Element::new("file", ns::SI_FILE_TRANSFER);
        file.set_attr("name", name);
        file.set_attr("size", size.to_string());
        if let Some(description) = description {
            file.append_child(Element::new("desc", ns::SI_FILE_TRANSFER).with_text(description));
        }

        let (sid, method_name) = si
            .initiate(to, None, ns::SI_FILE_TRANSFER, file, &offered)
            .await?;
        info!("file offer accepted: sid={sid} method={method_name}");

        let session = Arc::new(SiSession::sending(
            sid.clone(),
            own,
            to.clone(),
            name.to_owned(),
            size,
            method_name.clone(),
            source,
        ));
        self.sessions.insert(sid.clone(), session.clone());

        let transport = self
            .method_by_name(&method_name)
            .ok_or(Error::NotSupported("negotiated method has no transport"))?;

        let sessions = self.sessions();
        tokio::spawn(async move {
            let result = transport.transfer(&engine, session.clone()).await;
            finish_session(&sessions, &engine, &session, result).await;
        });
        Ok(sid)
    }

    /// Flags a transfer for cancellation; the running task notices
    /// between chunks and reports `FileTransferAborted`.
    pub fn cancel(&self, sid: &str) {
        if let Some(session) = self.session(sid) {
            session.cancel();
            debug!("transfer {sid} flagged for cancellation");
        }
    }
}

/// Removes the session and emits the terminal event exactly once.
pub(crate) async fn finish_session(
    sessions: &DashMap<String, Arc<SiSession>>,
    engine: &EngineHandle,
    session: &SiSession,
    result: Result<(), Error>,
) {
    if sessions.remove(&session.sid).is_none() {
        return;
    }
    let _ = session.finish().await;
    match result {
        Ok(()) if session.transferred() == session.size => {
            engine
                .emit(Event::FileTransferCompleted {
                    sid: session.sid.clone(),
                })
                .await;
        }
        Ok(()) => {
            engine
                .emit(Event::FileTransferAborted {
                    sid: session.sid.clone(),
                    reason: "bytestream closed early".to_owned(),
                })
                .await;
        }
        Err(e) => {
            warn!("transfer {} aborted: {e}", session.sid);
            engine
                .emit(Event::FileTransferAborted {
                    sid: session.sid.clone(),
                    reason: e.to_string(),
                })
                .await;
        }
    }
}

#[async_trait]
impl SiProfileHandler for FileTransfer {
    async fn handle(
        &self,
        engine: &EngineHandle,
        request: SiRequest,
    ) -> Result<Element, StanzaError> {
        let Some(file) = request
            .payload
            .as_ref()
            .filter(|p| p.is("file", ns::SI_FILE_TRANSFER))
        else {
            return Err(StanzaError::new(DefinedCondition::BadRequest));
        };
        let (Some(name), Some(size)) = (
            file.attr("name"),
            file.attr("size").and_then(|s| s.parse::<u64>().ok()),
        ) else {
            return Err(StanzaError::new(DefinedCondition::BadRequest));
        };

        // A sid can only name one active session.
        if self.sessions.contains_key(&request.sid) {
            return Err(StanzaError::new(DefinedCondition::Conflict));
        }

        // Pick the first transport both sides know.
        let method_name = self
            .method_names()
            .into_iter()
            .find(|m| request.methods.iter().any(|offered| offered == m))
            .ok_or_else(|| {
                StanzaError::with_text(DefinedCondition::BadRequest, "no valid stream method")
            })?;

        let descriptor = FileTransferRequest {
            sid: request.sid.clone(),
            from: request.from.clone(),
            name: name.to_owned(),
            size,
            mime: request.mime.clone(),
            description: file
                .child("desc", ns::SI_FILE_TRANSFER)
                .map(|d| d.text()),
        };
        let path = {
            let handler = self.request_handler.read().expect("request handler lock");
            handler.as_ref().and_then(|h| h(&descriptor))
        };
        let Some(path) = path else {
            debug!("file offer {} declined", request.sid);
            return Err(StanzaError::new(DefinedCondition::NotAcceptable));
        };

        let sink = tokio::fs::File::create(&path)
            .await
            .map_err(|_| StanzaError::new(DefinedCondition::InternalServerError))?;
        let own = engine
            .jid()
            .ok()
            .flatten()
            .ok_or_else(|| StanzaError::new(DefinedCondition::InternalServerError))?;

        let session = Arc::new(SiSession::receiving(
            request.sid.clone(),
            request.from.clone(),
            own,
            descriptor.name.clone(),
            size,
            method_name.clone(),
            Box::new(sink),
        ));
        self.sessions.insert(request.sid.clone(), session);
        info!(
            "accepting file {} ({size} bytes) from {} via {method_name}",
            descriptor.name, request.from
        );
        Ok(accept_element(&method_name))
    }
}

#[async_trait]
impl Extension for FileTransfer {
    fn id(&self) -> &'static str {
        "file-transfer"
    }

    fn namespaces(&self) -> &'static [&'static str] {
        &[ns::SI_FILE_TRANSFER]
    }

    async fn initialize(
        &self,
        engine: &EngineHandle,
        registry: &ExtensionRegistry,
    ) -> Result<(), Error> {
        let _ = self.handle.set(engine.clone());
        let si = registry.get_as::<StreamInitiation>("si")?;
        let me = registry.get_as::<FileTransfer>("file-transfer")?;
        si.register_profile(ns::SI_FILE_TRANSFER, me);
        let _ = self.si.set(si);
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
