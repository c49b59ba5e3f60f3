//! XEP-0065 SOCKS5 bytestreams.
//!
//! The sender runs a SOCKS5 server for direct transfers and falls back
//! to mediated proxies; the receiver connects to offered streamhosts in
//! order. Both ends authenticate the TCP connection with the SHA-1 of
//! `sid ‖ initiator-JID ‖ target-JID` used as the CONNECT hostname.

use std::any::Any;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::FileTransferConfig;
use crate::disco::ServiceDiscovery;
use crate::engine::EngineHandle;
use crate::error::{DefinedCondition, Error, StanzaError};
use crate::event::Event;
use crate::ext::{Extension, ExtensionRegistry, FilterOutcome};
use crate::ft::{
    behind_nat, finish_session, AddressSource, Bytestream, DefaultAddressSource, FileTransfer,
    SiSession,
};
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Iq, IqType};
use crate::xml::Element;

/// How long the direct-mode listener waits for the target.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(180);
/// Per-step socket timeout during the SOCKS5 handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for the streamhosts IQ; covers the accept window.
const STREAMHOSTS_TIMEOUT: Duration = Duration::from_secs(210);
/// Chunk size when pumping file bytes over the socket.
const CHUNK: usize = 8192;

/// A SOCKS5 streamhost candidate.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamHost {
    pub jid: Jid,
    pub host: String,
    pub port: u16,
}

impl StreamHost {
    fn to_element(&self) -> Element {
        Element::new("streamhost", ns::BYTESTREAMS)
            .with_attr("jid", self.jid.to_string())
            .with_attr("host", &self.host)
            .with_attr("port", self.port.to_string())
    }

    fn from_element(element: &Element) -> Option<StreamHost> {
        Some(StreamHost {
            jid: element.attr("jid")?.parse().ok()?,
            host: element.attr("host")?.to_owned(),
            port: element.attr("port")?.parse().ok()?,
        })
    }
}

/// Lowercase hex SHA-1 of `sid ‖ initiator ‖ target`, the CONNECT
/// destination hostname proving the SOCKS5 client is the XMPP peer.
pub fn hostname_hash(sid: &str, initiator: &Jid, target: &Jid) -> String {
    let mut hasher = Sha1::new();
    hasher.update(sid.as_bytes());
    hasher.update(initiator.to_string().as_bytes());
    hasher.update(target.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

// ── wire messages ────────────────────────────────────────

pub const SOCKS_VERSION: u8 = 0x05;
pub const NO_AUTH: u8 = 0x00;
pub const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

/// CONNECT destination, tagged by ATYP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    V4([u8; 4]),
    V6([u8; 16]),
    /// Length-prefixed hostname, at most 255 bytes.
    Domain(String),
}

impl Addr {
    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Addr::V4(octets) => {
                out.push(0x01);
                out.extend_from_slice(octets);
            }
            Addr::Domain(domain) => {
                out.push(0x03);
                out.push(domain.len() as u8);
                out.extend_from_slice(domain.as_bytes());
            }
            Addr::V6(octets) => {
                out.push(0x04);
                out.extend_from_slice(octets);
            }
        }
    }

    async fn read_from<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Addr, Error> {
        let atyp = read_u8(stream).await?;
        match atyp {
            0x01 => {
                let mut octets = [0u8; 4];
                stream.read_exact(&mut octets).await?;
                Ok(Addr::V4(octets))
            }
            0x03 => {
                let len = read_u8(stream).await? as usize;
                let mut bytes = vec![0u8; len];
                stream.read_exact(&mut bytes).await?;
                String::from_utf8(bytes)
                    .map(Addr::Domain)
                    .map_err(|_| Error::StreamXml("non-UTF-8 SOCKS5 domain".into()))
            }
            0x04 => {
                let mut octets = [0u8; 16];
                stream.read_exact(&mut octets).await?;
                Ok(Addr::V6(octets))
            }
            other => Err(Error::StreamXml(format!("unknown SOCKS5 ATYP {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub methods: Vec<u8>,
}

impl AuthRequest {
    pub fn no_auth() -> AuthRequest {
        AuthRequest {
            methods: vec![NO_AUTH],
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![SOCKS_VERSION, self.methods.len() as u8];
        out.extend_from_slice(&self.methods);
        out
    }

    pub async fn read_from<S: AsyncRead + Unpin>(stream: &mut S) -> Result<AuthRequest, Error> {
        expect_version(stream).await?;
        let count = read_u8(stream).await? as usize;
        let mut methods = vec![0u8; count];
        stream.read_exact(&mut methods).await?;
        Ok(AuthRequest { methods })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthResponse {
    pub method: u8,
}

impl AuthResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![SOCKS_VERSION, self.method]
    }

    pub async fn read_from<S: AsyncRead + Unpin>(stream: &mut S) -> Result<AuthResponse, Error> {
        expect_version(stream).await?;
        Ok(AuthResponse {
            method: read_u8(stream).await?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl Command {
    fn as_u8(&self) -> u8 {
        match self {
            Command::Connect => 0x01,
            Command::Bind => 0x02,
            Command::UdpAssociate => 0x03,
        }
    }

    fn from_u8(value: u8) -> Option<Command> {
        Some(match value {
            0x01 => Command::Connect,
            0x02 => Command::Bind,
            0x03 => Command::UdpAssociate,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub command: Command,
    pub addr: Addr,
    pub port: u16,
}

impl SocksRequest {
    /// The XEP-0065 CONNECT: domain ATYP carrying the hash, port 0.
    pub fn connect_hash(hash: &str) -> SocksRequest {
        SocksRequest {
            command: Command::Connect,
            addr: Addr::Domain(hash.to_owned()),
            port: 0,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![SOCKS_VERSION, self.command.as_u8(), 0x00];
        self.addr.write_to(&mut out);
        out.extend_from_slice(&self.port.to_be_bytes());
        out
    }

    pub async fn read_from<S: AsyncRead + Unpin>(stream: &mut S) -> Result<SocksRequest, Error> {
        expect_version(stream).await?;
        let command = Command::from_u8(read_u8(stream).await?)
            .ok_or_else(|| Error::StreamXml("unknown SOCKS5 command".into()))?;
        let _reserved = read_u8(stream).await?;
        let addr = Addr::read_from(stream).await?;
        let port = read_u16(stream).await?;
        Ok(SocksRequest {
            command,
            addr,
            port,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Succeeded,
    GeneralFailure,
    NotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
}

impl ReplyStatus {
    fn as_u8(&self) -> u8 {
        match self {
            ReplyStatus::Succeeded => 0x00,
            ReplyStatus::GeneralFailure => 0x01,
            ReplyStatus::NotAllowed => 0x02,
            ReplyStatus::NetworkUnreachable => 0x03,
            ReplyStatus::HostUnreachable => 0x04,
            ReplyStatus::ConnectionRefused => 0x05,
            ReplyStatus::TtlExpired => 0x06,
            ReplyStatus::CommandNotSupported => 0x07,
            ReplyStatus::AddressTypeNotSupported => 0x08,
        }
    }

    fn from_u8(value: u8) -> Option<ReplyStatus> {
        Some(match value {
            0x00 => ReplyStatus::Succeeded,
            0x01 => ReplyStatus::GeneralFailure,
            0x02 => ReplyStatus::NotAllowed,
            0x03 => ReplyStatus::NetworkUnreachable,
            0x04 => ReplyStatus::HostUnreachable,
            0x05 => ReplyStatus::ConnectionRefused,
            0x06 => ReplyStatus::TtlExpired,
            0x07 => ReplyStatus::CommandNotSupported,
            0x08 => ReplyStatus::AddressTypeNotSupported,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksReply {
    pub status: ReplyStatus,
    pub addr: Addr,
    pub port: u16,
}

impl SocksReply {
    pub fn new(status: ReplyStatus, addr: Addr, port: u16) -> SocksReply {
        SocksReply {
            status,
            addr,
            port,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![SOCKS_VERSION, self.status.as_u8(), 0x00];
        self.addr.write_to(&mut out);
        out.extend_from_slice(&self.port.to_be_bytes());
        out
    }

    pub async fn read_from<S: AsyncRead + Unpin>(stream: &mut S) -> Result<SocksReply, Error> {
        expect_version(stream).await?;
        let status = ReplyStatus::from_u8(read_u8(stream).await?)
            .ok_or_else(|| Error::StreamXml("unknown SOCKS5 reply status".into()))?;
        let _reserved = read_u8(stream).await?;
        let addr = Addr::read_from(stream).await?;
        let port = read_u16(stream).await?;
        Ok(SocksReply {
            status,
            addr,
            port,
        })
    }
}

async fn read_u8<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u8, Error> {
    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte).await?;
    Ok(byte[0])
}

async fn read_u16<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u16, Error> {
    let mut bytes = [0u8; 2];
    stream.read_exact(&mut bytes).await?;
    Ok(u16::from_be_bytes(bytes))
}

async fn expect_version<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(), Error> {
    let version = read_u8(stream).await?;
    if version != SOCKS_VERSION {
        return Err(Error::StreamXml(format!("unexpected SOCKS version {version}")));
    }
    Ok(())
}

// ── handshakes ───────────────────────────────────────────

/// Client side: greeting, no-auth, CONNECT to the hash.
pub(crate) async fn connect_socks5(
    host: &str,
    port: u16,
    hash: &str,
) -> Result<TcpStream, Error> {
    let mut socket = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| Error::Timeout)??;
    socket
        .write_all(&AuthRequest::no_auth().to_bytes())
        .await?;
    let auth = timeout(HANDSHAKE_TIMEOUT, AuthResponse::read_from(&mut socket))
        .await
        .map_err(|_| Error::Timeout)??;
    if auth.method != NO_AUTH {
        return Err(Error::NotSupported("SOCKS5 host demands authentication"));
    }
    socket
        .write_all(&SocksRequest::connect_hash(hash).to_bytes())
        .await?;
    let reply = timeout(HANDSHAKE_TIMEOUT, SocksReply::read_from(&mut socket))
        .await
        .map_err(|_| Error::Timeout)??;
    if reply.status != ReplyStatus::Succeeded {
        return Err(Error::InvalidState("SOCKS5 connect refused"));
    }
    Ok(socket)
}

/// Server side of one accepted socket: greeting, CONNECT, hash check.
async fn server_handshake(socket: &mut TcpStream, hash: &str) -> Result<(), Error> {
    let auth = timeout(HANDSHAKE_TIMEOUT, AuthRequest::read_from(socket))
        .await
        .map_err(|_| Error::Timeout)??;
    if !auth.methods.contains(&NO_AUTH) {
        let _ = socket
            .write_all(
                &AuthResponse {
                    method: NO_ACCEPTABLE_METHODS,
                }
                .to_bytes(),
            )
            .await;
        return Err(Error::NotSupported("client offered no no-auth method"));
    }
    socket
        .write_all(&AuthResponse { method: NO_AUTH }.to_bytes())
        .await?;

    let request = timeout(HANDSHAKE_TIMEOUT, SocksRequest::read_from(socket))
        .await
        .map_err(|_| Error::Timeout)??;
    let hash_ok = request.command == Command::Connect
        && request.addr == Addr::Domain(hash.to_owned());
    if !hash_ok {
        let refuse = SocksReply::new(
            ReplyStatus::ConnectionRefused,
            Addr::Domain(hash.to_owned()),
            0,
        );
        let _ = socket.write_all(&refuse.to_bytes()).await;
        return Err(Error::InvalidState("SOCKS5 destination hash mismatch"));
    }
    socket
        .write_all(
            &SocksReply::new(ReplyStatus::Succeeded, Addr::Domain(hash.to_owned()), 0)
                .to_bytes(),
        )
        .await?;
    Ok(())
}

/// Accept loop for direct mode: hands back the first socket that passes
/// the handshake. Impostors are refused and the listener keeps going
/// until the deadline.
async fn serve_direct(listener: TcpListener, hash: String) -> Result<TcpStream, Error> {
    let deadline = Instant::now() + ACCEPT_TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(Error::Timeout)?;
        let (mut socket, peer) = timeout(remaining, listener.accept())
            .await
            .map_err(|_| Error::Timeout)??;
        match server_handshake(&mut socket, &hash).await {
            Ok(()) => return Ok(socket),
            Err(e) => {
                debug!("rejecting SOCKS5 client {peer}: {e}");
            }
        }
    }
}

/// Binds a listener on an unused port within the inclusive range. The
/// full range short-circuits to an OS-assigned port.
pub(crate) async fn bind_in_range(from: u16, to: u16) -> Result<TcpListener, Error> {
    if from == 0 && to == 65535 {
        return Ok(TcpListener::bind(("0.0.0.0", 0)).await?);
    }
    for port in from..=to {
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
            return Ok(listener);
        }
    }
    Err(Error::InvalidState("no free port in the configured range"))
}

// ── the extension ────────────────────────────────────────

pub struct Socks5Bytestreams {
    handle: OnceLock<EngineHandle>,
    ft: OnceLock<Arc<FileTransfer>>,
    disco: OnceLock<Arc<ServiceDiscovery>>,
    config: FileTransferConfig,
}

impl Socks5Bytestreams {
    pub fn new(config: FileTransferConfig) -> Socks5Bytestreams {
        Socks5Bytestreams {
            handle: OnceLock::new(),
            ft: OnceLock::new(),
            disco: OnceLock::new(),
            config,
        }
    }

    fn file_transfer(&self) -> Result<&Arc<FileTransfer>, Error> {
        self.ft
            .get()
            .ok_or(Error::InvalidState("socks5 not initialized"))
    }

    fn address_source(&self) -> Arc<dyn AddressSource> {
        self.config
            .address_source
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultAddressSource))
    }

    /// Queries the own server for `proxy`/`bytestreams` items and their
    /// streamhosts.
    async fn discover_proxies(&self, engine: &EngineHandle) -> Vec<StreamHost> {
        let Some(disco) = self.disco.get() else {
            return Vec::new();
        };
        let Ok(Some(own)) = engine.jid() else {
            return Vec::new();
        };
        let Ok(server) = Jid::new(None, own.domain(), None) else {
            return Vec::new();
        };
        let Ok(items) = disco.items(&server).await else {
            return Vec::new();
        };
        let mut proxies = Vec::new();
        for item in items {
            let Ok(info) = disco.info(&item.jid, None).await else {
                continue;
            };
            let is_proxy = info
                .identities
                .iter()
                .any(|i| i.category == "proxy" && i.type_ == "bytestreams");
            if !is_proxy {
                continue;
            }
            let query = Element::new("query", ns::BYTESTREAMS);
            let Ok(response) = engine.request(Iq::get(query).with_to(&item.jid)).await else {
                continue;
            };
            if let Some(host) = response
                .payload()
                .and_then(|p| p.child("streamhost", ns::BYTESTREAMS))
                .and_then(StreamHost::from_element)
            {
                debug!("discovered bytestream proxy {} at {}:{}", host.jid, host.host, host.port);
                proxies.push(host);
            }
        }
        proxies
    }

    /// Streams the session out over an established socket.
    async fn pump_out(
        engine: &EngineHandle,
        session: &SiSession,
        socket: &mut TcpStream,
    ) -> Result<(), Error> {
        loop {
            if session.is_cancelled() {
                return Err(Error::InvalidState("transfer cancelled"));
            }
            let chunk = session.read_chunk(CHUNK).await?;
            if chunk.is_empty() {
                socket.flush().await?;
                return Ok(());
            }
            socket.write_all(&chunk).await?;
            engine
                .emit(Event::FileTransferProgress {
                    sid: session.sid.clone(),
                    transferred: session.transferred(),
                    total: session.size,
                })
                .await;
        }
    }

    /// Reads the session in from an established socket until the
    /// advertised size arrives.
    async fn pump_in(
        engine: &EngineHandle,
        session: &SiSession,
        socket: &mut TcpStream,
    ) -> Result<(), Error> {
        let mut buf = vec![0u8; CHUNK];
        while session.remaining() > 0 {
            if session.is_cancelled() {
                return Err(Error::InvalidState("transfer cancelled"));
            }
            let want = (session.remaining().min(CHUNK as u64)) as usize;
            let n = socket.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(Error::InvalidState("peer closed before the advertised size"));
            }
            session.write_chunk(&buf[..n]).await?;
            engine
                .emit(Event::FileTransferProgress {
                    sid: session.sid.clone(),
                    transferred: session.transferred(),
                    total: session.size,
                })
                .await;
        }
        Ok(())
    }

    /// The receiver path: try each offered streamhost, confirm the one
    /// that worked, then read the file.
    async fn receive(
        engine: EngineHandle,
        ft: Arc<FileTransfer>,
        session: Arc<SiSession>,
        hosts: Vec<StreamHost>,
        request: Iq,
    ) {
        let hash = hostname_hash(&session.sid, &session.initiator, &session.target);
        for host in &hosts {
            match connect_socks5(&host.host, host.port, &hash).await {
                Ok(mut socket) => {
                    info!("connected to streamhost {} for {}", host.jid, session.sid);
                    let used = Element::new("query", ns::BYTESTREAMS)
                        .with_attr("sid", &session.sid)
                        .with_child(
                            Element::new("streamhost-used", ns::BYTESTREAMS)
                                .with_attr("jid", host.jid.to_string()),
                        );
                    if let Err(e) = engine.send_iq(Iq::result(&request, Some(used))).await {
                        warn!("could not confirm streamhost: {e}");
                        return;
                    }
                    let result = Self::pump_in(&engine, &session, &mut socket).await;
                    finish_session(&ft.sessions(), &engine, &session, result).await;
                    return;
                }
                Err(e) => {
                    debug!("streamhost {} unreachable: {e}", host.jid);
                }
            }
        }
        let reply = Iq::error_reply(&request, StanzaError::new(DefinedCondition::ItemNotFound));
        let _ = engine.send_iq(reply).await;
        finish_session(
            &ft.sessions(),
            &engine,
            &session,
            Err(Error::InvalidState("no reachable streamhost")),
        )
        .await;
    }
}

#[async_trait]
impl Bytestream for Socks5Bytestreams {
    fn method(&self) -> &'static str {
        ns::BYTESTREAMS
    }

    async fn transfer(&self, engine: &EngineHandle, session: Arc<SiSession>) -> Result<(), Error> {
        let hash = hostname_hash(&session.sid, &session.initiator, &session.target);
        let own = session.initiator.clone();
        let mut hosts: Vec<StreamHost> = Vec::new();

        // Direct mode: listener plus one streamhost per usable address.
        let mut acceptor = None;
        match bind_in_range(self.config.socks5_port_from, self.config.socks5_port_to).await {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                let source = self.address_source();
                let locals = source.local_addresses().await;
                let externals = source.external_addresses().await;

                if self.config.use_upnp {
                    let nated = externals.iter().any(|e| behind_nat(e, &locals));
                    if nated {
                        if let Some(mapper) = &self.config.port_mapper {
                            // Best effort; a transfer can still work without.
                            if let Err(e) = mapper.map_port(port).await {
                                warn!("UPnP mapping failed: {e}");
                            }
                        }
                    }
                }

                for address in externals.iter().chain(locals.iter()) {
                    hosts.push(StreamHost {
                        jid: own.clone(),
                        host: address.to_string(),
                        port,
                    });
                }
                acceptor = Some(tokio::spawn(serve_direct(listener, hash.clone())));
            }
            Err(e) => warn!("no direct-mode listener: {e}"),
        }

        // Mediated mode candidates.
        if self.config.proxy_allowed {
            hosts.extend(self.config.proxies.clone());
            hosts.extend(self.discover_proxies(engine).await);
        }
        if hosts.is_empty() {
            return Err(Error::NotSupported("no streamhost candidates"));
        }

        let mut query = Element::new("query", ns::BYTESTREAMS);
        query.set_attr("sid", &session.sid);
        for host in &hosts {
            query.append_child(host.to_element());
        }
        let response = engine
            .request_with_timeout(
                Iq::set(query).with_to(&session.target),
                STREAMHOSTS_TIMEOUT,
            )
            .await;
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                if let Some(task) = acceptor {
                    task.abort();
                }
                return Err(e);
            }
        };
        let used: Jid = response
            .payload()
            .filter(|p| p.is("query", ns::BYTESTREAMS))
            .and_then(|p| p.child("streamhost-used", ns::BYTESTREAMS))
            .and_then(|u| u.attr("jid"))
            .and_then(|j| j.parse().ok())
            .ok_or_else(|| Error::StreamXml("missing streamhost-used".into()))?;

        if used == own {
            let task = acceptor.ok_or(Error::InvalidState(
                "target chose direct mode but no listener is up",
            ))?;
            let mut socket = task
                .await
                .map_err(|_| Error::InvalidState("acceptor task failed"))??;
            Self::pump_out(engine, &session, &mut socket).await
        } else {
            if let Some(task) = acceptor {
                task.abort();
            }
            let proxy = hosts
                .iter()
                .find(|h| h.jid == used)
                .ok_or(Error::InvalidState("target chose an unknown streamhost"))?;
            let mut socket = connect_socks5(&proxy.host, proxy.port, &hash).await?;

            // Tell the proxy to splice us to the target.
            let activate = Element::new("query", ns::BYTESTREAMS)
                .with_attr("sid", &session.sid)
                .with_child(
                    Element::new("activate", ns::BYTESTREAMS)
                        .with_text(session.target.to_string()),
                );
            engine
                .request(Iq::set(activate).with_to(&proxy.jid))
                .await?;
            Self::pump_out(engine, &session, &mut socket).await
        }
    }
}

#[async_trait]
impl Extension for Socks5Bytestreams {
    fn id(&self) -> &'static str {
        "socks5"
    }

    fn namespaces(&self) -> &'static [&'static str] {
        &[ns::BYTESTREAMS]
    }

    async fn initialize(
        &self,
        engine: &EngineHandle,
        registry: &ExtensionRegistry,
    ) -> Result<(), Error> {
        let _ = self.handle.set(engine.clone());
        let ft = registry.get_as::<FileTransfer>("file-transfer")?;
        ft.register_method(registry.get_as::<Socks5Bytestreams>("socks5")?);
        let _ = self.ft.set(ft);
        if let Ok(disco) = registry.get_as::<ServiceDiscovery>("disco") {
            let _ = self.disco.set(disco);
        }
        Ok(())
    }

    async fn filter_iq(&self, engine: &EngineHandle, iq: &Iq) -> Result<FilterOutcome, Error> {
        if iq.iq_type() != IqType::Set {
            return Ok(FilterOutcome::Pass);
        }
        let Some(query) = iq.payload().filter(|p| p.is("query", ns::BYTESTREAMS)) else {
            return Ok(FilterOutcome::Pass);
        };

        let ft = self.file_transfer()?.clone();
        let session = query
            .attr("sid")
            .and_then(|sid| ft.session(sid))
            .filter(|s| s.receiving);
        let Some(session) = session else {
            let reply = Iq::error_reply(iq, StanzaError::new(DefinedCondition::NotAcceptable));
            engine.send_iq(reply).await?;
            return Ok(FilterOutcome::Handled);
        };
        if query.attr("mode") == Some("udp") {
            let reply = Iq::error_reply(
                iq,
                StanzaError::with_text(DefinedCondition::NotAcceptable, "udp mode not supported"),
            );
            engine.send_iq(reply).await?;
            return Ok(FilterOutcome::Handled);
        }

        let hosts: Vec<StreamHost> = query
            .children()
            .filter(|c| c.is("streamhost", ns::BYTESTREAMS))
            .filter_map(StreamHost::from_element)
            .collect();

        // Connecting out is slow work; keep it off the dispatcher.
        tokio::spawn(Self::receive(
            engine.clone(),
            ft,
            session,
            hosts,
            iq.clone(),
        ));
        Ok(FilterOutcome::Handled)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    // ── round-trip laws ─────────────────────────────────

    async fn round_trip_request(request: SocksRequest) -> SocksRequest {
        let bytes = request.to_bytes();
        SocksRequest::read_from(&mut bytes.as_slice()).await.unwrap()
    }

    #[tokio::test]
    async fn test_socks_request_round_trips() {
        for request in [
            SocksRequest::connect_hash("99f6dc628c778a485dc0f254a6ea33764b7aace1"),
            SocksRequest {
                command: Command::Bind,
                addr: Addr::V4([127, 0, 0, 1]),
                port: 1080,
            },
            SocksRequest {
                command: Command::UdpAssociate,
                addr: Addr::V6([0xfe; 16]),
                port: 65535,
            },
        ] {
            assert_eq!(round_trip_request(request.clone()).await, request);
        }
    }

    #[tokio::test]
    async fn test_socks_reply_round_trips() {
        for reply in [
            SocksReply::new(ReplyStatus::Succeeded, Addr::Domain("abc".into()), 0),
            SocksReply::new(ReplyStatus::ConnectionRefused, Addr::V4([10, 0, 0, 1]), 9),
            SocksReply::new(ReplyStatus::HostUnreachable, Addr::V6([1; 16]), 443),
        ] {
            let bytes = reply.to_bytes();
            let parsed = SocksReply::read_from(&mut bytes.as_slice()).await.unwrap();
            assert_eq!(parsed, reply);
        }
    }

    #[tokio::test]
    async fn test_auth_messages_round_trip() {
        let auth = AuthRequest {
            methods: vec![0x00, 0x02],
        };
        let parsed = AuthRequest::read_from(&mut auth.to_bytes().as_slice())
            .await
            .unwrap();
        assert_eq!(parsed, auth);

        let response = AuthResponse { method: 0x00 };
        let parsed = AuthResponse::read_from(&mut response.to_bytes().as_slice())
            .await
            .unwrap();
        assert_eq!(parsed, response);
    }

    #[tokio::test]
    async fn test_bad_version_rejected() {
        let bytes = [0x04u8, 0x01, 0x00];
        assert!(AuthRequest::read_from(&mut bytes.as_slice()).await.is_err());
    }

    // ── hostname hash ───────────────────────────────────

    #[test]
    fn test_hostname_hash_vector() {
        let hash = hostname_hash(
            "s5b_1",
            &jid("alice@xmpp.example/home"),
            &jid("bob@xmpp.example/desk"),
        );
        assert_eq!(hash, "99f6dc628c778a485dc0f254a6ea33764b7aace1");
        assert_eq!(hash.len(), 40);
    }

    #[test]
    fn test_hostname_hash_direction_matters() {
        let a = jid("alice@xmpp.example/home");
        let b = jid("bob@xmpp.example/desk");
        assert_ne!(hostname_hash("s", &a, &b), hostname_hash("s", &b, &a));
    }

    // ── port range ──────────────────────────────────────

    #[tokio::test]
    async fn test_bind_full_range_uses_os_port() {
        let listener = bind_in_range(0, 65535).await.unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn test_bind_single_port() {
        // Grab an OS port, release it, then demand exactly that one.
        let probe = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        let listener = bind_in_range(port, port).await.unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_bind_occupied_single_port_fails() {
        let holder = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = holder.local_addr().unwrap().port();
        assert!(bind_in_range(port, port).await.is_err());
    }

    // ── handshake over real sockets ─────────────────────

    const HASH: &str = "bef1059fd38e97363e29d756e1592fac657f7738";

    #[tokio::test]
    async fn test_handshake_accepts_matching_hash() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_direct(listener, HASH.to_owned()));

        let mut socket = connect_socks5("127.0.0.1", addr.port(), HASH).await.unwrap();
        let mut accepted = server.await.unwrap().unwrap();

        accepted.write_all(b"payload").await.unwrap();
        accepted.shutdown().await.unwrap();
        let mut received = Vec::new();
        socket.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"payload");
    }

    #[tokio::test]
    async fn test_handshake_refuses_wrong_hash_then_accepts_good_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_direct(listener, HASH.to_owned()));

        // The impostor presents a well-formed CONNECT with a bogus hash.
        let mut impostor = TcpStream::connect(addr).await.unwrap();
        impostor
            .write_all(&AuthRequest::no_auth().to_bytes())
            .await
            .unwrap();
        let auth = AuthResponse::read_from(&mut impostor).await.unwrap();
        assert_eq!(auth.method, NO_AUTH);
        impostor
            .write_all(&SocksRequest::connect_hash(&"deadbeef".repeat(5)).to_bytes())
            .await
            .unwrap();
        let refusal = SocksReply::read_from(&mut impostor).await.unwrap();
        assert_eq!(refusal.status, ReplyStatus::ConnectionRefused);

        // The listener is still alive for the real peer.
        let _socket = connect_socks5("127.0.0.1", addr.port(), HASH).await.unwrap();
        assert!(server.await.unwrap().is_ok());
    }

    // ── full direct transfer over a scripted server ─────

    struct Loopback;

    #[async_trait]
    impl AddressSource for Loopback {
        async fn local_addresses(&self) -> Vec<std::net::IpAddr> {
            vec!["127.0.0.1".parse().unwrap()]
        }
    }

    #[tokio::test]
    async fn test_direct_transfer_end_to_end() {
        use crate::ext::ExtensionRegistry;
        use crate::si::StreamInitiation;
        use crate::testutil::{connect_with_config, extract_attr, test_config};

        let mut config = test_config(0);
        config.file_transfer.address_source = Some(Arc::new(Loopback));
        config.file_transfer.proxy_allowed = false;

        let mut registry = ExtensionRegistry::new();
        let si = Arc::new(StreamInitiation::new());
        let ft = Arc::new(FileTransfer::new(config.file_transfer.clone()));
        let socks5 = Arc::new(Socks5Bytestreams::new(config.file_transfer.clone()));
        registry.register(si).unwrap();
        registry.register(ft.clone()).unwrap();
        registry.register(socks5).unwrap();

        let payload: Vec<u8> = (0..30_000u32).map(|i| (i % 233) as u8).collect();
        let expected = payload.clone();
        let (received_tx, received_rx) = tokio::sync::oneshot::channel();

        let (engine, mut events) = connect_with_config(config, registry, |mut io| async move {
            // Accept the SI offer, choosing SOCKS5.
            let offer = io.expect("</iq>").await;
            let offer_id = extract_attr(&offer, "id").unwrap();
            let accept = crate::si::accept_element(ns::BYTESTREAMS);
            let mut xml = String::new();
            accept.write_xml(&mut xml, ns::CLIENT);
            io.send(&format!("<iq type='result' id='{offer_id}'>{xml}</iq>"))
                .await;

            // Streamhosts offer: connect back to the listed host.
            let streamhosts = io.expect("</iq>").await;
            let hosts_id = extract_attr(&streamhosts, "id").unwrap();
            let sid = extract_attr(&streamhosts, "sid").unwrap();
            let host = extract_attr(&streamhosts, "host").unwrap();
            let port: u16 = extract_attr(&streamhosts, "port").unwrap().parse().unwrap();

            let hash = hostname_hash(
                &sid,
                &"alice@127.0.0.1/test".parse().unwrap(),
                &"bob@127.0.0.1/desk".parse().unwrap(),
            );
            let mut socket = connect_socks5(&host, port, &hash).await.unwrap();
            io.send(&format!(
                "<iq type='result' id='{hosts_id}'>\
                 <query xmlns='http://jabber.org/protocol/bytestreams' sid='{sid}'>\
                 <streamhost-used jid='alice@127.0.0.1/test'/></query></iq>"
            ))
            .await;

            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            let _ = received_tx.send(received);
            io.hold_open().await;
        })
        .await;

        let sid = ft
            .send_stream(
                &jid("bob@127.0.0.1/desk"),
                Box::new(std::io::Cursor::new(payload)),
                "big.bin",
                30_000,
                None,
            )
            .await
            .unwrap();

        loop {
            match events.recv().await {
                Some(Event::FileTransferCompleted { sid: s }) => {
                    assert_eq!(s, sid);
                    break;
                }
                Some(Event::FileTransferAborted { reason, .. }) => {
                    panic!("transfer aborted: {reason}")
                }
                Some(_) => continue,
                None => panic!("event channel closed before completion"),
            }
        }
        assert_eq!(received_rx.await.unwrap(), expected);
        assert_eq!(ft.active_transfers(), 0);
        engine.close().await;
    }

    #[tokio::test]
    async fn test_pump_moves_whole_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_direct(listener, HASH.to_owned()));

        let mut socket = connect_socks5("127.0.0.1", addr.port(), HASH).await.unwrap();
        let mut accepted = server.await.unwrap().unwrap();

        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let session = SiSession::sending(
            "pump".into(),
            jid("a@x/1"),
            jid("b@x/2"),
            "f".into(),
            payload.len() as u64,
            ns::BYTESTREAMS.into(),
            Box::new(std::io::Cursor::new(payload.clone())),
        );
        let engine = EngineHandle::dangling();
        let writer = tokio::spawn(async move {
            Socks5Bytestreams::pump_out(&engine, &session, &mut accepted)
                .await
                .unwrap();
            accepted.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        socket.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, payload);
    }
}
