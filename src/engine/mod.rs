//! The stream engine: transport ownership, stream negotiation, stanza
//! routing and IQ correlation.
//!
//! One reader task owns the XML parser; one dispatcher task owns the
//! stanza FIFO and runs input filters, so handlers can treat themselves
//! as single-threaded. IQ responses bypass the dispatcher and complete
//! their waiters directly, which keeps request/response latency
//! independent of unrelated traffic. Writes serialize through a mutex on
//! the byte sink.

pub mod sasl;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AuthFailure, DefinedCondition, Error, StanzaError};
use crate::event::Event;
use crate::ext::{ExtensionRegistry, FilterOutcome};
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Iq, Message, Presence, Stanza};
use crate::xml::parser::stream_open_xml;
use crate::xml::{Element, XmlStream};

/// Default deadline for blocking IQ requests.
pub const DEFAULT_IQ_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection lifecycle. The intermediate states exist only while
/// [`Engine::connect`] is in flight; an established engine reports
/// `SessionEstablished` until it is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Disconnected,
    Connecting,
    StreamOpen,
    TlsNegotiating,
    SaslAuthenticating,
    ResourceBinding,
    SessionEstablished,
}

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type IqCallback = Box<dyn FnOnce(Result<Iq, Error>) + Send + Sync>;

/// Serializes a stanza for the wire, where `jabber:client` is the
/// inherited default namespace.
fn wire_xml(element: &Element) -> String {
    let mut out = String::new();
    element.write_xml(&mut out, ns::CLIENT);
    out
}

pub(crate) struct EngineInner {
    config: Config,
    registry: ExtensionRegistry,
    state: StdMutex<EngineState>,
    writer: TokioMutex<Option<BoxWriter>>,
    pending: dashmap::DashMap<String, oneshot::Sender<Iq>>,
    callbacks: dashmap::DashMap<String, IqCallback>,
    next_id: AtomicU64,
    events: mpsc::Sender<Event>,
    jid: StdRwLock<Option<Jid>>,
    server_lang: StdRwLock<Option<String>>,
    encrypted: AtomicBool,
    closed: AtomicBool,
}

impl EngineInner {
    fn fresh_id(&self) -> String {
        format!("fx-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock().expect("state lock") = state;
    }

    pub(crate) fn state(&self) -> EngineState {
        *self.state.lock().expect("state lock")
    }

    pub(crate) fn jid(&self) -> Option<Jid> {
        self.jid.read().expect("jid lock").clone()
    }

    pub(crate) fn server_lang(&self) -> Option<String> {
        self.server_lang.read().expect("lang lock").clone()
    }

    pub(crate) fn is_encrypted(&self) -> bool {
        self.encrypted.load(Ordering::Relaxed)
    }

    pub(crate) async fn emit(&self, event: Event) {
        let _ = self.events.send(event).await;
    }

    async fn write_raw(&self, xml: &str) -> Result<(), Error> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::StreamClosed)?;
        writer.write_all(xml.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    pub(crate) async fn send_message(&self, mut message: Message) -> Result<(), Error> {
        for extension in self.registry.iter() {
            extension.filter_message_out(&mut message);
        }
        self.write_raw(&wire_xml(message.element())).await
    }

    pub(crate) async fn send_presence(&self, mut presence: Presence) -> Result<(), Error> {
        for extension in self.registry.iter() {
            extension.filter_presence_out(&mut presence);
        }
        self.write_raw(&wire_xml(presence.element())).await
    }

    /// Sends an IQ without registering a waiter; used for responses.
    pub(crate) async fn send_iq(&self, mut iq: Iq) -> Result<(), Error> {
        for extension in self.registry.iter() {
            extension.filter_iq_out(&mut iq);
        }
        self.write_raw(&wire_xml(iq.element())).await
    }

    /// Sends a request and blocks the caller on a one-shot completion,
    /// released by the reader, the timeout, or stream teardown.
    pub(crate) async fn iq_request(
        &self,
        mut iq: Iq,
        timeout: Duration,
    ) -> Result<Iq, Error> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::StreamClosed);
        }
        let id = self.fresh_id();
        iq.set_id(&id);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        for extension in self.registry.iter() {
            extension.filter_iq_out(&mut iq);
        }
        if let Err(e) = self.write_raw(&wire_xml(iq.element())).await {
            self.pending.remove(&id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.pending.remove(&id);
                Err(Error::Timeout)
            }
            Ok(Err(_)) => Err(Error::StreamClosed),
            Ok(Ok(response)) => response.into_response_result(),
        }
    }

    /// Sends a request with a completion callback instead of a waiter.
    /// The callback fires on the reader task; keep it short.
    pub(crate) async fn iq_request_callback(
        &self,
        mut iq: Iq,
        callback: IqCallback,
    ) -> Result<String, Error> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::StreamClosed);
        }
        let id = self.fresh_id();
        iq.set_id(&id);
        self.callbacks.insert(id.clone(), callback);
        for extension in self.registry.iter() {
            extension.filter_iq_out(&mut iq);
        }
        if let Err(e) = self.write_raw(&wire_xml(iq.element())).await {
            self.callbacks.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Wakes every pending waiter and callback with `StreamClosed`.
    fn release_pending(&self) {
        self.pending.clear();
        let ids: Vec<String> = self.callbacks.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, callback)) = self.callbacks.remove(&id) {
                callback(Err(Error::StreamClosed));
            }
        }
    }

    /// Latches a fatal error: one `Error` event, waiters released,
    /// transport forgotten.
    async fn shutdown_with(&self, error: Error) {
        let already_closed = self.closed.swap(true, Ordering::SeqCst);
        self.set_state(EngineState::Disconnected);
        self.release_pending();
        {
            let mut guard = self.writer.lock().await;
            if let Some(writer) = guard.as_mut() {
                let _ = writer.shutdown().await;
            }
            *guard = None;
        }
        if !already_closed {
            if !matches!(error, Error::StreamClosed) {
                self.emit(Event::Error(error)).await;
            }
            self.emit(Event::Disconnected).await;
        }
    }

    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(EngineState::Disconnected);
        {
            let mut guard = self.writer.lock().await;
            if let Some(writer) = guard.as_mut() {
                let _ = writer.write_all(b"</stream:stream>").await;
                let _ = writer.flush().await;
                let _ = writer.shutdown().await;
            }
            *guard = None;
        }
        self.release_pending();
        self.emit(Event::Disconnected).await;
    }
}

/// A cheap, clonable reference to a live engine, handed to extensions.
/// Every call fails with `InvalidState` once the engine is gone.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Weak<EngineInner>,
}

impl EngineHandle {
    /// A handle bound to no engine; every call fails. Test plumbing for
    /// filters that only observe.
    #[cfg(test)]
    pub(crate) fn dangling() -> EngineHandle {
        EngineHandle { inner: Weak::new() }
    }

    fn upgrade(&self) -> Result<Arc<EngineInner>, Error> {
        self.inner
            .upgrade()
            .ok_or(Error::InvalidState("engine disconnected"))
    }

    pub fn jid(&self) -> Result<Option<Jid>, Error> {
        Ok(self.upgrade()?.jid())
    }

    pub fn config(&self) -> Result<Config, Error> {
        Ok(self.upgrade()?.config.clone())
    }

    pub fn server_lang(&self) -> Option<String> {
        self.inner.upgrade().and_then(|i| i.server_lang())
    }

    pub async fn emit(&self, event: Event) {
        if let Some(inner) = self.inner.upgrade() {
            inner.emit(event).await;
        }
    }

    pub async fn send_message(&self, message: Message) -> Result<(), Error> {
        self.upgrade()?.send_message(message).await
    }

    pub async fn send_presence(&self, presence: Presence) -> Result<(), Error> {
        self.upgrade()?.send_presence(presence).await
    }

    pub async fn send_iq(&self, iq: Iq) -> Result<(), Error> {
        self.upgrade()?.send_iq(iq).await
    }

    /// Blocking request with the default deadline.
    pub async fn request(&self, iq: Iq) -> Result<Iq, Error> {
        self.upgrade()?.iq_request(iq, DEFAULT_IQ_TIMEOUT).await
    }

    pub async fn request_with_timeout(&self, iq: Iq, timeout: Duration) -> Result<Iq, Error> {
        self.upgrade()?.iq_request(iq, timeout).await
    }

    pub async fn request_with_callback(
        &self,
        iq: Iq,
        callback: impl FnOnce(Result<Iq, Error>) + Send + Sync + 'static,
    ) -> Result<String, Error> {
        self.upgrade()?
            .iq_request_callback(iq, Box::new(callback))
            .await
    }

    pub async fn close(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.close().await;
        }
    }
}

/// The established XMPP connection.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Connects, negotiates TLS and SASL, binds a resource, establishes
    /// the session, spawns the reader and dispatcher tasks and runs every
    /// extension's `initialize` hook.
    pub async fn connect(
        config: Config,
        registry: ExtensionRegistry,
    ) -> Result<(Engine, mpsc::Receiver<Event>), Error> {
        config.validate()?;

        let address = format!("{}:{}", config.hostname, config.port);
        info!("connecting to {address}");
        let tcp = TcpStream::connect(&address).await?;
        debug!("TCP connected");

        let (read_half, write_half) = tcp.into_split();
        let mut stream = XmlStream::new(read_half);
        let mut writer = write_half;

        // Plaintext stream open.
        writer
            .write_all(stream_open_xml(&config.hostname).as_bytes())
            .await?;
        writer.flush().await?;
        let header = stream.read_header().await?;
        let mut server_lang = header.lang;
        let features = expect_features(&mut stream).await?;

        // STARTTLS decision.
        let starttls = features.child("starttls", ns::TLS);
        let tls_required = starttls
            .map(|s| s.child("required", ns::TLS).is_some())
            .unwrap_or(false);
        if tls_required && !config.tls {
            return Err(Error::Authentication(AuthFailure::TlsRequired));
        }

        let session = if config.tls && starttls.is_some() {
            writer
                .write_all(Element::new("starttls", ns::TLS).to_xml().as_bytes())
                .await?;
            writer.flush().await?;
            let reply = stream.next_element().await?;
            if !reply.is("proceed", ns::TLS) {
                return Err(Error::Authentication(AuthFailure::Rejected(
                    "starttls refused".into(),
                )));
            }
            debug!("STARTTLS proceed, upgrading");

            let tcp = stream
                .into_inner()
                .reunite(writer)
                .map_err(|_| Error::InvalidState("mismatched stream halves"))?;
            // Chain and hostname checks are turned off here; acceptance
            // is decided by the configured validator below.
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()?;
            let connector = tokio_native_tls::TlsConnector::from(connector);
            let tls = connector
                .connect(&config.hostname, tcp)
                .await
                .map_err(Error::Tls)?;

            // Validation is delegated to the configured callback.
            if let Ok(Some(certificate)) = tls.get_ref().peer_certificate() {
                if let Ok(der) = certificate.to_der() {
                    if !config.cert_validator.validate(&der) {
                        return Err(Error::Authentication(AuthFailure::CertificateRejected));
                    }
                }
            }
            info!("TLS established");

            let (tls_read, tls_write) = tokio::io::split(tls);
            establish(XmlStream::new(tls_read), tls_write, None, &config).await?
        } else {
            establish(stream, writer, Some(features), &config).await?
        };

        let encrypted = session.encrypted;
        if session.lang.is_some() {
            server_lang = session.lang.clone();
        }
        let jid = session.jid.clone();
        info!("bound as {jid}");

        let (event_tx, event_rx) = mpsc::channel(100);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(100);

        let inner = Arc::new(EngineInner {
            config,
            registry,
            state: StdMutex::new(EngineState::SessionEstablished),
            writer: TokioMutex::new(Some(session.writer)),
            pending: dashmap::DashMap::new(),
            callbacks: dashmap::DashMap::new(),
            next_id: AtomicU64::new(0),
            events: event_tx,
            jid: StdRwLock::new(Some(jid.clone())),
            server_lang: StdRwLock::new(server_lang),
            encrypted: AtomicBool::new(encrypted),
            closed: AtomicBool::new(false),
        });

        match session.stream {
            SessionStream::Tls(stream) => {
                tokio::spawn(read_loop(inner.clone(), stream, dispatch_tx));
            }
            SessionStream::Plain(stream) => {
                tokio::spawn(read_loop(inner.clone(), stream, dispatch_tx));
            }
        }

        // Extensions initialize before the dispatcher starts draining,
        // so no stanza can reach a half-wired filter chain. Inbound
        // traffic buffers in the dispatch queue meanwhile; IQ responses
        // are matched by the reader and keep flowing.
        let engine = Engine { inner };
        let handle = engine.handle();
        for extension in engine.inner.registry.iter() {
            extension
                .initialize(&handle, &engine.inner.registry)
                .await?;
        }
        tokio::spawn(dispatch_loop(engine.inner.clone(), dispatch_rx));

        engine.inner.emit(Event::Connected { jid }).await;
        Ok((engine, event_rx))
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The server-assigned full JID.
    pub fn jid(&self) -> Option<Jid> {
        self.inner.jid()
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.is_encrypted()
    }

    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    /// Server default language from the stream header.
    pub fn server_lang(&self) -> Option<String> {
        self.inner.server_lang()
    }

    pub async fn send_message(&self, message: Message) -> Result<(), Error> {
        self.inner.send_message(message).await
    }

    pub async fn send_presence(&self, presence: Presence) -> Result<(), Error> {
        self.inner.send_presence(presence).await
    }

    pub async fn send_iq(&self, iq: Iq) -> Result<(), Error> {
        self.inner.send_iq(iq).await
    }

    pub async fn iq_request(&self, iq: Iq, timeout: Duration) -> Result<Iq, Error> {
        self.inner.iq_request(iq, timeout).await
    }

    /// Sends `</stream:stream>`, wakes IQ waiters with `StreamClosed`,
    /// cancels the dispatcher and tears down the transport.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}

// ── negotiation ──────────────────────────────────────────

enum SessionStream {
    Tls(XmlStream<tokio::io::ReadHalf<tokio_native_tls::TlsStream<TcpStream>>>),
    Plain(XmlStream<tokio::net::tcp::OwnedReadHalf>),
}

struct EstablishedSession {
    stream: SessionStream,
    writer: BoxWriter,
    jid: Jid,
    lang: Option<String>,
    encrypted: bool,
}

trait IntoSessionStream {
    fn into_session_stream(stream: XmlStream<Self>) -> SessionStream
    where
        Self: Sized;
    const ENCRYPTED: bool;
}

impl IntoSessionStream for tokio::io::ReadHalf<tokio_native_tls::TlsStream<TcpStream>> {
    fn into_session_stream(stream: XmlStream<Self>) -> SessionStream {
        SessionStream::Tls(stream)
    }
    const ENCRYPTED: bool = true;
}

impl IntoSessionStream for tokio::net::tcp::OwnedReadHalf {
    fn into_session_stream(stream: XmlStream<Self>) -> SessionStream {
        SessionStream::Plain(stream)
    }
    const ENCRYPTED: bool = false;
}

/// SASL, stream restart, resource binding and session establishment over
/// an already-secured (or knowingly plaintext) transport.
async fn establish<R, W>(
    mut stream: XmlStream<R>,
    mut writer: W,
    features: Option<Element>,
    config: &Config,
) -> Result<EstablishedSession, Error>
where
    R: AsyncRead + Send + Unpin + IntoSessionStream + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut lang = None;

    let features = match features {
        Some(features) => features,
        None => {
            writer
                .write_all(stream_open_xml(&config.hostname).as_bytes())
                .await?;
            writer.flush().await?;
            let header = stream.read_header().await?;
            lang = header.lang;
            expect_features(&mut stream).await?
        }
    };

    // SASL.
    let mechanisms: Vec<String> = features
        .child("mechanisms", ns::SASL)
        .map(|m| {
            m.children()
                .filter(|c| c.is("mechanism", ns::SASL))
                .map(|c| c.text().trim().to_owned())
                .collect()
        })
        .unwrap_or_default();
    if mechanisms.is_empty() {
        return Err(Error::Authentication(AuthFailure::NoSharedMechanism));
    }
    sasl::authenticate(
        &mut stream,
        &mut writer,
        &mechanisms,
        &config.username,
        &config.password,
        &config.hostname,
    )
    .await?;

    // Stream restart after authentication.
    let mut stream = XmlStream::new(stream.into_inner());
    writer
        .write_all(stream_open_xml(&config.hostname).as_bytes())
        .await?;
    writer.flush().await?;
    let header = stream.read_header().await?;
    if header.lang.is_some() {
        lang = header.lang;
    }
    let features = expect_features(&mut stream).await?;

    // Resource binding.
    let mut bind = Element::new("bind", ns::BIND);
    if let Some(resource) = &config.resource {
        bind.append_child(Element::new("resource", ns::BIND).with_text(resource));
    }
    let response = request_iq(&mut stream, &mut writer, Iq::set(bind), "fx-bind").await?;
    let jid_text = response
        .payload()
        .and_then(|b| b.child("jid", ns::BIND))
        .map(|j| j.text())
        .ok_or_else(|| Error::StreamXml("bind response without jid".into()))?;
    let jid: Jid = jid_text.trim().parse()?;

    // Legacy session establishment, when offered.
    if features.child("session", ns::SESSION).is_some() {
        request_iq(
            &mut stream,
            &mut writer,
            Iq::set(Element::new("session", ns::SESSION)),
            "fx-session",
        )
        .await?;
    }

    Ok(EstablishedSession {
        stream: R::into_session_stream(stream),
        writer: Box::new(writer),
        jid,
        lang,
        encrypted: R::ENCRYPTED,
    })
}

async fn expect_features<R: AsyncRead + Unpin>(
    stream: &mut XmlStream<R>,
) -> Result<Element, Error> {
    let element = stream.next_element().await?;
    if !element.is("features", ns::STREAM) {
        return Err(Error::StreamXml(format!(
            "expected stream features, got <{}>",
            element.name()
        )));
    }
    Ok(element)
}

/// Synchronous request/response during negotiation, before the reader
/// task exists. Unrelated early traffic is skipped.
async fn request_iq<R, W>(
    stream: &mut XmlStream<R>,
    writer: &mut W,
    mut iq: Iq,
    id: &str,
) -> Result<Iq, Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    iq.set_id(id);
    writer.write_all(wire_xml(iq.element()).as_bytes()).await?;
    writer.flush().await?;
    loop {
        let element = stream.next_element().await?;
        match Stanza::from_element(element) {
            Ok(Stanza::Iq(response))
                if response.id() == Some(id) && !response.iq_type().is_request() =>
            {
                return response.into_response_result();
            }
            _ => debug!("skipping early traffic during negotiation"),
        }
    }
}

// ── steady-state tasks ───────────────────────────────────

/// The reader task: owns the parser, completes IQ waiters in-line and
/// feeds everything else to the dispatcher in parse order.
async fn read_loop<R: AsyncRead + Send + Unpin + 'static>(
    inner: Arc<EngineInner>,
    mut stream: XmlStream<R>,
    dispatch_tx: mpsc::Sender<Stanza>,
) {
    loop {
        match stream.next_element().await {
            Ok(element) => match Stanza::from_element(element) {
                Ok(Stanza::Iq(iq)) if !iq.iq_type().is_request() => {
                    let id = iq.id().unwrap_or_default().to_owned();
                    if let Some((_, waiter)) = inner.pending.remove(&id) {
                        let _ = waiter.send(iq);
                    } else if let Some((_, callback)) = inner.callbacks.remove(&id) {
                        callback(iq.into_response_result());
                    } else {
                        debug!("dropping IQ response with no pending request (id={id})");
                    }
                }
                Ok(stanza) => {
                    if dispatch_tx.send(stanza).await.is_err() {
                        break;
                    }
                }
                Err(element) => {
                    warn!("ignoring non-stanza element <{}>", element.name());
                }
            },
            Err(error) => {
                inner.shutdown_with(error).await;
                break;
            }
        }
    }
    inner.release_pending();
}

/// The dispatcher task: runs input filters in registration order; the
/// first `Handled` wins. Unhandled IQ requests get `service-unavailable`;
/// unhandled messages and presences surface as events.
async fn dispatch_loop(inner: Arc<EngineInner>, mut dispatch_rx: mpsc::Receiver<Stanza>) {
    let handle = EngineHandle {
        inner: Arc::downgrade(&inner),
    };
    while let Some(stanza) = dispatch_rx.recv().await {
        match stanza {
            Stanza::Iq(iq) => {
                let mut handled = false;
                for extension in inner.registry.iter() {
                    match extension.filter_iq(&handle, &iq).await {
                        Ok(FilterOutcome::Handled) => {
                            handled = true;
                            break;
                        }
                        Ok(FilterOutcome::Pass) => {}
                        Err(e) => warn!("extension {} iq filter failed: {e}", extension.id()),
                    }
                }
                if !handled && iq.iq_type().is_request() {
                    let reply = Iq::error_reply(
                        &iq,
                        StanzaError::new(DefinedCondition::ServiceUnavailable),
                    );
                    if let Err(e) = inner.send_iq(reply).await {
                        debug!("could not send fallback error reply: {e}");
                    }
                }
            }
            Stanza::Message(message) => {
                let mut handled = false;
                for extension in inner.registry.iter() {
                    match extension.filter_message(&handle, &message).await {
                        Ok(FilterOutcome::Handled) => {
                            handled = true;
                            break;
                        }
                        Ok(FilterOutcome::Pass) => {}
                        Err(e) => warn!("extension {} message filter failed: {e}", extension.id()),
                    }
                }
                if !handled {
                    inner.emit(Event::Message(message)).await;
                }
            }
            Stanza::Presence(presence) => {
                let mut handled = false;
                for extension in inner.registry.iter() {
                    match extension.filter_presence(&handle, &presence).await {
                        Ok(FilterOutcome::Handled) => {
                            handled = true;
                            break;
                        }
                        Ok(FilterOutcome::Pass) => {}
                        Err(e) => warn!("extension {} presence filter failed: {e}", extension.id()),
                    }
                }
                if !handled {
                    inner.emit(Event::Presence(presence)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{connect_with, extract_attr, ScriptIo};

    async fn connect_pair<F, Fut>(script: F) -> (Engine, mpsc::Receiver<Event>)
    where
        F: FnOnce(ScriptIo) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        connect_with(ExtensionRegistry::new(), script).await
    }

    #[tokio::test]
    async fn test_connect_binds_and_reports_jid() {
        let (engine, mut events) = connect_pair(|mut io| async move {
            io.hold_open().await;
        })
        .await;
        assert_eq!(engine.jid().unwrap().to_string(), "alice@127.0.0.1/test");
        assert!(!engine.is_encrypted());
        assert_eq!(engine.state(), EngineState::SessionEstablished);
        assert_eq!(engine.server_lang().as_deref(), Some("en"));
        match events.recv().await {
            Some(Event::Connected { jid }) => {
                assert_eq!(jid.to_string(), "alice@127.0.0.1/test")
            }
            other => panic!("expected Connected, got {other:?}"),
        }
        engine.close().await;
    }

    #[tokio::test]
    async fn test_iq_request_gets_matching_response() {
        let (engine, _events) = connect_pair(|mut io| async move {
            let request = io.expect("</iq>").await;
            let id = extract_attr(&request, "id").unwrap();
            // An unrelated message first: the waiter must not see it.
            io.send("<message from='x@y'><body>noise</body></message>")
                .await;
            io.send(&format!(
                "<iq type='result' id='{id}'>\
                 <query xmlns='jabber:iq:roster'/></iq>"
            ))
            .await;
            io.hold_open().await;
        })
        .await;

        let response = engine
            .iq_request(
                Iq::get(Element::new("query", ns::ROSTER)),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(response.payload().unwrap().is("query", ns::ROSTER));
        engine.close().await;
    }

    #[tokio::test]
    async fn test_iq_error_response_surfaces_to_caller() {
        let (engine, _events) = connect_pair(|mut io| async move {
            let request = io.expect("</iq>").await;
            let id = extract_attr(&request, "id").unwrap();
            io.send(&format!(
                "<iq type='error' id='{id}'><error type='cancel'>\
                 <item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
                 </error></iq>"
            ))
            .await;
            io.hold_open().await;
        })
        .await;

        match engine
            .iq_request(
                Iq::get(Element::new("query", ns::ROSTER)),
                Duration::from_secs(5),
            )
            .await
        {
            Err(Error::Xmpp(e)) => assert_eq!(e.condition, DefinedCondition::ItemNotFound),
            other => panic!("expected Xmpp error, got {other:?}"),
        }
        engine.close().await;
    }

    #[tokio::test]
    async fn test_iq_timeout_removes_pending_entry() {
        let (engine, _events) = connect_pair(|mut io| async move {
            // Swallow the request, never answer.
            io.hold_open().await;
        })
        .await;

        let result = engine
            .iq_request(
                Iq::get(Element::new("query", ns::ROSTER)),
                Duration::from_millis(100),
            )
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(engine.inner.pending.is_empty());
        engine.close().await;
    }

    #[tokio::test]
    async fn test_close_releases_pending_waiters() {
        let (engine, _events) = connect_pair(|mut io| async move {
            io.hold_open().await;
        })
        .await;

        let handle = engine.handle();
        let waiter = tokio::spawn(async move {
            handle
                .request_with_timeout(
                    Iq::get(Element::new("query", ns::ROSTER)),
                    Duration::from_secs(30),
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.close().await;
        match waiter.await.unwrap() {
            Err(Error::StreamClosed) => {}
            other => panic!("expected StreamClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unhandled_iq_request_answered_service_unavailable() {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (engine, _events) = connect_pair(|mut io| async move {
            io.send(
                "<iq type='get' id='p1' from='peer@127.0.0.1/x'>\
                 <ping xmlns='urn:xmpp:ping'/></iq>",
            )
            .await;
            let response = io.expect("</iq>").await;
            let _ = reply_tx.send(response);
            io.hold_open().await;
        })
        .await;

        let response = reply_rx.await.unwrap();
        assert!(response.contains("type='error'"));
        assert!(response.contains("service-unavailable"));
        assert!(response.contains("id='p1'"));
        engine.close().await;
    }

    #[tokio::test]
    async fn test_stream_close_from_server_emits_disconnected() {
        let (_engine, mut events) = connect_pair(|mut io| async move {
            io.send("</stream:stream>").await;
        })
        .await;

        // First event is Connected, then Disconnected from the reader.
        loop {
            match events.recv().await {
                Some(Event::Connected { .. }) => continue,
                Some(Event::Disconnected) => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_unmatched_iq_response_dropped() {
        let (engine, mut events) = connect_pair(|mut io| async move {
            io.send("<iq type='result' id='nobody-waiting'/>").await;
            io.send("<message from='x@y'><body>after</body></message>")
                .await;
            io.hold_open().await;
        })
        .await;

        // The orphaned response produces no event; the message does.
        loop {
            match events.recv().await {
                Some(Event::Connected { .. }) => continue,
                Some(Event::Message(m)) => {
                    assert_eq!(m.body(None).as_deref(), Some("after"));
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        engine.close().await;
    }

    #[test]
    fn test_wire_xml_elides_client_namespace() {
        let iq = Iq::get(Element::new("query", ns::ROSTER));
        let xml = wire_xml(iq.element());
        assert!(xml.starts_with("<iq "));
        assert!(!xml.contains("xmlns='jabber:client'"));
        assert!(xml.contains("<query xmlns='jabber:iq:roster'/>"));
    }

    #[test]
    fn test_fresh_ids_are_unique_and_increasing() {
        let counter = AtomicU64::new(0);
        let a = format!("fx-{}", counter.fetch_add(1, Ordering::Relaxed) + 1);
        let b = format!("fx-{}", counter.fetch_add(1, Ordering::Relaxed) + 1);
        assert_ne!(a, b);
        assert_eq!(a, "fx-1");
        assert_eq!(b, "fx-2");
    }
}
