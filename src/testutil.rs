//! Shared fake-server plumbing for engine-level tests.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::config::{CertValidator, Config, FileTransferConfig};
use crate::engine::Engine;
use crate::event::Event;
use crate::ext::ExtensionRegistry;

pub const SERVER_HEADER: &str = "<?xml version='1.0'?>\
    <stream:stream xmlns='jabber:client' \
    xmlns:stream='http://etherx.jabber.org/streams' \
    from='127.0.0.1' id='t1' xml:lang='en' version='1.0'>";

/// Installs a per-test-binary tracing subscriber honoring `RUST_LOG`.
/// `try_init` keeps repeated calls from panicking.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn test_config(port: u16) -> Config {
    Config {
        hostname: "127.0.0.1".into(),
        port,
        username: "alice".into(),
        password: "s3cret".into(),
        resource: Some("test".into()),
        tls: false,
        cert_validator: CertValidator::default(),
        file_transfer: FileTransferConfig::default(),
    }
}

/// Server-side socket with a residual buffer, so a marker read never
/// swallows stanzas that arrived in the same TCP segment.
pub struct ScriptIo {
    socket: TcpStream,
    buffer: String,
}

impl ScriptIo {
    pub fn new(socket: TcpStream) -> Self {
        ScriptIo {
            socket,
            buffer: String::new(),
        }
    }

    /// Reads until `marker` is buffered, consumes through its end and
    /// returns the consumed prefix. Bytes beyond the marker stay queued.
    pub async fn expect(&mut self, marker: &str) -> String {
        let mut buf = vec![0u8; 8192];
        loop {
            if let Some(pos) = self.buffer.find(marker) {
                let end = pos + marker.len();
                let consumed = self.buffer[..end].to_owned();
                self.buffer.drain(..end);
                return consumed;
            }
            let n = tokio::time::timeout(Duration::from_secs(5), self.socket.read(&mut buf))
                .await
                .expect("server read timeout")
                .expect("server read");
            assert!(n > 0, "client closed while waiting for {marker}");
            self.buffer.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    pub async fn send(&mut self, xml: &str) {
        self.socket.write_all(xml.as_bytes()).await.expect("server write");
    }

    /// Keeps the server side open until the client goes away.
    pub async fn hold_open(&mut self) {
        let mut buf = vec![0u8; 4096];
        while let Ok(n) = self.socket.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    }
}

pub fn extract_attr(xml: &str, attr: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        let pattern = format!("{attr}={quote}");
        if let Some(start) = xml.find(&pattern) {
            let after = &xml[start + pattern.len()..];
            if let Some(end) = after.find(quote) {
                return Some(after[..end].to_owned());
            }
        }
    }
    None
}

/// Plays the server side of a plaintext PLAIN login up to resource
/// binding, then hands the buffered socket to `script`.
pub async fn fake_server<F, Fut>(listener: TcpListener, script: F)
where
    F: FnOnce(ScriptIo) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let (socket, _) = listener.accept().await.expect("accept");
    let mut io = ScriptIo::new(socket);

    io.expect("version='1.0'>").await;
    io.send(&format!(
        "{SERVER_HEADER}<stream:features>\
         <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
         <mechanism>PLAIN</mechanism></mechanisms>\
         </stream:features>"
    ))
    .await;

    io.expect("</auth>").await;
    io.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
        .await;

    io.expect("version='1.0'>").await;
    io.send(&format!(
        "{SERVER_HEADER}<stream:features>\
         <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
         </stream:features>"
    ))
    .await;

    let bind = io.expect("</iq>").await;
    let id = extract_attr(&bind, "id").unwrap();
    io.send(&format!(
        "<iq type='result' id='{id}'>\
         <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
         <jid>alice@127.0.0.1/test</jid></bind></iq>"
    ))
    .await;

    script(io).await;
}

/// Connects an engine with the given registry against a scripted server.
pub async fn connect_with<F, Fut>(
    registry: ExtensionRegistry,
    script: F,
) -> (Engine, mpsc::Receiver<Event>)
where
    F: FnOnce(ScriptIo) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    connect_with_config(test_config(0), registry, script).await
}

/// Like [`connect_with`], with a caller-tuned config. The config's port
/// is replaced by the scripted listener's.
pub async fn connect_with_config<F, Fut>(
    mut config: Config,
    registry: ExtensionRegistry,
    script: F,
) -> (Engine, mpsc::Receiver<Event>)
where
    F: FnOnce(ScriptIo) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    config.port = listener.local_addr().unwrap().port();
    tokio::spawn(fake_server(listener, script));
    Engine::connect(config, registry).await.expect("connect")
}
