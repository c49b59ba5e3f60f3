//! Error taxonomy for the engine.
//!
//! Fatal conditions (transport, malformed stream XML, authentication) latch
//! the connection; everything else surfaces to the call that produced it.

use std::fmt;

use thiserror::Error;

use crate::ns;
use crate::xml::Element;

#[derive(Debug, Error)]
pub enum Error {
    /// TCP or socket-level I/O failure. Fatal to the connection.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// TLS negotiation or handshake failure. Fatal.
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// Malformed or unexpected XML on the stream. Fatal.
    #[error("malformed XML stream: {0}")]
    StreamXml(String),

    /// SASL or TLS-policy failure during stream negotiation. Fatal.
    #[error("authentication failed: {0}")]
    Authentication(AuthFailure),

    /// A typed XMPP error returned by the peer. Surfaced to the
    /// originating request, never fatal.
    #[error("XMPP error: {0}")]
    Xmpp(StanzaError),

    /// An IQ request deadline expired.
    #[error("request timed out")]
    Timeout,

    /// The peer does not advertise a required extension.
    #[error("not supported by peer: {0}")]
    NotSupported(&'static str),

    /// API misuse: not connected, already closed, bad arguments.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The stream was closed (locally or by the peer) while the
    /// operation was pending.
    #[error("stream closed")]
    StreamClosed,

    /// The server terminated the stream with `<stream:error>`.
    #[error("stream error from server: {0}")]
    StreamFatal(String),
}

impl Error {
    /// Whether the error tears down the connection when it occurs on the
    /// read loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::Tls(_)
                | Error::StreamXml(_)
                | Error::Authentication(_)
                | Error::StreamClosed
                | Error::StreamFatal(_)
        )
    }
}

/// The specific way stream negotiation was refused.
#[derive(Debug, Error)]
pub enum AuthFailure {
    #[error("server offered no supported SASL mechanism")]
    NoSharedMechanism,

    /// The server marked STARTTLS required but TLS is disabled in the
    /// engine configuration.
    #[error("server requires STARTTLS but TLS is disabled")]
    TlsRequired,

    /// The final SASL server signature did not verify.
    #[error("SASL server signature mismatch")]
    SignatureMismatch,

    /// The caller-supplied certificate validator refused the peer.
    #[error("peer certificate rejected by validator")]
    CertificateRejected,

    /// `<failure>` from the server, with the condition element name.
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// The mechanism received a challenge it cannot answer.
    #[error("malformed SASL challenge: {0}")]
    BadChallenge(String),
}

/// `<error type='…'>` classification from RFC 3920 §9.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Auth,
    Cancel,
    Continue,
    Modify,
    Wait,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Auth => "auth",
            ErrorType::Cancel => "cancel",
            ErrorType::Continue => "continue",
            ErrorType::Modify => "modify",
            ErrorType::Wait => "wait",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "auth" => ErrorType::Auth,
            "cancel" => ErrorType::Cancel,
            "continue" => ErrorType::Continue,
            "modify" => ErrorType::Modify,
            "wait" => ErrorType::Wait,
            _ => return None,
        })
    }
}

/// Defined stanza error conditions (RFC 3920 §9.3.3 subset the engine
/// produces or inspects).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinedCondition {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    InternalServerError,
    ItemNotFound,
    JidMalformed,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    RecipientUnavailable,
    RemoteServerNotFound,
    RemoteServerTimeout,
    ResourceConstraint,
    ServiceUnavailable,
    UndefinedCondition,
    UnexpectedRequest,
}

impl DefinedCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefinedCondition::BadRequest => "bad-request",
            DefinedCondition::Conflict => "conflict",
            DefinedCondition::FeatureNotImplemented => "feature-not-implemented",
            DefinedCondition::Forbidden => "forbidden",
            DefinedCondition::InternalServerError => "internal-server-error",
            DefinedCondition::ItemNotFound => "item-not-found",
            DefinedCondition::JidMalformed => "jid-malformed",
            DefinedCondition::NotAcceptable => "not-acceptable",
            DefinedCondition::NotAllowed => "not-allowed",
            DefinedCondition::NotAuthorized => "not-authorized",
            DefinedCondition::RecipientUnavailable => "recipient-unavailable",
            DefinedCondition::RemoteServerNotFound => "remote-server-not-found",
            DefinedCondition::RemoteServerTimeout => "remote-server-timeout",
            DefinedCondition::ResourceConstraint => "resource-constraint",
            DefinedCondition::ServiceUnavailable => "service-unavailable",
            DefinedCondition::UndefinedCondition => "undefined-condition",
            DefinedCondition::UnexpectedRequest => "unexpected-request",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "bad-request" => DefinedCondition::BadRequest,
            "conflict" => DefinedCondition::Conflict,
            "feature-not-implemented" => DefinedCondition::FeatureNotImplemented,
            "forbidden" => DefinedCondition::Forbidden,
            "internal-server-error" => DefinedCondition::InternalServerError,
            "item-not-found" => DefinedCondition::ItemNotFound,
            "jid-malformed" => DefinedCondition::JidMalformed,
            "not-acceptable" => DefinedCondition::NotAcceptable,
            "not-allowed" => DefinedCondition::NotAllowed,
            "not-authorized" => DefinedCondition::NotAuthorized,
            "recipient-unavailable" => DefinedCondition::RecipientUnavailable,
            "remote-server-not-found" => DefinedCondition::RemoteServerNotFound,
            "remote-server-timeout" => DefinedCondition::RemoteServerTimeout,
            "resource-constraint" => DefinedCondition::ResourceConstraint,
            "service-unavailable" => DefinedCondition::ServiceUnavailable,
            "undefined-condition" => DefinedCondition::UndefinedCondition,
            "unexpected-request" => DefinedCondition::UnexpectedRequest,
            _ => return None,
        })
    }

    /// Default `type` attribute for this condition when building replies.
    pub fn default_type(&self) -> ErrorType {
        match self {
            DefinedCondition::BadRequest | DefinedCondition::JidMalformed => ErrorType::Modify,
            DefinedCondition::NotAcceptable => ErrorType::Modify,
            DefinedCondition::Conflict
            | DefinedCondition::FeatureNotImplemented
            | DefinedCondition::ItemNotFound
            | DefinedCondition::NotAllowed
            | DefinedCondition::RemoteServerNotFound
            | DefinedCondition::ServiceUnavailable
            | DefinedCondition::UndefinedCondition => ErrorType::Cancel,
            DefinedCondition::Forbidden | DefinedCondition::NotAuthorized => ErrorType::Auth,
            DefinedCondition::InternalServerError
            | DefinedCondition::RecipientUnavailable
            | DefinedCondition::RemoteServerTimeout
            | DefinedCondition::ResourceConstraint
            | DefinedCondition::UnexpectedRequest => ErrorType::Wait,
        }
    }
}

/// Typed mirror of a stanza `<error/>` child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    pub error_type: ErrorType,
    pub condition: DefinedCondition,
    pub text: Option<String>,
}

impl StanzaError {
    pub fn new(condition: DefinedCondition) -> Self {
        StanzaError {
            error_type: condition.default_type(),
            condition,
            text: None,
        }
    }

    pub fn with_text(condition: DefinedCondition, text: impl Into<String>) -> Self {
        StanzaError {
            error_type: condition.default_type(),
            condition,
            text: Some(text.into()),
        }
    }

    /// Builds the `<error/>` element carried inside an error stanza.
    pub fn to_element(&self) -> Element {
        let mut error = Element::new("error", ns::CLIENT);
        error.set_attr("type", self.error_type.as_str());
        error.append_child(Element::new(self.condition.as_str(), ns::STANZAS));
        if let Some(text) = &self.text {
            let mut t = Element::new("text", ns::STANZAS);
            t.append_text(text);
            error.append_child(t);
        }
        error
    }

    /// Parses an `<error/>` element; unknown conditions map to
    /// `undefined-condition` so a response is never dropped over an
    /// unrecognized name.
    pub fn from_element(error: &Element) -> Self {
        let error_type = error
            .attr("type")
            .and_then(ErrorType::from_str)
            .unwrap_or(ErrorType::Cancel);
        let mut condition = DefinedCondition::UndefinedCondition;
        let mut text = None;
        for child in error.children() {
            if child.namespace() != ns::STANZAS {
                continue;
            }
            if child.name() == "text" {
                let t = child.text();
                if !t.is_empty() {
                    text = Some(t);
                }
            } else if let Some(c) = DefinedCondition::from_str(child.name()) {
                condition = c;
            }
        }
        StanzaError {
            error_type,
            condition,
            text,
        }
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.condition.as_str(), self.error_type.as_str())?;
        if let Some(text) = &self.text {
            write!(f, ": {text}")?;
        }
        Ok(())
    }
}
