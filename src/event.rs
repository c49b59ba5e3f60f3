//! Events emitted by the engine to the application.
//!
//! Delivered in parse order on a single dispatcher task through the
//! bounded channel returned by [`Engine::connect`](crate::engine::Engine::connect).

use crate::error::Error;
use crate::ext::chatstates::ChatState;
use crate::im::roster::RosterItem;
use crate::im::Status;
use crate::jid::Jid;
use crate::stanza::{Message, Presence};

#[derive(Debug)]
pub enum Event {
    /// Stream negotiation finished; `jid` is the server-assigned full JID.
    Connected { jid: Jid },
    /// The stream is gone. Raised once, after the fatal error if any.
    Disconnected,
    /// A fatal stream error was latched.
    Error(Error),

    /// A message that no input filter claimed.
    Message(Message),
    /// A presence that no input filter claimed (probes, errors).
    Presence(Presence),

    /// A peer's availability or status text changed.
    StatusChanged { from: Jid, status: Status },
    /// The peer accepted our subscription request.
    SubscriptionApproved { from: Jid },
    /// The peer refused or revoked our subscription.
    SubscriptionRefused { from: Jid },
    /// The peer unsubscribed from our presence.
    Unsubscribed { from: Jid },
    /// A roster push changed or added an item.
    RosterUpdated { item: RosterItem },
    /// A roster push removed an item.
    RosterItemRemoved { jid: Jid },

    /// XEP-0085 chat state from a peer.
    ChatState { from: Jid, state: ChatState },

    /// Bytes moved on a file transfer; `transferred` is monotonic.
    FileTransferProgress {
        sid: String,
        transferred: u64,
        total: u64,
    },
    /// A transfer reached its full size.
    FileTransferCompleted { sid: String },
    /// A transfer ended before its full size.
    FileTransferAborted { sid: String, reason: String },
}
