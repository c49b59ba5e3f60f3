//! XEP-0085 chat state notifications.
//!
//! Inbound states surface as [`Event::ChatState`]; bodyless carrier
//! messages are swallowed so they never reach the application as chat
//! messages. Outbound chat messages get an `<active/>` marker appended
//! when the sender has not set a state explicitly.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::EngineHandle;
use crate::error::Error;
use crate::event::Event;
use crate::ext::{Extension, FilterOutcome};
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Message, MessageType};
use crate::xml::Element;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    Active,
    Composing,
    Paused,
    Inactive,
    Gone,
}

impl ChatState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatState::Active => "active",
            ChatState::Composing => "composing",
            ChatState::Paused => "paused",
            ChatState::Inactive => "inactive",
            ChatState::Gone => "gone",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "active" => ChatState::Active,
            "composing" => ChatState::Composing,
            "paused" => ChatState::Paused,
            "inactive" => ChatState::Inactive,
            "gone" => ChatState::Gone,
            _ => return None,
        })
    }
}

/// Reads the chat state child of a message, if any.
pub fn state_of(message: &Message) -> Option<ChatState> {
    message
        .element()
        .child_in_ns(ns::CHATSTATES)
        .and_then(|c| ChatState::from_str(c.name()))
}

/// Attaches a chat state to a message, replacing any existing one.
pub fn set_state(message: &mut Message, state: ChatState) {
    let element = message.element_mut();
    while element.child_in_ns(ns::CHATSTATES).is_some() {
        let name = element
            .child_in_ns(ns::CHATSTATES)
            .map(|c| c.name().to_owned())
            .unwrap_or_default();
        element.remove_child(&name, ns::CHATSTATES);
    }
    element.append_child(Element::new(state.as_str(), ns::CHATSTATES));
}

#[derive(Default)]
pub struct ChatStates;

impl ChatStates {
    pub fn new() -> Self {
        ChatStates
    }

    /// Sends a standalone chat state notification to `to`.
    pub async fn send_state(
        &self,
        engine: &EngineHandle,
        to: &Jid,
        state: ChatState,
    ) -> Result<(), Error> {
        let mut message = Message::new(MessageType::Chat);
        message.set_to(Some(to));
        set_state(&mut message, state);
        engine.send_message(message).await
    }
}

#[async_trait]
impl Extension for ChatStates {
    fn id(&self) -> &'static str {
        "chatstates"
    }

    fn namespaces(&self) -> &'static [&'static str] {
        &[ns::CHATSTATES]
    }

    async fn filter_message(
        &self,
        engine: &EngineHandle,
        message: &Message,
    ) -> Result<FilterOutcome, Error> {
        let Some(state) = state_of(message) else {
            return Ok(FilterOutcome::Pass);
        };
        if let Some(from) = message.from() {
            engine.emit(Event::ChatState { from, state }).await;
        }
        // A chat state riding on a body message must not consume it.
        if message.body(None).is_some() {
            return Ok(FilterOutcome::Pass);
        }
        Ok(FilterOutcome::Handled)
    }

    fn filter_message_out(&self, message: &mut Message) {
        // Outgoing chat messages with a body advertise `<active/>`.
        if message.message_type() == MessageType::Chat
            && message.body(None).is_some()
            && state_of(message).is_none()
        {
            set_state(message, ChatState::Active);
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            ChatState::Active,
            ChatState::Composing,
            ChatState::Paused,
            ChatState::Inactive,
            ChatState::Gone,
        ] {
            assert_eq!(ChatState::from_str(state.as_str()), Some(state));
        }
    }

    #[test]
    fn test_set_state_replaces_existing() {
        let mut message = Message::new(MessageType::Chat);
        set_state(&mut message, ChatState::Composing);
        set_state(&mut message, ChatState::Paused);
        assert_eq!(state_of(&message), Some(ChatState::Paused));
        let count = message
            .element()
            .children()
            .filter(|c| c.namespace() == ns::CHATSTATES)
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_outbound_chat_message_gets_active() {
        let to: Jid = "bob@xmpp.example".parse().unwrap();
        let mut message = Message::chat(&to, "hi");
        ChatStates::new().filter_message_out(&mut message);
        assert_eq!(state_of(&message), Some(ChatState::Active));
    }

    #[test]
    fn test_outbound_explicit_state_kept() {
        let to: Jid = "bob@xmpp.example".parse().unwrap();
        let mut message = Message::chat(&to, "hi");
        set_state(&mut message, ChatState::Composing);
        ChatStates::new().filter_message_out(&mut message);
        assert_eq!(state_of(&message), Some(ChatState::Composing));
    }

    #[test]
    fn test_outbound_bodyless_untouched() {
        let mut message = Message::new(MessageType::Chat);
        ChatStates::new().filter_message_out(&mut message);
        assert_eq!(state_of(&message), None);
    }

    #[test]
    fn test_outbound_normal_message_untouched() {
        let mut message = Message::new(MessageType::Normal);
        message.set_body(None, "subjectful");
        ChatStates::new().filter_message_out(&mut message);
        assert_eq!(state_of(&message), None);
    }

    #[test]
    fn test_state_of_reads_inbound() {
        let element = Element::new("message", ns::CLIENT)
            .with_attr("from", "peer@xmpp.example/r")
            .with_child(Element::new("composing", ns::CHATSTATES));
        let message = Message::from_element(element);
        assert_eq!(state_of(&message), Some(ChatState::Composing));
    }
}
