//! IM session semantics: roster mirror and pushes, the subscription
//! workflow, presence/status translation and privacy lists.
//!
//! Registered as the `"im"` extension. Its `initialize` hook fetches the
//! roster and sends initial presence, completing session establishment.

pub mod privacy;
pub mod roster;

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, RwLock as StdRwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::engine::EngineHandle;
use crate::error::Error;
use crate::event::Event;
use crate::ext::{Extension, ExtensionRegistry, FilterOutcome};
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Iq, IqType, Presence, PresenceType, Show};
use crate::xml::Element;

use roster::{items_of, RosterItem, Subscription};

/// Coarse availability, translated to and from `<show/>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Online,
    Chat,
    Away,
    Dnd,
    Xa,
    /// Only ever produced by inbound `unavailable` presence; not a legal
    /// argument to [`ImSession::set_status`].
    Offline,
}

impl Availability {
    fn show(&self) -> Option<Show> {
        match self {
            Availability::Online | Availability::Offline => None,
            Availability::Chat => Some(Show::Chat),
            Availability::Away => Some(Show::Away),
            Availability::Dnd => Some(Show::Dnd),
            Availability::Xa => Some(Show::Xa),
        }
    }
}

/// A peer's (or our own) presence state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub availability: Availability,
    /// Status texts keyed by language tag; empty key = untagged.
    pub messages: BTreeMap<String, String>,
    pub priority: i8,
}

impl Status {
    pub fn online() -> Status {
        Status::new(Availability::Online)
    }

    pub fn new(availability: Availability) -> Status {
        Status {
            availability,
            messages: BTreeMap::new(),
            priority: 0,
        }
    }

    pub fn with_message(mut self, lang: Option<&str>, text: &str) -> Status {
        self.messages
            .insert(lang.unwrap_or_default().to_owned(), text.to_owned());
        self
    }

    pub fn with_priority(mut self, priority: i8) -> Status {
        self.priority = priority;
        self
    }

    /// Reads availability, status texts and priority from an inbound
    /// available/unavailable presence.
    pub fn from_presence(presence: &Presence) -> Status {
        let availability = match presence.presence_type() {
            PresenceType::Unavailable => Availability::Offline,
            _ => match presence.show() {
                None => Availability::Online,
                Some(Show::Chat) => Availability::Chat,
                Some(Show::Away) => Availability::Away,
                Some(Show::Dnd) => Availability::Dnd,
                Some(Show::Xa) => Availability::Xa,
            },
        };
        Status {
            availability,
            messages: presence.statuses().into_iter().collect(),
            priority: presence.priority(),
        }
    }

    fn to_presence(&self) -> Presence {
        let mut presence = Presence::new(PresenceType::Available);
        if let Some(show) = self.availability.show() {
            presence.set_show(show);
        }
        if self.priority != 0 {
            presence.set_priority(self.priority);
        }
        for (lang, text) in &self.messages {
            let lang = if lang.is_empty() { None } else { Some(lang.as_str()) };
            presence.set_status(lang, text);
        }
        presence
    }
}

type SubscriptionHandler = Box<dyn Fn(&Jid) -> bool + Send + Sync>;

/// What a roster push did to the local mirror.
#[derive(Debug, PartialEq, Eq)]
enum PushOutcome {
    Untrusted,
    Updated(RosterItem),
    Removed(Jid),
}

pub struct ImSession {
    handle: OnceLock<EngineHandle>,
    roster: StdMutex<HashMap<Jid, RosterItem>>,
    subscription_handler: StdRwLock<Option<SubscriptionHandler>>,
    /// Resolved at initialize when a `"disco"` extension is registered;
    /// used to probe for the blocking command.
    pub(crate) disco: OnceLock<Arc<crate::disco::ServiceDiscovery>>,
}

impl Default for ImSession {
    fn default() -> Self {
        ImSession::new()
    }
}

impl ImSession {
    pub fn new() -> ImSession {
        ImSession {
            handle: OnceLock::new(),
            roster: StdMutex::new(HashMap::new()),
            subscription_handler: StdRwLock::new(None),
            disco: OnceLock::new(),
        }
    }

    fn engine(&self) -> Result<&EngineHandle, Error> {
        self.handle
            .get()
            .ok_or(Error::InvalidState("IM session not initialized"))
    }

    /// Decides whether inbound subscription requests are approved. The
    /// default, with no handler set, refuses them.
    pub fn set_subscription_handler(&self, handler: impl Fn(&Jid) -> bool + Send + Sync + 'static) {
        *self
            .subscription_handler
            .write()
            .expect("subscription handler lock") = Some(Box::new(handler));
    }

    /// A point-in-time copy of the roster mirror.
    pub fn roster(&self) -> Vec<RosterItem> {
        let mut items: Vec<RosterItem> = self
            .roster
            .lock()
            .expect("roster lock")
            .values()
            .cloned()
            .collect();
        items.sort_by(|a, b| a.jid.cmp(&b.jid));
        items
    }

    pub fn contact(&self, jid: &Jid) -> Option<RosterItem> {
        self.roster
            .lock()
            .expect("roster lock")
            .get(&jid.bare())
            .cloned()
    }

    /// Re-fetches the roster from the server and replaces the mirror.
    pub async fn refresh_roster(&self) -> Result<Vec<RosterItem>, Error> {
        let engine = self.engine()?;
        let response = engine
            .request(Iq::get(Element::new("query", ns::ROSTER)))
            .await?;
        let items = response
            .payload()
            .filter(|p| p.is("query", ns::ROSTER))
            .map(items_of)
            .unwrap_or_default();
        let mut roster = self.roster.lock().expect("roster lock");
        roster.clear();
        for item in &items {
            roster.insert(item.jid.bare(), item.clone());
        }
        Ok(items)
    }

    /// Adds (or updates) a roster entry and requests a presence
    /// subscription.
    pub async fn add_contact(
        &self,
        jid: &Jid,
        name: Option<&str>,
        groups: &[&str],
    ) -> Result<(), Error> {
        let engine = self.engine()?;
        let mut item = RosterItem::new(jid.bare());
        item.name = name.map(str::to_owned);
        item.groups = groups.iter().map(|g| g.to_string()).collect();
        let query = Element::new("query", ns::ROSTER).with_child(item.to_element());
        engine.request(Iq::set(query)).await?;
        self.request_subscription(jid).await
    }

    /// Removes a roster entry; the server also revokes subscriptions.
    pub async fn remove_contact(&self, jid: &Jid) -> Result<(), Error> {
        let engine = self.engine()?;
        let item = Element::new("item", ns::ROSTER)
            .with_attr("jid", jid.bare().to_string())
            .with_attr("subscription", "remove");
        let query = Element::new("query", ns::ROSTER).with_child(item);
        engine.request(Iq::set(query)).await?;
        Ok(())
    }

    /// Sends `<presence type='subscribe'/>` to the peer.
    pub async fn request_subscription(&self, jid: &Jid) -> Result<(), Error> {
        self.engine()?
            .send_presence(Presence::directed(PresenceType::Subscribe, &jid.bare()))
            .await
    }

    /// Approves a peer's pending subscription request.
    pub async fn approve_subscription(&self, jid: &Jid) -> Result<(), Error> {
        self.engine()?
            .send_presence(Presence::directed(PresenceType::Subscribed, &jid.bare()))
            .await
    }

    /// Refuses (or revokes) a peer's subscription to our presence.
    pub async fn refuse_subscription(&self, jid: &Jid) -> Result<(), Error> {
        self.engine()?
            .send_presence(Presence::directed(PresenceType::Unsubscribed, &jid.bare()))
            .await
    }

    /// Stops observing the peer's presence.
    pub async fn unsubscribe(&self, jid: &Jid) -> Result<(), Error> {
        self.engine()?
            .send_presence(Presence::directed(PresenceType::Unsubscribe, &jid.bare()))
            .await
    }

    /// Broadcasts availability, per-language status texts and priority.
    /// `Offline` is rejected; close the engine to go offline.
    pub async fn set_status(&self, status: &Status) -> Result<(), Error> {
        if status.availability == Availability::Offline {
            return Err(Error::InvalidState(
                "going offline means closing the stream, not a status",
            ));
        }
        self.engine()?.send_presence(status.to_presence()).await
    }

    /// Applies a roster push to the mirror after the trust check: only
    /// pushes with no sender or our own bare JID count.
    fn apply_push(&self, own: Option<&Jid>, iq: &Iq) -> Vec<PushOutcome> {
        if let Some(from) = iq.from() {
            let trusted = own.is_some_and(|own| own.bare_eq(&from));
            if !trusted {
                return vec![PushOutcome::Untrusted];
            }
        }
        let Some(query) = iq.payload().filter(|p| p.is("query", ns::ROSTER)) else {
            return Vec::new();
        };
        let mut outcomes = Vec::new();
        let mut roster = self.roster.lock().expect("roster lock");
        for item in items_of(query) {
            if item.subscription == Subscription::Remove {
                roster.remove(&item.jid.bare());
                outcomes.push(PushOutcome::Removed(item.jid));
            } else {
                roster.insert(item.jid.bare(), item.clone());
                outcomes.push(PushOutcome::Updated(item));
            }
        }
        outcomes
    }
}

#[async_trait]
impl Extension for ImSession {
    fn id(&self) -> &'static str {
        "im"
    }

    async fn initialize(
        &self,
        engine: &EngineHandle,
        registry: &ExtensionRegistry,
    ) -> Result<(), Error> {
        let _ = self.handle.set(engine.clone());
        if let Ok(disco) = registry.get_as::<crate::disco::ServiceDiscovery>("disco") {
            let _ = self.disco.set(disco);
        }
        let items = self.refresh_roster().await?;
        info!("roster loaded: {} contact(s)", items.len());
        engine.send_presence(Presence::new(PresenceType::Available)).await?;
        Ok(())
    }

    async fn filter_iq(&self, engine: &EngineHandle, iq: &Iq) -> Result<FilterOutcome, Error> {
        if iq.iq_type() != IqType::Set
            || iq.payload().map(|p| p.is("query", ns::ROSTER)) != Some(true)
        {
            return Ok(FilterOutcome::Pass);
        }
        let own = engine.jid()?;
        for outcome in self.apply_push(own.as_ref(), iq) {
            match outcome {
                PushOutcome::Untrusted => {
                    debug!("ignoring roster push from untrusted sender {:?}", iq.from());
                    return Ok(FilterOutcome::Handled);
                }
                PushOutcome::Updated(item) => {
                    engine.emit(Event::RosterUpdated { item }).await;
                }
                PushOutcome::Removed(jid) => {
                    engine.emit(Event::RosterItemRemoved { jid }).await;
                }
            }
        }
        engine.send_iq(Iq::result(iq, None)).await?;
        Ok(FilterOutcome::Handled)
    }

    async fn filter_presence(
        &self,
        engine: &EngineHandle,
        presence: &Presence,
    ) -> Result<FilterOutcome, Error> {
        let Some(from) = presence.from() else {
            return Ok(FilterOutcome::Pass);
        };
        match presence.presence_type() {
            PresenceType::Available | PresenceType::Unavailable => {
                let status = Status::from_presence(presence);
                engine.emit(Event::StatusChanged { from, status }).await;
                Ok(FilterOutcome::Handled)
            }
            PresenceType::Subscribe => {
                let approve = self
                    .subscription_handler
                    .read()
                    .expect("subscription handler lock")
                    .as_ref()
                    .map(|handler| handler(&from))
                    .unwrap_or(false);
                let reply = if approve {
                    PresenceType::Subscribed
                } else {
                    PresenceType::Unsubscribed
                };
                engine
                    .send_presence(Presence::directed(reply, &from.bare()))
                    .await?;
                Ok(FilterOutcome::Handled)
            }
            PresenceType::Subscribed => {
                engine.emit(Event::SubscriptionApproved { from }).await;
                Ok(FilterOutcome::Handled)
            }
            PresenceType::Unsubscribed => {
                engine.emit(Event::SubscriptionRefused { from }).await;
                Ok(FilterOutcome::Handled)
            }
            PresenceType::Unsubscribe => {
                engine.emit(Event::Unsubscribed { from }).await;
                Ok(FilterOutcome::Handled)
            }
            PresenceType::Probe | PresenceType::Error => Ok(FilterOutcome::Pass),
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{connect_with, extract_attr, ScriptIo};

    // ── status translation ──────────────────────────────

    #[test]
    fn test_status_to_presence_shape() {
        let status = Status::new(Availability::Away)
            .with_message(None, "lunch")
            .with_message(Some("fr"), "déjeuner")
            .with_priority(7);
        let presence = status.to_presence();
        assert_eq!(presence.show(), Some(Show::Away));
        assert_eq!(presence.priority(), 7);
        assert_eq!(presence.status(None).as_deref(), Some("lunch"));
        assert_eq!(presence.status(Some("fr")).as_deref(), Some("déjeuner"));
    }

    #[test]
    fn test_status_round_trip_through_presence() {
        let status = Status::new(Availability::Dnd)
            .with_message(None, "busy")
            .with_priority(-1);
        assert_eq!(Status::from_presence(&status.to_presence()), status);
    }

    #[test]
    fn test_unavailable_presence_reads_offline() {
        let presence = Presence::new(PresenceType::Unavailable);
        assert_eq!(
            Status::from_presence(&presence).availability,
            Availability::Offline
        );
    }

    #[test]
    fn test_online_has_no_show() {
        let presence = Status::new(Availability::Online).to_presence();
        assert_eq!(presence.show(), None);
        assert_eq!(
            Status::from_presence(&presence).availability,
            Availability::Online
        );
    }

    // ── roster push trust ───────────────────────────────

    fn push_iq(from: Option<&str>, item_xml: Element) -> Iq {
        let mut element = Element::new("iq", ns::CLIENT)
            .with_attr("type", "set")
            .with_attr("id", "push1");
        if let Some(from) = from {
            element.set_attr("from", from);
        }
        element.append_child(Element::new("query", ns::ROSTER).with_child(item_xml));
        Iq::from_element(element).unwrap()
    }

    fn bob_item() -> Element {
        Element::new("item", ns::ROSTER)
            .with_attr("jid", "bob@xmpp.example")
            .with_attr("subscription", "to")
    }

    #[test]
    fn test_push_with_no_sender_trusted() {
        let session = ImSession::new();
        let own: Jid = "alice@xmpp.example/home".parse().unwrap();
        let outcomes = session.apply_push(Some(&own), &push_iq(None, bob_item()));
        assert!(matches!(outcomes.as_slice(), [PushOutcome::Updated(_)]));
        assert!(session.contact(&"bob@xmpp.example".parse().unwrap()).is_some());
    }

    #[test]
    fn test_push_from_own_bare_jid_trusted() {
        let session = ImSession::new();
        let own: Jid = "alice@xmpp.example/home".parse().unwrap();
        let iq = push_iq(Some("alice@xmpp.example"), bob_item());
        let outcomes = session.apply_push(Some(&own), &iq);
        assert!(matches!(outcomes.as_slice(), [PushOutcome::Updated(_)]));
    }

    #[test]
    fn test_push_from_other_sender_ignored() {
        let session = ImSession::new();
        let own: Jid = "alice@xmpp.example/home".parse().unwrap();
        let iq = push_iq(Some("mallory@evil"), bob_item());
        let outcomes = session.apply_push(Some(&own), &iq);
        assert_eq!(outcomes, vec![PushOutcome::Untrusted]);
        assert!(session.roster().is_empty());
    }

    #[test]
    fn test_push_remove_deletes_item() {
        let session = ImSession::new();
        let own: Jid = "alice@xmpp.example/home".parse().unwrap();
        session.apply_push(Some(&own), &push_iq(None, bob_item()));
        assert_eq!(session.roster().len(), 1);

        let removal = Element::new("item", ns::ROSTER)
            .with_attr("jid", "bob@xmpp.example")
            .with_attr("subscription", "remove");
        let outcomes = session.apply_push(Some(&own), &push_iq(None, removal));
        assert!(matches!(outcomes.as_slice(), [PushOutcome::Removed(_)]));
        assert!(session.roster().is_empty());
    }

    // ── end to end over a scripted server ───────────────

    async fn serve_im_session(io: &mut ScriptIo) {
        // Roster fetch issued by initialize.
        let request = io.expect("</iq>").await;
        let id = extract_attr(&request, "id").unwrap();
        io.send(&format!(
            "<iq type='result' id='{id}'>\
             <query xmlns='jabber:iq:roster'>\
             <item jid='bob@xmpp.example' name='Bob' subscription='both'/>\
             </query></iq>"
        ))
        .await;
        // Initial presence.
        io.expect("<presence").await;
        io.expect("/>").await;
    }

    #[tokio::test]
    async fn test_session_start_loads_roster_and_sends_presence() {
        let im = Arc::new(ImSession::new());
        let mut registry = ExtensionRegistry::new();
        registry.register(im.clone()).unwrap();

        let (engine, _events) = connect_with(registry, |mut io| async move {
            serve_im_session(&mut io).await;
            io.hold_open().await;
        })
        .await;

        let roster = im.roster();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].jid.to_string(), "bob@xmpp.example");
        assert_eq!(roster[0].subscription, Subscription::Both);
        engine.close().await;
    }

    #[tokio::test]
    async fn test_subscription_handshake() {
        let im = Arc::new(ImSession::new());
        let mut registry = ExtensionRegistry::new();
        registry.register(im.clone()).unwrap();

        let (engine, mut events) = connect_with(registry, |mut io| async move {
            serve_im_session(&mut io).await;
            // AddContact: roster set, then subscribe presence.
            let set = io.expect("</iq>").await;
            let id = extract_attr(&set, "id").unwrap();
            assert!(set.contains("jid='carol@xmpp.example'"));
            io.send(&format!("<iq type='result' id='{id}'/>")).await;
            let subscribe = io.expect("/>").await;
            assert!(subscribe.contains("type='subscribe'"));
            assert!(subscribe.contains("to='carol@xmpp.example'"));
            // Peer approves.
            io.send("<presence from='carol@xmpp.example' type='subscribed'/>")
                .await;
            io.hold_open().await;
        })
        .await;

        im.add_contact(&"carol@xmpp.example".parse().unwrap(), None, &[])
            .await
            .unwrap();

        loop {
            match events.recv().await {
                Some(Event::SubscriptionApproved { from }) => {
                    assert_eq!(from.to_string(), "carol@xmpp.example");
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed early"),
            }
        }
        engine.close().await;
    }

    #[tokio::test]
    async fn test_untrusted_roster_push_raises_no_event() {
        let im = Arc::new(ImSession::new());
        let mut registry = ExtensionRegistry::new();
        registry.register(im.clone()).unwrap();

        let (engine, mut events) = connect_with(registry, |mut io| async move {
            serve_im_session(&mut io).await;
            io.send(
                "<iq type='set' from='mallory@evil' id='evil1'>\
                 <query xmlns='jabber:iq:roster'>\
                 <item jid='bob@xmpp.example' subscription='remove'/>\
                 </query></iq>",
            )
            .await;
            // A sentinel the client will surface after the push.
            io.send("<message from='bob@xmpp.example'><body>ok</body></message>")
                .await;
            io.hold_open().await;
        })
        .await;

        loop {
            match events.recv().await {
                Some(Event::Connected { .. }) => continue,
                Some(Event::Message(m)) => {
                    assert_eq!(m.body(None).as_deref(), Some("ok"));
                    break;
                }
                Some(Event::RosterUpdated { .. }) | Some(Event::RosterItemRemoved { .. }) => {
                    panic!("untrusted push must not touch the roster")
                }
                Some(_) => continue,
                None => panic!("event channel closed early"),
            }
        }
        assert_eq!(im.roster().len(), 1, "roster must be unchanged");
        engine.close().await;
    }

    #[tokio::test]
    async fn test_set_status_rejects_offline() {
        let session = ImSession::new();
        let result = session.set_status(&Status::new(Availability::Offline)).await;
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_inbound_status_change_event() {
        let im = Arc::new(ImSession::new());
        let mut registry = ExtensionRegistry::new();
        registry.register(im.clone()).unwrap();

        let (engine, mut events) = connect_with(registry, |mut io| async move {
            serve_im_session(&mut io).await;
            io.send(
                "<presence from='bob@xmpp.example/desk'>\
                 <show>dnd</show><status>heads down</status>\
                 <priority>3</priority></presence>",
            )
            .await;
            io.hold_open().await;
        })
        .await;

        loop {
            match events.recv().await {
                Some(Event::StatusChanged { from, status }) => {
                    assert_eq!(from.to_string(), "bob@xmpp.example/desk");
                    assert_eq!(status.availability, Availability::Dnd);
                    assert_eq!(status.priority, 3);
                    assert_eq!(status.messages.get(""), Some(&"heads down".to_string()));
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed early"),
            }
        }
        engine.close().await;
    }
}
