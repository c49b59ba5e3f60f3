//! XEP-0095 stream initiation with XEP-0020 feature negotiation.
//!
//! An offer is an `<iq type='set'>` carrying `<si/>` with a profile
//! payload and a feature-negotiation form listing candidate stream
//! method namespaces; the target answers with a submit form selecting
//! exactly one. Inbound offers are routed to the handler registered for
//! their `profile` attribute.

use std::any::Any;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::dataforms::{DataForm, Field, FieldOption, FieldValue, FormType};
use crate::engine::EngineHandle;
use crate::error::{DefinedCondition, Error, StanzaError};
use crate::ext::{Extension, ExtensionRegistry, FilterOutcome};
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Iq, IqType};
use crate::xml::Element;

/// The feature-negotiation field naming the transport.
pub const STREAM_METHOD_FIELD: &str = "stream-method";

/// A parsed inbound stream initiation.
#[derive(Debug, Clone)]
pub struct SiRequest {
    pub sid: String,
    pub from: Jid,
    pub mime: Option<String>,
    pub profile: String,
    /// The profile payload (e.g. the `<file/>` element).
    pub payload: Option<Element>,
    /// Stream method namespaces the initiator offered.
    pub methods: Vec<String>,
}

/// A profile plugged into stream initiation (file transfer being the
/// one this crate ships).
#[async_trait]
pub trait SiProfileHandler: Send + Sync {
    /// Produces the `<si/>` response element, or the error to return.
    async fn handle(
        &self,
        engine: &EngineHandle,
        request: SiRequest,
    ) -> Result<Element, StanzaError>;
}

/// Builds the `<si/>` offer element.
pub fn offer_element(
    sid: &str,
    mime: Option<&str>,
    profile: &str,
    payload: Element,
    methods: &[&str],
) -> Element {
    let mut si = Element::new("si", ns::SI);
    si.set_attr("id", sid);
    si.set_attr("profile", profile);
    if let Some(mime) = mime {
        si.set_attr("mime-type", mime);
    }
    si.append_child(payload);

    let form = DataForm::new(FormType::Form).with_field(Field::new(
        STREAM_METHOD_FIELD,
        FieldValue::ListSingle {
            options: methods
                .iter()
                .map(|m| FieldOption {
                    label: None,
                    value: m.to_string(),
                })
                .collect(),
            selected: None,
        },
    ));
    let feature = Element::new("feature", ns::FEATURE_NEG).with_child(form.to_element());
    si.append_child(feature);
    si
}

/// Builds the `<si/>` acceptance selecting one stream method.
pub fn accept_element(method: &str) -> Element {
    let form = DataForm::new(FormType::Submit).with_field(Field::new(
        STREAM_METHOD_FIELD,
        FieldValue::ListSingle {
            options: Vec::new(),
            selected: Some(method.to_owned()),
        },
    ));
    let feature = Element::new("feature", ns::FEATURE_NEG).with_child(form.to_element());
    Element::new("si", ns::SI).with_child(feature)
}

/// Reads the selected stream method out of an `<si/>` response.
pub fn selected_method(si: &Element) -> Option<String> {
    let feature = si.child("feature", ns::FEATURE_NEG)?;
    let form = DataForm::from_element(feature.child("x", ns::DATA_FORMS)?)?;
    match &form.field(STREAM_METHOD_FIELD)?.value {
        FieldValue::ListSingle { selected, .. } => selected.clone(),
        FieldValue::TextSingle(value) => value.clone(),
        _ => None,
    }
}

/// Reads the offered stream methods out of an `<si/>` offer.
fn offered_methods(si: &Element) -> Vec<String> {
    let Some(feature) = si.child("feature", ns::FEATURE_NEG) else {
        return Vec::new();
    };
    let Some(form) = feature
        .child("x", ns::DATA_FORMS)
        .and_then(DataForm::from_element)
    else {
        return Vec::new();
    };
    match form.field(STREAM_METHOD_FIELD).map(|f| &f.value) {
        Some(FieldValue::ListSingle { options, .. }) => {
            options.iter().map(|o| o.value.clone()).collect()
        }
        Some(FieldValue::ListMulti { options, .. }) => {
            options.iter().map(|o| o.value.clone()).collect()
        }
        _ => Vec::new(),
    }
}

pub struct StreamInitiation {
    handle: OnceLock<EngineHandle>,
    profiles: DashMap<String, Arc<dyn SiProfileHandler>>,
}

impl Default for StreamInitiation {
    fn default() -> Self {
        StreamInitiation::new()
    }
}

impl StreamInitiation {
    pub fn new() -> StreamInitiation {
        StreamInitiation {
            handle: OnceLock::new(),
            profiles: DashMap::new(),
        }
    }

    fn engine(&self) -> Result<&EngineHandle, Error> {
        self.handle
            .get()
            .ok_or(Error::InvalidState("stream initiation not initialized"))
    }

    /// Registers the handler for a `profile` attribute value.
    pub fn register_profile(&self, profile: &str, handler: Arc<dyn SiProfileHandler>) {
        self.profiles.insert(profile.to_owned(), handler);
    }

    /// Offers a stream to `to` and returns `(sid, selected method)`.
    pub async fn initiate(
        &self,
        to: &Jid,
        mime: Option<&str>,
        profile: &str,
        payload: Element,
        methods: &[&str],
    ) -> Result<(String, String), Error> {
        if methods.is_empty() {
            return Err(Error::InvalidState("no stream methods to offer"));
        }
        let engine = self.engine()?;
        let sid = format!("si-{}", uuid::Uuid::new_v4().simple());
        let offer = offer_element(&sid, mime, profile, payload, methods);
        let response = engine.request(Iq::set(offer).with_to(to)).await?;
        let method = response
            .payload()
            .filter(|p| p.is("si", ns::SI))
            .and_then(selected_method)
            .ok_or_else(|| Error::StreamXml("si response without stream method".into()))?;
        if !methods.iter().any(|m| *m == method) {
            return Err(Error::NotSupported("peer selected an unoffered stream method"));
        }
        Ok((sid, method))
    }

    fn parse_request(iq: &Iq) -> Option<SiRequest> {
        let si = iq.payload().filter(|p| p.is("si", ns::SI))?;
        let from = iq.from()?;
        Some(SiRequest {
            sid: si.attr("id")?.to_owned(),
            from,
            mime: si.attr("mime-type").map(str::to_owned),
            profile: si.attr("profile")?.to_owned(),
            payload: si
                .children()
                .find(|c| c.namespace() != ns::FEATURE_NEG)
                .cloned(),
            methods: offered_methods(si),
        })
    }
}

#[async_trait]
impl Extension for StreamInitiation {
    fn id(&self) -> &'static str {
        "si"
    }

    fn namespaces(&self) -> &'static [&'static str] {
        &[ns::SI, ns::FEATURE_NEG]
    }

    async fn initialize(
        &self,
        engine: &EngineHandle,
        _registry: &ExtensionRegistry,
    ) -> Result<(), Error> {
        let _ = self.handle.set(engine.clone());
        Ok(())
    }

    async fn filter_iq(&self, engine: &EngineHandle, iq: &Iq) -> Result<FilterOutcome, Error> {
        if iq.iq_type() != IqType::Set
            || iq.payload().map(|p| p.is("si", ns::SI)) != Some(true)
        {
            return Ok(FilterOutcome::Pass);
        }
        let Some(request) = Self::parse_request(iq) else {
            let reply = Iq::error_reply(iq, StanzaError::new(DefinedCondition::BadRequest));
            engine.send_iq(reply).await?;
            return Ok(FilterOutcome::Handled);
        };
        let Some(handler) = self.profiles.get(&request.profile).map(|h| h.clone()) else {
            let reply = Iq::error_reply(
                iq,
                StanzaError::with_text(DefinedCondition::BadRequest, "unknown SI profile"),
            );
            engine.send_iq(reply).await?;
            return Ok(FilterOutcome::Handled);
        };
        let reply = match handler.handle(engine, request).await {
            Ok(response) => Iq::result(iq, Some(response)),
            Err(error) => Iq::error_reply(iq, error),
        };
        engine.send_iq(reply).await?;
        Ok(FilterOutcome::Handled)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_shape() {
        let payload = Element::new("file", ns::SI_FILE_TRANSFER)
            .with_attr("name", "a.bin")
            .with_attr("size", "10");
        let offer = offer_element(
            "sid-1",
            Some("application/octet-stream"),
            ns::SI_FILE_TRANSFER,
            payload,
            &[ns::BYTESTREAMS, ns::IBB],
        );
        assert_eq!(offer.attr("id"), Some("sid-1"));
        assert_eq!(offer.attr("profile"), Some(ns::SI_FILE_TRANSFER));
        assert_eq!(offer.attr("mime-type"), Some("application/octet-stream"));
        assert!(offer.child("file", ns::SI_FILE_TRANSFER).is_some());
        assert_eq!(
            offered_methods(&offer),
            vec![ns::BYTESTREAMS.to_owned(), ns::IBB.to_owned()]
        );
    }

    #[test]
    fn test_accept_selects_method() {
        let accept = accept_element(ns::IBB);
        assert_eq!(selected_method(&accept).as_deref(), Some(ns::IBB));
    }

    #[test]
    fn test_selected_method_from_text_single() {
        // Some implementations answer with a bare text-single field.
        let form = DataForm::new(FormType::Submit).with_field(Field::new(
            STREAM_METHOD_FIELD,
            FieldValue::TextSingle(Some(ns::BYTESTREAMS.to_owned())),
        ));
        let si = Element::new("si", ns::SI).with_child(
            Element::new("feature", ns::FEATURE_NEG).with_child(form.to_element()),
        );
        assert_eq!(selected_method(&si).as_deref(), Some(ns::BYTESTREAMS));
    }

    #[test]
    fn test_selected_method_missing() {
        let si = Element::new("si", ns::SI);
        assert_eq!(selected_method(&si), None);
    }

    #[test]
    fn test_parse_request() {
        let payload = Element::new("file", ns::SI_FILE_TRANSFER)
            .with_attr("name", "a.bin")
            .with_attr("size", "10");
        let offer = offer_element("sid-9", None, ns::SI_FILE_TRANSFER, payload, &[ns::IBB]);
        let mut iq_el = Element::new("iq", ns::CLIENT)
            .with_attr("type", "set")
            .with_attr("id", "i1")
            .with_attr("from", "peer@xmpp.example/desk");
        iq_el.append_child(offer);
        let iq = Iq::from_element(iq_el).unwrap();

        let request = StreamInitiation::parse_request(&iq).unwrap();
        assert_eq!(request.sid, "sid-9");
        assert_eq!(request.from.to_string(), "peer@xmpp.example/desk");
        assert_eq!(request.profile, ns::SI_FILE_TRANSFER);
        assert_eq!(request.methods, vec![ns::IBB.to_owned()]);
        assert!(request.payload.unwrap().is("file", ns::SI_FILE_TRANSFER));
    }

    #[test]
    fn test_parse_request_without_profile_rejected() {
        let mut iq_el = Element::new("iq", ns::CLIENT)
            .with_attr("type", "set")
            .with_attr("id", "i1")
            .with_attr("from", "peer@xmpp.example/desk");
        iq_el.append_child(Element::new("si", ns::SI).with_attr("id", "sid-9"));
        let iq = Iq::from_element(iq_el).unwrap();
        assert!(StreamInitiation::parse_request(&iq).is_none());
    }
}
