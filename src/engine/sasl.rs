//! SASL authentication: SCRAM-SHA-1 (RFC 5802), DIGEST-MD5 (RFC 2831)
//! and PLAIN (RFC 4616), preferred in that order.

use base64::Engine as _;
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{AuthFailure, Error};
use crate::ns;
use crate::xml::{Element, XmlStream};

type HmacSha1 = Hmac<Sha1>;
const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Preference order; the first mechanism the server also offers wins.
const PREFERENCE: [&str; 3] = ["SCRAM-SHA-1", "DIGEST-MD5", "PLAIN"];

/// One SASL mechanism being driven over `<auth>`/`<challenge>`/`<success>`.
trait Mechanism: Send {
    fn name(&self) -> &'static str;

    /// Payload for the `<auth/>` element, if the mechanism starts.
    fn initial_response(&mut self) -> Option<Vec<u8>>;

    /// Answer a decoded `<challenge/>`.
    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, Error>;

    /// Check the decoded `<success/>` payload before completing.
    fn verify_success(&mut self, data: &[u8]) -> Result<(), Error>;
}

/// Runs SASL against the stream and returns the mechanism name used.
pub(crate) async fn authenticate<R, W>(
    stream: &mut XmlStream<R>,
    writer: &mut W,
    offered: &[String],
    username: &str,
    password: &str,
    domain: &str,
) -> Result<&'static str, Error>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut mechanism = select(offered, username, password, domain)
        .ok_or(Error::Authentication(AuthFailure::NoSharedMechanism))?;
    debug!("SASL mechanism: {}", mechanism.name());

    let mut auth = Element::new("auth", ns::SASL);
    auth.set_attr("mechanism", mechanism.name());
    if let Some(initial) = mechanism.initial_response() {
        auth.append_text(B64.encode(initial));
    }
    writer.write_all(auth.to_xml().as_bytes()).await?;
    writer.flush().await?;

    loop {
        let element = stream.next_element().await?;
        if element.is("challenge", ns::SASL) {
            let challenge = decode_payload(&element)?;
            let response = mechanism.respond(&challenge)?;
            let mut reply = Element::new("response", ns::SASL);
            reply.append_text(B64.encode(response));
            writer.write_all(reply.to_xml().as_bytes()).await?;
            writer.flush().await?;
        } else if element.is("success", ns::SASL) {
            let data = decode_payload(&element)?;
            mechanism.verify_success(&data)?;
            debug!("SASL {} succeeded", mechanism.name());
            return Ok(mechanism.name());
        } else if element.is("failure", ns::SASL) {
            let condition = element
                .children()
                .next()
                .map(|c| c.name().to_owned())
                .unwrap_or_else(|| "not-authorized".to_owned());
            return Err(Error::Authentication(AuthFailure::Rejected(condition)));
        } else {
            return Err(Error::StreamXml(format!(
                "unexpected element <{}> during SASL",
                element.name()
            )));
        }
    }
}

fn select(
    offered: &[String],
    username: &str,
    password: &str,
    domain: &str,
) -> Option<Box<dyn Mechanism>> {
    for preferred in PREFERENCE {
        if !offered.iter().any(|m| m == preferred) {
            continue;
        }
        return Some(match preferred {
            "SCRAM-SHA-1" => Box::new(ScramSha1::new(username, password)),
            "DIGEST-MD5" => Box::new(DigestMd5::new(username, password, domain)),
            _ => Box::new(Plain::new(username, password)),
        });
    }
    None
}

fn decode_payload(element: &Element) -> Result<Vec<u8>, Error> {
    let text = element.text();
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "=" {
        return Ok(Vec::new());
    }
    B64.decode(trimmed)
        .map_err(|e| Error::Authentication(AuthFailure::BadChallenge(e.to_string())))
}

fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..24).map(|_| rng.gen()).collect();
    B64.encode(&bytes)
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

// ── PLAIN (RFC 4616) ─────────────────────────────────────

struct Plain {
    username: String,
    password: String,
}

impl Plain {
    fn new(username: &str, password: &str) -> Self {
        Plain {
            username: username.to_owned(),
            password: password.to_owned(),
        }
    }
}

impl Mechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn initial_response(&mut self) -> Option<Vec<u8>> {
        Some(format!("\0{}\0{}", self.username, self.password).into_bytes())
    }

    fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, Error> {
        Err(Error::Authentication(AuthFailure::BadChallenge(
            "PLAIN expects no challenge".into(),
        )))
    }

    fn verify_success(&mut self, _data: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}

// ── SCRAM-SHA-1 (RFC 5802) ───────────────────────────────

struct ScramSha1 {
    username: String,
    password: String,
    client_nonce: String,
    client_first_bare: String,
    /// Expected `v=` value, available once the proofs are computed.
    server_signature: Option<Vec<u8>>,
    verified: bool,
}

impl ScramSha1 {
    fn new(username: &str, password: &str) -> Self {
        let client_nonce = generate_nonce();
        let client_first_bare = format!("n={username},r={client_nonce}");
        ScramSha1 {
            username: username.to_owned(),
            password: password.to_owned(),
            client_nonce,
            client_first_bare,
            server_signature: None,
            verified: false,
        }
    }

    fn check_signature(&mut self, value: &str) -> Result<(), Error> {
        let received = B64
            .decode(value)
            .map_err(|_| Error::Authentication(AuthFailure::SignatureMismatch))?;
        match &self.server_signature {
            Some(expected) if *expected == received => {
                self.verified = true;
                Ok(())
            }
            _ => Err(Error::Authentication(AuthFailure::SignatureMismatch)),
        }
    }
}

impl Mechanism for ScramSha1 {
    fn name(&self) -> &'static str {
        "SCRAM-SHA-1"
    }

    fn initial_response(&mut self) -> Option<Vec<u8>> {
        Some(format!("n,,{}", self.client_first_bare).into_bytes())
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, Error> {
        let server_first = std::str::from_utf8(challenge)
            .map_err(|_| Error::Authentication(AuthFailure::BadChallenge("not UTF-8".into())))?;

        // A second challenge can only carry the server signature.
        if let Some(v) = server_first.strip_prefix("v=") {
            self.check_signature(v)?;
            return Ok(Vec::new());
        }

        let (combined_nonce, salt_b64, iterations) = parse_server_first(server_first)?;
        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(Error::Authentication(AuthFailure::BadChallenge(
                "server nonce does not extend client nonce".into(),
            )));
        }

        let salt = B64
            .decode(&salt_b64)
            .map_err(|_| Error::Authentication(AuthFailure::BadChallenge("bad salt".into())))?;

        // SaltedPassword = PBKDF2-SHA1(password, salt, iterations)
        let mut salted_password = [0u8; 20];
        pbkdf2::pbkdf2_hmac::<Sha1>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );

        let client_key = hmac_sha1(&salted_password, b"Client Key");
        let stored_key = Sha1::digest(&client_key);

        let channel_binding = B64.encode(b"n,,");
        let client_final_without_proof = format!("c={channel_binding},r={combined_nonce}");
        let auth_message = format!(
            "{},{server_first},{client_final_without_proof}",
            self.client_first_bare
        );

        let client_signature = hmac_sha1(&stored_key, auth_message.as_bytes());
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        let server_key = hmac_sha1(&salted_password, b"Server Key");
        self.server_signature = Some(hmac_sha1(&server_key, auth_message.as_bytes()));

        Ok(format!(
            "{client_final_without_proof},p={}",
            B64.encode(&client_proof)
        )
        .into_bytes())
    }

    fn verify_success(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.verified {
            return Ok(());
        }
        let text = std::str::from_utf8(data).unwrap_or("");
        if let Some(v) = text.trim().strip_prefix("v=") {
            return self.check_signature(v);
        }
        // No signature anywhere; tolerated, but worth noticing.
        warn!("SCRAM success without server signature");
        Ok(())
    }
}

/// Parses the SCRAM server-first-message `r=nonce,s=salt,i=iterations`.
fn parse_server_first(message: &str) -> Result<(String, String, u32), Error> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for part in message.split(',') {
        if let Some(value) = part.strip_prefix("r=") {
            nonce = Some(value.to_owned());
        } else if let Some(value) = part.strip_prefix("s=") {
            salt = Some(value.to_owned());
        } else if let Some(value) = part.strip_prefix("i=") {
            iterations = value.parse::<u32>().ok();
        }
    }

    let missing =
        |what: &str| Error::Authentication(AuthFailure::BadChallenge(format!("missing {what}")));
    Ok((
        nonce.ok_or_else(|| missing("nonce"))?,
        salt.ok_or_else(|| missing("salt"))?,
        iterations.ok_or_else(|| missing("iteration count"))?,
    ))
}

// ── DIGEST-MD5 (RFC 2831) ────────────────────────────────

struct DigestMd5 {
    username: String,
    password: String,
    domain: String,
    cnonce: String,
    /// Expected `rspauth` once the response is computed.
    rspauth: Option<String>,
    verified: bool,
}

impl DigestMd5 {
    fn new(username: &str, password: &str, domain: &str) -> Self {
        DigestMd5 {
            username: username.to_owned(),
            password: password.to_owned(),
            domain: domain.to_owned(),
            cnonce: generate_nonce(),
            rspauth: None,
            verified: false,
        }
    }

    fn check_rspauth(&mut self, value: &str) -> Result<(), Error> {
        match &self.rspauth {
            Some(expected) if expected == value => {
                self.verified = true;
                Ok(())
            }
            _ => Err(Error::Authentication(AuthFailure::SignatureMismatch)),
        }
    }
}

impl Mechanism for DigestMd5 {
    fn name(&self) -> &'static str {
        "DIGEST-MD5"
    }

    fn initial_response(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, Error> {
        let text = std::str::from_utf8(challenge)
            .map_err(|_| Error::Authentication(AuthFailure::BadChallenge("not UTF-8".into())))?;
        let directives = parse_directives(text);

        if let Some(rspauth) = directives.get("rspauth") {
            let rspauth = rspauth.clone();
            self.check_rspauth(&rspauth)?;
            return Ok(Vec::new());
        }

        let nonce = directives
            .get("nonce")
            .ok_or_else(|| Error::Authentication(AuthFailure::BadChallenge("missing nonce".into())))?;
        let realm = directives
            .get("realm")
            .cloned()
            .unwrap_or_else(|| self.domain.clone());
        let digest_uri = format!("xmpp/{}", self.domain);
        let nc = "00000001";
        let qop = "auth";

        // HA1 = MD5(MD5(user:realm:pass):nonce:cnonce)
        let inner = Md5::digest(
            format!("{}:{realm}:{}", self.username, self.password).as_bytes(),
        );
        let mut a1 = inner.to_vec();
        a1.extend_from_slice(format!(":{nonce}:{}", self.cnonce).as_bytes());
        let ha1 = hex::encode(Md5::digest(&a1));

        let ha2 = hex::encode(Md5::digest(format!("AUTHENTICATE:{digest_uri}").as_bytes()));
        let response = hex::encode(Md5::digest(
            format!("{ha1}:{nonce}:{nc}:{}:{qop}:{ha2}", self.cnonce).as_bytes(),
        ));

        // Expected mutual-auth value: same computation without the verb.
        let ha2_rsp = hex::encode(Md5::digest(format!(":{digest_uri}").as_bytes()));
        self.rspauth = Some(hex::encode(Md5::digest(
            format!("{ha1}:{nonce}:{nc}:{}:{qop}:{ha2_rsp}", self.cnonce).as_bytes(),
        )));

        Ok(format!(
            "username=\"{}\",realm=\"{realm}\",nonce=\"{nonce}\",cnonce=\"{}\",\
             nc={nc},qop={qop},digest-uri=\"{digest_uri}\",response={response},charset=utf-8",
            self.username, self.cnonce
        )
        .into_bytes())
    }

    fn verify_success(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.verified {
            return Ok(());
        }
        let text = std::str::from_utf8(data).unwrap_or("");
        if let Some(rspauth) = parse_directives(text).get("rspauth") {
            let rspauth = rspauth.clone();
            return self.check_rspauth(&rspauth);
        }
        warn!("DIGEST-MD5 success without rspauth");
        Ok(())
    }
}

/// Splits `key=value,key="quoted, value"` directive lists.
fn parse_directives(input: &str) -> std::collections::HashMap<String, String> {
    let mut out = std::collections::HashMap::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_owned();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let Some(close) = stripped.find('"') else { break };
            value = stripped[..close].to_owned();
            rest = stripped[close + 1..].trim_start_matches(',').trim_start();
        } else {
            match rest.find(',') {
                Some(comma) => {
                    value = rest[..comma].trim().to_owned();
                    rest = rest[comma + 1..].trim_start();
                }
                None => {
                    value = rest.trim().to_owned();
                    rest = "";
                }
            }
        }
        out.insert(key, value);
    }
    out
}
