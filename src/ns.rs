//! XML namespace constants for the protocols the engine speaks.

/// RFC 3920 outer stream namespace
pub const STREAM: &str = "http://etherx.jabber.org/streams";
/// RFC 3920 client content namespace
pub const CLIENT: &str = "jabber:client";
/// RFC 3920 STARTTLS
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
/// RFC 3920 SASL
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
/// RFC 3920 resource binding
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
/// RFC 3921 legacy session establishment
pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
/// RFC 3920 stanza error conditions
pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
/// RFC 3920 stream error conditions
pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
/// RFC 3921 roster management
pub const ROSTER: &str = "jabber:iq:roster";
/// XEP-0016 privacy lists
pub const PRIVACY: &str = "jabber:iq:privacy";
/// XEP-0191 blocking command
pub const BLOCKING: &str = "urn:xmpp:blocking";
/// XEP-0030 service discovery (info)
pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
/// XEP-0030 service discovery (items)
pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
/// XEP-0115 entity capabilities
pub const CAPS: &str = "http://jabber.org/protocol/caps";
/// XEP-0004 data forms
pub const DATA_FORMS: &str = "jabber:x:data";
/// XEP-0020 feature negotiation
pub const FEATURE_NEG: &str = "http://jabber.org/protocol/feature-neg";
/// XEP-0095 stream initiation
pub const SI: &str = "http://jabber.org/protocol/si";
/// XEP-0096 SI file transfer profile
pub const SI_FILE_TRANSFER: &str = "http://jabber.org/protocol/si/profile/file-transfer";
/// XEP-0065 SOCKS5 bytestreams
pub const BYTESTREAMS: &str = "http://jabber.org/protocol/bytestreams";
/// XEP-0047 in-band bytestreams
pub const IBB: &str = "http://jabber.org/protocol/ibb";
/// XEP-0085 chat state notifications
pub const CHATSTATES: &str = "http://jabber.org/protocol/chatstates";
/// XEP-0203 delayed delivery
pub const DELAY: &str = "urn:xmpp:delay";
/// Reserved `xml:` prefix namespace
pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
