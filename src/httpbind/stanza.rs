//! Stanzas as they travel through the session layer.
//!
//! A [`Stanza`] is an immutable, already-serialised copy of one top-level
//! XMPP element. Outbound stanzas may sit in a session's pending queue or
//! sent history for a while, so they are never mutated after being queued.

use std::borrow::Cow;
use std::sync::Arc;

use quick_xml::events::Event;
use quick_xml::Reader;

use super::error::BodyError;

/// Default namespace XEP-0206 requires on stanzas inside a `<body/>`.
pub const JABBER_CLIENT_NS: &str = "jabber:client";

const SASL_NS: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// Top-level element kinds the connection manager distinguishes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
    /// SASL negotiation elements (`<auth/>`, `<response/>`, `<abort/>`).
    Sasl,
    /// Anything else; carries the local element name.
    Other(String),
}

impl StanzaKind {
    fn classify(local_name: &str, xmlns: Option<&str>) -> Self {
        match local_name {
            "message" => StanzaKind::Message,
            "presence" => StanzaKind::Presence,
            "iq" => StanzaKind::Iq,
            "auth" | "response" | "abort" if xmlns.map_or(true, |ns| ns == SASL_NS) => {
                StanzaKind::Sasl
            }
            other => StanzaKind::Other(other.to_string()),
        }
    }

    /// Whether a client may send this element through a BOSH session.
    pub fn is_routable(&self) -> bool {
        !matches!(self, StanzaKind::Other(_))
    }

    /// Whether the element uses the `jabber:client` default namespace.
    fn is_client_stanza(&self) -> bool {
        matches!(self, StanzaKind::Message | StanzaKind::Presence | StanzaKind::Iq)
    }

    pub fn name(&self) -> &str {
        match self {
            StanzaKind::Message => "message",
            StanzaKind::Presence => "presence",
            StanzaKind::Iq => "iq",
            StanzaKind::Sasl => "sasl",
            StanzaKind::Other(name) => name,
        }
    }
}

/// One serialised top-level XMPP element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    kind: StanzaKind,
    xml: Arc<str>,
}

impl Stanza {
    /// Parse the root element of `xml` to classify it.
    ///
    /// The text itself is kept verbatim; only the start tag is inspected.
    pub fn parse(xml: impl Into<String>) -> Result<Self, BodyError> {
        let xml: String = xml.into();
        let kind = {
            let mut reader = Reader::from_str(&xml);
            reader.config_mut().check_end_names = false;

            loop {
                match reader.read_event()? {
                    Event::Start(e) | Event::Empty(e) => {
                        let local_name = String::from_utf8_lossy(e.name().local_name().as_ref())
                            .into_owned();
                        let mut xmlns = None;
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"xmlns" {
                                xmlns = Some(String::from_utf8_lossy(&attr.value).into_owned());
                            }
                        }
                        break StanzaKind::classify(&local_name, xmlns.as_deref());
                    }
                    Event::Eof => return Err(BodyError::Empty),
                    // Declarations, whitespace, comments before the root
                    _ => continue,
                }
            }
        };

        Ok(Self {
            kind,
            xml: xml.trim().into(),
        })
    }

    pub fn kind(&self) -> &StanzaKind {
        &self.kind
    }

    pub fn is_message(&self) -> bool {
        self.kind == StanzaKind::Message
    }

    /// The element exactly as it was received or produced.
    pub fn as_xml(&self) -> &str {
        &self.xml
    }

    /// The element as it must appear inside a response `<body/>`.
    ///
    /// XEP-0206 requires `message`, `presence` and `iq` children to carry the
    /// `jabber:client` namespace explicitly, since the `<body/>` wrapper
    /// declares the httpbind namespace as default.
    pub fn to_body_xml(&self) -> Cow<'_, str> {
        if !self.kind.is_client_stanza() {
            return Cow::Borrowed(&self.xml);
        }

        let xml: &str = &self.xml;
        let root_tag_end = xml.find('>').unwrap_or(xml.len());
        if xml[..root_tag_end].contains("xmlns=") {
            return Cow::Borrowed(xml);
        }

        // Inject after the element name, before ' ', '/' or '>'
        match xml[1..].find([' ', '>', '/', '\t', '\n', '\r']) {
            Some(offset) => {
                let pos = offset + 1;
                let xmlns_attr = format!(" xmlns=\"{JABBER_CLIENT_NS}\"");
                let mut rewritten = String::with_capacity(xml.len() + xmlns_attr.len());
                rewritten.push_str(&xml[..pos]);
                rewritten.push_str(&xmlns_attr);
                rewritten.push_str(&xml[pos..]);
                Cow::Owned(rewritten)
            }
            None => Cow::Borrowed(xml),
        }
    }
}
