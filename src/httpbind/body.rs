//! BOSH `<body/>` framing: request parsing and response construction.
//!
//! Every HTTP request and response in a BOSH session is a single `<body/>`
//! element in the `http://jabber.org/protocol/httpbind` namespace. Requests
//! carry session bookkeeping as attributes and zero or more stanzas as
//! children; responses wrap whatever the session has queued for the client.

use std::fmt::Write as _;
use std::str::FromStr;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::error::BodyError;
use super::stanza::Stanza;

pub const HTTPBIND_NS: &str = "http://jabber.org/protocol/httpbind";
pub const XBOSH_NS: &str = "urn:xmpp:xbosh";
pub const STREAM_NS: &str = "http://etherx.jabber.org/streams";

/// BOSH protocol version negotiated with a client.
///
/// Only 1.5 and 1.6 are distinguished: anything at or below 1.5 is treated
/// as 1.5, anything above as 1.6. Clients that omit `ver` get 1.5, the last
/// revision that did not require it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoshVersion {
    pub major: u32,
    pub minor: u32,
}

impl BoshVersion {
    pub const DEFAULT: BoshVersion = BoshVersion { major: 1, minor: 5 };

    fn negotiate(requested: Option<&str>) -> Self {
        let Some((major, minor)) = requested.and_then(|ver| ver.trim().split_once('.')) else {
            return Self::DEFAULT;
        };
        match (major.parse::<u32>(), minor.parse::<u32>()) {
            (Ok(1), Ok(minor)) => BoshVersion {
                major: 1,
                minor: if minor <= 5 { 5 } else { 6 },
            },
            _ => Self::DEFAULT,
        }
    }
}

impl Default for BoshVersion {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl std::fmt::Display for BoshVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A parsed client request.
#[derive(Debug, Clone, Default)]
pub struct BoshBody {
    rid: Option<i64>,
    sid: Option<String>,
    wait: Option<u64>,
    hold: Option<u32>,
    lang: Option<String>,
    body_type: Option<String>,
    ver: Option<String>,
    pause: Option<u64>,
    to: Option<String>,
    restart: bool,
    stanzas: Vec<Stanza>,
}

impl BoshBody {
    /// Parse an HTTP request payload.
    ///
    /// The root must be a `<body/>`; its top-level children are extracted
    /// verbatim in document order.
    pub fn parse(text: &str) -> Result<Self, BodyError> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(false);
        reader.config_mut().check_end_names = false;

        let (mut body, self_closing) = loop {
            match reader.read_event()? {
                Event::Start(e) => break (Self::from_start_tag(&e)?, false),
                Event::Empty(e) => break (Self::from_start_tag(&e)?, true),
                Event::Eof => return Err(BodyError::Empty),
                // XML declaration, whitespace, comments
                _ => continue,
            }
        };

        if self_closing {
            return Ok(body);
        }

        let mut depth: u32 = 0;
        let mut stanza_start: usize = 0;
        loop {
            let pos = reader.buffer_position() as usize;
            match reader.read_event()? {
                Event::Start(_) => {
                    if depth == 0 {
                        stanza_start = pos;
                    }
                    depth += 1;
                }
                Event::Empty(_) => {
                    if depth == 0 {
                        let end = reader.buffer_position() as usize;
                        body.stanzas.push(Stanza::parse(&text[pos..end])?);
                    }
                }
                Event::End(_) => {
                    if depth == 0 {
                        // </body>
                        break;
                    }
                    depth -= 1;
                    if depth == 0 {
                        let end = reader.buffer_position() as usize;
                        body.stanzas.push(Stanza::parse(&text[stanza_start..end])?);
                    }
                }
                Event::Eof => return Err(BodyError::Unterminated),
                _ => {}
            }
        }

        Ok(body)
    }

    fn from_start_tag(e: &BytesStart<'_>) -> Result<Self, BodyError> {
        let local_name = e.name().local_name();
        if local_name.as_ref() != b"body" {
            return Err(BodyError::NotABody(
                String::from_utf8_lossy(e.name().as_ref()).into_owned(),
            ));
        }

        let mut body = BoshBody::default();
        for attr in e.attributes().flatten() {
            let key = String::from_utf8_lossy(attr.key.as_ref());
            let value = String::from_utf8_lossy(&attr.value);
            match &*key {
                "rid" => body.rid = Some(parse_attr("rid", &value)?),
                "sid" => body.sid = Some(value.into_owned()),
                "wait" => body.wait = Some(parse_attr("wait", &value)?),
                "hold" => body.hold = Some(parse_attr("hold", &value)?),
                "xml:lang" => body.lang = Some(value.into_owned()),
                "type" => body.body_type = Some(value.into_owned()),
                "ver" => body.ver = Some(value.into_owned()),
                "pause" => body.pause = Some(parse_attr("pause", &value)?),
                "to" => body.to = Some(value.into_owned()),
                key if key.ends_with(":restart") => {
                    body.restart = matches!(value.trim(), "true" | "1");
                }
                _ => {} // xmlns declarations, content, route, secure, ...
            }
        }
        Ok(body)
    }

    /// Builder-style constructor, mostly for tests and embedders.
    pub fn with_rid(rid: i64) -> Self {
        Self {
            rid: Some(rid),
            ..Self::default()
        }
    }

    pub fn sid(mut self, sid: impl Into<String>) -> Self {
        self.sid = Some(sid.into());
        self
    }

    pub fn wait(mut self, wait: u64) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn hold(mut self, hold: u32) -> Self {
        self.hold = Some(hold);
        self
    }

    /// Client-supplied request id, if present.
    pub fn rid(&self) -> Option<i64> {
        self.rid
    }

    pub fn session_id(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    pub fn requested_wait(&self) -> Option<u64> {
        self.wait
    }

    pub fn requested_hold(&self) -> Option<u32> {
        self.hold
    }

    pub fn lang(&self) -> Option<&str> {
        self.lang.as_deref()
    }

    pub fn to(&self) -> Option<&str> {
        self.to.as_deref()
    }

    pub fn pause(&self) -> Option<u64> {
        self.pause
    }

    pub fn version(&self) -> BoshVersion {
        BoshVersion::negotiate(self.ver.as_deref())
    }

    /// `type='terminate'`: the client is ending the session.
    pub fn is_terminate(&self) -> bool {
        self.body_type.as_deref() == Some("terminate")
    }

    /// `xmpp:restart='true'`: the client restarts the XMPP stream.
    pub fn is_restart(&self) -> bool {
        self.restart
    }

    /// A request without children only asks for data.
    pub fn is_poll(&self) -> bool {
        self.stanzas.is_empty()
    }

    pub fn stanzas(&self) -> &[Stanza] {
        &self.stanzas
    }
}

fn parse_attr<T: FromStr>(name: &'static str, value: &str) -> Result<T, BodyError> {
    value
        .trim()
        .parse()
        .map_err(|_| BodyError::InvalidAttribute {
            name,
            value: value.to_string(),
        })
}

/// One unit of content queued for a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deliverable {
    /// A copy of an outbound stanza.
    Stanza(Stanza),
    /// Raw XML inlined verbatim.
    Text(String),
}

impl Deliverable {
    pub fn stanza(&self) -> Option<&Stanza> {
        match self {
            Deliverable::Stanza(stanza) => Some(stanza),
            Deliverable::Text(_) => None,
        }
    }

    fn write_to(&self, out: &mut String) {
        match self {
            Deliverable::Stanza(stanza) => out.push_str(&stanza.to_body_xml()),
            Deliverable::Text(text) => out.push_str(text),
        }
    }
}

/// Wrap queued items in a single response `<body/>`.
pub fn wrap(items: &[Deliverable]) -> String {
    if items.is_empty() {
        return empty_body();
    }
    let mut out = format!("<body xmlns='{HTTPBIND_NS}'>");
    for item in items {
        item.write_to(&mut out);
    }
    out.push_str("</body>");
    out
}

/// Response to a request the server has nothing to answer with.
pub fn empty_body() -> String {
    format!("<body xmlns='{HTTPBIND_NS}'/>")
}

/// Response ending a session, optionally with a terminal binding condition.
pub fn terminate_body(condition: Option<&str>) -> String {
    match condition {
        Some(condition) => format!(
            "<body xmlns='{HTTPBIND_NS}' type='terminate' condition='{}'/>",
            escape(condition)
        ),
        None => format!("<body xmlns='{HTTPBIND_NS}' type='terminate'/>"),
    }
}

/// Response to an `xmpp:restart` request: fresh stream features only.
pub fn restart_body(features: &[String]) -> String {
    format!(
        "<body xmlns='{HTTPBIND_NS}' xmlns:stream='{STREAM_NS}'>{}</body>",
        stream_features(features)
    )
}

fn stream_features(features: &[String]) -> String {
    let mut out = String::from("<stream:features>");
    for feature in features {
        out.push_str(feature);
    }
    out.push_str("</stream:features>");
    out
}

/// Session creation response (XEP-0124 section 7.1, XEP-0206 section 5).
#[derive(Debug, Clone)]
pub struct CreationResponse<'a> {
    pub sid: &'a str,
    pub from: &'a str,
    pub wait: u64,
    pub hold: u32,
    pub requests: u32,
    pub inactivity: u64,
    pub polling: u64,
    pub max_pause: u64,
    pub secure: bool,
    pub lang: &'a str,
    pub version: BoshVersion,
    pub features: &'a [String],
}

impl CreationResponse<'_> {
    pub fn to_xml(&self) -> String {
        let mut out = String::with_capacity(512);
        // Writing into a String cannot fail
        let _ = write!(
            out,
            "<body xmlns='{HTTPBIND_NS}' xmlns:stream='{STREAM_NS}' xmlns:xmpp='{XBOSH_NS}' \
             from='{from}' authid='{sid}' sid='{sid}' secure='{secure}' requests='{requests}' \
             inactivity='{inactivity}' polling='{polling}' wait='{wait}' hold='{hold}' \
             maxpause='{max_pause}' ver='{version}' xml:lang='{lang}' xmpp:version='1.0'>",
            from = escape(self.from),
            sid = escape(self.sid),
            secure = self.secure,
            requests = self.requests,
            inactivity = self.inactivity,
            polling = self.polling,
            wait = self.wait,
            hold = self.hold,
            max_pause = self.max_pause,
            version = self.version,
            lang = escape(self.lang),
        );
        out.push_str(&stream_features(self.features));
        out.push_str("</body>");
        out
    }
}
