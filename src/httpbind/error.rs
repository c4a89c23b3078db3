//! Error types for the BOSH session layer.
//!
//! Protocol rejections are plain data: a [`BindError`] carries the
//! XEP-0124 condition, which in turn knows the HTTP status to answer with
//! and whether the session has to be torn down. The HTTP front end decides
//! what to do with it; nothing in the session layer unwinds.

use std::borrow::Cow;
use std::fmt;

use thiserror::Error;

/// XEP-0124 binding conditions used by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindCondition {
    /// Malformed request, missing or non-positive `rid`, unknown stanza type.
    BadRequest,
    /// Too-frequent polling, insecure connection on a secure session.
    PolicyViolation,
    /// Unrecoverable `rid` sequencing error. The session must be closed.
    ItemNotFound,
    /// The `sid` does not name a live session.
    SessionNotFound,
    /// Something went wrong on our side while creating a session.
    InternalServerError,
}

impl BindCondition {
    /// HTTP status code used to signal this condition.
    pub const fn status(self) -> u16 {
        match self {
            BindCondition::BadRequest => 400,
            BindCondition::PolicyViolation => 403,
            BindCondition::ItemNotFound | BindCondition::SessionNotFound => 404,
            BindCondition::InternalServerError => 500,
        }
    }

    /// Whether the session that produced this error must be closed.
    pub const fn closes_session(self) -> bool {
        matches!(self, BindCondition::ItemNotFound)
    }

    /// Condition name as used in terminate bodies.
    pub const fn as_str(self) -> &'static str {
        match self {
            BindCondition::BadRequest => "bad-request",
            BindCondition::PolicyViolation => "policy-violation",
            BindCondition::ItemNotFound | BindCondition::SessionNotFound => "item-not-found",
            BindCondition::InternalServerError => "internal-server-error",
        }
    }
}

impl fmt::Display for BindCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected BOSH request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{condition} ({status}): {message}", status = .condition.status())]
pub struct BindError {
    condition: BindCondition,
    message: Cow<'static, str>,
}

impl BindError {
    pub fn new(condition: BindCondition, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            condition,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(BindCondition::BadRequest, message)
    }

    pub fn policy_violation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(BindCondition::PolicyViolation, message)
    }

    pub fn item_not_found(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(BindCondition::ItemNotFound, message)
    }

    pub fn session_not_found(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(BindCondition::SessionNotFound, message)
    }

    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(BindCondition::InternalServerError, message)
    }

    pub const fn condition(&self) -> BindCondition {
        self.condition
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// HTTP status code to answer the request with.
    pub const fn status(&self) -> u16 {
        self.condition.status()
    }

    /// Whether the HTTP layer must close the session after answering.
    pub const fn closes_session(&self) -> bool {
        self.condition.closes_session()
    }
}

/// Delivery was attempted on a connection that is no longer pending.
///
/// Callers must fall back (next held connection, pending queue, offline
/// storage); this never reaches the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("HTTP connection for rid {rid} is already closed")]
pub struct ConnectionClosed {
    pub rid: u64,
}

/// Problem while parsing a request `<body/>`.
#[derive(Debug, Error)]
pub enum BodyError {
    /// The payload is not well-formed XML.
    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// The payload contained no element at all.
    #[error("request body is empty")]
    Empty,

    /// The root element is not a BOSH `<body/>`.
    #[error("root element must be <body/>, found <{0}>")]
    NotABody(String),

    /// The `<body>` start tag was never closed.
    #[error("unterminated <body> element")]
    Unterminated,

    /// A numeric or boolean attribute could not be parsed.
    #[error("invalid value '{value}' for attribute '{name}'")]
    InvalidAttribute { name: &'static str, value: String },
}

impl From<BodyError> for BindError {
    fn from(err: BodyError) -> Self {
        BindError::bad_request(err.to_string())
    }
}

/// Problem while routing a client stanza into the server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    /// The element is not a stanza the server knows how to route.
    #[error("unknown stanza type <{0}>")]
    UnknownStanza(String),

    /// The stanza used an encoding the server does not support.
    #[error("unsupported encoding: {0}")]
    Encoding(String),

    /// The server refused the stanza.
    #[error("stanza rejected: {0}")]
    Rejected(String),
}

impl From<RouteError> for BindError {
    fn from(err: RouteError) -> Self {
        BindError::bad_request(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_status_codes() {
        assert_eq!(BindCondition::BadRequest.status(), 400);
        assert_eq!(BindCondition::PolicyViolation.status(), 403);
        assert_eq!(BindCondition::ItemNotFound.status(), 404);
        assert_eq!(BindCondition::SessionNotFound.status(), 404);
        assert_eq!(BindCondition::InternalServerError.status(), 500);
    }

    #[test]
    fn test_only_item_not_found_closes_session() {
        assert!(BindError::item_not_found("Unexpected RID error.").closes_session());
        assert!(!BindError::session_not_found("gone").closes_session());
        assert!(!BindError::policy_violation("slow down").closes_session());
        assert!(!BindError::bad_request("no rid").closes_session());
    }

    #[test]
    fn test_bind_error_display() {
        let err = BindError::policy_violation("Overactivity detected");
        assert_eq!(
            format!("{err}"),
            "policy-violation (403): Overactivity detected"
        );
    }

    #[test]
    fn test_body_error_becomes_bad_request() {
        let err: BindError = BodyError::NotABody("iq".to_string()).into();
        assert_eq!(err.condition(), BindCondition::BadRequest);
        assert!(err.message().contains("<iq>"));
    }

    #[test]
    fn test_connection_closed_displays_rid() {
        let err = ConnectionClosed { rid: 42 };
        assert_eq!(format!("{err}"), "HTTP connection for rid 42 is already closed");
    }
}
