//! Stream identifiers for BOSH sessions.
//!
//! The `sid` handed to a client doubles as the XMPP stream id (`authid`), so
//! it must be unique for the lifetime of the server and unguessable.

use std::fmt;
use std::sync::Arc;

/// Opaque, immutable identifier of one BOSH session.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(Arc<str>);

impl StreamId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Source of fresh stream identifiers.
pub trait StreamIdGenerator: Send + Sync + 'static {
    fn next_id(&self) -> StreamId;
}

/// Random v4 UUIDs in their compact 32 hex digit form.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomStreamIds;

impl StreamIdGenerator for RandomStreamIds {
    fn next_id(&self) -> StreamId {
        StreamId::new(uuid::Uuid::new_v4().simple().to_string())
    }
}
