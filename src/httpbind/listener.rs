//! Session lifecycle notifications.

use super::stream_id::StreamId;

/// Something that happened to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A connection was admitted and counts as open.
    ConnectionOpened { rid: u64 },
    /// A connection was answered or torn down. `open_connections` is the
    /// number of connections the session still holds afterwards.
    ConnectionClosed { rid: u64, open_connections: usize },
    /// The session reached its terminal state. Sent once, last.
    SessionClosed,
}

/// Observer of session events.
///
/// Events are delivered after the session released its lock, so
/// implementations may call back into the session or its manager.
pub trait SessionListener: Send + Sync {
    fn on_event(&self, stream_id: &StreamId, event: &SessionEvent);
}
