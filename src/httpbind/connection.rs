//! One HTTP request/response cycle of a BOSH session.
//!
//! An [`HttpConnection`] is a single-slot cell: the session fills it at most
//! once, the HTTP handler that owns the request waits on it. A connection is
//! either still pending, fulfilled with a response body, or closed without
//! one. Both terminal transitions happen exactly once.

use std::time::Instant;

use tokio::sync::watch;

use super::error::ConnectionClosed;

/// Observable state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for something to send to the client.
    Pending,
    /// A response body was handed over.
    Fulfilled(String),
    /// Torn down without a response body.
    Closed,
}

impl ConnectionState {
    pub fn is_pending(&self) -> bool {
        matches!(self, ConnectionState::Pending)
    }
}

#[derive(Debug)]
pub struct HttpConnection {
    rid: u64,
    secure: bool,
    created_at: Instant,
    state: watch::Sender<ConnectionState>,
}

impl HttpConnection {
    pub fn new(rid: u64, secure: bool) -> Self {
        let (state, _) = watch::channel(ConnectionState::Pending);
        Self {
            rid,
            secure,
            created_at: Instant::now(),
            state,
        }
    }

    /// Client request id this connection answers.
    pub fn rid(&self) -> u64 {
        self.rid
    }

    /// Whether the request arrived over a secured transport.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Hand `body` to the client.
    ///
    /// Fails if the connection was already fulfilled or closed, in which case
    /// the body was not consumed by anyone and the caller has to find it
    /// another home.
    pub fn deliver_body(&self, body: String) -> Result<(), ConnectionClosed> {
        let mut delivered = false;
        self.state.send_if_modified(|state| {
            if !state.is_pending() {
                return false;
            }
            *state = ConnectionState::Fulfilled(body);
            delivered = true;
            true
        });

        if delivered {
            Ok(())
        } else {
            Err(ConnectionClosed { rid: self.rid })
        }
    }

    /// Close without a response body. Returns `false` if the connection had
    /// already reached a terminal state.
    pub fn close(&self) -> bool {
        self.state.send_if_modified(|state| {
            if !state.is_pending() {
                return false;
            }
            *state = ConnectionState::Closed;
            true
        })
    }

    pub fn is_pending(&self) -> bool {
        self.state.borrow().is_pending()
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Closed)
    }

    /// Current state without waiting.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Wait until the connection is fulfilled or closed.
    ///
    /// Cancel-safe: dropping the future leaves the connection untouched, so
    /// the HTTP layer can race it against the `wait` deadline.
    pub async fn resolved(&self) -> ConnectionState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|state| !state.is_pending()).await {
            Ok(state) => state.clone(),
            // The sender lives in `self`, it cannot be gone while we borrow it
            Err(_) => ConnectionState::Closed,
        };
        state
    }
}
