//! BOSH (XEP-0124/XEP-0206) session layer.
//!
//! [`HttpSessionManager`] is the entry point: it creates sessions for
//! session-less requests, forwards the others to their session, and keeps
//! the registry and the inactivity timers in sync with session lifecycles.

pub mod body;
pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod services;
pub mod session;
pub mod stanza;
pub mod stream_id;
pub mod timer;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use body::BoshBody;
use config::BoshConfig;
use connection::HttpConnection;
use error::{BindError, RouteError};
use listener::{SessionEvent, SessionListener};
use services::Services;
use session::{HttpSession, SessionSettings, SessionStats};
use stream_id::StreamId;
use timer::InactivityTimer;

/// Attempts at drawing a stream id that is not already taken.
const STREAM_ID_ATTEMPTS: usize = 8;

/// Snapshot of every live session.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub session_count: usize,
    pub sessions: Vec<SessionStats>,
}

struct ManagerInner {
    config: BoshConfig,
    services: Services,
    sessions: RwLock<HashMap<StreamId, Arc<HttpSession>>>,
    timer: InactivityTimer,
}

impl ManagerInner {
    fn lookup(&self, stream_id: &StreamId) -> Option<Arc<HttpSession>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(stream_id)
            .cloned()
    }

    fn unregister(&self, stream_id: &StreamId) -> Option<Arc<HttpSession>> {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(stream_id)
    }
}

/// Keeps registry and timers in step with one session.
struct SessionTracker {
    manager: Weak<ManagerInner>,
}

impl SessionListener for SessionTracker {
    fn on_event(&self, stream_id: &StreamId, event: &SessionEvent) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        match event {
            // Events from concurrent requests can arrive out of order, the
            // timer reads the session's current connections instead
            SessionEvent::ConnectionOpened { .. } | SessionEvent::ConnectionClosed { .. } => {
                if let Some(session) = manager.lookup(stream_id) {
                    manager.timer.sync(&session);
                }
            }
            SessionEvent::SessionClosed => {
                manager.timer.stop(stream_id);
                if manager.unregister(stream_id).is_some() {
                    debug!(stream_id = %stream_id, "BOSH session unregistered");
                }
            }
        }
    }
}

/// Registry and top-level operations of the BOSH session layer.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct HttpSessionManager {
    inner: Arc<ManagerInner>,
}

impl HttpSessionManager {
    /// Create a manager whose inactivity timers run on the current Tokio
    /// runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(config: BoshConfig, services: Services) -> Self {
        Self::with_runtime(config, services, Handle::current())
    }

    pub fn with_runtime(config: BoshConfig, services: Services, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                services,
                sessions: RwLock::new(HashMap::new()),
                timer: InactivityTimer::new(runtime),
            }),
        }
    }

    pub fn config(&self) -> &BoshConfig {
        &self.inner.config
    }

    /// Dispatch a parsed request: create a session when it carries no `sid`,
    /// forward it to its session otherwise.
    pub fn handle_request(
        &self,
        remote_addr: SocketAddr,
        body: &BoshBody,
        is_secure: bool,
    ) -> Result<(Arc<HttpSession>, Arc<HttpConnection>), BindError> {
        let rid = body.rid().ok_or_else(|| BindError::bad_request("missing rid"))?;
        match body.session_id() {
            None => self.create_session(remote_addr, body, is_secure),
            Some(sid) => {
                let session = self.get_session(sid)?;
                let connection = self.forward_request(rid, &session, is_secure, body)?;
                Ok((session, connection))
            }
        }
    }

    /// Create a session for a request without `sid` and answer it.
    ///
    /// The returned connection already carries the creation response.
    pub fn create_session(
        &self,
        remote_addr: SocketAddr,
        body: &BoshBody,
        is_secure: bool,
    ) -> Result<(Arc<HttpSession>, Arc<HttpConnection>), BindError> {
        let rid = positive_rid(body.rid())?;
        let config = &self.inner.config;

        let wait = body.requested_wait().unwrap_or(config.default_wait).min(config.max_wait);
        let hold = body
            .requested_hold()
            .unwrap_or(config.default_hold)
            .min(config.max_hold());
        let settings = SessionSettings {
            wait,
            hold,
            language: body.lang().unwrap_or("en").to_string(),
            secure: is_secure,
            max_requests: config.max_requests,
            polling_interval: config.polling_interval(),
            inactivity_timeout: config.inactivity_timeout(),
            max_pause: config.max_pause(),
            version: body.version(),
        };

        let session = {
            let mut sessions = self.inner.sessions.write().unwrap_or_else(|e| e.into_inner());
            let stream_id = (0..STREAM_ID_ATTEMPTS)
                .map(|_| self.inner.services.stream_ids.next_id())
                .find(|id| !sessions.contains_key(id))
                .ok_or_else(|| {
                    error!("Stream id generator keeps returning ids in use");
                    BindError::internal("could not allocate a stream id")
                })?;

            let session = Arc::new(HttpSession::new(
                stream_id.clone(),
                remote_addr,
                settings,
                self.inner.services.features.clone(),
                self.inner.services.offline.clone(),
            ));
            session.add_listener(Arc::new(SessionTracker {
                manager: Arc::downgrade(&self.inner),
            }));
            sessions.insert(stream_id, session.clone());
            session
        };

        let connection = match session.open(rid, &config.server_name) {
            Ok(connection) => connection,
            Err(e) => {
                session.close();
                return Err(e);
            }
        };

        if !body.is_poll() {
            debug!(
                stream_id = %session.stream_id(),
                stanzas = body.stanzas().len(),
                "Ignoring payload of session creation request"
            );
        }

        info!(
            stream_id = %session.stream_id(),
            remote_addr = %remote_addr,
            rid,
            wait,
            hold,
            secure = is_secure,
            ver = %session.version(),
            "BOSH session created"
        );
        Ok((session, connection))
    }

    /// Live session named `sid`.
    pub fn get_session(&self, sid: &str) -> Result<Arc<HttpSession>, BindError> {
        self.inner
            .lookup(&StreamId::from(sid))
            .filter(|session| !session.is_closed())
            .ok_or_else(|| BindError::session_not_found(format!("no session with sid {sid}")))
    }

    /// Forward request `rid` to `session` and route its stanzas.
    ///
    /// Elements that are not stanzas reject the whole request before the
    /// session sees it. Stanzas of a retransmitted request are not routed
    /// again.
    pub fn forward_request(
        &self,
        rid: i64,
        session: &Arc<HttpSession>,
        is_secure: bool,
        body: &BoshBody,
    ) -> Result<Arc<HttpConnection>, BindError> {
        let rid = positive_rid(Some(rid))?;

        if let Some(stanza) = body.stanzas().iter().find(|s| !s.kind().is_routable()) {
            let err = RouteError::UnknownStanza(stanza.kind().name().to_string());
            warn!(stream_id = %session.stream_id(), rid, error = %err, "Rejecting request");
            return Err(err.into());
        }

        let admission = if body.is_terminate() {
            session.create_terminate_connection(rid, is_secure)?
        } else if let Some(pause) = body.pause() {
            session.create_pause_connection(rid, is_secure, Duration::from_secs(pause))?
        } else if body.is_restart() {
            session.create_restart_connection(rid, is_secure)?
        } else {
            session.create_connection(rid, body.is_poll(), is_secure)?
        };

        let routed = if admission.replayed {
            Ok(())
        } else {
            self.route_stanzas(session, rid, body)
        };

        if body.is_terminate() {
            info!(stream_id = %session.stream_id(), rid, "BOSH session terminated by client");
            session.close();
        }

        if let Err(e) = routed {
            // Answered with an error status, not through the connection
            session.abandon_connection(rid);
            return Err(e.into());
        }
        Ok(admission.connection)
    }

    /// Route the stanzas of request `rid` in order.
    ///
    /// Stanzas the server refuses are logged and skipped. One the server
    /// cannot decode stops routing and fails the request.
    fn route_stanzas(
        &self,
        session: &HttpSession,
        rid: u64,
        body: &BoshBody,
    ) -> Result<(), RouteError> {
        for stanza in body.stanzas() {
            let kind = stanza.kind().name().to_string();
            match self.inner.services.router.route(session.stream_id(), stanza.clone()) {
                Ok(()) => {
                    session.increment_client_packets();
                    debug!(stream_id = %session.stream_id(), rid, kind = %kind, "Stanza routed");
                }
                Err(e @ RouteError::Rejected(_)) => {
                    error!(stream_id = %session.stream_id(), rid, kind = %kind, error = %e, "Failed to route stanza");
                }
                Err(e) => {
                    warn!(stream_id = %session.stream_id(), rid, kind = %kind, error = %e, "Rejecting request");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Close a session by id. Returns `false` if it was not registered.
    pub fn close_session(&self, stream_id: &StreamId) -> bool {
        match self.inner.lookup(stream_id) {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Close every live session.
    pub fn shutdown(&self) {
        let sessions: Vec<_> = self
            .inner
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        info!(sessions = sessions.len(), "Closing all BOSH sessions");
        for session in sessions {
            session.close();
        }
        self.inner.timer.stop_all();
    }

    pub fn session_count(&self) -> usize {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn stats(&self) -> ManagerStats {
        let sessions: Vec<_> = self
            .inner
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut stats: Vec<SessionStats> = sessions.iter().map(|s| s.stats()).collect();
        stats.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        ManagerStats {
            session_count: stats.len(),
            sessions: stats,
        }
    }

    /// Number of idle sessions whose inactivity countdown is running.
    pub fn idle_session_count(&self) -> usize {
        self.inner.timer.armed()
    }
}

fn positive_rid(rid: Option<i64>) -> Result<u64, BindError> {
    match rid {
        Some(rid) if rid > 0 => Ok(rid as u64),
        Some(rid) => Err(BindError::bad_request(format!("rid must be positive, got {rid}"))),
        None => Err(BindError::bad_request("missing rid")),
    }
}
