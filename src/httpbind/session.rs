//! The BOSH session state machine.
//!
//! A session is `ACTIVE` until [`HttpSession::close`] makes it `CLOSED`.
//! All mutable state lives behind one mutex per session: request admission,
//! stanza delivery and closing serialize on it, while different sessions
//! never contend. Listeners are always notified after the lock is released.

use std::collections::{BTreeSet, VecDeque};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use quick_xml::escape::escape;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::body::{self, BoshVersion, CreationResponse, Deliverable};
use super::connection::HttpConnection;
use super::error::{BindError, ConnectionClosed};
use super::listener::{SessionEvent, SessionListener};
use super::services::{FeatureProvider, OfflineStore};
use super::stanza::Stanza;
use super::stream_id::StreamId;

/// Parameters fixed when a session is created.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Seconds a request may be held before it is answered empty.
    pub wait: u64,
    /// Max connections held at once. Zero means pure polling.
    pub hold: u32,
    pub language: String,
    /// Every connection of the session must be secure.
    pub secure: bool,
    /// Advertised max simultaneous requests.
    pub max_requests: u32,
    pub polling_interval: Duration,
    pub inactivity_timeout: Duration,
    pub max_pause: Duration,
    pub version: BoshVersion,
}

/// Outcome of admitting a request.
#[derive(Debug, Clone)]
pub struct Admission {
    pub connection: Arc<HttpConnection>,
    /// The rid was already processed. Its payload must not be routed again.
    pub replayed: bool,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub stream_id: String,
    pub remote_addr: String,
    pub hold: u32,
    pub wait: u64,
    pub secure: bool,
    pub last_request_id: u64,
    pub held_connections: usize,
    pub pending: usize,
    pub client_packets: u64,
    pub idle_secs: u64,
}

/// How an admitted request is answered.
enum Reply {
    /// With pending data now, or held until some arrives.
    Data { is_poll: bool },
    /// Right away with this body.
    Now(String),
}

struct SessionState {
    last_rid: u64,
    /// Skipped rids below `last_rid` that have not been seen yet.
    gaps: BTreeSet<u64>,
    pending: Vec<Deliverable>,
    /// Responses by rid, oldest first, at most `hold + 1`.
    sent: VecDeque<(u64, String)>,
    /// Held connections ordered by rid.
    held: VecDeque<Arc<HttpConnection>>,
    last_poll: Option<Instant>,
    last_response_empty: bool,
    last_activity: Instant,
    paused: bool,
    closed: bool,
}

impl SessionState {
    fn record_sent(&mut self, rid: u64, body: String, limit: usize) {
        self.sent.push_back((rid, body));
        while self.sent.len() > limit {
            self.sent.pop_front();
        }
    }

    fn sent_for(&self, rid: u64) -> Option<&str> {
        self.sent
            .iter()
            .find(|(sent_rid, _)| *sent_rid == rid)
            .map(|(_, body)| body.as_str())
    }

    fn advance_rid(&mut self, rid: u64, window: u64) {
        if rid > self.last_rid {
            self.gaps.extend(self.last_rid + 1..rid);
            self.last_rid = rid;
            let floor = rid.saturating_sub(window);
            self.gaps.retain(|gap| *gap > floor);
        } else {
            self.gaps.remove(&rid);
        }
    }
}

pub struct HttpSession {
    stream_id: StreamId,
    remote_addr: SocketAddr,
    settings: SessionSettings,
    /// Read by the inactivity timer without taking the session lock.
    inactivity_secs: AtomicU64,
    client_packets: AtomicU64,
    features: Arc<dyn FeatureProvider>,
    offline: Arc<dyn OfflineStore>,
    state: Mutex<SessionState>,
    listeners: Mutex<Vec<Arc<dyn SessionListener>>>,
}

impl HttpSession {
    pub fn new(
        stream_id: StreamId,
        remote_addr: SocketAddr,
        settings: SessionSettings,
        features: Arc<dyn FeatureProvider>,
        offline: Arc<dyn OfflineStore>,
    ) -> Self {
        Self {
            stream_id,
            remote_addr,
            inactivity_secs: AtomicU64::new(settings.inactivity_timeout.as_secs()),
            settings,
            client_packets: AtomicU64::new(0),
            features,
            offline,
            state: Mutex::new(SessionState {
                last_rid: 0,
                gaps: BTreeSet::new(),
                pending: Vec::new(),
                sent: VecDeque::new(),
                held: VecDeque::new(),
                last_poll: None,
                last_response_empty: false,
                last_activity: Instant::now(),
                paused: false,
                closed: false,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn wait(&self) -> u64 {
        self.settings.wait
    }

    pub fn hold(&self) -> u32 {
        self.settings.hold
    }

    pub fn language(&self) -> &str {
        &self.settings.language
    }

    pub fn is_secure(&self) -> bool {
        self.settings.secure
    }

    pub fn version(&self) -> BoshVersion {
        self.settings.version
    }

    pub fn polling_interval(&self) -> Duration {
        self.settings.polling_interval
    }

    /// Sessions that cannot hold requests are rate limited.
    pub fn is_polling_session(&self) -> bool {
        self.settings.hold == 0 || self.settings.wait == 0
    }

    /// Current inactivity timeout, which a pause may have raised.
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_secs.load(Ordering::Relaxed))
    }

    pub fn last_request_id(&self) -> u64 {
        self.lock_state().last_rid
    }

    pub fn last_activity(&self) -> Instant {
        self.lock_state().last_activity
    }

    pub fn held_connections(&self) -> usize {
        self.lock_state().held.len()
    }

    /// Held connections, or `None` once the session is closed.
    pub fn open_connections(&self) -> Option<usize> {
        let state = self.lock_state();
        (!state.closed).then(|| state.held.len())
    }

    pub fn pending_count(&self) -> usize {
        self.lock_state().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Count one stanza routed on behalf of the client.
    pub fn increment_client_packets(&self) {
        self.client_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_packet_count(&self) -> u64 {
        self.client_packets.load(Ordering::Relaxed)
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    fn notify(&self, events: &[SessionEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for event in events {
            for listener in &listeners {
                listener.on_event(&self.stream_id, event);
            }
        }
    }

    fn history_limit(&self) -> usize {
        self.settings.hold as usize + 1
    }

    fn rid_window(&self) -> u64 {
        u64::from(self.settings.hold.max(1))
    }

    /// Answer the session creation request `rid`.
    pub fn open(&self, rid: u64, server_name: &str) -> Result<Arc<HttpConnection>, BindError> {
        if rid == 0 {
            return Err(BindError::bad_request("rid must be positive"));
        }
        let features = self.available_stream_features();
        let body = CreationResponse {
            sid: self.stream_id.as_str(),
            from: server_name,
            wait: self.settings.wait,
            hold: self.settings.hold,
            requests: self.settings.max_requests,
            inactivity: self.settings.inactivity_timeout.as_secs(),
            polling: self.settings.polling_interval.as_secs(),
            max_pause: self.settings.max_pause.as_secs(),
            secure: self.settings.secure,
            lang: &self.settings.language,
            version: self.settings.version,
            features: &features,
        }
        .to_xml();

        self.lock_state().last_rid = rid - 1;
        let admission = self.admit(rid, self.settings.secure, Reply::Now(body))?;
        Ok(admission.connection)
    }

    /// Admit request `rid`.
    ///
    /// Pending data is answered right away, as is any request of a session
    /// that cannot hold; otherwise the connection is held until something
    /// is delivered, it expires, or the session closes.
    pub fn create_connection(
        &self,
        rid: u64,
        is_poll: bool,
        is_secure: bool,
    ) -> Result<Admission, BindError> {
        self.admit(rid, is_secure, Reply::Data { is_poll })
    }

    /// Admit an `xmpp:restart` request, answered with fresh stream features.
    pub fn create_restart_connection(
        &self,
        rid: u64,
        is_secure: bool,
    ) -> Result<Admission, BindError> {
        let body = body::restart_body(&self.available_stream_features());
        self.admit(rid, is_secure, Reply::Now(body))
    }

    /// Admit a `type='terminate'` request. The caller closes the session once
    /// the request's stanzas have been routed.
    pub fn create_terminate_connection(
        &self,
        rid: u64,
        is_secure: bool,
    ) -> Result<Admission, BindError> {
        self.admit(rid, is_secure, Reply::Now(body::terminate_body(None)))
    }

    /// Admit a `pause` request: every held connection is answered, and the
    /// session may stay idle for `duration` until the next request.
    pub fn create_pause_connection(
        &self,
        rid: u64,
        is_secure: bool,
        duration: Duration,
    ) -> Result<Admission, BindError> {
        if duration > self.settings.max_pause {
            return Err(BindError::bad_request(format!(
                "pause of {}s exceeds maxpause of {}s",
                duration.as_secs(),
                self.settings.max_pause.as_secs()
            )));
        }

        let mut events = Vec::new();
        let result = {
            let mut state = self.lock_state();
            let result =
                self.admit_locked(&mut state, rid, is_secure, Reply::Now(body::empty_body()), &mut events);
            if matches!(&result, Ok(admission) if !admission.replayed) {
                self.inactivity_secs.store(duration.as_secs(), Ordering::Relaxed);
                state.paused = true;
                while let Some(connection) = state.held.pop_front() {
                    self.answer_empty(&mut state, &connection, &mut events);
                }
                info!(stream_id = %self.stream_id, pause_secs = duration.as_secs(), "BOSH session paused");
            }
            result
        };
        self.notify(&events);
        result
    }

    fn admit(&self, rid: u64, is_secure: bool, reply: Reply) -> Result<Admission, BindError> {
        let mut events = Vec::new();
        let result = {
            let mut state = self.lock_state();
            self.admit_locked(&mut state, rid, is_secure, reply, &mut events)
        };
        self.notify(&events);
        result
    }

    fn admit_locked(
        &self,
        state: &mut SessionState,
        rid: u64,
        is_secure: bool,
        reply: Reply,
        events: &mut Vec<SessionEvent>,
    ) -> Result<Admission, BindError> {
        if state.closed {
            return Err(BindError::session_not_found(format!(
                "session {} is closed",
                self.stream_id
            )));
        }

        if rid <= state.last_rid && !state.gaps.contains(&rid) {
            return self.replay(state, rid, is_secure);
        }

        let window = self.rid_window();
        if rid > state.last_rid.saturating_add(window) {
            warn!(
                stream_id = %self.stream_id,
                rid,
                last_rid = state.last_rid,
                hold = self.settings.hold,
                "Request id too far ahead"
            );
            return Err(BindError::item_not_found("Unexpected RID error."));
        }

        let is_poll = matches!(reply, Reply::Data { is_poll: true });
        if is_poll {
            self.check_polling_interval(state)?;
        }

        if self.settings.secure && !is_secure {
            warn!(stream_id = %self.stream_id, rid, "Insecure connection on secure session");
            return Err(BindError::policy_violation(
                "Session was started from a secure connection, all connections on this session must be secured.",
            ));
        }

        let now = Instant::now();
        if is_poll {
            state.last_poll = Some(now);
        }
        state.advance_rid(rid, window);
        state.last_activity = now;
        if state.paused {
            state.paused = false;
            self.inactivity_secs
                .store(self.settings.inactivity_timeout.as_secs(), Ordering::Relaxed);
            debug!(stream_id = %self.stream_id, "BOSH session resumed");
        }

        let connection = Arc::new(HttpConnection::new(rid, is_secure));
        match reply {
            Reply::Now(body) => {
                events.push(SessionEvent::ConnectionOpened { rid });
                self.answer(state, &connection, body, false, events);
            }
            Reply::Data { .. } if self.settings.hold == 0 || !state.pending.is_empty() => {
                let body = body::wrap(&state.pending);
                let empty = state.pending.is_empty();
                state.pending.clear();
                events.push(SessionEvent::ConnectionOpened { rid });
                self.answer(state, &connection, body, empty, events);
            }
            Reply::Data { .. } => {
                if state.held.len() >= self.settings.hold as usize {
                    if let Some(oldest) = state.held.pop_front() {
                        info!(
                            stream_id = %self.stream_id,
                            evicted_rid = oldest.rid(),
                            rid,
                            "Held connection evicted"
                        );
                        self.answer_empty(state, &oldest, events);
                    }
                }
                let position = state
                    .held
                    .iter()
                    .position(|held| held.rid() > rid)
                    .unwrap_or(state.held.len());
                state.held.insert(position, connection.clone());
                events.push(SessionEvent::ConnectionOpened { rid });
                debug!(stream_id = %self.stream_id, rid, held = state.held.len(), "Connection held");
            }
        }

        Ok(Admission {
            connection,
            replayed: false,
        })
    }

    fn replay(
        &self,
        state: &mut SessionState,
        rid: u64,
        is_secure: bool,
    ) -> Result<Admission, BindError> {
        let connection = Arc::new(HttpConnection::new(rid, is_secure));

        if let Some(body) = state.sent_for(rid) {
            // Fresh connection, cannot be closed yet
            let _ = connection.deliver_body(body.to_string());
            info!(stream_id = %self.stream_id, rid, "Replaying response to retransmitted request");
            return Ok(Admission {
                connection,
                replayed: true,
            });
        }

        if let Some(position) = state.held.iter().position(|held| held.rid() == rid) {
            // The client gave up on the original request; the new one takes its slot
            let previous = std::mem::replace(&mut state.held[position], connection.clone());
            previous.close();
            debug!(stream_id = %self.stream_id, rid, "Retransmitted request replaces held connection");
            return Ok(Admission {
                connection,
                replayed: true,
            });
        }

        warn!(
            stream_id = %self.stream_id,
            rid,
            last_rid = state.last_rid,
            "Request id not found in sent history"
        );
        Err(BindError::item_not_found("Unexpected RID error."))
    }

    fn check_polling_interval(&self, state: &SessionState) -> Result<(), BindError> {
        if !self.is_polling_session() || !state.last_response_empty {
            return Ok(());
        }
        let Some(last_poll) = state.last_poll else {
            return Ok(());
        };
        let elapsed = last_poll.elapsed();
        if elapsed < self.settings.polling_interval {
            warn!(
                stream_id = %self.stream_id,
                elapsed_ms = elapsed.as_millis() as u64,
                polling_secs = self.settings.polling_interval.as_secs(),
                "Polling too frequently"
            );
            return Err(BindError::policy_violation(format!(
                "Overactivity detected: minimum polling interval is {}s",
                self.settings.polling_interval.as_secs()
            )));
        }
        Ok(())
    }

    /// Fulfil a connection that is not in the held queue.
    fn answer(
        &self,
        state: &mut SessionState,
        connection: &HttpConnection,
        body: String,
        empty: bool,
        events: &mut Vec<SessionEvent>,
    ) {
        state.record_sent(connection.rid(), body.clone(), self.history_limit());
        state.last_response_empty = empty;
        if let Err(ConnectionClosed { rid }) = connection.deliver_body(body) {
            debug!(stream_id = %self.stream_id, rid, "Connection closed before its response");
        }
        events.push(SessionEvent::ConnectionClosed {
            rid: connection.rid(),
            open_connections: state.held.len(),
        });
    }

    fn answer_empty(
        &self,
        state: &mut SessionState,
        connection: &HttpConnection,
        events: &mut Vec<SessionEvent>,
    ) {
        self.answer(state, connection, body::empty_body(), true, events);
    }

    /// Queue `item` for the client.
    ///
    /// The oldest held connection still pending receives it together with
    /// anything already queued; without one, it waits for the next request.
    /// Messages for a closed session go to offline storage.
    pub fn deliver(&self, item: Deliverable) {
        let mut events = Vec::new();
        let undeliverable = {
            let mut state = self.lock_state();
            if state.closed {
                Some(item)
            } else {
                state.pending.push(item);
                let body = body::wrap(&state.pending);
                while let Some(connection) = state.held.pop_front() {
                    let open_connections = state.held.len();
                    match connection.deliver_body(body.clone()) {
                        Ok(()) => {
                            let count = state.pending.len();
                            state.pending.clear();
                            state.record_sent(connection.rid(), body, self.history_limit());
                            state.last_response_empty = false;
                            events.push(SessionEvent::ConnectionClosed {
                                rid: connection.rid(),
                                open_connections,
                            });
                            debug!(stream_id = %self.stream_id, rid = connection.rid(), items = count, "Delivered to held connection");
                            break;
                        }
                        Err(ConnectionClosed { rid }) => {
                            debug!(stream_id = %self.stream_id, rid, "Held connection already closed, trying next");
                            events.push(SessionEvent::ConnectionClosed {
                                rid,
                                open_connections,
                            });
                        }
                    }
                }
                if !state.pending.is_empty() {
                    debug!(stream_id = %self.stream_id, pending = state.pending.len(), "Queued for next request");
                }
                None
            }
        };
        self.notify(&events);

        if let Some(item) = undeliverable {
            self.discard(item);
        }
    }

    pub fn deliver_stanza(&self, stanza: Stanza) {
        self.deliver(Deliverable::Stanza(stanza));
    }

    pub fn deliver_text(&self, text: impl Into<String>) {
        self.deliver(Deliverable::Text(text.into()));
    }

    fn discard(&self, item: Deliverable) {
        match item.stanza() {
            Some(stanza) if stanza.is_message() => {
                info!(stream_id = %self.stream_id, "Client gone, storing message offline");
                self.offline.store_offline(stanza);
            }
            _ => debug!(stream_id = %self.stream_id, "Dropping undeliverable item"),
        }
    }

    /// The `wait` deadline of held connection `rid` passed: answer it empty.
    ///
    /// Returns `false` when the connection is not held any more.
    pub fn expire_connection(&self, rid: u64) -> bool {
        let mut events = Vec::new();
        let expired = {
            let mut state = self.lock_state();
            match state.held.iter().position(|held| held.rid() == rid) {
                Some(position) => {
                    if let Some(connection) = state.held.remove(position) {
                        self.answer_empty(&mut state, &connection, &mut events);
                    }
                    true
                }
                None => false,
            }
        };
        if expired {
            debug!(stream_id = %self.stream_id, rid, "Held connection expired");
        }
        self.notify(&events);
        expired
    }

    /// The HTTP request behind held connection `rid` went away.
    ///
    /// The connection is closed without a body. Later deliveries go to the
    /// next held connection or the pending queue, and a retransmission of
    /// `rid` is answered with an empty body.
    pub fn abandon_connection(&self, rid: u64) -> bool {
        let mut events = Vec::new();
        let abandoned = {
            let mut state = self.lock_state();
            match state.held.iter().position(|held| held.rid() == rid) {
                Some(position) => {
                    if let Some(connection) = state.held.remove(position) {
                        connection.close();
                        state.record_sent(rid, body::empty_body(), self.history_limit());
                        events.push(SessionEvent::ConnectionClosed {
                            rid,
                            open_connections: state.held.len(),
                        });
                    }
                    true
                }
                None => false,
            }
        };
        if abandoned {
            debug!(stream_id = %self.stream_id, rid, "Held connection abandoned");
        }
        self.notify(&events);
        abandoned
    }

    /// Close the session. Idempotent.
    ///
    /// Held connections are closed without a body, pending messages are
    /// handed to offline storage, and listeners get a final
    /// [`SessionEvent::SessionClosed`] before being dropped.
    pub fn close(&self) {
        let (held, pending) = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.held),
                std::mem::take(&mut state.pending),
            )
        };

        let mut events = Vec::with_capacity(held.len() + 1);
        let mut open_connections = held.len();
        for connection in held {
            open_connections -= 1;
            connection.close();
            events.push(SessionEvent::ConnectionClosed {
                rid: connection.rid(),
                open_connections,
            });
        }

        let pending_count = pending.len();
        for item in pending {
            self.discard(item);
        }

        events.push(SessionEvent::SessionClosed);
        let listeners =
            std::mem::take(&mut *self.listeners.lock().unwrap_or_else(|e| e.into_inner()));
        for event in &events {
            for listener in &listeners {
                listener.on_event(&self.stream_id, event);
            }
        }

        info!(
            stream_id = %self.stream_id,
            pending = pending_count,
            client_packets = self.client_packet_count(),
            "BOSH session closed"
        );
    }

    /// Stream features currently on offer, one XML element each.
    pub fn available_stream_features(&self) -> Vec<String> {
        let mut features = Vec::with_capacity(4);

        let mechanisms = self.features.sasl_mechanisms(&self.stream_id);
        if !mechanisms.is_empty() {
            let mut xml = String::from("<mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>");
            for mechanism in &mechanisms {
                let _ = write!(xml, "<mechanism>{}</mechanism>", escape(mechanism.as_str()));
            }
            xml.push_str("</mechanisms>");
            features.push(xml);
        }

        let methods = self.features.compression_methods(&self.stream_id);
        if !methods.is_empty() {
            let mut xml = String::from("<compression xmlns='http://jabber.org/features/compress'>");
            for method in &methods {
                let _ = write!(xml, "<method>{}</method>", escape(method.as_str()));
            }
            xml.push_str("</compression>");
            features.push(xml);
        }

        features.push("<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>".to_string());
        features.push("<session xmlns='urn:ietf:params:xml:ns:xmpp-session'/>".to_string());
        features
    }

    pub fn stats(&self) -> SessionStats {
        let state = self.lock_state();
        SessionStats {
            stream_id: self.stream_id.to_string(),
            remote_addr: self.remote_addr.to_string(),
            hold: self.settings.hold,
            wait: self.settings.wait,
            secure: self.settings.secure,
            last_request_id: state.last_rid,
            held_connections: state.held.len(),
            pending: state.pending.len(),
            client_packets: self.client_packet_count(),
            idle_secs: state.last_activity.elapsed().as_secs(),
        }
    }
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("stream_id", &self.stream_id)
            .field("remote_addr", &self.remote_addr)
            .field("hold", &self.settings.hold)
            .field("wait", &self.settings.wait)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::httpbind::connection::ConnectionState;
    use crate::httpbind::error::BindCondition;
    use crate::httpbind::listener::testing::RecordingListener;
    use crate::httpbind::services::testing::RecordingOfflineStore;
    use crate::httpbind::services::StaticFeatures;

    fn settings(hold: u32, wait: u64, inactivity: Duration) -> SessionSettings {
        SessionSettings {
            wait,
            hold,
            language: "en".to_string(),
            secure: false,
            max_requests: 2,
            polling_interval: Duration::from_secs(5),
            inactivity_timeout: inactivity,
            max_pause: Duration::from_secs(300),
            version: BoshVersion::DEFAULT,
        }
    }

    /// A session that has not answered its creation request yet.
    pub(crate) fn session_with(hold: u32, wait: u64, inactivity: Duration) -> Arc<HttpSession> {
        Arc::new(HttpSession::new(
            StreamId::from("test-sid"),
            "127.0.0.1:5280".parse().unwrap(),
            settings(hold, wait, inactivity),
            Arc::new(StaticFeatures::default()),
            Arc::new(RecordingOfflineStore::default()),
        ))
    }

    /// A session opened with creation rid `rid`, plus its offline store.
    fn opened(hold: u32, rid: u64) -> (Arc<HttpSession>, Arc<RecordingOfflineStore>) {
        let offline = Arc::new(RecordingOfflineStore::default());
        let session = Arc::new(HttpSession::new(
            StreamId::from("test-sid"),
            "127.0.0.1:5280".parse().unwrap(),
            settings(hold, 60, Duration::from_secs(1800)),
            Arc::new(StaticFeatures::default()),
            offline.clone(),
        ));
        session.open(rid, "example.com").unwrap();
        (session, offline)
    }

    fn fulfilled(connection: &HttpConnection) -> String {
        match connection.state() {
            ConnectionState::Fulfilled(body) => body,
            other => panic!("expected fulfilled connection, got {other:?}"),
        }
    }

    fn message(id: &str) -> Stanza {
        Stanza::parse(format!("<message id='{id}'><body>{id}</body></message>")).unwrap()
    }

    #[test]
    fn test_open_answers_with_creation_body() {
        let session = session_with(1, 60, Duration::from_secs(1800));
        let connection = session.open(1, "example.com").unwrap();
        let body = fulfilled(&connection);

        assert!(body.contains("sid='test-sid'"));
        assert!(body.contains("authid='test-sid'"));
        assert!(body.contains("from='example.com'"));
        assert!(body.contains("requests='2'"));
        assert!(body.contains("<mechanism>PLAIN</mechanism>"));
        assert!(body.contains("<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>"));
        assert!(body.contains("<session xmlns='urn:ietf:params:xml:ns:xmpp-session'/>"));
        assert_eq!(session.last_request_id(), 1);
    }

    #[test]
    fn test_creation_response_is_replayable() {
        let (session, _) = opened(1, 1);
        let admission = session.create_connection(1, true, false).unwrap();
        assert!(admission.replayed);
        assert!(fulfilled(&admission.connection).contains("authid='test-sid'"));
    }

    #[test]
    fn test_immediate_response_without_hold() {
        let (session, _) = opened(0, 1);
        session.deliver_stanza(message("m1"));

        let admission = session.create_connection(2, true, false).unwrap();
        let body = fulfilled(&admission.connection);
        assert_eq!(
            body,
            "<body xmlns='http://jabber.org/protocol/httpbind'>\
             <message xmlns=\"jabber:client\" id='m1'><body>m1</body></message></body>"
        );
        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.held_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_hold_receives_later_stanza() {
        let (session, _) = opened(1, 4);
        let admission = session.create_connection(5, true, false).unwrap();
        assert!(admission.connection.is_pending());
        assert_eq!(session.held_connections(), 1);

        let waiter = {
            let connection = admission.connection.clone();
            tokio::spawn(async move { connection.resolved().await })
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        session.deliver_stanza(message("late"));

        match waiter.await.unwrap() {
            ConnectionState::Fulfilled(body) => assert!(body.contains("id='late'")),
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(session.held_connections(), 0);
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn test_overflow_evicts_oldest_with_empty_body() {
        let (session, _) = opened(1, 4);
        let first = session.create_connection(5, true, false).unwrap().connection;
        let second = session.create_connection(6, true, false).unwrap().connection;

        assert_eq!(fulfilled(&first), body::empty_body());
        assert!(second.is_pending());
        assert_eq!(session.held_connections(), 1);

        // The evicted rid can be retransmitted and gets the same bytes
        let replay = session.create_connection(5, true, false).unwrap();
        assert!(replay.replayed);
        assert_eq!(fulfilled(&replay.connection), body::empty_body());
    }

    #[test]
    fn test_gap_rid_at_full_capacity() {
        let (session, _) = opened(2, 1);
        let third = session.create_connection(3, true, false).unwrap().connection;

        // rid 2 fills the gap and takes the free slot, ahead of rid 3
        let second = session.create_connection(2, true, false).unwrap().connection;
        assert_eq!(session.held_connections(), 2);
        assert!(second.is_pending());

        // At capacity the lowest rid is answered, whatever its arrival order
        let fourth = session.create_connection(4, true, false).unwrap().connection;
        assert_eq!(fulfilled(&second), body::empty_body());
        assert!(third.is_pending());
        assert!(fourth.is_pending());
        assert_eq!(session.held_connections(), 2);
    }

    #[test]
    fn test_gap_ages_out_once_capacity_is_reached_above_it() {
        let (session, _) = opened(2, 1);
        let third = session.create_connection(3, true, false).unwrap().connection;
        let fourth = session.create_connection(4, true, false).unwrap().connection;

        // Two held rids above the gap move it below the window
        let err = session.create_connection(2, true, false).unwrap_err();
        assert_eq!(err.condition(), BindCondition::ItemNotFound);
        assert!(third.is_pending());
        assert!(fourth.is_pending());
        assert_eq!(session.held_connections(), 2);
    }

    #[test]
    fn test_capacity_never_exceeds_hold() {
        let (session, _) = opened(2, 1);
        let connections: Vec<_> = (2..=4)
            .map(|rid| session.create_connection(rid, true, false).unwrap().connection)
            .collect();

        assert_eq!(session.held_connections(), 2);
        assert!(!connections[0].is_pending());
        assert!(connections[1].is_pending());
        assert!(connections[2].is_pending());
    }

    #[test]
    fn test_rid_too_far_ahead_is_fatal() {
        let (session, _) = opened(1, 10);
        let err = session.create_connection(13, true, false).unwrap_err();
        assert_eq!(err.condition(), BindCondition::ItemNotFound);
        assert_eq!(err.status(), 404);
        assert!(err.closes_session());
        assert_eq!(session.last_request_id(), 10);
    }

    #[test]
    fn test_replay_is_byte_identical_and_side_effect_free() {
        let (session, _) = opened(1, 1);
        session.deliver_stanza(message("m1"));
        let first = session.create_connection(2, false, false).unwrap();
        let original = fulfilled(&first.connection);

        session.deliver_stanza(message("m2"));
        let again = session.create_connection(2, false, false).unwrap();

        assert!(again.replayed);
        assert_eq!(fulfilled(&again.connection), original);
        assert_eq!(session.last_request_id(), 2);
        assert_eq!(session.pending_count(), 1);
    }

    #[test]
    fn test_rid_aged_out_of_history_is_fatal() {
        let (session, _) = opened(1, 1);
        for rid in 2..=4 {
            session.deliver_stanza(message(&rid.to_string()));
            session.create_connection(rid, false, false).unwrap();
        }
        // History keeps hold + 1 = 2 responses: rids 3 and 4
        let err = session.create_connection(2, false, false).unwrap_err();
        assert!(err.closes_session());
    }

    #[test]
    fn test_out_of_order_rids_inside_window() {
        let (session, _) = opened(3, 1);
        let third = session.create_connection(4, true, false).unwrap();
        assert!(!third.replayed);
        assert_eq!(session.last_request_id(), 4);

        let first = session.create_connection(2, true, false).unwrap();
        let second = session.create_connection(3, true, false).unwrap();
        assert!(!first.replayed);
        assert!(!second.replayed);
        assert_eq!(session.last_request_id(), 4);

        // Oldest rid is answered first
        session.deliver_stanza(message("m"));
        assert!(first.connection.state() != ConnectionState::Pending);
        assert!(second.connection.is_pending());
        assert!(third.connection.is_pending());
    }

    #[test]
    fn test_last_rid_is_monotonic_under_concurrency() {
        let (session, _) = opened(4, 1);
        std::thread::scope(|scope| {
            for rid in [5u64, 3, 2, 4] {
                let session = session.clone();
                scope.spawn(move || {
                    let _ = session.create_connection(rid, true, false);
                });
            }
        });
        assert_eq!(session.last_request_id(), 5);
        assert!(session.held_connections() <= 4);
    }

    #[test]
    fn test_delivery_order_is_preserved_across_polls() {
        let (session, _) = opened(1, 1);
        session.deliver_stanza(message("s1"));
        session.deliver_stanza(message("s2"));
        let first = fulfilled(&session.create_connection(2, true, false).unwrap().connection);

        session.deliver_stanza(message("s3"));
        let second = fulfilled(&session.create_connection(3, true, false).unwrap().connection);

        let s1 = first.find("id='s1'").unwrap();
        let s2 = first.find("id='s2'").unwrap();
        assert!(s1 < s2);
        assert!(second.contains("id='s3'"));
        assert!(!second.contains("id='s1'"));
    }

    #[test]
    fn test_delivery_skips_concurrently_closed_connection() {
        let (session, _) = opened(2, 1);
        let first = session.create_connection(2, true, false).unwrap().connection;
        let second = session.create_connection(3, true, false).unwrap().connection;

        first.close();
        session.deliver_stanza(message("m"));

        assert!(first.is_closed());
        assert!(fulfilled(&second).contains("id='m'"));
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn test_delivery_without_connection_is_queued() {
        let (session, _) = opened(1, 1);
        session.deliver_text("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>");
        assert_eq!(session.pending_count(), 1);

        let body = fulfilled(&session.create_connection(2, true, false).unwrap().connection);
        assert!(body.contains("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_interval_enforced_after_empty_response() {
        let (session, _) = opened(0, 1);

        // Last response was the creation body: not empty, no limit
        session.create_connection(2, true, false).unwrap();
        let err = session.create_connection(3, true, false).unwrap_err();
        assert_eq!(err.condition(), BindCondition::PolicyViolation);
        assert!(!err.closes_session());
        assert_eq!(session.last_request_id(), 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        session.create_connection(3, true, false).unwrap();

        // Requests carrying payload are never rate limited
        session.create_connection(4, false, false).unwrap();
    }

    #[test]
    fn test_long_poll_session_is_not_rate_limited() {
        let (session, _) = opened(1, 1);
        session.create_connection(2, true, false).unwrap();
        session.create_connection(3, true, false).unwrap();
        session.create_connection(4, true, false).unwrap();
    }

    #[test]
    fn test_secure_session_rejects_insecure_connection() {
        let mut secure = settings(1, 60, Duration::from_secs(1800));
        secure.secure = true;
        let session = HttpSession::new(
            StreamId::from("s"),
            "127.0.0.1:1".parse().unwrap(),
            secure,
            Arc::new(StaticFeatures::default()),
            Arc::new(RecordingOfflineStore::default()),
        );
        session.open(1, "example.com").unwrap();

        let err = session.create_connection(2, true, false).unwrap_err();
        assert_eq!(err.status(), 403);
        assert!(!err.closes_session());
        assert!(session.create_connection(2, true, true).is_ok());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (session, _) = opened(1, 1);
        let listener = Arc::new(RecordingListener::default());
        session.add_listener(listener.clone());

        session.close();
        session.close();
        session.close();

        assert!(session.is_closed());
        assert_eq!(listener.count(&SessionEvent::SessionClosed), 1);
    }

    #[test]
    fn test_close_releases_held_connections() {
        let (session, _) = opened(2, 1);
        let listener = Arc::new(RecordingListener::default());
        session.add_listener(listener.clone());
        let first = session.create_connection(2, true, false).unwrap().connection;
        let second = session.create_connection(3, true, false).unwrap().connection;

        session.close();

        assert!(first.is_closed());
        assert!(second.is_closed());
        assert_eq!(session.held_connections(), 0);
        let events = listener.events();
        assert!(events.contains(&SessionEvent::ConnectionClosed { rid: 2, open_connections: 1 }));
        assert!(events.contains(&SessionEvent::ConnectionClosed { rid: 3, open_connections: 0 }));
        assert_eq!(events.last(), Some(&SessionEvent::SessionClosed));
    }

    #[test]
    fn test_close_hands_pending_messages_to_offline_store() {
        let (session, offline) = opened(1, 1);
        session.deliver_stanza(message("m1"));
        session.deliver_stanza(Stanza::parse("<presence/>").unwrap());
        session.deliver_text("<r xmlns='urn:xmpp:sm:3'/>");
        session.close();

        let stored = offline.stored();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].as_xml().contains("id='m1'"));

        // Deliveries after close take the same path
        session.deliver_stanza(message("m2"));
        assert_eq!(offline.stored().len(), 2);
    }

    #[test]
    fn test_connection_on_closed_session_is_rejected() {
        let (session, _) = opened(1, 1);
        session.close();
        let err = session.create_connection(2, true, false).unwrap_err();
        assert_eq!(err.condition(), BindCondition::SessionNotFound);
    }

    #[test]
    fn test_listener_sees_open_and_close_for_immediate_response() {
        let (session, _) = opened(0, 1);
        let listener = Arc::new(RecordingListener::default());
        session.add_listener(listener.clone());

        session.create_connection(2, false, false).unwrap();
        assert_eq!(
            listener.events(),
            vec![
                SessionEvent::ConnectionOpened { rid: 2 },
                SessionEvent::ConnectionClosed { rid: 2, open_connections: 0 },
            ]
        );
    }

    #[test]
    fn test_expire_connection_answers_empty() {
        let (session, _) = opened(1, 1);
        let held = session.create_connection(2, true, false).unwrap().connection;

        assert!(session.expire_connection(2));
        assert_eq!(fulfilled(&held), body::empty_body());
        assert_eq!(session.held_connections(), 0);
        assert!(!session.expire_connection(2));
    }

    #[test]
    fn test_abandoned_connection_is_skipped_by_delivery() {
        let (session, _) = opened(1, 1);
        let held = session.create_connection(2, true, false).unwrap().connection;

        assert!(session.abandon_connection(2));
        assert!(held.is_closed());

        session.deliver_stanza(message("m"));
        assert_eq!(session.pending_count(), 1);

        let replay = session.create_connection(2, true, false).unwrap();
        assert_eq!(fulfilled(&replay.connection), body::empty_body());
    }

    #[test]
    fn test_retransmitted_held_rid_takes_over() {
        let (session, _) = opened(1, 1);
        let original = session.create_connection(2, true, false).unwrap().connection;
        let retry = session.create_connection(2, true, false).unwrap();

        assert!(retry.replayed);
        assert!(original.is_closed());
        assert_eq!(session.held_connections(), 1);

        session.deliver_stanza(message("m"));
        assert!(fulfilled(&retry.connection).contains("id='m'"));
    }

    #[test]
    fn test_pause_answers_held_and_raises_inactivity() {
        let (session, _) = opened(1, 1);
        let held = session.create_connection(2, true, false).unwrap().connection;

        let pause = session
            .create_pause_connection(3, false, Duration::from_secs(120))
            .unwrap();
        assert_eq!(fulfilled(&pause.connection), body::empty_body());
        assert_eq!(fulfilled(&held), body::empty_body());
        assert_eq!(session.inactivity_timeout(), Duration::from_secs(120));

        // Any later request ends the pause
        session.create_connection(4, true, false).unwrap();
        assert_eq!(session.inactivity_timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn test_pause_above_max_is_rejected() {
        let (session, _) = opened(1, 1);
        let err = session
            .create_pause_connection(2, false, Duration::from_secs(301))
            .unwrap_err();
        assert_eq!(err.status(), 400);
        assert_eq!(session.last_request_id(), 1);
    }

    #[test]
    fn test_restart_returns_features() {
        let (session, _) = opened(1, 1);
        let admission = session.create_restart_connection(2, false).unwrap();
        let body = fulfilled(&admission.connection);
        assert!(body.contains("<stream:features>"));
        assert!(body.contains("<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>"));
    }

    #[test]
    fn test_terminate_connection_gets_terminate_body() {
        let (session, _) = opened(1, 1);
        let admission = session.create_terminate_connection(2, false).unwrap();
        assert_eq!(fulfilled(&admission.connection), body::terminate_body(None));
    }

    #[test]
    fn test_compression_feature_advertised_when_available() {
        let session = HttpSession::new(
            StreamId::from("s"),
            "127.0.0.1:1".parse().unwrap(),
            settings(1, 60, Duration::from_secs(1800)),
            Arc::new(StaticFeatures {
                mechanisms: Vec::new(),
                compression: vec!["zlib".to_string()],
            }),
            Arc::new(RecordingOfflineStore::default()),
        );
        let features = session.available_stream_features();
        assert_eq!(
            features[0],
            "<compression xmlns='http://jabber.org/features/compress'><method>zlib</method></compression>"
        );
        assert!(!features.iter().any(|f| f.contains("mechanisms")));
    }

    #[test]
    fn test_stats_snapshot() {
        let (session, _) = opened(1, 1);
        session.increment_client_packets();
        session.create_connection(2, true, false).unwrap();
        session.deliver_stanza(message("m"));
        session.deliver_stanza(message("n"));

        let stats = session.stats();
        assert_eq!(stats.stream_id, "test-sid");
        assert_eq!(stats.last_request_id, 2);
        assert_eq!(stats.client_packets, 1);
        assert_eq!(stats.held_connections, 0);
        assert_eq!(stats.pending, 1);
    }
}
