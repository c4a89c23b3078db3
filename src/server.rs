//! HTTP front end for the BOSH session layer.
//!
//! Every POST to `/http-bind/` carries one `<body/>`. The handler parses it,
//! hands it to the [`HttpSessionManager`], and then waits on the resulting
//! connection for at most the session's `wait` before answering empty.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::httpbind::body::{self, BoshBody};
use crate::httpbind::connection::{ConnectionState, HttpConnection};
use crate::httpbind::error::BindError;
use crate::httpbind::session::HttpSession;
use crate::httpbind::stream_id::StreamId;
use crate::httpbind::HttpSessionManager;

const XML_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

/// Build the BOSH router.
///
/// Needs `ConnectInfo<SocketAddr>`: serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn router(manager: HttpSessionManager) -> Router {
    Router::new()
        .route("/http-bind", post(handle_bind))
        .route("/http-bind/", post(handle_bind))
        .route("/http-bind/status", get(handle_status))
        .with_state(manager)
}

async fn handle_bind(
    State(manager): State<HttpSessionManager>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: String,
) -> Response {
    let (remote_addr, is_secure) = client_origin(&manager, peer, &headers);

    let body = match BoshBody::parse(&payload) {
        Ok(body) => body,
        Err(e) => {
            warn!(remote_addr = %remote_addr, error = %e, "Malformed BOSH request");
            return error_response(&BindError::from(e));
        }
    };

    match manager.handle_request(remote_addr, &body, is_secure) {
        Ok((session, connection)) => respond(&session, &connection).await,
        Err(e) => {
            if e.closes_session() {
                if let Some(sid) = body.session_id() {
                    warn!(stream_id = sid, error = %e, "Closing BOSH session after fatal error");
                    manager.close_session(&StreamId::from(sid));
                }
            }
            error_response(&e)
        }
    }
}

async fn handle_status(State(manager): State<HttpSessionManager>) -> impl IntoResponse {
    Json(manager.stats())
}

/// Abandons a held connection when the request future is dropped early,
/// i.e. when the client went away.
struct HeldRequest<'a> {
    session: &'a HttpSession,
    connection: &'a HttpConnection,
}

impl Drop for HeldRequest<'_> {
    fn drop(&mut self) {
        if self.connection.is_pending() {
            debug!(
                stream_id = %self.session.stream_id(),
                rid = self.connection.rid(),
                "Client went away while its request was held"
            );
            self.session.abandon_connection(self.connection.rid());
        }
    }
}

async fn respond(session: &Arc<HttpSession>, connection: &Arc<HttpConnection>) -> Response {
    let _guard = HeldRequest {
        session,
        connection,
    };

    let wait = Duration::from_secs(session.wait());
    let state = match tokio::time::timeout(wait, connection.resolved()).await {
        Ok(state) => state,
        Err(_) => {
            session.expire_connection(connection.rid());
            connection.state()
        }
    };
    debug!(
        stream_id = %session.stream_id(),
        rid = connection.rid(),
        held_ms = connection.age().as_millis() as u64,
        "Answering request"
    );

    match state {
        ConnectionState::Fulfilled(body) => xml_response(StatusCode::OK, body),
        ConnectionState::Closed if session.is_closed() => {
            xml_response(StatusCode::OK, body::terminate_body(None))
        }
        ConnectionState::Closed => xml_response(StatusCode::OK, body::empty_body()),
        ConnectionState::Pending => {
            // Not held by the session any more yet never answered
            connection.close();
            xml_response(StatusCode::OK, body::empty_body())
        }
    }
}

fn xml_response(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, XML_CONTENT_TYPE)], body).into_response()
}

fn error_response(err: &BindError) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if err.closes_session() {
        xml_response(status, body::terminate_body(Some(err.condition().as_str())))
    } else {
        (status, [(header::CONTENT_TYPE, XML_CONTENT_TYPE)]).into_response()
    }
}

/// Client address and transport security, honouring `X-Forwarded-*` only
/// when configured to.
fn client_origin(
    manager: &HttpSessionManager,
    peer: SocketAddr,
    headers: &HeaderMap,
) -> (SocketAddr, bool) {
    if !manager.config().forwarded_enabled {
        return (peer, false);
    }

    let forwarded_ip = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok());
    let secure = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|proto| proto.eq_ignore_ascii_case("https"));

    let addr = match forwarded_ip {
        Some(ip) => SocketAddr::new(ip, peer.port()),
        None => peer,
    };
    (addr, secure)
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("BOSH server already running on {0}")]
    AlreadyRunning(SocketAddr),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// BOSH HTTP listener with explicit start/stop.
pub struct HttpBindServer {
    manager: HttpSessionManager,
    /// Bound address while running
    local_addr: Option<SocketAddr>,
    /// Background task handle
    task: Option<JoinHandle<()>>,
    /// Shutdown signal
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl HttpBindServer {
    pub fn new(manager: HttpSessionManager) -> Self {
        Self {
            manager,
            local_addr: None,
            task: None,
            shutdown_tx: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind `addr` and start serving in the background.
    pub async fn start(&mut self, addr: &str) -> Result<SocketAddr, ServerError> {
        if let Some(local_addr) = self.local_addr {
            return Err(ServerError::AlreadyRunning(local_addr));
        }

        let listener = TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        self.shutdown_tx = Some(shutdown_tx);

        let app = router(self.manager.clone());
        let task = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Shutting down");
            })
            .await;
            if let Err(e) = result {
                error!(error = %e, "BOSH server error");
            }
        });

        self.task = Some(task);
        self.local_addr = Some(local_addr);
        info!(addr = %local_addr, "BOSH server listening");
        Ok(local_addr)
    }

    /// Stop serving and close every session.
    ///
    /// Held requests are answered with a terminate body before the
    /// listener goes away.
    pub async fn stop(&mut self) {
        self.manager.shutdown();

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if let Some(task) = self.task.take() {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("BOSH server did not stop in time");
            }
        }

        self.local_addr = None;
    }
}
