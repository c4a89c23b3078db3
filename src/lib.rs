//! BOSH (XEP-0124/XEP-0206) connection manager for XMPP.
//!
//! [`httpbind`] holds the session layer: sessions, their HTTP connections,
//! inactivity timers and the manager tying them together. [`server`] puts
//! an axum HTTP front end on top.

pub mod httpbind;
pub mod server;

pub use httpbind::body::{BoshBody, Deliverable};
pub use httpbind::config::BoshConfig;
pub use httpbind::error::{BindCondition, BindError};
pub use httpbind::services::{FeatureProvider, OfflineStore, PacketRouter, Services};
pub use httpbind::session::HttpSession;
pub use httpbind::stanza::Stanza;
pub use httpbind::stream_id::StreamId;
pub use httpbind::HttpSessionManager;
pub use server::HttpBindServer;
