//! Collaborators the session layer relies on but does not implement.
//!
//! The rest of the XMPP server sits behind these traits: where client
//! stanzas go, where undeliverable messages end up, and which stream
//! features are on offer.

use std::sync::Arc;

use tracing::info;

use super::error::RouteError;
use super::stanza::Stanza;
use super::stream_id::{RandomStreamIds, StreamId, StreamIdGenerator};

/// Delivers stanzas sent by a BOSH client into the server.
pub trait PacketRouter: Send + Sync {
    fn route(&self, stream_id: &StreamId, stanza: Stanza) -> Result<(), RouteError>;
}

/// Storage for messages a client disappeared before receiving.
pub trait OfflineStore: Send + Sync {
    fn store_offline(&self, stanza: &Stanza);
}

/// Read-only view of the SASL and compression state of a stream.
pub trait FeatureProvider: Send + Sync {
    /// SASL mechanisms still on offer. Empty once the stream is
    /// authenticated.
    fn sasl_mechanisms(&self, stream_id: &StreamId) -> Vec<String>;

    /// Compression methods still on offer. Empty once compression is active
    /// or when it is disabled.
    fn compression_methods(&self, stream_id: &StreamId) -> Vec<String>;
}

/// Fixed feature list, identical for every stream.
#[derive(Debug, Clone)]
pub struct StaticFeatures {
    pub mechanisms: Vec<String>,
    pub compression: Vec<String>,
}

impl Default for StaticFeatures {
    fn default() -> Self {
        Self {
            mechanisms: vec!["PLAIN".to_string()],
            compression: Vec::new(),
        }
    }
}

impl FeatureProvider for StaticFeatures {
    fn sasl_mechanisms(&self, _stream_id: &StreamId) -> Vec<String> {
        self.mechanisms.clone()
    }

    fn compression_methods(&self, _stream_id: &StreamId) -> Vec<String> {
        self.compression.clone()
    }
}

/// Offline store that only logs what it was handed.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingOfflineStore;

impl OfflineStore for LoggingOfflineStore {
    fn store_offline(&self, stanza: &Stanza) {
        info!(bytes = stanza.as_xml().len(), "Message stored offline");
    }
}

/// Everything a session manager needs from the outside world.
#[derive(Clone)]
pub struct Services {
    pub router: Arc<dyn PacketRouter>,
    pub offline: Arc<dyn OfflineStore>,
    pub features: Arc<dyn FeatureProvider>,
    pub stream_ids: Arc<dyn StreamIdGenerator>,
}

impl Services {
    /// `router` plus logging offline storage, PLAIN-only SASL and random
    /// stream ids.
    pub fn new(router: Arc<dyn PacketRouter>) -> Self {
        Self {
            router,
            offline: Arc::new(LoggingOfflineStore),
            features: Arc::new(StaticFeatures::default()),
            stream_ids: Arc::new(RandomStreamIds),
        }
    }

    pub fn with_offline_store(mut self, offline: Arc<dyn OfflineStore>) -> Self {
        self.offline = offline;
        self
    }

    pub fn with_features(mut self, features: Arc<dyn FeatureProvider>) -> Self {
        self.features = features;
        self
    }

    pub fn with_stream_ids(mut self, stream_ids: Arc<dyn StreamIdGenerator>) -> Self {
        self.stream_ids = stream_ids;
        self
    }
}
