//! Server-side BOSH policy.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

/// Inactivity timeout, `xmpp.httpbind.client.idle`.
pub const PROP_INACTIVITY: &str = "xmpp.httpbind.client.idle";
/// Advertised max simultaneous requests, `xmpp.httpbind.client.requests.max`.
pub const PROP_MAX_REQUESTS: &str = "xmpp.httpbind.client.requests.max";
/// Minimum polling interval, `xmpp.httpbind.client.requests.polling`.
pub const PROP_POLLING: &str = "xmpp.httpbind.client.requests.polling";
/// Longest pause a client may request, `xmpp.httpbind.client.maxpause`.
pub const PROP_MAX_PAUSE: &str = "xmpp.httpbind.client.maxpause";
/// Upper bound applied to the client's `wait`, `xmpp.httpbind.client.requests.wait`.
pub const PROP_MAX_WAIT: &str = "xmpp.httpbind.client.requests.wait";
/// Trust `X-Forwarded-*` headers, `httpbind.forwarded.enabled`.
pub const PROP_FORWARDED: &str = "httpbind.forwarded.enabled";
/// Domain announced in `from`, `xmpp.domain`.
pub const PROP_DOMAIN: &str = "xmpp.domain";

/// Policy applied to every session a manager creates.
///
/// Durations are whole seconds, the unit BOSH uses on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BoshConfig {
    /// Domain put in the `from` attribute of creation responses.
    pub server_name: String,
    /// Seconds a session may go without any open connection.
    pub inactivity_timeout: u64,
    /// Max simultaneous requests advertised to clients.
    pub max_requests: u32,
    /// Minimum seconds between two empty polls of a polling session.
    pub polling_interval: u64,
    /// Upper bound on the `wait` a client may ask for.
    pub max_wait: u64,
    /// Upper bound on the `pause` a client may ask for.
    pub max_pause: u64,
    /// `wait` used when the creation request carries none.
    pub default_wait: u64,
    /// `hold` used when the creation request carries none.
    pub default_hold: u32,
    /// Whether `X-Forwarded-For`/`X-Forwarded-Proto` are trusted.
    pub forwarded_enabled: bool,
}

impl Default for BoshConfig {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            inactivity_timeout: 1800,
            max_requests: 2,
            polling_interval: 5,
            max_wait: 120,
            max_pause: 300,
            default_wait: 60,
            default_hold: 1,
            forwarded_enabled: false,
        }
    }
}

impl BoshConfig {
    /// Build a config from Openfire-style properties.
    ///
    /// Unknown keys are ignored. Values that do not parse keep their default.
    pub fn from_properties<I, K, V>(properties: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in properties {
            config.set(key.as_ref(), value.as_ref());
        }
        config
    }

    /// Apply a single property.
    pub fn set(&mut self, key: &str, value: &str) {
        let value = value.trim();
        match key {
            PROP_INACTIVITY => parse_into(key, value, &mut self.inactivity_timeout),
            PROP_MAX_REQUESTS => parse_into(key, value, &mut self.max_requests),
            PROP_POLLING => parse_into(key, value, &mut self.polling_interval),
            PROP_MAX_PAUSE => parse_into(key, value, &mut self.max_pause),
            PROP_MAX_WAIT => parse_into(key, value, &mut self.max_wait),
            PROP_FORWARDED => parse_into(key, value, &mut self.forwarded_enabled),
            PROP_DOMAIN => self.server_name = value.to_string(),
            _ => debug!(key, "Ignoring unknown BOSH property"),
        }
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval)
    }

    pub fn max_pause(&self) -> Duration {
        Duration::from_secs(self.max_pause)
    }

    /// Largest `hold` a client can get: one request always has to stay free
    /// for sending.
    pub fn max_hold(&self) -> u32 {
        self.max_requests.saturating_sub(1)
    }
}

fn parse_into<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value, "Invalid BOSH property value, keeping default"),
    }
}
