//! Tunables for the registry, the controllers and the media layer.
//!
//! Every field has a default matching the production behaviour; JSON
//! overrides only need to name the fields they change. Durations are in
//! milliseconds on the wire.

use callcore::retry::RetryPolicy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Ring window for both the client countdown and the registry timeout.
    pub ring_timeout_ms: u64,
    /// Window in which duplicate incoming-call deliveries collapse into one notification.
    pub notification_debounce_ms: u64,
    /// How long terminal sessions are kept as history.
    pub history_retention_ms: u64,
    pub media: MediaConfig,
    pub tokens: TokenConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_ms: 30_000,
            notification_debounce_ms: 300,
            history_retention_ms: 24 * 60 * 60 * 1000,
            media: MediaConfig::default(),
            tokens: TokenConfig::default(),
        }
    }
}

impl CallConfig {
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_timeout_ms)
    }

    pub fn notification_debounce(&self) -> Duration {
        Duration::from_millis(self.notification_debounce_ms)
    }

    pub fn history_retention(&self) -> Duration {
        Duration::from_millis(self.history_retention_ms)
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::from_json_str(&raw)?)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Polls while waiting for a previous connection to reach disconnected.
    pub settle_attempts: u32,
    pub settle_interval_ms: u64,
    /// Whole-join retries for transient failures.
    pub join_retry: RetryPolicy,
    /// Per-participant subscribe retries inside one sweep.
    pub subscribe_retry: RetryPolicy,
    /// Offsets after a successful join at which subscribe sweeps run.
    pub sweep_delays_ms: Vec<u64>,
    /// Delay of the one extra sweep scheduled after a sweep with no success.
    pub follow_up_sweep_delay_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            settle_attempts: 20,
            settle_interval_ms: 500,
            join_retry: RetryPolicy::linear(2, Duration::from_secs(1)),
            subscribe_retry: RetryPolicy::linear(2, Duration::from_millis(200)),
            sweep_delays_ms: vec![800, 2_000, 4_000],
            follow_up_sweep_delay_ms: 2_000,
        }
    }
}

impl MediaConfig {
    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    pub fn sweep_delays(&self) -> impl Iterator<Item = Duration> + '_ {
        self.sweep_delays_ms.iter().map(|ms| Duration::from_millis(*ms))
    }

    pub fn follow_up_sweep_delay(&self) -> Duration {
        Duration::from_millis(self.follow_up_sweep_delay_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub app_id: String,
    /// Without a certificate tokens are not issued (permissive/testing mode).
    pub app_certificate: Option<String>,
    pub ttl_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            app_id: "chatcall-dev".to_string(),
            app_certificate: None,
            ttl_secs: 3600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_production_values() {
        let config = CallConfig::default();
        assert_eq!(config.ring_timeout(), Duration::from_secs(30));
        assert_eq!(config.notification_debounce(), Duration::from_millis(300));
        assert_eq!(config.media.settle_attempts, 20);
        assert_eq!(config.media.join_retry.attempts(), 2);
        assert_eq!(
            config.media.sweep_delays().collect::<Vec<_>>(),
            vec![
                Duration::from_millis(800),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = CallConfig::from_json_str(
            r#"{ "ring_timeout_ms": 45000, "media": { "settle_attempts": 3 } }"#,
        )
        .unwrap();
        assert_eq!(config.ring_timeout(), Duration::from_secs(45));
        assert_eq!(config.media.settle_attempts, 3);
        assert_eq!(config.media.settle_interval_ms, 500);
        assert_eq!(config.notification_debounce_ms, 300);
        assert!(config.tokens.app_certificate.is_none());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "tokens": {{ "app_id": "prod", "app_certificate": "s3cret" }},
                 "media": {{ "join_retry": {{ "max_attempts": 4, "backoff": {{ "kind": "fixed", "delay_ms": 10 }} }} }} }}"#
        )
        .unwrap();
        let config = CallConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.tokens.app_id, "prod");
        assert_eq!(config.tokens.app_certificate.as_deref(), Some("s3cret"));
        assert_eq!(config.media.join_retry.attempts(), 4);
    }
}
