use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// =============================================================================
// File config (figment-deserialized from defaults / live_query.toml / env vars)
// =============================================================================
//
//   live_query.toml:  [reconnect]
//                     enabled = false
//
//   env var:          LIVE_QUERY_RECONNECT__ENABLED=false   (double underscore = nesting)

const ENV_PREFIX: &str = "LIVE_QUERY_";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server_uri: String,
    #[serde(default)]
    pub application_id: String,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub installation_id: Option<String>,
    #[serde(default)]
    pub teardown: TeardownFileConfig,
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,
    #[serde(default)]
    pub host: HostFileConfig,
}

/// Unsubscribe wait (lives under `[teardown]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TeardownFileConfig {
    #[serde(default = "default_teardown_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for TeardownFileConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_teardown_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Automatic resubscription after a dropped socket (lives under `[reconnect]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectFileConfig {
    #[serde(default = "default_reconnect_enabled")]
    pub enabled: bool,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for ReconnectFileConfig {
    fn default() -> Self {
        Self {
            enabled: default_reconnect_enabled(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// Host tick settings (lives under `[host]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostFileConfig {
    #[serde(default = "default_pump_interval_ms")]
    pub pump_interval_ms: u64,
}

impl Default for HostFileConfig {
    fn default() -> Self {
        Self {
            pump_interval_ms: default_pump_interval_ms(),
        }
    }
}

fn default_teardown_timeout_ms() -> u64 {
    3000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_reconnect_enabled() -> bool {
    true
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_max_delay_secs() -> u64 {
    60
}
fn default_pump_interval_ms() -> u64 {
    50
}

/// Build a figment that layers: defaults → `path` (TOML, optional) → `LIVE_QUERY_*` env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `LIVE_QUERY_TEARDOWN__TIMEOUT_MS=500`  →  `teardown.timeout_ms = 500`
pub fn load_config(path: Option<&Path>) -> Figment {
    layered(path, ENV_PREFIX)
}

fn layered(path: Option<&Path>, env_prefix: &str) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed(env_prefix).split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

/// How long a registry waits for a session to confirm its unsubscribe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TeardownConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl TeardownConfig {
    pub fn from_file(fc: &TeardownFileConfig) -> Self {
        Self {
            timeout: Duration::from_millis(fc.timeout_ms),
            poll_interval: Duration::from_millis(fc.poll_interval_ms),
        }
    }
}

/// Backoff schedule for automatic resubscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn from_file(fc: &ReconnectFileConfig) -> Self {
        Self {
            enabled: fc.enabled,
            initial_delay: Duration::from_millis(fc.initial_delay_ms),
            max_delay: Duration::from_secs(fc.max_delay_secs),
        }
    }

    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(6);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Everything a session and registry need to talk to one live query server.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server_uri: String,
    pub application_id: String,
    pub session_token: Option<String>,
    pub installation_id: Option<String>,
    pub teardown: TeardownConfig,
    pub reconnect: ReconnectPolicy,
    /// Tick interval for [`crate::SubscriptionRegistry::spawn_pump_loop`].
    pub pump_interval: Duration,
}

impl ClientConfig {
    /// Config with default tunables for `server_uri` / `application_id`.
    pub fn new(server_uri: impl Into<String>, application_id: impl Into<String>) -> Self {
        let mut config = Self::from_file(&FileConfig::default());
        config.server_uri = server_uri.into();
        config.application_id = application_id.into();
        config
    }

    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            server_uri: fc.server_uri.clone(),
            application_id: fc.application_id.clone(),
            session_token: fc.session_token.clone().filter(|s| !s.is_empty()),
            installation_id: fc.installation_id.clone().filter(|s| !s.is_empty()),
            teardown: TeardownConfig::from_file(&fc.teardown),
            reconnect: ReconnectPolicy::from_file(&fc.reconnect),
            pump_interval: Duration::from_millis(fc.host.pump_interval_ms),
        }
    }

    /// Load defaults, then `path` if given, then `LIVE_QUERY_*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc: FileConfig = load_config(path).extract().map_err(Box::new)?;
        Ok(Self::from_file(&fc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert!(fc.server_uri.is_empty());
        assert!(fc.session_token.is_none());
        assert_eq!(fc.teardown.timeout_ms, 3000);
        assert_eq!(fc.teardown.poll_interval_ms, 100);
        assert!(fc.reconnect.enabled);
        assert_eq!(fc.reconnect.initial_delay_ms, 1000);
        assert_eq!(fc.reconnect.max_delay_secs, 60);
        assert_eq!(fc.host.pump_interval_ms, 50);
    }

    #[test]
    fn test_client_config_new() {
        let config = ClientConfig::new("wss://example.org/live", "APP123");
        assert_eq!(config.server_uri, "wss://example.org/live");
        assert_eq!(config.application_id, "APP123");
        assert_eq!(config.teardown.timeout, Duration::from_secs(3));
        assert_eq!(config.teardown.poll_interval, Duration::from_millis(100));
        assert_eq!(config.pump_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_empty_credentials_are_unset() {
        let fc = FileConfig {
            session_token: Some(String::new()),
            installation_id: Some("install-1".into()),
            ..Default::default()
        };
        let config = ClientConfig::from_file(&fc);
        assert!(config.session_token.is_none());
        assert_eq!(config.installation_id.as_deref(), Some("install-1"));
    }

    // ── ReconnectPolicy ─────────────────────────────────────────────────

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = ReconnectPolicy {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(5), Duration::from_secs(32));
        assert_eq!(policy.delay_for(6), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults_without_file() {
        let fc: FileConfig = layered(None, "LQ_TEST_UNSET_").extract().unwrap();
        assert!(fc.server_uri.is_empty());
        assert_eq!(fc.teardown.timeout_ms, 3000);
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("live_query.toml");
        let fc: FileConfig = layered(Some(&path), "LQ_TEST_UNSET_").extract().unwrap();
        assert!(fc.reconnect.enabled);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("live_query.toml");
        std::fs::write(
            &path,
            "server_uri = \"wss://example.org/live\"\n\
             application_id = \"APP123\"\n\
             [teardown]\ntimeout_ms = 500\n\
             [reconnect]\nenabled = false\n",
        )
        .unwrap();

        let fc: FileConfig = layered(Some(&path), "LQ_TEST_UNSET_").extract().unwrap();
        assert_eq!(fc.server_uri, "wss://example.org/live");
        assert_eq!(fc.application_id, "APP123");
        assert_eq!(fc.teardown.timeout_ms, 500);
        assert_eq!(fc.teardown.poll_interval_ms, 100);
        assert!(!fc.reconnect.enabled);
    }

    #[test]
    fn test_load_config_env_overrides_toml() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("live_query.toml");
        std::fs::write(&path, "application_id = \"FROM_FILE\"\n[host]\npump_interval_ms = 20\n")
            .unwrap();

        // Prefix unique to this test so parallel tests never see it
        unsafe {
            std::env::set_var("LQ_TEST_ENV_APPLICATION_ID", "FROM_ENV");
            std::env::set_var("LQ_TEST_ENV_HOST__PUMP_INTERVAL_MS", "75");
        }
        let fc: FileConfig = layered(Some(&path), "LQ_TEST_ENV_").extract().unwrap();
        unsafe {
            std::env::remove_var("LQ_TEST_ENV_APPLICATION_ID");
            std::env::remove_var("LQ_TEST_ENV_HOST__PUMP_INTERVAL_MS");
        }

        assert_eq!(fc.application_id, "FROM_ENV");
        assert_eq!(fc.host.pump_interval_ms, 75);
    }

    #[test]
    fn test_load_config_rejects_bad_types() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("live_query.toml");
        std::fs::write(&path, "[teardown]\ntimeout_ms = \"soon\"\n").unwrap();
        assert!(layered(Some(&path), "LQ_TEST_UNSET_").extract::<FileConfig>().is_err());
    }
}
