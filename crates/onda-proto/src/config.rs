use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;
use super::resilience::RecoverySettings;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub station: StationConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

/// The single stream this player is built around.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    #[serde(default = "default_station_name")]
    pub name: String,
    #[serde(default = "default_station_url")]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f32,
    /// Whether a refused start is retried once with the output muted
    /// (un-muted shortly after).  A capability decision made at setup;
    /// some backends start reliably without it.
    #[serde(default = "default_muted_start_fallback")]
    pub muted_start_fallback: bool,
}

/// Timing knobs for the playback recovery state machine.  All delays in
/// milliseconds; see [`RecoverySettings`] for what each one gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_ghost_pause_window_ms")]
    pub ghost_pause_window_ms: u64,
    #[serde(default = "default_error_reload_delay_ms")]
    pub error_reload_delay_ms: u64,
    #[serde(default = "default_ended_reload_delay_ms")]
    pub ended_reload_delay_ms: u64,
    #[serde(default = "default_stall_retry_delay_ms")]
    pub stall_retry_delay_ms: u64,
    #[serde(default = "default_unmute_delay_ms")]
    pub unmute_delay_ms: u64,
}

impl RecoveryConfig {
    pub fn settings(&self) -> RecoverySettings {
        RecoverySettings {
            ghost_pause_window: Duration::from_millis(self.ghost_pause_window_ms),
            error_reload_delay: Duration::from_millis(self.error_reload_delay_ms),
            ended_reload_delay: Duration::from_millis(self.ended_reload_delay_ms),
            stall_retry_delay: Duration::from_millis(self.stall_retry_delay_ms),
        }
    }

    pub fn unmute_delay(&self) -> Duration {
        Duration::from_millis(self.unmute_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Probe target; when unset the station URL is probed.
    #[serde(default)]
    pub probe_url: Option<String>,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            name: default_station_name(),
            url: default_station_url(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            muted_start_fallback: default_muted_start_fallback(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            ghost_pause_window_ms: default_ghost_pause_window_ms(),
            error_reload_delay_ms: default_error_reload_delay_ms(),
            ended_reload_delay_ms: default_ended_reload_delay_ms(),
            stall_retry_delay_ms: default_stall_retry_delay_ms(),
            unmute_delay_ms: default_unmute_delay_ms(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_url: None,
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_http_port(),
        }
    }
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_station_name() -> String {
    "SomaFM Groove Salad".to_string()
}

fn default_station_url() -> String {
    "https://ice1.somafm.com/groovesalad-128-mp3".to_string()
}

fn default_volume() -> f32 {
    0.5
}

fn default_muted_start_fallback() -> bool {
    true
}

fn default_ghost_pause_window_ms() -> u64 {
    1200
}

fn default_error_reload_delay_ms() -> u64 {
    400
}

fn default_ended_reload_delay_ms() -> u64 {
    600
}

fn default_stall_retry_delay_ms() -> u64 {
    600
}

fn default_unmute_delay_ms() -> u64 {
    50
}

fn default_probe_interval_secs() -> u64 {
    10
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8787
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert!(config.station.url.starts_with("https://"));
        assert_eq!(config.recovery.ghost_pause_window_ms, 1200);
        assert_eq!(config.recovery.stall_retry_delay_ms, 600);
        assert!(config.media.muted_start_fallback);
    }

    #[test]
    fn test_recovery_settings_conversion() {
        let recovery = RecoveryConfig::default();
        let settings = recovery.settings();
        assert_eq!(settings.ghost_pause_window, Duration::from_millis(1200));
        assert_eq!(settings.error_reload_delay, Duration::from_millis(400));
        assert_eq!(settings.ended_reload_delay, Duration::from_millis(600));
        assert_eq!(recovery.unmute_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [station]
            name = "Test FM"
            url = "https://radio.example/live?fmt=mp3"

            [recovery]
            error_reload_delay_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.station.name, "Test FM");
        assert_eq!(config.recovery.error_reload_delay_ms, 500);
        // untouched fields keep their defaults
        assert_eq!(config.recovery.ghost_pause_window_ms, 1200);
        assert_eq!(config.network.probe_interval_secs, 10);
    }
}
