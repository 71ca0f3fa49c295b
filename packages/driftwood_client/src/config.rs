use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::AdmissionLimits;
use crate::events::ChannelConfig;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Two equivalent ways to configure:
//
//   config.toml:     [channel]
//                    base_delay_ms = 500
//
//   env var:         DRIFT_CHANNEL__BASE_DELAY_MS=500   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub channel: ChannelFileConfig,
    #[serde(default)]
    pub admission: AdmissionFileConfig,
    #[serde(default)]
    pub presence: PresenceFileConfig,
}

/// Where the gallery server lives (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

/// Update-channel reconnect tuning (lives under `[channel]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelFileConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ChannelFileConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_attempts: default_max_attempts(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Per-endpoint request budgets (lives under `[admission]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdmissionFileConfig {
    #[serde(default = "default_folders_limit")]
    pub folders: usize,
    #[serde(default = "default_thumb_limit")]
    pub thumb: usize,
    #[serde(default = "default_file_limit")]
    pub file: usize,
}

impl Default for AdmissionFileConfig {
    fn default() -> Self {
        Self {
            folders: default_folders_limit(),
            thumb: default_thumb_limit(),
            file: default_file_limit(),
        }
    }
}

/// Presence lease tuning (lives under `[presence]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PresenceFileConfig {
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

impl Default for PresenceFileConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8787".to_string()
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_attempts() -> u32 {
    4
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_folders_limit() -> usize {
    2
}
fn default_thumb_limit() -> usize {
    6
}
fn default_file_limit() -> usize {
    3
}
fn default_lease_ttl_secs() -> u64 {
    60
}

/// Build a figment that layers: struct defaults → config.toml → DRIFT_* env
/// vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `DRIFT_SERVER__BASE_URL=https://gallery.example`  →  `server.base_url`
///   `DRIFT_ADMISSION__THUMB=8`  →  `admission.thumb = 8`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("DRIFT_").split("__"))
}

/// Resolved runtime configuration.
#[derive(Clone, Debug)]
pub struct DriftConfig {
    pub data_dir: PathBuf,
    pub base_url: String,
    pub base_delay: Duration,
    pub max_attempts: u32,
    pub max_delay: Duration,
    pub admission_limits: AdmissionLimits,
    pub lease_ttl: Duration,
}

impl DriftConfig {
    pub fn from_file(data_dir: PathBuf, fc: &FileConfig) -> Self {
        Self {
            data_dir,
            base_url: fc.server.base_url.trim_end_matches('/').to_string(),
            base_delay: Duration::from_millis(fc.channel.base_delay_ms),
            max_attempts: fc.channel.max_attempts,
            max_delay: Duration::from_millis(fc.channel.max_delay_ms),
            admission_limits: AdmissionLimits {
                folders: fc.admission.folders,
                thumb: fc.admission.thumb,
                file: fc.admission.file,
            },
            lease_ttl: Duration::from_secs(fc.presence.lease_ttl_secs),
        }
    }

    pub fn events_url(&self) -> String {
        format!("{}/api/events", self.base_url)
    }

    pub fn presence_enter_url(&self) -> String {
        format!("{}/api/presence/enter", self.base_url)
    }

    pub fn presence_leave_url(&self) -> String {
        format!("{}/api/presence/leave", self.base_url)
    }

    /// Channel tuning for a given client identity.
    pub fn channel_config(&self, client_id: impl Into<String>) -> ChannelConfig {
        let mut config = ChannelConfig::new(self.events_url(), client_id);
        config.base_delay = self.base_delay;
        config.max_attempts = self.max_attempts;
        config.max_delay = self.max_delay;
        config
    }
}
