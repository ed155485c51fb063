mod defaults;


use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::WasendError;
use defaults::*;

/// Top-level wasend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub wasend: WasendConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
}

/// General service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WasendConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for WasendConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

/// HTTP API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Bearer token for API authentication. Empty = no auth (for local-only use).
    #[serde(default)]
    pub api_key: String,
    /// Allowed browser origins. Empty = any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Largest accepted multipart upload.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            api_key: String::new(),
            cors_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Device-link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// How long one link attempt may wait for a QR scan before failing.
    #[serde(default = "default_qr_timeout_secs")]
    pub qr_timeout_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            qr_timeout_secs: default_qr_timeout_secs(),
        }
    }
}

impl LinkConfig {
    pub fn qr_timeout(&self) -> Duration {
        Duration::from_secs(self.qr_timeout_secs)
    }
}

/// Bulk dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Pause between two consecutive sends.
    #[serde(default = "default_send_interval_ms")]
    pub send_interval_ms: u64,
    /// Upper bound for one whole bulk send.
    #[serde(default = "default_dispatch_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            send_interval_ms: default_send_interval_ms(),
            timeout_secs: default_dispatch_timeout_secs(),
        }
    }
}

impl DispatchConfig {
    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// WhatsApp device client config.
///
/// Session credentials are stored at `{data_dir}/sessions/{session_id}/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    /// Name shown in the phone's "Linked devices" list.
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
        }
    }
}

/// Expand `~` to home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

/// Load configuration from a TOML file.
///
/// Falls back to defaults if the file does not exist.
pub fn load(path: &str) -> Result<Config, WasendError> {
    let path = Path::new(path);
    if !path.exists() {
        tracing::info!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| WasendError::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| WasendError::Config(format!("failed to parse config: {}", e)))?;

    Ok(config)
}
