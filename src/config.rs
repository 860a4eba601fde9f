//! Config modules for the application.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::cache::DEFAULT_QUEUE_CAPACITY;
use crate::error::AppError;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl AppConfig {
    pub fn from_toml_str(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, AppError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
            .map_err(|e| AppError::Parse(format!("failed to parse config file: {e}")))
    }

    /// Load configuration with fallback to defaults.
    /// Tries standard locations in order: CWD > user config dir > /etc.
    pub fn load_or_default() -> Self {
        let config_paths = [
            PathBuf::from("iohub.toml"),
            dirs::config_dir()
                .map(|config_dir| config_dir.join("iohub.toml"))
                .unwrap_or_else(|| PathBuf::from("iohub.toml")),
            PathBuf::from("/etc/iohub/iohub.toml"),
        ];

        for path in &config_paths {
            if path.exists() {
                match Self::from_file(path) {
                    Ok(config) => {
                        tracing::info!("Loaded configuration from: {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Failed to load config from {}: {}. Falling back to defaults.",
                            path.display(),
                            e
                        );
                    }
                }
                // Only try the first existing config file
                break;
            }
        }

        tracing::info!("No configuration file found, using defaults");
        Self::default()
    }
}

// set web.enabled = false in [web] to explicitly disable the WebSocket bridge
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_web_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
    /// Directory of static web assets to serve next to /ws. Serving is
    /// skipped when unset or when the directory has no index.html.
    #[serde(default)]
    pub assets: Option<PathBuf>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_web_host(),
            port: default_web_port(),
            assets: None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_web_host() -> String {
    "0.0.0.0".to_string()
}

fn default_web_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MqttConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
    /// First segment of every bridged topic: `<root>/io/<i|o>/<name>/<dataType>`
    #[serde(default = "default_topic_root")]
    pub topic_root: String,
    /// Fixed reconnect interval while the broker is unreachable
    #[serde(default = "default_reconnect_ms")]
    pub reconnect_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_mqtt_client_id(),
            topic_root: default_topic_root(),
            reconnect_ms: default_reconnect_ms(),
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "iohub".to_string()
}

fn default_topic_root() -> String {
    "rook".to_string()
}

fn default_reconnect_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Slots in the bounded event queue; producers block when it is full
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
