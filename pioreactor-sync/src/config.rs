use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "PIOREACTOR_SYNC_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "pioreactor-sync.yaml";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Host of the leader unit; serves both the broker and the REST backend.
    pub leader_address: String,
    pub mqtt_port: u16,
    /// When present the bus is reached over WebSocket instead of raw TCP.
    pub remote: Option<RemoteConf>,
    /// Defaults to `http://{leader_address}`.
    pub api_base: Option<String>,
    pub keep_alive_secs: u64,
    pub handshake_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub listen: String,
    pub api_key: Option<String>,
    pub log_buffer: usize,
    /// Pins the experiment instead of following the latest one.
    pub experiment: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RemoteConf {
    pub ws_url: String, // ex: "fleet.example.org:8080"
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            leader_address: "pioreactor.local".into(),
            mqtt_port: 9001,
            remote: None,
            api_base: None,
            keep_alive_secs: 15,
            handshake_timeout_secs: 120,
            http_timeout_secs: 15,
            listen: "0.0.0.0:8080".into(),
            api_key: None,
            log_buffer: 50,
            experiment: None,
        }
    }
}

impl SyncConfig {
    pub fn from_yaml_str(txt: &str) -> Result<Self, serde_yaml::Error> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(txt)
    }

    pub fn api_base(&self) -> String {
        match &self.api_base {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("http://{}", self.leader_address),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

pub async fn load_config() -> SyncConfig {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    load_config_from(&path).await
}

pub async fn load_config_from(path: &str) -> SyncConfig {
    if !Path::new(path).exists() {
        info!(path, "no config file, using defaults");
        return SyncConfig::default();
    }
    let txt = match fs::read_to_string(path).await {
        Ok(txt) => txt,
        Err(e) => {
            warn!(path, error = %e, "config unreadable, using defaults");
            return SyncConfig::default();
        }
    };
    SyncConfig::from_yaml_str(&txt).unwrap_or_else(|e| {
        warn!(path, error = %e, "invalid config, using defaults");
        SyncConfig::default()
    })
}
