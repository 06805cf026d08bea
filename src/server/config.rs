//! Server configuration types

use marketflow_core::{HubConfig, ManagerConfig};
use serde::{Deserialize, Serialize};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Operation engine settings
    #[serde(default)]
    pub engine: ManagerConfig,
    /// Client connection settings
    #[serde(default)]
    pub hub: HubConfig,
    /// Built-in stage executors
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8090
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Simulated pipeline stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Duration of one unit of work, in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Units of work per stage
    #[serde(default = "default_ticks")]
    pub ticks: u32,
}

fn default_tick_ms() -> u64 {
    250
}

fn default_ticks() -> u32 {
    8
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            ticks: default_ticks(),
        }
    }
}
