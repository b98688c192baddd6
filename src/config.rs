//! On-disk configuration: a single `max_lost_after_reset`, the gateway UDP
//! bind address, and logging — loaded once at startup from TOML via `serde`.

use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub udp: UdpConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct UdpConfig {
    pub bind: String,
}

/// The engine's one piece of live configuration: read at
/// transaction time, so it can be reloaded without restarting the process.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct EngineConfig {
    pub max_lost_after_reset: u32,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse config file: {}", e))?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp: UdpConfig {
                bind: "0.0.0.0:1680".to_string(),
            },
            engine: EngineConfig {
                max_lost_after_reset: 16384,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}
