use crate::error::SimError;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub eui: String,
    pub udp_ip: String,
    pub udp_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub devaddr: String,
    pub nwk_skey: String,
    pub app_skey: String,
    #[serde(default = "default_send_interval")]
    pub send_interval_s: u32,
    #[serde(default = "default_distance")]
    pub distance_m: u32,
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_send_interval() -> u32 {
    10
}
fn default_distance() -> u32 {
    2000
}
fn default_environment() -> String {
    "suburban".to_string()
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse config file: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations with duplicate or missing DevAddrs before the
    /// event loop starts.
    fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.devaddr.is_empty() {
                anyhow::bail!("device entry is missing devaddr");
            }
            let key = device.devaddr.to_uppercase();
            if !seen.insert(key) {
                return Err(SimError::DuplicateDevAddr(device.devaddr.clone()).into());
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig {
                eui: "AABBCCDDEEFF0011".to_string(),
                udp_ip: "127.0.0.1".to_string(),
                udp_port: 1700,
            },
            devices: vec![DeviceConfig {
                devaddr: "26011BDA".to_string(),
                nwk_skey: "0".repeat(32),
                app_skey: "0".repeat(32),
                send_interval_s: default_send_interval(),
                distance_m: default_distance(),
                environment: default_environment(),
            }],
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_duplicate_devaddr() {
        let config = Config {
            gateway: GatewayConfig { eui: "0".repeat(16), udp_ip: "127.0.0.1".into(), udp_port: 1700 },
            devices: vec![
                DeviceConfig { devaddr: "26011BDA".into(), nwk_skey: "0".repeat(32), app_skey: "0".repeat(32), send_interval_s: 10, distance_m: 100, environment: "rural".into() },
                DeviceConfig { devaddr: "26011bda".into(), nwk_skey: "0".repeat(32), app_skey: "0".repeat(32), send_interval_s: 10, distance_m: 100, environment: "rural".into() },
            ],
            logging: LoggingConfig::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_unique_devaddrs() {
        let config = Config {
            gateway: GatewayConfig { eui: "0".repeat(16), udp_ip: "127.0.0.1".into(), udp_port: 1700 },
            devices: vec![
                DeviceConfig { devaddr: "26011BDA".into(), nwk_skey: "0".repeat(32), app_skey: "0".repeat(32), send_interval_s: 10, distance_m: 100, environment: "rural".into() },
                DeviceConfig { devaddr: "26011BDB".into(), nwk_skey: "0".repeat(32), app_skey: "0".repeat(32), send_interval_s: 10, distance_m: 100, environment: "rural".into() },
            ],
            logging: LoggingConfig::default(),
        };
        assert!(config.validate().is_ok());
    }
}
