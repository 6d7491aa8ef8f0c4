//! Layered configuration for servers and spawners. Deserializable from TOML;
//! `Default` gives the same values a process gets if no file is present.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Address the server binds to, e.g. "127.0.0.1:0" for an ephemeral port.
    pub bind_addr: String,
    /// Serializer tag this process prefers when it is acting as a client.
    pub default_serializer: String,
    pub connect_timeout_ms: u64,
    pub bootstrap_timeout_ms: u64,
    pub close_grace_ms: u64,
    pub log_level: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            default_serializer: "msgpack".to_string(),
            connect_timeout_ms: 5_000,
            bootstrap_timeout_ms: 10_000,
            close_grace_ms: 200,
            log_level: crate::consts::DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl RpcConfig {
    pub fn from_toml_str(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let cfg = RpcConfig::default();
        assert_eq!(cfg.bind_addr, "127.0.0.1:0");
        assert_eq!(cfg.default_serializer, "msgpack");
    }

    #[test]
    fn parses_partial_toml_over_defaults() {
        let toml_str = r#"
            bind_addr = "0.0.0.0:9000"
            connect_timeout_ms = 1500
        "#;
        let cfg = RpcConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:9000");
        assert_eq!(cfg.connect_timeout_ms, 1500);
        // untouched fields keep their defaults
        assert_eq!(cfg.default_serializer, "msgpack");
    }
}
