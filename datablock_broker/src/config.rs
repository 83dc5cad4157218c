//! Broker configuration, loadable from TOML via `datablock_common`'s
//! `ConfigLoader`.

use datablock_common::config::{ConfigLoader, SharedConfig};
use serde::{Deserialize, Serialize};

/// Top-level broker configuration file shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Fields common to every DataBlock binary (service name, log level).
    #[serde(default = "default_shared")]
    pub shared: SharedConfig,
    /// Filesystem path of the Unix domain socket the broker listens on.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

fn default_shared() -> SharedConfig {
    SharedConfig {
        service_name: "datablock_broker".to_string(),
        log_level: Default::default(),
    }
}

fn default_socket_path() -> String {
    "/tmp/datablock_broker.sock".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            shared: default_shared(),
            socket_path: default_socket_path(),
        }
    }
}

impl ConfigLoader for BrokerConfig {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_has_sane_socket_path() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.socket_path, "/tmp/datablock_broker.sock");
        assert_eq!(cfg.shared.service_name, "datablock_broker");
    }

    #[test]
    fn loads_from_toml_with_defaults_applied() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[shared]\nservice_name = \"custom_broker\"\n").unwrap();
        let cfg = BrokerConfig::load(file.path()).unwrap();
        assert_eq!(cfg.shared.service_name, "custom_broker");
        assert_eq!(cfg.socket_path, "/tmp/datablock_broker.sock");
    }
}
