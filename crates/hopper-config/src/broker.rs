//! Broker configuration.
//!
//! ```kdl
//! broker {
//!     listen "0.0.0.0:7070"
//!     http-listen "0.0.0.0:7071"
//!     max-retries 3
//!     heartbeat-timeout-ms 15000
//!     tick-interval-ms 1000
//! }
//! store {
//!     root "/var/lib/hopper/broker"
//!     capacity-bytes 10737418240
//!     retention-secs 300
//! }
//! ```

use kdl::KdlDocument;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::node;
use crate::store::StoreConfig;
use crate::{ConfigError, ConfigResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Address clients, workers and artifact transfers connect to.
    pub listen: SocketAddr,
    /// Address of the HTTP surface (/health, /stats, /events).
    pub http_listen: SocketAddr,
    /// How many times an infrastructure failure may requeue one job.
    pub max_retries: u32,
    /// A worker silent for longer than this is considered lost.
    pub heartbeat_timeout: Duration,
    /// How often the scheduler checks heartbeat and queue timeouts.
    pub tick_interval: Duration,
    pub store: StoreConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 7070)),
            http_listen: SocketAddr::from(([0, 0, 0, 0], 7071)),
            max_retries: 3,
            heartbeat_timeout: Duration::from_secs(15),
            tick_interval: Duration::from_secs(1),
            store: StoreConfig::with_root("/var/lib/hopper/broker"),
        }
    }
}

impl BrokerConfig {
    /// Read and parse a broker.kdl file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        parse_broker_config(&text)
    }
}

fn socket_addr(value: String, field: &str) -> ConfigResult<SocketAddr> {
    value
        .parse()
        .map_err(|e| ConfigError::invalid(field, format!("{value:?}: {e}")))
}

fn positive_millis(ms: u64, field: &str) -> ConfigResult<Duration> {
    if ms == 0 {
        return Err(ConfigError::invalid(field, "must be greater than zero"));
    }
    Ok(Duration::from_millis(ms))
}

/// Parse broker configuration from KDL text. Unknown nodes are ignored.
pub fn parse_broker_config(kdl: &str) -> ConfigResult<BrokerConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = BrokerConfig::default();

    for section in doc.nodes() {
        match node::name(section) {
            "broker" => {
                for child in node::children(section) {
                    let field = format!("broker.{}", node::name(child));
                    match node::name(child) {
                        "listen" => config.listen = socket_addr(node::string(child, &field)?, &field)?,
                        "http-listen" => {
                            config.http_listen = socket_addr(node::string(child, &field)?, &field)?
                        }
                        "max-retries" => config.max_retries = node::u32_arg(child, &field)?,
                        "heartbeat-timeout-ms" => {
                            config.heartbeat_timeout =
                                positive_millis(node::u64_arg(child, &field)?, &field)?
                        }
                        "tick-interval-ms" => {
                            config.tick_interval =
                                positive_millis(node::u64_arg(child, &field)?, &field)?
                        }
                        _ => {}
                    }
                }
            }
            "store" => config.store.apply(section)?,
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_defaults() {
        let config = parse_broker_config("").unwrap();
        assert_eq!(config, BrokerConfig::default());
    }

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            broker {
                listen "127.0.0.1:9000"
                http-listen "127.0.0.1:9001"
                max-retries 5
                heartbeat-timeout-ms 2000
                tick-interval-ms 250
            }
            store {
                root "/tmp/hopper-store"
                capacity-bytes 1048576
                retention-secs 60
            }
        "#;

        let config = parse_broker_config(kdl).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.http_listen, "127.0.0.1:9001".parse().unwrap());
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(2));
        assert_eq!(config.tick_interval, Duration::from_millis(250));
        assert_eq!(config.store.root, Path::new("/tmp/hopper-store"));
        assert_eq!(config.store.retention_policy().max_size_bytes, 1048576);
        assert_eq!(config.store.retention, Duration::from_secs(60));
    }

    #[test]
    fn test_unknown_nodes_are_ignored() {
        let kdl = r#"
            telemetry { endpoint "http://collector" }
            broker { max-retries 1; colour "blue" }
        "#;
        let config = parse_broker_config(kdl).unwrap();
        assert_eq!(config.max_retries, 1);
    }

    #[test]
    fn test_bad_values() {
        let result = parse_broker_config(r#"broker { listen "not an address" }"#);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));

        let result = parse_broker_config(r#"broker { max-retries "three" }"#);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));

        let result = parse_broker_config(r#"broker { max-retries -1 }"#);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));

        let result = parse_broker_config(r#"broker { tick-interval-ms 0 }"#);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.kdl");
        std::fs::write(&path, "broker { max-retries 7 }").unwrap();
        assert_eq!(BrokerConfig::load(&path).unwrap().max_retries, 7);

        let missing = BrokerConfig::load(&dir.path().join("nope.kdl"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
