//! Runtime configuration.
//!
//! The façade owns files and environment; this module only decodes a
//! configuration string and applies defaults. Every section is optional
//! and every field inside a section is optional, so a handle can be
//! initialized from `ClientConfig::default()`.

use std::{io, time};

pub fn from_str(mut txt: &str) -> io::Result<ClientConfig> {
    txt = txt.trim_left();
    if txt.starts_with('{') {
        ::serde_json::from_str(txt).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    } else {
        ::serde_yaml::from_str(txt).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

const DEFAULT_SERVICE_TYPE: &'static str = "_lumen._tcp";
const DEFAULT_DOMAIN: &'static str = "local";
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 30;
const DEFAULT_NODE_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_NODES: usize = 64;

const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

const DEFAULT_STRATEGY: &'static str = "round_robin";
const DEFAULT_CACHE_TTL_SECS: u64 = 30;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CHECK_INTERVAL_SECS: u64 = 30;

const DEFAULT_CHUNK_THRESHOLD: usize = 512 * 1024;
const DEFAULT_MAX_CHUNK_BYTES: usize = 256 * 1024;

const DEFAULT_MAX_CONNECTIONS: usize = 16;
const DEFAULT_MAX_IDLE_SECS: u64 = 300;
const DEFAULT_MAX_LIFETIME_SECS: u64 = 3600;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ClientConfig {
    pub discovery: Option<DiscoveryConfig>,
    pub connection: Option<ConnectionConfig>,
    pub load_balancer: Option<LoadBalancerConfig>,
    pub chunk: Option<ChunkConfig>,
    pub pool: Option<PoolConfig>,
}

impl ClientConfig {
    pub fn discovery(&self) -> DiscoveryConfig {
        self.discovery.clone().unwrap_or_default()
    }
    pub fn connection(&self) -> ConnectionConfig {
        self.connection.clone().unwrap_or_default()
    }
    pub fn load_balancer(&self) -> LoadBalancerConfig {
        self.load_balancer.clone().unwrap_or_default()
    }
    pub fn chunk(&self) -> ChunkConfig {
        self.chunk.clone().unwrap_or_default()
    }

    /// Pool settings, derived from the connection section when absent.
    pub fn pool(&self) -> PoolConfig {
        match self.pool {
            Some(ref p) => p.clone(),
            None => {
                let conn = self.connection();
                PoolConfig {
                    connection_ttl_secs: Some(conn.dial_timeout().as_secs()),
                    ..PoolConfig::default()
                }
            }
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DiscoveryConfig {
    pub enabled: Option<bool>,
    pub service_type: Option<String>,
    pub domain: Option<String>,
    pub scan_interval_secs: Option<u64>,
    pub node_timeout_secs: Option<u64>,
    pub max_nodes: Option<usize>,
}

impl DiscoveryConfig {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
    pub fn service_type(&self) -> String {
        self.service_type.clone().unwrap_or_else(|| DEFAULT_SERVICE_TYPE.into())
    }
    pub fn domain(&self) -> String {
        self.domain.clone().unwrap_or_else(|| DEFAULT_DOMAIN.into())
    }
    pub fn scan_interval(&self) -> time::Duration {
        time::Duration::from_secs(self.scan_interval_secs.unwrap_or(DEFAULT_SCAN_INTERVAL_SECS))
    }
    pub fn node_timeout(&self) -> time::Duration {
        time::Duration::from_secs(self.node_timeout_secs.unwrap_or(DEFAULT_NODE_TIMEOUT_SECS))
    }
    pub fn max_nodes(&self) -> usize {
        self.max_nodes.unwrap_or(DEFAULT_MAX_NODES)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub dial_timeout_secs: Option<u64>,
    pub keep_alive: Option<bool>,
    pub max_message_size: Option<usize>,
    pub insecure: Option<bool>,
    pub compression: Option<bool>,
}

impl ConnectionConfig {
    pub fn dial_timeout(&self) -> time::Duration {
        time::Duration::from_secs(self.dial_timeout_secs.unwrap_or(DEFAULT_DIAL_TIMEOUT_SECS))
    }
    pub fn keep_alive(&self) -> bool {
        self.keep_alive.unwrap_or(true)
    }
    pub fn max_message_size(&self) -> usize {
        self.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE)
    }
    pub fn insecure(&self) -> bool {
        self.insecure.unwrap_or(true)
    }
    pub fn compression(&self) -> bool {
        self.compression.unwrap_or(false)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LoadBalancerConfig {
    pub strategy: Option<String>,
    pub cache_enabled: Option<bool>,
    pub cache_ttl_secs: Option<u64>,
    pub default_timeout_secs: Option<u64>,
    pub health_check: Option<bool>,
    pub check_interval_secs: Option<u64>,
}

impl LoadBalancerConfig {
    pub fn strategy(&self) -> String {
        self.strategy.clone().unwrap_or_else(|| DEFAULT_STRATEGY.into())
    }
    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled.unwrap_or(true)
    }
    pub fn cache_ttl(&self) -> time::Duration {
        time::Duration::from_secs(self.cache_ttl_secs.unwrap_or(DEFAULT_CACHE_TTL_SECS))
    }
    pub fn default_timeout(&self) -> time::Duration {
        time::Duration::from_secs(self.default_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }
    pub fn health_check(&self) -> bool {
        self.health_check.unwrap_or(true)
    }
    pub fn check_interval(&self) -> time::Duration {
        time::Duration::from_secs(self.check_interval_secs.unwrap_or(DEFAULT_CHECK_INTERVAL_SECS))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ChunkConfig {
    pub enable_auto: Option<bool>,
    pub threshold: Option<usize>,
    pub max_chunk_bytes: Option<usize>,
}

impl ChunkConfig {
    pub fn new(enable_auto: bool, threshold: usize, max_chunk_bytes: usize) -> ChunkConfig {
        ChunkConfig {
            enable_auto: Some(enable_auto),
            threshold: Some(threshold),
            max_chunk_bytes: Some(max_chunk_bytes),
        }
    }

    pub fn enable_auto(&self) -> bool {
        self.enable_auto.unwrap_or(true)
    }
    pub fn threshold(&self) -> usize {
        self.threshold.unwrap_or(DEFAULT_CHUNK_THRESHOLD)
    }
    pub fn max_chunk_bytes(&self) -> usize {
        self.max_chunk_bytes.unwrap_or(DEFAULT_MAX_CHUNK_BYTES)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PoolConfig {
    pub max_connections: Option<usize>,
    pub max_idle_secs: Option<u64>,
    pub max_lifetime_secs: Option<u64>,
    pub connection_ttl_secs: Option<u64>,
    pub health_check: Option<bool>,
    pub health_interval_secs: Option<u64>,
}

impl PoolConfig {
    pub fn max_connections(&self) -> usize {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }
    pub fn max_idle(&self) -> time::Duration {
        time::Duration::from_secs(self.max_idle_secs.unwrap_or(DEFAULT_MAX_IDLE_SECS))
    }
    pub fn max_lifetime(&self) -> time::Duration {
        time::Duration::from_secs(self.max_lifetime_secs.unwrap_or(DEFAULT_MAX_LIFETIME_SECS))
    }

    /// Bound on establishing one connection.
    pub fn connection_ttl(&self) -> time::Duration {
        time::Duration::from_secs(self.connection_ttl_secs.unwrap_or(DEFAULT_DIAL_TIMEOUT_SECS))
    }

    pub fn health_check(&self) -> bool {
        self.health_check.unwrap_or(true)
    }
    pub fn health_interval(&self) -> time::Duration {
        time::Duration::from_secs(self.health_interval_secs.unwrap_or(DEFAULT_HEALTH_INTERVAL_SECS))
    }
}

#[test]
fn parse_simple_yaml() {
    let yaml = "
discovery:
  serviceType: _lumen._tcp
  scanIntervalSecs: 5
  maxNodes: 8
loadBalancer:
  strategy: least_conn
  cacheEnabled: false
chunk:
  enableAuto: true
  threshold: 1024
  maxChunkBytes: 256
";
    let cfg = from_str(yaml).unwrap();
    assert_eq!(cfg.discovery().scan_interval(), time::Duration::from_secs(5));
    assert_eq!(cfg.discovery().max_nodes(), 8);
    assert_eq!(cfg.load_balancer().strategy(), "least_conn");
    assert!(!cfg.load_balancer().cache_enabled());
    assert_eq!(cfg.chunk().max_chunk_bytes(), 256);
    // The pool section is derived from connection defaults when absent.
    assert_eq!(cfg.pool().connection_ttl(), time::Duration::from_secs(10));
}

#[test]
fn parse_simple_json() {
    let json = r#"{"connection": {"dialTimeoutSecs": 3, "insecure": true}}"#;
    let cfg = from_str(json).unwrap();
    assert_eq!(cfg.connection().dial_timeout(), time::Duration::from_secs(3));
    assert!(cfg.connection().insecure());
    assert!(cfg.discovery().enabled());
}
