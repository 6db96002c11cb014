//! Configuration management

use crate::crypto::{CipherKey, KeyPair};
use crate::protocol::{CONNECT_TIMEOUT, KEEPALIVE_INTERVAL};
use crate::tunnel::CarrierOptions;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Carrier link keys
    pub keys: KeysConfig,
    /// Carrier behavior
    #[serde(default)]
    pub carrier: CarrierConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: None,
            client: None,
            keys: KeysConfig::default(),
            carrier: CarrierConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Carrier listen address
    pub listen: String,
    /// Forwarded listeners, e.g. "tcp:8850:localhost:22"
    #[serde(default)]
    pub tunnels: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8848".to_string(),
            tunnels: Vec::new(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Carrier server address
    pub server: String,
    /// Forwarded listeners, e.g. "tcp:8851:localhost:80"
    #[serde(default)]
    pub tunnels: Vec<String>,
    /// Seconds to wait before reconnecting a lost carrier
    pub reconnect_delay_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:8848".to_string(),
            tunnels: Vec::new(),
            reconnect_delay_secs: 5,
        }
    }
}

/// Carrier link keys, base64-encoded 16-byte AES keys, one per direction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysConfig {
    /// Key for bytes the server sends
    pub server_to_client: String,
    /// Key for bytes the client sends
    pub client_to_server: String,
}

impl KeysConfig {
    /// Decode into usable key material
    pub fn key_pair(&self) -> Result<KeyPair, crate::Error> {
        Ok(KeyPair {
            client_to_server: CipherKey::from_base64(&self.client_to_server)?,
            server_to_client: CipherKey::from_base64(&self.server_to_client)?,
        })
    }

    /// Encode a pair for storage
    pub fn from_pair(pair: &KeyPair) -> Self {
        Self {
            server_to_client: pair.server_to_client.to_base64(),
            client_to_server: pair.client_to_server.to_base64(),
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            server_to_client: String::new(),
            client_to_server: String::new(),
        }
    }
}

/// Carrier behavior knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierConfig {
    /// Keepalive probe interval in seconds (0 disables probes)
    pub keepalive_secs: u64,
    /// Pad outgoing bursts to a multiple of this many bytes
    pub pad_to: Option<usize>,
    /// Timeout in seconds for connects made on behalf of the peer
    pub connect_timeout_secs: u64,
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: KEEPALIVE_INTERVAL,
            pad_to: None,
            connect_timeout_secs: CONNECT_TIMEOUT,
        }
    }
}

impl CarrierConfig {
    /// Translate into carrier options
    pub fn carrier_options(&self) -> CarrierOptions {
        CarrierOptions {
            keepalive: match self.keepalive_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            pad_to: self.pad_to,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// One forwarded listener: accept TCP locally, relay each connection to a
/// target behind the peer. Written `tcp:listenport:connaddr:connport` in
/// configuration files and on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl FromStr for TunnelSpec {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            ["tcp", listen, host, port] => {
                let listen_port = listen.parse().map_err(|_| bad_spec(s, "bad listen port"))?;
                let target_port = port.parse().map_err(|_| bad_spec(s, "bad target port"))?;
                if host.is_empty() {
                    return Err(bad_spec(s, "empty target host"));
                }
                Ok(Self {
                    listen_port,
                    target_host: (*host).to_string(),
                    target_port,
                })
            }
            ["socks", ..] => Err(bad_spec(s, "socks tunnels are not supported yet")),
            _ => Err(bad_spec(s, "expected tcp:listenport:connaddr:connport")),
        }
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tcp:{}:{}:{}",
            self.listen_port, self.target_host, self.target_port
        )
    }
}

fn bad_spec(spec: &str, why: &str) -> crate::Error {
    crate::Error::Config(format!("invalid tunnel spec {spec:?}: {why}"))
}

/// Parse a list of tunnel specs, failing on the first bad one
pub fn parse_tunnel_specs(specs: &[String]) -> Result<Vec<TunnelSpec>, crate::Error> {
    specs.iter().map(|s| s.parse()).collect()
}

/// Generate example configuration with freshly generated keys
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig::default()),
        keys: KeysConfig::from_pair(&KeyPair::generate()),
        carrier: CarrierConfig::default(),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_spec_parsing() {
        let spec: TunnelSpec = "tcp:8850:localhost:22".parse().unwrap();
        assert_eq!(spec.listen_port, 8850);
        assert_eq!(spec.target_host, "localhost");
        assert_eq!(spec.target_port, 22);
        assert_eq!(spec.to_string(), "tcp:8850:localhost:22");

        let spec: TunnelSpec = "tcp:80:10.0.0.1:8080".parse().unwrap();
        assert_eq!(spec.target_host, "10.0.0.1");
    }

    #[test]
    fn test_tunnel_spec_rejects_socks() {
        let err = "socks:8849".parse::<TunnelSpec>().unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn test_tunnel_spec_rejects_garbage() {
        assert!("udp:1:host:2".parse::<TunnelSpec>().is_err());
        assert!("tcp:notaport:host:22".parse::<TunnelSpec>().is_err());
        assert!("tcp:8850:host".parse::<TunnelSpec>().is_err());
        assert!("tcp:8850::22".parse::<TunnelSpec>().is_err());
        assert!("".parse::<TunnelSpec>().is_err());
    }

    #[test]
    fn test_parse_tunnel_specs_fails_on_first_bad() {
        let specs = vec!["tcp:1:a:2".to_string(), "bogus".to_string()];
        assert!(parse_tunnel_specs(&specs).is_err());

        let specs = vec!["tcp:1:a:2".to_string(), "tcp:3:b:4".to_string()];
        assert_eq!(parse_tunnel_specs(&specs).unwrap().len(), 2);
    }

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wiremux.toml");

        let config = generate_example_config();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(
            loaded.server.as_ref().unwrap().listen,
            config.server.as_ref().unwrap().listen
        );
        assert_eq!(loaded.keys.server_to_client, config.keys.server_to_client);
        assert_eq!(loaded.carrier.keepalive_secs, KEEPALIVE_INTERVAL);
        assert_eq!(loaded.logging.level, "info");

        // generated keys must decode
        let pair = loaded.keys.key_pair().unwrap();
        assert_ne!(pair.client_to_server, pair.server_to_client);
    }

    #[test]
    fn test_bad_keys_rejected() {
        let keys = KeysConfig {
            server_to_client: "short".to_string(),
            client_to_server: String::new(),
        };
        assert!(keys.key_pair().is_err());
    }

    #[test]
    fn test_carrier_options_mapping() {
        let mut cfg = CarrierConfig::default();
        let options = cfg.carrier_options();
        assert_eq!(options.keepalive, Some(Duration::from_secs(30)));
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.pad_to, None);

        cfg.keepalive_secs = 0;
        cfg.pad_to = Some(512);
        let options = cfg.carrier_options();
        assert_eq!(options.keepalive, None);
        assert_eq!(options.pad_to, Some(512));
    }
}
