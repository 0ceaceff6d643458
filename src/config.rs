use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

const PREFIX: &str = "BOOKD_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: String, value: String },
    #[error("both BOOKD_TLS_CERT and BOOKD_TLS_KEY must be set, or neither")]
    PartialTls,
    #[error("BOOKD_MAX_CONNECTIONS must be at least 1")]
    NoConnections,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Server settings, read from `BOOKD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
    /// JSON document backing the availability feed. Unset means an empty feed.
    pub feed_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "bookd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls: None,
            feed_path: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; `lookup` receives the full variable name.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(&format!("{PREFIX}{key}")).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let tls = match (get("TLS_CERT"), get("TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::PartialTls),
        };

        let config = Self {
            port: parsed(&get, "PORT")?.unwrap_or(defaults.port),
            bind: get("BIND").unwrap_or(defaults.bind),
            data_dir: get("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: get("PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&get, "MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&get, "COMPACT_THRESHOLD")?.unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&get, "METRICS_PORT")?,
            tls,
            feed_path: get("FEED_PATH").map(PathBuf::from),
        };
        if config.max_connections == 0 {
            return Err(ConfigError::NoConnections);
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookd.wal")
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError> {
    match get(key) {
        None => Ok(None),
        Some(value) => value.trim().parse().map(Some).map_err(|_| ConfigError::Invalid {
            var: format!("{PREFIX}{key}"),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.wal_path(), PathBuf::from("./data/bookd.wal"));
    }

    #[test]
    fn overrides_are_read() {
        let config = from_pairs(&[
            ("BOOKD_PORT", "6543"),
            ("BOOKD_BIND", "127.0.0.1"),
            ("BOOKD_DATA_DIR", "/var/lib/bookd"),
            ("BOOKD_MAX_CONNECTIONS", "8"),
            ("BOOKD_COMPACT_THRESHOLD", "50"),
            ("BOOKD_METRICS_PORT", "9090"),
            ("BOOKD_FEED_PATH", "/etc/bookd/feed.json"),
        ])
        .unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:6543");
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/bookd/bookd.wal"));
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.metrics_port, Some(9090));
        assert_eq!(config.feed_path, Some(PathBuf::from("/etc/bookd/feed.json")));
    }

    #[test]
    fn bad_numbers_are_errors() {
        assert_eq!(
            from_pairs(&[("BOOKD_PORT", "fifty")]),
            Err(ConfigError::Invalid {
                var: "BOOKD_PORT".into(),
                value: "fifty".into()
            })
        );
        assert!(from_pairs(&[("BOOKD_PORT", "70000")]).is_err());
        assert_eq!(from_pairs(&[("BOOKD_MAX_CONNECTIONS", "0")]), Err(ConfigError::NoConnections));
    }

    #[test]
    fn tls_needs_both_paths() {
        assert_eq!(from_pairs(&[("BOOKD_TLS_CERT", "cert.pem")]), Err(ConfigError::PartialTls));
        let config = from_pairs(&[("BOOKD_TLS_CERT", "cert.pem"), ("BOOKD_TLS_KEY", "key.pem")]).unwrap();
        assert_eq!(
            config.tls,
            Some(TlsPaths {
                cert: "cert.pem".into(),
                key: "key.pem".into()
            })
        );
    }

    #[test]
    fn empty_values_count_as_unset() {
        let config = from_pairs(&[("BOOKD_METRICS_PORT", ""), ("BOOKD_PASSWORD", "")]).unwrap();
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.password, "bookd");
    }
}
