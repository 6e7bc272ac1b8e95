use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read once from `FREQD_*` environment variables at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "freqd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Numbers that fail to parse keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind: lookup("FREQD_BIND").unwrap_or(defaults.bind),
            port: parsed(&lookup, "FREQD_PORT").unwrap_or(defaults.port),
            data_dir: lookup("FREQD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("FREQD_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "FREQD_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "FREQD_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "FREQD_METRICS_PORT"),
            tls_cert: lookup("FREQD_TLS_CERT"),
            tls_key: lookup("FREQD_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[]));
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert!(config.metrics_port.is_none());
    }

    #[test]
    fn reads_every_variable() {
        let config = Config::from_lookup(lookup(&[
            ("FREQD_BIND", "127.0.0.1"),
            ("FREQD_PORT", "6000"),
            ("FREQD_DATA_DIR", "/var/lib/freqd"),
            ("FREQD_PASSWORD", "secret"),
            ("FREQD_MAX_CONNECTIONS", "8"),
            ("FREQD_COMPACT_THRESHOLD", "50"),
            ("FREQD_METRICS_PORT", "9100"),
            ("FREQD_TLS_CERT", "cert.pem"),
            ("FREQD_TLS_KEY", "key.pem"),
        ]));
        assert_eq!(config.listen_addr(), "127.0.0.1:6000");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/freqd"));
        assert_eq!(config.password, "secret");
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.tls_cert.as_deref(), Some("cert.pem"));
        assert_eq!(config.tls_key.as_deref(), Some("key.pem"));
    }

    #[test]
    fn bad_numbers_keep_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("FREQD_PORT", "not-a-port"),
            ("FREQD_MAX_CONNECTIONS", "-1"),
            ("FREQD_METRICS_PORT", "99999"),
        ]));
        assert_eq!(config.port, 5433);
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.metrics_port, None);
    }

    #[test]
    fn each_number_parses_as_its_own_type() {
        let config = Config::from_lookup(lookup(&[
            ("FREQD_PORT", "70000"),
            ("FREQD_MAX_CONNECTIONS", "70000"),
            ("FREQD_COMPACT_THRESHOLD", " 5000000000 "),
        ]));
        assert_eq!(config.port, 5433);
        assert_eq!(config.max_connections, 70_000);
        assert_eq!(config.compact_threshold, 5_000_000_000);
    }
}
