use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server settings, read from `CLASSROOMD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "classroomd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(30),
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

    /// Unset or unparseable numeric values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            port: parsed(&lookup, "CLASSROOMD_PORT").unwrap_or(d.port),
            bind: lookup("CLASSROOMD_BIND").unwrap_or(d.bind),
            data_dir: lookup("CLASSROOMD_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("CLASSROOMD_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&lookup, "CLASSROOMD_MAX_CONNECTIONS")
                .filter(|&n: &usize| n > 0)
                .unwrap_or(d.max_connections),
            compact_threshold: parsed(&lookup, "CLASSROOMD_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            sweep_interval: parsed(&lookup, "CLASSROOMD_SWEEP_INTERVAL_SECS")
                .filter(|&s: &u64| s > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.sweep_interval),
            metrics_port: parsed(&lookup, "CLASSROOMD_METRICS_PORT"),
            tls_cert: lookup("CLASSROOMD_TLS_CERT"),
            tls_key: lookup("CLASSROOMD_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = lookup(key)?;
    let parsed = value.trim().parse().ok();
    if parsed.is_none() {
        tracing::warn!("ignoring {key}={value:?}: not a valid number");
    }
    parsed
}
