use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read once at start from `GATEHOUSE_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
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
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "gatehouse".into(),
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

    /// Unparseable numbers keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let var = |name: &str| lookup(&format!("GATEHOUSE_{name}"));
        fn num<T: FromStr>(raw: Option<String>) -> Option<T> {
            raw.and_then(|s| s.trim().parse().ok())
        }
        Self {
            port: num(var("PORT")).unwrap_or(d.port),
            bind: var("BIND").unwrap_or(d.bind),
            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: var("PASSWORD").unwrap_or(d.password),
            max_connections: num(var("MAX_CONNECTIONS")).unwrap_or(d.max_connections),
            compact_threshold: num(var("COMPACT_THRESHOLD")).unwrap_or(d.compact_threshold),
            metrics_port: num(var("METRICS_PORT")),
            tls_cert: var("TLS_CERT"),
            tls_key: var("TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("gatehouse.wal")
    }
}
