use crate::error::{LumenError, LumenResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub use crate::syscalls::TrigMode;

/// Who performs socket I/O once the event loop sees readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchModel {
    /// The event loop reads and writes inline; workers only parse and build
    /// responses.
    #[default]
    Inline,
    /// The event loop only hands off; workers do the reads and writes too.
    Deferred,
}

impl FromStr for DispatchModel {
    type Err = LumenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inline" | "a" | "0" | "proactor" => Ok(DispatchModel::Inline),
            "deferred" | "b" | "1" | "reactor" => Ok(DispatchModel::Deferred),
            other => Err(LumenError::Config(format!("unknown dispatch model {:?}", other))),
        }
    }
}

impl FromStr for TrigMode {
    type Err = LumenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "level" | "lt" => Ok(TrigMode::Level),
            "edge" | "et" => Ok(TrigMode::Edge),
            other => Err(LumenError::Config(format!("unknown trigger mode {:?}", other))),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen host (default: 0.0.0.0)
    pub host: String,

    /// Listen port (default: 9006)
    pub port: u16,

    /// Directory static files are served from (default: ./root)
    pub doc_root: PathBuf,

    /// Trigger mode of the listening socket.
    pub listen_trig: TrigMode,

    /// Trigger mode of connection sockets.
    pub conn_trig: TrigMode,

    /// Worker threads (default: 8)
    pub threads: usize,

    /// Work queue capacity (default: 10000)
    pub queue_capacity: usize,

    /// Maximum simultaneously open client connections (default: 4096)
    pub max_connections: usize,

    /// Alarm period in seconds; idle connections are closed after three
    /// periods without traffic (default: 5)
    pub timeslot_secs: u32,

    pub dispatch: DispatchModel,

    /// Page served for a bare `/` (default: judge.html)
    pub default_page: String,

    /// Enable SO_LINGER on the listening socket.
    pub linger: bool,

    /// Credential store handles (default: 8)
    pub store_pool_size: usize,

    /// Optional `name:password` file backing the credential store.
    pub users_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9006,
            doc_root: PathBuf::from("./root"),
            listen_trig: TrigMode::Level,
            conn_trig: TrigMode::Level,
            threads: 8,
            queue_capacity: 10_000,
            max_connections: 4096,
            timeslot_secs: 5,
            dispatch: DispatchModel::Inline,
            default_page: "judge.html".to_string(),
            linger: false,
            store_pool_size: 8,
            users_file: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from `LUMEN_*` environment variables (with .env
    /// support). Unset variables keep their defaults; malformed ones are an
    /// error.
    pub fn from_env() -> LumenResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> LumenResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("LUMEN_HOST") {
            config.host = v;
        }
        if let Some(v) = get("LUMEN_PORT") {
            config.port = parse_var("LUMEN_PORT", &v)?;
        }
        if let Some(v) = get("LUMEN_DOC_ROOT") {
            config.doc_root = PathBuf::from(v);
        }
        if let Some(v) = get("LUMEN_TRIG_MODE") {
            config.set_trig_combo(parse_var("LUMEN_TRIG_MODE", &v)?)?;
        }
        if let Some(v) = get("LUMEN_LISTEN_TRIG") {
            config.listen_trig = v.parse()?;
        }
        if let Some(v) = get("LUMEN_CONN_TRIG") {
            config.conn_trig = v.parse()?;
        }
        if let Some(v) = get("LUMEN_THREADS") {
            config.threads = parse_var("LUMEN_THREADS", &v)?;
        }
        if let Some(v) = get("LUMEN_QUEUE_CAPACITY") {
            config.queue_capacity = parse_var("LUMEN_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = get("LUMEN_MAX_CONNECTIONS") {
            config.max_connections = parse_var("LUMEN_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = get("LUMEN_TIMESLOT") {
            config.timeslot_secs = parse_var("LUMEN_TIMESLOT", &v)?;
        }
        if let Some(v) = get("LUMEN_DISPATCH") {
            config.dispatch = v.parse()?;
        }
        if let Some(v) = get("LUMEN_DEFAULT_PAGE") {
            config.default_page = v;
        }
        if let Some(v) = get("LUMEN_LINGER") {
            config.linger = matches!(v.to_lowercase().as_str(), "true" | "1" | "yes");
        }
        if let Some(v) = get("LUMEN_STORE_POOL") {
            config.store_pool_size = parse_var("LUMEN_STORE_POOL", &v)?;
        }
        if let Some(v) = get("LUMEN_USERS_FILE") {
            config.users_file = Some(PathBuf::from(v));
        }
        Ok(config)
    }

    /// Apply the combined listen/connection selector:
    /// 0 = LT+LT, 1 = LT+ET, 2 = ET+LT, 3 = ET+ET.
    pub fn set_trig_combo(&mut self, mode: u8) -> LumenResult<()> {
        let (listen, conn) = match mode {
            0 => (TrigMode::Level, TrigMode::Level),
            1 => (TrigMode::Level, TrigMode::Edge),
            2 => (TrigMode::Edge, TrigMode::Level),
            3 => (TrigMode::Edge, TrigMode::Edge),
            other => {
                return Err(LumenError::Config(format!(
                    "trigger mode must be 0..=3, got {}",
                    other
                )));
            }
        };
        self.listen_trig = listen;
        self.conn_trig = conn;
        Ok(())
    }

    pub fn validate(&self) -> LumenResult<()> {
        if self.threads == 0 {
            return Err(LumenError::Config("threads must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(LumenError::Config("queue capacity must be positive".into()));
        }
        if self.max_connections == 0 {
            return Err(LumenError::Config("max connections must be positive".into()));
        }
        if self.timeslot_secs == 0 {
            return Err(LumenError::Config("timeslot must be positive".into()));
        }
        if self.store_pool_size == 0 {
            return Err(LumenError::Config("store pool size must be positive".into()));
        }
        if !self.doc_root.is_dir() {
            return Err(LumenError::Config(format!(
                "document root {} is not a directory",
                self.doc_root.display()
            )));
        }
        Ok(())
    }

    /// Get the full listen address.
    pub fn server_addr(&self) -> LumenResult<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| LumenError::Config(format!("invalid listen address: {}", e)))
    }

    /// Idle deadline granted on accept and after every successful read/write.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(3 * self.timeslot_secs as u64)
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> LumenResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| LumenError::Config(format!("{}={:?}: {}", key, value, e)))
}
