//! Process-wide runtime configuration.
//!
//! The configuration is a YAML document whose keys mirror the dotted names the runtime looks
//! up (`fiber.stack_size`, `tcp.connect.timeout`, ...). Every field has a default, so an empty
//! document is valid. The active configuration is a shared snapshot: readers take an
//! [`Arc<Config>`] and replacements are published atomically to later readers.

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Duration;

use log::info;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Smallest stack a fiber may be configured with.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

const DEFAULT_STACK_SIZE: usize = 1024 * 1024;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_MAX_WAIT_MS: u64 = 3000;
const DEFAULT_SERVER_READ_TIMEOUT_MS: u64 = 2 * 60 * 1000;
const MAX_DEFAULT_THREADS: usize = 10;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub fiber: FiberConfig,
    pub tcp: TcpConfig,
    pub tcp_server: TcpServerConfig,
    pub scheduler: SchedulerConfig,
    pub reactor: ReactorConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FiberConfig {
    /// Stack size in bytes for fibers created without an explicit size.
    pub stack_size: usize,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TcpConfig {
    pub connect: ConnectConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectConfig {
    /// Default connect timeout in milliseconds used by the hooked `connect`.
    pub timeout: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TcpServerConfig {
    /// Receive timeout in milliseconds put on every accepted connection, `0` for none.
    pub read_timeout: u64,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_SERVER_READ_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub threads: usize,
    pub use_caller: bool,
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_DEFAULT_THREADS);
        Self {
            threads,
            use_caller: false,
            name: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReactorConfig {
    /// Upper bound in milliseconds of a single reactor wait.
    pub max_wait: u64,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_MAX_WAIT_MS,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address of the Prometheus exporter, disabled when absent.
    pub listen: Option<SocketAddr>,
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = if yaml.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp.connect.timeout)
    }

    /// Receive timeout for connections accepted by a [`TcpServer`](crate::net::TcpServer).
    pub fn server_read_timeout(&self) -> Option<Duration> {
        let ms = self.tcp_server.read_timeout;
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.reactor.max_wait)
    }

    fn validate(&self) -> Result<()> {
        if self.fiber.stack_size < MIN_STACK_SIZE {
            return Err(Error::Config(format!(
                "fiber.stack_size must be at least {MIN_STACK_SIZE} bytes, got {}",
                self.fiber.stack_size
            )));
        }
        if self.scheduler.threads == 0 {
            return Err(Error::Config("scheduler.threads must be positive".into()));
        }
        if self.reactor.max_wait == 0 {
            return Err(Error::Config("reactor.max_wait must be positive".into()));
        }
        Ok(())
    }
}

type Listener = Box<dyn Fn(&Config, &Config) + Send + Sync>;

static CURRENT: LazyLock<RwLock<Arc<Config>>> =
    LazyLock::new(|| RwLock::new(Arc::new(Config::default())));
static LISTENERS: Mutex<Vec<Listener>> = Mutex::new(Vec::new());

/// Returns the active configuration.
pub fn get() -> Arc<Config> {
    CURRENT.read().clone()
}

/// Validates and installs `config`, notifying change listeners with the old and new values.
pub fn set(config: Config) -> Result<()> {
    config.validate()?;
    let new = Arc::new(config);
    let old = std::mem::replace(&mut *CURRENT.write(), new.clone());
    if *old != *new {
        for listener in LISTENERS.lock().iter() {
            listener(&old, &new);
        }
    }
    Ok(())
}

/// Registers a callback invoked whenever [`set`] replaces the configuration with a different one.
pub fn on_change<F>(listener: F)
where
    F: Fn(&Config, &Config) + Send + Sync + 'static,
{
    LISTENERS.lock().push(Box::new(listener));
}

pub fn load_str(yaml: &str) -> Result<()> {
    set(Config::from_yaml(yaml)?)
}

pub fn load_file(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    load_str(&text)?;
    info!("loaded configuration from {}", path.display());
    Ok(())
}

/// Overrides the active configuration from `STRAND_*` environment variables.
pub fn apply_env() -> Result<()> {
    let mut config = (*get()).clone();
    if let Some(v) = env_number("STRAND_FIBER_STACK_SIZE")? {
        config.fiber.stack_size = v as usize;
    }
    if let Some(v) = env_number("STRAND_CONNECT_TIMEOUT_MS")? {
        config.tcp.connect.timeout = v;
    }
    if let Some(v) = env_number("STRAND_SERVER_READ_TIMEOUT_MS")? {
        config.tcp_server.read_timeout = v;
    }
    if let Some(v) = env_number("STRAND_THREADS")? {
        config.scheduler.threads = v as usize;
    }
    set(config)
}

fn env_number(key: &str) -> Result<Option<u64>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key}: expected an integer, got {raw:?}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_yaml("").unwrap();
        assert_eq!(config.fiber.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(config.connect_timeout(), Duration::from_millis(5000));
        assert_eq!(config.max_wait(), Duration::from_millis(3000));
        assert!(config.metrics.listen.is_none());
        assert!(config.scheduler.threads >= 1);
        assert_eq!(config.server_read_timeout(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn nested_keys_are_read() {
        let yaml = "
fiber:
  stack_size: 65536
tcp:
  connect:
    timeout: 250
tcp_server:
  read_timeout: 0
scheduler:
  threads: 3
  use_caller: true
  name: io
metrics:
  listen: 127.0.0.1:9100
";
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.fiber.stack_size, 65536);
        assert_eq!(config.tcp.connect.timeout, 250);
        assert_eq!(config.server_read_timeout(), None);
        assert_eq!(config.scheduler.threads, 3);
        assert!(config.scheduler.use_caller);
        assert_eq!(config.scheduler.name, "io");
        assert_eq!(config.metrics.listen, Some("127.0.0.1:9100".parse().unwrap()));
    }

    #[test]
    fn rejects_tiny_stacks() {
        let err = Config::from_yaml("fiber:\n  stack_size: 1024\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_malformed_yaml() {
        let err = Config::from_yaml("fiber: [").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn loads_from_file_and_notifies_listeners() {
        use std::io::Write;
        use std::sync::atomic::{AtomicU64, Ordering};

        static SEEN: AtomicU64 = AtomicU64::new(0);
        on_change(|old, new| {
            if old.reactor.max_wait != new.reactor.max_wait {
                SEEN.store(new.reactor.max_wait, Ordering::SeqCst);
            }
        });

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "reactor:\n  max_wait: 1500").unwrap();
        load_file(file.path()).unwrap();
        assert_eq!(get().max_wait(), Duration::from_millis(1500));
        assert_eq!(SEEN.load(Ordering::SeqCst), 1500);

        set(Config::default()).unwrap();
        assert_eq!(SEEN.load(Ordering::SeqCst), DEFAULT_MAX_WAIT_MS);
    }

    #[test]
    fn invalid_replacement_keeps_the_active_config() {
        let before = get();
        assert!(load_str("scheduler:\n  threads: 0\n").is_err());
        assert_eq!(get().scheduler.threads, before.scheduler.threads);
    }
}
