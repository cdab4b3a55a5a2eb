use crate::dispatcher::DEFAULT_REQUEST_TIMEOUT;
use crate::pool::PoolConfig;
use crate::registry::{RouteRegistry, DEFAULT_LOCK_ATTEMPTS, DEFAULT_LOCK_RETRY_DELAY};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the default state directory
pub const STATE_DIR_ENV: &str = "HOSTGATE_STATE_DIR";

/// Name of the optional config file inside the state directory
pub const CONFIG_FILE: &str = "config.toml";

/// Global configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Dispatcher listener settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Route registry settings
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Listening port (default: 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Enable TLS (default: false). If true without cert/key, generates self-signed.
    #[serde(default)]
    pub tls: bool,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time for a backend to send response headers, in seconds (default: 120)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ProxyConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls || self.has_tls_files()
    }

    pub fn has_tls_files(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            tls: false,
            tls_cert: None,
            tls_key: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Directory holding routes.json, the lock marker and the PID file.
    /// A leading `~` is expanded to the home directory.
    #[serde(default = "default_state_dir", deserialize_with = "deserialize_state_dir")]
    pub state_dir: PathBuf,

    /// Lock attempts before add/remove give up (default: 20)
    #[serde(default = "default_lock_max_attempts")]
    pub lock_max_attempts: u32,

    /// Delay between contended lock attempts in milliseconds (default: 50)
    #[serde(default = "default_lock_retry_delay")]
    pub lock_retry_delay_ms: u64,
}

impl RegistryConfig {
    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }

    /// Open the registry these settings describe
    pub fn open(&self) -> RouteRegistry {
        RouteRegistry::new(&self.state_dir)
            .with_lock_retry(self.lock_max_attempts, self.lock_retry_delay())
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            lock_max_attempts: default_lock_max_attempts(),
            lock_retry_delay_ms: default_lock_retry_delay(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per backend
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_secs()
}

fn default_lock_max_attempts() -> u32 {
    DEFAULT_LOCK_ATTEMPTS
}

fn default_lock_retry_delay() -> u64 {
    DEFAULT_LOCK_RETRY_DELAY.as_millis() as u64
}

/// `$HOSTGATE_STATE_DIR`, else `~/.hostgate`
pub fn default_state_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(STATE_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hostgate")
}

fn deserialize_state_dir<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = PathBuf::deserialize(deserializer)?;
    Ok(expand_home(&raw))
}

/// Replace a leading `~` component with the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs_next::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else `<state dir>/config.toml` if it exists, else defaults
    pub fn resolve(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        let implicit = default_state_dir().join(CONFIG_FILE);
        if implicit.is_file() {
            return Self::load(implicit);
        }

        Ok(Self::default())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.proxy.port == 0 {
            errors.push("proxy: 'port' must be greater than 0".to_string());
        }
        if self.proxy.tls_cert.is_some() != self.proxy.tls_key.is_some() {
            errors.push("proxy: 'tls_cert' and 'tls_key' must be set together".to_string());
        }
        if self.proxy.request_timeout_secs == 0 {
            errors.push("proxy: 'request_timeout_secs' must be greater than 0".to_string());
        }
        if self.registry.lock_max_attempts == 0 {
            errors.push("registry: 'lock_max_attempts' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[proxy]
port = 8080
bind = "0.0.0.0"
request_timeout_secs = 10

[registry]
state_dir = "/tmp/hostgate-test"
lock_max_attempts = 100
lock_retry_delay_ms = 5
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.proxy.port, 8080);
        assert_eq!(config.proxy.bind, "0.0.0.0");
        assert_eq!(config.proxy.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.registry.state_dir, PathBuf::from("/tmp/hostgate-test"));
        assert_eq!(config.registry.lock_max_attempts, 100);
        assert_eq!(config.registry.lock_retry_delay(), Duration::from_millis(5));
        config.validate().unwrap();
    }

    #[test]
    fn test_default_proxy_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 80);
        assert_eq!(config.bind, "127.0.0.1");
        assert!(!config.tls_enabled());
        assert_eq!(config.pool_config().max_idle_per_host, 10);
        assert_eq!(config.pool_config().idle_timeout, Duration::from_secs(90));
        assert_eq!(config.request_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_default_registry_config() {
        let config = RegistryConfig::default();
        assert_eq!(config.lock_max_attempts, 20);
        assert_eq!(config.lock_retry_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.proxy.port, 80);
        assert_eq!(config.registry.lock_max_attempts, 20);
    }

    #[test]
    fn test_validation_errors() {
        let config: Config = toml::from_str(
            r#"
[proxy]
port = 0
tls_cert = "cert.pem"

[registry]
lock_max_attempts = 0
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'port' must be greater than 0"));
        assert!(err.contains("'tls_cert' and 'tls_key'"));
        assert!(err.contains("'lock_max_attempts'"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[proxy]\nport = 1355\n").unwrap();

        let config = Config::resolve(Some(&path)).unwrap();
        assert_eq!(config.proxy.port, 1355);
    }

    #[test]
    fn test_state_dir_tilde_is_expanded() {
        let home = dirs_next::home_dir().unwrap();

        let config: Config = toml::from_str("[registry]\nstate_dir = \"~/.hostgate\"\n").unwrap();
        assert_eq!(config.registry.state_dir, home.join(".hostgate"));

        assert_eq!(expand_home(Path::new("~")), home);
        assert_eq!(expand_home(Path::new("/var/lib/hostgate")), PathBuf::from("/var/lib/hostgate"));
        assert_eq!(expand_home(Path::new("~other/dir")), PathBuf::from("~other/dir"));
    }

    #[test]
    fn test_registry_config_opens_registry() {
        let dir = tempfile::tempdir().unwrap();
        let config = RegistryConfig {
            state_dir: dir.path().to_path_buf(),
            ..RegistryConfig::default()
        };

        let registry = config.open();
        assert_eq!(registry.routes_path(), dir.path().join("routes.json"));
        assert_eq!(registry.pid_path(), dir.path().join("proxy.pid"));
    }
}
