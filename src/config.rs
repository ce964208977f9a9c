//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command-line flags** — `-address`, `-port`, `-name`, `--work-dir`
//! 2. **Environment variables** — `DEPLOY_AGENT_ADDRESS`, `DEPLOY_AGENT_PORT`,
//!    `DEPLOY_AGENT_NAME`, `DEPLOY_AGENT_WORK_DIR`
//! 3. **Config file** — path via `--config <path>`, or `deploy-agent.toml` in CWD
//! 4. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! address = "localhost"
//! port = 2667
//!
//! [client]
//! name = "unnamed"
//!
//! [deploy]
//! work_dir = "appDir"
//! app_name = "UnityDeployApplication"
//! clear_retry_ms = 1000
//!
//! [backoff]
//! initial_ms = 250
//! max_ms = 16000
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Config file looked up in the current directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "deploy-agent.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the orchestrator lives.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host name or IP of the orchestrator (default `localhost`).
    #[serde(default = "default_address")]
    pub address: String,
    /// TCP port of the orchestrator (default 2667). Kept wider than `u16` so
    /// out-of-range values are reported instead of failing deserialization.
    #[serde(default = "default_port")]
    pub port: i64,
}

/// Identity announced to the orchestrator.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Name sent in the `name` line. Must not contain spaces or newlines.
    #[serde(default = "default_name")]
    pub name: String,
}

/// Local layout of the deployed application.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployConfig {
    /// Root for every provisioned file and the executable (default `appDir`).
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Base name of the deployed executable, without platform suffix
    /// (default `UnityDeployApplication`).
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Delay between attempts to delete a locked working directory (default 1000).
    #[serde(default = "default_clear_retry_ms")]
    pub clear_retry_ms: u64,
}

/// Reconnect backoff bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    /// Backoff after a successful connection (default 250).
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,
    /// Upper bound of the doubling (default 16000).
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Overrides collected from the command line. `None` leaves the lower layers alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub address: Option<String>,
    pub port: Option<i64>,
    pub name: Option<String>,
    pub work_dir: Option<PathBuf>,
}

/// Errors that stop the agent before it ever connects.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
    #[error("Invalid port number {0}")]
    InvalidPort(i64),
    #[error("client name must not contain a space")]
    NameContainsSpace,
    #[error("client name must not contain a newline")]
    NameContainsNewline,
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("backoff.initial_ms must be positive and not above backoff.max_ms")]
    InvalidBackoff,
}

fn default_address() -> String {
    "localhost".to_string()
}
fn default_port() -> i64 {
    2667
}
fn default_name() -> String {
    "unnamed".to_string()
}
fn default_work_dir() -> PathBuf {
    PathBuf::from("appDir")
}
fn default_app_name() -> String {
    "UnityDeployApplication".to_string()
}
fn default_clear_retry_ms() -> u64 {
    1000
}
fn default_backoff_initial_ms() -> u64 {
    250
}
fn default_backoff_max_ms() -> u64 {
    16_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
        }
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            app_name: default_app_name(),
            clear_retry_ms: default_clear_retry_ms(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl BackoffConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

impl DeployConfig {
    pub fn clear_retry(&self) -> Duration {
        Duration::from_millis(self.clear_retry_ms)
    }
}

impl Config {
    /// Load configuration with the full precedence chain and validate it.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `deploy-agent.toml`
    /// in the current directory is used when present, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        config.apply_env(|var| std::env::var(var).ok())?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file. Missing sections fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides through `lookup` (a seam for tests).
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(address) = lookup("DEPLOY_AGENT_ADDRESS") {
            self.server.address = address;
        }
        if let Some(port) = lookup("DEPLOY_AGENT_PORT") {
            self.server.port = port.trim().parse().map_err(|_| ConfigError::Env {
                var: "DEPLOY_AGENT_PORT",
                value: port,
            })?;
        }
        if let Some(name) = lookup("DEPLOY_AGENT_NAME") {
            self.client.name = name;
        }
        if let Some(dir) = lookup("DEPLOY_AGENT_WORK_DIR") {
            self.deploy.work_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(ref address) = overrides.address {
            self.server.address.clone_from(address);
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(ref name) = overrides.name {
            self.client.name.clone_from(name);
        }
        if let Some(ref dir) = overrides.work_dir {
            self.deploy.work_dir.clone_from(dir);
        }
    }

    /// Reject settings the line protocol or the connector cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port <= 0 || self.server.port > 65535 {
            return Err(ConfigError::InvalidPort(self.server.port));
        }
        validate_name(&self.client.name)?;
        if self.server.address.is_empty() {
            return Err(ConfigError::Empty("server.address"));
        }
        if self.deploy.work_dir.as_os_str().is_empty() {
            return Err(ConfigError::Empty("deploy.work_dir"));
        }
        if self.deploy.app_name.is_empty() {
            return Err(ConfigError::Empty("deploy.app_name"));
        }
        if self.backoff.initial_ms == 0 || self.backoff.initial_ms > self.backoff.max_ms {
            return Err(ConfigError::InvalidBackoff);
        }
        Ok(())
    }

    /// Validated port. Only meaningful after [`Config::validate`] succeeded.
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub fn port(&self) -> u16 {
        self.server.port.clamp(1, 65535) as u16
    }
}

/// The name travels as a single protocol token.
pub fn validate_name(name: &str) -> Result<(), ConfigError> {
    if name.contains('\n') || name.contains('\r') {
        return Err(ConfigError::NameContainsNewline);
    }
    if name.contains(' ') {
        return Err(ConfigError::NameContainsSpace);
    }
    Ok(())
}
