use std::fmt;
use std::time::Duration;

use tracing::trace;

/// Check definition for a monitored target
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(tag = "check", rename_all = "lowercase")]
pub enum CheckConfig {
    /// HTTP/HTTPS endpoint probe
    Http {
        url: String,

        #[serde(default)]
        method: HttpMethod,

        /// Accepted status codes (any 2xx if not specified)
        expected_status: Option<Vec<u16>>,

        /// Regex the response body must match
        body_pattern: Option<String>,
    },

    /// Plain TCP connect probe
    Tcp {
        /// "host:port"
        addr: String,
    },
}

impl CheckConfig {
    /// Discriminant used to decide whether a replaced definition keeps its
    /// recovery history (same kind) or resets it (kind changed).
    pub fn kind(&self) -> CheckKind {
        match self {
            CheckConfig::Http { .. } => CheckKind::Http,
            CheckConfig::Tcp { .. } => CheckKind::Tcp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Http,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Head,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct TargetConfig {
    pub id: String,

    #[serde(flatten)]
    pub check: CheckConfig,

    /// Nominal check interval in seconds
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Hard per-check timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Transport route override (default transport if unset)
    pub transport: Option<String>,

    /// Destination topic/queue override
    pub destination: Option<String>,
}

impl TargetConfig {
    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Reject malformed definitions before they ever reach the scheduler.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::InvalidTarget("target id must not be empty".into()));
        }

        if self.interval == 0 {
            return Err(ConfigError::InvalidTarget(format!(
                "target '{}': interval must be positive",
                self.id
            )));
        }

        if self.timeout == 0 {
            return Err(ConfigError::InvalidTarget(format!(
                "target '{}': timeout must be positive",
                self.id
            )));
        }

        match &self.check {
            CheckConfig::Http { url, body_pattern, .. } => {
                if reqwest::Url::parse(url).is_err() {
                    return Err(ConfigError::InvalidTarget(format!(
                        "target '{}': invalid url '{}'",
                        self.id, url
                    )));
                }

                if let Some(pattern) = body_pattern
                    && regex::Regex::new(pattern).is_err()
                {
                    return Err(ConfigError::InvalidTarget(format!(
                        "target '{}': invalid body pattern '{}'",
                        self.id, pattern
                    )));
                }
            }
            CheckConfig::Tcp { addr } => {
                let valid = match addr.rsplit_once(':') {
                    Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
                    None => false,
                };
                if !valid {
                    return Err(ConfigError::InvalidTarget(format!(
                        "target '{}': invalid address '{}'",
                        self.id, addr
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Broker connection definition, one per configured transport
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum TransportConfig {
    Mqtt {
        name: String,
        host: String,
        port: u16,

        #[serde(default = "default_client_id")]
        client_id: String,

        username: Option<String>,
        password: Option<String>,

        #[serde(default = "default_keep_alive")]
        keep_alive_secs: u16,
    },

    Stomp {
        name: String,
        host: String,
        port: u16,

        login: Option<String>,
        passcode: Option<String>,

        /// `host` header of the CONNECT frame (broker vhost)
        virtual_host: Option<String>,
    },
}

impl TransportConfig {
    pub fn name(&self) -> &str {
        match self {
            TransportConfig::Mqtt { name, .. } => name,
            TransportConfig::Stomp { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SchedulerConfig {
    /// Global cap on simultaneously running checks
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_checks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_checks: default_max_concurrent(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RecoveryConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    #[serde(default = "default_max_cooldown")]
    pub max_cooldown_secs: u64,

    /// Upper bound on the backoff-adjusted check interval
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

impl RecoveryConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_secs(self.max_cooldown_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown(),
            max_cooldown_secs: default_max_cooldown(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct DispatchConfig {
    /// Publish attempts per envelope before it is dropped
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,

    /// Per-attempt publish timeout in seconds
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,
}

impl DispatchConfig {
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn max_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.max_retry_backoff_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
            publish_timeout_secs: default_publish_timeout(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PoolConfig {
    /// Maximum live connections per transport
    #[serde(default = "default_pool_max")]
    pub max_connections: usize,

    /// Idle connections kept around below this count are never evicted
    #[serde(default = "default_pool_min_idle")]
    pub min_idle: usize,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_borrow_timeout")]
    pub borrow_timeout_secs: u64,
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn borrow_timeout(&self) -> Duration {
        Duration::from_secs(self.borrow_timeout_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_pool_max(),
            min_idle: default_pool_min_idle(),
            idle_timeout_secs: default_idle_timeout(),
            borrow_timeout_secs: default_borrow_timeout(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub targets: Option<Vec<TargetConfig>>,

    pub transports: Vec<TransportConfig>,

    /// Transport used for targets without a route override
    pub default_transport: Option<String>,

    /// Destination for targets without an override
    #[serde(default = "default_destination")]
    pub destination: String,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub pool: PoolConfig,
}

impl Config {
    /// Name of the transport targets fall back to.
    pub fn fallback_transport(&self) -> Option<&str> {
        self.default_transport
            .as_deref()
            .or_else(|| self.transports.first().map(|t| t.name()))
    }
}

fn default_interval() -> u64 {
    15
}

fn default_timeout() -> u64 {
    10
}

fn default_client_id() -> String {
    String::from("titan-agent")
}

fn default_keep_alive() -> u16 {
    30
}

fn default_max_concurrent() -> usize {
    32
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown() -> u64 {
    30
}

fn default_max_cooldown() -> u64 {
    480
}

fn default_max_backoff() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_base_ms() -> u64 {
    250
}

fn default_max_retry_backoff_ms() -> u64 {
    8_000
}

fn default_publish_timeout() -> u64 {
    10
}

fn default_pool_max() -> usize {
    4
}

fn default_pool_min_idle() -> usize {
    1
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_borrow_timeout() -> u64 {
    5
}

fn default_destination() -> String {
    String::from("titan/checks")
}

/// Result type alias for configuration handling
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating configuration
#[derive(Debug)]
pub enum ConfigError {
    /// Malformed target definition, rejected at the registry boundary
    InvalidTarget(String),

    /// Transport route references an unknown transport
    UnknownTransport(String),

    /// Config file could not be read or parsed
    Load(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidTarget(msg) => write!(f, "invalid target definition: {}", msg),
            ConfigError::UnknownTransport(name) => {
                write!(f, "target references unknown transport '{}'", name)
            }
            ConfigError::Load(msg) => write!(f, "failed to load configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config: &Config| trace!("loaded config: {config:?}"))
}
