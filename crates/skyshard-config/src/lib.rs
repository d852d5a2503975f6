//! Centralized configuration management for skyshard
//!
//! This crate provides a unified configuration system for the czar and worker
//! processes: type-safe, validated configuration with safe defaults and
//! environment variable overrides.
//!
//! Configuration follows a simple hierarchy:
//! 1. Safe defaults (defined as constants)
//! 2. Environment variable overrides
//! 3. Runtime validation

pub mod error;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use validation::Validate;

// =============================================================================
// SAFE DEFAULTS - Work for any environment (dev, staging, prod, test)
// =============================================================================

// Result/metadata database (MySQL; result tables live here)
const DEFAULT_DB_HOST: &str = "localhost";
const DEFAULT_DB_PORT: u16 = 3306;
const DEFAULT_DB_NAME: &str = "skyshard";
const DEFAULT_DB_USER: &str = "skyshard";
const DEFAULT_DB_PASSWORD: &str = "localdev123";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_DB_TIMEOUT_SECONDS: u64 = 30;

// Worker registry service
const DEFAULT_REGISTRY_URL: &str = "http://localhost:25081";
const DEFAULT_REGISTRY_POLL_SECONDS: u64 = 30;

// Czar <-> worker transport
const DEFAULT_WORKER_PORT: u16 = 25002;
const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 15;
const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024; // One frame, not one stream

// Dispatch policy
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_DISPATCH_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_JOB_TIMEOUT_SECONDS: u64 = 3600;
const DEFAULT_QUERY_TIMEOUT_SECONDS: u64 = 86_400;
const DEFAULT_RESULT_TTL_SECONDS: u64 = 86_400;
const DEFAULT_DATABASE_CONTEXT: &str = "LSST";

// Czar status endpoint
const DEFAULT_STATUS_PORT: u16 = 4040;

// Worker scheduler pool. Production deployments run thousands of threads;
// the default suits tests and small installs.
const DEFAULT_POOL_SIZE: usize = 50;
const DEFAULT_INTERACTIVE_MIN_RUNNING: usize = 1;
const DEFAULT_INTERACTIVE_MAX_RUNNING: usize = 16;
const DEFAULT_MAX_BOOTS_PER_USER_QUERY: u32 = 5;

// Per scan-speed class: (priority, min running, max running, active minutes)
const DEFAULT_FAST_CLASS: (i32, usize, usize, u64) = (2, 6, 24, 5);
const DEFAULT_MEDIUM_CLASS: (i32, usize, usize, u64) = (3, 6, 24, 15);
const DEFAULT_SLOW_CLASS: (i32, usize, usize, u64) = (4, 4, 12, 60);
const DEFAULT_SNAIL_CLASS: (i32, usize, usize, u64) = (5, 2, 6, 360);

// Worker memory manager
const DEFAULT_MEMMAN_BUDGET_MB: u64 = 8_192;
const DEFAULT_FAST_TABLE_MB: u64 = 256;
const DEFAULT_MEDIUM_TABLE_MB: u64 = 1_024;
const DEFAULT_SLOW_TABLE_MB: u64 = 2_048;
const DEFAULT_SNAIL_TABLE_MB: u64 = 4_096;

// Worker reply streaming
const DEFAULT_MAX_REPLY_BUFFER_MB: u64 = 256;
const DEFAULT_REPLY_BLOB_BYTES: usize = 2 * 1024 * 1024;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// MySQL connection settings for the czar's metadata/result store and the
/// worker's chunk databases.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_connections: u32,
    pub timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_DB_HOST.to_string(),
            port: DEFAULT_DB_PORT,
            database: DEFAULT_DB_NAME.to_string(),
            username: DEFAULT_DB_USER.to_string(),
            password: DEFAULT_DB_PASSWORD.to_string(),
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            timeout_seconds: DEFAULT_DB_TIMEOUT_SECONDS,
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_string("SKYSHARD_DATABASE_HOST", DEFAULT_DB_HOST),
            port: env_parse("SKYSHARD_DATABASE_PORT", DEFAULT_DB_PORT),
            database: env_string("SKYSHARD_DATABASE_NAME", DEFAULT_DB_NAME),
            username: env_string("SKYSHARD_DATABASE_USERNAME", DEFAULT_DB_USER),
            password: env_string("SKYSHARD_DATABASE_PASSWORD", DEFAULT_DB_PASSWORD),
            max_connections: env_parse("SKYSHARD_DATABASE_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            timeout_seconds: env_parse("SKYSHARD_DATABASE_TIMEOUT_SECONDS", DEFAULT_DB_TIMEOUT_SECONDS),
        }
    }

    /// Full connection URL, including credentials. Never log this.
    pub fn connection_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }

    /// Connection string with the password elided, safe for logs.
    pub fn safe_connection_string(&self) -> String {
        format!(
            "mysql://{}:***@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }
}

impl Validate for DatabaseConfig {
    fn validate(&self) -> ConfigResult<()> {
        validation::validate_port(self.port, "database.port")?;
        if self.database.is_empty() {
            return Err(ConfigError::MissingField {
                field: "database.database".to_string(),
            });
        }
        validation::validate_range(u64::from(self.max_connections), 1, 1000, "database.max_connections")
    }
}

/// Worker registry HTTP service settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RegistryConfig {
    pub url: String,
    pub poll_interval_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REGISTRY_URL.to_string(),
            poll_interval_seconds: DEFAULT_REGISTRY_POLL_SECONDS,
        }
    }
}

impl RegistryConfig {
    pub fn from_env() -> Self {
        Self {
            url: env_string("SKYSHARD_REGISTRY_URL", DEFAULT_REGISTRY_URL),
            poll_interval_seconds: env_parse(
                "SKYSHARD_REGISTRY_POLL_SECONDS",
                DEFAULT_REGISTRY_POLL_SECONDS,
            ),
        }
    }
}

impl Validate for RegistryConfig {
    fn validate(&self) -> ConfigResult<()> {
        validation::validate_url(&self.url, "registry.url")
    }
}

/// Framed czar/worker channel settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TransportConfig {
    pub worker_port: u16,
    pub connect_timeout_seconds: u64,
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            worker_port: DEFAULT_WORKER_PORT,
            connect_timeout_seconds: DEFAULT_CONNECT_TIMEOUT_SECONDS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl TransportConfig {
    pub fn from_env() -> Self {
        Self {
            worker_port: env_parse("SKYSHARD_WORKER_PORT", DEFAULT_WORKER_PORT),
            connect_timeout_seconds: env_parse(
                "SKYSHARD_CONNECT_TIMEOUT_SECONDS",
                DEFAULT_CONNECT_TIMEOUT_SECONDS,
            ),
            max_frame_bytes: env_parse("SKYSHARD_MAX_FRAME_BYTES", DEFAULT_MAX_FRAME_BYTES),
        }
    }
}

impl Validate for TransportConfig {
    fn validate(&self) -> ConfigResult<()> {
        validation::validate_port(self.worker_port, "transport.worker_port")?;
        validation::validate_range(
            self.max_frame_bytes as u64,
            4096,
            1024 * 1024 * 1024,
            "transport.max_frame_bytes",
        )
    }
}

/// Czar-side dispatch and retry policy.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DispatchConfig {
    /// Upper bound on executions of one job, first attempt included.
    pub max_attempts: u32,
    /// How long a job may sit in DISPATCHED before the attempt is failed.
    pub dispatch_timeout_seconds: u64,
    /// Overall per-job deadline across attempts.
    pub job_timeout_seconds: u64,
    /// Overall per-user-query deadline.
    pub query_timeout_seconds: u64,
    /// How long completed result tables are kept before the sweeper drops them.
    pub result_ttl_seconds: u64,
    /// Database assumed for unqualified table references.
    pub default_database: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            dispatch_timeout_seconds: DEFAULT_DISPATCH_TIMEOUT_SECONDS,
            job_timeout_seconds: DEFAULT_JOB_TIMEOUT_SECONDS,
            query_timeout_seconds: DEFAULT_QUERY_TIMEOUT_SECONDS,
            result_ttl_seconds: DEFAULT_RESULT_TTL_SECONDS,
            default_database: DEFAULT_DATABASE_CONTEXT.to_string(),
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Self {
        Self {
            max_attempts: env_parse("SKYSHARD_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS),
            dispatch_timeout_seconds: env_parse(
                "SKYSHARD_DISPATCH_TIMEOUT_SECONDS",
                DEFAULT_DISPATCH_TIMEOUT_SECONDS,
            ),
            job_timeout_seconds: env_parse("SKYSHARD_JOB_TIMEOUT_SECONDS", DEFAULT_JOB_TIMEOUT_SECONDS),
            query_timeout_seconds: env_parse(
                "SKYSHARD_QUERY_TIMEOUT_SECONDS",
                DEFAULT_QUERY_TIMEOUT_SECONDS,
            ),
            result_ttl_seconds: env_parse("SKYSHARD_RESULT_TTL_SECONDS", DEFAULT_RESULT_TTL_SECONDS),
            default_database: env_string("SKYSHARD_DEFAULT_DATABASE", DEFAULT_DATABASE_CONTEXT),
        }
    }
}

impl Validate for DispatchConfig {
    fn validate(&self) -> ConfigResult<()> {
        validation::validate_range(u64::from(self.max_attempts), 1, 10, "dispatch.max_attempts")?;
        validation::validate_range(
            self.dispatch_timeout_seconds,
            1,
            self.job_timeout_seconds,
            "dispatch.dispatch_timeout_seconds",
        )
    }
}

/// One scheduler class: a priority queue slice with its own concurrency
/// bounds and a cap on how long a task may hold the active slot.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ScanClassConfig {
    pub priority: i32,
    pub min_running: usize,
    pub max_running: usize,
    pub max_active_minutes: u64,
}

impl ScanClassConfig {
    const fn from_tuple(t: (i32, usize, usize, u64)) -> Self {
        Self {
            priority: t.0,
            min_running: t.1,
            max_running: t.2,
            max_active_minutes: t.3,
        }
    }
}

/// Worker scheduler pool shape.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub pool_size: usize,
    pub interactive_min_running: usize,
    pub interactive_max_running: usize,
    pub fast: ScanClassConfig,
    pub medium: ScanClassConfig,
    pub slow: ScanClassConfig,
    pub snail: ScanClassConfig,
    /// Budget of scheduler demotions before the owning user query is failed.
    pub max_boots_per_user_query: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            interactive_min_running: DEFAULT_INTERACTIVE_MIN_RUNNING,
            interactive_max_running: DEFAULT_INTERACTIVE_MAX_RUNNING,
            fast: ScanClassConfig::from_tuple(DEFAULT_FAST_CLASS),
            medium: ScanClassConfig::from_tuple(DEFAULT_MEDIUM_CLASS),
            slow: ScanClassConfig::from_tuple(DEFAULT_SLOW_CLASS),
            snail: ScanClassConfig::from_tuple(DEFAULT_SNAIL_CLASS),
            max_boots_per_user_query: DEFAULT_MAX_BOOTS_PER_USER_QUERY,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            pool_size: env_parse("SKYSHARD_SCHEDULER_POOL_SIZE", DEFAULT_POOL_SIZE),
            max_boots_per_user_query: env_parse(
                "SKYSHARD_SCHEDULER_MAX_BOOTS",
                DEFAULT_MAX_BOOTS_PER_USER_QUERY,
            ),
            ..defaults
        }
    }
}

impl Validate for SchedulerConfig {
    fn validate(&self) -> ConfigResult<()> {
        validation::validate_range(self.pool_size as u64, 2, 65_536, "scheduler.pool_size")?;
        for (name, class) in [
            ("fast", &self.fast),
            ("medium", &self.medium),
            ("slow", &self.slow),
            ("snail", &self.snail),
        ] {
            if class.min_running > class.max_running {
                return Err(ConfigError::Generic {
                    message: format!("scheduler.{name}: min_running exceeds max_running"),
                });
            }
        }
        Ok(())
    }
}

/// Worker table-memory manager sizing.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MemManConfig {
    pub budget_mb: u64,
    pub fast_table_mb: u64,
    pub medium_table_mb: u64,
    pub slow_table_mb: u64,
    pub snail_table_mb: u64,
}

impl Default for MemManConfig {
    fn default() -> Self {
        Self {
            budget_mb: DEFAULT_MEMMAN_BUDGET_MB,
            fast_table_mb: DEFAULT_FAST_TABLE_MB,
            medium_table_mb: DEFAULT_MEDIUM_TABLE_MB,
            slow_table_mb: DEFAULT_SLOW_TABLE_MB,
            snail_table_mb: DEFAULT_SNAIL_TABLE_MB,
        }
    }
}

impl MemManConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            budget_mb: env_parse("SKYSHARD_MEMMAN_BUDGET_MB", DEFAULT_MEMMAN_BUDGET_MB),
            ..defaults
        }
    }
}

impl Validate for MemManConfig {
    fn validate(&self) -> ConfigResult<()> {
        // The budget must at least fit the most expensive single table, or no
        // snail-rated task could ever acquire its lock.
        if self.budget_mb < self.snail_table_mb {
            return Err(ConfigError::Generic {
                message: "memman.budget_mb smaller than snail_table_mb".to_string(),
            });
        }
        Ok(())
    }
}

/// Worker reply streaming limits.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReplyConfig {
    /// Global cap on reply bytes buffered across all send channels.
    pub max_reply_buffer_mb: u64,
    /// Target size of an individual reply blob.
    pub blob_bytes: usize,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            max_reply_buffer_mb: DEFAULT_MAX_REPLY_BUFFER_MB,
            blob_bytes: DEFAULT_REPLY_BLOB_BYTES,
        }
    }
}

impl ReplyConfig {
    pub fn from_env() -> Self {
        Self {
            max_reply_buffer_mb: env_parse("SKYSHARD_MAX_REPLY_BUFFER_MB", DEFAULT_MAX_REPLY_BUFFER_MB),
            blob_bytes: env_parse("SKYSHARD_REPLY_BLOB_BYTES", DEFAULT_REPLY_BLOB_BYTES),
        }
    }

    pub fn max_reply_buffer_bytes(&self) -> u64 {
        self.max_reply_buffer_mb * 1024 * 1024
    }
}

impl Validate for ReplyConfig {
    fn validate(&self) -> ConfigResult<()> {
        if (self.blob_bytes as u64) > self.max_reply_buffer_bytes() {
            return Err(ConfigError::Generic {
                message: "reply.blob_bytes exceeds the global reply buffer budget".to_string(),
            });
        }
        Ok(())
    }
}

/// Complete configuration for a czar process.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CzarConfig {
    pub czar_id: u32,
    pub database: DatabaseConfig,
    pub registry: RegistryConfig,
    pub transport: TransportConfig,
    pub dispatch: DispatchConfig,
    pub status_port: u16,
}

impl Default for CzarConfig {
    fn default() -> Self {
        Self {
            czar_id: 1,
            database: DatabaseConfig::default(),
            registry: RegistryConfig::default(),
            transport: TransportConfig::default(),
            dispatch: DispatchConfig::default(),
            status_port: DEFAULT_STATUS_PORT,
        }
    }
}

impl CzarConfig {
    pub fn from_env() -> Self {
        Self {
            czar_id: env_parse("SKYSHARD_CZAR_ID", 1),
            database: DatabaseConfig::from_env(),
            registry: RegistryConfig::from_env(),
            transport: TransportConfig::from_env(),
            dispatch: DispatchConfig::from_env(),
            status_port: env_parse("SKYSHARD_STATUS_PORT", DEFAULT_STATUS_PORT),
        }
    }
}

impl Validate for CzarConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.database.validate()?;
        self.registry.validate()?;
        self.transport.validate()?;
        self.dispatch.validate()?;
        validation::validate_port(self.status_port, "czar.status_port")
    }
}

/// Complete configuration for a worker process.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkerConfig {
    /// Resource name this worker registers under, e.g. `worker-17`.
    pub name: String,
    pub database: DatabaseConfig,
    pub registry: RegistryConfig,
    pub transport: TransportConfig,
    pub scheduler: SchedulerConfig,
    pub memman: MemManConfig,
    pub reply: ReplyConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker-0".to_string(),
            database: DatabaseConfig::default(),
            registry: RegistryConfig::default(),
            transport: TransportConfig::default(),
            scheduler: SchedulerConfig::default(),
            memman: MemManConfig::default(),
            reply: ReplyConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            name: env_string("SKYSHARD_WORKER_NAME", "worker-0"),
            database: DatabaseConfig::from_env(),
            registry: RegistryConfig::from_env(),
            transport: TransportConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
            memman: MemManConfig::from_env(),
            reply: ReplyConfig::from_env(),
        }
    }
}

impl Validate for WorkerConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingField {
                field: "worker.name".to_string(),
            });
        }
        self.database.validate()?;
        self.registry.validate()?;
        self.transport.validate()?;
        self.scheduler.validate()?;
        self.memman.validate()?;
        self.reply.validate()
    }
}
