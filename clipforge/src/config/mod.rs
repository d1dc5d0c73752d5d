//! Engine configuration loaded from `CLIPFORGE_*` environment variables.
//!
//! Every setting has a default; unset or blank variables keep it. Values that
//! are set but cannot be parsed are configuration errors rather than being
//! silently ignored.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::api::server::ApiServerConfig;
use crate::backend::CommandBackendConfig;
use crate::callback::CallbackConfig;
use crate::callback::allowlist::DEFAULT_RESOLVE_TIMEOUT;
use crate::compile::CacheConfig;
use crate::logging::LoggingSettings;
use crate::pool::PoolConfig;
use crate::scheduler::{ExecutorConfig, GcConfig, JobStoreConfig, SchedulerConfig};
use crate::{Error, Result};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CLIPFORGE_";

/// Complete engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub server: ApiServerConfig,
    pub scheduler: SchedulerConfig,
    pub store: JobStoreConfig,
    pub executor: ExecutorConfig,
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    pub callback: CallbackConfig,
    pub gc: GcConfig,
    pub backend: CommandBackendConfig,
    pub logging: LoggingSettings,
    /// Hosts callbacks may target. Empty means loopback only.
    pub callback_allowlist: Vec<String>,
    /// Resolve callback hosts and reject private addresses.
    pub callback_dns_check: bool,
    /// Bound on one callback hostname resolution.
    pub callback_resolve_timeout: Duration,
    /// Shared secret for the API key check. `None` disables authentication.
    pub api_secret: Option<String>,
    /// HMAC key for callback signatures. Falls back to the API secret.
    pub callback_secret: Option<String>,
    pub data_dir: PathBuf,
    pub templates_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::with_data_dir(PathBuf::from("./data"))
    }
}

impl EngineConfig {
    /// Defaults with every path placed under `data_dir`.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        let executor = ExecutorConfig {
            output_dir: data_dir.join("outputs"),
            ..ExecutorConfig::default()
        };
        let backend = CommandBackendConfig {
            bundles_dir: data_dir.join("bundles"),
            work_dir: data_dir.join("work"),
            ..CommandBackendConfig::default()
        };

        Self {
            server: ApiServerConfig::default(),
            scheduler: SchedulerConfig::default(),
            store: JobStoreConfig::default(),
            executor,
            cache: CacheConfig::default(),
            pool: PoolConfig::default(),
            callback: CallbackConfig::default(),
            gc: GcConfig::default(),
            backend,
            logging: LoggingSettings::default(),
            callback_allowlist: Vec::new(),
            callback_dns_check: true,
            callback_resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
            api_secret: None,
            callback_secret: None,
            templates_dir: data_dir.join("templates"),
            data_dir,
        }
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using `lookup` to read variables by their full name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let data_dir = env.string("DATA_DIR").map(PathBuf::from);
        let mut config = match data_dir {
            Some(dir) => Self::with_data_dir(dir),
            None => Self::default(),
        };

        // Server
        if let Some(bind_address) = env.string("BIND_ADDRESS") {
            config.server.bind_address = bind_address;
        }
        env.parse_into("PORT", &mut config.server.port)?;
        if let Some(enable_cors) = env.bool("ENABLE_CORS")? {
            config.server.enable_cors = enable_cors;
        }
        let public_base_url = match env.string("PUBLIC_BASE_URL") {
            Some(url) => url,
            None => format!("http://127.0.0.1:{}", config.server.port),
        };
        config.callback.public_base_url = public_base_url.trim_end_matches('/').to_string();

        // Scheduling and store
        env.parse_into("CONCURRENCY", &mut config.scheduler.concurrency)?;
        env.parse_into("MAX_JOBS", &mut config.store.max_jobs)?;
        if let Some(ttl) = env.secs("JOB_TTL_SECS")? {
            config.store.job_ttl = ttl;
        }
        if let Some(ttl) = env.secs("OUTPUT_TTL_SECS")? {
            config.store.output_ttl = ttl;
        }
        if let Some(timeout) = env.millis("RENDER_TIMEOUT_MS")? {
            config.scheduler.render_timeout = timeout;
        }
        if let Some(grace) = env.millis("CANCEL_GRACE_MS")? {
            config.scheduler.cancel_grace = grace;
        }
        if let Some(allow) = env.bool("ALLOW_CUSTOM_SOURCE")? {
            config.scheduler.allow_custom_source = allow;
        }

        // Compile cache and engine pool
        env.parse_into("CACHE_CAPACITY", &mut config.cache.capacity)?;
        if let Some(ttl) = env.secs("CACHE_TTL_SECS")? {
            config.cache.ttl = (!ttl.is_zero()).then_some(ttl);
        }
        if let Some(ttl) = env.secs("ENGINE_IDLE_TTL_SECS")? {
            config.pool.idle_ttl = ttl;
        }
        if let Some(interval) = env.secs("ENGINE_REAP_INTERVAL_SECS")? {
            config.pool.reap_interval = interval;
        }

        // Callbacks and authentication
        if let Some(list) = env.string("CALLBACK_ALLOWLIST") {
            config.callback_allowlist = list
                .split(',')
                .map(str::trim)
                .filter(|host| !host.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(timeout) = env.millis("CALLBACK_TIMEOUT_MS")? {
            config.callback.timeout = timeout;
        }
        if let Some(check) = env.bool("CALLBACK_DNS_CHECK")? {
            config.callback_dns_check = check;
        }
        if let Some(timeout) = env.millis("CALLBACK_RESOLVE_TIMEOUT_MS")? {
            config.callback_resolve_timeout = timeout;
        }
        config.api_secret = env.string("API_SECRET");
        config.callback_secret = env
            .string("CALLBACK_SECRET")
            .or_else(|| config.api_secret.clone());

        // Paths and GC
        if let Some(dir) = env.string("TEMPLATES_DIR") {
            config.templates_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env.string("OUTPUT_DIR") {
            config.executor.output_dir = PathBuf::from(dir);
        }
        if let Some(ext) = env.string("OUTPUT_EXTENSION") {
            config.executor.output_extension = ext.trim_start_matches('.').to_string();
        }
        if let Some(interval) = env.secs("GC_INTERVAL_SECS")? {
            config.gc.interval = interval;
        }

        // Backend commands
        if let Some(command) = env.string("BUNDLE_COMMAND") {
            config.backend.bundle_command = process_utils::split_command_line(&command);
        }
        if let Some(command) = env.string("ENGINE_COMMAND") {
            config.backend.engine_command = process_utils::split_command_line(&command);
        }
        if let Some(command) = env.string("RENDER_COMMAND") {
            config.backend.render_command = process_utils::split_command_line(&command);
        }
        if let Some(command) = env.string("SANDBOX_COMMAND") {
            config.backend.sandbox_command = process_utils::split_command_line(&command);
        }
        if let Some(timeout) = env.secs("ENGINE_STARTUP_TIMEOUT_SECS")? {
            config.backend.engine_startup_timeout = timeout;
        }

        // Logging
        let log_to_file = env.bool("LOG_TO_FILE")?.unwrap_or(false);
        let log_dir = env.string("LOG_DIR").map(PathBuf::from);
        config.logging.log_dir = match (log_to_file, log_dir) {
            (_, Some(dir)) => Some(dir),
            (true, None) => Some(config.data_dir.join("logs")),
            (false, None) => None,
        };
        if let Some(json) = env.bool("LOG_JSON")? {
            config.logging.json = json;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.concurrency == 0 {
            return Err(Error::config("concurrency must be at least 1"));
        }
        if self.store.max_jobs == 0 {
            return Err(Error::config("max_jobs must be at least 1"));
        }
        if self.scheduler.render_timeout.is_zero() {
            return Err(Error::config("render_timeout_ms must be greater than 0"));
        }
        if self.callback.timeout.is_zero() {
            return Err(Error::config("callback_timeout_ms must be greater than 0"));
        }
        if self.callback_resolve_timeout.is_zero() {
            return Err(Error::config(
                "callback_resolve_timeout_ms must be greater than 0",
            ));
        }
        if self.gc.interval.is_zero() {
            return Err(Error::config("gc_interval_secs must be greater than 0"));
        }
        if self.pool.reap_interval.is_zero() {
            return Err(Error::config(
                "engine_reap_interval_secs must be greater than 0",
            ));
        }
        if self.backend.render_command.is_empty() {
            return Err(Error::config("render command must not be empty"));
        }
        if self.executor.output_extension.is_empty()
            || !self
                .executor
                .output_extension
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
        {
            return Err(Error::config(format!(
                "invalid output extension '{}'",
                self.executor.output_extension
            )));
        }
        url::Url::parse(&self.callback.public_base_url).map_err(|e| {
            Error::config(format!(
                "invalid public base url '{}': {e}",
                self.callback.public_base_url
            ))
        })?;
        Ok(())
    }

    /// Settings that are valid but probably not what the operator meant.
    pub fn warnings(&self) -> Vec<&'static str> {
        let mut warnings = Vec::new();
        if self.scheduler.allow_custom_source && self.backend.sandbox_command.is_empty() {
            warnings.push(
                "Custom composition source is enabled but no sandbox command is configured, \
                 inline sources will be rejected",
            );
        }
        warnings
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-blank value of `CLIPFORGE_<name>`.
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(name)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| Error::config(format!("invalid {ENV_PREFIX}{name}='{raw}': {e}")))
            })
            .transpose()
    }

    fn parse_into<T>(&self, name: &str, target: &mut T) -> Result<()>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(value) = self.parse(name)? {
            *target = value;
        }
        Ok(())
    }

    fn secs(&self, name: &str) -> Result<Option<Duration>> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_secs))
    }

    fn millis(&self, name: &str) -> Result<Option<Duration>> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_millis))
    }

    fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(raw) = self.string(name) else {
            return Ok(None);
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(Error::config(format!(
                "invalid {ENV_PREFIX}{name}='{raw}': expected a boolean"
            ))),
        }
    }
}
