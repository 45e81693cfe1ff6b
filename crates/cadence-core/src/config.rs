use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CoreError, Result};

pub const DEFAULT_INSTANCE_NAME: &str = "cadence";
/// Instance id placeholder replaced by a fresh uuid v7 at startup.
pub const AUTO_INSTANCE_ID: &str = "AUTO";
pub const DEFAULT_THREAD_COUNT: usize = 10;
pub const DEFAULT_MISFIRE_THRESHOLD_MS: u64 = 60_000;
pub const DEFAULT_IDLE_WAIT_MS: u64 = 30_000;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1;
pub const DEFAULT_STORE_RETRY_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_MAX_MISFIRES_PER_PASS: usize = 20;
pub const DEFAULT_CHECKIN_INTERVAL_MS: u64 = 7_500;
pub const DEFAULT_LOCK_LEASE_MS: u64 = 30_000;
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_LOCK_RETRY_BASE_MS: u64 = 10;
pub const DEFAULT_TRANSIENT_RETRIES: u32 = 3;
/// Idle waits shorter than this make the loop spin; rejected by `validate`.
pub const MIN_IDLE_WAIT_MS: u64 = 1_000;
/// Upper bound for every `*_ms` setting (ten years).
pub const MAX_DURATION_MS: u64 = 10 * 365 * 24 * 60 * 60 * 1_000;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    /// `AUTO` or a fixed id. Clustered nodes need distinct ids.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    /// Worker pool size.
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    #[serde(default = "default_misfire_threshold_ms")]
    pub misfire_threshold_ms: u64,
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default)]
    pub batch_time_window_ms: u64,
    #[serde(default = "bool_true")]
    pub wait_for_jobs_on_shutdown: bool,
    /// Back-off after a transient store failure in the firing loop.
    #[serde(default = "default_store_retry_interval_ms")]
    pub store_retry_interval_ms: u64,
    #[serde(default = "default_max_misfires_per_pass")]
    pub max_misfires_per_pass: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            instance_id: default_instance_id(),
            thread_count: DEFAULT_THREAD_COUNT,
            misfire_threshold_ms: DEFAULT_MISFIRE_THRESHOLD_MS,
            idle_wait_ms: DEFAULT_IDLE_WAIT_MS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            batch_time_window_ms: 0,
            wait_for_jobs_on_shutdown: true,
            store_retry_interval_ms: DEFAULT_STORE_RETRY_INTERVAL_MS,
            max_misfires_per_pass: DEFAULT_MAX_MISFIRES_PER_PASS,
        }
    }
}

impl SchedulerConfig {
    /// The configured id, or a fresh uuid v7 when set to `AUTO`.
    pub fn resolve_instance_id(&self) -> String {
        if self.instance_id.eq_ignore_ascii_case(AUTO_INSTANCE_ID) || self.instance_id.is_empty()
        {
            uuid::Uuid::now_v7().to_string()
        } else {
            self.instance_id.clone()
        }
    }

    pub fn misfire_threshold(&self) -> Duration {
        Duration::from_millis(self.misfire_threshold_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn batch_time_window(&self) -> Duration {
        Duration::from_millis(self.batch_time_window_ms)
    }

    pub fn store_retry_interval(&self) -> Duration {
        Duration::from_millis(self.store_retry_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    /// SQLite database file. A leading `~/` expands to `$HOME`.
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default)]
    pub clustered: bool,
    #[serde(default = "default_checkin_interval_ms")]
    pub checkin_interval_ms: u64,
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_lock_retry_base_ms")]
    pub lock_retry_base_ms: u64,
    /// How many times a transaction is retried after a busy/locked error.
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            path: default_db_path(),
            clustered: false,
            checkin_interval_ms: DEFAULT_CHECKIN_INTERVAL_MS,
            lock_lease_ms: DEFAULT_LOCK_LEASE_MS,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            lock_retry_base_ms: DEFAULT_LOCK_RETRY_BASE_MS,
            transient_retries: DEFAULT_TRANSIENT_RETRIES,
        }
    }
}

impl StoreConfig {
    /// `path` with `~/` expanded.
    pub fn resolved_path(&self) -> String {
        match self.path.strip_prefix("~/") {
            Some(rest) => format!("{}/{}", home_dir(), rest),
            None => self.path.clone(),
        }
    }

    pub fn checkin_interval(&self) -> Duration {
        Duration::from_millis(self.checkin_interval_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_retry_base(&self) -> Duration {
        Duration::from_millis(self.lock_retry_base_ms)
    }
}

fn bool_true() -> bool {
    true
}
fn default_instance_name() -> String {
    DEFAULT_INSTANCE_NAME.to_string()
}
fn default_instance_id() -> String {
    AUTO_INSTANCE_ID.to_string()
}
fn default_thread_count() -> usize {
    DEFAULT_THREAD_COUNT
}
fn default_misfire_threshold_ms() -> u64 {
    DEFAULT_MISFIRE_THRESHOLD_MS
}
fn default_idle_wait_ms() -> u64 {
    DEFAULT_IDLE_WAIT_MS
}
fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}
fn default_store_retry_interval_ms() -> u64 {
    DEFAULT_STORE_RETRY_INTERVAL_MS
}
fn default_max_misfires_per_pass() -> usize {
    DEFAULT_MAX_MISFIRES_PER_PASS
}
fn default_checkin_interval_ms() -> u64 {
    DEFAULT_CHECKIN_INTERVAL_MS
}
fn default_lock_lease_ms() -> u64 {
    DEFAULT_LOCK_LEASE_MS
}
fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}
fn default_lock_retry_base_ms() -> u64 {
    DEFAULT_LOCK_RETRY_BASE_MS
}
fn default_transient_retries() -> u32 {
    DEFAULT_TRANSIENT_RETRIES
}
fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
}
fn default_db_path() -> String {
    format!("{}/.cadence/cadence.db", home_dir())
}

/// Default location of the config file when none is given.
pub fn default_config_path() -> String {
    format!("{}/.cadence/cadence.toml", home_dir())
}

/// The layered figment used by [`CadenceConfig::load`].
///
/// Exposed so binaries can extract their own superset of this config from
/// the same sources.
pub fn figment(config_path: Option<&str>) -> Figment {
    let path = config_path
        .map(String::from)
        .unwrap_or_else(default_config_path);

    Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("CADENCE_").split("__"))
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore: `CADENCE_SCHEDULER__THREAD_COUNT=4`.
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let config: CadenceConfig = figment(config_path)
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.thread_count == 0 {
            return Err(CoreError::Config(
                "scheduler.thread_count must be at least 1".into(),
            ));
        }
        if s.max_batch_size == 0 {
            return Err(CoreError::Config(
                "scheduler.max_batch_size must be at least 1".into(),
            ));
        }
        if s.idle_wait_ms < MIN_IDLE_WAIT_MS {
            return Err(CoreError::Config(format!(
                "scheduler.idle_wait_ms must be at least {MIN_IDLE_WAIT_MS}"
            )));
        }
        if s.max_misfires_per_pass == 0 {
            return Err(CoreError::Config(
                "scheduler.max_misfires_per_pass must be at least 1".into(),
            ));
        }
        let st = &self.store;
        let durations = [
            ("scheduler.misfire_threshold_ms", s.misfire_threshold_ms),
            ("scheduler.idle_wait_ms", s.idle_wait_ms),
            ("scheduler.batch_time_window_ms", s.batch_time_window_ms),
            ("scheduler.store_retry_interval_ms", s.store_retry_interval_ms),
            ("store.checkin_interval_ms", st.checkin_interval_ms),
            ("store.lock_lease_ms", st.lock_lease_ms),
            ("store.lock_timeout_ms", st.lock_timeout_ms),
            ("store.lock_retry_base_ms", st.lock_retry_base_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, ms)| *ms > MAX_DURATION_MS) {
            return Err(CoreError::Config(format!(
                "{name} must be at most {MAX_DURATION_MS}"
            )));
        }
        if st.lock_lease_ms == 0 || st.checkin_interval_ms == 0 {
            return Err(CoreError::Config(
                "store.lock_lease_ms and store.checkin_interval_ms must be positive".into(),
            ));
        }
        if st.clustered && st.kind == StoreKind::Memory {
            return Err(CoreError::Config(
                "store.clustered requires store.kind = \"sqlite\"".into(),
            ));
        }
        if st.clustered && s.instance_id.eq_ignore_ascii_case(AUTO_INSTANCE_ID) {
            tracing::warn!(
                "clustered store with instance_id = AUTO; recovery of this node's jobs \
                 after a restart will be done by its peers"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("HOME", "/home/op");
            let config =
                CadenceConfig::load(Some("does-not-exist.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.scheduler.thread_count, DEFAULT_THREAD_COUNT);
            assert_eq!(config.store.kind, StoreKind::Memory);
            assert_eq!(config.store.path, "/home/op/.cadence/cadence.db");
            Ok(())
        });
    }

    #[test]
    fn toml_then_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                r#"
                [scheduler]
                thread_count = 4
                max_batch_size = 8

                [store]
                kind = "sqlite"
                path = "/var/lib/cadence.db"
                "#,
            )?;
            jail.set_env("CADENCE_SCHEDULER__THREAD_COUNT", "2");
            let config =
                CadenceConfig::load(Some("cadence.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.scheduler.thread_count, 2);
            assert_eq!(config.scheduler.max_batch_size, 8);
            assert_eq!(config.store.kind, StoreKind::Sqlite);
            assert_eq!(config.store.path, "/var/lib/cadence.db");
            Ok(())
        });
    }

    #[test]
    fn zero_threads_rejected() {
        let mut config = CadenceConfig::default();
        config.scheduler.thread_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_durations_rejected() {
        let mut config = CadenceConfig::default();
        config.store.lock_lease_ms = u64::MAX;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("store.lock_lease_ms"), "{err}");

        let mut config = CadenceConfig::default();
        config.scheduler.misfire_threshold_ms = MAX_DURATION_MS + 1;
        assert!(config.validate().is_err());

        config.scheduler.misfire_threshold_ms = MAX_DURATION_MS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn clustered_memory_store_rejected() {
        let mut config = CadenceConfig::default();
        config.store.clustered = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn auto_instance_id_is_generated() {
        let config = SchedulerConfig::default();
        let a = config.resolve_instance_id();
        let b = config.resolve_instance_id();
        assert_ne!(a, b);
        let fixed = SchedulerConfig {
            instance_id: "node-1".into(),
            ..SchedulerConfig::default()
        };
        assert_eq!(fixed.resolve_instance_id(), "node-1");
    }

    #[test]
    fn tilde_path_expands() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("HOME", "/home/op");
            let store = StoreConfig {
                path: "~/data/c.db".into(),
                ..StoreConfig::default()
            };
            assert_eq!(store.resolved_path(), "/home/op/data/c.db");
            Ok(())
        });
    }
}
