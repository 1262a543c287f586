//! TOML configuration for the coordination core.
//!
//! Every section and field has a default, so an empty file (or a file holding
//! only the section an operator wants to change) is a valid configuration.

use crate::error::{ConclaveError, ConclaveResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Full configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConclaveConfig {
    /// Where tenant databases live.
    #[serde(default)]
    pub storage: StorageConfig,
    /// EventStore defaults.
    #[serde(default)]
    pub queue: QueueConfig,
    /// CouncilEngine settings.
    #[serde(default)]
    pub council: CouncilConfig,
    /// ConcurrencyGuard limits (hot-reloadable).
    #[serde(default)]
    pub guard: GuardConfig,
}

/// Storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root data directory. Queue databases go under `events/`, council
    /// databases under `council/`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// How long a writer waits on another process holding the tenant lock.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl StorageConfig {
    /// Directory of the per-tenant event queue databases.
    pub fn events_dir(&self) -> PathBuf {
        self.data_dir.join("events")
    }

    /// Directory of the per-tenant council databases.
    pub fn council_dir(&self) -> PathBuf {
        self.data_dir.join("council")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// EventStore defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Dedupe window used when a producer does not pass one.
    #[serde(default = "default_dedupe_window_sec")]
    pub default_dedupe_window_sec: i64,
    /// Attempts allowed before a record is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    /// Delay applied when stale work is put back on the queue.
    #[serde(default)]
    pub stale_retry_delay_sec: i64,
    /// Upper bound for `list` page sizes.
    #[serde(default = "default_max_list_limit")]
    pub max_list_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_dedupe_window_sec: default_dedupe_window_sec(),
            default_max_attempts: default_max_attempts(),
            stale_retry_delay_sec: 0,
            max_list_limit: default_max_list_limit(),
        }
    }
}

/// CouncilEngine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilConfig {
    /// Master switch; when off the pick gate allows everything.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Actor ids with chair privileges in every session (besides the initiator).
    #[serde(default = "default_chair_ids")]
    pub chair_ids: Vec<String>,
    /// Queue domain used for synthesized turn events.
    #[serde(default = "default_turn_domain")]
    pub turn_domain: String,
    /// Priority of synthesized turn events.
    #[serde(default = "default_turn_priority")]
    pub turn_priority: i64,
    /// Dedupe window for synthesized turn events.
    #[serde(default = "default_turn_dedupe_window_sec")]
    pub turn_dedupe_window_sec: i64,
    /// Maximum debate entries kept on a motion (oldest dropped first).
    #[serde(default = "default_debate_log_cap")]
    pub debate_log_cap: usize,
    /// Rules profile used when `start_session` does not name one.
    #[serde(default = "default_rules_profile")]
    pub default_rules_profile: String,
}

impl Default for CouncilConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chair_ids: default_chair_ids(),
            turn_domain: default_turn_domain(),
            turn_priority: default_turn_priority(),
            turn_dedupe_window_sec: default_turn_dedupe_window_sec(),
            debate_log_cap: default_debate_log_cap(),
            default_rules_profile: default_rules_profile(),
        }
    }
}

/// Limits enforced by the concurrency guard. A limit of 0 means unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// When off, every acquire succeeds immediately with a no-op ticket.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// In-flight calls across all tenants.
    #[serde(default = "default_global_max_concurrency")]
    pub global_max_concurrency: usize,
    /// In-flight calls for one tenant.
    #[serde(default = "default_tenant_max_concurrency")]
    pub tenant_max_concurrency: usize,
    /// Calls started in any 60 second window, all tenants.
    #[serde(default)]
    pub global_calls_per_minute: usize,
    /// Calls started in any 60 second window, one tenant.
    #[serde(default)]
    pub tenant_calls_per_minute: usize,
    /// How long `acquire` may block before giving up.
    #[serde(default = "default_acquire_timeout_sec")]
    pub acquire_timeout_sec: f64,
    /// Minimum sleep between admission checks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global_max_concurrency: default_global_max_concurrency(),
            tenant_max_concurrency: default_tenant_max_concurrency(),
            global_calls_per_minute: 0,
            tenant_calls_per_minute: 0,
            acquire_timeout_sec: default_acquire_timeout_sec(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_dedupe_window_sec() -> i64 {
    300
}
fn default_max_attempts() -> u32 {
    3
}
fn default_max_list_limit() -> usize {
    5_000
}
fn default_chair_ids() -> Vec<String> {
    vec!["chair".to_string()]
}
fn default_turn_domain() -> String {
    "council".to_string()
}
fn default_turn_priority() -> i64 {
    90
}
fn default_turn_dedupe_window_sec() -> i64 {
    3_600
}
fn default_debate_log_cap() -> usize {
    200
}
fn default_rules_profile() -> String {
    "standard".to_string()
}
fn default_global_max_concurrency() -> usize {
    8
}
fn default_tenant_max_concurrency() -> usize {
    4
}
fn default_acquire_timeout_sec() -> f64 {
    30.0
}
fn default_poll_interval_ms() -> u64 {
    100
}

/// Parse a configuration document.
pub fn parse_config(content: &str) -> ConclaveResult<ConclaveConfig> {
    toml::from_str(content).map_err(|e| ConclaveError::Config(format!("Failed to parse config: {e}")))
}

/// Read and parse a TOML config file.
pub fn load_config(path: &Path) -> ConclaveResult<ConclaveConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ConclaveError::Config(format!("Failed to read config '{}': {e}", path.display()))
    })?;
    toml::from_str(&content).map_err(|e| {
        ConclaveError::Config(format!("Failed to parse config '{}': {e}", path.display()))
    })
}
