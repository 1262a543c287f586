//! Interfaces the council consumes but does not own: the agent runtime's
//! view of who is executing, a per-agent wake-up channel, and the durable
//! archive adopted resolutions are mirrored to.

use crate::types::Resolution;
use conclave_core::{validate_tenant, ConclaveError, ConclaveResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

/// Execution state of an agent as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Sleeping,
}

impl RunState {
    pub fn is_executing(self) -> bool {
        matches!(self, RunState::Running)
    }
}

/// Snapshot of agent execution states for a tenant.
pub trait RuntimeSnapshot: Send + Sync {
    fn run_states(&self, tenant: &str) -> ConclaveResult<HashMap<String, RunState>>;
}

/// Per-agent wake-up channel.
pub trait AgentNotifier: Send + Sync {
    fn wake(&self, tenant: &str, agent_id: &str) -> ConclaveResult<()>;
}

/// Durable destination for adopted resolutions.
pub trait ResolutionArchive: Send + Sync {
    fn archive(&self, tenant: &str, resolution: &Resolution) -> ConclaveResult<()>;
}

/// Runtime that reports every agent idle.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleRuntime;

impl RuntimeSnapshot for IdleRuntime {
    fn run_states(&self, _tenant: &str) -> ConclaveResult<HashMap<String, RunState>> {
        Ok(HashMap::new())
    }
}

/// Runtime view that can be set explicitly. Agents never mentioned are idle.
#[derive(Debug, Default)]
pub struct StaticRuntime {
    states: RwLock<HashMap<String, HashMap<String, RunState>>>,
}

impl StaticRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, tenant: &str, agent_id: &str, state: RunState) {
        self.states
            .write()
            .entry(tenant.to_string())
            .or_default()
            .insert(agent_id.to_string(), state);
    }
}

impl RuntimeSnapshot for StaticRuntime {
    fn run_states(&self, tenant: &str) -> ConclaveResult<HashMap<String, RunState>> {
        Ok(self.states.read().get(tenant).cloned().unwrap_or_default())
    }
}

/// Notifier that drops every wake-up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl AgentNotifier for NoopNotifier {
    fn wake(&self, _tenant: &str, _agent_id: &str) -> ConclaveResult<()> {
        Ok(())
    }
}

/// Notifier that remembers every wake-up, in order.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(tenant, agent_id)` pairs woken so far.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    pub fn woken(&self, agent_id: &str) -> usize {
        self.calls.lock().iter().filter(|(_, a)| a == agent_id).count()
    }
}

impl AgentNotifier for RecordingNotifier {
    fn wake(&self, tenant: &str, agent_id: &str) -> ConclaveResult<()> {
        self.calls
            .lock()
            .push((tenant.to_string(), agent_id.to_string()));
        Ok(())
    }
}

/// Archive that discards resolutions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopArchive;

impl ResolutionArchive for NoopArchive {
    fn archive(&self, _tenant: &str, _resolution: &Resolution) -> ConclaveResult<()> {
        Ok(())
    }
}

/// Appends each resolution as one JSON line to `<dir>/<tenant>.resolutions.jsonl`.
pub struct JsonlArchive {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlArchive {
    pub fn new(dir: impl Into<PathBuf>) -> ConclaveResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path_for(&self, tenant: &str) -> PathBuf {
        self.dir.join(format!("{tenant}.resolutions.jsonl"))
    }

    /// Read back everything archived for a tenant, skipping unreadable lines.
    pub fn read_all(&self, tenant: &str) -> ConclaveResult<Vec<Resolution>> {
        let path = self.path_for(tenant);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

impl ResolutionArchive for JsonlArchive {
    fn archive(&self, tenant: &str, resolution: &Resolution) -> ConclaveResult<()> {
        validate_tenant(tenant)?;
        let line = serde_json::to_string(resolution)?;
        let _guard = self.write_lock.lock();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(tenant))
            .map_err(|e| ConclaveError::Collaborator(format!("archive unavailable: {e}")))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}
