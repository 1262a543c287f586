use conclave_core::GuardConfig;
use parking_lot::RwLock;

/// Where the guard reads its limits from. Consulted on every admission
/// check, so changes apply to callers that are already waiting.
pub trait LimitsSource: Send + Sync {
    fn limits(&self) -> GuardConfig;
}

/// Fixed limits.
#[derive(Debug, Clone, Default)]
pub struct StaticLimits(pub GuardConfig);

impl LimitsSource for StaticLimits {
    fn limits(&self) -> GuardConfig {
        self.0.clone()
    }
}

/// Limits that can be swapped at runtime, typically by
/// [`crate::GuardConfigWatcher`].
#[derive(Debug, Default)]
pub struct LiveLimits {
    current: RwLock<GuardConfig>,
}

impl LiveLimits {
    pub fn new(initial: GuardConfig) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    /// Replace the limits. Returns false if nothing changed.
    pub fn set(&self, limits: GuardConfig) -> bool {
        let mut current = self.current.write();
        if *current == limits {
            return false;
        }
        *current = limits;
        true
    }
}

impl LimitsSource for LiveLimits {
    fn limits(&self) -> GuardConfig {
        self.current.read().clone()
    }
}
