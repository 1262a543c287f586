use crate::limits::{LimitsSource, StaticLimits};
use conclave_core::{ConclaveError, ConclaveResult, GuardConfig};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Length of the sliding rate window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// `acquire_timeout_sec` as a duration. Negative and NaN mean no wait;
/// values too large to represent mean no deadline.
fn acquire_timeout(limits: &GuardConfig) -> Duration {
    Duration::try_from_secs_f64(limits.acquire_timeout_sec.max(0.0)).unwrap_or(Duration::MAX)
}

#[derive(Default)]
struct GuardState {
    global_running: usize,
    tenant_running: HashMap<String, usize>,
    global_window: VecDeque<Instant>,
    tenant_windows: HashMap<String, VecDeque<Instant>>,
}

fn prune_window(window: &mut VecDeque<Instant>, now: Instant) {
    while window
        .front()
        .is_some_and(|t| now.saturating_duration_since(*t) >= RATE_WINDOW)
    {
        window.pop_front();
    }
}

/// Time until the oldest entry leaves the window.
fn until_expiry(window: &VecDeque<Instant>, now: Instant) -> Duration {
    window
        .front()
        .map(|t| RATE_WINDOW.saturating_sub(now.saturating_duration_since(*t)))
        .unwrap_or_default()
}

/// A limit of 0 means unlimited.
fn exceeded(count: usize, limit: usize) -> bool {
    limit > 0 && count >= limit
}

impl GuardState {
    fn prune(&mut self, now: Instant) {
        prune_window(&mut self.global_window, now);
        for window in self.tenant_windows.values_mut() {
            prune_window(window, now);
        }
        self.tenant_windows.retain(|_, w| !w.is_empty());
    }

    /// Admit one call, or report how long the rate windows need before a
    /// retry can succeed (zero when only concurrency is in the way).
    fn try_admit(&mut self, tenant: &str, limits: &GuardConfig, now: Instant) -> Result<(), Duration> {
        self.prune(now);
        let tenant_running = self.tenant_running.get(tenant).copied().unwrap_or(0);
        let tenant_calls = self.tenant_windows.get(tenant).map_or(0, VecDeque::len);

        let mut blocked = exceeded(self.global_running, limits.global_max_concurrency)
            || exceeded(tenant_running, limits.tenant_max_concurrency);
        let mut wait = Duration::ZERO;
        if exceeded(self.global_window.len(), limits.global_calls_per_minute) {
            blocked = true;
            wait = wait.max(until_expiry(&self.global_window, now));
        }
        if exceeded(tenant_calls, limits.tenant_calls_per_minute) {
            blocked = true;
            if let Some(window) = self.tenant_windows.get(tenant) {
                wait = wait.max(until_expiry(window, now));
            }
        }
        if blocked {
            return Err(wait);
        }

        self.global_running += 1;
        *self.tenant_running.entry(tenant.to_string()).or_insert(0) += 1;
        self.global_window.push_back(now);
        self.tenant_windows
            .entry(tenant.to_string())
            .or_default()
            .push_back(now);
        Ok(())
    }

    fn release(&mut self, tenant: &str) {
        self.global_running = self.global_running.saturating_sub(1);
        if let Some(count) = self.tenant_running.get_mut(tenant) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.tenant_running.remove(tenant);
            }
        }
    }
}

struct Inner {
    limits: Arc<dyn LimitsSource>,
    state: Mutex<GuardState>,
    freed: Condvar,
}

/// What one admission attempt decided.
enum Attempt {
    Admitted,
    Disabled,
    Wait(Duration),
    TimedOut,
}

/// Bounds in-flight calls and call rate to an external resource, globally and
/// per tenant.
///
/// Purely in-memory: counters reset with the process. Cloning is cheap and
/// clones share state, so one guard can be handed to every caller.
#[derive(Clone)]
pub struct ConcurrencyGuard {
    inner: Arc<Inner>,
}

impl ConcurrencyGuard {
    pub fn new(limits: Arc<dyn LimitsSource>) -> Self {
        Self {
            inner: Arc::new(Inner {
                limits,
                state: Mutex::new(GuardState::default()),
                freed: Condvar::new(),
            }),
        }
    }

    /// A guard with fixed limits.
    pub fn with_config(config: GuardConfig) -> Self {
        Self::new(Arc::new(StaticLimits(config)))
    }

    /// Current limits as seen by the next admission check.
    pub fn limits(&self) -> GuardConfig {
        self.inner.limits.limits()
    }

    fn attempt(&self, tenant: &str, started: Instant) -> Attempt {
        let limits = self.inner.limits.limits();
        if !limits.enabled {
            return Attempt::Disabled;
        }
        let timeout = acquire_timeout(&limits);
        let deadline = started.checked_add(timeout);
        let now = Instant::now();
        let verdict = self.inner.state.lock().try_admit(tenant, &limits, now);
        match verdict {
            Ok(()) => Attempt::Admitted,
            Err(_) if deadline.is_some_and(|d| now >= d) => Attempt::TimedOut,
            Err(wait) => {
                let poll = Duration::from_millis(limits.poll_interval_ms.max(1));
                let sleep = wait.max(poll);
                Attempt::Wait(match deadline {
                    Some(d) => sleep.min(d - now),
                    None => sleep,
                })
            }
        }
    }

    fn timed_out(tenant: &str, started: Instant) -> ConclaveError {
        let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        warn!(tenant = %tenant, waited_ms, "resource slot not granted before deadline");
        ConclaveError::ResourceTimeout {
            tenant: tenant.to_string(),
            waited_ms,
        }
    }

    /// Block until a slot is free for `tenant`, or fail with
    /// [`ConclaveError::ResourceTimeout`] after `acquire_timeout_sec`.
    ///
    /// A release wakes blocked callers early; every wake-up re-checks all
    /// four limits.
    pub fn acquire(&self, tenant: &str) -> ConclaveResult<Ticket> {
        let started = Instant::now();
        loop {
            match self.attempt(tenant, started) {
                Attempt::Admitted => return Ok(self.ticket(tenant, started)),
                Attempt::Disabled => return Ok(Ticket::noop(tenant)),
                Attempt::TimedOut => return Err(Self::timed_out(tenant, started)),
                Attempt::Wait(sleep) => {
                    let mut state = self.inner.state.lock();
                    self.inner.freed.wait_for(&mut state, sleep);
                }
            }
        }
    }

    /// Async variant of [`Self::acquire`] for callers on a tokio runtime.
    /// Polls with `tokio::time::sleep` instead of blocking the thread.
    pub async fn acquire_async(&self, tenant: &str) -> ConclaveResult<Ticket> {
        let started = Instant::now();
        loop {
            match self.attempt(tenant, started) {
                Attempt::Admitted => return Ok(self.ticket(tenant, started)),
                Attempt::Disabled => return Ok(Ticket::noop(tenant)),
                Attempt::TimedOut => return Err(Self::timed_out(tenant, started)),
                Attempt::Wait(sleep) => tokio::time::sleep(sleep).await,
            }
        }
    }

    fn ticket(&self, tenant: &str, started: Instant) -> Ticket {
        debug!(
            tenant = %tenant,
            waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "resource slot granted"
        );
        Ticket {
            inner: Some(Arc::clone(&self.inner)),
            tenant: tenant.to_string(),
            released: AtomicBool::new(false),
        }
    }

    /// Running counts and rate-window sizes, after pruning expired entries.
    pub fn snapshot(&self) -> GuardSnapshot {
        let mut state = self.inner.state.lock();
        state.prune(Instant::now());
        GuardSnapshot {
            global_running: state.global_running,
            tenant_running: state
                .tenant_running
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            global_calls_last_minute: state.global_window.len(),
            tenant_calls_last_minute: state
                .tenant_windows
                .iter()
                .map(|(k, w)| (k.clone(), w.len()))
                .collect(),
        }
    }
}

/// Operator view of the guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardSnapshot {
    pub global_running: usize,
    pub tenant_running: BTreeMap<String, usize>,
    pub global_calls_last_minute: usize,
    pub tenant_calls_last_minute: BTreeMap<String, usize>,
}

/// Proof of admission. Releases its slot on [`Ticket::release`] or on drop,
/// whichever comes first.
pub struct Ticket {
    inner: Option<Arc<Inner>>,
    tenant: String,
    released: AtomicBool,
}

impl Ticket {
    fn noop(tenant: &str) -> Self {
        Self {
            inner: None,
            tenant: tenant.to_string(),
            released: AtomicBool::new(false),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// True for tickets handed out while the guard was disabled.
    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    /// Give the slot back. Only the first call has an effect.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = &self.inner {
            inner.state.lock().release(&self.tenant);
            inner.freed.notify_all();
            debug!(tenant = %self.tenant, "resource slot released");
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("tenant", &self.tenant)
            .field("noop", &self.is_noop())
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn limits(global: usize, tenant: usize, global_rate: usize, tenant_rate: usize) -> GuardConfig {
        GuardConfig {
            global_max_concurrency: global,
            tenant_max_concurrency: tenant,
            global_calls_per_minute: global_rate,
            tenant_calls_per_minute: tenant_rate,
            ..GuardConfig::default()
        }
    }

    #[test]
    fn test_admission_counts_both_scopes() {
        let mut state = GuardState::default();
        let now = Instant::now();
        let cfg = limits(2, 1, 0, 0);
        assert!(state.try_admit("a", &cfg, now).is_ok());
        assert_eq!(state.try_admit("a", &cfg, now), Err(Duration::ZERO));
        assert!(state.try_admit("b", &cfg, now).is_ok());
        assert!(state.try_admit("c", &cfg, now).is_err());
        state.release("a");
        assert!(state.try_admit("c", &cfg, now).is_ok());
    }

    #[test]
    fn test_rate_window_reports_expiry() {
        let mut state = GuardState::default();
        let start = Instant::now();
        let cfg = limits(0, 0, 1, 0);
        assert!(state.try_admit("a", &cfg, start).is_ok());
        state.release("a");

        let later = start + Duration::from_secs(20);
        let wait = state.try_admit("b", &cfg, later).unwrap_err();
        assert_eq!(wait, Duration::from_secs(40));

        let expired = start + RATE_WINDOW;
        assert!(state.try_admit("b", &cfg, expired).is_ok());
    }

    #[test]
    fn test_acquire_timeout_saturates() {
        let with = |secs: f64| GuardConfig {
            acquire_timeout_sec: secs,
            ..GuardConfig::default()
        };
        assert_eq!(acquire_timeout(&with(1.5)), Duration::from_millis(1500));
        assert_eq!(acquire_timeout(&with(-3.0)), Duration::ZERO);
        assert_eq!(acquire_timeout(&with(f64::NAN)), Duration::ZERO);
        assert_eq!(acquire_timeout(&with(f64::INFINITY)), Duration::MAX);
        assert_eq!(acquire_timeout(&with(1e300)), Duration::MAX);
    }

    #[test]
    fn test_unbounded_timeout_keeps_waiting() {
        let guard = ConcurrencyGuard::with_config(GuardConfig {
            acquire_timeout_sec: f64::INFINITY,
            ..limits(1, 1, 0, 0)
        });
        let _held = guard.acquire("a").unwrap();
        assert!(matches!(guard.attempt("a", Instant::now()), Attempt::Wait(_)));
    }

    #[test]
    fn test_release_never_underflows() {
        let mut state = GuardState::default();
        state.release("ghost");
        assert_eq!(state.global_running, 0);
        assert!(state.tenant_running.is_empty());
    }
}
