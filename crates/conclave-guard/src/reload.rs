//! Hot reload of the `[guard]` section.
//!
//! Watches the config file and swaps fresh limits into a [`LiveLimits`]
//! after a debounce window. Callers blocked in `acquire` pick the new limits
//! up on their next poll.

use crate::limits::LiveLimits;
use conclave_core::{load_config, ConclaveError, ConclaveResult};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

/// Keeps the file watch alive. Dropping it stops reloading.
pub struct GuardConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl GuardConfigWatcher {
    /// Start watching `config_path`. Unreadable or invalid files are logged
    /// and leave the current limits in place.
    pub fn start(
        config_path: PathBuf,
        debounce_ms: u64,
        limits: Arc<LiveLimits>,
    ) -> ConclaveResult<Self> {
        let (tx, rx) = std_mpsc::channel();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| ConclaveError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(config_path.as_ref(), RecursiveMode::NonRecursive)
            .map_err(|e| ConclaveError::Config(format!("Failed to watch config file: {e}")))?;

        let path = config_path.clone();
        std::thread::spawn(move || {
            let mut last_reload = std::time::Instant::now();
            let debounce = std::time::Duration::from_millis(debounce_ms);

            while rx.recv().is_ok() {
                // One reload per burst of writes.
                while rx.try_recv().is_ok() {}

                let since = last_reload.elapsed();
                if since < debounce {
                    std::thread::sleep(debounce - since);
                }
                last_reload = std::time::Instant::now();

                if let Err(e) = reload_limits(&path, &limits) {
                    tracing::warn!(error = %e, "Failed to reload guard limits");
                }
            }

            tracing::debug!("Guard config watcher thread exiting");
        });

        tracing::info!(path = %config_path.display(), "Guard limits hot-reload watcher started");

        Ok(Self { _watcher: watcher })
    }
}

/// Read `path` and apply its `[guard]` section. Returns whether the limits changed.
pub fn reload_limits(path: &Path, limits: &LiveLimits) -> ConclaveResult<bool> {
    let config = load_config(path)?;
    let changed = limits.set(config.guard.clone());
    if changed {
        tracing::info!(
            enabled = config.guard.enabled,
            global_max_concurrency = config.guard.global_max_concurrency,
            tenant_max_concurrency = config.guard.tenant_max_concurrency,
            global_calls_per_minute = config.guard.global_calls_per_minute,
            tenant_calls_per_minute = config.guard.tenant_calls_per_minute,
            "Guard limits reloaded"
        );
    }
    Ok(changed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::limits::LimitsSource;
    use conclave_core::GuardConfig;
    use std::io::Write;

    #[test]
    fn test_reload_applies_guard_section() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            tmp.as_file_mut(),
            r#"
[guard]
global_max_concurrency = 2
tenant_calls_per_minute = 30
"#
        )
        .unwrap();

        let live = LiveLimits::new(GuardConfig::default());
        assert!(reload_limits(tmp.path(), &live).unwrap());
        let limits = live.limits();
        assert_eq!(limits.global_max_concurrency, 2);
        assert_eq!(limits.tenant_calls_per_minute, 30);
        assert_eq!(limits.tenant_max_concurrency, 4);

        assert!(!reload_limits(tmp.path(), &live).unwrap());
    }

    #[test]
    fn test_invalid_file_keeps_current_limits() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp.as_file_mut(), "[guard\nbroken").unwrap();

        let live = LiveLimits::new(GuardConfig {
            global_max_concurrency: 1,
            ..GuardConfig::default()
        });
        let err = reload_limits(tmp.path(), &live).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
        assert_eq!(live.limits().global_max_concurrency, 1);
    }
}
