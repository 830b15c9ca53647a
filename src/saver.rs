//! Periodic saver: snapshots symbol statistics to the cache file on a
//! timer (spec §4.6).
//!
//! Grounded on `services/memory_decay_daemon.rs`'s background-daemon
//! shape: an `AtomicBool` stop flag, a `tokio::time::interval` loop,
//! a cloneable handle for status/stop, and consecutive-failure
//! tracking that only affects observability here (spec §7: persistence
//! errors are logged and never affect running tasks, so the saver keeps
//! ticking even after every save so far has failed).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::{interval, Instant};

use crate::error::CoreError;
use crate::persistence;
use crate::symbol::registry::SymbolCache;

/// Status snapshot of the periodic saver, readable without blocking the
/// save loop for long.
#[derive(Debug, Clone)]
pub struct SaverStatus {
    pub running: bool,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub last_save: Option<Instant>,
}

impl Default for SaverStatus {
    fn default() -> Self {
        Self {
            running: false,
            total_runs: 0,
            successful_runs: 0,
            failed_runs: 0,
            last_save: None,
        }
    }
}

/// Handle to observe and stop a running [`PeriodicSaver`].
#[derive(Clone)]
pub struct SaverHandle {
    stop_flag: Arc<AtomicBool>,
    status: Arc<RwLock<SaverStatus>>,
}

impl SaverHandle {
    /// Request the saver to stop after its current tick.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    /// Current status snapshot.
    pub async fn status(&self) -> SaverStatus {
        self.status.read().await.clone()
    }
}

/// Background task that snapshots every symbol's (frequency, avg_time,
/// last_seen) to `cache_file` on `save_interval_seconds` (spec §4.6).
///
/// The cache file is locked exclusively for the duration of each write
/// by [`persistence::write_cache_file`]'s atomic temp-file-then-rename;
/// this saver only owns the scheduling.
pub struct PeriodicSaver {
    cache: Arc<SymbolCache>,
    cache_file: String,
    interval: Duration,
    status: Arc<RwLock<SaverStatus>>,
    stop_flag: Arc<AtomicBool>,
}

impl PeriodicSaver {
    #[must_use]
    pub fn new(cache: Arc<SymbolCache>, cache_file: impl Into<String>, interval: Duration) -> Self {
        Self {
            cache,
            cache_file: cache_file.into(),
            interval,
            status: Arc::new(RwLock::new(SaverStatus::default())),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle that can be cloned out before [`run`](Self::run) consumes
    /// `self`.
    #[must_use]
    pub fn handle(&self) -> SaverHandle {
        SaverHandle {
            stop_flag: Arc::clone(&self.stop_flag),
            status: Arc::clone(&self.status),
        }
    }

    /// Save immediately, outside the timer loop. Used for a final save on
    /// shutdown and directly by tests.
    ///
    /// # Errors
    /// Returns [`CoreError::PersistenceIoError`] if the write fails; the
    /// caller decides whether that is fatal (spec §7: it is not, for the
    /// timer loop).
    pub fn save_once(&self) -> Result<(), CoreError> {
        persistence::write_cache_file(&self.cache_file, &self.cache.symbols)
    }

    /// Run the save loop until [`SaverHandle::stop`] is called. Intended
    /// to be spawned onto a `tokio` runtime by the host; consumes `self`.
    pub async fn run(self) {
        {
            let mut status = self.status.write().await;
            status.running = true;
        }

        let mut ticker = interval(self.interval);
        ticker.tick().await; // first tick fires immediately; skip it, only interval ticks save

        loop {
            ticker.tick().await;
            if self.stop_flag.load(Ordering::Acquire) {
                break;
            }

            let mut status = self.status.write().await;
            status.total_runs += 1;
            match self.save_once() {
                Ok(()) => {
                    status.successful_runs += 1;
                    status.last_save = Some(Instant::now());
                }
                Err(err) => {
                    status.failed_runs += 1;
                    tracing::warn!(error = %err, path = %self.cache_file, "periodic symbol cache save failed");
                }
            }
            drop(status);

            if self.stop_flag.load(Ordering::Acquire) {
                break;
            }
        }

        let mut status = self.status.write().await;
        status.running = false;
    }
}
