//! Event session: a per-task counter of outstanding asynchronous
//! operations with a single watcher callback fired on the zero
//! transition.
//!
//! Deliberately NOT modeled as a Rust `Future` — spec §9's Design Notes
//! are explicit that suspension here is a synchronous-callback model,
//! the same shape as rspamd's `rspamd_session_events_pending` check: a
//! task's [`crate::task::state_machine::advance`] call returns early
//! whenever this counter is non-zero, and re-entry happens when the
//! watcher fires, not via a polled `Future`.

use std::sync::atomic::{AtomicU32, Ordering};

/// A watcher invoked exactly once, when the session's pending-operation
/// counter transitions from one to zero.
pub type Watcher = Box<dyn FnOnce() + Send>;

/// Per-task outstanding-operation counter plus zero-transition watcher.
///
/// One task is owned by one thread between suspension points, so the
/// counter only needs to be atomic to allow a completion callback
/// (arriving on an I/O-reactor thread) to decrement it concurrently with
/// the owning thread reading it.
pub struct EventSession {
    pending: AtomicU32,
    watcher: std::sync::Mutex<Option<Watcher>>,
}

impl EventSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
            watcher: std::sync::Mutex::new(None),
        }
    }

    /// Register one outstanding asynchronous operation. Must be balanced
    /// by a later [`remove`](Self::remove).
    pub fn add(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Complete one outstanding operation. If this brings the counter to
    /// zero and a watcher is registered, the watcher runs and is
    /// consumed.
    pub fn remove(&self) {
        let previous = self.pending.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "event session counter underflow");
        if previous == 1 {
            if let Some(watcher) = self.watcher.lock().unwrap().take() {
                watcher();
            }
        }
    }

    /// Number of operations currently outstanding.
    #[must_use]
    pub fn pending_count(&self) -> u32 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Whether any asynchronous operation is outstanding right now.
    /// Mirrors `rspamd_session_events_pending`.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending_count() != 0
    }

    /// Register a watcher to be invoked on the next zero transition. If
    /// the counter is already zero, the watcher runs immediately instead
    /// of being stored, since there is no future transition to wait for.
    pub fn watch<F>(&self, watcher: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.pending_count() == 0 {
            watcher();
            return;
        }
        *self.watcher.lock().unwrap() = Some(Box::new(watcher));
    }
}

impl Default for EventSession {
    fn default() -> Self {
        Self::new()
    }
}
