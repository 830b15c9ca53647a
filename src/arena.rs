//! Per-task scoped arena.
//!
//! Wraps a [`bumpalo::Bump`] — the assumed-available memory-pool
//! primitive — with a registered-destructor list, the way
//! `rspamd_task_new` hangs a chain of `rspamd_mempool_add_destructor`
//! callbacks off the task's `task_pool` so that hash tables, pointer
//! arrays, and other non-POD structures allocated from the pool get torn
//! down when the pool is released, in the reverse order they were
//! registered.
//!
//! This crate does not reimplement bump allocation; it only adds the
//! task-scoped handle and destructor bookkeeping around `bumpalo::Bump`.

use bumpalo::Bump;

type Destructor = Box<dyn FnOnce() + Send>;

/// A per-task scoped allocator with a reverse-order destructor list.
///
/// Dropping a `TaskArena` runs every registered destructor before the
/// underlying `Bump` is freed, mirroring the original's pool-destroy
/// ordering.
pub struct TaskArena {
    bump: Bump,
    destructors: Vec<Destructor>,
}

impl TaskArena {
    /// Create a new, empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bump: Bump::new(),
            destructors: Vec::new(),
        }
    }

    /// Create a new arena pre-sized for `bytes` worth of allocations.
    #[must_use]
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            bump: Bump::with_capacity(bytes),
            destructors: Vec::new(),
        }
    }

    /// Allocate `value` in the arena, returning a reference tied to the
    /// arena's lifetime.
    pub fn alloc<T>(&self, value: T) -> &T {
        self.bump.alloc(value)
    }

    /// Register a destructor to run when this arena is dropped or
    /// explicitly [`release`](Self::release)d. Destructors run in
    /// reverse registration order (last registered, first run), matching
    /// `rspamd_mempool_add_destructor`'s teardown order.
    pub fn add_destructor<F>(&mut self, destructor: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.destructors.push(Box::new(destructor));
    }

    /// Number of destructors currently registered. Exposed for tests.
    #[must_use]
    pub fn destructor_count(&self) -> usize {
        self.destructors.len()
    }

    /// Number of bytes currently allocated from the underlying bump arena.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.bump.allocated_bytes()
    }

    /// Run all registered destructors now, in reverse order, without
    /// waiting for `Drop`. Safe to call at most once; a second call is a
    /// no-op because the list is drained.
    pub fn release(&mut self) {
        while let Some(destructor) = self.destructors.pop() {
            destructor();
        }
    }
}

impl Default for TaskArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskArena {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn alloc_returns_usable_reference() {
        let arena = TaskArena::new();
        let value: &u64 = arena.alloc(42);
        assert_eq!(*value, 42);
    }

    #[test]
    fn destructors_run_in_reverse_order_on_drop() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let mut arena = TaskArena::new();
            for i in 0..3 {
                let order = Arc::clone(&order);
                arena.add_destructor(move || order.lock().unwrap().push(i));
            }
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn release_runs_destructors_immediately_and_is_idempotent() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut arena = TaskArena::new();
        let c = Arc::clone(&count);
        arena.add_destructor(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        arena.release();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(arena.destructor_count(), 0);

        // dropping after an explicit release must not re-run anything
        drop(arena);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn allocated_bytes_grows_with_allocations() {
        let arena = TaskArena::new();
        let before = arena.allocated_bytes();
        let _ = arena.alloc([0u8; 256]);
        assert!(arena.allocated_bytes() > before);
    }
}
