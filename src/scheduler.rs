//! Per-task symbol-cache runtime (spec §4.4).
//!
//! Walks the offline execution order computed by
//! [`crate::symbol::ordering::build`], respecting declared dependencies,
//! `fine`-symbol eligibility, and the event session's suspension points.
//! Grounded on `services/task_queue_service.rs`/`services/dag_executor.rs`'s
//! ready-queue-plus-waiting-on-dependency shape, generalized from "ready
//! when all deps complete" task scheduling to a single-pass ordered scan
//! with a waiting-list for stragglers.

use std::collections::VecDeque;
use std::time::Instant;

use crate::aggregator::{PreResultAction, ResultSink};
use crate::config::CoreConfig;
use crate::symbol::registry::{SymbolCache, SymbolId, SymbolKind};
use crate::task::model::Task;

/// Saved scheduler position for a suspended task — the "checkpoint
/// pointer" spec §3 assigns to `Task`, opaque outside this module.
#[derive(Debug, Clone)]
pub struct SchedulerCheckpoint {
    cursor: usize,
    executed: Vec<bool>,
    waiting: VecDeque<SymbolId>,
}

impl SchedulerCheckpoint {
    fn fresh(symbol_count: usize) -> Self {
        Self {
            cursor: 0,
            executed: vec![false; symbol_count],
            waiting: VecDeque::new(),
        }
    }
}

/// Outcome of one [`run`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerOutcome {
    /// Every schedulable symbol ran, was skipped, or was given up on as
    /// unresolvable; the filters stage is complete.
    Complete,
    /// A symbol suspended the task by registering asynchronous work;
    /// resumption happens via the task's event session watcher, which
    /// re-enters the filters stage handler.
    Suspended,
}

/// Sink wrapper live for the duration of a single symbol callback.
///
/// Tracks whether the callback actually inserted a result — frequency is
/// only bumped on activation, not on callback entry (spec §4.4) — and
/// suppresses the insertion from `Task::results` for `Ghost` symbols,
/// whose invariant (spec §3) is that they never appear in results even
/// though they schedule and execute like any other real symbol.
struct ActivationTracker<'a> {
    task: &'a mut Task,
    cache: &'a SymbolCache,
    suppress_result: bool,
    activated: bool,
    /// Symbol ids already credited with an activation during this
    /// callback invocation, so a callback that calls `insert_result`
    /// under the same name for several metrics only bumps that symbol's
    /// frequency once per task (spec §8: "frequency(s) equals the number
    /// of *tasks* in which insert_result referenced s", not the number of
    /// calls).
    counted: std::collections::HashSet<SymbolId>,
}

impl ResultSink for ActivationTracker<'_> {
    fn insert_result(&mut self, metric: &str, symbol_name: &str, multiplier: f64, options: Vec<String>) {
        self.activated = true;
        // Frequency tracks the symbol *referenced by name*, not the
        // symbol whose callback is executing — a real parent's callback
        // inserting a virtual child's name must bump the child's own
        // frequency (spec §4.4/§4.5), not the parent's a second time.
        if let Some(&id) = self.cache.names.get(symbol_name) {
            if self.counted.insert(id) {
                self.cache.symbols[id].stats.record_activation(now_micros());
            }
        }
        if !self.suppress_result {
            self.task.insert_result(metric, symbol_name, multiplier, options);
        }
    }

    fn set_pre_result(&mut self, action: PreResultAction, message: Option<String>) {
        self.task.set_pre_result(action, message);
    }
}

enum RunOutcome {
    Ran,
    Suspended,
    Deferred,
    Skipped,
}

/// Run (or resume) the symbol-cache scheduler for `task` against `cache`.
///
/// A task that was previously suspended must be re-entered with the same
/// `cache` it started with; the checkpoint's symbol-id bitset is sized to
/// that cache's generation and is not validated against a different one.
pub fn run(task: &mut Task, cache: &SymbolCache, config: &CoreConfig) -> SchedulerOutcome {
    let mut checkpoint = task
        .checkpoint
        .take()
        .unwrap_or_else(|| SchedulerCheckpoint::fresh(cache.symbols.len()));

    loop {
        if task.deadline_exceeded() {
            return SchedulerOutcome::Complete;
        }

        if checkpoint.cursor >= cache.order.ids.len() {
            if checkpoint.waiting.is_empty() {
                return SchedulerOutcome::Complete;
            }
            match revisit_waiting_list(task, cache, config, &mut checkpoint) {
                WaitingRevisit::Suspended => {
                    task.checkpoint = Some(checkpoint);
                    return SchedulerOutcome::Suspended;
                }
                WaitingRevisit::NoProgress => {
                    // A full pass over the waiting-list made no progress:
                    // the remaining waiters are unresolvable. Mark them
                    // executed so nothing downstream blocks on them
                    // forever and end the stage (spec §4.4 step 6).
                    for id in checkpoint.waiting.drain(..) {
                        tracing::warn!(symbol = %cache.symbols[id].name, "symbol dependencies unresolvable, giving up");
                        checkpoint.executed[id] = true;
                    }
                    return SchedulerOutcome::Complete;
                }
                WaitingRevisit::Progressed => {}
            }
            continue;
        }

        let id = cache.order.ids[checkpoint.cursor];
        checkpoint.cursor += 1;

        match dispatch(task, cache, config, &checkpoint, id) {
            RunOutcome::Ran => checkpoint.executed[id] = true,
            RunOutcome::Suspended => {
                checkpoint.executed[id] = true;
                task.checkpoint = Some(checkpoint);
                return SchedulerOutcome::Suspended;
            }
            RunOutcome::Deferred => checkpoint.waiting.push_back(id),
            RunOutcome::Skipped => {}
        }
    }
}

/// Outcome of one pass over the waiting-list.
enum WaitingRevisit {
    /// At least one waiter ran to completion; worth another pass.
    Progressed,
    /// Nothing in this pass became runnable.
    NoProgress,
    /// A waiter suspended the task; the caller halts immediately and
    /// leaves any unvisited waiters queued for the next resumption.
    Suspended,
}

/// Revisit the waiting-list once (spec §4.4 step 6: "if the waiting-list
/// is non-empty and any progress was made, revisit waiters").
fn revisit_waiting_list(
    task: &mut Task,
    cache: &SymbolCache,
    config: &CoreConfig,
    checkpoint: &mut SchedulerCheckpoint,
) -> WaitingRevisit {
    let pending: Vec<SymbolId> = checkpoint.waiting.drain(..).collect();
    let mut progressed = false;

    for (index, id) in pending.iter().copied().enumerate() {
        match dispatch(task, cache, config, checkpoint, id) {
            RunOutcome::Ran => {
                checkpoint.executed[id] = true;
                progressed = true;
            }
            RunOutcome::Suspended => {
                checkpoint.executed[id] = true;
                // Anything from this pass not yet revisited goes back
                // onto the waiting-list so it is not lost.
                checkpoint.waiting.extend(&pending[index + 1..]);
                return WaitingRevisit::Suspended;
            }
            RunOutcome::Deferred => checkpoint.waiting.push_back(id),
            RunOutcome::Skipped => {}
        }
    }

    if progressed {
        WaitingRevisit::Progressed
    } else {
        WaitingRevisit::NoProgress
    }
}

/// Whether a dependency target has progressed far enough to unblock a
/// dependent waiting on it.
///
/// A real symbol satisfies this once its callback has run, tracked by
/// `checkpoint.executed`. A virtual symbol is never scheduled directly —
/// `dispatch` skips it on sight — so its own `executed` bit never sets;
/// per spec §4.4's "Dependency target types" ("the waiting predicate
/// remains by-name to preserve user intent"), it is satisfied once its
/// name has actually been activated by its real parent's callback. A
/// virtual that its parent never activates leaves the dependent deferred
/// forever, same as any other unresolvable wait, and is swept up by the
/// waiting-list's give-up pass (spec §4.4 step 6).
fn dependency_satisfied(task: &Task, cache: &SymbolCache, checkpoint: &SchedulerCheckpoint, dep: SymbolId) -> bool {
    match cache.symbols[dep].kind {
        SymbolKind::Virtual(_) => task
            .results
            .values()
            .any(|metric| metric.activations.contains_key(cache.symbols[dep].name.as_str())),
        _ => checkpoint.executed[dep],
    }
}

fn dispatch(
    task: &mut Task,
    cache: &SymbolCache,
    config: &CoreConfig,
    checkpoint: &SchedulerCheckpoint,
    id: SymbolId,
) -> RunOutcome {
    let symbol = &cache.symbols[id];

    if matches!(symbol.kind, SymbolKind::Virtual(_) | SymbolKind::Composite) {
        return RunOutcome::Skipped;
    }

    if symbol.fine && !task.has_any_activation() {
        return RunOutcome::Deferred;
    }

    if symbol.dependencies.iter().any(|&dep| !dependency_satisfied(task, cache, checkpoint, dep)) {
        return RunOutcome::Deferred;
    }

    let Some(callback) = symbol.callback.clone() else {
        return RunOutcome::Ran;
    };

    let suppress_result = matches!(symbol.kind, SymbolKind::Ghost);
    let session = task.event_session.clone();
    let pending_before = session.pending_count();
    let start = Instant::now();

    let activated = {
        let mut tracker = ActivationTracker {
            task,
            cache,
            suppress_result,
            activated: false,
            counted: std::collections::HashSet::new(),
        };
        callback(&mut tracker, &session);
        tracker.activated
    };

    let suspended = session.pending_count() > pending_before;

    if activated {
        task.note_activation();
    }

    if suspended {
        return RunOutcome::Suspended;
    }

    symbol.stats.record_duration(elapsed_micros(start), config.avg_time_alpha);
    RunOutcome::Ran
}

pub(crate) fn now_micros() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn elapsed_micros(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::ordering;
    use crate::symbol::registry::{SymbolCache, SymbolRegistry};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    fn make_cache(registry: SymbolRegistry) -> SymbolCache {
        let symbols = registry.post_load(true).unwrap();
        let order = ordering::build(&symbols);
        let names = symbols.iter().map(|s| (s.name.clone(), s.id)).collect();
        SymbolCache { symbols, names, order }
    }

    #[test]
    fn simple_pipeline_activates_both_symbols() {
        let mut reg = SymbolRegistry::new();
        reg.register(
            "R1",
            0,
            1.0,
            SymbolKind::Normal,
            false,
            Some(Arc::new(|sink: &mut dyn ResultSink, _session| {
                sink.insert_result("default", "R1", 1.0, vec![]);
            })),
        )
        .unwrap();
        reg.register(
            "R2",
            0,
            2.0,
            SymbolKind::Normal,
            false,
            Some(Arc::new(|sink: &mut dyn ResultSink, _session| {
                sink.insert_result("default", "R2", 1.0, vec![]);
            })),
        )
        .unwrap();
        let cache = make_cache(reg);

        let mut task = Task::new(vec![]);
        let config = CoreConfig::default();
        let outcome = run(&mut task, &cache, &config);

        assert_eq!(outcome, SchedulerOutcome::Complete);
        assert!(task.results["default"].activations.contains_key("R1"));
        assert!(task.results["default"].activations.contains_key("R2"));
    }

    #[test]
    fn dependency_runs_before_dependent() {
        let seen_a_first = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&seen_a_first);

        let mut reg = SymbolRegistry::new();
        reg.register(
            "A",
            0,
            0.0,
            SymbolKind::Normal,
            false,
            Some(Arc::new(move |sink: &mut dyn ResultSink, _session| {
                seen.fetch_add(1, AtomicOrdering::SeqCst);
                sink.insert_result("default", "A", 1.0, vec![]);
            })),
        )
        .unwrap();
        let seen_in_b = Arc::clone(&seen_a_first);
        reg.register(
            "B",
            10,
            0.0,
            SymbolKind::Normal,
            false,
            Some(Arc::new(move |sink: &mut dyn ResultSink, _session| {
                assert_eq!(seen_in_b.load(AtomicOrdering::SeqCst), 1, "A must run before B");
                sink.insert_result("default", "B", 1.0, vec![]);
            })),
        )
        .unwrap();
        reg.add_dependency(1, "A");
        let cache = make_cache(reg);

        let mut task = Task::new(vec![]);
        let config = CoreConfig::default();
        assert_eq!(run(&mut task, &cache, &config), SchedulerOutcome::Complete);
    }

    #[test]
    fn async_suspension_resumes_from_next_symbol() {
        let mut reg = SymbolRegistry::new();
        reg.register(
            "SUSPENDS",
            0,
            0.0,
            SymbolKind::Normal,
            false,
            Some(Arc::new(|sink: &mut dyn ResultSink, session: &crate::session::EventSession| {
                session.add();
                sink.insert_result("default", "SUSPENDS", 1.0, vec![]);
            })),
        )
        .unwrap();
        reg.register(
            "AFTER",
            0,
            0.0,
            SymbolKind::Normal,
            false,
            Some(Arc::new(|sink: &mut dyn ResultSink, _session| {
                sink.insert_result("default", "AFTER", 1.0, vec![]);
            })),
        )
        .unwrap();
        let cache = make_cache(reg);

        let mut task = Task::new(vec![]);
        let config = CoreConfig::default();
        let outcome = run(&mut task, &cache, &config);
        assert_eq!(outcome, SchedulerOutcome::Suspended);
        assert!(task.results.get("default").is_none_or(|m| !m.activations.contains_key("AFTER")));

        // Simulate the async operation completing.
        task.event_session.remove();
        let outcome = run(&mut task, &cache, &config);
        assert_eq!(outcome, SchedulerOutcome::Complete);
        assert!(task.results["default"].activations.contains_key("AFTER"));
    }

    #[test]
    fn fine_symbol_does_not_run_with_no_other_activation() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);

        let mut reg = SymbolRegistry::new();
        reg.register(
            "FINE",
            0,
            0.0,
            SymbolKind::Normal,
            true,
            Some(Arc::new(move |sink: &mut dyn ResultSink, _session| {
                ran_clone.fetch_add(1, AtomicOrdering::SeqCst);
                sink.insert_result("default", "FINE", 1.0, vec![]);
            })),
        )
        .unwrap();
        let cache = make_cache(reg);

        let mut task = Task::new(vec![]);
        let config = CoreConfig::default();
        assert_eq!(run(&mut task, &cache, &config), SchedulerOutcome::Complete);
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn fine_symbol_runs_after_another_activation() {
        let mut reg = SymbolRegistry::new();
        reg.register(
            "TRIGGER",
            10,
            0.0,
            SymbolKind::Normal,
            false,
            Some(Arc::new(|sink: &mut dyn ResultSink, _session| {
                sink.insert_result("default", "TRIGGER", 1.0, vec![]);
            })),
        )
        .unwrap();
        reg.register(
            "FINE",
            0,
            0.0,
            SymbolKind::Normal,
            true,
            Some(Arc::new(|sink: &mut dyn ResultSink, _session| {
                sink.insert_result("default", "FINE", 1.0, vec![]);
            })),
        )
        .unwrap();
        let cache = make_cache(reg);

        let mut task = Task::new(vec![]);
        let config = CoreConfig::default();
        assert_eq!(run(&mut task, &cache, &config), SchedulerOutcome::Complete);
        assert!(task.results["default"].activations.contains_key("FINE"));
    }

    #[test]
    fn ghost_symbol_executes_but_never_appears_in_results() {
        let mut reg = SymbolRegistry::new();
        reg.register(
            "GHOST",
            0,
            1.0,
            SymbolKind::Ghost,
            false,
            Some(Arc::new(|sink: &mut dyn ResultSink, _session| {
                sink.insert_result("default", "GHOST", 1.0, vec![]);
            })),
        )
        .unwrap();
        let cache = make_cache(reg);

        let mut task = Task::new(vec![]);
        let config = CoreConfig::default();
        assert_eq!(run(&mut task, &cache, &config), SchedulerOutcome::Complete);
        assert!(task.results.get("default").is_none_or(|m| !m.activations.contains_key("GHOST")));
        assert_eq!(cache.symbols[0].stats.frequency(), 1);
    }

    #[test]
    fn virtual_symbol_never_scheduled_directly() {
        let mut reg = SymbolRegistry::new();
        let parent = reg
            .register(
                "PARENT",
                0,
                1.0,
                SymbolKind::Normal,
                false,
                Some(Arc::new(|sink: &mut dyn ResultSink, _session| {
                    sink.insert_result("default", "PARENT", 1.0, vec![]);
                    sink.insert_result("default", "CHILD", 1.0, vec![]);
                })),
            )
            .unwrap();
        reg.register("CHILD", 0, 1.0, SymbolKind::Virtual(parent), false, None)
            .unwrap();
        let cache = make_cache(reg);

        let mut task = Task::new(vec![]);
        let config = CoreConfig::default();
        assert_eq!(run(&mut task, &cache, &config), SchedulerOutcome::Complete);
        assert!(task.results["default"].activations.contains_key("CHILD"));
        let child_id = cache.names["CHILD"];
        assert_eq!(
            cache.symbols[child_id].stats.frequency(),
            1,
            "frequency must be tracked against the virtual referenced by name, not only its parent"
        );
    }

    #[test]
    fn dependency_on_virtual_symbol_runs_once_parent_activates_it() {
        let mut reg = SymbolRegistry::new();
        let parent = reg
            .register(
                "PARENT",
                10,
                1.0,
                SymbolKind::Normal,
                false,
                Some(Arc::new(|sink: &mut dyn ResultSink, _session| {
                    sink.insert_result("default", "PARENT", 1.0, vec![]);
                    sink.insert_result("default", "CHILD", 1.0, vec![]);
                })),
            )
            .unwrap();
        reg.register("CHILD", 0, 1.0, SymbolKind::Virtual(parent), false, None)
            .unwrap();
        reg.register(
            "DEPENDENT",
            0,
            1.0,
            SymbolKind::Normal,
            false,
            Some(Arc::new(|sink: &mut dyn ResultSink, _session| {
                sink.insert_result("default", "DEPENDENT", 1.0, vec![]);
            })),
        )
        .unwrap();
        reg.add_dependency(2, "CHILD");
        let cache = make_cache(reg);

        let mut task = Task::new(vec![]);
        let config = CoreConfig::default();
        assert_eq!(run(&mut task, &cache, &config), SchedulerOutcome::Complete);
        assert!(
            task.results["default"].activations.contains_key("DEPENDENT"),
            "a dependent on a virtual symbol must run once that virtual's real parent activates it"
        );
    }

    #[test]
    fn callback_less_real_symbol_still_marks_executed_for_dependents() {
        // A real symbol may be registered with no callback at all (pure
        // ordering placeholder); it must still satisfy dependents.
        let mut reg = SymbolRegistry::new();
        reg.register("A", 0, 0.0, SymbolKind::Normal, false, None).unwrap();
        reg.register(
            "B",
            0,
            0.0,
            SymbolKind::Normal,
            false,
            Some(Arc::new(|sink: &mut dyn ResultSink, _session| {
                sink.insert_result("default", "B", 1.0, vec![]);
            })),
        )
        .unwrap();
        reg.add_dependency(1, "A");
        let cache = make_cache(reg);

        let mut task = Task::new(vec![]);
        let config = CoreConfig::default();
        assert_eq!(run(&mut task, &cache, &config), SchedulerOutcome::Complete);
        assert!(task.results["default"].activations.contains_key("B"));
    }
}
