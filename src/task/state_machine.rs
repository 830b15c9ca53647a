//! `advance()`: the re-entrant stage driver (spec §4.3).
//!
//! Ported close to the control flow of rspamd's `rspamd_task_process`/
//! `rspamd_task_select_processing_stage` (see `DESIGN.md`), but expressed
//! as an explicit loop with a single re-entrancy guard rather than tail
//! recursion through a synchronous-completion callback chain.

use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::scheduler::{self, SchedulerOutcome};
use crate::symbol::registry::SymbolCache;
use crate::task::model::{flags, Stage, Task};

/// Hooks the embedding host supplies for the stages this crate does not
/// implement itself (spec §6): MIME parsing, pre-/post-filter hooks, and
/// the statistical classifier. Each is handed the task and runs to
/// synchronous completion or after registering outstanding work on the
/// task's event session — `advance` only suspends for the `filters`
/// stage (spec §5); a hook that starts async work it wants `advance` to
/// wait on must still return, having called `task.event_session.add()`
/// itself.
///
/// Composite-symbol evaluation (spec §4.4) is *not* a hook — it is
/// dispatched internally by `crate::composite::run` before
/// `StageHooks::composites` runs, so `composites` here is only the
/// host's further, configuration-specific suppression pass.
pub trait StageHooks {
    /// Parse the raw message and populate whatever part/text-part state
    /// the host's MIME layer needs. `Err` is terminal for this task (spec
    /// §4.3's "read-message" row): it is recorded on `task.error` and the
    /// task is routed straight to `done`.
    fn read_message(&self, task: &mut Task) -> Result<(), CoreError>;

    /// Run registered pre-filter hooks. Errors are logged by the host and
    /// never fail the task.
    fn pre_filters(&self, task: &mut Task);

    /// Invoke the statistical classifier backend. Non-fatal.
    fn classifiers(&self, task: &mut Task);

    /// Host-specific symbol suppression per configuration, run after
    /// this crate's own composite-symbol dispatch. Non-fatal.
    fn composites(&self, task: &mut Task);

    /// Run registered post-filter hooks. Non-fatal.
    fn post_filters(&self, task: &mut Task);
}

/// Advance `task` through every stage named in `requested` that its
/// `processed_stages` has not already reached, stopping when the task
/// suspends, finishes, is skipped, or runs out of requested work.
///
/// Returns `false` only when `read_message` fails; every other path,
/// including re-entrant no-ops and mid-flight suspension, returns `true`
/// (spec §8's re-entry-safety property: "the returned value is `true`").
pub fn advance(task: &mut Task, cache: &SymbolCache, config: &CoreConfig, hooks: &dyn StageHooks, requested: u32) -> bool {
    if task.has_flag(flags::PROCESSING) {
        return true;
    }

    task.set_flag(flags::PROCESSING);
    let outcome = drive(task, cache, config, hooks, requested);
    task.clear_flag(flags::PROCESSING);
    outcome
}

fn drive(task: &mut Task, cache: &SymbolCache, config: &CoreConfig, hooks: &dyn StageHooks, requested: u32) -> bool {
    loop {
        if task.is_done() || task.is_skipped() {
            return true;
        }

        if task.deadline_exceeded() {
            let resume_at = next_unprocessed_stage(task).unwrap_or(Stage::Done);
            task.error = Some(CoreError::Timeout);
            task.skip_from(resume_at);
            continue;
        }

        let Some(stage) = next_requested_stage(task, requested) else {
            return true;
        };

        match stage {
            Stage::ReadMessage => match hooks.read_message(task) {
                Ok(()) => task.mark_stage_done(Stage::ReadMessage),
                Err(err) => {
                    task.error = Some(err);
                    task.skip_from(Stage::ReadMessage);
                    return false;
                }
            },
            Stage::PreFilters => {
                hooks.pre_filters(task);
                task.mark_stage_done(Stage::PreFilters);
                if should_skip_remaining(task, config) {
                    task.skip_from(Stage::Filters);
                    continue;
                }
            }
            Stage::Filters => match scheduler::run(task, cache, config) {
                SchedulerOutcome::Complete => task.mark_stage_done(Stage::Filters),
                SchedulerOutcome::Suspended => return true,
            },
            Stage::Classifiers => {
                hooks.classifiers(task);
                task.mark_stage_done(Stage::Classifiers);
            }
            Stage::Composites => {
                crate::composite::run(task, cache);
                hooks.composites(task);
                task.mark_stage_done(Stage::Composites);
            }
            Stage::PostFilters => {
                hooks.post_filters(task);
                task.mark_stage_done(Stage::PostFilters);
            }
            Stage::Done => {
                task.mark_stage_done(Stage::Done);
                task.set_flag(flags::PROCESSED);
                return true;
            }
        }

        if task.event_session.has_pending() {
            return true;
        }
    }
}

/// Whether the pre-result set so far should short-circuit remaining
/// filter work (spec §4.3 "Skipping"). A host that set `PASS_ALL` on the
/// task, or whose configuration has `check_all_filters` on, always runs
/// every stage regardless of the pre-result.
fn should_skip_remaining(task: &Task, config: &CoreConfig) -> bool {
    if config.check_all_filters || task.has_flag(flags::PASS_ALL) {
        return false;
    }
    task.pre_result().is_some_and(|r| r.action.is_terminal())
}

fn next_unprocessed_stage(task: &Task) -> Option<Stage> {
    Stage::ORDER.into_iter().find(|stage| !task.has_stage(*stage))
}

fn next_requested_stage(task: &Task, requested: u32) -> Option<Stage> {
    Stage::ORDER
        .into_iter()
        .find(|stage| !task.has_stage(*stage) && stage.bit() & requested != 0)
}
