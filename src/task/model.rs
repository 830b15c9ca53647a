//! The `Task`: one in-flight message working its way through the
//! pipeline (spec §3).
//!
//! Grounded on `domain/models/task.rs`'s builder-method (`with_*`) style
//! and its `TaskStatus` transition discipline, generalized from a single
//! enum status to the monotone `processed_stages` bit lattice spec §3
//! requires (a message can be "past pre-filters but not yet past
//! classifiers" in a way a single enum cannot express).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::aggregator::{MetricResult, PreResultAction, PreResultSlot, ResultSink};
use crate::arena::TaskArena;
use crate::error::CoreError;
use crate::scheduler::SchedulerCheckpoint;
use crate::session::EventSession;

/// One bit per pipeline stage, in execution order. `processed_stages`
/// accumulates these monotonically; `Done` is the terminal bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Stage {
    ReadMessage = 1 << 0,
    PreFilters = 1 << 1,
    Filters = 1 << 2,
    Classifiers = 1 << 3,
    Composites = 1 << 4,
    PostFilters = 1 << 5,
    Done = 1 << 6,
}

impl Stage {
    /// All stages, in the fixed execution order spec §2 names.
    pub const ORDER: [Stage; 7] = [
        Stage::ReadMessage,
        Stage::PreFilters,
        Stage::Filters,
        Stage::Classifiers,
        Stage::Composites,
        Stage::PostFilters,
        Stage::Done,
    ];

    #[must_use]
    pub const fn bit(self) -> u32 {
        self as u32
    }
}

/// Bitmask with every stage bit set; the default `requested_stages_mask`
/// argument to [`crate::task::state_machine::advance`] for a host that
/// wants to drive a task straight through to `done`.
pub const ALL_STAGES: u32 = Stage::ReadMessage as u32
    | Stage::PreFilters as u32
    | Stage::Filters as u32
    | Stage::Classifiers as u32
    | Stage::Composites as u32
    | Stage::PostFilters as u32
    | Stage::Done as u32;

/// Task-level flags, a separate bitmask from `processed_stages` (spec
/// §3). Unlike stages, flags are not monotone: `Processing` toggles on
/// and off around every `advance` call.
pub mod flags {
    pub const PROCESSING: u32 = 1 << 0;
    pub const SKIPPED: u32 = 1 << 1;
    pub const PASS_ALL: u32 = 1 << 2;
    pub const PROCESSED: u32 = 1 << 3;
    pub const HAS_PRE_RESULT: u32 = 1 << 4;
    pub const FILE_BACKED: u32 = 1 << 5;
}

/// The regex-result memo: per task, a cache from a regex-key string to a
/// 31-bit packed result plus a "seen" bit, so a regex that many symbols
/// reference is only ever evaluated once per task. The packed value's
/// upper bit is reserved as the seen flag; only the low 31 bits are
/// caller-visible, matching the original's bitfield layout.
#[derive(Debug, Clone, Default)]
pub struct RegexCache {
    entries: HashMap<String, u32>,
}

const SEEN_BIT: u32 = 1 << 31;
const VALUE_MASK: u32 = SEEN_BIT - 1;

impl RegexCache {
    /// Look up a previously memoized result. Returns `None` if this key
    /// was never stored.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<u32> {
        self.entries.get(key).map(|packed| packed & VALUE_MASK)
    }

    /// Whether `key` has ever been stored, regardless of its value.
    #[must_use]
    pub fn has_seen(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Store a result, truncated to 31 bits, and mark it seen.
    pub fn set(&mut self, key: impl Into<String>, value: u32) {
        self.entries.insert(key.into(), (value & VALUE_MASK) | SEEN_BIT);
    }
}

/// One in-flight message (spec §3).
pub struct Task {
    pub id: Uuid,
    pub arena: TaskArena,
    pub message: Vec<u8>,
    processed_stages: u32,
    flags: u32,
    pub results: HashMap<String, MetricResult>,
    pub regex_cache: RegexCache,
    pub(crate) checkpoint: Option<SchedulerCheckpoint>,
    /// Wrapped in `Arc` so the scheduler can clone a handle to pass into
    /// a symbol callback without holding a borrow of the `Task` itself —
    /// the callback also receives a `&mut dyn ResultSink` borrowed from
    /// the same task, which a plain `&EventSession` field could not
    /// coexist with under the borrow checker.
    pub event_session: Arc<EventSession>,
    pre_result: PreResultSlot,
    pub error: Option<CoreError>,
    pub deadline: Option<Instant>,
    activation_count: u32,
}

impl Task {
    /// Begin a task for a raw message, with no deadline.
    #[must_use]
    pub fn new(message: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            arena: TaskArena::new(),
            message,
            processed_stages: 0,
            flags: 0,
            results: HashMap::new(),
            regex_cache: RegexCache::default(),
            checkpoint: None,
            event_session: Arc::new(EventSession::new()),
            pre_result: PreResultSlot::default(),
            error: None,
            deadline: None,
            activation_count: 0,
        }
    }

    /// Builder-style deadline attachment, matching this crate's other
    /// `with_*` constructors.
    #[must_use]
    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    #[must_use]
    pub fn with_pass_all(mut self, pass_all: bool) -> Self {
        if pass_all {
            self.flags |= flags::PASS_ALL;
        }
        self
    }

    #[must_use]
    pub fn processed_stages(&self) -> u32 {
        self.processed_stages
    }

    #[must_use]
    pub fn has_stage(&self, stage: Stage) -> bool {
        self.processed_stages & stage.bit() != 0
    }

    /// Mark a stage complete. `processed_stages` only ever gains bits —
    /// callers never clear one (spec §8's monotonicity invariant).
    pub(crate) fn mark_stage_done(&mut self, stage: Stage) {
        self.processed_stages |= stage.bit();
    }

    /// Mark every stage from `from` (inclusive) through `Done` complete
    /// without dispatching their handlers — used when skipping (spec
    /// §4.3).
    pub(crate) fn mark_remaining_done(&mut self, from: Stage) {
        let start = Stage::ORDER.iter().position(|s| *s == from).unwrap_or(0);
        for stage in &Stage::ORDER[start..] {
            self.mark_stage_done(*stage);
        }
    }

    #[must_use]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    #[must_use]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub(crate) fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub(crate) fn clear_flag(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.has_stage(Stage::Done)
    }

    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.has_flag(flags::SKIPPED)
    }

    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.has_flag(flags::PROCESSING)
    }

    /// Whether the task's deadline, if any, has already elapsed (spec
    /// §5's cancellation rule).
    #[must_use]
    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Mark the task skipped and fast-forward every remaining stage to
    /// done, without dispatching them. Used both by the pre-result
    /// short-circuit and by deadline expiry.
    pub(crate) fn skip_from(&mut self, from: Stage) {
        self.set_flag(flags::SKIPPED);
        self.mark_remaining_done(from);
    }

    /// Metric accumulator for `metric`, creating an unbounded,
    /// unweighted one on first use. Hosts that care about weights/bounds
    /// should pre-populate `results` via [`Task::ensure_metric`] before
    /// the filters stage runs.
    pub fn metric_mut(&mut self, metric: &str) -> &mut MetricResult {
        self.results.entry(metric.to_string()).or_default()
    }

    /// Pre-populate a metric with configured weights/bounds ahead of the
    /// filters stage (normally called once per task, right after
    /// construction, from the configured `CoreConfig::weights`/
    /// `score_bounds`).
    pub fn ensure_metric(&mut self, metric: impl Into<String>, result: MetricResult) {
        self.results.insert(metric.into(), result);
    }

    #[must_use]
    pub fn pre_result(&self) -> Option<&crate::aggregator::PreResult> {
        self.pre_result.get()
    }

    /// Whether at least one symbol has been activated in this task so
    /// far, the eligibility predicate for `fine` symbols (spec §4.4).
    #[must_use]
    pub fn has_any_activation(&self) -> bool {
        self.activation_count > 0
    }

    /// Record that some symbol activated, for `fine`-symbol eligibility
    /// (spec §4.4). Called by the scheduler once per callback that
    /// actually inserted a result, whether or not that result ends up
    /// visible (a `ghost` symbol's activation still counts here even
    /// though its result is suppressed).
    pub(crate) fn note_activation(&mut self) {
        self.activation_count += 1;
    }
}

impl ResultSink for Task {
    fn insert_result(&mut self, metric: &str, symbol_name: &str, multiplier: f64, options: Vec<String>) {
        self.metric_mut(metric).insert_result(metric, symbol_name, multiplier, options);
    }

    fn set_pre_result(&mut self, action: PreResultAction, message: Option<String>) {
        self.pre_result.set(action, message);
        if self.pre_result.has_pre_result() {
            self.set_flag(flags::HAS_PRE_RESULT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `processed_stages` only ever gains bits: for any sequence of
    /// stages marked done (in any order, with repeats), every bit that
    /// was set before a call is still set after it.
    #[test_strategy::proptest]
    fn prop_processed_stages_is_monotone(#[strategy(proptest::collection::vec(0usize..7, 0..20))] picks: Vec<usize>) {
        let mut task = Task::new(vec![]);
        let mut previous_mask = task.processed_stages();
        for pick in picks {
            task.mark_stage_done(Stage::ORDER[pick]);
            let mask = task.processed_stages();
            proptest::prop_assert_eq!(mask & previous_mask, previous_mask);
            previous_mask = mask;
        }
    }

    #[test]
    fn new_task_has_no_stages_done() {
        let task = Task::new(b"hello".to_vec());
        assert_eq!(task.processed_stages(), 0);
        assert!(!task.is_done());
    }

    #[test]
    fn marking_a_stage_is_monotone() {
        let mut task = Task::new(vec![]);
        task.mark_stage_done(Stage::ReadMessage);
        assert!(task.has_stage(Stage::ReadMessage));
        assert!(!task.has_stage(Stage::Filters));
        task.mark_stage_done(Stage::Filters);
        assert!(task.has_stage(Stage::ReadMessage));
        assert!(task.has_stage(Stage::Filters));
    }

    #[test]
    fn skip_from_marks_all_remaining_stages_done() {
        let mut task = Task::new(vec![]);
        task.mark_stage_done(Stage::ReadMessage);
        task.mark_stage_done(Stage::PreFilters);
        task.skip_from(Stage::Filters);
        assert!(task.is_skipped());
        assert!(task.is_done());
        assert!(task.has_stage(Stage::Classifiers));
    }

    #[test]
    fn deadline_exceeded_is_false_with_generous_timeout() {
        let task = Task::new(vec![]).with_deadline(Duration::from_secs(60));
        assert!(!task.deadline_exceeded());
    }

    #[test]
    fn deadline_exceeded_is_true_once_elapsed() {
        let task = Task::new(vec![]).with_deadline(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(task.deadline_exceeded());
    }

    #[test]
    fn insert_result_sets_pre_result_flag_only_for_terminal_actions() {
        let mut task = Task::new(vec![]);
        task.set_pre_result(PreResultAction::NoAction, None);
        assert!(!task.has_flag(flags::HAS_PRE_RESULT));
        task.set_pre_result(PreResultAction::Reject, Some("spam".into()));
        assert!(task.has_flag(flags::HAS_PRE_RESULT));
        assert_eq!(task.pre_result().unwrap().action, PreResultAction::Reject);
    }

    #[test]
    fn regex_cache_round_trips_31_bit_values() {
        let mut cache = RegexCache::default();
        assert!(!cache.has_seen("foo"));
        cache.set("foo", 0x7FFF_FFFF);
        assert_eq!(cache.get("foo"), Some(0x7FFF_FFFF));
        assert!(cache.has_seen("foo"));
    }

    #[test]
    fn has_any_activation_tracks_noted_activations() {
        let mut task = Task::new(vec![]);
        assert!(!task.has_any_activation());
        task.note_activation();
        assert!(task.has_any_activation());
    }

    #[test]
    fn regex_cache_truncates_to_31_bits_on_store() {
        let mut cache = RegexCache::default();
        cache.set("k", 0xFFFF_FFFF);
        assert_eq!(cache.get("k"), Some(0x7FFF_FFFF));
    }
}
