//! Per-task, per-metric result aggregation (spec §4.5).

use std::collections::HashMap;

/// Terminal actions a pre-result may carry, ranked from least to most
/// severe. A higher-ranked action always overrides a lower one; setting
/// any non-`NoAction` value marks the task's `HAS_PRE_RESULT` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PreResultAction {
    NoAction,
    Greylist,
    SoftReject,
    AddHeader,
    RewriteSubject,
    Reject,
}

impl PreResultAction {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::NoAction
    }
}

/// One symbol's recorded activation within a metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub multiplier: f64,
    pub options: Vec<String>,
    pub metric: String,
}

/// A pending pre-result: a terminal action plus an optional explanatory
/// message.
#[derive(Debug, Clone, PartialEq)]
pub struct PreResult {
    pub action: PreResultAction,
    pub message: Option<String>,
}

/// Per-metric score accumulator. One `MetricResult` exists per metric
/// name a task's configuration declares.
#[derive(Debug, Clone, Default)]
pub struct MetricResult {
    pub activations: HashMap<String, Activation>,
    weights: HashMap<String, f64>,
    bounds: Option<(f64, f64)>,
}

impl MetricResult {
    #[must_use]
    pub fn new(weights: HashMap<String, f64>, bounds: Option<(f64, f64)>) -> Self {
        Self {
            activations: HashMap::new(),
            weights,
            bounds,
        }
    }

    /// Merge a new activation for `symbol_name` into this metric.
    ///
    /// Resolution of the Open Question on dedup semantics (see
    /// `DESIGN.md`): a repeat insertion for the same symbol concatenates
    /// option lists (deduplicated by exact string equality) and keeps
    /// whichever multiplier has the larger absolute value, preserving
    /// that multiplier's sign.
    pub fn insert_result(
        &mut self,
        metric: impl Into<String>,
        symbol_name: impl Into<String>,
        multiplier: f64,
        options: Vec<String>,
    ) {
        let metric = metric.into();
        let symbol_name = symbol_name.into();

        match self.activations.get_mut(&symbol_name) {
            Some(existing) => {
                if multiplier.abs() > existing.multiplier.abs() {
                    existing.multiplier = multiplier;
                }
                for option in options {
                    if !existing.options.contains(&option) {
                        existing.options.push(option);
                    }
                }
            }
            None => {
                self.activations.insert(
                    symbol_name,
                    Activation {
                        multiplier,
                        options,
                        metric,
                    },
                );
            }
        }
    }

    /// Total score: sum of `configured_weight(symbol) * multiplier` over
    /// every recorded activation, clamped to the metric's bounds if any
    /// are configured.
    #[must_use]
    pub fn score(&self) -> f64 {
        let raw: f64 = self
            .activations
            .iter()
            .map(|(name, activation)| self.weights.get(name).copied().unwrap_or(0.0) * activation.multiplier)
            .sum();

        match self.bounds {
            Some((min, max)) => raw.clamp(min, max),
            None => raw,
        }
    }
}

/// Sink a symbol callback uses to record its effect on the current task.
/// Implemented by the task's per-metric aggregator state (wired up in
/// `scheduler.rs`); kept as a trait so `symbol::registry::SymbolCallback`
/// does not need to depend on the concrete `Task` type.
pub trait ResultSink {
    fn insert_result(&mut self, metric: &str, symbol_name: &str, multiplier: f64, options: Vec<String>);
    fn set_pre_result(&mut self, action: PreResultAction, message: Option<String>);
}

/// Tracks the single active pre-result for a task, applying the
/// highest-ranked-wins rule.
#[derive(Debug, Clone, Default)]
pub struct PreResultSlot {
    current: Option<PreResult>,
}

impl PreResultSlot {
    /// Attempt to set a new pre-result. Only takes effect if `action`
    /// outranks whatever is currently set.
    pub fn set(&mut self, action: PreResultAction, message: Option<String>) {
        let should_replace = match &self.current {
            Some(existing) => action > existing.action,
            None => true,
        };
        if should_replace {
            self.current = Some(PreResult { action, message });
        }
    }

    #[must_use]
    pub fn get(&self) -> Option<&PreResult> {
        self.current.as_ref()
    }

    #[must_use]
    pub fn has_pre_result(&self) -> bool {
        self.current.as_ref().is_some_and(|r| r.action.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_sums_weighted_activations() {
        let mut weights = HashMap::new();
        weights.insert("SPAM".to_string(), 2.0);
        weights.insert("HAM".to_string(), -1.0);
        let mut metric = MetricResult::new(weights, None);

        metric.insert_result("default", "SPAM", 3.0, vec![]);
        metric.insert_result("default", "HAM", 1.0, vec![]);

        assert!((metric.score() - (2.0 * 3.0 + -1.0 * 1.0)).abs() < f64::EPSILON);
    }

    #[test]
    fn unscored_symbol_contributes_nothing() {
        let mut metric = MetricResult::new(HashMap::new(), None);
        metric.insert_result("default", "UNKNOWN", 5.0, vec![]);
        assert!((metric.score() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn score_clamps_to_bounds() {
        let mut weights = HashMap::new();
        weights.insert("SPAM".to_string(), 100.0);
        let mut metric = MetricResult::new(weights, Some((-10.0, 10.0)));
        metric.insert_result("default", "SPAM", 1.0, vec![]);
        assert!((metric.score() - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn repeat_insert_keeps_larger_magnitude_multiplier() {
        let mut metric = MetricResult::new(HashMap::new(), None);
        metric.insert_result("default", "SPAM", 1.0, vec![]);
        metric.insert_result("default", "SPAM", -3.0, vec![]);
        assert!((metric.activations["SPAM"].multiplier - -3.0).abs() < f64::EPSILON);

        metric.insert_result("default", "SPAM", 2.0, vec![]);
        assert!((metric.activations["SPAM"].multiplier - -3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn repeat_insert_merges_options_without_duplicates() {
        let mut metric = MetricResult::new(HashMap::new(), None);
        metric.insert_result("default", "SPAM", 1.0, vec!["a".into(), "b".into()]);
        metric.insert_result("default", "SPAM", 1.0, vec!["b".into(), "c".into()]);
        assert_eq!(
            metric.activations["SPAM"].options,
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn pre_result_only_overridden_by_higher_rank() {
        let mut slot = PreResultSlot::default();
        slot.set(PreResultAction::Greylist, None);
        assert_eq!(slot.get().unwrap().action, PreResultAction::Greylist);

        slot.set(PreResultAction::AddHeader, None);
        assert_eq!(slot.get().unwrap().action, PreResultAction::AddHeader);

        slot.set(PreResultAction::Greylist, None);
        assert_eq!(slot.get().unwrap().action, PreResultAction::AddHeader);
    }

    #[test]
    fn no_action_is_not_a_pre_result() {
        let mut slot = PreResultSlot::default();
        slot.set(PreResultAction::NoAction, None);
        assert!(!slot.has_pre_result());
    }

    #[test]
    fn reject_outranks_every_other_action() {
        let mut slot = PreResultSlot::default();
        for action in [
            PreResultAction::Greylist,
            PreResultAction::SoftReject,
            PreResultAction::AddHeader,
            PreResultAction::RewriteSubject,
        ] {
            slot.set(action, None);
        }
        slot.set(PreResultAction::Reject, None);
        assert_eq!(slot.get().unwrap().action, PreResultAction::Reject);
    }
}
