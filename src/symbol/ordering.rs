//! Offline execution-order computation (spec §4.4).
//!
//! The topological constraint is produced with Kahn's algorithm, the same
//! approach as `domain/models/dag.rs::TaskDag::topological_sort`; within
//! each topological level, ties are broken by a weighted rank composed
//! the way `services/priority_calculator.rs::PriorityCalculator::calculate`
//! composes a base score plus weighted boosts.

use std::collections::VecDeque;

use super::registry::{Symbol, SymbolId, SymbolKind};

/// Tunable coefficients for the rank formula. Not exposed via
/// `CoreConfig` (spec §9 only calls out `avg_time_alpha` as an Open
/// Question); kept as named constants here so the formula in
/// `SPEC_FULL.md` §4.4 is traceable line-for-line.
const C_WEIGHT: f64 = 1.0;
const C_FREQUENCY: f64 = 500.0;
const C_TIME: f64 = 200.0;
const C_PRIORITY: f64 = 1000.0;

/// The computed, immutable execution order for a post-loaded symbol
/// cache: a dense vector of ids, topologically valid, ranked within each
/// level. Virtual and composite symbols are excluded — they are never
/// scheduled directly (spec §4.4).
#[derive(Debug, Clone)]
pub struct ExecutionOrder {
    pub ids: Vec<SymbolId>,
}

impl ExecutionOrder {
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

fn rank(symbol: &Symbol, max_frequency: f64, max_avg_time: f64) -> f64 {
    let weight_factor = symbol.weight.abs() * C_WEIGHT;

    let freq_factor = if max_frequency > 0.0 {
        -(symbol.stats.frequency() as f64) / max_frequency * C_FREQUENCY
    } else {
        0.0
    };

    let time_factor = if max_avg_time > 0.0 {
        -symbol.stats.avg_time_us() / max_avg_time * C_TIME
    } else {
        0.0
    };

    weight_factor + freq_factor + time_factor + f64::from(symbol.priority) * C_PRIORITY
}

/// Build the execution order for a fully post-loaded symbol table.
///
/// Precondition: `symbols` is acyclic (enforced by
/// `SymbolRegistry::post_load` before this is called).
#[must_use]
pub fn build(symbols: &[Symbol]) -> ExecutionOrder {
    let n = symbols.len();
    let mut in_degree = vec![0usize; n];
    // in_degree[i] is simply the length of i's own dependency list.
    for (i, symbol) in symbols.iter().enumerate() {
        in_degree[i] = symbol.dependencies.len();
    }

    // dependents[d] = set of symbols that list d as a dependency.
    let mut dependents: Vec<Vec<SymbolId>> = vec![Vec::new(); n];
    for (i, symbol) in symbols.iter().enumerate() {
        for &dep in &symbol.dependencies {
            dependents[dep].push(i);
        }
    }

    let max_frequency = symbols
        .iter()
        .map(|s| s.stats.frequency() as f64)
        .fold(0.0, f64::max);
    let max_avg_time = symbols
        .iter()
        .map(|s| s.stats.avg_time_us())
        .fold(0.0, f64::max);

    let schedulable = |id: SymbolId| symbols[id].is_scheduled_directly();

    let mut ready: VecDeque<SymbolId> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    let mut remaining = in_degree;

    while !ready.is_empty() {
        // Stable-sort the current ready frontier by rank (descending:
        // higher rank runs earlier), breaking ties by registration id so
        // ordering is deterministic.
        let mut frontier: Vec<SymbolId> = ready.drain(..).collect();
        frontier.sort_by(|&a, &b| {
            let ra = rank(&symbols[a], max_frequency, max_avg_time);
            let rb = rank(&symbols[b], max_frequency, max_avg_time);
            rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal).then(a.cmp(&b))
        });

        for id in frontier {
            if schedulable(id) {
                order.push(id);
            }
            for &dependent in &dependents[id] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.push_back(dependent);
                }
            }
        }
    }

    ExecutionOrder { ids: order }
}
