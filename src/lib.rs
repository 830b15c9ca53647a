//! mail-filter-core — the task state machine and symbol-cache scheduler
//! at the heart of a mail-filter daemon's per-message processing engine.
//!
//! This crate owns exactly the pieces named in its originating
//! specification's hard-engineering core: a re-entrant staged pipeline
//! (`task`), a scheduler for dozens-to-hundreds of named symbol
//! callbacks with priorities, dependencies, and runtime weighting
//! (`symbol`, `scheduler`), a score aggregator that tolerates partial
//! failure (`aggregator`), and the supporting arena/event-session/
//! persistence/config/logging ambient stack. MIME parsing, the wire
//! protocol, statistical classifier backends, and embedded scripting are
//! external collaborators the host wires in through [`task::StageHooks`]
//! and symbol callbacks — this crate only consumes their results.
//!
//! ```text
//! read-message -> pre-filters -> filters -> classifiers
//!              -> composites -> post-filters -> done
//! ```
//!
//! The `filters` stage is where [`scheduler`] walks the offline execution
//! order built by [`symbol::ordering`], invoking each symbol's callback
//! and recording activations into a [`task::Task`]'s per-metric
//! [`aggregator::MetricResult`]s.

pub mod aggregator;
pub mod arena;
pub mod composite;
pub mod config;
pub mod error;
pub mod logging;
pub mod persistence;
pub mod saver;
pub mod scheduler;
pub mod session;
pub mod symbol;
pub mod task;

pub use aggregator::{Activation, MetricResult, PreResult, PreResultAction, PreResultSlot, ResultSink};
pub use arena::TaskArena;
pub use composite::CompositeExpr;
pub use config::{ConfigError, ConfigLoader, CoreConfig, ScoreBounds};
pub use error::CoreError;
pub use saver::{PeriodicSaver, SaverHandle, SaverStatus};
pub use scheduler::{SchedulerCheckpoint, SchedulerOutcome};
pub use session::EventSession;
pub use symbol::{ExecutionOrder, Symbol, SymbolCache, SymbolId, SymbolKind, SymbolRegistry, SymbolStats};
pub use task::{advance, flags, Stage, StageHooks, Task, ALL_STAGES};

/// Build a fully post-loaded, execution-ordered [`SymbolCache`] from a
/// [`SymbolRegistry`], optionally restoring statistics persisted by a
/// previous run.
///
/// This is the one entry point that wires together registration
/// (§4.2), post-load resolution (§4.2), execution-order computation
/// (§4.4), and the persisted-stats round trip (§4.6) a host needs before
/// it can drive any [`task::Task`] through [`task::advance`].
///
/// # Errors
/// Propagates any [`CoreError`] from [`SymbolRegistry::post_load`]
/// (duplicate names, unresolved strict dependencies, cycles) or from
/// reading the cache file.
pub fn build_symbol_cache(registry: SymbolRegistry, config: &CoreConfig) -> Result<SymbolCache, CoreError> {
    let symbols = registry.post_load(config.strict_symbols)?;
    let records = persistence::read_cache_file(&config.cache_file)?;
    persistence::restore_into(&symbols, &records);

    let order = symbol::ordering::build(&symbols);
    let names = symbols.iter().map(|s| (s.name.clone(), s.id)).collect();
    Ok(SymbolCache { symbols, names, order })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_symbol_cache_resolves_and_orders_registered_symbols() {
        let mut registry = SymbolRegistry::new();
        registry.register("A", 0, 1.0, SymbolKind::Normal, false, None).unwrap();
        registry.register("B", 10, 1.0, SymbolKind::Normal, false, None).unwrap();
        registry.add_dependency(0, "B");

        let config = CoreConfig::default();
        let cache = build_symbol_cache(registry, &config).unwrap();

        assert_eq!(cache.order.len(), 2);
        let pos_a = cache.order.ids.iter().position(|&id| id == cache.names["A"]).unwrap();
        let pos_b = cache.order.ids.iter().position(|&id| id == cache.names["B"]).unwrap();
        assert!(pos_b < pos_a, "B must run before its dependent A");
    }

    #[test]
    fn build_symbol_cache_surfaces_cycle_errors() {
        let mut registry = SymbolRegistry::new();
        registry.register("X", 0, 1.0, SymbolKind::Normal, false, None).unwrap();
        registry.register("Y", 0, 1.0, SymbolKind::Normal, false, None).unwrap();
        registry.add_dependency(0, "Y");
        registry.add_dependency(1, "X");

        let config = CoreConfig::default();
        let err = build_symbol_cache(registry, &config).unwrap_err();
        assert!(matches!(err, CoreError::DependencyCycle(_)));
    }
}
