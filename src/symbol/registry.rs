//! Process-wide symbol registration.
//!
//! Grounded on `domain/models/dag.rs`'s `TaskDag` (cycle detection via
//! DFS, `DagError` taxonomy) and `services/dependency_resolver.rs`'s
//! delayed-edge handling, generalized from task dependencies to named
//! symbol dependencies as rspamd's `symbols_cache.h` describes
//! (`add_symbol`/`add_dependency`/`add_delayed_dependency`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::CoreError;

/// Stable integer id assigned at registration; used as a dense array
/// index everywhere ordering and execution state are tracked.
pub type SymbolId = usize;

/// Callback invoked when a symbol runs. Receives a sink for recording
/// activations/pre-results and a handle to the task's event session so it
/// can register outstanding asynchronous work before returning.
pub type SymbolCallback =
    Arc<dyn Fn(&mut dyn crate::aggregator::ResultSink, &crate::session::EventSession) + Send + Sync>;

/// What kind of symbol this is. Unlike the original's bitflag
/// (`SYMBOL_TYPE_NORMAL`/`_VIRTUAL`/`_CALLBACK`/`_GHOST`/`_COMPOSITE`),
/// `Normal`/`Virtual`/`Callback`/`Ghost`/`Composite` are mutually
/// exclusive here — they describe what a symbol *is*. Whether it is
/// additionally `fine` (runs only once something else has activated) is
/// an orthogonal property, matching `SYMBOL_TYPE_FINE`'s composability
/// with the others in the original bitflag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// A real, directly scheduled symbol with a callback.
    Normal,
    /// Produced by a real parent symbol's callback; never scheduled
    /// directly.
    Virtual(SymbolId),
    /// Has a callback but carries no score and cannot appear in metrics.
    Callback,
    /// Excluded from results even if activated.
    Ghost,
    /// Dispatched once, after the filters stage completes, evaluating
    /// other symbols' activations (spec §4.4 composite stage).
    Composite,
}

/// Runtime statistics accumulated across tasks, flushed by the periodic
/// saver (spec §4.6).
#[derive(Debug)]
pub struct SymbolStats {
    frequency: AtomicU64,
    avg_time_us: Mutex<f64>,
    last_seen_us: AtomicU64,
}

impl SymbolStats {
    fn new() -> Self {
        Self {
            frequency: AtomicU64::new(0),
            avg_time_us: Mutex::new(0.0),
            last_seen_us: AtomicU64::new(0),
        }
    }

    /// Increment activation count. Called when a symbol's result is
    /// actually inserted, not merely when its callback runs (spec §4.4's
    /// "frequency update ordering" rule).
    pub fn record_activation(&self, now_us: u64) {
        self.frequency.fetch_add(1, Ordering::Relaxed);
        self.last_seen_us.store(now_us, Ordering::Relaxed);
    }

    /// Fold a fresh execution-time sample into the exponential moving
    /// average with smoothing constant `alpha`.
    pub fn record_duration(&self, elapsed_us: u64, alpha: f64) {
        let mut avg = self.avg_time_us.lock().unwrap();
        *avg = if *avg == 0.0 {
            elapsed_us as f64
        } else {
            alpha * elapsed_us as f64 + (1.0 - alpha) * *avg
        };
    }

    #[must_use]
    pub fn frequency(&self) -> u64 {
        self.frequency.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn avg_time_us(&self) -> f64 {
        *self.avg_time_us.lock().unwrap()
    }

    #[must_use]
    pub fn last_seen_us(&self) -> u64 {
        self.last_seen_us.load(Ordering::Relaxed)
    }

    /// Restore statistics loaded from the persisted cache file (spec §4.6).
    pub fn restore(&self, frequency: u64, avg_time_us: f64, last_seen_us: u64) {
        self.frequency.store(frequency, Ordering::Relaxed);
        *self.avg_time_us.lock().unwrap() = avg_time_us;
        self.last_seen_us.store(last_seen_us, Ordering::Relaxed);
    }
}

/// A registered symbol.
pub struct Symbol {
    pub id: SymbolId,
    pub name: String,
    pub kind: SymbolKind,
    pub fine: bool,
    pub priority: i32,
    pub weight: f64,
    pub callback: Option<SymbolCallback>,
    /// Names of symbols this one depends on, resolved to ids by
    /// `post_load`.
    pub(crate) dependency_names: Vec<String>,
    pub dependencies: Vec<SymbolId>,
    /// Ids of virtual children pointing back at this symbol (only
    /// meaningful for `SymbolKind::Normal`/`SymbolKind::Callback`).
    pub virtual_children: Vec<SymbolId>,
    /// Boolean expression over other symbols' names, evaluated by
    /// `crate::composite` during the composites stage. Only meaningful
    /// for `SymbolKind::Composite`; `None` means the composite never
    /// matches.
    pub expression: Option<String>,
    pub stats: SymbolStats,
}

impl Symbol {
    #[must_use]
    pub fn is_scheduled_directly(&self) -> bool {
        !matches!(self.kind, SymbolKind::Virtual(_) | SymbolKind::Composite)
    }
}

/// Process-wide, immutable-after-post-load symbol table.
///
/// Construction happens in two phases: registration (`register`,
/// `add_dependency`, `add_delayed_dependency`) followed by a single
/// `post_load` call that resolves delayed edges and computes the
/// execution order. After `post_load` succeeds, a `SymbolCache` is shared
/// read-only across every task via `Arc`.
pub struct SymbolRegistry {
    symbols: Vec<Symbol>,
    names: HashMap<String, SymbolId>,
    delayed_dependencies: Vec<(SymbolId, String)>,
}

impl SymbolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            symbols: Vec::new(),
            names: HashMap::new(),
            delayed_dependencies: Vec::new(),
        }
    }

    /// Register a new symbol. Returns its assigned id.
    ///
    /// # Errors
    /// Returns [`CoreError::DuplicateSymbolName`] if `name` is already
    /// registered, or [`CoreError::UnknownParent`] if `kind` is
    /// `Virtual(parent)` and `parent` does not name a previously
    /// registered real (`Normal`/`Callback`) symbol.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        priority: i32,
        weight: f64,
        kind: SymbolKind,
        fine: bool,
        callback: Option<SymbolCallback>,
    ) -> Result<SymbolId, CoreError> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(CoreError::DuplicateSymbolName(name));
        }

        if let SymbolKind::Virtual(parent) = kind {
            let parent_symbol = self
                .symbols
                .get(parent)
                .ok_or_else(|| CoreError::UnknownParent(name.clone(), parent.to_string()))?;
            if matches!(parent_symbol.kind, SymbolKind::Virtual(_) | SymbolKind::Composite) {
                return Err(CoreError::UnknownParent(name.clone(), parent.to_string()));
            }
        }

        let id = self.symbols.len();
        self.symbols.push(Symbol {
            id,
            name: name.clone(),
            kind,
            fine,
            priority,
            weight,
            callback,
            dependency_names: Vec::new(),
            dependencies: Vec::new(),
            virtual_children: Vec::new(),
            expression: None,
            stats: SymbolStats::new(),
        });
        self.names.insert(name, id);

        if let SymbolKind::Virtual(parent) = kind {
            self.symbols[parent].virtual_children.push(id);
        }

        Ok(id)
    }

    /// Add a dependency edge. If `to_name` is already registered, it
    /// resolves immediately; otherwise it is queued and resolved at
    /// `post_load`.
    pub fn add_dependency(&mut self, from: SymbolId, to_name: impl Into<String>) {
        let to_name = to_name.into();
        if let Some(&to_id) = self.names.get(&to_name) {
            self.symbols[from].dependencies.push(to_id);
            self.symbols[from].dependency_names.push(to_name);
        } else {
            self.delayed_dependencies.push((from, to_name));
        }
    }

    /// Attach a boolean expression to a `Composite` symbol (spec §4.4's
    /// supplemented composite stage). The expression is not parsed or
    /// validated here — an expression referencing a symbol name that is
    /// never registered is legal and simply evaluates to absent/false at
    /// dispatch time, the same as one that is registered but never
    /// activates.
    ///
    /// # Errors
    /// Returns [`CoreError::CompositeExpressionOnNonComposite`] if `id`
    /// does not name a `Composite` symbol.
    pub fn set_composite_expression(&mut self, id: SymbolId, expression: impl Into<String>) -> Result<(), CoreError> {
        let symbol = self
            .symbols
            .get_mut(id)
            .ok_or_else(|| CoreError::CompositeExpressionOnNonComposite(id.to_string()))?;
        if !matches!(symbol.kind, SymbolKind::Composite) {
            return Err(CoreError::CompositeExpressionOnNonComposite(symbol.name.clone()));
        }
        symbol.expression = Some(expression.into());
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: SymbolId) -> Option<&Symbol> {
        self.symbols.get(id)
    }

    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<SymbolId> {
        self.names.get(name).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Resolve delayed dependencies, reject references to callback-only
    /// targets, and detect cycles. On success, consumes `self` and
    /// returns the immutable [`SymbolCache`] (execution order is computed
    /// separately by `crate::symbol::ordering::build`).
    ///
    /// `strict` mirrors `CoreConfig::strict_symbols`: when `true`, an
    /// unresolved delayed dependency is an error; when `false`, it is
    /// dropped (a warning is logged by the caller).
    pub fn post_load(mut self, strict: bool) -> Result<Vec<Symbol>, CoreError> {
        let delayed = std::mem::take(&mut self.delayed_dependencies);
        for (from, to_name) in delayed {
            match self.names.get(&to_name) {
                Some(&to_id) => {
                    self.symbols[from].dependencies.push(to_id);
                    self.symbols[from].dependency_names.push(to_name);
                }
                None if strict => {
                    return Err(CoreError::DependencyUnresolved(
                        self.symbols[from].name.clone(),
                        to_name,
                    ));
                }
                None => {
                    tracing::warn!(from = %self.symbols[from].name, to = %to_name, "dropping unresolved delayed dependency");
                }
            }
        }

        for symbol in &self.symbols {
            for &dep in &symbol.dependencies {
                if matches!(self.symbols[dep].kind, SymbolKind::Callback) {
                    return Err(CoreError::CallbackOnlyReferenced(self.symbols[dep].name.clone()));
                }
            }
        }

        if let Some(cycle) = detect_cycle(&self.symbols) {
            let names = cycle.into_iter().map(|id| self.symbols[id].name.clone()).collect();
            return Err(CoreError::DependencyCycle(names));
        }

        Ok(self.symbols)
    }
}

impl Default for SymbolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Name-indexed, execution-ordered, read-only view shared across tasks.
pub struct SymbolCache {
    pub symbols: Vec<Symbol>,
    pub names: HashMap<String, SymbolId>,
    pub order: super::ordering::ExecutionOrder,
}

fn detect_cycle(symbols: &[Symbol]) -> Option<Vec<SymbolId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InStack,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; symbols.len()];
    let mut stack = Vec::new();

    fn visit(
        id: SymbolId,
        symbols: &[Symbol],
        marks: &mut [Mark],
        stack: &mut Vec<SymbolId>,
    ) -> Option<Vec<SymbolId>> {
        match marks[id] {
            Mark::Done => return None,
            Mark::InStack => {
                let start = stack.iter().position(|&s| s == id).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(id);
                return Some(cycle);
            }
            Mark::Unvisited => {}
        }

        marks[id] = Mark::InStack;
        stack.push(id);
        for &dep in &symbols[id].dependencies {
            if let Some(cycle) = visit(dep, symbols, marks, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        marks[id] = Mark::Done;
        None
    }

    for id in 0..symbols.len() {
        if marks[id] == Mark::Unvisited {
            if let Some(cycle) = visit(id, symbols, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}
