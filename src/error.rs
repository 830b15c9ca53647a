//! Typed error taxonomy for the symbol-cache engine.
//!
//! Every fallible construction function in this crate returns
//! `Result<_, CoreError>`. Per-task and per-symbol failures encountered
//! during execution are recorded on the `Task` or logged rather than
//! propagated, matching the policy in spec §7.

use thiserror::Error;

/// Errors the symbol-cache engine can produce, one variant per error kind
/// a mail-filter pipeline surfaces plus the structural errors the
/// registry and aggregator raise during configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The MIME parser (an external collaborator) failed to parse a message.
    #[error("message parse error: {0}")]
    MessageParseError(String),

    /// Two symbols were registered under the same name.
    #[error("symbol '{0}' is already registered")]
    DuplicateSymbolName(String),

    /// A virtual symbol named a parent that was never registered.
    #[error("symbol '{0}' names unknown parent '{1}'")]
    UnknownParent(String, String),

    /// A dependency edge names a symbol that was never registered and
    /// could not be resolved at post-load.
    #[error("dependency from '{0}' to unresolved symbol '{1}'")]
    DependencyUnresolved(String, String),

    /// Same as `DependencyUnresolved`, phrased for the general "target
    /// missing" case raised outside dependency resolution (e.g. weight
    /// mapping against an unknown symbol in strict mode).
    #[error("unknown symbol referenced: '{0}'")]
    UnknownDependencyTarget(String),

    /// Post-load detected a cycle in the dependency graph.
    #[error("dependency cycle detected, involving: {0:?}")]
    DependencyCycle(Vec<String>),

    /// A callback-only symbol was referenced somewhere only real/virtual
    /// symbols may appear (e.g. as a metric's scored entry, or as a
    /// dependency target).
    #[error("symbol '{0}' is callback-only and cannot be referenced here")]
    CallbackOnlyReferenced(String),

    /// An unrecognised symbol type bitflag combination was supplied.
    #[error("unknown or invalid symbol type for '{0}'")]
    UnknownSymbolType(String),

    /// A composite expression was attached to a symbol that is not of
    /// kind `Composite`.
    #[error("'{0}' is not a composite symbol, cannot attach an expression")]
    CompositeExpressionOnNonComposite(String),

    /// A composite symbol's boolean expression failed to parse.
    #[error("composite '{0}' has an invalid expression: {1}")]
    InvalidCompositeExpression(String, String),

    /// The logging subsystem failed to initialize: an unrecognised level
    /// string, or the global `tracing` subscriber was already set.
    #[error("logging initialization failed: {0}")]
    LoggingInit(String),

    /// A symbol's callback panicked or returned an error.
    #[error("callback for symbol '{0}' failed: {1}")]
    CallbackFailed(String, String),

    /// The periodic saver or cache-file loader hit an I/O error.
    #[error("persistence I/O error: {0}")]
    PersistenceIoError(String),

    /// A task or callback exceeded its allotted deadline.
    #[error("operation timed out")]
    Timeout,
}

impl CoreError {
    /// Configuration-time errors (registration, post-load) that should
    /// abort host startup rather than be retried.
    pub const fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::DuplicateSymbolName(_)
                | Self::UnknownParent(_, _)
                | Self::DependencyUnresolved(_, _)
                | Self::UnknownDependencyTarget(_)
                | Self::DependencyCycle(_)
                | Self::CallbackOnlyReferenced(_)
                | Self::UnknownSymbolType(_)
                | Self::CompositeExpressionOnNonComposite(_)
                | Self::InvalidCompositeExpression(_, _)
                | Self::LoggingInit(_)
        )
    }

    /// Per-task errors that are worth logging but do not require the host
    /// to stop processing other tasks.
    pub const fn is_transient(&self) -> bool {
        !self.is_permanent()
    }
}
