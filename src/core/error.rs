// ============================================================================
// spark-recompose - Errors
// Runtime and stream error taxonomy
// ============================================================================

use std::fmt;
use std::time::Duration;

use super::types::{BoxError, CellId, ScopeId, TaskId};

// =============================================================================
// OBSERVED CELL (diagnostic context)
// =============================================================================

/// A cell read by a scope together with the version the scope observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedCell {
    pub cell: CellId,
    pub version: u64,
    pub label: Option<String>,
}

impl fmt::Display for ObservedCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{}({})@v{}", label, self.cell, self.version),
            None => write!(f, "{}@v{}", self.cell, self.version),
        }
    }
}

fn join_observed(cells: &[ObservedCell]) -> String {
    if cells.is_empty() {
        return "none".to_string();
    }
    cells
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// RUNTIME ERROR
// =============================================================================

/// Errors surfaced by the state store, scheduler and effect manager.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// A cell validator rejected the initial value.
    #[error("invalid initial value for cell `{label}`: {reason}")]
    InvalidInitial { label: String, reason: String },

    /// Writes kept re-invalidating scopes for more passes than allowed.
    #[error(
        "recomposition did not settle after {passes} passes; still invalid: {}",
        .scopes.join(", ")
    )]
    ReentrantWriteOverflow { passes: usize, scopes: Vec<String> },

    /// An effect task returned an error. Recovered locally: the task ends
    /// failed and the scheduler keeps running.
    #[error("effect task {task} declared at {site} in {scope} (keys {keys}) failed: {source}")]
    EffectTaskFailure {
        task: TaskId,
        scope: ScopeId,
        site: String,
        keys: String,
        #[source]
        source: BoxError,
    },

    /// A scope body returned an error during a pass. Fatal to that pass.
    #[error(
        "recomposition of {path} failed in pass {pass} (observed: {}): {source}",
        join_observed(.observed)
    )]
    RecompositionFailure {
        scope: ScopeId,
        path: String,
        pass: u64,
        observed: Vec<ObservedCell>,
        #[source]
        source: BoxError,
    },

    /// A stream ended with a failure nobody caught.
    #[error(transparent)]
    StreamTerminated(#[from] StreamError),

    /// The cell was released (its scope was disposed) or never existed.
    #[error("{0} is stale: the cell was released")]
    StaleCell(CellId),

    /// The scope was disposed.
    #[error("{0} is stale: the scope was disposed")]
    StaleScope(ScopeId),

    /// The runtime was dropped while a handle still referred to it.
    #[error("the runtime is gone")]
    RuntimeGone,
}

impl RuntimeError {
    /// Scope the error is attributed to, if any
    pub fn scope(&self) -> Option<ScopeId> {
        match self {
            RuntimeError::EffectTaskFailure { scope, .. }
            | RuntimeError::RecompositionFailure { scope, .. } => Some(*scope),
            RuntimeError::StaleScope(scope) => Some(*scope),
            _ => None,
        }
    }

    /// Whether the error aborted a recomposition pass
    pub fn is_fatal_to_pass(&self) -> bool {
        matches!(
            self,
            RuntimeError::RecompositionFailure { .. } | RuntimeError::ReentrantWriteOverflow { .. }
        )
    }
}

// =============================================================================
// STREAM ERROR
// =============================================================================

/// Terminal failure event of a stream.
///
/// Delivered to subscribers as the last item. Cloneable so a hot stream can
/// hand the same failure to every subscriber.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The producer (or an operator) failed.
    #[error("stream `{stream}` failed: {message}")]
    Failed { stream: String, message: String },

    /// No item arrived within the timeout window.
    #[error("stream `{stream}` timed out after {after:?}")]
    Timeout { stream: String, after: Duration },

    /// The hot stream was retired by its owner.
    #[error("stream `{stream}` was retired")]
    Retired { stream: String },
}

impl StreamError {
    /// Build a `Failed` event from any error
    pub fn failed(stream: impl Into<String>, error: impl fmt::Display) -> Self {
        StreamError::Failed {
            stream: stream.into(),
            message: error.to_string(),
        }
    }

    /// Label of the stream that terminated
    pub fn stream(&self) -> &str {
        match self {
            StreamError::Failed { stream, .. }
            | StreamError::Timeout { stream, .. }
            | StreamError::Retired { stream } => stream,
        }
    }
}

// =============================================================================
// TASK OUTCOMES
// =============================================================================

/// Returned by cancellation-aware waits once the owning task was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("task was cancelled")]
pub struct Cancelled;

/// Returned by `with_timeout` when the timer fired first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("operation timed out after {after:?}")]
pub struct TimedOut {
    pub after: Duration,
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(index: u32) -> CellId {
        CellId {
            index,
            generation: 0,
        }
    }

    #[test]
    fn recomposition_failure_reports_context() {
        let err = RuntimeError::RecompositionFailure {
            scope: ScopeId {
                index: 2,
                generation: 0,
            },
            path: "root/list".to_string(),
            pass: 4,
            observed: vec![ObservedCell {
                cell: cell(1),
                version: 3,
                label: Some("count".to_string()),
            }],
            source: "boom".into(),
        };

        let message = err.to_string();
        assert!(message.contains("root/list"));
        assert!(message.contains("pass 4"));
        assert!(message.contains("count(cell#1.0)@v3"));
        assert!(message.contains("boom"));
        assert!(err.is_fatal_to_pass());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn stream_error_converts_into_runtime_error() {
        let stream_err = StreamError::failed("ticks", "socket closed");
        assert_eq!(stream_err.stream(), "ticks");

        let err: RuntimeError = stream_err.clone().into();
        assert_eq!(err.to_string(), stream_err.to_string());
        assert!(!err.is_fatal_to_pass());
    }

    #[test]
    fn overflow_lists_scopes() {
        let err = RuntimeError::ReentrantWriteOverflow {
            passes: 100,
            scopes: vec!["root".to_string(), "root/counter".to_string()],
        };
        assert!(err.to_string().contains("100 passes"));
        assert!(err.to_string().contains("root/counter"));
    }

    #[test]
    fn observed_without_label() {
        let observed = ObservedCell {
            cell: cell(5),
            version: 0,
            label: None,
        };
        assert_eq!(observed.to_string(), "cell#5.0@v0");
        assert_eq!(join_observed(&[]), "none");
    }
}
