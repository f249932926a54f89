//! Error taxonomy shared by every operation in the engine.
//!
//! Validation failures are returned at the call that caused them. Kernel
//! failures surface as node status and as the result of the graph pass.

use thiserror::Error;

/// Result alias used across the crate.
pub type VxResult<T> = Result<T, VxError>;

/// Errors reported by context, graph, node, parameter and queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VxError {
    /// Stale handle, wrong owning context, or wrong entity type.
    #[error("bad reference: {0}")]
    BadReference(String),

    /// Index out of range, missing required binding, or malformed argument.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// Bound value does not match the declared parameter type.
    #[error("invalid type: expected {expected}, found {found}")]
    InvalidType {
        /// Declared type.
        expected: String,
        /// Runtime type of the offending value.
        found: String,
    },

    /// Well-typed but semantically invalid request.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// A capacity limit was reached.
    #[error("no resources: {0}")]
    NoResources(String),

    /// Valid request on a path that is not implemented.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Bookkeeping failure that indicates a defect (over-release, delay links).
    #[error("internal error: {0}")]
    Internal(String),

    /// Graph is not a rooted DAG.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// More than one node writes the same data object.
    #[error("multiple writers: {0}")]
    MultipleWriters(String),

    /// A completion callback abandoned the graph pass.
    #[error("graph pass abandoned")]
    GraphAbandoned,

    /// A virtual object was accessed outside of its graph's execution.
    #[error("optimized away: {0}")]
    OptimizedAway(String),

    /// A kernel reported failure.
    #[error("kernel failed: {0}")]
    KernelFailed(String),
}

impl VxError {
    /// Stable numeric status code for host bindings.
    pub fn code(&self) -> i32 {
        match self {
            VxError::KernelFailed(_) => -1,
            VxError::Internal(_) => -1,
            VxError::NotSupported(_) => -3,
            VxError::NoResources(_) => -7,
            VxError::OptimizedAway(_) => -9,
            VxError::BadParameter(_) => -10,
            VxError::BadReference(_) => -12,
            VxError::InvalidValue(_) => -16,
            VxError::InvalidType { .. } => -17,
            VxError::InvalidGraph(_) => -18,
            VxError::GraphAbandoned => -22,
            VxError::MultipleWriters(_) => -23,
        }
    }

    pub(crate) fn invalid_type(expected: impl ToString, found: impl ToString) -> Self {
        VxError::InvalidType {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_distinct_per_kind() {
        let errors = [
            VxError::NotSupported(String::new()),
            VxError::NoResources(String::new()),
            VxError::BadParameter(String::new()),
            VxError::BadReference(String::new()),
            VxError::InvalidValue(String::new()),
            VxError::invalid_type("scalar", "image"),
            VxError::InvalidGraph(String::new()),
            VxError::GraphAbandoned,
            VxError::MultipleWriters(String::new()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(VxError::code).collect();
        assert!(codes.iter().all(|c| *c < 0));
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn invalid_type_message() {
        let err = VxError::invalid_type("scalar(u8)", "image");
        assert_eq!(err.to_string(), "invalid type: expected scalar(u8), found image");
    }
}
