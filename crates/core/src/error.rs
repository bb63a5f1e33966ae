//! Centralized error types for the amdahl workspace.

use thiserror::Error;

/// Top-level error enum. Variants map to the failure taxonomy: user input
/// and store errors surface to the CLI, per-transaction execution errors
/// are skippable, invariant violations abort the whole run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AmdahlError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("substate access: {0}")]
    SubstateAccess(String),

    #[error("evm execution: {0}")]
    EvmExecution(String),

    #[error("blockhash for block {0} invoked but not recorded")]
    MissingBlockHash(u64),

    #[error("dependency graph has no edges")]
    EmptyGraph,

    #[error("not a topological order: {0} visited before its predecessor {1}")]
    NotTopological(String, String),

    #[error("processors idle and ready queue empty while work remains")]
    IdleDeadlock,

    #[error("{op} reported reused without a matching value-cache hit")]
    ReuseMismatch { op: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AmdahlError {
    /// Whether the error must abort the whole run. Per-transaction
    /// execution failures are logged and skipped instead.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            AmdahlError::EvmExecution(_) | AmdahlError::MissingBlockHash(_)
        )
    }
}

pub type AmdahlResult<T> = Result<T, AmdahlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_split() {
        assert!(!AmdahlError::EvmExecution("out of gas".into()).is_fatal());
        assert!(!AmdahlError::MissingBlockHash(7).is_fatal());
        assert!(AmdahlError::IdleDeadlock.is_fatal());
        assert!(AmdahlError::ReuseMismatch { op: "SLOAD" }.is_fatal());
        assert!(AmdahlError::EmptyGraph.is_fatal());
    }
}
