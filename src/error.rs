//! Error types reported by the sandbox
//!
//! Every way a run can stop short of completion has its own variant so the
//! caller knows exactly why execution ended.

use std::fmt;
use thiserror::Error;

/// Guest resource that can be exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Linear memory, in bytes
    Memory,
    /// Table elements
    TableElements,
    /// Instruction budget (wasmtime fuel units)
    Fuel,
    /// Captured stdout+stderr, in bytes
    Output,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Resource::Memory => "memory",
            Resource::TableElements => "table_elements",
            Resource::Fuel => "fuel",
            Resource::Output => "output",
        };
        write!(f, "{}", s)
    }
}

/// Errors raised while configuring the sandbox or running guest code
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Invalid limits at construction; never retried
    #[error("invalid sandbox configuration: {0}")]
    Configuration(String),

    /// The guest runner module could not be compiled or linked
    #[error("failed to load guest runner: {0}")]
    GuestLoad(String),

    /// Deadline elapsed before the guest finished
    #[error("execution timed out after {elapsed_ms}ms (limit {limit_ms}ms)")]
    Timeout { limit_ms: u64, elapsed_ms: u64 },

    /// Guest tried to go past one of its budgets
    #[error("{resource} limit exceeded: requested {requested}, limit {limit}")]
    ResourceExceeded {
        resource: Resource,
        requested: u64,
        limit: u64,
    },

    /// Guest runner reported a runtime fault (trap, non-zero exit)
    #[error("guest execution failed: {0}")]
    GuestExecution(String),

    /// Host-side plumbing (pipes, directories, threads) could not be set up
    #[error("host I/O error: {context}")]
    HostIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Run was stopped by an external cancellation signal
    #[error("execution cancelled")]
    Cancelled,

    /// Invalid workspace file operation
    #[error("workspace error: {0}")]
    Workspace(String),
}

impl SandboxError {
    pub(crate) fn host_io(context: impl Into<String>, source: std::io::Error) -> Self {
        SandboxError::HostIo {
            context: context.into(),
            source,
        }
    }

    /// Whether the same call may reasonably succeed if attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SandboxError::Timeout { .. } | SandboxError::HostIo { .. } | SandboxError::Cancelled
        )
    }
}

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;
