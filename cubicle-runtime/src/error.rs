//! Error types for the runtime crate.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use cubicle_core::{CoreError, OwnerId, VmId};

/// A single Runtime Driver operation, used in logs and error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeOp {
    /// Build the image and instantiate the service, stopped.
    Create,
    /// Transition a stopped service to running.
    Start,
    /// Transition a running service to stopped, keeping the instance.
    Stop,
    /// Remove the instance, its volumes and the descriptor.
    Destroy,
}

impl RuntimeOp {
    /// Lowercase operation name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            RuntimeOp::Create => "create",
            RuntimeOp::Start => "start",
            RuntimeOp::Stop => "stop",
            RuntimeOp::Destroy => "destroy",
        }
    }
}

impl fmt::Display for RuntimeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures reported by a [`RuntimeDriver`](crate::RuntimeDriver).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The image build step failed.
    #[error("image build failed for VM {vm_id}: {stderr}")]
    BuildFailed { vm_id: VmId, stderr: String },

    /// No runtime instance exists for the VM.
    #[error("no runtime instance for VM {vm_id}")]
    NotFound { vm_id: VmId },

    /// The container runtime (daemon or CLI) cannot be reached.
    #[error("container runtime unavailable: {reason}")]
    RuntimeUnavailable { reason: String },

    /// The invocation did not finish in time. The runtime may be in any state.
    #[error("{op} for VM {vm_id} timed out after {}s", after.as_secs())]
    Timeout { vm_id: VmId, op: RuntimeOp, after: Duration },

    /// Anything else; `stderr` is kept verbatim for diagnostics.
    #[error("{op} for VM {vm_id} failed: {stderr}")]
    Unknown { vm_id: VmId, op: RuntimeOp, stderr: String },
}

impl RuntimeError {
    /// Machine-readable classification.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            RuntimeError::BuildFailed { .. } => "build_failed",
            RuntimeError::NotFound { .. } => "not_found",
            RuntimeError::RuntimeUnavailable { .. } => "runtime_unavailable",
            RuntimeError::Timeout { .. } => "timeout",
            RuntimeError::Unknown { .. } => "unknown",
        }
    }
}

/// Failures while rendering, writing or removing an isolation descriptor.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DescriptorError {
    /// Serializing the descriptor failed.
    #[error("descriptor render failed for VM {vm_id}: {source}")]
    Render {
        vm_id: VmId,
        #[source]
        source: serde_yaml::Error,
    },

    /// Filesystem failure on a descriptor path.
    #[error("descriptor I/O failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures of the VM record store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The SQL backend returned an error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A persisted row could not be decoded into a [`cubicle_core::Vm`].
    #[error("corrupt record for VM {id}: {reason}")]
    Corrupt { id: i64, reason: String },

    /// The store ran out of representable identities.
    #[error("VM id space exhausted")]
    IdsExhausted,
}

/// Errors surfaced by the lifecycle orchestrator.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// Bad input, rejected before touching the store or the runtime.
    #[error(transparent)]
    Validation(#[from] CoreError),

    /// The owner already has the maximum number of VMs.
    #[error("owner {owner_id} already has the maximum of {limit} VMs")]
    QuotaExceeded { owner_id: OwnerId, limit: usize },

    /// The VM does not exist or belongs to someone else.
    #[error("VM {vm_id} not found or unauthorized access")]
    NotFoundOrUnauthorized { vm_id: VmId },

    /// The store assigned an id with no endpoint pair; the record was rolled back.
    #[error("no endpoint capacity left for VM {vm_id}: {source}")]
    CapacityExhausted {
        vm_id: VmId,
        #[source]
        source: CoreError,
    },

    /// A runtime operation failed.
    #[error("{op} failed: {source}")]
    Runtime {
        op: RuntimeOp,
        #[source]
        source: RuntimeError,
    },

    /// Persisted state contradicts the runtime artifacts.
    #[error("inconsistent state for VM {vm_id}: {reason}")]
    InconsistentState { vm_id: VmId, reason: String },

    /// Descriptor generation failed.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    /// The record store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    /// Stable, machine-readable error kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => "validation_error",
            OrchestratorError::QuotaExceeded { .. } => "quota_exceeded",
            OrchestratorError::NotFoundOrUnauthorized { .. } => "not_found_or_unauthorized",
            OrchestratorError::CapacityExhausted { .. } => "capacity_exhausted",
            OrchestratorError::Runtime { .. } => "runtime_error",
            OrchestratorError::InconsistentState { .. } => "inconsistent_state",
            OrchestratorError::Descriptor(_) => "descriptor_error",
            OrchestratorError::Store(_) => "store_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_error_kinds_are_distinct() {
        let id = VmId::new(1);
        let errors = [
            RuntimeError::BuildFailed { vm_id: id, stderr: String::new() },
            RuntimeError::NotFound { vm_id: id },
            RuntimeError::RuntimeUnavailable { reason: String::new() },
            RuntimeError::Timeout { vm_id: id, op: RuntimeOp::Start, after: Duration::from_secs(1) },
            RuntimeError::Unknown { vm_id: id, op: RuntimeOp::Stop, stderr: String::new() },
        ];
        let mut kinds: Vec<_> = errors.iter().map(RuntimeError::kind).collect();
        kinds.sort_unstable();
        kinds.dedup();
        assert_eq!(kinds.len(), errors.len(), "each variant needs its own kind");
    }

    #[test]
    fn unknown_error_keeps_stderr_verbatim() {
        let err = RuntimeError::Unknown {
            vm_id: VmId::new(3),
            op: RuntimeOp::Start,
            stderr: "port is already allocated".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("start"), "got {msg}");
        assert!(msg.contains("port is already allocated"), "got {msg}");
    }

    #[test]
    fn orchestrator_runtime_error_names_the_operation() {
        let err = OrchestratorError::Runtime {
            op: RuntimeOp::Stop,
            source: RuntimeError::RuntimeUnavailable { reason: "daemon down".to_owned() },
        };
        assert_eq!(err.kind(), "runtime_error");
        assert!(err.to_string().starts_with("stop failed"), "got {err}");
    }

    #[test]
    fn validation_errors_convert_from_core() {
        let err: OrchestratorError = CoreError::InvalidStatus { value: "x".to_owned() }.into();
        assert_eq!(err.kind(), "validation_error");
    }
}
