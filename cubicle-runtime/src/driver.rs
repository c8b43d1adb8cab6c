//! Runtime driver abstraction.
//!
//! Lets the orchestrator drive docker compose, podman compose or a test double
//! without changing the lifecycle logic.

use std::path::Path;

use async_trait::async_trait;
use cubicle_core::VmId;

use crate::{RuntimeError, RuntimeHandle};

/// Container runtime abstraction.
///
/// Implementations hold no per-VM locks. Callers must not issue two
/// operations for the same [`VmId`] concurrently; the
/// [`VmOrchestrator`](crate::VmOrchestrator) guarantees this.
///
/// # Cancel Safety
/// A dropped future kills the in-flight runtime command. The runtime may then
/// be in any state, exactly as after a [`RuntimeError::Timeout`].
#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// Build the image if needed and instantiate the service, stopped.
    ///
    /// # Errors
    /// Returns [`RuntimeError::BuildFailed`] if the image build fails, or any
    /// other classified [`RuntimeError`].
    async fn create(&self, id: VmId, descriptor: &Path) -> Result<RuntimeHandle, RuntimeError>;

    /// Start an existing, stopped instance.
    ///
    /// # Errors
    /// Returns [`RuntimeError::NotFound`] if no instance exists for `id`.
    async fn start(&self, id: VmId) -> Result<(), RuntimeError>;

    /// Stop a running instance, keeping it. Stopping a stopped or missing
    /// instance succeeds.
    ///
    /// # Errors
    /// Returns a classified [`RuntimeError`] other than `NotFound`.
    async fn stop(&self, id: VmId) -> Result<(), RuntimeError>;

    /// Stop and remove the instance, its volumes and its descriptor.
    /// Destroying a missing instance succeeds with a warning.
    ///
    /// # Errors
    /// Returns a classified [`RuntimeError`] other than `NotFound`.
    async fn destroy(&self, id: VmId) -> Result<(), RuntimeError>;

    /// Check that the runtime is installed and reachable.
    ///
    /// # Errors
    /// Returns [`RuntimeError::RuntimeUnavailable`] if the environment is not ready.
    async fn health_check(&self) -> Result<(), RuntimeError>;
}
