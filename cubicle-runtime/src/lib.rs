//! VM lifecycle management for the Cubicle sandbox control plane.
//!
//! Turns logical VM records into isolated desktop sandboxes: renders one
//! isolation descriptor per VM, drives a compose-compatible container runtime
//! through its CLI, and keeps the record store and the runtime in step.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod compose;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod handle;
pub mod locks;
pub mod orchestrator;
pub mod sqlite;
pub mod store;

pub use compose::{ComposeDriver, DEFAULT_BUILD_TIMEOUT, DEFAULT_COMMAND_TIMEOUT};
pub use descriptor::{DescriptorStore, IsolationTemplate, SERVICE_NAME};
pub use driver::RuntimeDriver;
pub use error::{DescriptorError, OrchestratorError, RuntimeError, RuntimeOp, StoreError};
pub use handle::RuntimeHandle;
pub use locks::{LockArena, LockGuard};
pub use orchestrator::{OrchestratorSettings, VmOrchestrator, VmView, DEFAULT_QUOTA};
pub use sqlite::SqliteVmStore;
pub use store::{MemoryVmStore, VmStore};
