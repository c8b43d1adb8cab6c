//! Handle to an instantiated, stopped runtime instance.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use cubicle_core::VmId;

/// The result of a successful [`RuntimeDriver::create`](crate::RuntimeDriver::create).
///
/// Holds no process or connection: the instance lives in the external runtime
/// and is addressed by its stable name on every later call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct RuntimeHandle {
    /// VM this instance backs.
    pub vm_id: VmId,

    /// Stable runtime instance name (`sandbox-vm-<id>`).
    pub instance_name: String,

    /// Descriptor the instance was created from.
    pub descriptor_path: PathBuf,

    /// When the instance was created.
    pub created_at: DateTime<Utc>,
}

impl RuntimeHandle {
    /// Create a handle for `vm_id` built from `descriptor_path`.
    #[must_use]
    pub fn new(vm_id: VmId, descriptor_path: PathBuf) -> Self {
        Self {
            vm_id,
            instance_name: vm_id.instance_name(),
            descriptor_path,
            created_at: Utc::now(),
        }
    }
}
