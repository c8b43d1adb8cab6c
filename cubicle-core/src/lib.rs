//! Core types for the Cubicle sandbox control plane.
//!
//! Defines the logical VM record, its identities, the status model and the
//! deterministic endpoint allocator shared by the runtime and the gateway.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod endpoint;
pub mod error;
pub mod id;
pub mod vm;

pub use endpoint::{EndpointPair, PortLayout};
pub use error::CoreError;
pub use id::{OwnerId, VmId};
pub use vm::{Vm, VmName, VmStatus, MAX_NAME_LEN};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_name_is_stable_per_id() {
        assert_eq!(VmId::new(42).instance_name(), "sandbox-vm-42");
        assert_eq!(VmId::new(42).instance_name(), VmId::new(42).instance_name());
    }

    #[test]
    fn ids_display_as_plain_integers() {
        assert_eq!(VmId::new(9).to_string(), "9");
        assert_eq!(OwnerId::new(-3).to_string(), "-3");
    }

    #[test]
    fn vm_record_serializes_with_wire_field_names() {
        let name = match VmName::parse("box1") {
            Ok(n) => n,
            Err(e) => panic!("unexpected error: {e}"),
        };
        let vm = Vm::new(VmId::new(5), OwnerId::new(1), name, chrono::Utc::now());
        let json = match serde_json::to_value(&vm) {
            Ok(v) => v,
            Err(e) => panic!("serialization failed: {e}"),
        };
        assert_eq!(json["id"], 5);
        assert_eq!(json["owner_id"], 1);
        assert_eq!(json["name"], "box1");
        assert_eq!(json["status"], "stopped");
        assert!(json["created_at"].is_string(), "created_at must serialize as RFC 3339");
    }

    #[test]
    fn core_error_display_includes_detail() {
        let err = CoreError::PortSpaceExhausted { id: 200, max: 179 };
        let msg = err.to_string();
        assert!(msg.contains("200") && msg.contains("179"), "got {msg}");
    }
}
