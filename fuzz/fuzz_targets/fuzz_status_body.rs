//! Fuzz target: `PUT /v1/vms/{id}/status` body parsing.

#![no_main]

use cubicle_core::VmStatus;
use cubicle_gateway::routes::StatusBody;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(body) = serde_json::from_slice::<StatusBody>(data) else {
        return;
    };
    if let Some(raw) = body.status {
        if let Ok(status) = raw.parse::<VmStatus>() {
            assert_eq!(status.as_str(), raw, "only exact status strings parse");
        }
    }
});
