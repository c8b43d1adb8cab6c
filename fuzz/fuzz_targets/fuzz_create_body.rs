//! Fuzz target: `POST /v1/vms` body parsing and name validation.
//!
//! Any accepted name must already be trimmed, non-empty and within the length
//! limit.

#![no_main]

use cubicle_core::{VmName, MAX_NAME_LEN};
use cubicle_gateway::routes::NameBody;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(body) = serde_json::from_slice::<NameBody>(data) else {
        return;
    };
    let Some(raw) = body.name else {
        return;
    };
    if let Ok(name) = VmName::parse(&raw) {
        let s = name.as_str();
        assert!(!s.is_empty());
        assert_eq!(s, s.trim());
        assert!(s.chars().count() <= MAX_NAME_LEN);
        assert!(!s.chars().any(char::is_control));
    }
});
