//! Fuzz target: descriptor rendering with arbitrary names and ids.
//!
//! Every rendered descriptor must be valid YAML that keeps the VM name intact,
//! whatever characters it contains. Dollar signs come back doubled so compose
//! reads them literally.

#![no_main]

use std::path::PathBuf;

use cubicle_core::{PortLayout, VmId, VmName};
use cubicle_runtime::IsolationTemplate;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: (u32, &str)| {
    let (raw_id, raw_name) = input;
    let Ok(name) = VmName::parse(raw_name) else {
        return;
    };
    let id = VmId::new(raw_id);
    let Ok(endpoints) = PortLayout::default().allocate(id) else {
        return;
    };
    let template = IsolationTemplate::new("cubicle-desktop:fuzz", PathBuf::from("/ctx"), PathBuf::from("Dockerfile"));
    let Ok(bytes) = template.render(id, &name, endpoints) else {
        return;
    };
    let doc: serde_yaml::Value = match serde_yaml::from_slice(&bytes) {
        Ok(v) => v,
        Err(e) => panic!("rendered descriptor is not YAML: {e}"),
    };
    let label = &doc["services"]["desktop"]["labels"]["cubicle.vm-name"];
    let expected = name.as_str().replace('$', "$$");
    assert_eq!(label.as_str(), Some(expected.as_str()));
});
