//! Endpoint allocation.
//!
//! Ports are a pure function of the VM identity, so nothing needs to be
//! persisted and the same pair is recomputed after a restart:
//!
//! `display = display_base + id`, `control = control_base + id`.
//!
//! With `control_base < display_base`, `display(a) == control(b)` exactly when
//! `b - a == display_base - control_base`. Ids in `1..=gap` differ by less than
//! the gap, so the layout admits those (and stays below the `u16` ceiling).

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::VmId;

/// Default base of the remote-display (noVNC) port range.
pub const DEFAULT_DISPLAY_BASE: u16 = 6080;

/// Default base of the control (VNC) port range.
pub const DEFAULT_CONTROL_BASE: u16 = 5901;

/// Display port inside the sandbox.
pub const INTERNAL_DISPLAY_PORT: u16 = 6080;

/// Control port inside the sandbox.
pub const INTERNAL_CONTROL_PORT: u16 = 5901;

/// Host ports exposed for one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointPair {
    /// Host port serving the browser-based remote display.
    pub display_port: u16,
    /// Host port serving the raw remote-control protocol.
    pub control_port: u16,
}

impl EndpointPair {
    /// URL a browser opens to reach the remote display.
    #[must_use]
    pub fn console_url(&self, host: &str) -> String {
        format!("http://{host}:{}/vnc.html?autoconnect=true", self.display_port)
    }
}

/// Base offsets for deriving endpoint pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLayout {
    display_base: u16,
    control_base: u16,
}

impl PortLayout {
    /// Create a layout from explicit bases.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidPortLayout`] unless `display_base` exceeds
    /// `control_base`.
    pub fn new(display_base: u16, control_base: u16) -> Result<Self, CoreError> {
        if display_base <= control_base {
            return Err(CoreError::InvalidPortLayout { display_base, control_base });
        }
        Ok(Self { display_base, control_base })
    }

    /// Largest VM id that maps to a collision-free pair.
    #[must_use]
    pub fn max_id(&self) -> u32 {
        let gap = u32::from(self.display_base - self.control_base);
        let headroom = u32::from(u16::MAX - self.display_base);
        gap.min(headroom)
    }

    /// Derive the endpoint pair for `id`.
    ///
    /// # Errors
    /// Returns [`CoreError::PortSpaceExhausted`] if `id` is 0 or above
    /// [`PortLayout::max_id`].
    pub fn allocate(&self, id: VmId) -> Result<EndpointPair, CoreError> {
        let max = self.max_id();
        let raw = id.get();
        if raw == 0 || raw > max {
            return Err(CoreError::PortSpaceExhausted { id: raw, max });
        }
        let offset = u16::try_from(raw).map_err(|_| CoreError::PortSpaceExhausted { id: raw, max })?;
        Ok(EndpointPair {
            display_port: self.display_base + offset,
            control_port: self.control_base + offset,
        })
    }
}

impl Default for PortLayout {
    fn default() -> Self {
        Self {
            display_base: DEFAULT_DISPLAY_BASE,
            control_base: DEFAULT_CONTROL_BASE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(id: u32) -> EndpointPair {
        match PortLayout::default().allocate(VmId::new(id)) {
            Ok(p) => p,
            Err(e) => panic!("allocation of {id} failed: {e}"),
        }
    }

    #[test]
    fn default_layout_matches_published_offsets() {
        let p = pair(7);
        assert_eq!(p.display_port, 6087);
        assert_eq!(p.control_port, 5908);
    }

    #[test]
    fn default_layout_admits_ids_up_to_the_gap() {
        let layout = PortLayout::default();
        assert_eq!(layout.max_id(), 179);
        assert!(matches!(
            layout.allocate(VmId::new(180)),
            Err(CoreError::PortSpaceExhausted { id: 180, max: 179 })
        ));
    }

    #[test]
    fn highest_id_control_port_sits_below_lowest_display_port() {
        let top = pair(179);
        assert_eq!(top.control_port, 6080);
        assert_eq!(pair(1).display_port, 6081);
    }

    #[test]
    fn id_zero_is_rejected() {
        assert!(PortLayout::default().allocate(VmId::new(0)).is_err());
    }

    #[test]
    fn layout_near_u16_ceiling_is_bounded_by_headroom() {
        let layout = match PortLayout::new(65_530, 1_000) {
            Ok(l) => l,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(layout.max_id(), 5);
        assert!(layout.allocate(VmId::new(5)).is_ok());
        assert!(layout.allocate(VmId::new(6)).is_err());
    }

    #[test]
    fn degenerate_layout_is_rejected() {
        assert!(PortLayout::new(5901, 5901).is_err());
        assert!(PortLayout::new(5901, 6080).is_err());
        match PortLayout::new(5902, 5901) {
            Ok(l) => assert_eq!(l.max_id(), 1),
            Err(e) => panic!("gap of one must admit id 1: {e}"),
        }
    }

    #[test]
    fn console_url_targets_display_port() {
        assert_eq!(
            pair(3).console_url("localhost"),
            "http://localhost:6083/vnc.html?autoconnect=true"
        );
    }

    proptest::proptest! {
        #[test]
        fn proptest_distinct_ids_never_share_a_port(a in 1u32..=179, b in 1u32..=179) {
            proptest::prop_assume!(a != b);
            let pa = pair(a);
            let pb = pair(b);
            let ports_a = [pa.display_port, pa.control_port];
            let ports_b = [pb.display_port, pb.control_port];
            proptest::prop_assert!(
                ports_a.iter().all(|p| !ports_b.contains(p)),
                "ids {} and {} share a port: {:?} vs {:?}", a, b, pa, pb
            );
        }

        #[test]
        fn proptest_allocation_is_deterministic(id in 1u32..=179) {
            proptest::prop_assert_eq!(pair(id), pair(id));
        }
    }
}
