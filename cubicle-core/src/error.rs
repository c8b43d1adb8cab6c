/// Errors produced by the `cubicle-core` crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A VM name failed validation.
    #[error("invalid vm name: {reason}")]
    InvalidName { reason: String },

    /// A status string was neither `running` nor `stopped`.
    #[error("invalid status '{value}': expected 'running' or 'stopped'")]
    InvalidStatus { value: String },

    /// The VM identity has no endpoint pair in the configured port layout.
    #[error("vm id {id} is outside the port layout (max {max})")]
    PortSpaceExhausted { id: u32, max: u32 },

    /// The port layout bases leave no room for any VM.
    #[error("invalid port layout: display base {display_base} must exceed control base {control_base}")]
    InvalidPortLayout { display_base: u16, control_base: u16 },
}
