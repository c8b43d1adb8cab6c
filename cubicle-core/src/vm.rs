use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::{OwnerId, VmId};

/// Maximum length of a VM name, in characters.
pub const MAX_NAME_LEN: usize = 64;

/// A logical sandbox as persisted in the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Vm {
    /// Immutable identity; also determines the endpoint pair.
    pub id: VmId,
    /// The owning user. Immutable.
    pub owner_id: OwnerId,
    /// User-supplied label.
    pub name: VmName,
    /// Status after the last successful runtime transition.
    pub status: VmStatus,
    /// When the record was inserted.
    pub created_at: DateTime<Utc>,
}

impl Vm {
    /// Create a freshly inserted record. New VMs always start `stopped`.
    #[must_use]
    pub fn new(id: VmId, owner_id: OwnerId, name: VmName, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            owner_id,
            name,
            status: VmStatus::Stopped,
            created_at,
        }
    }

    /// Returns `true` if `owner` owns this VM.
    #[must_use]
    pub fn is_owned_by(&self, owner: OwnerId) -> bool {
        self.owner_id == owner
    }
}

/// Persisted VM status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    /// Runtime instance exists but is not running.
    #[default]
    Stopped,
    /// Runtime instance is running.
    Running,
}

impl VmStatus {
    /// Lowercase wire form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            VmStatus::Stopped => "stopped",
            VmStatus::Running => "running",
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(VmStatus::Stopped),
            "running" => Ok(VmStatus::Running),
            other => Err(CoreError::InvalidStatus { value: other.to_owned() }),
        }
    }
}

/// A validated, user-supplied VM label.
///
/// Trimmed, non-empty, at most [`MAX_NAME_LEN`] characters, no control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct VmName(String);

impl VmName {
    /// Validate and normalise a raw name.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidName`] if the trimmed name is empty, too long,
    /// or contains control characters.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let name = raw.trim();
        if name.is_empty() {
            return Err(CoreError::InvalidName {
                reason: "name is required".to_owned(),
            });
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(CoreError::InvalidName {
                reason: format!("name must be at most {MAX_NAME_LEN} characters"),
            });
        }
        if name.chars().any(char::is_control) {
            return Err(CoreError::InvalidName {
                reason: "name must not contain control characters".to_owned(),
            });
        }
        Ok(Self(name.to_owned()))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for VmName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        VmName::parse(&raw).map_err(serde::de::Error::custom)
    }
}
