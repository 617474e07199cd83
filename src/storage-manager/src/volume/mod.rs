//! Storage volumes, their registry and the selection of the write volume.

pub mod gauge;
pub mod registry;
pub mod selector;

pub use gauge::{FsSpaceGauge, SpaceGauge};
pub use registry::VolumeRegistry;
pub use selector::{CheckOutcome, SelectorSettings, VolumeSelector, next_check_delay};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Write eligibility of a volume, ordered from most to least writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeStatus {
    WritableDefault,
    Writable,
    ReadOnly,
    Disabled,
}

impl VolumeStatus {
    pub fn code(self) -> i64 {
        match self {
            VolumeStatus::WritableDefault => 0,
            VolumeStatus::Writable => 1,
            VolumeStatus::ReadOnly => 2,
            VolumeStatus::Disabled => 3,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, VolumeError> {
        match code {
            0 => Ok(VolumeStatus::WritableDefault),
            1 => Ok(VolumeStatus::Writable),
            2 => Ok(VolumeStatus::ReadOnly),
            3 => Ok(VolumeStatus::Disabled),
            other => Err(VolumeError::InvalidStatus(other.to_string())),
        }
    }

    /// Whether a volume with this status may receive writes
    pub fn is_writable(self) -> bool {
        self <= VolumeStatus::Writable
    }
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VolumeStatus::WritableDefault => "writable-default",
            VolumeStatus::Writable => "writable",
            VolumeStatus::ReadOnly => "read-only",
            VolumeStatus::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

impl FromStr for VolumeStatus {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "writable-default" => Ok(VolumeStatus::WritableDefault),
            "writable" => Ok(VolumeStatus::Writable),
            "read-only" => Ok(VolumeStatus::ReadOnly),
            "disabled" => Ok(VolumeStatus::Disabled),
            _ => Err(VolumeError::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Availability {
    Online,
    Nearline,
    Offline,
    Unavailable,
}

impl Availability {
    pub fn code(self) -> i64 {
        match self {
            Availability::Online => 0,
            Availability::Nearline => 1,
            Availability::Offline => 2,
            Availability::Unavailable => 3,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, VolumeError> {
        match code {
            0 => Ok(Availability::Online),
            1 => Ok(Availability::Nearline),
            2 => Ok(Availability::Offline),
            3 => Ok(Availability::Unavailable),
            other => Err(VolumeError::InvalidAvailability(other.to_string())),
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Availability::Online => "online",
            Availability::Nearline => "nearline",
            Availability::Offline => "offline",
            Availability::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

impl FromStr for Availability {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(Availability::Online),
            "nearline" => Ok(Availability::Nearline),
            "offline" => Ok(Availability::Offline),
            "unavailable" => Ok(Availability::Unavailable),
            _ => Err(VolumeError::InvalidAvailability(s.to_string())),
        }
    }
}

/// A directory registered as storage for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub id: i64,
    pub group_id: String,
    pub path: String,
    pub status: VolumeStatus,
    pub availability: Availability,
    pub retrieve_aet: String,
    /// Directory of the next volume in the group ring
    pub next: Option<String>,
    pub cached_free_bytes: Option<u64>,
    pub free_checked_at: Option<DateTime<Utc>>,
}

/// Parameters of a volume to register.
#[derive(Debug, Clone)]
pub struct NewVolume {
    pub group_id: String,
    pub path: String,
    pub status: VolumeStatus,
    pub availability: Availability,
    pub retrieve_aet: String,
    pub next: Option<String>,
}

impl NewVolume {
    pub fn new(group_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            path: path.into(),
            status: VolumeStatus::Writable,
            availability: Availability::Online,
            retrieve_aet: String::new(),
            next: None,
        }
    }

    pub fn with_status(mut self, status: VolumeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_availability(mut self, availability: Availability) -> Self {
        self.availability = availability;
        self
    }

    pub fn with_retrieve_aet(mut self, aet: impl Into<String>) -> Self {
        self.retrieve_aet = aet.into();
        self
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    #[error("Volume {0} not found")]
    NotFound(i64),

    #[error("No volume registered at {0}")]
    UnknownPath(String),

    #[error("Volume directory {0} does not exist")]
    DirectoryMissing(String),

    #[error("Volume {path} is not mounted: marker file {marker} present")]
    MountFailed { path: String, marker: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Volume {0} cannot name itself as next volume while its group has other members")]
    SelfReference(String),

    #[error("Next volume {next} of {path} belongs to group {group}")]
    ForeignNext {
        path: String,
        next: String,
        group: String,
    },

    #[error("A volume is already registered at {0}")]
    DuplicatePath(String),

    #[error("No writable volume with free space left in group {0}")]
    GroupExhausted(String),

    #[error("Invalid volume status '{0}'")]
    InvalidStatus(String),

    #[error("Invalid availability '{0}'")]
    InvalidAvailability(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Free space gauge task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_order() {
        assert!(VolumeStatus::WritableDefault < VolumeStatus::Writable);
        assert!(VolumeStatus::Writable < VolumeStatus::ReadOnly);
        assert!(VolumeStatus::ReadOnly < VolumeStatus::Disabled);
        assert!(VolumeStatus::Writable.is_writable());
        assert!(!VolumeStatus::ReadOnly.is_writable());
    }

    #[test]
    fn test_status_names() {
        assert_eq!(
            "WRITABLE_DEFAULT".parse::<VolumeStatus>().unwrap(),
            VolumeStatus::WritableDefault
        );
        assert_eq!(
            "read-only".parse::<VolumeStatus>().unwrap(),
            VolumeStatus::ReadOnly
        );
        assert!("broken".parse::<VolumeStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&VolumeStatus::WritableDefault).unwrap(),
            "\"writable-default\""
        );
        for status in [
            VolumeStatus::WritableDefault,
            VolumeStatus::Writable,
            VolumeStatus::ReadOnly,
            VolumeStatus::Disabled,
        ] {
            assert_eq!(VolumeStatus::from_code(status.code()).unwrap(), status);
            assert_eq!(status.to_string().parse::<VolumeStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_availability_order() {
        assert!(Availability::Online < Availability::Nearline);
        assert!(Availability::Offline < Availability::Unavailable);
        assert_eq!(
            "Nearline".parse::<Availability>().unwrap(),
            Availability::Nearline
        );
        assert!(Availability::from_code(7).is_err());
    }
}
