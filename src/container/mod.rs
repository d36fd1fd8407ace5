mod patch;
mod query;

pub use patch::ContainerPatch;
pub use query::{ContainerFilter, ListQuery, SortField, SortOrder};

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Stopped,
}

impl ContainerStatus {
    /// Status carried by ingestion messages: `true` means the container is up.
    pub fn from_running_flag(running: bool) -> Self {
        if running { Self::Running } else { Self::Stopped }
    }
}

impl AsRef<str> for ContainerStatus {
    fn as_ref(&self) -> &str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl FromStr for ContainerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            other => Err(Error::validation(format!("invalid status: {other}"))),
        }
    }
}

/// A managed container as persisted in the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: i64,
    /// Identifier assigned by the container runtime.
    #[serde(rename = "container_id")]
    pub runtime_id: String,
    #[serde(rename = "container_name")]
    pub name: String,
    #[serde(rename = "image_name")]
    pub image: String,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Record data before the store assigns an id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContainer {
    pub runtime_id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerName {
    pub id: i64,
    #[serde(rename = "container_name")]
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing() {
        assert_eq!("running".parse::<ContainerStatus>().unwrap(), ContainerStatus::Running);
        assert_eq!("stopped".parse::<ContainerStatus>().unwrap(), ContainerStatus::Stopped);
        assert!(matches!(
            "paused".parse::<ContainerStatus>(),
            Err(Error::Validation(_))
        ));
        // Case matters, the stored values are lowercase.
        assert!("Running".parse::<ContainerStatus>().is_err());
    }

    #[test]
    fn test_status_from_running_flag() {
        assert_eq!(ContainerStatus::from_running_flag(true), ContainerStatus::Running);
        assert_eq!(ContainerStatus::from_running_flag(false), ContainerStatus::Stopped);
    }

    #[test]
    fn test_container_serializes_with_wire_names() {
        let now = Utc::now();
        let container = Container {
            id: 42,
            runtime_id: "c1".to_string(),
            name: "web".to_string(),
            image: "nginx".to_string(),
            status: ContainerStatus::Running,
            created_at: now,
            updated_at: now,
        };
        let value = serde_json::to_value(&container).unwrap();
        assert_eq!(value["container_id"], "c1");
        assert_eq!(value["container_name"], "web");
        assert_eq!(value["image_name"], "nginx");
        assert_eq!(value["status"], "running");
    }
}
