use serde_json::{Map, Value};

use super::{Container, ContainerStatus};
use crate::error::{Error, Result};

/// Field names a patch may carry, as they appear on the wire.
const ALLOWED_FIELDS: [&str; 4] = ["container_name", "image_name", "status", "container_id"];

/// Partial update of a container record.
///
/// `name` is accepted here only so the orchestrator can refuse it with a
/// validation error; no store ever writes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerPatch {
    pub name: Option<String>,
    pub image: Option<String>,
    pub status: Option<ContainerStatus>,
    pub runtime_id: Option<String>,
}

impl ContainerPatch {
    pub fn status(status: ContainerStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn image(image: impl Into<String>) -> Self {
        Self {
            image: Some(image.into()),
            ..Default::default()
        }
    }

    /// Build a patch from a loosely typed field map, rejecting unknown keys.
    ///
    /// Empty strings for `image_name` and `status` mean "leave unchanged".
    pub fn from_fields(fields: &Map<String, Value>) -> Result<Self> {
        let mut patch = Self::default();
        for (key, value) in fields {
            if !ALLOWED_FIELDS.contains(&key.as_str()) {
                return Err(Error::validation(format!("field {key} cannot be updated")));
            }
            let value = value
                .as_str()
                .ok_or_else(|| Error::validation(format!("field {key} must be a string")))?;
            match key.as_str() {
                "container_name" => patch.name = Some(value.to_string()),
                "image_name" if !value.is_empty() => patch.image = Some(value.to_string()),
                "status" if !value.is_empty() => patch.status = Some(value.parse()?),
                "container_id" => patch.runtime_id = Some(value.to_string()),
                _ => {}
            }
        }
        Ok(patch)
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.image.is_none()
            && self.status.is_none()
            && self.runtime_id.is_none()
    }

    /// Merge the writable fields into `container`.
    pub fn apply_to(&self, container: &mut Container) {
        if let Some(image) = &self.image {
            container.image = image.clone();
        }
        if let Some(status) = self.status {
            container.status = status;
        }
        if let Some(runtime_id) = &self.runtime_id {
            container.runtime_id = runtime_id.clone();
        }
    }
}
