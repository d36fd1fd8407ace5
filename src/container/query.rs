use serde::{Deserialize, Serialize};

use super::{Container, ContainerStatus};
use crate::error::{Error, Result};

/// Page size used when the requested range is empty or inverted.
pub const DEFAULT_PAGE_SIZE: i64 = 10;

/// Optional listing predicates. `name` and `image` are substring matches,
/// `runtime_id` and `status` are exact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerFilter {
    #[serde(default, rename = "container_id")]
    pub runtime_id: Option<String>,
    #[serde(default, rename = "container_name")]
    pub name: Option<String>,
    #[serde(default, rename = "image_name")]
    pub image: Option<String>,
    #[serde(default)]
    pub status: Option<ContainerStatus>,
}

impl ContainerFilter {
    pub fn matches(&self, container: &Container) -> bool {
        non_empty(&self.runtime_id).is_none_or(|id| container.runtime_id == id)
            && non_empty(&self.name).is_none_or(|name| container.name.contains(name))
            && non_empty(&self.image).is_none_or(|image| container.image.contains(image))
            && self.status.is_none_or(|status| container.status == status)
    }

    pub(crate) fn runtime_id(&self) -> Option<&str> {
        non_empty(&self.runtime_id)
    }

    pub(crate) fn name(&self) -> Option<&str> {
        non_empty(&self.name)
    }

    pub(crate) fn image(&self) -> Option<&str> {
        non_empty(&self.image)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Columns a listing may be ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Id,
    RuntimeId,
    Name,
    Image,
    Status,
    CreatedAt,
    UpdatedAt,
}

impl SortField {
    pub fn parse(field: &str) -> Result<Self> {
        match field {
            "id" => Ok(Self::Id),
            "container_id" => Ok(Self::RuntimeId),
            "container_name" => Ok(Self::Name),
            "image_name" => Ok(Self::Image),
            "status" => Ok(Self::Status),
            "created_at" => Ok(Self::CreatedAt),
            "updated_at" => Ok(Self::UpdatedAt),
            other => Err(Error::validation(format!("invalid sort field: {other}"))),
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::RuntimeId => "container_id",
            Self::Name => "container_name",
            Self::Image => "image_name",
            Self::Status => "status",
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
        }
    }

    pub fn compare(self, left: &Container, right: &Container) -> std::cmp::Ordering {
        match self {
            Self::Id => left.id.cmp(&right.id),
            Self::RuntimeId => left.runtime_id.cmp(&right.runtime_id),
            Self::Name => left.name.cmp(&right.name),
            Self::Image => left.image.cmp(&right.image),
            Self::Status => left.status.as_ref().cmp(right.status.as_ref()),
            Self::CreatedAt => left.created_at.cmp(&right.created_at),
            Self::UpdatedAt => left.updated_at.cmp(&right.updated_at),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    /// Anything other than "desc" (any case) sorts ascending.
    pub fn parse(order: Option<&str>) -> Self {
        match order {
            Some(order) if order.eq_ignore_ascii_case("desc") => Self::Desc,
            _ => Self::Asc,
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// A filtered, sorted, paginated listing request.
///
/// `from`/`to` are row offsets; the page covers `from..to`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub filter: ContainerFilter,
    pub from: i64,
    pub to: i64,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

impl ListQuery {
    pub fn page_size(&self) -> i64 {
        match self.to.saturating_sub(self.from) {
            size if size <= 0 => DEFAULT_PAGE_SIZE,
            size => size,
        }
    }

    pub fn offset(&self) -> i64 {
        self.from.max(0)
    }

    /// Resolve the ordering, defaulting to newest first.
    pub fn sort(&self) -> Result<(SortField, SortOrder)> {
        match self.sort_by.as_deref().filter(|s| !s.is_empty()) {
            Some(field) => Ok((
                SortField::parse(field)?,
                SortOrder::parse(self.sort_order.as_deref()),
            )),
            None => Ok((SortField::CreatedAt, SortOrder::Desc)),
        }
    }
}
