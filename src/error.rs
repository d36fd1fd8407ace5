//! Error taxonomy shared by the orchestrator, the stores and the analytics engine.
//!
//! Collaborator modules keep their own error enums (`RuntimeError`,
//! `QueueError`, ...). They are folded into [`Error::External`] at the seam,
//! tagged with the stage that failed.

use std::borrow::Cow;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad input: unknown status, inverted time window, disallowed sort or patch field.
    #[error("validation error: {0}")]
    Validation(String),
    #[error("container with ID {0} not found")]
    NotFound(i64),
    /// Unique constraint violation on name or runtime id.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{stage}: {source}")]
    External {
        stage: Cow<'static, str>,
        #[source]
        source: BoxError,
    },
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn external<E>(stage: impl Into<Cow<'static, str>>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::External {
            stage: stage.into(),
            source: source.into(),
        }
    }

    /// Prefix the error with the stage that produced it.
    ///
    /// Validation, not-found and conflict errors keep their kind so transport
    /// layers can still map them to the right status code.
    pub fn at_stage(self, stage: &'static str) -> Self {
        match self {
            Self::Validation(msg) => Self::Validation(format!("{stage}: {msg}")),
            Self::Conflict(msg) => Self::Conflict(format!("{stage}: {msg}")),
            Self::NotFound(id) => Self::NotFound(id),
            external @ Self::External { .. } => Self::External {
                stage: Cow::Borrowed(stage),
                source: Box::new(external),
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_stage_keeps_kind() {
        let err = Error::conflict("duplicate key").at_stage("failed to create container in repository");
        assert!(matches!(err, Error::Conflict(ref msg) if msg.starts_with("failed to create")));

        let err = Error::NotFound(7).at_stage("failed to retrieve container for update");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_at_stage_nests_external() {
        let inner = Error::external("commit", std::io::Error::other("connection reset"));
        let err = inner.at_stage("failed to delete container from repository");
        let rendered = err.to_string();
        assert!(rendered.starts_with("failed to delete container from repository: commit"));
        assert!(rendered.contains("connection reset"));
    }
}
