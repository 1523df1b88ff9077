//! Errors surfaced by request lifecycle operations.

use std::fmt;

use thiserror::Error;

use crate::request::RequestId;

/// Which descriptive field of a new request clashes with an open request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictField {
    Sitename,
    Dbname,
    Description,
}

impl ConflictField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sitename => "sitename",
            Self::Dbname => "dbname",
            Self::Description => "description",
        }
    }
}

impl fmt::Display for ConflictField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    /// Load was asked for an identifier with no persisted record.
    #[error("unknown request id {0}")]
    NotFound(RequestId),

    /// A new request duplicates a field of a request that is still in review.
    #[error("request too similar to open request #{existing}: {field} already requested")]
    Conflict {
        field: ConflictField,
        existing: RequestId,
    },

    /// Immediate approval could not validate the name or create the wiki.
    #[error("wiki provisioning failed: {0}")]
    Provisioning(String),

    /// The operation needs an identifier but the request was never saved.
    #[error("request has not been saved yet")]
    NotPersisted,

    #[error("request is incomplete: {0}")]
    Incomplete(&'static str),

    /// Storage or collaborator failure.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type RequestResult<T> = Result<T, RequestError>;
