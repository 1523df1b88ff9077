use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::RequestStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub i64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
}

/// Descriptive fields of a requested wiki. Free to edit before saving.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDetails {
    pub dbname: String,
    pub sitename: String,
    pub url: String,
    pub language: String,
    pub category: String,
    pub description: String,
    pub private: bool,
    /// Redaction level; 0 is fully visible.
    pub visibility: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Comment {
    pub timestamp: DateTime<Utc>,
    pub author: User,
    pub text: String,
}

/// One wiki creation request.
///
/// Identity, status, comment history and creation time only change through
/// the lifecycle operations in [`crate::lifecycle`].
#[derive(Debug, Clone, Serialize)]
pub struct WikiRequest {
    pub(crate) id: Option<RequestId>,
    pub(crate) details: RequestDetails,
    pub(crate) requester: Option<User>,
    pub(crate) status: RequestStatus,
    /// Newest first.
    pub(crate) comments: Vec<Comment>,
    #[serde(skip)]
    pub(crate) involved_users: BTreeMap<UserId, User>,
    pub(crate) timestamp: Option<DateTime<Utc>>,
}

impl WikiRequest {
    /// Unsaved request filed by `requester`.
    pub fn new(details: RequestDetails, requester: User) -> Self {
        Self {
            requester: Some(requester),
            details,
            ..Self::empty()
        }
    }

    pub(crate) fn empty() -> Self {
        Self {
            id: None,
            details: RequestDetails::default(),
            requester: None,
            status: RequestStatus::default(),
            comments: Vec::new(),
            involved_users: BTreeMap::new(),
            timestamp: None,
        }
    }

    pub fn id(&self) -> Option<RequestId> {
        self.id
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn details(&self) -> &RequestDetails {
        &self.details
    }

    pub fn details_mut(&mut self) -> &mut RequestDetails {
        &mut self.details
    }

    pub fn requester(&self) -> Option<&User> {
        self.requester.as_ref()
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    /// Everyone who has commented, ordered by user id.
    pub fn involved_users(&self) -> impl Iterator<Item = &User> {
        self.involved_users.values()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }
}

/// Database name implied by a farm subdomain URL.
///
/// `foo.example.org` with base subdomain `example.org` and suffix `wiki`
/// yields `foowiki`. Any other URL shape yields `None`.
pub fn derive_dbname(url: &str, subdomain: &str, suffix: &str) -> Option<String> {
    let subdomain = subdomain.trim();
    if subdomain.is_empty() {
        return None;
    }
    let (head, rest) = url.trim().split_once('.')?;
    if head.is_empty() || rest != subdomain {
        return None;
    }
    Some(format!("{head}{suffix}"))
}
