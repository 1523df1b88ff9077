use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Review state of a wiki creation request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    #[default]
    #[serde(rename = "inreview")]
    InReview,
    #[serde(rename = "approved")]
    Approved,
    #[serde(rename = "declined")]
    Declined,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 3] = [Self::InReview, Self::Approved, Self::Declined];

    /// Value stored in `cw_requests.cw_status`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InReview => "inreview",
            Self::Approved => "approved",
            Self::Declined => "declined",
        }
    }

    /// Open requests take part in the duplicate check.
    pub fn is_open(self) -> bool {
        self == Self::InReview
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inreview" | "in-review" => Ok(Self::InReview),
            "approved" => Ok(Self::Approved),
            "declined" => Ok(Self::Declined),
            other => bail!("unknown request status: {other}"),
        }
    }
}

/// Resolve the status a request moves to when `requested` is asked for.
///
/// Approval is sticky: nothing moves a request out of `Approved`.
pub fn transition(current: RequestStatus, requested: RequestStatus) -> RequestStatus {
    match current {
        RequestStatus::Approved => RequestStatus::Approved,
        _ => requested,
    }
}
