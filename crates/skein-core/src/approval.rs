use serde::{Deserialize, Serialize};

/// Closed set of approval outcomes.
///
/// Resolution tokens arrive from humans over the wire as free-form strings
/// ("approve", "approved", "yes", ...). They are normalized into this enum at
/// the boundary, exactly once; branching logic only ever sees `Decision`.
/// An unrecognized token is an error, never a default branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
    Cancelled,
}

impl Decision {
    /// Normalize a raw resolution token. Comparison is case-insensitive and
    /// covers every synonym the control surface accepts.
    pub fn normalize(raw: &str) -> Result<Self, UnknownToken> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" | "accept" | "accepted" | "yes" => Ok(Self::Approved),
            "reject" | "rejected" | "deny" | "denied" | "no" => Ok(Self::Rejected),
            "cancel" | "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(UnknownToken(raw.to_string())),
        }
    }

    pub fn is_approved(self) -> bool {
        matches!(self, Self::Approved)
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = UnknownToken;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::normalize(s)
    }
}

/// Raw token that matched no known resolution variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resolution token: {0:?}")]
pub struct UnknownToken(pub String);

/// Outcome of a resolved (or expired) approval request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub decision: Decision,
    /// Optional free-text feedback from the resolver.
    pub feedback: Option<String>,
    /// True when the decision came from the expiry policy rather than a human.
    pub expired: bool,
}

impl Resolution {
    pub fn human(decision: Decision, feedback: Option<String>) -> Self {
        Self {
            decision,
            feedback,
            expired: false,
        }
    }

    pub fn expired_with(decision: Decision) -> Self {
        Self {
            decision,
            feedback: None,
            expired: true,
        }
    }
}
