use serde::{Deserialize, Serialize};

/// Lifecycle status shared by operations and steps.
///
/// `Paused` and `Retrying` are transient sub-states of `Running`: they exist
/// for UI signaling and never allow a transition backwards out of a terminal
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Created, not yet started
    Pending,
    /// Executing
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an unrecoverable failure
    Failed,
    /// Stopped by the caller (not an error condition)
    Cancelled,
    /// Suspended between checkpoints
    Paused,
    /// Waiting for the next retry attempt
    Retrying,
}

impl Status {
    /// Returns the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
            Self::Retrying => "retrying",
        }
    }

    /// `completed`, `failed` and `cancelled` accept no further transitions.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the transition `self -> next` is allowed.
    #[must_use]
    pub fn can_transition_to(&self, next: Status) -> bool {
        use Status::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, Completed | Failed | Cancelled | Retrying | Paused) => true,
            (Retrying, Running | Failed | Cancelled) => true,
            (Paused, Running | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "paused" => Ok(Self::Paused),
            "retrying" => Ok(Self::Retrying),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}
