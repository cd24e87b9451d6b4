use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Kind of remote record a job writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Match,
    #[serde(alias = "set")]
    Period,
    Event,
}

impl Resource {
    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Match => "match",
            Resource::Period => "period",
            Resource::Event => "event",
        }
    }

    /// Children reference the parent match through its internal row id.
    pub fn depends_on_match(self) -> bool {
        !matches!(self, Resource::Match)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Insert,
    Update,
}

impl JobAction {
    pub fn as_str(self) -> &'static str {
        match self {
            JobAction::Insert => "insert",
            JobAction::Update => "update",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Sent,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Sent => "sent",
            JobStatus::Error => "error",
        }
    }

    /// `sent` is terminal; every other transition is allowed.
    pub fn can_become(self, next: JobStatus) -> bool {
        self != JobStatus::Sent || next == JobStatus::Sent
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant `{}`", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! impl_from_str {
    ($ty:ty { $($text:literal => $variant:expr),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($variant),)+
                    other => Err(UnknownVariant(other.to_string())),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

impl_from_str!(Resource { "match" => Resource::Match, "period" => Resource::Period, "set" => Resource::Period, "event" => Resource::Event });
impl_from_str!(JobAction { "insert" => JobAction::Insert, "update" => JobAction::Update });
impl_from_str!(JobStatus { "queued" => JobStatus::Queued, "sent" => JobStatus::Sent, "error" => JobStatus::Error });

/// A write submitted by a caller, before the store assigns it an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub resource: Resource,
    pub action: JobAction,
    pub payload: Value,
}

impl NewJob {
    pub fn new(resource: Resource, action: JobAction, payload: Value) -> Self {
        Self {
            resource,
            action,
            payload,
        }
    }

    /// External match id the payload refers to, if any.
    pub fn match_ref(&self) -> Option<&str> {
        match self.resource {
            Resource::Match => self.payload.get("external_id").and_then(Value::as_str),
            _ => self.payload.get("match_id").and_then(Value::as_str),
        }
    }
}

/// Durable record of one pending remote write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub resource: Resource,
    pub action: JobAction,
    pub payload: Value,
    /// Enqueue time in unix milliseconds.
    pub timestamp: i64,
    pub status: JobStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
}

impl SyncJob {
    pub fn from_new(id: String, timestamp: i64, job: NewJob) -> Self {
        Self {
            id,
            resource: job.resource,
            action: job.action,
            payload: job.payload,
            timestamp,
            status: JobStatus::Queued,
            retry_count: 0,
            error_message: None,
            error_code: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status != JobStatus::Sent
    }
}
