//! Wire and record types shared by the rally realtime layer.
//!
//! Everything that crosses a process boundary lives here:
//! - `frames`: the direct-socket protocol spoken with the scorekeeping server
//! - `feed`: row notifications and channel messages of the hosted change feed
//! - `job`: the durable record of one pending remote write
//! - `payload` / `snapshot`: loosely shaped match data and the canonical
//!   side-neutral snapshot it is normalized into

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

pub mod feed;
pub mod frames;
pub mod job;
pub mod payload;
pub mod snapshot;

pub use feed::{ChangeKind, FeedTable, RowChange};
pub use frames::{ClientFrame, MatchActionFrame, ServerFrame, CLOSE_FORCE_RECONNECT, CLOSE_NORMAL};
pub use job::{JobAction, JobStatus, NewJob, Resource, SyncJob};
pub use payload::{MatchInfo, MatchPayload, WireMatchData};
pub use snapshot::{CourtSide, HomeAway, LiveStateSnapshot, TeamSlot, TeamTally};

/// Stable external identifier of one scoring session.
///
/// Servers are inconsistent about sending it as a JSON string or number, so
/// both are accepted and stored as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MatchId(String);

impl MatchId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id has the shape of a hosted-service row id.
    pub fn looks_like_row_id(&self) -> bool {
        let bytes = self.0.as_bytes();
        if bytes.len() != 36 {
            return false;
        }
        bytes.iter().enumerate().all(|(idx, b)| match idx {
            8 | 13 | 18 | 23 => *b == b'-',
            _ => b.is_ascii_hexdigit(),
        })
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MatchId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MatchId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl<'de> Deserialize<'de> for MatchId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(i64),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(text) => MatchId(text),
            Repr::Number(number) => MatchId(number.to_string()),
        })
    }
}

/// Treats an explicit JSON `null` like a missing field.
pub(crate) fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
