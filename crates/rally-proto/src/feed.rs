//! Hosted change-feed types.
//!
//! The hosted service speaks a Phoenix-style channel protocol over a
//! websocket: the client joins one topic per match with a list of
//! `postgres_changes` filters, answers heartbeats, and receives row-level
//! notifications that are normalized into [`RowChange`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Tables the feed is subscribed to for one match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedTable {
    Matches,
    Events,
    #[serde(rename = "sets")]
    Periods,
    MatchLiveState,
}

impl FeedTable {
    /// Child tables keyed by the match's internal row id.
    pub const CHILDREN: [FeedTable; 3] = [FeedTable::Events, FeedTable::Periods, FeedTable::MatchLiveState];

    pub fn table_name(self) -> &'static str {
        match self {
            FeedTable::Matches => "matches",
            FeedTable::Events => "events",
            FeedTable::Periods => "sets",
            FeedTable::MatchLiveState => "match_live_state",
        }
    }

    pub fn from_table_name(name: &str) -> Option<Self> {
        match name {
            "matches" => Some(FeedTable::Matches),
            "events" => Some(FeedTable::Events),
            "sets" => Some(FeedTable::Periods),
            "match_live_state" => Some(FeedTable::MatchLiveState),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row-level notification: `{eventType, new, old}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    #[serde(rename = "eventType")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub table: Option<FeedTable>,
    #[serde(default)]
    pub new: Value,
    #[serde(default)]
    pub old: Value,
}

/// One subscription filter inside a channel join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub event: String,
    pub schema: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl ChangeFilter {
    pub fn all(table: FeedTable, column: &str, value: &str) -> Self {
        Self {
            event: "*".to_string(),
            schema: "public".to_string(),
            table: table.table_name().to_string(),
            filter: Some(format!("{column}=eq.{value}")),
        }
    }
}

/// Raw channel envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

pub const PHOENIX_TOPIC: &str = "phoenix";

impl ChannelMessage {
    pub fn join(topic: &str, filters: &[ChangeFilter], access_token: Option<&str>, reference: String) -> Self {
        let mut payload = json!({
            "config": {
                "broadcast": {"self": false},
                "presence": {"key": ""},
                "postgres_changes": filters,
            }
        });
        if let Some(token) = access_token {
            payload["access_token"] = Value::String(token.to_string());
        }
        Self {
            topic: topic.to_string(),
            event: "phx_join".to_string(),
            payload,
            reference: Some(reference),
        }
    }

    pub fn leave(topic: &str, reference: String) -> Self {
        Self {
            topic: topic.to_string(),
            event: "phx_leave".to_string(),
            payload: json!({}),
            reference: Some(reference),
        }
    }

    pub fn heartbeat(reference: String) -> Self {
        Self {
            topic: PHOENIX_TOPIC.to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            reference: Some(reference),
        }
    }

    pub fn classify(&self) -> ChannelEvent {
        match self.event.as_str() {
            "postgres_changes" => match serde_json::from_value::<ChangeEnvelope>(self.payload.clone()) {
                Ok(envelope) => ChannelEvent::Change(envelope.data.into_row_change()),
                Err(err) => ChannelEvent::Malformed(err.to_string()),
            },
            "phx_reply" => {
                let status = self.payload.get("status").and_then(Value::as_str).unwrap_or_default();
                if status == "ok" {
                    ChannelEvent::Reply { ok: true, message: None }
                } else {
                    ChannelEvent::Reply {
                        ok: false,
                        message: self.payload.get("response").map(|r| r.to_string()),
                    }
                }
            }
            "system" => {
                let status = self.payload.get("status").and_then(Value::as_str).unwrap_or_default();
                let message = self.payload.get("message").and_then(Value::as_str).map(str::to_string);
                if status == "ok" {
                    ChannelEvent::Status(ChannelStatus::Subscribed)
                } else {
                    ChannelEvent::Status(ChannelStatus::ChannelError(message.unwrap_or_default()))
                }
            }
            "phx_error" => ChannelEvent::Status(ChannelStatus::ChannelError(self.payload.to_string())),
            "phx_close" => ChannelEvent::Status(ChannelStatus::Closed),
            _ => ChannelEvent::Ignored,
        }
    }
}

/// Provider-reported subscription status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Subscribed => "SUBSCRIBED",
            ChannelStatus::ChannelError(_) => "CHANNEL_ERROR",
            ChannelStatus::TimedOut => "TIMED_OUT",
            ChannelStatus::Closed => "CLOSED",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Change(RowChange),
    Reply { ok: bool, message: Option<String> },
    Status(ChannelStatus),
    Malformed(String),
    Ignored,
}

#[derive(Deserialize)]
struct ChangeEnvelope {
    data: PostgresChange,
}

#[derive(Deserialize)]
struct PostgresChange {
    #[serde(rename = "type")]
    kind: ChangeKind,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    record: Value,
    #[serde(default)]
    old_record: Value,
}

impl PostgresChange {
    fn into_row_change(self) -> RowChange {
        RowChange {
            kind: self.kind,
            table: self.table.as_deref().and_then(FeedTable::from_table_name),
            new: self.record,
            old: self.old_record,
        }
    }
}
