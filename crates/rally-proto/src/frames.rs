use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::payload::WireMatchData;
use crate::snapshot::HomeAway;
use crate::MatchId;

/// Normal closure: the peer must not reconnect.
pub const CLOSE_NORMAL: u16 = 1000;
/// Application close code used to bounce a socket on purpose. The close
/// handler treats it as a request for an immediate fresh connect.
pub const CLOSE_FORCE_RECONNECT: u16 = 4000;

/// Frames sent from a satellite display to the scorekeeping server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    SubscribeMatch { match_id: MatchId },
    Ping { timestamp: i64 },
}

impl ClientFrame {
    pub fn subscribe(match_id: &MatchId) -> Self {
        ClientFrame::SubscribeMatch {
            match_id: match_id.clone(),
        }
    }

    pub fn ping_now() -> Self {
        ClientFrame::Ping {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Frames pushed by the scorekeeping server.
///
/// Unknown `type` values decode to [`ServerFrame::Other`] so newer servers do
/// not break older displays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    Pong,
    MatchDataUpdate(WireMatchData),
    #[serde(rename_all = "camelCase")]
    MatchFullData {
        match_id: MatchId,
        data: WireMatchData,
    },
    MatchAction(MatchActionFrame),
    #[serde(other)]
    Other,
}

impl ServerFrame {
    pub fn match_id(&self) -> Option<&MatchId> {
        match self {
            ServerFrame::MatchDataUpdate(data) => data.match_id.as_ref(),
            ServerFrame::MatchFullData { match_id, .. } => Some(match_id),
            ServerFrame::MatchAction(action) => Some(&action.match_id),
            ServerFrame::Pong | ServerFrame::Other => None,
        }
    }
}

/// Imperative event relayed by the server (timeout started, set ended, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchActionFrame {
    pub match_id: MatchId,
    pub action: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, rename = "_timestamp")]
    pub timestamp: Option<i64>,
}

/// Decoded form of [`MatchActionFrame`]. Consumers special-case the known
/// actions and can still forward anything else untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchAction {
    Timeout {
        team: Option<HomeAway>,
        countdown_secs: Option<u32>,
        started_at: Option<i64>,
    },
    Other {
        name: String,
        data: Value,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeoutData {
    #[serde(default)]
    team: Option<HomeAway>,
    #[serde(default)]
    countdown: Option<u32>,
    #[serde(default)]
    start_timestamp: Option<i64>,
}

impl MatchActionFrame {
    pub fn decode(&self) -> MatchAction {
        if self.action == "timeout" {
            if let Ok(data) = serde_json::from_value::<TimeoutData>(self.data.clone()) {
                return MatchAction::Timeout {
                    team: data.team,
                    countdown_secs: data.countdown,
                    started_at: data.start_timestamp,
                };
            }
        }
        MatchAction::Other {
            name: self.action.clone(),
            data: self.data.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_client_frames() {
        let frame = ClientFrame::subscribe(&MatchId::new("M1"));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value, serde_json::json!({"type": "subscribe-match", "matchId": "M1"}));

        let ping = serde_json::to_value(ClientFrame::Ping { timestamp: 7 }).unwrap();
        assert_eq!(ping, serde_json::json!({"type": "ping", "timestamp": 7}));
    }

    #[test]
    fn decodes_pong_and_unknown_frames() {
        let pong: ServerFrame = serde_json::from_str(r#"{"type":"pong","timestamp":1}"#).unwrap();
        assert!(matches!(pong, ServerFrame::Pong));

        let other: ServerFrame = serde_json::from_str(r#"{"type":"presence","who":3}"#).unwrap();
        assert!(matches!(other, ServerFrame::Other));
    }

    #[test]
    fn decodes_match_data_update() {
        let raw = serde_json::json!({
            "type": "match-data-update",
            "matchId": 12,
            "match": {"id": 12, "status": "live", "coinTossTeamA": "team1"},
            "homeTeam": {"name": "Panthers"},
            "awayTeam": {"name": "Gulls"},
            "sets": [{"index": 1, "homePoints": 3, "awayPoints": 1, "finished": false}],
            "events": [],
            "_timestamp": 1700000000000i64
        });
        let frame: ServerFrame = serde_json::from_value(raw).unwrap();
        assert_eq!(frame.match_id(), Some(&MatchId::new("12")));
        match frame {
            ServerFrame::MatchDataUpdate(data) => {
                assert_eq!(data.timestamp, Some(1_700_000_000_000));
                assert_eq!(data.sets.len(), 1);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn decodes_timeout_action() {
        let frame: ServerFrame = serde_json::from_value(serde_json::json!({
            "type": "match-action",
            "matchId": "M1",
            "action": "timeout",
            "data": {"team": "team2", "countdown": 30, "startTimestamp": 99},
            "_timestamp": 100
        }))
        .unwrap();
        let ServerFrame::MatchAction(action) = frame else {
            panic!("expected action frame");
        };
        assert_eq!(
            action.decode(),
            MatchAction::Timeout {
                team: Some(HomeAway::Away),
                countdown_secs: Some(30),
                started_at: Some(99),
            }
        );
    }

    #[test]
    fn unknown_actions_pass_through() {
        let action = MatchActionFrame {
            match_id: MatchId::new("M1"),
            action: "set_end".into(),
            data: serde_json::json!({"set": 1}),
            timestamp: None,
        };
        assert!(matches!(action.decode(), MatchAction::Other { ref name, .. } if name == "set_end"));
    }
}
