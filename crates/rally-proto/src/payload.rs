//! Full match payloads.
//!
//! [`WireMatchData`] is what the scorekeeping server sends (in push frames and
//! from `GET /api/match/:id`), legacy field names included. It is converted
//! into [`MatchPayload`] right away. [`MatchPayload::from_hosted`] builds the
//! same shape from rows read directly from the hosted service.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::snapshot::{CourtSide, HomeAway, RawLineup, RawLiveState, RawTally};
use crate::MatchId;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchInfo {
    #[serde(default)]
    pub id: Option<MatchId>,
    #[serde(default)]
    pub status: Option<String>,
    /// Which of home/away won the coin toss and became Team A.
    #[serde(default)]
    pub coin_toss_team_a: Option<HomeAway>,
    #[serde(default)]
    pub side_a: Option<CourtSide>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamInfo {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "short_name")]
    pub short_name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub team_id: Option<Value>,
    #[serde(default)]
    pub number: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodScore {
    #[serde(default = "first_period")]
    pub index: u32,
    #[serde(default, alias = "team1Points", deserialize_with = "crate::null_default")]
    pub home_points: u32,
    #[serde(default, alias = "team2Points", deserialize_with = "crate::null_default")]
    pub away_points: u32,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub serving_team: Option<HomeAway>,
    #[serde(default)]
    pub server_number: Option<u32>,
}

fn first_period() -> u32 {
    1
}

impl PeriodScore {
    pub fn opening() -> Self {
        Self {
            index: 1,
            home_points: 0,
            away_points: 0,
            finished: false,
            serving_team: None,
            server_number: None,
        }
    }
}

/// Match data as the scorekeeping server sends it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMatchData {
    #[serde(default)]
    pub match_id: Option<MatchId>,
    #[serde(default, rename = "match")]
    pub match_info: Option<MatchInfo>,
    #[serde(default)]
    pub home_team: Option<TeamInfo>,
    #[serde(default)]
    pub away_team: Option<TeamInfo>,
    #[serde(default, deserialize_with = "crate::null_default")]
    pub home_players: Vec<Player>,
    #[serde(default, deserialize_with = "crate::null_default")]
    pub away_players: Vec<Player>,
    #[serde(default, deserialize_with = "crate::null_default")]
    pub sets: Vec<PeriodScore>,
    #[serde(default, deserialize_with = "crate::null_default")]
    pub events: Vec<Value>,
    #[serde(default, rename = "_timestamp")]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub live_state: Option<RawLiveState>,

    // Older servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team1: Option<TeamInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team2: Option<TeamInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "crate::null_default")]
    pub team1_players: Vec<Player>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "crate::null_default")]
    pub team2_players: Vec<Player>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "crate::null_default")]
    pub teams: Vec<TeamInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "crate::null_default")]
    pub players: Vec<Player>,
    #[serde(default, rename = "timestamp", skip_serializing_if = "Option::is_none")]
    pub legacy_timestamp: Option<i64>,
}

/// Response of `GET /api/match/:id`.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchDataResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: WireMatchData,
}

/// Canonical full state of one match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchPayload {
    pub match_id: Option<MatchId>,
    pub info: MatchInfo,
    pub home_team: Option<TeamInfo>,
    pub away_team: Option<TeamInfo>,
    pub home_players: Vec<Player>,
    pub away_players: Vec<Player>,
    pub periods: Vec<PeriodScore>,
    pub events: Vec<Value>,
    pub live_state: Option<RawLiveState>,
    pub timestamp: Option<i64>,
}

fn same_key(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(a), Value::Number(b)) | (Value::Number(b), Value::String(a)) => *a == b.to_string(),
        _ => a == b,
    }
}

fn players_of(team: Option<&TeamInfo>, players: &[Player]) -> Vec<Player> {
    let Some(team_id) = team.and_then(|t| t.id.as_ref()) else {
        return Vec::new();
    };
    players
        .iter()
        .filter(|p| p.team_id.as_ref().is_some_and(|id| same_key(id, team_id)))
        .cloned()
        .collect()
}

impl WireMatchData {
    pub fn normalize(self) -> MatchPayload {
        let mut teams = self.teams.into_iter();
        let legacy_home = teams.next();
        let legacy_away = teams.next();
        let home_team = self.home_team.or(self.team1).or(legacy_home);
        let away_team = self.away_team.or(self.team2).or(legacy_away);

        let pick = |current: Vec<Player>, legacy: Vec<Player>, team: Option<&TeamInfo>| {
            if !current.is_empty() {
                current
            } else if !legacy.is_empty() {
                legacy
            } else {
                players_of(team, &self.players)
            }
        };
        let home_players = pick(self.home_players, self.team1_players, home_team.as_ref());
        let away_players = pick(self.away_players, self.team2_players, away_team.as_ref());

        let info = self.match_info.unwrap_or_default();
        MatchPayload {
            match_id: self.match_id.or_else(|| info.id.clone()),
            info,
            home_team,
            away_team,
            home_players,
            away_players,
            periods: self.sets,
            events: self.events,
            live_state: self.live_state,
            timestamp: self.timestamp.or(self.legacy_timestamp),
        }
    }
}

/// A `matches` row of the hosted service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchRow {
    pub id: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub team1_team: Option<TeamInfo>,
    #[serde(default)]
    pub team2_team: Option<TeamInfo>,
    #[serde(default)]
    pub team1_team_name: Option<String>,
    #[serde(default)]
    pub team2_team_name: Option<String>,
    #[serde(default)]
    pub coin_toss: Option<CoinToss>,
    #[serde(default)]
    pub coin_toss_team_a: Option<HomeAway>,
    #[serde(default, deserialize_with = "crate::null_default")]
    pub players_team1: Vec<Player>,
    #[serde(default, deserialize_with = "crate::null_default")]
    pub players_team2: Vec<Player>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoinToss {
    #[serde(default)]
    pub team_a: Option<HomeAway>,
    #[serde(default)]
    pub serve_a: Option<bool>,
    #[serde(default)]
    pub first_serve: Option<String>,
}

impl MatchPayload {
    /// Derives a payload from hosted rows when the primary server is not
    /// reachable. Team A's identity comes from the live-state team name,
    /// then the recorded coin toss.
    pub fn from_hosted(external_id: &MatchId, row: &MatchRow, live: Option<RawLiveState>) -> Self {
        let team_name = |json: &Option<TeamInfo>, column: &Option<String>, fallback: &str| {
            json.as_ref()
                .and_then(|t| t.name.clone())
                .or_else(|| column.clone())
                .unwrap_or_else(|| fallback.to_string())
        };
        let home_name = team_name(&row.team1_team, &row.team1_team_name, "Team 1");
        let away_name = team_name(&row.team2_team, &row.team2_team_name, "Team 2");

        let coin_toss_team_a = match live.as_ref().and_then(|l| l.team_a_name.as_deref()) {
            Some(name) if name == home_name => Some(HomeAway::Home),
            Some(_) => Some(HomeAway::Away),
            None => row.coin_toss.as_ref().and_then(|c| c.team_a).or(row.coin_toss_team_a),
        };
        let a_home = coin_toss_team_a != Some(HomeAway::Away);
        let a_team = if a_home { HomeAway::Home } else { HomeAway::Away };

        let color = |home: bool, json: &Option<TeamInfo>| {
            live.as_ref()
                .and_then(|l| if home == a_home { l.team_a_color.clone() } else { l.team_b_color.clone() })
                .or_else(|| json.as_ref().and_then(|t| t.color.clone()))
        };
        let home_team = TeamInfo {
            id: None,
            name: Some(home_name),
            short_name: row.team1_team.as_ref().and_then(|t| t.short_name.clone()),
            color: color(true, &row.team1_team),
        };
        let away_team = TeamInfo {
            id: None,
            name: Some(away_name),
            short_name: row.team2_team.as_ref().and_then(|t| t.short_name.clone()),
            color: color(false, &row.team2_team),
        };

        let (periods, events) = match live.as_ref() {
            Some(live) => (vec![current_period(live, a_home)], derived_events(live, a_team)),
            None => (vec![PeriodScore::opening()], Vec::new()),
        };

        let mut extra = row.extra.clone();
        extra.insert("internalId".to_string(), Value::String(row.id.clone()));
        let info = MatchInfo {
            id: Some(external_id.clone()),
            status: live.as_ref().and_then(|l| l.match_status.clone()).or_else(|| row.status.clone()),
            coin_toss_team_a,
            side_a: live.as_ref().and_then(|l| l.side_a),
            extra,
        };

        MatchPayload {
            match_id: Some(external_id.clone()),
            info,
            home_team: Some(home_team),
            away_team: Some(away_team),
            home_players: row.players_team1.clone(),
            away_players: row.players_team2.clone(),
            periods,
            events,
            live_state: live,
            timestamp: None,
        }
    }
}

fn current_period(live: &RawLiveState, a_home: bool) -> PeriodScore {
    let (home_points, away_points) = if a_home {
        (live.points_a, live.points_b)
    } else {
        (live.points_b, live.points_a)
    };
    let side_a = live.side_a.unwrap_or(CourtSide::Left);
    let left_is_home = (side_a == CourtSide::Left) == a_home;

    let lead_server = |lineup: &Option<RawLineup>| {
        lineup
            .as_ref()
            .and_then(|l| l.slots().into_iter().find(|s| s.position == "I"))
    };
    let (serving_team, server_number) = if let Some(side) = live.serving_team {
        let team = if (side == CourtSide::Left) == left_is_home {
            HomeAway::Home
        } else {
            HomeAway::Away
        };
        let serving_is_a = (team == HomeAway::Home) == a_home;
        let lineup = if serving_is_a { &live.lineup_a } else { &live.lineup_b };
        (Some(team), lead_server(lineup).and_then(|s| s.number))
    } else {
        let a_team = if a_home { HomeAway::Home } else { HomeAway::Away };
        match (lead_server(&live.lineup_a), lead_server(&live.lineup_b)) {
            (Some(slot), _) if slot.serving => (Some(a_team), slot.number),
            (_, Some(slot)) if slot.serving => (Some(a_team.opposite()), slot.number),
            _ => (None, None),
        }
    };

    PeriodScore {
        index: live.current_set.unwrap_or(1).max(1),
        home_points,
        away_points,
        finished: false,
        serving_team,
        server_number,
    }
}

/// Upper bound on timeouts expanded from a bare tally per team.
const MAX_TALLIED_TIMEOUTS: u32 = 8;

fn derived_events(live: &RawLiveState, a_team: HomeAway) -> Vec<Value> {
    let period = live.current_set.unwrap_or(1).max(1);
    let team_name = |team: HomeAway| match team {
        HomeAway::Home => "home",
        HomeAway::Away => "away",
    };
    let mut events = Vec::new();

    for (lineup, team) in [(&live.lineup_a, a_team), (&live.lineup_b, a_team.opposite())] {
        if let Some(lineup) = lineup {
            events.push(json!({
                "type": "lineup",
                "setIndex": period,
                "payload": {"team": team_name(team), "lineup": lineup.slots()},
            }));
        }
    }
    for (sanctions, team) in [(&live.sanctions_a, a_team), (&live.sanctions_b, a_team.opposite())] {
        for sanction in sanctions {
            events.push(json!({
                "type": "sanction",
                "setIndex": period,
                "ts": sanction.get("ts"),
                "payload": {
                    "team": team_name(team),
                    "playerNumber": sanction.get("player"),
                    "type": sanction.get("type"),
                    "role": sanction.get("role"),
                },
            }));
        }
    }
    for (timeouts, team) in [(&live.timeouts_a, a_team), (&live.timeouts_b, a_team.opposite())] {
        match timeouts {
            Some(RawTally::List(entries)) => {
                for entry in entries {
                    events.push(json!({
                        "type": "timeout",
                        "setIndex": period,
                        "ts": entry.get("ts"),
                        "payload": {"team": team_name(team)},
                    }));
                }
            }
            Some(RawTally::Count(count)) => {
                for _ in 0..(*count).min(MAX_TALLIED_TIMEOUTS) {
                    events.push(json!({
                        "type": "timeout",
                        "setIndex": period,
                        "payload": {"team": team_name(team)},
                    }));
                }
            }
            None => {}
        }
    }
    events
}
