//! Side-neutral live state.
//!
//! Stored rows describe the match in terms of Team A and Team B (A is the
//! coin-toss winner and never changes) plus which court side A occupies and
//! whether A is the home team. The raw row shape is loose: lineups come in
//! three formats and timeout/substitution tallies are either lists or plain
//! counts. Everything is normalized into [`LiveStateSnapshot`] here and no
//! other module looks at the raw shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::payload::{MatchPayload, PeriodScore};
use crate::MatchId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HomeAway {
    #[serde(alias = "team1")]
    Home,
    #[serde(alias = "team2")]
    Away,
}

impl HomeAway {
    pub fn opposite(self) -> Self {
        match self {
            HomeAway::Home => HomeAway::Away,
            HomeAway::Away => HomeAway::Home,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CourtSide {
    Left,
    Right,
}

impl CourtSide {
    pub fn opposite(self) -> Self {
        match self {
            CourtSide::Left => CourtSide::Right,
            CourtSide::Right => CourtSide::Left,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamSlot {
    A,
    B,
}

impl TeamSlot {
    pub fn opposite(self) -> Self {
        match self {
            TeamSlot::A => TeamSlot::B,
            TeamSlot::B => TeamSlot::A,
        }
    }
}

/// A `match_live_state` row as stored by the hosted service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawLiveState {
    #[serde(default)]
    pub match_id: Option<String>,
    #[serde(default)]
    pub team_a_name: Option<String>,
    #[serde(default)]
    pub team_b_name: Option<String>,
    #[serde(default)]
    pub team_a_color: Option<String>,
    #[serde(default)]
    pub team_b_color: Option<String>,
    #[serde(default)]
    pub side_a: Option<CourtSide>,
    #[serde(default, deserialize_with = "crate::null_default")]
    pub points_a: u32,
    #[serde(default, deserialize_with = "crate::null_default")]
    pub points_b: u32,
    #[serde(default, deserialize_with = "crate::null_default")]
    pub sets_won_a: u32,
    #[serde(default, deserialize_with = "crate::null_default")]
    pub sets_won_b: u32,
    #[serde(default)]
    pub current_set: Option<u32>,
    /// Court side of the serving team.
    #[serde(default)]
    pub serving_team: Option<CourtSide>,
    #[serde(default)]
    pub lineup_a: Option<RawLineup>,
    #[serde(default)]
    pub lineup_b: Option<RawLineup>,
    #[serde(default, deserialize_with = "crate::null_default")]
    pub sanctions_a: Vec<Value>,
    #[serde(default, deserialize_with = "crate::null_default")]
    pub sanctions_b: Vec<Value>,
    #[serde(default)]
    pub timeouts_a: Option<RawTally>,
    #[serde(default)]
    pub timeouts_b: Option<RawTally>,
    #[serde(default)]
    pub substitutions_a: Option<RawTally>,
    #[serde(default)]
    pub substitutions_b: Option<RawTally>,
    #[serde(default)]
    pub match_status: Option<String>,
}

/// Lineup formats seen in stored rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawLineup {
    /// `{"I": {"number": 7, "isServing": true, ...}, ...}`
    Rich(BTreeMap<String, RichSlot>),
    /// `{"I": 7, "II": 3}`
    Legacy(BTreeMap<String, u32>),
    /// `[7, 3]`, positions implied by index.
    List(Vec<u32>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RichSlot {
    #[serde(default)]
    pub number: Option<u32>,
    #[serde(default)]
    pub is_serving: bool,
    #[serde(default)]
    pub is_captain: bool,
    #[serde(default)]
    pub is_court_captain: bool,
}

const POSITIONS: [&str; 6] = ["I", "II", "III", "IV", "V", "VI"];

impl RawLineup {
    /// Slots ordered by court position.
    pub fn slots(&self) -> Vec<LineupSlot> {
        match self {
            // Roman numerals up to VI sort lexically in court order.
            RawLineup::Rich(map) => map
                .iter()
                .map(|(position, slot)| LineupSlot {
                    position: position.clone(),
                    number: slot.number,
                    serving: slot.is_serving,
                    captain: slot.is_captain,
                    court_captain: slot.is_court_captain,
                })
                .collect(),
            RawLineup::Legacy(map) => map
                .iter()
                .map(|(position, number)| LineupSlot::plain(position.clone(), *number))
                .collect(),
            RawLineup::List(numbers) => numbers
                .iter()
                .enumerate()
                .map(|(idx, number)| {
                    let position = POSITIONS.get(idx).map(|p| p.to_string()).unwrap_or_else(|| (idx + 1).to_string());
                    LineupSlot::plain(position, *number)
                })
                .collect(),
        }
    }
}

/// Either a list of entries or a bare count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTally {
    Count(u32),
    List(Vec<Value>),
}

impl RawTally {
    pub fn count(&self) -> u32 {
        match self {
            RawTally::Count(count) => *count,
            RawTally::List(items) => u32::try_from(items.len()).unwrap_or(u32::MAX),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineupSlot {
    pub position: String,
    pub number: Option<u32>,
    pub serving: bool,
    pub captain: bool,
    pub court_captain: bool,
}

impl LineupSlot {
    fn plain(position: String, number: u32) -> Self {
        Self {
            position,
            number: Some(number),
            serving: false,
            captain: false,
            court_captain: false,
        }
    }
}

/// Everything known about one team, still keyed A/B.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamTally {
    pub name: Option<String>,
    pub color: Option<String>,
    pub points: u32,
    pub periods_won: u32,
    pub lineup: Vec<LineupSlot>,
    pub sanctions: Vec<Value>,
    pub timeouts: u32,
    pub substitutions: u32,
}

/// Canonical side-neutral state of one match.
///
/// `team_a_is_home` and `side_a` stay `None` until they are recorded; the
/// reconciler decides how to present that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveStateSnapshot {
    pub match_id: MatchId,
    pub team_a: TeamTally,
    pub team_b: TeamTally,
    pub team_a_is_home: Option<bool>,
    pub side_a: Option<CourtSide>,
    pub serving: Option<TeamSlot>,
    pub current_period: u32,
    pub match_status: Option<String>,
}

impl LiveStateSnapshot {
    /// Empty snapshot with nothing recorded yet.
    pub fn blank(match_id: MatchId) -> Self {
        Self {
            match_id,
            team_a: TeamTally::default(),
            team_b: TeamTally::default(),
            team_a_is_home: None,
            side_a: None,
            serving: None,
            current_period: 1,
            match_status: None,
        }
    }

    pub fn team(&self, slot: TeamSlot) -> &TeamTally {
        match slot {
            TeamSlot::A => &self.team_a,
            TeamSlot::B => &self.team_b,
        }
    }

    /// Normalizes a stored live-state row.
    ///
    /// Team A's home flag comes from comparing `team_a_name` with the home
    /// team's name, falling back to the recorded coin toss.
    pub fn from_live_state(
        match_id: MatchId,
        raw: &RawLiveState,
        home_name: Option<&str>,
        coin_toss_team_a: Option<HomeAway>,
    ) -> Self {
        let team_a_is_home = match (raw.team_a_name.as_deref(), home_name) {
            (Some(a), Some(home)) => Some(a == home),
            _ => coin_toss_team_a.map(|team| team == HomeAway::Home),
        };

        let lineup_a = raw.lineup_a.as_ref().map(RawLineup::slots).unwrap_or_default();
        let lineup_b = raw.lineup_b.as_ref().map(RawLineup::slots).unwrap_or_default();

        let serving = match raw.serving_team {
            Some(side) => Some(if side == raw.side_a.unwrap_or(CourtSide::Left) {
                TeamSlot::A
            } else {
                TeamSlot::B
            }),
            None if serving_from_lineup(&lineup_a) => Some(TeamSlot::A),
            None if serving_from_lineup(&lineup_b) => Some(TeamSlot::B),
            None => None,
        };

        let tally = |r: &Option<RawTally>| r.as_ref().map(RawTally::count).unwrap_or(0);

        Self {
            match_id,
            team_a: TeamTally {
                name: raw.team_a_name.clone(),
                color: raw.team_a_color.clone(),
                points: raw.points_a,
                periods_won: raw.sets_won_a,
                lineup: lineup_a,
                sanctions: raw.sanctions_a.clone(),
                timeouts: tally(&raw.timeouts_a),
                substitutions: tally(&raw.substitutions_a),
            },
            team_b: TeamTally {
                name: raw.team_b_name.clone(),
                color: raw.team_b_color.clone(),
                points: raw.points_b,
                periods_won: raw.sets_won_b,
                lineup: lineup_b,
                sanctions: raw.sanctions_b.clone(),
                timeouts: tally(&raw.timeouts_b),
                substitutions: tally(&raw.substitutions_b),
            },
            team_a_is_home,
            side_a: raw.side_a,
            serving,
            current_period: raw.current_set.unwrap_or(1).max(1),
            match_status: raw.match_status.clone(),
        }
    }

    /// Normalizes a full match payload. A carried live-state row wins;
    /// otherwise the state is derived from the period scores.
    pub fn from_payload(match_id: MatchId, payload: &MatchPayload) -> Self {
        let home_name = payload.home_team.as_ref().and_then(|t| t.name.as_deref());
        if let Some(raw) = payload.live_state.as_ref() {
            return Self::from_live_state(match_id, raw, home_name, payload.info.coin_toss_team_a);
        }

        let team_a_is_home = payload.info.coin_toss_team_a.map(|team| team == HomeAway::Home);
        let a_home = team_a_is_home.unwrap_or(true);
        let (a_team, b_team) = if a_home {
            (payload.home_team.as_ref(), payload.away_team.as_ref())
        } else {
            (payload.away_team.as_ref(), payload.home_team.as_ref())
        };

        let current = payload.periods.iter().max_by_key(|p| p.index);
        let points_of = |period: &PeriodScore, home: bool| if home { period.home_points } else { period.away_points };
        let won = |home: bool| {
            let count = payload
                .periods
                .iter()
                .filter(|p| p.finished && points_of(p, home) > points_of(p, !home))
                .count();
            u32::try_from(count).unwrap_or(u32::MAX)
        };

        let serving = current.and_then(|p| p.serving_team).map(|team| {
            if (team == HomeAway::Home) == a_home {
                TeamSlot::A
            } else {
                TeamSlot::B
            }
        });

        let unfinished = current.filter(|p| !p.finished);
        Self {
            match_id,
            team_a: TeamTally {
                name: a_team.and_then(|t| t.name.clone()),
                color: a_team.and_then(|t| t.color.clone()),
                points: unfinished.map(|p| points_of(p, a_home)).unwrap_or(0),
                periods_won: won(a_home),
                ..TeamTally::default()
            },
            team_b: TeamTally {
                name: b_team.and_then(|t| t.name.clone()),
                color: b_team.and_then(|t| t.color.clone()),
                points: unfinished.map(|p| points_of(p, !a_home)).unwrap_or(0),
                periods_won: won(!a_home),
                ..TeamTally::default()
            },
            team_a_is_home,
            side_a: payload.info.side_a,
            serving,
            current_period: current.map(|p| p.index).unwrap_or(1).max(1),
            match_status: payload.info.status.clone(),
        }
    }
}

fn serving_from_lineup(slots: &[LineupSlot]) -> bool {
    slots.iter().any(|slot| slot.position == "I" && slot.serving)
}
