//! Side-neutral snapshot to client viewpoint.
//!
//! A snapshot names teams A and B. Displays want "home/away" (scoreboards),
//! "left/right" (a referee facing the court) or "us/them" (a team bench).
//! [`reconcile`] maps one onto the other using the identity recorded in the
//! snapshot itself, so a stale mapping can never leak between updates.

use rally_proto::{CourtSide, HomeAway, LiveStateSnapshot, MatchId, TeamSlot, TeamTally};
use serde::Serialize;

/// Terms the caller wants the state expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Viewpoint {
    /// Primary is the home team.
    HomeAway,
    /// Primary is the team on the left.
    LeftRight,
    /// Primary is the caller's own team.
    SelfOpponent { me: HomeAway },
}

/// How A/B-relative facts translate into home/away and left/right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TeamIdentity {
    pub team_a_is_home: bool,
    pub side_a: CourtSide,
}

impl TeamIdentity {
    pub fn home_of(&self, slot: TeamSlot) -> HomeAway {
        match (slot, self.team_a_is_home) {
            (TeamSlot::A, true) | (TeamSlot::B, false) => HomeAway::Home,
            _ => HomeAway::Away,
        }
    }

    pub fn side_of(&self, slot: TeamSlot) -> CourtSide {
        match slot {
            TeamSlot::A => self.side_a,
            TeamSlot::B => self.side_a.opposite(),
        }
    }

    pub fn slot_for(&self, team: HomeAway) -> TeamSlot {
        if self.home_of(TeamSlot::A) == team {
            TeamSlot::A
        } else {
            TeamSlot::B
        }
    }

    pub fn slot_on(&self, side: CourtSide) -> TeamSlot {
        if self.side_a == side {
            TeamSlot::A
        } else {
            TeamSlot::B
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerspectiveTeam {
    pub slot: TeamSlot,
    pub home_away: HomeAway,
    pub side: CourtSide,
    pub serving: bool,
    #[serde(flatten)]
    pub tally: TeamTally,
}

/// Which of the two view positions currently serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Seat {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientPerspectiveState {
    pub match_id: MatchId,
    pub viewpoint: Viewpoint,
    /// Side assignment not recorded yet; the identity is the default guess.
    pub provisional: bool,
    pub identity: TeamIdentity,
    pub primary: PerspectiveTeam,
    pub secondary: PerspectiveTeam,
    pub serving: Option<Seat>,
    pub current_period: u32,
    pub match_status: Option<String>,
}

impl ClientPerspectiveState {
    pub fn seat(&self, seat: Seat) -> &PerspectiveTeam {
        match seat {
            Seat::Primary => &self.primary,
            Seat::Secondary => &self.secondary,
        }
    }
}

/// Pure and total: every snapshot yields a state for every viewpoint.
pub fn reconcile(snapshot: &LiveStateSnapshot, viewpoint: Viewpoint) -> ClientPerspectiveState {
    let provisional = snapshot.team_a_is_home.is_none() || snapshot.side_a.is_none();
    let identity = TeamIdentity {
        team_a_is_home: snapshot.team_a_is_home.unwrap_or(true),
        side_a: snapshot.side_a.unwrap_or(CourtSide::Left),
    };

    let primary_slot = match viewpoint {
        Viewpoint::HomeAway => identity.slot_for(HomeAway::Home),
        Viewpoint::LeftRight => identity.slot_on(CourtSide::Left),
        Viewpoint::SelfOpponent { me } => identity.slot_for(me),
    };

    let team = |slot: TeamSlot| PerspectiveTeam {
        slot,
        home_away: identity.home_of(slot),
        side: identity.side_of(slot),
        serving: snapshot.serving == Some(slot),
        tally: snapshot.team(slot).clone(),
    };

    let serving = snapshot.serving.map(|slot| {
        if slot == primary_slot {
            Seat::Primary
        } else {
            Seat::Secondary
        }
    });

    ClientPerspectiveState {
        match_id: snapshot.match_id.clone(),
        viewpoint,
        provisional,
        identity,
        primary: team(primary_slot),
        secondary: team(primary_slot.opposite()),
        serving,
        current_period: snapshot.current_period,
        match_status: snapshot.match_status.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snapshot(points_a: u32, points_b: u32, a_home: Option<bool>, side_a: Option<CourtSide>) -> LiveStateSnapshot {
        let mut snap = LiveStateSnapshot::blank(MatchId::new("M1"));
        snap.team_a.name = Some("Panthers".into());
        snap.team_a.points = points_a;
        snap.team_b.name = Some("Gulls".into());
        snap.team_b.points = points_b;
        snap.team_a_is_home = a_home;
        snap.side_a = side_a;
        snap
    }

    fn score(state: &ClientPerspectiveState) -> (u32, u32) {
        (state.primary.tally.points, state.secondary.tally.points)
    }

    #[test]
    fn side_switch_moves_left_right_but_not_home_away() {
        let mut snap = snapshot(10, 8, Some(true), Some(CourtSide::Left));
        assert_eq!(score(&reconcile(&snap, Viewpoint::HomeAway)), (10, 8));
        assert_eq!(score(&reconcile(&snap, Viewpoint::LeftRight)), (10, 8));

        snap.side_a = Some(CourtSide::Right);
        let home_away = reconcile(&snap, Viewpoint::HomeAway);
        let left_right = reconcile(&snap, Viewpoint::LeftRight);
        assert_eq!(score(&home_away), (10, 8));
        assert_eq!(score(&left_right), (8, 10));
        assert_eq!(left_right.primary.tally.name.as_deref(), Some("Gulls"));
        assert_eq!(home_away.primary.side, CourtSide::Right);
    }

    #[test]
    fn away_team_a_puts_b_at_home() {
        let snap = snapshot(4, 9, Some(false), Some(CourtSide::Left));
        let view = reconcile(&snap, Viewpoint::HomeAway);
        assert_eq!(view.primary.slot, TeamSlot::B);
        assert_eq!(score(&view), (9, 4));

        let bench = reconcile(&snap, Viewpoint::SelfOpponent { me: HomeAway::Away });
        assert_eq!(bench.primary.slot, TeamSlot::A);
        assert_eq!(bench.primary.home_away, HomeAway::Away);
    }

    #[test]
    fn unrecorded_sides_are_provisional_defaults() {
        let snap = snapshot(0, 0, None, None);
        let view = reconcile(&snap, Viewpoint::LeftRight);
        assert!(view.provisional);
        assert_eq!(
            view.identity,
            TeamIdentity {
                team_a_is_home: true,
                side_a: CourtSide::Left
            }
        );
        assert_eq!(view.primary.slot, TeamSlot::A);
        assert!(!reconcile(&snapshot(0, 0, Some(true), Some(CourtSide::Left)), Viewpoint::HomeAway).provisional);
    }

    fn side() -> impl Strategy<Value = Option<CourtSide>> {
        prop_oneof![Just(None), Just(Some(CourtSide::Left)), Just(Some(CourtSide::Right))]
    }

    fn viewpoint() -> impl Strategy<Value = Viewpoint> {
        prop_oneof![
            Just(Viewpoint::HomeAway),
            Just(Viewpoint::LeftRight),
            Just(Viewpoint::SelfOpponent { me: HomeAway::Home }),
            Just(Viewpoint::SelfOpponent { me: HomeAway::Away }),
        ]
    }

    proptest! {
        #[test]
        fn translation_preserves_points_and_server(
            points_a in 0u32..40,
            points_b in 0u32..40,
            a_home in proptest::option::of(any::<bool>()),
            side_a in side(),
            serving in prop_oneof![Just(None), Just(Some(TeamSlot::A)), Just(Some(TeamSlot::B))],
            view in viewpoint(),
        ) {
            let mut snap = snapshot(points_a, points_b, a_home, side_a);
            snap.serving = serving;
            let state = reconcile(&snap, view);

            prop_assert_eq!(state.primary.tally.points + state.secondary.tally.points, points_a + points_b);
            prop_assert_ne!(state.primary.slot, state.secondary.slot);
            prop_assert_ne!(state.primary.side, state.secondary.side);
            prop_assert_ne!(state.primary.home_away, state.secondary.home_away);

            let servers = [&state.primary, &state.secondary].iter().filter(|t| t.serving).count();
            prop_assert_eq!(servers, usize::from(serving.is_some()));
            if let Some(seat) = state.serving {
                prop_assert_eq!(Some(state.seat(seat).slot), serving);
                prop_assert!(state.seat(seat).serving);
            }
        }
    }
}
