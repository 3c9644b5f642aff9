// Shared fixtures for the integration tests: a small season, builders for
// the domain records and a harness wiring the in-memory store, a static auth
// and a manual clock together.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use survivor_core::backend::{Collaborators, ManualClock, StaticAuth};
use survivor_core::membership::{ContextSettings, MembershipContext};
use survivor_core::model::{
    FinishPosition, League, LeagueSettings, LeagueStatus, Membership, Pick, QualifyingEntry,
    RaceResult,
};
use survivor_core::picks::{PickPolicy, PickResolver};
use survivor_core::race_state::{RaceSchedule, RaceSlot};
use survivor_core::store::{MemoryStore, SeasonSnapshot};

// ===========================================================================
// Time
// ===========================================================================

/// 2025-05-`day` at `hour`:00 UTC.
pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, day, hour, 0, 0).unwrap()
}

/// Two races: `bahrain` (already run) and `monaco` on the 25th at 13:00.
pub fn schedule() -> RaceSchedule {
    RaceSchedule::new(vec![
        RaceSlot {
            race_id: "bahrain".into(),
            name: "Bahrain Grand Prix".into(),
            starts_at: at(4, 15),
            pick_deadline: None,
        },
        RaceSlot {
            race_id: "monaco".into(),
            name: "Monaco Grand Prix".into(),
            starts_at: at(25, 13),
            pick_deadline: Some(at(25, 12)),
        },
    ])
}

// ===========================================================================
// Records
// ===========================================================================

pub fn league(id: &str, owner: &str, max_lives: u8) -> League {
    League {
        league_id: id.into(),
        name: format!("{id} league"),
        owner_id: owner.into(),
        settings: LeagueSettings {
            max_lives,
            lives_enabled: max_lives > 1,
            ..LeagueSettings::default()
        },
        status: LeagueStatus::Active,
    }
}

pub fn member(league_id: &str, user_id: &str, max_lives: u8, lives_used: u8) -> Membership {
    Membership::new(league_id, user_id, max_lives).with_lives_used(lives_used)
}

pub fn pick(user_id: &str, league_id: Option<&str>, race_id: &str, driver_id: &str) -> Pick {
    Pick {
        pick_id: format!("{user_id}-{}-{race_id}", league_id.unwrap_or("solo")),
        user_id: user_id.into(),
        league_id: league_id.map(str::to_string),
        race_id: race_id.into(),
        driver_id: driver_id.into(),
        driver_name: None,
        team_name: None,
        is_auto_pick: false,
        auto_pick_reason: None,
        submitted_at: at(1, 9),
        final_position: None,
        survived: None,
    }
}

/// Driver `d{n}` qualified and finished in position `n`, for n in 1..=20.
pub fn grid() -> Vec<QualifyingEntry> {
    (1..=20)
        .map(|p| QualifyingEntry {
            position: p,
            driver_id: format!("d{p}"),
            driver_name: format!("Driver {p}"),
            team_name: format!("Team {}", (p + 1) / 2),
        })
        .collect()
}

pub fn classified_result(race_id: &str) -> RaceResult {
    RaceResult::new(
        race_id,
        (1..=19u8)
            .map(|p| (format!("d{p}"), FinishPosition::Classified(p)))
            .chain([("d20".to_string(), FinishPosition::Dnf)]),
    )
}

// ===========================================================================
// Harness
// ===========================================================================

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub auth: Arc<StaticAuth>,
    pub clock: Arc<ManualClock>,
    pub collab: Collaborators,
}

pub fn harness(snapshot: SeasonSnapshot, user_id: Option<&str>, now: DateTime<Utc>) -> Harness {
    harness_with_timeout(snapshot, user_id, now, Duration::from_secs(10))
}

pub fn harness_with_timeout(
    snapshot: SeasonSnapshot,
    user_id: Option<&str>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> Harness {
    let store = Arc::new(MemoryStore::from_snapshot(snapshot));
    let auth = Arc::new(match user_id {
        Some(user_id) => StaticAuth::signed_in(user_id),
        None => StaticAuth::signed_out(),
    });
    let clock = Arc::new(ManualClock::new(now));
    let collab = Collaborators::new(store.clone(), auth.clone(), clock.clone(), timeout);
    Harness {
        store,
        auth,
        clock,
        collab,
    }
}

impl Harness {
    pub fn context(&self) -> Arc<MembershipContext> {
        Arc::new(MembershipContext::new(
            self.collab.clone(),
            ContextSettings::default(),
        ))
    }

    pub fn resolver(&self, context: Arc<MembershipContext>, policy: PickPolicy) -> PickResolver {
        PickResolver::new(context, Arc::new(schedule()), policy)
    }
}
