// Race phase derivation and the season's race schedule.
//
// A race moves through four phases purely as a function of its start time and
// the current time:
//
//   COUNTDOWN  now < start
//   LIVE       start <= now < start + 2h
//   POST_RACE  start + 2h <= now < start + 10h
//   NEXT_RACE  now >= start + 10h
//
// Manual picks are only accepted while a race is in COUNTDOWN and before its
// pick deadline.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SurvivorError;
use crate::model::RaceId;

pub const LIVE_WINDOW_HOURS: i64 = 2;
pub const POST_RACE_WINDOW_HOURS: i64 = 10;

// ---------------------------------------------------------------------------
// RacePhase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RacePhase {
    Countdown,
    Live,
    PostRace,
    NextRace,
}

impl RacePhase {
    pub fn resolve(race_start: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        if now < race_start {
            RacePhase::Countdown
        } else if now < race_start + Duration::hours(LIVE_WINDOW_HOURS) {
            RacePhase::Live
        } else if now < race_start + Duration::hours(POST_RACE_WINDOW_HOURS) {
            RacePhase::PostRace
        } else {
            RacePhase::NextRace
        }
    }

    pub fn accepts_picks(self) -> bool {
        self == RacePhase::Countdown
    }

    /// Banner text for phases that replace the countdown.
    pub fn label(self) -> Option<&'static str> {
        match self {
            RacePhase::Countdown => None,
            RacePhase::Live => Some("RACE IN PROGRESS"),
            RacePhase::PostRace => Some("RACE FINISHED - Results Pending"),
            RacePhase::NextRace => Some("Loading Next Race..."),
        }
    }
}

/// Time left until a target, broken down for display. All zero once passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Countdown {
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
}

impl Countdown {
    pub fn until(target: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let remaining = target - now;
        if remaining <= Duration::zero() {
            return Countdown::default();
        }
        let total = remaining.num_seconds();
        Countdown {
            days: total / 86_400,
            hours: (total % 86_400) / 3_600,
            minutes: (total % 3_600) / 60,
            seconds: total % 60,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Countdown::default()
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceSlot {
    pub race_id: RaceId,
    pub name: String,
    pub starts_at: DateTime<Utc>,
    /// Pick deadline when it differs from the race start.
    #[serde(default)]
    pub pick_deadline: Option<DateTime<Utc>>,
}

impl RaceSlot {
    pub fn deadline(&self) -> DateTime<Utc> {
        self.pick_deadline.unwrap_or(self.starts_at)
    }

    pub fn phase(&self, now: DateTime<Utc>) -> RacePhase {
        RacePhase::resolve(self.starts_at, now)
    }
}

/// The season calendar, ordered by start time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<RaceSlot>", into = "Vec<RaceSlot>")]
pub struct RaceSchedule {
    races: Vec<RaceSlot>,
}

impl From<Vec<RaceSlot>> for RaceSchedule {
    fn from(races: Vec<RaceSlot>) -> Self {
        RaceSchedule::new(races)
    }
}

impl From<RaceSchedule> for Vec<RaceSlot> {
    fn from(schedule: RaceSchedule) -> Self {
        schedule.races
    }
}

impl RaceSchedule {
    pub fn new(mut races: Vec<RaceSlot>) -> Self {
        races.sort_by_key(|r| r.starts_at);
        RaceSchedule { races }
    }

    pub fn races(&self) -> &[RaceSlot] {
        &self.races
    }

    pub fn get(&self, race_id: &str) -> Option<&RaceSlot> {
        self.races.iter().find(|r| r.race_id == race_id)
    }

    /// The race the season is currently focused on: the first one that has
    /// not yet rolled over into NEXT_RACE.
    pub fn current(&self, now: DateTime<Utc>) -> Option<&RaceSlot> {
        self.races
            .iter()
            .find(|r| r.phase(now) != RacePhase::NextRace)
    }

    pub fn phase_of(&self, race_id: &str, now: DateTime<Utc>) -> Option<RacePhase> {
        self.get(race_id).map(|r| r.phase(now))
    }

    /// Check that a manual pick for `race_id` may still be submitted.
    pub fn ensure_pick_window(&self, race_id: &str, now: DateTime<Utc>) -> Result<(), SurvivorError> {
        let slot = self
            .get(race_id)
            .ok_or_else(|| SurvivorError::not_found("race", race_id))?;
        if now >= slot.deadline() || !slot.phase(now).accepts_picks() {
            return Err(SurvivorError::DeadlinePassed {
                race_id: race_id.to_string(),
            });
        }
        Ok(())
    }
}
