// Domain records: leagues, memberships and their life state, picks, race
// results, qualifying order and the life-event audit log.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SurvivorError;

pub type LeagueId = String;
pub type UserId = String;
pub type RaceId = String;
pub type DriverId = String;

/// Worst finishing position that still keeps a pick safe.
pub const SAFE_POSITION_CUTOFF: u8 = 10;

/// Bounds for the configurable lives per member.
pub const MIN_LIVES: u8 = 1;
pub const MAX_LIVES: u8 = 5;

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Which league(s) an operation applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "league_id", rename_all = "snake_case")]
pub enum Scope {
    /// Exactly one league.
    Single(LeagueId),
    /// Every league the participant plays in, plus solo picks.
    AnyLeague,
    /// Solo play, outside any league.
    None,
}

impl Scope {
    /// Scope for a pick record's optional league id.
    pub fn of(league_id: Option<&str>) -> Self {
        match league_id {
            Some(id) => Scope::Single(id.to_string()),
            None => Scope::None,
        }
    }

    pub fn league_id(&self) -> Option<&str> {
        match self {
            Scope::Single(id) => Some(id),
            Scope::AnyLeague | Scope::None => None,
        }
    }

    /// Whether a record stored under `league_id` falls inside this scope.
    pub fn contains(&self, league_id: Option<&str>) -> bool {
        match self {
            Scope::Single(id) => league_id == Some(id.as_str()),
            Scope::AnyLeague => true,
            Scope::None => league_id.is_none(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Single(id) => write!(f, "league:{id}"),
            Scope::AnyLeague => write!(f, "any-league"),
            Scope::None => write!(f, "solo"),
        }
    }
}

// ---------------------------------------------------------------------------
// Race results
// ---------------------------------------------------------------------------

/// Where a driver finished. DNF orders after every classified position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishPosition {
    Classified(u8),
    Dnf,
}

impl FinishPosition {
    /// Whether this finish keeps the member's life intact.
    pub fn is_safe(&self, cutoff: u8) -> bool {
        matches!(self, FinishPosition::Classified(p) if *p <= cutoff)
    }
}

impl fmt::Display for FinishPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishPosition::Classified(p) => write!(f, "P{p}"),
            FinishPosition::Dnf => write!(f, "DNF"),
        }
    }
}

/// Final classification of one race, produced externally once it completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceResult {
    pub race_id: RaceId,
    pub positions: HashMap<DriverId, FinishPosition>,
}

impl RaceResult {
    pub fn new<I, D>(race_id: &str, positions: I) -> Self
    where
        I: IntoIterator<Item = (D, FinishPosition)>,
        D: Into<DriverId>,
    {
        RaceResult {
            race_id: race_id.to_string(),
            positions: positions.into_iter().map(|(d, p)| (d.into(), p)).collect(),
        }
    }

    pub fn position_of(&self, driver_id: &str) -> Option<FinishPosition> {
        self.positions.get(driver_id).copied()
    }
}

/// One row of the qualifying classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualifyingEntry {
    pub position: u8,
    pub driver_id: DriverId,
    pub driver_name: String,
    #[serde(default)]
    pub team_name: String,
}

// ---------------------------------------------------------------------------
// Leagues
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeagueStatus {
    #[default]
    Active,
    Completed,
    Archived,
}

/// Lives configuration of a league.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeagueSettings {
    pub max_lives: u8,
    pub lives_enabled: bool,
    #[serde(default)]
    pub lock_date: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub auto_pick_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LeagueSettings {
    fn default() -> Self {
        LeagueSettings {
            max_lives: MIN_LIVES,
            lives_enabled: false,
            lock_date: None,
            auto_pick_enabled: true,
        }
    }
}

impl LeagueSettings {
    pub fn validate(&self) -> Result<(), SurvivorError> {
        if !(MIN_LIVES..=MAX_LIVES).contains(&self.max_lives) {
            return Err(SurvivorError::validation(
                "settings.max_lives",
                format!(
                    "must be between {MIN_LIVES} and {MAX_LIVES}, got {}",
                    self.max_lives
                ),
            ));
        }
        Ok(())
    }

    /// Whether the lives configuration can no longer change at `now`.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock_date.is_some_and(|lock| now > lock)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct League {
    pub league_id: LeagueId,
    pub name: String,
    pub owner_id: UserId,
    #[serde(default)]
    pub settings: LeagueSettings,
    #[serde(default)]
    pub status: LeagueStatus,
}

impl League {
    pub fn lives_active(&self) -> bool {
        self.settings.lives_enabled
    }

    /// Lives each member starts with; one when the lives system is off.
    pub fn effective_max_lives(&self) -> u8 {
        if self.lives_active() {
            self.settings.max_lives
        } else {
            MIN_LIVES
        }
    }

    /// Replace the lives configuration. Rejected once the current lock date
    /// has passed.
    pub fn update_lives_settings(
        &mut self,
        settings: LeagueSettings,
        now: DateTime<Utc>,
    ) -> Result<(), SurvivorError> {
        if self.settings.is_locked(now) {
            return Err(SurvivorError::Locked {
                league_id: self.league_id.clone(),
            });
        }
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Memberships
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberStatus {
    Active,
    Eliminated,
    Left,
}

/// A life lost at one race, kept on the membership for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EliminationRecord {
    pub race_id: RaceId,
    pub driver_id: DriverId,
    pub final_position: FinishPosition,
    pub recorded_at: DateTime<Utc>,
}

/// A participant's standing in one league.
///
/// Remaining lives are always derived from `max_lives - lives_used`, and the
/// status follows from them, so the two can never disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "MembershipRecord")]
pub struct Membership {
    pub league_id: LeagueId,
    pub user_id: UserId,
    max_lives: u8,
    lives_used: u8,
    status: MemberStatus,
    elimination_history: Vec<EliminationRecord>,
    pub is_owner: bool,
    pub last_accessed: Option<DateTime<Utc>>,
}

/// Wire shape of a membership; normalized on the way in.
#[derive(Deserialize)]
struct MembershipRecord {
    league_id: LeagueId,
    user_id: UserId,
    max_lives: u8,
    #[serde(default)]
    lives_used: u8,
    #[serde(default)]
    status: Option<MemberStatus>,
    #[serde(default)]
    elimination_history: Vec<EliminationRecord>,
    #[serde(default)]
    is_owner: bool,
    #[serde(default)]
    last_accessed: Option<DateTime<Utc>>,
}

impl From<MembershipRecord> for Membership {
    fn from(record: MembershipRecord) -> Self {
        let mut member = Membership::new(&record.league_id, &record.user_id, record.max_lives)
            .with_lives_used(record.lives_used);
        if record.status == Some(MemberStatus::Left) {
            member.status = MemberStatus::Left;
        }
        member.elimination_history = record.elimination_history;
        member.is_owner = record.is_owner;
        member.last_accessed = record.last_accessed;
        member
    }
}

impl Membership {
    pub fn new(league_id: &str, user_id: &str, max_lives: u8) -> Self {
        Membership {
            league_id: league_id.to_string(),
            user_id: user_id.to_string(),
            max_lives,
            lives_used: 0,
            status: if max_lives == 0 {
                MemberStatus::Eliminated
            } else {
                MemberStatus::Active
            },
            elimination_history: Vec::new(),
            is_owner: false,
            last_accessed: None,
        }
    }

    /// A fresh membership in `league`, with the league's effective lives.
    pub fn for_league(league: &League, user_id: &str) -> Self {
        let mut member = Membership::new(&league.league_id, user_id, league.effective_max_lives());
        member.is_owner = league.owner_id == user_id;
        member
    }

    /// Builder used when restoring a stored membership.
    pub fn with_lives_used(mut self, lives_used: u8) -> Self {
        self.lives_used = lives_used.min(self.max_lives);
        self.settle_status();
        self
    }

    pub fn owner(mut self) -> Self {
        self.is_owner = true;
        self
    }

    pub fn max_lives(&self) -> u8 {
        self.max_lives
    }

    pub fn lives_used(&self) -> u8 {
        self.lives_used
    }

    pub fn remaining_lives(&self) -> u8 {
        self.max_lives.saturating_sub(self.lives_used)
    }

    pub fn status(&self) -> MemberStatus {
        self.status
    }

    pub fn elimination_history(&self) -> &[EliminationRecord] {
        &self.elimination_history
    }

    pub fn is_active(&self) -> bool {
        self.status == MemberStatus::Active
    }

    pub fn is_eliminated(&self) -> bool {
        self.status == MemberStatus::Eliminated
    }

    /// Mark the member as having left the league. Life state is kept.
    pub fn leave(&mut self) {
        self.status = MemberStatus::Left;
    }

    /// Consume one life for a bad finish. Returns true when this was the
    /// member's last life.
    pub(crate) fn lose_life(&mut self, record: EliminationRecord) -> bool {
        self.lives_used = self.lives_used.saturating_add(1).min(self.max_lives);
        self.record_elimination(record);
        self.settle_status();
        self.is_eliminated()
    }

    /// Keep `record` in the elimination history. A race already recorded is
    /// not added twice; returns false in that case.
    pub fn record_elimination(&mut self, record: EliminationRecord) -> bool {
        if self
            .elimination_history
            .iter()
            .any(|r| r.race_id == record.race_id)
        {
            return false;
        }
        self.elimination_history.push(record);
        true
    }

    /// Apply an administrative lives adjustment. The operation targets the
    /// remaining lives; `lives_used` is recomputed from it.
    pub fn apply_life_operation(&mut self, op: &LifeOperation) {
        let target = op.target_remaining(self.remaining_lives(), self.max_lives);
        self.lives_used = self.max_lives - target;
        self.settle_status();
    }

    /// Change the lives allowance (league settings edit before the lock date).
    pub fn set_max_lives(&mut self, max_lives: u8) {
        self.max_lives = max_lives;
        self.lives_used = self.lives_used.min(max_lives);
        self.settle_status();
    }

    fn settle_status(&mut self) {
        if self.status == MemberStatus::Left {
            return;
        }
        self.status = if self.remaining_lives() == 0 {
            MemberStatus::Eliminated
        } else {
            MemberStatus::Active
        };
    }
}

/// A league as seen by one participant: the league record plus their
/// membership in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLeague {
    pub league: League,
    pub membership: Membership,
    #[serde(default)]
    pub member_count: usize,
}

impl UserLeague {
    pub fn league_id(&self) -> &str {
        &self.league.league_id
    }
}

/// A remembered active-league choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeagueChoice {
    League(LeagueId),
    Solo,
}

impl LeagueChoice {
    pub fn of(league_id: Option<&str>) -> Self {
        match league_id {
            Some(id) => LeagueChoice::League(id.to_string()),
            None => LeagueChoice::Solo,
        }
    }
}

// ---------------------------------------------------------------------------
// Picks
// ---------------------------------------------------------------------------

/// Why the system chose a driver on the participant's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutoPickReason {
    /// The P15 qualifier was free.
    P15Fallback,
    /// P15 was excluded; the driver at `position` was taken instead.
    DeadlineMissed { position: u8 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pick {
    #[serde(default)]
    pub pick_id: String,
    pub user_id: UserId,
    #[serde(default)]
    pub league_id: Option<LeagueId>,
    pub race_id: RaceId,
    pub driver_id: DriverId,
    #[serde(default)]
    pub driver_name: Option<String>,
    #[serde(default)]
    pub team_name: Option<String>,
    #[serde(default)]
    pub is_auto_pick: bool,
    #[serde(default)]
    pub auto_pick_reason: Option<AutoPickReason>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub final_position: Option<FinishPosition>,
    #[serde(default)]
    pub survived: Option<bool>,
}

impl Pick {
    pub fn scope(&self) -> Scope {
        Scope::of(self.league_id.as_deref())
    }

    pub fn apply_patch(&mut self, patch: &PickPatch) {
        if let Some(driver_id) = &patch.driver_id {
            self.driver_id = driver_id.clone();
        }
        if let Some(driver_name) = &patch.driver_name {
            self.driver_name = Some(driver_name.clone());
        }
        if let Some(team_name) = &patch.team_name {
            self.team_name = Some(team_name.clone());
        }
        if let Some(is_auto_pick) = patch.is_auto_pick {
            self.is_auto_pick = is_auto_pick;
            self.auto_pick_reason = patch.auto_pick_reason;
        }
        if let Some(submitted_at) = patch.submitted_at {
            self.submitted_at = submitted_at;
        }
        if let Some(position) = patch.final_position {
            self.final_position = Some(position);
        }
        if let Some(survived) = patch.survived {
            self.survived = Some(survived);
        }
    }
}

/// Partial update for a stored pick. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PickPatch {
    pub driver_id: Option<DriverId>,
    pub driver_name: Option<String>,
    pub team_name: Option<String>,
    pub is_auto_pick: Option<bool>,
    pub auto_pick_reason: Option<AutoPickReason>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub final_position: Option<FinishPosition>,
    pub survived: Option<bool>,
}

/// Filter for pick lookups.
#[derive(Debug, Clone, PartialEq)]
pub struct PickQuery {
    pub user_id: Option<UserId>,
    pub scope: Scope,
    pub race_id: Option<RaceId>,
}

impl PickQuery {
    pub fn for_user(user_id: &str, scope: Scope) -> Self {
        PickQuery {
            user_id: Some(user_id.to_string()),
            scope,
            race_id: None,
        }
    }

    pub fn for_race(league_id: &str, race_id: &str) -> Self {
        PickQuery {
            user_id: None,
            scope: Scope::Single(league_id.to_string()),
            race_id: Some(race_id.to_string()),
        }
    }

    pub fn matches(&self, pick: &Pick) -> bool {
        self.user_id.as_ref().map_or(true, |u| *u == pick.user_id)
            && self.scope.contains(pick.league_id.as_deref())
            && self.race_id.as_ref().map_or(true, |r| *r == pick.race_id)
    }
}

// ---------------------------------------------------------------------------
// Life events and operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifeEventType {
    LifeLost,
    LifeRestored,
    FinalElimination,
}

/// Append-only audit entry for every change to a member's lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifeEvent {
    pub user_id: UserId,
    pub league_id: LeagueId,
    /// Race that caused the change; `None` for administrative adjustments.
    #[serde(default)]
    pub race_id: Option<RaceId>,
    pub event_type: LifeEventType,
    pub lives_remaining: u8,
    #[serde(default)]
    pub driver_picked: Option<DriverId>,
    #[serde(default)]
    pub final_position: Option<FinishPosition>,
    pub event_date: DateTime<Utc>,
    #[serde(default)]
    pub admin_user_id: Option<UserId>,
    #[serde(default)]
    pub admin_reason: Option<String>,
}

impl LifeEvent {
    /// Whether this event records the outcome of `race_id` for the member.
    pub fn records_race(&self, league_id: &str, user_id: &str, race_id: &str) -> bool {
        self.league_id == league_id
            && self.user_id == user_id
            && self.race_id.as_deref() == Some(race_id)
            && self.event_type != LifeEventType::LifeRestored
    }

    /// The elimination history entry for a race-caused life change.
    pub fn elimination_record(&self) -> Option<EliminationRecord> {
        if self.event_type == LifeEventType::LifeRestored {
            return None;
        }
        Some(EliminationRecord {
            race_id: self.race_id.clone()?,
            driver_id: self.driver_picked.clone()?,
            final_position: self.final_position?,
            recorded_at: self.event_date,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifeOperationKind {
    Set,
    Increment,
    Decrement,
}

/// Adjustment of a member's remaining lives, always with a reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifeOperation {
    pub operation: LifeOperationKind,
    pub value: u8,
    pub reason: String,
}

impl LifeOperation {
    pub fn set(value: u8, reason: impl Into<String>) -> Self {
        LifeOperation {
            operation: LifeOperationKind::Set,
            value,
            reason: reason.into(),
        }
    }

    pub fn increment(value: u8, reason: impl Into<String>) -> Self {
        LifeOperation {
            operation: LifeOperationKind::Increment,
            value,
            reason: reason.into(),
        }
    }

    pub fn decrement(value: u8, reason: impl Into<String>) -> Self {
        LifeOperation {
            operation: LifeOperationKind::Decrement,
            value,
            reason: reason.into(),
        }
    }

    pub fn validate(&self) -> Result<(), SurvivorError> {
        if self.reason.trim().is_empty() {
            return Err(SurvivorError::validation(
                "life_operation.reason",
                "a reason is required",
            ));
        }
        Ok(())
    }

    /// Remaining lives after applying this operation, clamped to `[0, max]`.
    pub fn target_remaining(&self, current: u8, max_lives: u8) -> u8 {
        let target = match self.operation {
            LifeOperationKind::Set => self.value,
            LifeOperationKind::Increment => current.saturating_add(self.value),
            LifeOperationKind::Decrement => current.saturating_sub(self.value),
        };
        target.min(max_lives)
    }
}
