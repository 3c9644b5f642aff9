// Pick routing: which league a pick belongs to, the once-per-season driver
// rule, manual saves and deadline auto-picks.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auto_pick::AutoPickDecider;
use crate::backend::Collaborators;
use crate::error::SurvivorError;
use crate::membership::MembershipContext;
use crate::model::{
    AutoPickReason, DriverId, LeagueId, Pick, PickPatch, PickQuery, RaceId, Scope, UserId,
};
use crate::race_state::RaceSchedule;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Which earlier picks block reusing a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniquenessPolicy {
    /// Only picks made in the same league (or the same solo scope).
    #[default]
    PerLeague,
    /// Picks made in any league, plus solo picks.
    AllLeagues,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PickPolicy {
    pub uniqueness: UniquenessPolicy,
    /// Without an explicit or active league, fail with `NoActiveContext`
    /// rather than saving a solo pick.
    pub require_league: bool,
}

impl Default for PickPolicy {
    fn default() -> Self {
        PickPolicy {
            uniqueness: UniquenessPolicy::PerLeague,
            require_league: true,
        }
    }
}

/// Race and display details that accompany a manual pick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PickInfo {
    pub race_id: RaceId,
    pub driver_name: Option<String>,
    pub team_name: Option<String>,
}

impl PickInfo {
    pub fn for_race(race_id: &str) -> Self {
        PickInfo {
            race_id: race_id.to_string(),
            ..PickInfo::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AutoPickOutcome {
    /// A fallback pick was stored.
    Applied(Pick),
    /// The participant already had a pick for the race; nothing was written.
    AlreadyPicked(Pick),
}

impl AutoPickOutcome {
    pub fn pick(&self) -> &Pick {
        match self {
            AutoPickOutcome::Applied(pick) | AutoPickOutcome::AlreadyPicked(pick) => pick,
        }
    }
}

struct DriverChoice {
    driver_id: DriverId,
    driver_name: Option<String>,
    team_name: Option<String>,
    auto_pick_reason: Option<AutoPickReason>,
}

// ---------------------------------------------------------------------------
// PickResolver
// ---------------------------------------------------------------------------

pub struct PickResolver {
    context: Arc<MembershipContext>,
    schedule: Arc<RaceSchedule>,
    policy: PickPolicy,
    decider: AutoPickDecider,
}

impl PickResolver {
    pub fn new(context: Arc<MembershipContext>, schedule: Arc<RaceSchedule>, policy: PickPolicy) -> Self {
        PickResolver {
            context,
            schedule,
            policy,
            decider: AutoPickDecider::default(),
        }
    }

    pub fn policy(&self) -> PickPolicy {
        self.policy
    }

    fn collab(&self) -> &Collaborators {
        self.context.collaborators()
    }

    /// The league an operation targets: the explicit one, else the active
    /// league, else `NoActiveContext`.
    pub fn resolve_target(&self, explicit: Option<&str>) -> Result<LeagueId, SurvivorError> {
        if let Some(league_id) = explicit {
            return Ok(league_id.to_string());
        }
        self.context
            .active_league_id()
            .ok_or(SurvivorError::NoActiveContext)
    }

    /// Like `resolve_target`, but falls back to solo play when the policy
    /// does not require a league.
    pub fn resolve_scope(&self, explicit: Option<&str>) -> Result<Scope, SurvivorError> {
        match self.resolve_target(explicit) {
            Ok(league_id) => Ok(Scope::Single(league_id)),
            Err(SurvivorError::NoActiveContext) if !self.policy.require_league => Ok(Scope::None),
            Err(e) => Err(e),
        }
    }

    /// Save (or replace) the participant's pick for `info.race_id`.
    pub async fn save(
        &self,
        driver_id: &str,
        info: PickInfo,
        explicit_league: Option<&str>,
    ) -> Result<Pick, SurvivorError> {
        let user_id = self.collab().require_user().await?;
        self.schedule
            .ensure_pick_window(&info.race_id, self.collab().now())?;
        let scope = self.resolve_scope(explicit_league)?;
        self.ensure_member_active(&scope, &user_id)?;

        let previous = match self.policy.uniqueness {
            UniquenessPolicy::PerLeague => {
                self.driver_used_in_league(&user_id, &scope, driver_id, &info.race_id)
                    .await?
            }
            UniquenessPolicy::AllLeagues => {
                self.driver_used_in_any_league(&user_id, driver_id, &info.race_id)
                    .await?
            }
        };
        if let Some(previous_race_id) = previous {
            return Err(SurvivorError::Conflict {
                driver_id: driver_id.to_string(),
                previous_race_id,
            });
        }

        let choice = DriverChoice {
            driver_id: driver_id.to_string(),
            driver_name: info.driver_name,
            team_name: info.team_name,
            auto_pick_reason: None,
        };
        let pick = self.store(&user_id, &scope, &info.race_id, choice).await?;
        info!(
            "Saved pick {} for {user_id} in {scope}: race {} driver {driver_id}",
            pick.pick_id, pick.race_id
        );
        Ok(pick)
    }

    /// The participant's picks in the resolved scope.
    pub async fn load(&self, explicit_league: Option<&str>) -> Result<Vec<Pick>, SurvivorError> {
        let user_id = self.collab().require_user().await?;
        let scope = self.resolve_scope(explicit_league)?;
        self.context.picks(&user_id, &scope, false).await
    }

    /// Race in which `driver_id` was already used within `scope`, ignoring
    /// `current_race`.
    pub async fn driver_used_in_league(
        &self,
        user_id: &str,
        scope: &Scope,
        driver_id: &str,
        current_race: &str,
    ) -> Result<Option<RaceId>, SurvivorError> {
        let picks = self.context.picks(user_id, scope, false).await?;
        Ok(picks
            .into_iter()
            .find(|p| p.driver_id == driver_id && p.race_id != current_race)
            .map(|p| p.race_id))
    }

    /// Race in which `driver_id` was already used in any league or solo,
    /// ignoring `current_race`.
    pub async fn driver_used_in_any_league(
        &self,
        user_id: &str,
        driver_id: &str,
        current_race: &str,
    ) -> Result<Option<RaceId>, SurvivorError> {
        self.driver_used_in_league(user_id, &Scope::AnyLeague, driver_id, current_race)
            .await
    }

    /// Drivers the participant may no longer pick, under the enforced policy.
    pub async fn season_exclusions(
        &self,
        user_id: &str,
        scope: &Scope,
        current_race: &str,
    ) -> Result<HashSet<DriverId>, SurvivorError> {
        let lookup = match self.policy.uniqueness {
            UniquenessPolicy::PerLeague => scope.clone(),
            UniquenessPolicy::AllLeagues => Scope::AnyLeague,
        };
        let picks = self.context.picks(user_id, &lookup, false).await?;
        Ok(picks
            .into_iter()
            .filter(|p| p.race_id != current_race)
            .map(|p| p.driver_id)
            .collect())
    }

    /// Pick a driver from the qualifying order for a participant who missed
    /// the deadline of `race_id`.
    pub async fn apply_auto_pick(
        &self,
        race_id: &str,
        explicit_league: Option<&str>,
    ) -> Result<AutoPickOutcome, SurvivorError> {
        let user_id = self.collab().require_user().await?;
        let slot = self
            .schedule
            .get(race_id)
            .ok_or_else(|| SurvivorError::not_found("race", race_id))?;
        if self.collab().now() < slot.deadline() {
            return Err(SurvivorError::validation(
                "race_id",
                format!("pick deadline for {race_id} has not passed yet"),
            ));
        }

        let scope = self.resolve_scope(explicit_league)?;
        self.ensure_member_active(&scope, &user_id)?;
        if let Some(league) = scope.league_id().and_then(|id| self.context.league(id)) {
            if !league.league.settings.auto_pick_enabled {
                return Err(SurvivorError::validation(
                    "settings.auto_pick_enabled",
                    format!("auto-pick is disabled for league {}", league.league_id()),
                ));
            }
        }

        if let Some(existing) = self.existing_pick(&user_id, &scope, race_id).await? {
            debug!("{user_id} already has pick {} for {race_id}", existing.pick_id);
            return Ok(AutoPickOutcome::AlreadyPicked(existing));
        }

        let collab = self.collab();
        let order = collab
            .call(collab.persistence.fetch_qualifying_order(race_id))
            .await?;
        let excluded = self.season_exclusions(&user_id, &scope, race_id).await?;
        let decision = self.decider.decide(race_id, &order, &excluded)?;

        let choice = DriverChoice {
            driver_id: decision.driver_id.clone(),
            driver_name: Some(decision.driver_name),
            team_name: Some(decision.team_name),
            auto_pick_reason: Some(decision.reason),
        };
        let pick = self.store(&user_id, &scope, race_id, choice).await?;
        info!(
            "Auto-picked {} (P{}, offset {:+}) for {user_id} in {scope}, race {race_id}",
            decision.driver_id, decision.position, decision.offset
        );
        Ok(AutoPickOutcome::Applied(pick))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn ensure_member_active(&self, scope: &Scope, user_id: &str) -> Result<(), SurvivorError> {
        let Some(league_id) = scope.league_id() else {
            return Ok(());
        };
        let league = self.context.league(league_id).ok_or_else(|| {
            SurvivorError::not_found("membership", format!("{league_id}/{user_id}"))
        })?;
        if !league.membership.is_active() {
            return Err(SurvivorError::MemberInactive {
                league_id: league_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        Ok(())
    }

    /// Bypasses the pick cache so a write never races a stale read.
    async fn existing_pick(
        &self,
        user_id: &str,
        scope: &Scope,
        race_id: &str,
    ) -> Result<Option<Pick>, SurvivorError> {
        let query = PickQuery {
            user_id: Some(user_id.to_string()),
            scope: scope.clone(),
            race_id: Some(race_id.to_string()),
        };
        let collab = self.collab();
        let picks = collab.call(collab.persistence.fetch_picks(&query)).await?;
        Ok(picks.into_iter().max_by_key(|p| p.submitted_at))
    }

    /// Insert a new pick or overwrite the one already stored for the race.
    async fn store(
        &self,
        user_id: &UserId,
        scope: &Scope,
        race_id: &str,
        choice: DriverChoice,
    ) -> Result<Pick, SurvivorError> {
        let collab = self.collab();
        let now = collab.now();
        let is_auto_pick = choice.auto_pick_reason.is_some();

        let pick = match self.existing_pick(user_id, scope, race_id).await? {
            Some(existing) => {
                let patch = PickPatch {
                    driver_id: Some(choice.driver_id),
                    driver_name: choice.driver_name,
                    team_name: choice.team_name,
                    is_auto_pick: Some(is_auto_pick),
                    auto_pick_reason: choice.auto_pick_reason,
                    submitted_at: Some(now),
                    ..PickPatch::default()
                };
                collab
                    .call(collab.persistence.update_pick(&existing.pick_id, &patch))
                    .await?
            }
            None => {
                let pick = Pick {
                    pick_id: String::new(),
                    user_id: user_id.clone(),
                    league_id: scope.league_id().map(str::to_string),
                    race_id: race_id.to_string(),
                    driver_id: choice.driver_id,
                    driver_name: choice.driver_name,
                    team_name: choice.team_name,
                    is_auto_pick,
                    auto_pick_reason: choice.auto_pick_reason,
                    submitted_at: now,
                    final_position: None,
                    survived: None,
                };
                collab.call(collab.persistence.save_pick(pick)).await?
            }
        };

        self.context.invalidate_picks(user_id, scope);
        Ok(pick)
    }
}
