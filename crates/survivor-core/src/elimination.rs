// Race outcome processing: life loss, elimination and the life-event log.
//
// `EliminationEngine` is the pure rule: one member, one pick, one result.
// `EliminationProcessor` runs it over a whole league roster, or over every
// active league, against the persistence collaborator.
//
// There is no transaction across the event log and the member record, so a
// race outcome is persisted as "append event, then SET lives and history".
// The event is the source of truth for whether a race was already applied;
// if the process dies between the two writes, the next run sees the event,
// skips the decrement and re-applies what the event recorded.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::backend::Collaborators;
use crate::error::SurvivorError;
use crate::membership::MembershipContext;
use crate::model::{
    EliminationRecord, FinishPosition, League, LeagueId, LeagueStatus, LifeEvent, LifeEventType,
    LifeOperation, Membership, MemberStatus, Pick, PickPatch, PickQuery, RaceId, RaceResult,
    UserId, SAFE_POSITION_CUTOFF,
};

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Result of applying one race to one member.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Finished inside the cutoff; nothing changes and nothing is logged.
    Safe {
        member: Membership,
        position: FinishPosition,
    },
    /// Lost a life and still has at least one left.
    LifeLost { member: Membership, event: LifeEvent },
    /// Lost the last life.
    Eliminated { member: Membership, event: LifeEvent },
    /// The race was already recorded for this member; state is unchanged.
    Replayed {
        member: Membership,
        recorded: LifeEvent,
    },
    /// The member is eliminated or has left; no further changes apply.
    Inactive { member: Membership },
}

impl ApplyOutcome {
    pub fn member(&self) -> &Membership {
        match self {
            ApplyOutcome::Safe { member, .. }
            | ApplyOutcome::LifeLost { member, .. }
            | ApplyOutcome::Eliminated { member, .. }
            | ApplyOutcome::Replayed { member, .. }
            | ApplyOutcome::Inactive { member } => member,
        }
    }

    /// The event this application produced, if it produced one.
    pub fn new_event(&self) -> Option<&LifeEvent> {
        match self {
            ApplyOutcome::LifeLost { event, .. } | ApplyOutcome::Eliminated { event, .. } => {
                Some(event)
            }
            _ => None,
        }
    }
}

/// Whether an administrative adjustment may bring back an eliminated member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevivePolicy {
    #[default]
    OnlyActive,
    AllowRevive,
}

#[derive(Debug, Clone, Copy)]
pub struct EliminationEngine {
    safe_cutoff: u8,
}

impl Default for EliminationEngine {
    fn default() -> Self {
        EliminationEngine {
            safe_cutoff: SAFE_POSITION_CUTOFF,
        }
    }
}

impl EliminationEngine {
    /// Apply `result` to `member` through their `pick`.
    ///
    /// `history` is the member's life-event log; an entry for the same race
    /// turns this into a no-op `Replayed`. Calls for the same member must be
    /// made in race order.
    pub fn apply(
        &self,
        member: &Membership,
        pick: &Pick,
        result: &RaceResult,
        history: &[LifeEvent],
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome, SurvivorError> {
        if pick.race_id != result.race_id {
            return Err(SurvivorError::validation(
                "pick.race_id",
                format!("pick is for {}, result is for {}", pick.race_id, result.race_id),
            ));
        }
        if pick.user_id != member.user_id || pick.league_id.as_deref() != Some(&member.league_id)
        {
            return Err(SurvivorError::validation(
                "pick",
                format!(
                    "pick {} does not belong to {} in league {}",
                    pick.pick_id, member.user_id, member.league_id
                ),
            ));
        }

        if let Some(recorded) = history
            .iter()
            .rev()
            .find(|e| e.records_race(&member.league_id, &member.user_id, &result.race_id))
        {
            return Ok(ApplyOutcome::Replayed {
                member: member.clone(),
                recorded: recorded.clone(),
            });
        }

        if !member.is_active() {
            return Ok(ApplyOutcome::Inactive {
                member: member.clone(),
            });
        }

        let position = result
            .position_of(&pick.driver_id)
            .ok_or_else(|| {
                SurvivorError::not_found("race result entry", format!("{}/{}", result.race_id, pick.driver_id))
            })?;

        if position.is_safe(self.safe_cutoff) {
            return Ok(ApplyOutcome::Safe {
                member: member.clone(),
                position,
            });
        }

        let mut updated = member.clone();
        let eliminated = updated.lose_life(EliminationRecord {
            race_id: result.race_id.clone(),
            driver_id: pick.driver_id.clone(),
            final_position: position,
            recorded_at: now,
        });
        let event = LifeEvent {
            user_id: updated.user_id.clone(),
            league_id: updated.league_id.clone(),
            race_id: Some(result.race_id.clone()),
            event_type: if eliminated {
                LifeEventType::FinalElimination
            } else {
                LifeEventType::LifeLost
            },
            lives_remaining: updated.remaining_lives(),
            driver_picked: Some(pick.driver_id.clone()),
            final_position: Some(position),
            event_date: now,
            admin_user_id: None,
            admin_reason: None,
        };

        Ok(if eliminated {
            ApplyOutcome::Eliminated {
                member: updated,
                event,
            }
        } else {
            ApplyOutcome::LifeLost {
                member: updated,
                event,
            }
        })
    }

    /// Administrative lives adjustment. Always produces a `LIFE_RESTORED`
    /// event, whichever direction the lives moved.
    pub fn restore(
        &self,
        member: &Membership,
        op: &LifeOperation,
        admin_user_id: &str,
        policy: RevivePolicy,
        now: DateTime<Utc>,
    ) -> Result<(Membership, LifeEvent), SurvivorError> {
        op.validate()?;
        let blocked = match member.status() {
            MemberStatus::Active => false,
            MemberStatus::Eliminated => policy == RevivePolicy::OnlyActive,
            MemberStatus::Left => true,
        };
        if blocked {
            return Err(SurvivorError::MemberInactive {
                league_id: member.league_id.clone(),
                user_id: member.user_id.clone(),
            });
        }

        let mut updated = member.clone();
        updated.apply_life_operation(op);
        let event = LifeEvent {
            user_id: updated.user_id.clone(),
            league_id: updated.league_id.clone(),
            race_id: None,
            event_type: LifeEventType::LifeRestored,
            lives_remaining: updated.remaining_lives(),
            driver_picked: None,
            final_position: None,
            event_date: now,
            admin_user_id: Some(admin_user_id.to_string()),
            admin_reason: Some(op.reason.clone()),
        };
        Ok((updated, event))
    }
}

// ---------------------------------------------------------------------------
// Batch processing
// ---------------------------------------------------------------------------

/// Summary of one `process_race` run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RaceReport {
    pub league_id: LeagueId,
    pub race_id: RaceId,
    /// Members the engine ran for without error.
    pub processed: usize,
    pub life_losses: usize,
    pub eliminations: usize,
    pub replays: usize,
    pub errors: Vec<(UserId, SurvivorError)>,
    /// Members still active afterwards, in roster order.
    pub survivors: Vec<UserId>,
    /// At most one active member remains.
    pub league_decided: bool,
    pub winner: Option<UserId>,
    /// This run moved the league to `Completed`.
    pub league_completed: bool,
}

/// Summary of one race applied across every active league.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeasonRaceReport {
    pub race_id: RaceId,
    pub reports: Vec<RaceReport>,
    /// Leagues nobody picked in for this race.
    pub skipped: Vec<LeagueId>,
    /// Leagues whose run aborted; the others were still processed.
    pub failures: Vec<(LeagueId, SurvivorError)>,
}

impl SeasonRaceReport {
    pub fn processed(&self) -> usize {
        self.reports.iter().map(|r| r.processed).sum()
    }

    pub fn eliminations(&self) -> usize {
        self.reports.iter().map(|r| r.eliminations).sum()
    }
}

pub struct EliminationProcessor {
    collab: Collaborators,
    engine: EliminationEngine,
    context: Option<Arc<MembershipContext>>,
}

impl EliminationProcessor {
    pub fn new(collab: Collaborators) -> Self {
        EliminationProcessor {
            collab,
            engine: EliminationEngine::default(),
            context: None,
        }
    }

    /// Keep `context` in sync with every membership this processor changes.
    pub fn with_context(mut self, context: Arc<MembershipContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Apply the result of `race_id` to every active member of `league_id`.
    ///
    /// Members are independent: a failure for one is recorded in the report
    /// and the rest are still processed. Only failures to load the league,
    /// the roster, the picks or the result abort the run.
    pub async fn process_race(
        &self,
        league_id: &str,
        race_id: &str,
    ) -> Result<RaceReport, SurvivorError> {
        let persistence = &self.collab.persistence;
        let league = self.collab.call(persistence.fetch_league(league_id)).await?;
        let result = self.collab.call(persistence.fetch_race_result(race_id)).await?;
        let picks = self.race_picks(league_id, race_id).await?;
        self.process_league(&league, &result, &picks).await
    }

    /// Apply the result of `race_id` to every `Active` league.
    ///
    /// Leagues are independent: one league failing to load is recorded in
    /// `failures` and the rest still run. Leagues without any pick for the
    /// race are skipped. Only a missing result aborts the whole run.
    pub async fn process_race_all_leagues(
        &self,
        race_id: &str,
    ) -> Result<SeasonRaceReport, SurvivorError> {
        let persistence = &self.collab.persistence;
        let result = self.collab.call(persistence.fetch_race_result(race_id)).await?;
        let leagues: Vec<League> = self
            .collab
            .call(persistence.fetch_leagues())
            .await?
            .into_iter()
            .filter(|l| l.status == LeagueStatus::Active)
            .collect();
        info!("Processing race {race_id} across {} active league(s)", leagues.len());

        let runs = leagues
            .iter()
            .map(|league| self.process_league_if_picked(league, &result));
        let outcomes = join_all(runs).await;

        let mut season = SeasonRaceReport {
            race_id: race_id.to_string(),
            ..SeasonRaceReport::default()
        };
        for (league, outcome) in leagues.iter().zip(outcomes) {
            match outcome {
                Ok(Some(report)) => season.reports.push(report),
                Ok(None) => {
                    debug!("No picks for {race_id} in {}, skipped", league.league_id);
                    season.skipped.push(league.league_id.clone());
                }
                Err(e) => {
                    warn!("Race {race_id} not applied to league {}: {e}", league.league_id);
                    season.failures.push((league.league_id.clone(), e));
                }
            }
        }
        info!(
            "Race {race_id}: {} league(s) processed, {} skipped, {} failed; {} member(s) processed, {} elimination(s)",
            season.reports.len(),
            season.skipped.len(),
            season.failures.len(),
            season.processed(),
            season.eliminations()
        );
        Ok(season)
    }

    /// `None` when nobody in the league picked for the race.
    async fn process_league_if_picked(
        &self,
        league: &League,
        result: &RaceResult,
    ) -> Result<Option<RaceReport>, SurvivorError> {
        let picks = self.race_picks(&league.league_id, &result.race_id).await?;
        if picks.is_empty() {
            return Ok(None);
        }
        self.process_league(league, result, &picks).await.map(Some)
    }

    async fn race_picks(&self, league_id: &str, race_id: &str) -> Result<Vec<Pick>, SurvivorError> {
        self.collab
            .call(
                self.collab
                    .persistence
                    .fetch_picks(&PickQuery::for_race(league_id, race_id)),
            )
            .await
    }

    async fn process_league(
        &self,
        league: &League,
        result: &RaceResult,
        picks: &[Pick],
    ) -> Result<RaceReport, SurvivorError> {
        let league_id = league.league_id.as_str();
        let race_id = result.race_id.as_str();
        let roster = self
            .collab
            .call(self.collab.persistence.fetch_roster(league_id))
            .await?;

        let active: Vec<&Membership> = roster.iter().filter(|m| m.is_active()).collect();
        info!(
            "Processing race {race_id} for league {league_id}: {} active of {} member(s)",
            active.len(),
            roster.len()
        );

        let now = self.collab.now();
        let runs = active.iter().map(|member| {
            let pick = picks
                .iter()
                .filter(|p| p.user_id == member.user_id)
                .max_by_key(|p| p.submitted_at);
            self.process_member(member, pick, result, now)
        });
        let outcomes = join_all(runs).await;

        let mut report = RaceReport {
            league_id: league_id.to_string(),
            race_id: race_id.to_string(),
            ..RaceReport::default()
        };
        for (member, outcome) in active.iter().zip(outcomes) {
            match outcome {
                Ok(outcome) => {
                    report.processed += 1;
                    match &outcome {
                        ApplyOutcome::LifeLost { .. } => report.life_losses += 1,
                        ApplyOutcome::Eliminated { .. } => report.eliminations += 1,
                        ApplyOutcome::Replayed { .. } => report.replays += 1,
                        ApplyOutcome::Safe { .. } | ApplyOutcome::Inactive { .. } => {}
                    }
                    if outcome.member().is_active() {
                        report.survivors.push(member.user_id.clone());
                    }
                }
                Err(e) => {
                    warn!("Race {race_id} not applied to {} in {league_id}: {e}", member.user_id);
                    report.errors.push((member.user_id.clone(), e));
                    report.survivors.push(member.user_id.clone());
                }
            }
        }

        report.league_decided = report.survivors.len() <= 1;
        if report.league_decided {
            report.winner = report.survivors.first().cloned();
            info!("League {league_id} decided after {race_id}, winner {:?}", report.winner);
            if report.processed > 0 && league.status == LeagueStatus::Active {
                report.league_completed = self.complete_league(league).await;
            }
        }
        if let Some(context) = &self.context {
            context.invalidate_league(league_id);
        }
        info!(
            "Race {race_id} in {league_id}: {} processed, {} life loss(es), {} elimination(s), {} replay(s), {} error(s)",
            report.processed,
            report.life_losses,
            report.eliminations,
            report.replays,
            report.errors.len()
        );
        Ok(report)
    }

    /// Mark a decided league `Completed`. A failed write is logged and
    /// retried by the next run over the same race.
    async fn complete_league(&self, league: &League) -> bool {
        let mut completed = league.clone();
        completed.status = LeagueStatus::Completed;
        match self
            .collab
            .call(self.collab.persistence.update_league(&completed))
            .await
        {
            Ok(stored) => {
                info!("League {} completed", league.league_id);
                if let Some(context) = &self.context {
                    context.record_league(&stored);
                }
                true
            }
            Err(e) => {
                warn!("Failed to mark league {} completed: {e}", league.league_id);
                false
            }
        }
    }

    async fn process_member(
        &self,
        member: &Membership,
        pick: Option<&Pick>,
        result: &RaceResult,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome, SurvivorError> {
        let pick = pick.ok_or_else(|| {
            SurvivorError::not_found("pick", format!("{}/{}", member.user_id, result.race_id))
        })?;
        let persistence = &self.collab.persistence;
        let history = self
            .collab
            .call(persistence.fetch_life_events(&member.league_id, &member.user_id))
            .await?;

        let outcome = self.engine.apply(member, pick, result, &history, now)?;
        let outcome = match outcome {
            ApplyOutcome::Safe { member, position } => {
                self.annotate_pick(pick, position, true).await;
                ApplyOutcome::Safe { member, position }
            }
            ApplyOutcome::LifeLost { member, event } => {
                let member = self.persist_life_change(&member, &event, result).await?;
                ApplyOutcome::LifeLost { member, event }
            }
            ApplyOutcome::Eliminated { member, event } => {
                let member = self.persist_life_change(&member, &event, result).await?;
                info!("{} eliminated from {} at {}", member.user_id, member.league_id, result.race_id);
                ApplyOutcome::Eliminated { member, event }
            }
            ApplyOutcome::Replayed { member, recorded } => {
                let member = self.repair_replay(member, &recorded, &history).await?;
                ApplyOutcome::Replayed { member, recorded }
            }
            inactive @ ApplyOutcome::Inactive { .. } => inactive,
        };

        if let ApplyOutcome::LifeLost { event, .. } | ApplyOutcome::Eliminated { event, .. } =
            &outcome
        {
            if let Some(position) = event.final_position {
                self.annotate_pick(pick, position, false).await;
            }
        }
        if let Some(context) = &self.context {
            context.record_membership(outcome.member());
        }
        Ok(outcome)
    }

    /// Append the event, then set the member's lives and history entry to
    /// what it records.
    async fn persist_life_change(
        &self,
        member: &Membership,
        event: &LifeEvent,
        result: &RaceResult,
    ) -> Result<Membership, SurvivorError> {
        let persistence = &self.collab.persistence;
        self.collab.call(persistence.append_life_event(event)).await?;
        let op = LifeOperation::set(
            event.lives_remaining,
            format!("race {} result", result.race_id),
        );
        let record = event.elimination_record();
        let stored = self
            .collab
            .call(persistence.update_member_lives(
                &member.league_id,
                &member.user_id,
                &op,
                record.as_ref(),
            ))
            .await?;
        debug!(
            "{} in {}: {:?}, {} live(s) left",
            member.user_id,
            member.league_id,
            event.event_type,
            stored.remaining_lives()
        );
        Ok(stored)
    }

    /// A replayed race whose event is the member's latest must agree with
    /// the stored lives and history; if it does not, the member write was
    /// lost.
    async fn repair_replay(
        &self,
        member: Membership,
        recorded: &LifeEvent,
        history: &[LifeEvent],
    ) -> Result<Membership, SurvivorError> {
        let latest = history.last() == Some(recorded);
        let record = recorded.elimination_record();
        let history_missing = record.as_ref().is_some_and(|r| {
            !member
                .elimination_history()
                .iter()
                .any(|h| h.race_id == r.race_id)
        });
        if !latest || (member.remaining_lives() == recorded.lives_remaining && !history_missing) {
            debug!(
                "Race {:?} already applied to {} in {}",
                recorded.race_id, member.user_id, member.league_id
            );
            return Ok(member);
        }

        warn!(
            "{} in {} has {} live(s) but the last event recorded {}; restoring",
            member.user_id,
            member.league_id,
            member.remaining_lives(),
            recorded.lives_remaining
        );
        let op = LifeOperation::set(recorded.lives_remaining, "repair after interrupted race update");
        self.collab
            .call(self.collab.persistence.update_member_lives(
                &member.league_id,
                &member.user_id,
                &op,
                record.as_ref(),
            ))
            .await
    }

    async fn annotate_pick(&self, pick: &Pick, position: FinishPosition, survived: bool) {
        let patch = PickPatch {
            final_position: Some(position),
            survived: Some(survived),
            ..PickPatch::default()
        };
        if let Err(e) = self
            .collab
            .call(self.collab.persistence.update_pick(&pick.pick_id, &patch))
            .await
        {
            warn!("Failed to record outcome on pick {}: {e}", pick.pick_id);
        }
    }

    /// Owner-only lives adjustment for one member of `league_id`.
    pub async fn restore_lives(
        &self,
        league_id: &str,
        user_id: &str,
        op: &LifeOperation,
        policy: RevivePolicy,
    ) -> Result<Membership, SurvivorError> {
        let admin = self.collab.require_user().await?;
        let persistence = &self.collab.persistence;

        let league = self.collab.call(persistence.fetch_league(league_id)).await?;
        if league.owner_id != admin {
            return Err(SurvivorError::Forbidden(format!(
                "only the owner of league {league_id} can adjust lives"
            )));
        }

        let roster = self.collab.call(persistence.fetch_roster(league_id)).await?;
        let member = roster
            .into_iter()
            .find(|m| m.user_id == user_id)
            .ok_or_else(|| SurvivorError::not_found("member", format!("{league_id}/{user_id}")))?;

        let (updated, event) = self
            .engine
            .restore(&member, op, &admin, policy, self.collab.now())?;
        self.collab.call(persistence.append_life_event(&event)).await?;
        let set = LifeOperation::set(updated.remaining_lives(), op.reason.clone());
        let stored = self
            .collab
            .call(persistence.update_member_lives(league_id, user_id, &set, None))
            .await?;

        info!(
            "{admin} adjusted lives of {user_id} in {league_id} to {} ({})",
            stored.remaining_lives(),
            op.reason
        );
        if let Some(context) = &self.context {
            context.record_membership(&stored);
        }
        Ok(stored)
    }
}
