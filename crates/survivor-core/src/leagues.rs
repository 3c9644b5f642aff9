// League administration: joining a league and the owner's lives settings.
//
// Memberships take their lives allowance from the league when they are
// created, and every later change to the league's lives configuration is
// pushed to the whole roster, so the engine can trust each member's
// `max_lives`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::backend::Collaborators;
use crate::error::SurvivorError;
use crate::membership::MembershipContext;
use crate::model::{League, LeagueSettings, LeagueStatus, MemberStatus, Membership, UserLeague};

/// Partial update of a league's lives configuration; `None` keeps the
/// current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LivesSettingsPatch {
    pub max_lives: Option<u8>,
    pub lives_enabled: Option<bool>,
    pub lock_date: Option<DateTime<Utc>>,
}

impl LivesSettingsPatch {
    fn merged(&self, current: &LeagueSettings) -> LeagueSettings {
        LeagueSettings {
            max_lives: self.max_lives.unwrap_or(current.max_lives),
            lives_enabled: self.lives_enabled.unwrap_or(current.lives_enabled),
            lock_date: self.lock_date.or(current.lock_date),
            auto_pick_enabled: current.auto_pick_enabled,
        }
    }
}

pub struct LeagueManager {
    collab: Collaborators,
    context: Option<Arc<MembershipContext>>,
}

impl LeagueManager {
    pub fn new(collab: Collaborators) -> Self {
        LeagueManager {
            collab,
            context: None,
        }
    }

    /// Keep `context` in sync with every league and membership this manager
    /// changes.
    pub fn with_context(mut self, context: Arc<MembershipContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Join `league_id` as the signed-in user, starting with the league's
    /// effective number of lives.
    pub async fn join_league(&self, league_id: &str) -> Result<UserLeague, SurvivorError> {
        let user_id = self.collab.require_user().await?;
        let persistence = &self.collab.persistence;
        let league = self.collab.call(persistence.fetch_league(league_id)).await?;
        if league.status != LeagueStatus::Active {
            return Err(SurvivorError::validation(
                "league.status",
                format!("league {league_id} is {:?} and no longer open", league.status),
            ));
        }

        let member = Membership::for_league(&league, &user_id);
        let membership = self.collab.call(persistence.add_member(member)).await?;
        let member_count = self
            .collab
            .call(persistence.fetch_roster(league_id))
            .await?
            .iter()
            .filter(|m| m.status() != MemberStatus::Left)
            .count();
        info!(
            "{user_id} joined {league_id} with {} live(s)",
            membership.max_lives()
        );

        let joined = UserLeague {
            league,
            membership,
            member_count,
        };
        if let Some(context) = &self.context {
            context.add_league(joined.clone());
        }
        Ok(joined)
    }

    /// Owner-only change of a league's lives configuration.
    ///
    /// Rejected once the league's lock date has passed. When the effective
    /// lives allowance changes, every membership of the league follows it.
    pub async fn update_lives_settings(
        &self,
        league_id: &str,
        patch: &LivesSettingsPatch,
    ) -> Result<League, SurvivorError> {
        let user_id = self.collab.require_user().await?;
        let persistence = &self.collab.persistence;
        let mut league = self.collab.call(persistence.fetch_league(league_id)).await?;
        if league.owner_id != user_id {
            return Err(SurvivorError::Forbidden(format!(
                "only the owner of league {league_id} can change its lives settings"
            )));
        }

        let before = league.effective_max_lives();
        league.update_lives_settings(patch.merged(&league.settings), self.collab.now())?;
        let league = self.collab.call(persistence.update_league(&league)).await?;

        let after = league.effective_max_lives();
        let roster = if after != before {
            let roster = self
                .collab
                .call(persistence.update_member_max_lives(league_id, after))
                .await?;
            info!(
                "Lives allowance of {league_id} changed from {before} to {after} for {} member(s)",
                roster.len()
            );
            roster
        } else {
            Vec::new()
        };

        if let Some(context) = &self.context {
            context.record_league(&league);
            for member in &roster {
                context.record_membership(member);
            }
        }
        Ok(league)
    }
}
