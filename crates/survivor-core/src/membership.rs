// League membership context: the participant's leagues, the active league,
// TTL caches for rosters and picks, and change notification.
//
// One `MembershipContext` is built at startup and handed to every consumer.
// All mutable state sits behind a single std mutex that is never held across
// an await; backend calls happen outside the lock and their results are
// written back afterwards.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use crate::backend::Collaborators;
use crate::cache::{is_fresh, TtlCache};
use crate::config::EngineConfig;
use crate::error::SurvivorError;
use crate::model::{
    League, LeagueChoice, LeagueId, Membership, Pick, PickQuery, Scope, UserId, UserLeague,
};
use crate::notify::{ContextEvent, ListenerRegistry, Subscription};

const DEFAULT_TTL: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Settings and snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSettings {
    pub membership_ttl: Duration,
    pub roster_ttl: Duration,
    pub picks_ttl: Duration,
}

impl Default for ContextSettings {
    fn default() -> Self {
        ContextSettings {
            membership_ttl: DEFAULT_TTL,
            roster_ttl: DEFAULT_TTL,
            picks_ttl: DEFAULT_TTL,
        }
    }
}

impl From<&EngineConfig> for ContextSettings {
    fn from(config: &EngineConfig) -> Self {
        ContextSettings {
            membership_ttl: config.cache.membership_ttl(),
            roster_ttl: config.cache.roster_ttl(),
            picks_ttl: config.cache.picks_ttl(),
        }
    }
}

/// Where the leagues returned by `load` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// Served from a cache younger than the TTL.
    Cache,
    /// Replaced from a successful backend fetch.
    Backend,
    /// The backend returned no leagues while the cache held some. The
    /// cached set was kept as-is.
    PreservedOnEmpty,
    /// Nobody is signed in. Nothing was fetched and the cached leagues were
    /// left as they were.
    SignedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadReport {
    pub leagues: Vec<UserLeague>,
    pub source: LoadSource,
}

/// Read-only view of the league the participant is currently acting in.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveContext {
    pub league_id: Option<LeagueId>,
    pub league: Option<UserLeague>,
    /// True when no league is active and picks are solo.
    pub solo_mode: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AllLeaguesContext {
    pub leagues: Vec<UserLeague>,
    pub active_league_id: Option<LeagueId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextStatistics {
    pub total_leagues: usize,
    pub owned_leagues: usize,
    pub active_memberships: usize,
    pub eliminated_memberships: usize,
}

/// Cache key of a pick list: whose picks, in which scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PickCacheKey {
    pub user_id: UserId,
    pub scope: Scope,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct ContextState {
    /// Whose leagues are cached.
    user_id: Option<UserId>,
    leagues: Vec<UserLeague>,
    active_league_id: Option<LeagueId>,
    loaded_at: Option<DateTime<Utc>>,
    rosters: TtlCache<LeagueId, Vec<Membership>>,
    picks: TtlCache<PickCacheKey, Vec<Pick>>,
}

impl ContextState {
    fn new(settings: &ContextSettings) -> Self {
        ContextState {
            user_id: None,
            leagues: Vec::new(),
            active_league_id: None,
            loaded_at: None,
            rosters: TtlCache::new(settings.roster_ttl),
            picks: TtlCache::new(settings.picks_ttl),
        }
    }

    fn contains(&self, league_id: &str) -> bool {
        self.leagues.iter().any(|l| l.league_id() == league_id)
    }

    fn list_changed(&self) -> ContextEvent {
        ContextEvent::LeagueListChanged {
            league_count: self.leagues.len(),
            active_league_id: self.active_league_id.clone(),
        }
    }

    fn active_choice(&self) -> LeagueChoice {
        LeagueChoice::of(self.active_league_id.as_deref())
    }

    fn forget_league(&mut self, league_id: &str) {
        self.rosters.invalidate(&league_id.to_string());
        self.picks.invalidate_where(|key| {
            key.scope.league_id() == Some(league_id) || key.scope == Scope::AnyLeague
        });
    }
}

struct Core {
    collab: Collaborators,
    settings: ContextSettings,
    state: Mutex<ContextState>,
    listeners: Arc<ListenerRegistry>,
}

impl Core {
    fn state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remember the active league of the cached user across restarts. Solo
    /// play is only remembered when chosen explicitly.
    fn remember_active(&self, state: &ContextState) {
        if let (Some(user_id), Some(league_id)) = (&state.user_id, &state.active_league_id) {
            self.collab
                .preferences
                .set_active_league(user_id, LeagueChoice::League(league_id.clone()));
        }
    }

    /// Drop everything cached, announcing the change.
    fn reset(&self) -> Vec<ContextEvent> {
        let mut state = self.state();
        let previous = state.active_league_id.take();
        let had_leagues = !state.leagues.is_empty();
        *state = ContextState::new(&self.settings);
        let mut events = Vec::new();
        if previous.is_some() {
            events.push(ContextEvent::ActiveLeagueChanged {
                new_league_id: None,
                previous_league_id: previous,
            });
        }
        if had_leagues {
            events.push(state.list_changed());
        }
        events
    }

    /// Cached leagues, if they were loaded less than one TTL ago.
    fn fresh_leagues(&self) -> Option<Vec<UserLeague>> {
        let now = self.collab.now();
        let state = self.state();
        let fresh = !state.leagues.is_empty()
            && state
                .loaded_at
                .is_some_and(|at| is_fresh(at, self.settings.membership_ttl, now));
        fresh.then(|| state.leagues.clone())
    }

    async fn refresh_memberships(&self) -> Result<LoadReport, SurvivorError> {
        let Some(user_id) = self.collab.auth.current_user_id().await else {
            debug!("No signed-in user, membership context left as is");
            return Ok(LoadReport {
                leagues: Vec::new(),
                source: LoadSource::SignedOut,
            });
        };

        let switched = self
            .state()
            .user_id
            .as_ref()
            .is_some_and(|cached| *cached != user_id);
        if switched {
            info!("Signed-in user changed to {user_id}, dropping cached leagues");
            let events = self.reset();
            self.listeners.emit_all(&events);
        }

        let fetched = match self
            .collab
            .call(self.collab.persistence.fetch_memberships(&user_id))
            .await
        {
            Ok(leagues) => leagues,
            Err(e) => {
                warn!("Membership fetch for {user_id} failed, keeping cached leagues: {e}");
                return Err(e);
            }
        };

        let preferred = self.collab.preferences.active_league(&user_id);
        let now = self.collab.now();
        let (report, events) = {
            let mut guard = self.state();
            let state = &mut *guard;

            if fetched.is_empty() && !state.leagues.is_empty() {
                warn!(
                    "Backend returned no leagues for {user_id} while {} are cached; treating as replication lag",
                    state.leagues.len()
                );
                return Ok(LoadReport {
                    leagues: state.leagues.clone(),
                    source: LoadSource::PreservedOnEmpty,
                });
            }

            let mut leagues = fetched;
            for league in &mut leagues {
                let cached = state
                    .leagues
                    .iter()
                    .find(|c| c.league_id() == league.league_id())
                    .and_then(|c| c.membership.last_accessed);
                league.membership.last_accessed =
                    league.membership.last_accessed.max(cached);
            }

            let kept: HashSet<LeagueId> =
                leagues.iter().map(|l| l.league_id().to_string()).collect();
            let removed: Vec<LeagueId> = state
                .leagues
                .iter()
                .map(|l| l.league_id().to_string())
                .filter(|id| !kept.contains(id))
                .collect();
            for league_id in &removed {
                state.forget_league(league_id);
            }

            state.user_id = Some(user_id.clone());
            state.leagues = leagues;
            state.loaded_at = Some(now);

            let previous = state.active_league_id.clone();
            let still_known = previous.as_deref().is_some_and(|id| kept.contains(id));
            if !still_known {
                state.active_league_id = match &preferred {
                    Some(LeagueChoice::Solo) => None,
                    Some(LeagueChoice::League(id)) if kept.contains(id) => Some(id.clone()),
                    _ => state.leagues.first().map(|l| l.league_id().to_string()),
                };
            }
            if preferred.as_ref() != Some(&state.active_choice()) {
                self.remember_active(state);
            }

            let mut events = Vec::new();
            if state.active_league_id != previous {
                events.push(ContextEvent::ActiveLeagueChanged {
                    new_league_id: state.active_league_id.clone(),
                    previous_league_id: previous,
                });
            }
            events.push(state.list_changed());

            info!(
                "Loaded {} league(s) for {user_id}, active league {:?}",
                state.leagues.len(),
                state.active_league_id
            );
            (
                LoadReport {
                    leagues: state.leagues.clone(),
                    source: LoadSource::Backend,
                },
                events,
            )
        };

        self.listeners.emit_all(&events);
        Ok(report)
    }
}

type SharedLoad = Shared<BoxFuture<'static, Result<LoadReport, SurvivorError>>>;

// ---------------------------------------------------------------------------
// MembershipContext
// ---------------------------------------------------------------------------

/// The participant's league memberships and cached per-league data.
pub struct MembershipContext {
    core: Arc<Core>,
    in_flight: Mutex<Option<SharedLoad>>,
}

impl MembershipContext {
    pub fn new(collab: Collaborators, settings: ContextSettings) -> Self {
        MembershipContext {
            core: Arc::new(Core {
                collab,
                state: Mutex::new(ContextState::new(&settings)),
                settings,
                listeners: ListenerRegistry::new(),
            }),
            in_flight: Mutex::new(None),
        }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.core.collab
    }

    pub fn settings(&self) -> ContextSettings {
        self.core.settings
    }

    /// Load the participant's leagues.
    ///
    /// Concurrent callers share one backend fetch. Without `force_refresh` a
    /// cache younger than the membership TTL is returned directly. A failed
    /// fetch leaves the cached leagues untouched and returns the error.
    pub async fn load(&self, force_refresh: bool) -> Result<LoadReport, SurvivorError> {
        let pending = {
            let mut slot = self.in_flight();
            match slot.as_ref() {
                Some(pending) => {
                    debug!("Joining in-flight membership load");
                    pending.clone()
                }
                None => {
                    if !force_refresh {
                        if let Some(leagues) = self.core.fresh_leagues() {
                            return Ok(LoadReport {
                                leagues,
                                source: LoadSource::Cache,
                            });
                        }
                    }
                    let core = Arc::clone(&self.core);
                    let load = async move { core.refresh_memberships().await }
                        .boxed()
                        .shared();
                    *slot = Some(load.clone());
                    load
                }
            }
        };

        let result = pending.clone().await;

        let mut slot = self.in_flight();
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&pending)) {
            *slot = None;
        }
        result
    }

    pub fn get_active_context(&self) -> ActiveContext {
        let state = self.core.state();
        let league = state
            .active_league_id
            .as_deref()
            .and_then(|id| state.leagues.iter().find(|l| l.league_id() == id))
            .cloned();
        ActiveContext {
            league_id: state.active_league_id.clone(),
            league,
            solo_mode: state.active_league_id.is_none(),
        }
    }

    pub fn get_all_leagues_context(&self) -> AllLeaguesContext {
        let state = self.core.state();
        AllLeaguesContext {
            leagues: state.leagues.clone(),
            active_league_id: state.active_league_id.clone(),
        }
    }

    pub fn active_league_id(&self) -> Option<LeagueId> {
        self.core.state().active_league_id.clone()
    }

    pub fn league(&self, league_id: &str) -> Option<UserLeague> {
        self.core
            .state()
            .leagues
            .iter()
            .find(|l| l.league_id() == league_id)
            .cloned()
    }

    /// Make `league_id` the active league. Returns false, changing nothing,
    /// when the participant is not a member of it.
    pub fn set_active_league(&self, league_id: &str) -> bool {
        let event = {
            let mut guard = self.core.state();
            let state = &mut *guard;
            let now = self.core.collab.now();
            let Some(entry) = state
                .leagues
                .iter_mut()
                .find(|l| l.league_id() == league_id)
            else {
                debug!("Ignoring switch to unknown league {league_id}");
                return false;
            };
            entry.membership.last_accessed = Some(now);
            let previous = state.active_league_id.replace(league_id.to_string());
            self.core.remember_active(state);
            ContextEvent::ActiveLeagueChanged {
                new_league_id: Some(league_id.to_string()),
                previous_league_id: previous,
            }
        };
        self.core.listeners.emit(&event);
        true
    }

    /// Switch to solo play.
    pub fn clear_active_league(&self) {
        let previous = {
            let mut state = self.core.state();
            let previous = state.active_league_id.take();
            if let Some(user_id) = &state.user_id {
                self.core
                    .collab
                    .preferences
                    .set_active_league(user_id, LeagueChoice::Solo);
            }
            previous
        };
        if previous.is_some() {
            self.core.listeners.emit(&ContextEvent::ActiveLeagueChanged {
                new_league_id: None,
                previous_league_id: previous,
            });
        }
    }

    /// Add (or replace) a league membership. The first league added becomes
    /// the active one.
    pub fn add_league(&self, league: UserLeague) {
        let events = {
            let mut state = self.core.state();
            let league_id = league.league_id().to_string();
            match state
                .leagues
                .iter_mut()
                .find(|l| l.league_id() == league_id)
            {
                Some(existing) => *existing = league,
                None => state.leagues.push(league),
            }

            let mut events = Vec::new();
            if state.active_league_id.is_none() {
                state.active_league_id = Some(league_id.clone());
                self.core.remember_active(&state);
                events.push(ContextEvent::ActiveLeagueChanged {
                    new_league_id: Some(league_id),
                    previous_league_id: None,
                });
            }
            events.push(state.list_changed());
            events
        };
        self.core.listeners.emit_all(&events);
    }

    /// Drop a league membership and its cached data. Removing the active
    /// league activates the first remaining one, if any.
    pub fn remove_league(&self, league_id: &str) -> bool {
        let events = {
            let mut state = self.core.state();
            let before = state.leagues.len();
            state.leagues.retain(|l| l.league_id() != league_id);
            if state.leagues.len() == before {
                return false;
            }
            state.forget_league(league_id);

            let mut events = Vec::new();
            if state.active_league_id.as_deref() == Some(league_id) {
                let next = state.leagues.first().map(|l| l.league_id().to_string());
                let previous = std::mem::replace(&mut state.active_league_id, next.clone());
                self.core.remember_active(&state);
                events.push(ContextEvent::ActiveLeagueChanged {
                    new_league_id: next,
                    previous_league_id: previous,
                });
            }
            events.push(state.list_changed());
            events
        };
        self.core.listeners.emit_all(&events);
        true
    }

    /// Write back a league record the backend just changed.
    pub fn record_league(&self, league: &League) {
        let mut state = self.core.state();
        for entry in state
            .leagues
            .iter_mut()
            .filter(|l| l.league_id() == league.league_id)
        {
            entry.league = league.clone();
        }
    }

    /// Write back a membership the backend just changed, so snapshots show
    /// the new life state without a full reload.
    pub fn record_membership(&self, member: &Membership) {
        let mut state = self.core.state();
        if let Some(entry) = state
            .leagues
            .iter_mut()
            .find(|l| l.league_id() == member.league_id && l.membership.user_id == member.user_id)
        {
            let last_accessed = entry.membership.last_accessed;
            entry.membership = member.clone();
            entry.membership.last_accessed = last_accessed.max(member.last_accessed);
        }
        state.rosters.invalidate(&member.league_id);
    }

    // -----------------------------------------------------------------------
    // Per-league resource caches
    // -----------------------------------------------------------------------

    /// Every membership of a league, cached for the roster TTL.
    pub async fn roster(
        &self,
        league_id: &str,
        force_refresh: bool,
    ) -> Result<Vec<Membership>, SurvivorError> {
        let key = league_id.to_string();
        if !force_refresh {
            let now = self.core.collab.now();
            if let Some(roster) = self.core.state().rosters.get_fresh(&key, now) {
                return Ok(roster);
            }
        }

        let collab = &self.core.collab;
        let roster = collab
            .call(collab.persistence.fetch_roster(league_id))
            .await
            .inspect_err(|e| warn!("Roster fetch for {league_id} failed: {e}"))?;
        self.core
            .state()
            .rosters
            .insert(key, roster.clone(), collab.now());
        Ok(roster)
    }

    /// A participant's picks within `scope`, cached for the picks TTL.
    pub async fn picks(
        &self,
        user_id: &str,
        scope: &Scope,
        force_refresh: bool,
    ) -> Result<Vec<Pick>, SurvivorError> {
        let key = PickCacheKey {
            user_id: user_id.to_string(),
            scope: scope.clone(),
        };
        if !force_refresh {
            let now = self.core.collab.now();
            if let Some(picks) = self.core.state().picks.get_fresh(&key, now) {
                return Ok(picks);
            }
        }

        let collab = &self.core.collab;
        let query = PickQuery::for_user(user_id, scope.clone());
        let picks = collab
            .call(collab.persistence.fetch_picks(&query))
            .await
            .inspect_err(|e| warn!("Pick fetch for {user_id} in {scope} failed: {e}"))?;
        self.core
            .state()
            .picks
            .insert(key, picks.clone(), collab.now());
        Ok(picks)
    }

    /// Drop cached picks of `user_id` that a write in `scope` may have made
    /// stale: the scope itself plus the cross-league view.
    pub fn invalidate_picks(&self, user_id: &str, scope: &Scope) {
        let dropped = self.core.state().picks.invalidate_where(|key| {
            key.user_id == user_id
                && (key.scope == *scope
                    || key.scope == Scope::AnyLeague
                    || *scope == Scope::AnyLeague)
        });
        debug!("Invalidated {dropped} pick cache entr(ies) for {user_id} in {scope}");
    }

    pub fn invalidate_roster(&self, league_id: &str) {
        self.core.state().rosters.invalidate(&league_id.to_string());
    }

    /// Drop every cached resource of one league.
    pub fn invalidate_league(&self, league_id: &str) {
        self.core.state().forget_league(league_id);
    }

    // -----------------------------------------------------------------------
    // Notification and reporting
    // -----------------------------------------------------------------------

    /// Register a listener for league changes. Drop or `unsubscribe` the
    /// returned handle to stop receiving events.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ContextEvent) + Send + Sync + 'static,
    {
        self.core.listeners.subscribe(listener)
    }

    pub fn statistics(&self) -> ContextStatistics {
        let state = self.core.state();
        ContextStatistics {
            total_leagues: state.leagues.len(),
            owned_leagues: state.leagues.iter().filter(|l| l.membership.is_owner).count(),
            active_memberships: state
                .leagues
                .iter()
                .filter(|l| l.membership.is_active())
                .count(),
            eliminated_memberships: state
                .leagues
                .iter()
                .filter(|l| l.membership.is_eliminated())
                .count(),
        }
    }

    /// Leagues ordered by most recent access; never-accessed leagues last.
    pub fn leagues_by_recent_access(&self) -> Vec<UserLeague> {
        let mut leagues = self.core.state().leagues.clone();
        leagues.sort_by(|a, b| b.membership.last_accessed.cmp(&a.membership.last_accessed));
        leagues
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<SharedLoad>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
