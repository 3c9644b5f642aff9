// Collaborator seams: persistence, authentication, client preferences and
// wall-clock time.
//
// The engines never talk to a concrete store. Everything they need from the
// outside world goes through these traits, which are bundled into
// `Collaborators` and handed to each component at construction.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{StoreError, SurvivorError};
use crate::model::{
    EliminationRecord, League, LeagueChoice, LifeEvent, LifeOperation, Membership, Pick, PickPatch,
    PickQuery, QualifyingEntry, RaceResult, UserId, UserLeague,
};

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Backing store for leagues, memberships, picks, results and the life log.
///
/// Implementations are expected to be eventually consistent: a read right
/// after a write may not observe it.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Leagues the user belongs to, with their membership in each.
    async fn fetch_memberships(&self, user_id: &str) -> StoreResult<Vec<UserLeague>>;

    async fn fetch_league(&self, league_id: &str) -> StoreResult<League>;

    /// Every league, whatever its status.
    async fn fetch_leagues(&self) -> StoreResult<Vec<League>>;

    /// Overwrite a stored league record.
    async fn update_league(&self, league: &League) -> StoreResult<League>;

    /// Store a new membership. Rejected when the user is already a member.
    async fn add_member(&self, member: Membership) -> StoreResult<Membership>;

    /// Change the lives allowance of every membership in a league.
    async fn update_member_max_lives(
        &self,
        league_id: &str,
        max_lives: u8,
    ) -> StoreResult<Vec<Membership>>;

    /// Every membership of a league.
    async fn fetch_roster(&self, league_id: &str) -> StoreResult<Vec<Membership>>;

    async fn fetch_picks(&self, query: &PickQuery) -> StoreResult<Vec<Pick>>;

    /// Store a new pick. The store assigns `pick_id` when it is empty.
    async fn save_pick(&self, pick: Pick) -> StoreResult<Pick>;

    async fn update_pick(&self, pick_id: &str, patch: &PickPatch) -> StoreResult<Pick>;

    async fn fetch_race_result(&self, race_id: &str) -> StoreResult<RaceResult>;

    async fn fetch_qualifying_order(&self, race_id: &str) -> StoreResult<Vec<QualifyingEntry>>;

    /// Apply `op` to a member's lives. A race-caused change passes its
    /// `record`, which lands in the member's elimination history in the same
    /// write.
    async fn update_member_lives(
        &self,
        league_id: &str,
        user_id: &str,
        op: &LifeOperation,
        record: Option<&EliminationRecord>,
    ) -> StoreResult<Membership>;

    async fn append_life_event(&self, event: &LifeEvent) -> StoreResult<()>;

    /// Life events of one member, oldest first.
    async fn fetch_life_events(&self, league_id: &str, user_id: &str)
        -> StoreResult<Vec<LifeEvent>>;
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Auth: Send + Sync {
    async fn current_user_id(&self) -> Option<UserId>;

    async fn is_authenticated(&self) -> bool {
        self.current_user_id().await.is_some()
    }
}

/// Auth collaborator with a fixed, swappable signed-in user.
#[derive(Debug, Default)]
pub struct StaticAuth {
    user_id: Mutex<Option<UserId>>,
}

impl StaticAuth {
    pub fn signed_in(user_id: &str) -> Self {
        StaticAuth {
            user_id: Mutex::new(Some(user_id.to_string())),
        }
    }

    pub fn signed_out() -> Self {
        StaticAuth::default()
    }

    pub fn sign_in(&self, user_id: &str) {
        *self.user_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(user_id.to_string());
    }

    pub fn sign_out(&self) {
        *self.user_id.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[async_trait]
impl Auth for StaticAuth {
    async fn current_user_id(&self) -> Option<UserId> {
        self.user_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Preferences
// ---------------------------------------------------------------------------

/// Client-side settings kept per user across restarts.
pub trait Preferences: Send + Sync {
    /// The league (or solo play) the user last chose, if they ever chose.
    fn active_league(&self, user_id: &str) -> Option<LeagueChoice>;

    fn set_active_league(&self, user_id: &str, choice: LeagueChoice);
}

#[derive(Debug, Default)]
pub struct MemoryPreferences {
    active: Mutex<HashMap<UserId, LeagueChoice>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        MemoryPreferences::default()
    }

    pub fn from_map(active: HashMap<UserId, LeagueChoice>) -> Self {
        MemoryPreferences {
            active: Mutex::new(active),
        }
    }

    pub fn snapshot(&self) -> HashMap<UserId, LeagueChoice> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Preferences for MemoryPreferences {
    fn active_league(&self, user_id: &str) -> Option<LeagueChoice> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }

    fn set_active_league(&self, user_id: &str, choice: LeagueChoice) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string(), choice);
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        ManualClock {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Collaborator bundle
// ---------------------------------------------------------------------------

/// Handles to every external collaborator, shared by the engines.
#[derive(Clone)]
pub struct Collaborators {
    pub persistence: Arc<dyn Persistence>,
    pub auth: Arc<dyn Auth>,
    pub clock: Arc<dyn Clock>,
    pub preferences: Arc<dyn Preferences>,
    /// Upper bound on any single backend call.
    pub backend_timeout: Duration,
}

impl Collaborators {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        auth: Arc<dyn Auth>,
        clock: Arc<dyn Clock>,
        backend_timeout: Duration,
    ) -> Self {
        Collaborators {
            persistence,
            auth,
            clock,
            preferences: Arc::new(MemoryPreferences::new()),
            backend_timeout,
        }
    }

    /// Keep client preferences in `preferences` instead of memory.
    pub fn with_preferences(mut self, preferences: Arc<dyn Preferences>) -> Self {
        self.preferences = preferences;
        self
    }

    /// Run a backend call under the configured timeout. A timeout surfaces as
    /// a transient error like any other outage.
    pub async fn call<T, F>(&self, fut: F) -> Result<T, SurvivorError>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.backend_timeout, fut).await {
            Ok(result) => result.map_err(SurvivorError::from),
            Err(_) => Err(StoreError::Timeout(self.backend_timeout).into()),
        }
    }

    /// The signed-in user, or `Unauthenticated`.
    pub async fn require_user(&self) -> Result<UserId, SurvivorError> {
        self.auth
            .current_user_id()
            .await
            .ok_or(SurvivorError::Unauthenticated)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
