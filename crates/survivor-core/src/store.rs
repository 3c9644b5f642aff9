// In-memory persistence collaborator.
//
// Backs the CLI (loaded from and written back to a JSON season snapshot) and
// the tests. Fault injection covers the backend behaviours the engines have
// to survive: outages, empty membership reads and slow calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::{Persistence, StoreResult};
use crate::error::StoreError;
use crate::model::{
    EliminationRecord, League, LifeEvent, LifeOperation, MemberStatus, Membership, Pick, PickPatch, PickQuery,
    QualifyingEntry, RaceId, RaceResult, UserLeague,
};

/// Everything the store holds, in its serialized form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeasonSnapshot {
    pub leagues: Vec<League>,
    pub members: Vec<Membership>,
    pub picks: Vec<Pick>,
    pub results: Vec<RaceResult>,
    pub qualifying: HashMap<RaceId, Vec<QualifyingEntry>>,
    pub life_events: Vec<LifeEvent>,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: Option<String>,
    unavailable_league: Option<String>,
    hide_memberships: bool,
    latency: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<SeasonSnapshot>,
    faults: Mutex<Faults>,
    calls: Mutex<HashMap<&'static str, usize>>,
    next_pick_id: AtomicU64,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn from_snapshot(snapshot: SeasonSnapshot) -> Self {
        let next = snapshot.picks.len() as u64;
        MemoryStore {
            data: Mutex::new(snapshot),
            next_pick_id: AtomicU64::new(next),
            ..MemoryStore::default()
        }
    }

    pub fn snapshot(&self) -> SeasonSnapshot {
        locked(&self.data).clone()
    }

    /// Mutate the stored data directly, bypassing faults and counters.
    pub fn edit<R>(&self, f: impl FnOnce(&mut SeasonSnapshot) -> R) -> R {
        f(&mut locked(&self.data))
    }

    // -----------------------------------------------------------------------
    // Fault injection
    // -----------------------------------------------------------------------

    /// Fail every call with `Unavailable` until cleared with `None`.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        locked(&self.faults).unavailable = reason.map(str::to_string);
    }

    /// Fail roster reads of one league until cleared with `None`.
    pub fn set_league_unavailable(&self, league_id: Option<&str>) {
        locked(&self.faults).unavailable_league = league_id.map(str::to_string);
    }

    /// Make `fetch_memberships` return an empty list.
    pub fn hide_memberships(&self, hide: bool) {
        locked(&self.faults).hide_memberships = hide;
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        locked(&self.faults).latency = latency;
    }

    /// How many times `op` was called, failed calls included.
    pub fn calls(&self, op: &str) -> usize {
        locked(&self.calls).get(op).copied().unwrap_or(0)
    }

    async fn enter(&self, op: &'static str) -> StoreResult<()> {
        *locked(&self.calls).entry(op).or_insert(0) += 1;
        let latency = locked(&self.faults).latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match &locked(&self.faults).unavailable {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

fn not_found(entity: &'static str, id: impl Into<String>) -> StoreError {
    StoreError::NotFound {
        entity,
        id: id.into(),
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn fetch_memberships(&self, user_id: &str) -> StoreResult<Vec<UserLeague>> {
        self.enter("fetch_memberships").await?;
        if locked(&self.faults).hide_memberships {
            return Ok(Vec::new());
        }
        let data = locked(&self.data);
        let member_count = |league_id: &str| {
            data.members
                .iter()
                .filter(|m| m.league_id == league_id && m.status() != MemberStatus::Left)
                .count()
        };
        Ok(data
            .members
            .iter()
            .filter(|m| m.user_id == user_id && m.status() != MemberStatus::Left)
            .filter_map(|m| {
                let league = data.leagues.iter().find(|l| l.league_id == m.league_id)?;
                Some(UserLeague {
                    league: league.clone(),
                    membership: m.clone(),
                    member_count: member_count(&m.league_id),
                })
            })
            .collect())
    }

    async fn fetch_league(&self, league_id: &str) -> StoreResult<League> {
        self.enter("fetch_league").await?;
        locked(&self.data)
            .leagues
            .iter()
            .find(|l| l.league_id == league_id)
            .cloned()
            .ok_or_else(|| not_found("league", league_id))
    }

    async fn fetch_leagues(&self) -> StoreResult<Vec<League>> {
        self.enter("fetch_leagues").await?;
        Ok(locked(&self.data).leagues.clone())
    }

    async fn update_league(&self, league: &League) -> StoreResult<League> {
        self.enter("update_league").await?;
        let mut data = locked(&self.data);
        let stored = data
            .leagues
            .iter_mut()
            .find(|l| l.league_id == league.league_id)
            .ok_or_else(|| not_found("league", league.league_id.as_str()))?;
        *stored = league.clone();
        Ok(stored.clone())
    }

    async fn add_member(&self, member: Membership) -> StoreResult<Membership> {
        self.enter("add_member").await?;
        let mut data = locked(&self.data);
        if !data.leagues.iter().any(|l| l.league_id == member.league_id) {
            return Err(not_found("league", member.league_id.as_str()));
        }
        if data
            .members
            .iter()
            .any(|m| m.league_id == member.league_id && m.user_id == member.user_id)
        {
            return Err(StoreError::Rejected(format!(
                "{} is already a member of {}",
                member.user_id, member.league_id
            )));
        }
        data.members.push(member.clone());
        Ok(member)
    }

    async fn update_member_max_lives(
        &self,
        league_id: &str,
        max_lives: u8,
    ) -> StoreResult<Vec<Membership>> {
        self.enter("update_member_max_lives").await?;
        let mut data = locked(&self.data);
        if !data.leagues.iter().any(|l| l.league_id == league_id) {
            return Err(not_found("league", league_id));
        }
        Ok(data
            .members
            .iter_mut()
            .filter(|m| m.league_id == league_id)
            .map(|m| {
                m.set_max_lives(max_lives);
                m.clone()
            })
            .collect())
    }

    async fn fetch_roster(&self, league_id: &str) -> StoreResult<Vec<Membership>> {
        self.enter("fetch_roster").await?;
        if locked(&self.faults).unavailable_league.as_deref() == Some(league_id) {
            return Err(StoreError::Unavailable(format!("league {league_id} is unreachable")));
        }
        let data = locked(&self.data);
        if !data.leagues.iter().any(|l| l.league_id == league_id) {
            return Err(not_found("league", league_id));
        }
        Ok(data
            .members
            .iter()
            .filter(|m| m.league_id == league_id)
            .cloned()
            .collect())
    }

    async fn fetch_picks(&self, query: &PickQuery) -> StoreResult<Vec<Pick>> {
        self.enter("fetch_picks").await?;
        Ok(locked(&self.data)
            .picks
            .iter()
            .filter(|p| query.matches(p))
            .cloned()
            .collect())
    }

    async fn save_pick(&self, mut pick: Pick) -> StoreResult<Pick> {
        self.enter("save_pick").await?;
        let mut data = locked(&self.data);
        if pick.pick_id.is_empty() {
            pick.pick_id = loop {
                let n = self.next_pick_id.fetch_add(1, Ordering::Relaxed) + 1;
                let id = format!("pick-{n}");
                if !data.picks.iter().any(|p| p.pick_id == id) {
                    break id;
                }
            };
        } else if data.picks.iter().any(|p| p.pick_id == pick.pick_id) {
            return Err(StoreError::Rejected(format!("duplicate pick id {}", pick.pick_id)));
        }
        data.picks.push(pick.clone());
        Ok(pick)
    }

    async fn update_pick(&self, pick_id: &str, patch: &PickPatch) -> StoreResult<Pick> {
        self.enter("update_pick").await?;
        let mut data = locked(&self.data);
        let pick = data
            .picks
            .iter_mut()
            .find(|p| p.pick_id == pick_id)
            .ok_or_else(|| not_found("pick", pick_id))?;
        pick.apply_patch(patch);
        Ok(pick.clone())
    }

    async fn fetch_race_result(&self, race_id: &str) -> StoreResult<RaceResult> {
        self.enter("fetch_race_result").await?;
        locked(&self.data)
            .results
            .iter()
            .find(|r| r.race_id == race_id)
            .cloned()
            .ok_or_else(|| not_found("race result", race_id))
    }

    async fn fetch_qualifying_order(&self, race_id: &str) -> StoreResult<Vec<QualifyingEntry>> {
        self.enter("fetch_qualifying_order").await?;
        let mut order = locked(&self.data)
            .qualifying
            .get(race_id)
            .cloned()
            .ok_or_else(|| not_found("qualifying order", race_id))?;
        order.sort_by_key(|e| e.position);
        Ok(order)
    }

    async fn update_member_lives(
        &self,
        league_id: &str,
        user_id: &str,
        op: &LifeOperation,
        record: Option<&EliminationRecord>,
    ) -> StoreResult<Membership> {
        self.enter("update_member_lives").await?;
        if op.reason.trim().is_empty() {
            return Err(StoreError::Rejected("lives update without a reason".into()));
        }
        let mut data = locked(&self.data);
        let member = data
            .members
            .iter_mut()
            .find(|m| m.league_id == league_id && m.user_id == user_id)
            .ok_or_else(|| not_found("member", format!("{league_id}/{user_id}")))?;
        member.apply_life_operation(op);
        if let Some(record) = record {
            member.record_elimination(record.clone());
        }
        Ok(member.clone())
    }

    async fn append_life_event(&self, event: &LifeEvent) -> StoreResult<()> {
        self.enter("append_life_event").await?;
        locked(&self.data).life_events.push(event.clone());
        Ok(())
    }

    async fn fetch_life_events(&self, league_id: &str, user_id: &str) -> StoreResult<Vec<LifeEvent>> {
        self.enter("fetch_life_events").await?;
        let mut events: Vec<LifeEvent> = locked(&self.data)
            .life_events
            .iter()
            .filter(|e| e.league_id == league_id && e.user_id == user_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.event_date);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FinishPosition, LeagueSettings, LeagueStatus, Scope};
    use chrono::{TimeZone, Utc};

    fn league(id: &str) -> League {
        League {
            league_id: id.into(),
            name: id.to_uppercase(),
            owner_id: "owner".into(),
            settings: LeagueSettings::default(),
            status: LeagueStatus::Active,
        }
    }

    fn store() -> MemoryStore {
        let mut left = Membership::new("b", "u1", 1);
        left.leave();
        MemoryStore::from_snapshot(SeasonSnapshot {
            leagues: vec![league("a"), league("b")],
            members: vec![
                Membership::new("a", "u1", 1),
                Membership::new("a", "u2", 1),
                left,
            ],
            ..SeasonSnapshot::default()
        })
    }

    #[tokio::test]
    async fn memberships_skip_leagues_the_user_left() {
        let store = store();
        let leagues = store.fetch_memberships("u1").await.unwrap();
        assert_eq!(leagues.len(), 1);
        assert_eq!(leagues[0].league_id(), "a");
        assert_eq!(leagues[0].member_count, 2);
        assert_eq!(store.calls("fetch_memberships"), 1);
    }

    #[tokio::test]
    async fn faults_are_injected_and_counted() {
        let store = store();
        store.set_unavailable(Some("maintenance"));
        assert_eq!(
            store.fetch_roster("a").await,
            Err(StoreError::Unavailable("maintenance".into()))
        );
        store.set_unavailable(None);
        store.hide_memberships(true);
        assert!(store.fetch_memberships("u1").await.unwrap().is_empty());
        assert_eq!(store.calls("fetch_roster"), 1);
    }

    #[tokio::test]
    async fn saved_picks_get_ids_and_can_be_patched() {
        let store = store();
        let pick = Pick {
            pick_id: String::new(),
            user_id: "u1".into(),
            league_id: Some("a".into()),
            race_id: "monaco".into(),
            driver_id: "16".into(),
            driver_name: None,
            team_name: None,
            is_auto_pick: false,
            auto_pick_reason: None,
            submitted_at: Utc.with_ymd_and_hms(2025, 5, 24, 10, 0, 0).unwrap(),
            final_position: None,
            survived: None,
        };
        let saved = store.save_pick(pick).await.unwrap();
        assert_eq!(saved.pick_id, "pick-1");

        let patched = store
            .update_pick(
                "pick-1",
                &PickPatch {
                    survived: Some(false),
                    ..PickPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(patched.survived, Some(false));

        let found = store
            .fetch_picks(&PickQuery::for_user("u1", Scope::AnyLeague))
            .await
            .unwrap();
        assert_eq!(found, vec![patched]);
    }

    #[tokio::test]
    async fn lives_update_stores_the_elimination_record() {
        let store = store();
        let record = EliminationRecord {
            race_id: "monaco".into(),
            driver_id: "16".into(),
            final_position: FinishPosition::Dnf,
            recorded_at: Utc.with_ymd_and_hms(2025, 5, 25, 16, 0, 0).unwrap(),
        };
        let op = LifeOperation::set(0, "race monaco result");

        let member = store
            .update_member_lives("a", "u1", &op, Some(&record))
            .await
            .unwrap();
        assert!(member.is_eliminated());
        assert_eq!(member.elimination_history(), &[record.clone()]);

        // Writing the same race again does not duplicate the entry.
        store
            .update_member_lives("a", "u1", &op, Some(&record))
            .await
            .unwrap();
        let stored = store.fetch_roster("a").await.unwrap();
        assert_eq!(stored[0].elimination_history().len(), 1);
    }

    #[tokio::test]
    async fn members_are_added_once_and_lives_follow_the_league() {
        let store = store();
        let err = store
            .add_member(Membership::new("a", "u2", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));

        store.add_member(Membership::new("b", "u3", 1)).await.unwrap();
        let roster = store.update_member_max_lives("b", 3).await.unwrap();
        assert_eq!(roster.len(), 2);
        assert!(roster.iter().all(|m| m.max_lives() == 3));

        assert_eq!(
            store.update_member_max_lives("zzz", 2).await,
            Err(not_found("league", "zzz"))
        );
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let snapshot = store().snapshot();
        let json = serde_json::to_string_pretty(&snapshot).unwrap();
        let back: SeasonSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
