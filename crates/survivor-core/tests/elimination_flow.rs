// Integration tests for race processing: life loss and elimination over a
// league roster and across every active league, idempotent replays, repair
// of interrupted updates, league completion and the owner-only lives
// adjustment.

mod common;

use common::*;
use survivor_core::elimination::{EliminationProcessor, RevivePolicy};
use survivor_core::model::{
    EliminationRecord, FinishPosition, League, LeagueStatus, LifeEvent, LifeEventType,
    LifeOperation, Membership, MemberStatus, Pick,
};
use survivor_core::store::SeasonSnapshot;
use survivor_core::SurvivorError;

const LEAGUE: &str = "paddock";
const RACE: &str = "monaco";

// ===========================================================================
// Test helpers
// ===========================================================================

/// A league with `max_lives`, the given members and their Monaco picks
/// (`(user, driver)`), and a Monaco result where `d{n}` finished P{n}
/// (`d20` retired).
fn season(max_lives: u8, members: Vec<Membership>, picks: &[(&str, &str)]) -> SeasonSnapshot {
    SeasonSnapshot {
        leagues: vec![league(LEAGUE, "boss", max_lives)],
        members,
        picks: picks
            .iter()
            .map(|(user, driver)| pick(user, Some(LEAGUE), RACE, driver))
            .collect(),
        results: vec![classified_result(RACE)],
        ..SeasonSnapshot::default()
    }
}

fn processor(h: &Harness) -> EliminationProcessor {
    EliminationProcessor::new(h.collab.clone())
}

fn stored_member(h: &Harness, user_id: &str) -> Membership {
    h.store
        .snapshot()
        .members
        .into_iter()
        .find(|m| m.league_id == LEAGUE && m.user_id == user_id)
        .unwrap()
}

fn stored_pick(h: &Harness, user_id: &str) -> Pick {
    h.store
        .snapshot()
        .picks
        .into_iter()
        .find(|p| p.user_id == user_id && p.race_id == RACE)
        .unwrap()
}

fn stored_league(h: &Harness, league_id: &str) -> League {
    h.store
        .snapshot()
        .leagues
        .into_iter()
        .find(|l| l.league_id == league_id)
        .unwrap()
}

fn events_of(h: &Harness, user_id: &str) -> Vec<LifeEvent> {
    h.store
        .snapshot()
        .life_events
        .into_iter()
        .filter(|e| e.user_id == user_id)
        .collect()
}

// ===========================================================================
// Race processing
// ===========================================================================

#[tokio::test]
async fn bad_finish_on_last_life_eliminates() {
    let h = harness(
        season(3, vec![member(LEAGUE, "u1", 3, 2)], &[("u1", "d15")]),
        Some("boss"),
        at(25, 18),
    );

    let report = processor(&h).process_race(LEAGUE, RACE).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.eliminations, 1);
    assert!(report.survivors.is_empty());
    assert!(report.league_decided);
    assert_eq!(report.winner, None);
    assert!(report.league_completed);
    assert_eq!(stored_league(&h, LEAGUE).status, LeagueStatus::Completed);

    let member = stored_member(&h, "u1");
    assert_eq!(member.remaining_lives(), 0);
    assert_eq!(member.status(), MemberStatus::Eliminated);
    assert_eq!(member.elimination_history().len(), 1);

    let events = events_of(&h, "u1");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, LifeEventType::FinalElimination);
    assert_eq!(events[0].lives_remaining, 0);
    assert_eq!(events[0].driver_picked.as_deref(), Some("d15"));
    assert_eq!(events[0].final_position, Some(FinishPosition::Classified(15)));

    let pick = stored_pick(&h, "u1");
    assert_eq!(pick.survived, Some(false));
    assert_eq!(pick.final_position, Some(FinishPosition::Classified(15)));
}

#[tokio::test]
async fn tenth_is_safe_and_eleventh_costs_a_life() {
    let h = harness(
        season(
            3,
            vec![member(LEAGUE, "u1", 3, 1), member(LEAGUE, "u2", 3, 1)],
            &[("u1", "d10"), ("u2", "d11")],
        ),
        Some("boss"),
        at(25, 18),
    );

    let report = processor(&h).process_race(LEAGUE, RACE).await.unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.life_losses, 1);
    assert_eq!(report.eliminations, 0);
    assert_eq!(report.survivors, vec!["u1".to_string(), "u2".to_string()]);
    assert!(!report.league_decided);
    assert!(!report.league_completed);
    assert_eq!(stored_league(&h, LEAGUE).status, LeagueStatus::Active);

    assert_eq!(stored_member(&h, "u1").remaining_lives(), 2);
    assert!(events_of(&h, "u1").is_empty());
    assert_eq!(stored_pick(&h, "u1").survived, Some(true));

    assert_eq!(stored_member(&h, "u2").remaining_lives(), 1);
    let events = events_of(&h, "u2");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, LifeEventType::LifeLost);
    assert_eq!(events[0].lives_remaining, 1);
}

#[tokio::test]
async fn lost_life_is_kept_in_the_elimination_history() {
    let h = harness(
        season(3, vec![member(LEAGUE, "u1", 3, 0)], &[("u1", "d15")]),
        Some("boss"),
        at(25, 18),
    );
    let processor = processor(&h);

    let report = processor.process_race(LEAGUE, RACE).await.unwrap();
    assert_eq!(report.life_losses, 1);

    let member = stored_member(&h, "u1");
    assert_eq!(member.remaining_lives(), 2);
    assert_eq!(
        member.elimination_history(),
        &[EliminationRecord {
            race_id: RACE.into(),
            driver_id: "d15".into(),
            final_position: FinishPosition::Classified(15),
            recorded_at: at(25, 18),
        }]
    );

    processor.process_race(LEAGUE, RACE).await.unwrap();
    assert_eq!(stored_member(&h, "u1").elimination_history().len(), 1);
}

#[tokio::test]
async fn retirement_counts_as_a_bad_finish() {
    let h = harness(
        season(
            1,
            vec![member(LEAGUE, "u1", 1, 0), member(LEAGUE, "u2", 1, 0)],
            &[("u1", "d20"), ("u2", "d1")],
        ),
        Some("boss"),
        at(25, 18),
    );

    let report = processor(&h).process_race(LEAGUE, RACE).await.unwrap();
    assert_eq!(report.eliminations, 1);
    assert!(stored_member(&h, "u1").is_eliminated());
    assert_eq!(stored_pick(&h, "u1").final_position, Some(FinishPosition::Dnf));
    assert!(report.league_decided);
    assert_eq!(report.winner.as_deref(), Some("u2"));
    assert!(report.league_completed);
}

#[tokio::test]
async fn completed_league_is_not_completed_again() {
    let h = harness(
        season(
            1,
            vec![member(LEAGUE, "u1", 1, 0), member(LEAGUE, "u2", 1, 0)],
            &[("u1", "d20"), ("u2", "d1")],
        ),
        Some("boss"),
        at(25, 18),
    );
    let processor = processor(&h);

    assert!(processor.process_race(LEAGUE, RACE).await.unwrap().league_completed);
    let again = processor.process_race(LEAGUE, RACE).await.unwrap();
    assert!(again.league_decided);
    assert!(!again.league_completed);
    assert_eq!(h.store.calls("update_league"), 1);
}

#[tokio::test]
async fn processing_a_race_twice_changes_nothing() {
    let h = harness(
        season(3, vec![member(LEAGUE, "u1", 3, 0)], &[("u1", "d11")]),
        Some("boss"),
        at(25, 18),
    );
    let processor = processor(&h);

    let first = processor.process_race(LEAGUE, RACE).await.unwrap();
    assert_eq!(first.life_losses, 1);

    let second = processor.process_race(LEAGUE, RACE).await.unwrap();
    assert_eq!(second.life_losses, 0);
    assert_eq!(second.replays, 1);
    assert_eq!(stored_member(&h, "u1").remaining_lives(), 2);
    assert_eq!(events_of(&h, "u1").len(), 1);
}

#[tokio::test]
async fn interrupted_update_is_repaired_on_replay() {
    // The event was appended but the lives write never landed.
    let mut data = season(2, vec![member(LEAGUE, "u1", 2, 0)], &[("u1", "d12")]);
    data.life_events.push(LifeEvent {
        user_id: "u1".into(),
        league_id: LEAGUE.into(),
        race_id: Some(RACE.into()),
        event_type: LifeEventType::LifeLost,
        lives_remaining: 1,
        driver_picked: Some("d12".into()),
        final_position: Some(FinishPosition::Classified(12)),
        event_date: at(25, 16),
        admin_user_id: None,
        admin_reason: None,
    });
    let h = harness(data, Some("boss"), at(25, 18));

    let report = processor(&h).process_race(LEAGUE, RACE).await.unwrap();
    assert_eq!(report.replays, 1);
    assert_eq!(report.life_losses, 0);
    let member = stored_member(&h, "u1");
    assert_eq!(member.remaining_lives(), 1);
    assert_eq!(member.elimination_history().len(), 1);
    assert_eq!(member.elimination_history()[0].recorded_at, at(25, 16));
    assert_eq!(events_of(&h, "u1").len(), 1);
}

#[tokio::test]
async fn member_without_a_pick_does_not_block_the_others() {
    let h = harness(
        season(
            2,
            vec![member(LEAGUE, "u1", 2, 0), member(LEAGUE, "u2", 2, 0)],
            &[("u1", "d16")],
        ),
        Some("boss"),
        at(25, 18),
    );

    let report = processor(&h).process_race(LEAGUE, RACE).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.life_losses, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].0, "u2");
    assert!(matches!(report.errors[0].1, SurvivorError::NotFound { entity: "pick", .. }));
    assert!(report.survivors.contains(&"u2".to_string()));
    assert_eq!(stored_member(&h, "u2").remaining_lives(), 2);
}

#[tokio::test]
async fn eliminated_members_are_not_processed_again() {
    let h = harness(
        season(
            1,
            vec![member(LEAGUE, "u1", 1, 1), member(LEAGUE, "u2", 1, 0)],
            &[("u1", "d18"), ("u2", "d2")],
        ),
        Some("boss"),
        at(25, 18),
    );

    let report = processor(&h).process_race(LEAGUE, RACE).await.unwrap();
    assert_eq!(report.processed, 1);
    assert!(events_of(&h, "u1").is_empty());
    assert_eq!(stored_pick(&h, "u1").survived, None);
    assert_eq!(report.winner.as_deref(), Some("u2"));
}

#[tokio::test]
async fn backend_outage_aborts_the_run() {
    let h = harness(
        season(1, vec![member(LEAGUE, "u1", 1, 0)], &[("u1", "d19")]),
        Some("boss"),
        at(25, 18),
    );
    h.store.set_unavailable(Some("maintenance"));

    let err = processor(&h).process_race(LEAGUE, RACE).await.unwrap_err();
    assert!(err.is_retryable());

    h.store.set_unavailable(None);
    assert!(stored_member(&h, "u1").is_active());
    assert!(h.store.snapshot().life_events.is_empty());
}

#[tokio::test]
async fn missing_result_is_not_found() {
    let mut data = season(1, vec![member(LEAGUE, "u1", 1, 0)], &[("u1", "d1")]);
    data.results.clear();
    let h = harness(data, Some("boss"), at(25, 18));

    let err = processor(&h).process_race(LEAGUE, RACE).await.unwrap_err();
    assert!(matches!(err, SurvivorError::NotFound { entity: "race result", .. }));
}

#[tokio::test]
async fn membership_context_follows_processed_members() {
    let h = harness(
        season(3, vec![member(LEAGUE, "u1", 3, 0)], &[("u1", "d17")]),
        Some("u1"),
        at(25, 18),
    );
    let ctx = h.context();
    ctx.load(false).await.unwrap();

    EliminationProcessor::new(h.collab.clone())
        .with_context(ctx.clone())
        .process_race(LEAGUE, RACE)
        .await
        .unwrap();

    let league = ctx.league(LEAGUE).unwrap();
    assert_eq!(league.membership.remaining_lives(), 2);
    assert_eq!(ctx.roster(LEAGUE, false).await.unwrap()[0].remaining_lives(), 2);
}

// ===========================================================================
// Every active league
// ===========================================================================

/// `paddock` (3 lives, two members), `pitlane` (one life), `quiet` (nobody
/// picked) and `archive` (already completed, with a pick).
fn season_of_leagues() -> SeasonSnapshot {
    let mut archive = league("archive", "boss", 1);
    archive.status = LeagueStatus::Completed;
    SeasonSnapshot {
        leagues: vec![
            league(LEAGUE, "boss", 3),
            league("pitlane", "boss", 1),
            league("quiet", "boss", 1),
            archive,
        ],
        members: vec![
            member(LEAGUE, "u1", 3, 0),
            member(LEAGUE, "u2", 3, 0),
            member("pitlane", "u1", 1, 0),
            member("pitlane", "u3", 1, 0),
            member("quiet", "u4", 1, 0),
            member("archive", "u5", 1, 0),
        ],
        picks: vec![
            pick("u1", Some(LEAGUE), RACE, "d12"),
            pick("u2", Some(LEAGUE), RACE, "d3"),
            pick("u1", Some("pitlane"), RACE, "d12"),
            pick("u3", Some("pitlane"), RACE, "d4"),
            pick("u5", Some("archive"), RACE, "d20"),
        ],
        results: vec![classified_result(RACE)],
        ..SeasonSnapshot::default()
    }
}

fn member_in(h: &Harness, league_id: &str, user_id: &str) -> Membership {
    h.store
        .snapshot()
        .members
        .into_iter()
        .find(|m| m.league_id == league_id && m.user_id == user_id)
        .unwrap()
}

#[tokio::test]
async fn race_is_applied_to_every_active_league() {
    let h = harness(season_of_leagues(), Some("boss"), at(25, 18));

    let season = processor(&h).process_race_all_leagues(RACE).await.unwrap();

    let processed: Vec<&str> = season.reports.iter().map(|r| r.league_id.as_str()).collect();
    assert_eq!(processed, vec![LEAGUE, "pitlane"]);
    assert_eq!(season.skipped, vec!["quiet".to_string()]);
    assert!(season.failures.is_empty());
    assert_eq!(season.processed(), 4);
    assert_eq!(season.eliminations(), 1);

    // The same pick costs a life in one league and the whole game in the other.
    assert_eq!(member_in(&h, LEAGUE, "u1").remaining_lives(), 2);
    assert!(member_in(&h, "pitlane", "u1").is_eliminated());
    assert_eq!(stored_league(&h, "pitlane").status, LeagueStatus::Completed);
    // Completed leagues are left alone.
    assert!(member_in(&h, "archive", "u5").is_active());
}

#[tokio::test]
async fn one_failing_league_does_not_stop_the_others() {
    let h = harness(season_of_leagues(), Some("boss"), at(25, 18));
    h.store.set_league_unavailable(Some(LEAGUE));

    let season = processor(&h).process_race_all_leagues(RACE).await.unwrap();

    assert_eq!(season.failures.len(), 1);
    assert_eq!(season.failures[0].0, LEAGUE);
    assert!(season.failures[0].1.is_retryable());
    assert_eq!(season.reports.len(), 1);
    assert_eq!(season.reports[0].league_id, "pitlane");
    assert!(member_in(&h, "pitlane", "u1").is_eliminated());
    assert_eq!(member_in(&h, LEAGUE, "u1").remaining_lives(), 3);

    // Re-running once the league is reachable catches it up. Pitlane is
    // completed by now and left alone.
    h.store.set_league_unavailable(None);
    let retry = processor(&h).process_race_all_leagues(RACE).await.unwrap();
    assert!(retry.failures.is_empty());
    assert_eq!(retry.reports.len(), 1);
    assert_eq!(member_in(&h, LEAGUE, "u1").remaining_lives(), 2);
}

#[tokio::test]
async fn missing_result_aborts_the_season_run() {
    let mut data = season_of_leagues();
    data.results.clear();
    let h = harness(data, Some("boss"), at(25, 18));

    let err = processor(&h)
        .process_race_all_leagues(RACE)
        .await
        .unwrap_err();
    assert!(matches!(err, SurvivorError::NotFound { entity: "race result", .. }));
    assert_eq!(h.store.calls("fetch_roster"), 0);
}

// ===========================================================================
// Lives adjustment
// ===========================================================================

#[tokio::test]
async fn owner_restores_a_life() {
    let h = harness(
        season(3, vec![member(LEAGUE, "u1", 3, 2)], &[]),
        Some("boss"),
        at(26, 9),
    );

    let op = LifeOperation::increment(1, "stewards reversed the penalty");
    let member = processor(&h)
        .restore_lives(LEAGUE, "u1", &op, RevivePolicy::OnlyActive)
        .await
        .unwrap();
    assert_eq!(member.remaining_lives(), 2);

    let events = events_of(&h, "u1");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, LifeEventType::LifeRestored);
    assert_eq!(events[0].race_id, None);
    assert_eq!(events[0].admin_user_id.as_deref(), Some("boss"));
    assert_eq!(
        events[0].admin_reason.as_deref(),
        Some("stewards reversed the penalty")
    );
}

#[tokio::test]
async fn only_the_owner_adjusts_lives() {
    let h = harness(
        season(3, vec![member(LEAGUE, "u1", 3, 2), member(LEAGUE, "u2", 3, 0)], &[]),
        Some("u2"),
        at(26, 9),
    );

    let op = LifeOperation::increment(1, "bribe");
    let err = processor(&h)
        .restore_lives(LEAGUE, "u1", &op, RevivePolicy::OnlyActive)
        .await
        .unwrap_err();
    assert!(matches!(err, SurvivorError::Forbidden(_)));
    assert!(h.store.snapshot().life_events.is_empty());
}

#[tokio::test]
async fn reviving_needs_an_explicit_policy() {
    let h = harness(
        season(2, vec![member(LEAGUE, "u1", 2, 2)], &[]),
        Some("boss"),
        at(26, 9),
    );
    let processor = processor(&h);
    let op = LifeOperation::set(1, "appeal upheld");

    let err = processor
        .restore_lives(LEAGUE, "u1", &op, RevivePolicy::OnlyActive)
        .await
        .unwrap_err();
    assert!(matches!(err, SurvivorError::MemberInactive { .. }));

    let member = processor
        .restore_lives(LEAGUE, "u1", &op, RevivePolicy::AllowRevive)
        .await
        .unwrap();
    assert!(member.is_active());
    assert_eq!(stored_member(&h, "u1").remaining_lives(), 1);
}

#[tokio::test]
async fn adjustment_without_reason_is_rejected() {
    let h = harness(
        season(3, vec![member(LEAGUE, "u1", 3, 1)], &[]),
        Some("boss"),
        at(26, 9),
    );

    let err = processor(&h)
        .restore_lives(LEAGUE, "u1", &LifeOperation::set(3, "  "), RevivePolicy::OnlyActive)
        .await
        .unwrap_err();
    assert!(matches!(err, SurvivorError::Validation { .. }));
    assert_eq!(stored_member(&h, "u1").remaining_lives(), 2);
}

#[tokio::test]
async fn unknown_member_is_not_found() {
    let h = harness(season(3, vec![], &[]), Some("boss"), at(26, 9));

    let op = LifeOperation::increment(1, "typo");
    let err = processor(&h)
        .restore_lives(LEAGUE, "ghost", &op, RevivePolicy::OnlyActive)
        .await
        .unwrap_err();
    assert!(matches!(err, SurvivorError::NotFound { entity: "member", .. }));
}
