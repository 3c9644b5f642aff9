// Subcommand implementations. Each builds the core components it needs over
// the session's in-memory store and prints a short human-readable summary.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use survivor_core::backend::{
    Clock, Collaborators, ManualClock, MemoryPreferences, StaticAuth, SystemClock,
};
use survivor_core::config::EngineConfig;
use survivor_core::elimination::{EliminationProcessor, RaceReport, RevivePolicy};
use survivor_core::leagues::{LeagueManager, LivesSettingsPatch};
use survivor_core::membership::{ContextSettings, MembershipContext};
use survivor_core::model::LifeOperation;
use survivor_core::notify::ContextEvent;
use survivor_core::picks::{AutoPickOutcome, PickInfo, PickPolicy, PickResolver};
use survivor_core::race_state::{Countdown, RaceSchedule, RaceSlot};
use survivor_core::refresh::spawn_refresher;
use survivor_core::store::MemoryStore;
use tracing::{info, warn};

use crate::season::SeasonFile;

pub struct Session {
    store: Arc<MemoryStore>,
    preferences: Arc<MemoryPreferences>,
    schedule: Arc<RaceSchedule>,
    config: EngineConfig,
    collab: Collaborators,
}

impl Session {
    pub fn new(
        season: SeasonFile,
        config: EngineConfig,
        user_id: Option<&str>,
        at: Option<DateTime<Utc>>,
    ) -> Self {
        let store = Arc::new(MemoryStore::from_snapshot(season.data));
        let preferences = Arc::new(MemoryPreferences::from_map(season.active_leagues));
        let auth = match user_id {
            Some(user_id) => StaticAuth::signed_in(user_id),
            None => StaticAuth::signed_out(),
        };
        let clock: Arc<dyn Clock> = match at {
            Some(at) => Arc::new(ManualClock::new(at)),
            None => Arc::new(SystemClock),
        };
        let collab = Collaborators::new(
            store.clone(),
            Arc::new(auth),
            clock,
            config.backend.timeout(),
        )
        .with_preferences(preferences.clone());
        Session {
            store,
            preferences,
            schedule: Arc::new(season.schedule),
            config,
            collab,
        }
    }

    /// The current store contents, ready to be written back.
    pub fn season(&self) -> SeasonFile {
        SeasonFile {
            schedule: (*self.schedule).clone(),
            active_leagues: self.preferences.snapshot(),
            data: self.store.snapshot(),
        }
    }

    async fn loaded_context(&self) -> anyhow::Result<Arc<MembershipContext>> {
        let context = Arc::new(MembershipContext::new(
            self.collab.clone(),
            ContextSettings::from(&self.config),
        ));
        context.load(false).await.context("failed to load leagues")?;
        Ok(context)
    }

    fn resolver(&self, context: Arc<MembershipContext>) -> PickResolver {
        PickResolver::new(
            context,
            Arc::clone(&self.schedule),
            PickPolicy::from(&self.config.picks),
        )
    }

    fn processor(&self) -> EliminationProcessor {
        EliminationProcessor::new(self.collab.clone())
    }

    fn manager(&self) -> LeagueManager {
        LeagueManager::new(self.collab.clone())
    }
}

// ---------------------------------------------------------------------------
// Read-only commands
// ---------------------------------------------------------------------------

pub fn phase(session: &Session, race_id: Option<&str>) -> anyhow::Result<()> {
    let now = session.collab.now();
    let races: Vec<&RaceSlot> = match race_id {
        Some(id) => vec![session
            .schedule
            .get(id)
            .with_context(|| format!("race {id} is not on the schedule"))?],
        None => session.schedule.races().iter().collect(),
    };

    for slot in races {
        match slot.phase(now).label() {
            Some(label) => println!("{:<12} {:<28} {label}", slot.race_id, slot.name),
            None => {
                let left = Countdown::until(slot.deadline(), now);
                println!(
                    "{:<12} {:<28} picks close in {}d {:02}h {:02}m {:02}s",
                    slot.race_id, slot.name, left.days, left.hours, left.minutes, left.seconds
                );
            }
        }
    }
    if let Some(current) = session.schedule.current(now) {
        println!("Current race: {}", current.name);
    }
    Ok(())
}

pub async fn leagues(session: &Session) -> anyhow::Result<()> {
    let context = session.loaded_context().await?;
    let all = context.get_all_leagues_context();
    if all.leagues.is_empty() {
        println!("No leagues.");
        return Ok(());
    }

    for league in context.leagues_by_recent_access() {
        let m = &league.membership;
        let marker = if all.active_league_id.as_deref() == Some(league.league_id()) {
            "*"
        } else {
            " "
        };
        println!(
            "{marker} {:<16} {:<24} {}/{} lives  {:?}{}",
            league.league_id(),
            league.league.name,
            m.remaining_lives(),
            m.max_lives(),
            m.status(),
            if m.is_owner { "  (owner)" } else { "" }
        );
    }

    let stats = context.statistics();
    println!(
        "{} league(s), {} owned, {} active, {} eliminated",
        stats.total_leagues,
        stats.owned_leagues,
        stats.active_memberships,
        stats.eliminated_memberships
    );
    Ok(())
}

/// Keep the league list fresh in the background and print every change
/// until interrupted.
pub async fn watch(session: &Session) -> anyhow::Result<()> {
    let context = session.loaded_context().await?;
    let _subscription = context.subscribe(|event| match event {
        ContextEvent::ActiveLeagueChanged {
            new_league_id,
            previous_league_id,
        } => println!("Active league: {previous_league_id:?} -> {new_league_id:?}"),
        ContextEvent::LeagueListChanged {
            league_count,
            active_league_id,
        } => println!("{league_count} league(s), active {active_league_id:?}"),
    });

    let period = session.config.refresh.interval();
    let refresher = spawn_refresher(Arc::clone(&context), period);
    println!(
        "Watching {} league(s), refreshing every {}s. Ctrl-C to stop.",
        context.statistics().total_leagues,
        period.as_secs()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    refresher.stop().await;
    info!("Watch stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands that write
// ---------------------------------------------------------------------------

pub async fn pick(
    session: &Session,
    race_id: &str,
    driver_id: &str,
    league_id: Option<&str>,
) -> anyhow::Result<()> {
    let context = session.loaded_context().await?;
    let pick = session
        .resolver(context)
        .save(driver_id, PickInfo::for_race(race_id), league_id)
        .await
        .with_context(|| format!("could not pick {driver_id} for {race_id}"))?;
    println!(
        "Picked {} for {} ({})",
        pick.driver_id,
        pick.race_id,
        pick.scope()
    );
    Ok(())
}

pub async fn auto_pick(
    session: &Session,
    race_id: &str,
    league_id: Option<&str>,
) -> anyhow::Result<()> {
    let context = session.loaded_context().await?;
    let outcome = session
        .resolver(context)
        .apply_auto_pick(race_id, league_id)
        .await
        .with_context(|| format!("auto-pick for {race_id} failed"))?;
    match outcome {
        AutoPickOutcome::Applied(pick) => println!(
            "Auto-picked {} for {} ({:?})",
            pick.driver_name.as_deref().unwrap_or(&pick.driver_id),
            pick.race_id,
            pick.auto_pick_reason
        ),
        AutoPickOutcome::AlreadyPicked(pick) => println!(
            "Already picked {} for {}; nothing to do",
            pick.driver_id, pick.race_id
        ),
    }
    Ok(())
}

/// Apply a race result to one league, or to every active league.
pub async fn process(
    session: &Session,
    race_id: &str,
    league_id: Option<&str>,
) -> anyhow::Result<()> {
    let processor = session.processor();
    let Some(league_id) = league_id else {
        let season = processor
            .process_race_all_leagues(race_id)
            .await
            .with_context(|| format!("could not process {race_id}"))?;
        for report in &season.reports {
            print_report(report);
        }
        for league_id in &season.skipped {
            println!("{race_id} / {league_id}: no picks, skipped");
        }
        for (league_id, err) in &season.failures {
            println!("{race_id} / {league_id}: failed: {err}");
        }
        println!(
            "{} league(s) processed, {} member(s), {} elimination(s)",
            season.reports.len(),
            season.processed(),
            season.eliminations()
        );
        if !season.failures.is_empty() {
            warn!(
                "{} league(s) failed for {race_id}; the next run retries them",
                season.failures.len()
            );
        }
        info!("Processed {race_id} for every active league from the CLI");
        return Ok(());
    };

    let report = processor
        .process_race(league_id, race_id)
        .await
        .with_context(|| format!("could not process {race_id} for league {league_id}"))?;
    print_report(&report);
    info!("Processed {race_id} for {league_id} from the CLI");
    Ok(())
}

fn print_report(report: &RaceReport) {
    println!(
        "{} / {}: {} processed, {} life loss(es), {} elimination(s), {} already recorded",
        report.race_id,
        report.league_id,
        report.processed,
        report.life_losses,
        report.eliminations,
        report.replays
    );
    for (user_id, err) in &report.errors {
        println!("  {user_id}: {err}");
    }
    println!("  Survivors: {}", report.survivors.join(", "));
    if report.league_decided {
        match &report.winner {
            Some(winner) => println!("  League decided: {winner} wins"),
            None => println!("  League decided: no survivors"),
        }
    }
    if report.league_completed {
        println!("  League marked completed");
    }
}

/// Switch the active league, or to solo play with `None`.
pub async fn use_league(session: &Session, league_id: Option<&str>) -> anyhow::Result<()> {
    let context = session.loaded_context().await?;
    match league_id {
        Some(league_id) => {
            if !context.set_active_league(league_id) {
                anyhow::bail!("not a member of league {league_id}");
            }
            println!("Active league: {league_id}");
        }
        None => {
            context.clear_active_league();
            println!("Playing solo");
        }
    }
    Ok(())
}

pub async fn join(session: &Session, league_id: &str) -> anyhow::Result<()> {
    let context = session.loaded_context().await?;
    let joined = session
        .manager()
        .with_context(context)
        .join_league(league_id)
        .await
        .with_context(|| format!("could not join league {league_id}"))?;
    println!(
        "Joined {} with {} live(s); {} member(s)",
        joined.league.name,
        joined.membership.max_lives(),
        joined.member_count
    );
    Ok(())
}

pub async fn lives_settings(
    session: &Session,
    league_id: &str,
    patch: &LivesSettingsPatch,
) -> anyhow::Result<()> {
    let league = session
        .manager()
        .update_lives_settings(league_id, patch)
        .await
        .with_context(|| format!("could not change lives settings of {league_id}"))?;
    let settings = &league.settings;
    println!(
        "{league_id}: lives {}, max {}, members play with {}, lock {}",
        if settings.lives_enabled { "on" } else { "off" },
        settings.max_lives,
        league.effective_max_lives(),
        settings
            .lock_date
            .map_or_else(|| "none".to_string(), |d| d.to_rfc3339())
    );
    Ok(())
}

pub async fn adjust_lives(
    session: &Session,
    league_id: &str,
    user_id: &str,
    op: &LifeOperation,
    revive: bool,
) -> anyhow::Result<()> {
    let policy = if revive {
        RevivePolicy::AllowRevive
    } else {
        RevivePolicy::OnlyActive
    };
    let member = session
        .processor()
        .restore_lives(league_id, user_id, op, policy)
        .await
        .with_context(|| format!("could not adjust lives of {user_id} in {league_id}"))?;
    println!(
        "{user_id} in {league_id}: {}/{} lives, {:?}",
        member.remaining_lives(),
        member.max_lives(),
        member.status()
    );
    Ok(())
}
