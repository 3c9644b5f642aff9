// Survivor operator CLI entry point.
//
// Startup sequence:
// 1. Parse arguments
// 2. Initialize tracing (log file by default, stderr on request)
// 3. Load config
// 4. Load the season file into the in-memory store
// 5. Run the subcommand
// 6. Write the season file back after commands that change it

mod commands;
mod season;

use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use survivor_core::config::{self, DEFAULT_CONFIG_PATH};
use survivor_core::leagues::LivesSettingsPatch;
use survivor_core::model::LifeOperation;
use tracing::info;

use crate::commands::Session;

#[derive(Parser)]
#[command(name = "survivor", version, about = "Operator tool for F1 survivor leagues")]
struct Cli {
    /// Engine configuration file; defaults apply when it does not exist.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Season file holding leagues, members, picks, results and the schedule.
    #[arg(long, default_value = "season.json")]
    season: PathBuf,

    /// Act as this user (required for picks and lives adjustments).
    #[arg(long)]
    user: Option<String>,

    /// Evaluate as if the current time were this RFC 3339 instant.
    #[arg(long)]
    at: Option<DateTime<Utc>>,

    /// Log to stderr instead of logs/survivor.log.
    #[arg(long)]
    log_stderr: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the phase of every scheduled race, or of one race.
    Phase { race_id: Option<String> },
    /// List the user's leagues with their remaining lives.
    Leagues,
    /// Refresh the league list periodically and print changes.
    Watch,
    /// Make a league the active one, remembered across runs.
    Use {
        #[arg(required_unless_present = "solo")]
        league_id: Option<String>,
        /// Play without a league instead.
        #[arg(long, conflicts_with = "league_id")]
        solo: bool,
    },
    /// Join a league with its current lives allowance.
    Join { league_id: String },
    /// Change a league's lives configuration (league owner only).
    LivesSettings {
        league_id: String,
        #[arg(long)]
        max_lives: Option<u8>,
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
        /// RFC 3339 instant after which the settings can no longer change.
        #[arg(long)]
        lock_date: Option<DateTime<Utc>>,
    },
    /// Save a manual pick for a race.
    Pick {
        race_id: String,
        driver_id: String,
        #[arg(long)]
        league: Option<String>,
    },
    /// Apply the deadline fallback pick for a race.
    AutoPick {
        race_id: String,
        #[arg(long)]
        league: Option<String>,
    },
    /// Apply a race result to one league, or to every active league.
    Process {
        race_id: String,
        league_id: Option<String>,
    },
    /// Adjust a member's remaining lives (league owner only).
    AdjustLives {
        league_id: String,
        user_id: String,
        #[arg(value_enum)]
        operation: LivesOp,
        value: u8,
        #[arg(long)]
        reason: String,
        /// Allow bringing back an eliminated member.
        #[arg(long)]
        revive: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LivesOp {
    Set,
    Increment,
    Decrement,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_stderr)?;
    info!("Survivor CLI starting up");

    let config = config::load_or_default(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    info!(
        "Config loaded: membership TTL {}s, backend timeout {}ms, uniqueness {:?}",
        config.cache.membership_ttl_secs, config.backend.timeout_ms, config.picks.uniqueness
    );

    let season = season::SeasonFile::load(&cli.season)
        .with_context(|| format!("failed to load season file {}", cli.season.display()))?;
    let session = Session::new(season, config, cli.user.as_deref(), cli.at);

    let changed = match cli.command {
        Command::Phase { race_id } => {
            commands::phase(&session, race_id.as_deref())?;
            false
        }
        Command::Leagues => {
            commands::leagues(&session).await?;
            false
        }
        Command::Watch => {
            commands::watch(&session).await?;
            false
        }
        Command::Pick {
            race_id,
            driver_id,
            league,
        } => {
            commands::pick(&session, &race_id, &driver_id, league.as_deref()).await?;
            true
        }
        Command::AutoPick { race_id, league } => {
            commands::auto_pick(&session, &race_id, league.as_deref()).await?;
            true
        }
        Command::Use { league_id, solo: _ } => {
            commands::use_league(&session, league_id.as_deref()).await?;
            true
        }
        Command::Join { league_id } => {
            commands::join(&session, &league_id).await?;
            true
        }
        Command::LivesSettings {
            league_id,
            max_lives,
            enable,
            disable,
            lock_date,
        } => {
            let patch = LivesSettingsPatch {
                max_lives,
                lives_enabled: (enable || disable).then_some(enable),
                lock_date,
            };
            commands::lives_settings(&session, &league_id, &patch).await?;
            true
        }
        Command::Process { race_id, league_id } => {
            commands::process(&session, &race_id, league_id.as_deref()).await?;
            true
        }
        Command::AdjustLives {
            league_id,
            user_id,
            operation,
            value,
            reason,
            revive,
        } => {
            let op = match operation {
                LivesOp::Set => LifeOperation::set(value, reason),
                LivesOp::Increment => LifeOperation::increment(value, reason),
                LivesOp::Decrement => LifeOperation::decrement(value, reason),
            };
            commands::adjust_lives(&session, &league_id, &user_id, &op, revive).await?;
            true
        }
    };

    if changed {
        session
            .season()
            .save(&cli.season)
            .with_context(|| format!("failed to write season file {}", cli.season.display()))?;
        info!("Season file {} updated", cli.season.display());
    }

    Ok(())
}

/// Initialize tracing to a log file under logs/, or to stderr.
fn init_tracing(log_stderr: bool) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("survivor=info,warn"));

    if log_stderr {
        let subscriber = fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_line_number(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .context("failed to set tracing subscriber")?;
        return Ok(());
    }

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let log_file = std::fs::File::create(log_dir.join("survivor.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
