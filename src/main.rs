use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};

use runcoach::checkpoint::CheckpointStore;
use runcoach::config::TrackerConfig;
use runcoach::controller::{StopSummary, TrackingSnapshot, TrackingState};
use runcoach::database::{RunDatabase, SqliteKeyValueStore};
use runcoach::diagnostics::DiagnosticsSnapshot;
use runcoach::external::{
    Clock, LoggingVoiceCoach, ManualPositionSource, NoopKeepAlive, PositionSource, SystemClock,
};
use runcoach::filter::FilterStats;
use runcoach::host::{HostComponents, HostHandle, LaunchDirective, TrackingHost};
use runcoach::import::{ImportManager, ReplayProgress, ReplaySource};
use runcoach::logging::{init_logging, LogLevel};
use runcoach::models::format_pace;

/// RunCoach - live run tracking core
///
/// Replays recorded tracks through the tracking host, recovers interrupted
/// sessions and inspects checkpoint health.
#[derive(Parser)]
#[command(name = "runcoach")]
#[command(version)]
#[command(about = "Live run tracking with coaching and crash recovery", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a recorded track (CSV or GPX) as a live session
    Track {
        /// Track file to replay
        #[arg(short, long)]
        file: PathBuf,

        /// User the session belongs to
        #[arg(short, long, default_value = "local")]
        user: String,

        /// Target pace in minutes per kilometer
        #[arg(short, long)]
        target_pace: Option<f64>,

        /// Maximum heart rate for HR warnings
        #[arg(long)]
        max_hr: Option<u16>,

        /// Replay speed factor (10 = ten times real time)
        #[arg(short, long, default_value = "1.0")]
        speed: f64,
    },

    /// Launch as after an abnormal restart and resume any recoverable session
    Recover {
        /// Keep feeding the recovered session from this track
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Replay speed factor
        #[arg(short, long, default_value = "1.0")]
        speed: f64,
    },

    /// Show checkpoint and recovery diagnostics
    Diagnostics {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,

        /// Also save the report to the diagnostics directory
        #[arg(long)]
        save: bool,
    },

    /// List finished runs
    History {
        #[arg(short, long, default_value = "local")]
        user: String,

        /// Number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Discard any checkpoint left behind by an interrupted session
    Discard,

    /// Show or initialize the configuration file
    Config {
        /// Print the effective configuration
        #[arg(short, long)]
        show: bool,

        /// Write the default configuration to the config path
        #[arg(long)]
        init: bool,
    },
}

#[derive(Tabled)]
struct SummaryRow {
    #[tabled(rename = "Metric")]
    metric: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

#[derive(Tabled)]
struct RunRow {
    #[tabled(rename = "Started")]
    started: String,
    #[tabled(rename = "Distance (km)")]
    distance: String,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "Avg pace")]
    pace: String,
    #[tabled(rename = "Id")]
    id: String,
}

fn format_duration(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn load_config(path: Option<&Path>) -> Result<TrackerConfig> {
    match path {
        Some(path) => TrackerConfig::load_from_file(path),
        None => Ok(TrackerConfig::load_or_default()),
    }
}

fn open_checkpoints(config: &TrackerConfig, clock: Arc<dyn Clock>) -> Result<Arc<CheckpointStore>> {
    let kv = SqliteKeyValueStore::open(&config.checkpoint.database_path).with_context(|| {
        format!(
            "Failed to open checkpoint database: {}",
            config.checkpoint.database_path.display()
        )
    })?;
    Ok(Arc::new(CheckpointStore::new(
        Arc::new(kv),
        clock,
        config.checkpoint.clone(),
    )))
}

fn open_runs(config: &TrackerConfig) -> Result<Arc<RunDatabase>> {
    let db = RunDatabase::new(&config.checkpoint.database_path)
        .with_context(|| "Failed to open run database")?;
    Ok(Arc::new(db))
}

fn launch(
    config: &TrackerConfig,
    source: Box<dyn PositionSource>,
    directive: Option<LaunchDirective>,
) -> Result<HostHandle> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let components = HostComponents {
        source,
        checkpoints: open_checkpoints(config, clock.clone())?,
        session_store: open_runs(config)?,
        voice: Arc::new(LoggingVoiceCoach),
        keep_alive: Arc::new(NoopKeepAlive),
        clock,
    };
    Ok(TrackingHost::launch(config.clone(), components, directive))
}

fn replay_source(file: &Path, speed: f64) -> Result<(ReplaySource, ReplayProgress)> {
    let samples = ImportManager::new()
        .import_file(file)
        .with_context(|| format!("Failed to import {}", file.display()))?;
    println!(
        "  {} {} samples from {}",
        "Loaded".dimmed(),
        samples.len(),
        file.display()
    );
    let source = ReplaySource::new(samples, speed, Arc::new(SystemClock));
    let progress = source.progress();
    Ok((source, progress))
}

fn print_live(snapshot: &TrackingSnapshot) {
    let metrics = &snapshot.metrics;
    println!(
        "  {:<8} {:>7.2} km  {}  pace {}  {}",
        snapshot.state.to_string().cyan(),
        metrics.distance_km(),
        format_duration(metrics.duration_ms),
        format_pace(metrics.current_pace),
        snapshot.phase.to_string().dimmed()
    );
}

fn print_summary(summary: &StopSummary) {
    let metrics = &summary.metrics;
    let rows = vec![
        SummaryRow {
            metric: "Distance",
            value: format!("{:.2} km", metrics.distance_km()),
        },
        SummaryRow {
            metric: "Moving time",
            value: format_duration(metrics.duration_ms),
        },
        SummaryRow {
            metric: "Average pace",
            value: format_pace(metrics.average_pace),
        },
        SummaryRow {
            metric: "Elevation gain",
            value: format!("{:.0} m", metrics.elevation_gain),
        },
        SummaryRow {
            metric: "Calories",
            value: format!("{:.0} kcal", metrics.calories),
        },
        SummaryRow {
            metric: "Saved",
            value: if summary.persisted { "yes" } else { "no" }.to_string(),
        },
    ];
    println!("{}", Table::new(rows).with(Style::rounded()));
}

/// Follow a replay until it runs out of samples or the user interrupts
async fn follow_replay(handle: &HostHandle, progress: &ReplayProgress) -> Result<bool> {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(false),
            _ = ticker.tick() => {
                let snapshot = handle.snapshot();
                print_live(&snapshot);
                if !snapshot.state.is_in_progress() {
                    return Ok(true);
                }
                if progress.is_finished() {
                    // Let the host drain the channel before stopping
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    return Ok(true);
                }
            }
        }
    }
}

async fn finish(handle: HostHandle, completed: bool) -> Result<()> {
    if !completed {
        println!(
            "{}",
            "Interrupted; the checkpoint is kept for `runcoach recover`".yellow()
        );
        handle.shutdown().await?;
        return Ok(());
    }

    if handle.snapshot().state.is_in_progress() {
        let summary = handle.stop().await?;
        println!("{}", "✓ Run complete".green().bold());
        print_summary(&summary);
    } else if let Some(error) = handle.snapshot().last_error {
        println!("{} {}", "✗ Tracking failed:".red().bold(), error);
    }
    handle.shutdown().await?;
    Ok(())
}

async fn track(
    config: TrackerConfig,
    file: PathBuf,
    user: String,
    target_pace: Option<f64>,
    max_hr: Option<u16>,
    speed: f64,
) -> Result<()> {
    let mut config = config;
    if let Some(pace) = target_pace {
        config.coaching = config.coaching.with_target_pace(pace);
    }
    if max_hr.is_some() {
        config.coaching.max_heart_rate = max_hr;
    }
    config.validate()?;

    println!("{}", "Starting replay session...".green().bold());
    let (source, progress) = replay_source(&file, speed)?;
    let handle = launch(&config, Box::new(source), Some(LaunchDirective::Start { user_id: user }))?;

    let completed = follow_replay(&handle, &progress).await?;
    finish(handle, completed).await
}

async fn recover(config: TrackerConfig, file: Option<PathBuf>, speed: f64) -> Result<()> {
    println!("{}", "Checking for a recoverable session...".blue().bold());

    let (source, progress): (Box<dyn PositionSource>, Option<ReplayProgress>) = match &file {
        Some(file) => {
            let (source, progress) = replay_source(file, speed)?;
            (Box::new(source) as Box<dyn PositionSource>, Some(progress))
        }
        None => {
            let (source, _handle) = ManualPositionSource::pair();
            (Box::new(source) as Box<dyn PositionSource>, None)
        }
    };

    let handle = launch(&config, source, None)?;
    // Answered only after the launch directive has been applied
    let diagnostics = handle.diagnostics().await?;
    let snapshot = handle.snapshot();

    if snapshot.state != TrackingState::Active {
        println!("{}", "No recoverable session found.".yellow());
        handle.shutdown().await?;
        return Ok(());
    }

    println!(
        "{} session {} (attempt {} of {})",
        "✓ Resumed".green().bold(),
        snapshot.session_id.as_deref().unwrap_or("?"),
        diagnostics.crash_attempts,
        config.checkpoint.max_crash_attempts
    );
    print_live(&snapshot);

    match progress {
        Some(progress) => {
            let completed = follow_replay(&handle, &progress).await?;
            finish(handle, completed).await
        }
        None => {
            println!("  {}", "No track given; leaving the checkpoint in place.".dimmed());
            handle.shutdown().await?;
            Ok(())
        }
    }
}

fn diagnostics(config: &TrackerConfig, json: bool, save: bool) -> Result<()> {
    let checkpoints = open_checkpoints(config, Arc::new(SystemClock))?;
    let checkpoint = checkpoints.peek_diagnostics()?;
    let report = DiagnosticsSnapshot::collect(
        &TrackingSnapshot::idle(),
        &FilterStats::default(),
        &checkpoint,
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let when = |at: Option<chrono::DateTime<chrono::Utc>>| {
            at.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        let rows = vec![
            SummaryRow {
                metric: "Recoverable session",
                value: if report.has_recoverable_session { "yes" } else { "no" }.to_string(),
            },
            SummaryRow {
                metric: "Session id",
                value: report.session_id.clone().unwrap_or_else(|| "-".to_string()),
            },
            SummaryRow {
                metric: "Last checkpoint",
                value: when(report.last_checkpoint_at()),
            },
            SummaryRow {
                metric: "Crash attempts",
                value: report.crash_attempts.to_string(),
            },
            SummaryRow {
                metric: "Last error",
                value: report.last_error.clone().unwrap_or_else(|| "-".to_string()),
            },
            SummaryRow {
                metric: "Last error time",
                value: when(report.last_error_at()),
            },
        ];
        println!("{}", Table::new(rows).with(Style::rounded()));
    }

    if save {
        let path = report.save_default()?;
        println!("{} {}", "✓ Saved to".green(), path.display());
    }
    Ok(())
}

fn history(config: &TrackerConfig, user: &str, limit: usize) -> Result<()> {
    let runs = open_runs(config)?;
    let sessions = runs.recent_runs(user, limit)?;
    if sessions.is_empty() {
        println!("{}", "No finished runs yet.".yellow());
        return Ok(());
    }

    let rows: Vec<RunRow> = sessions
        .iter()
        .map(|session| RunRow {
            started: session
                .started_at()
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default(),
            distance: format!("{:.2}", session.distance_meters / 1000.0),
            duration: format_duration(session.duration_ms),
            pace: format_pace(session.average_pace),
            id: session.id.chars().take(8).collect(),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));

    let stats = runs.get_stats()?;
    println!(
        "  {} runs, {:.1} km, {} total",
        stats.run_count,
        stats.total_distance_meters / 1000.0,
        format_duration(stats.total_duration_ms)
    );
    Ok(())
}

fn discard(config: &TrackerConfig) -> Result<()> {
    let checkpoints = open_checkpoints(config, Arc::new(SystemClock))?;
    checkpoints.clear()?;
    println!("{}", "✓ Checkpoint discarded".green());
    Ok(())
}

fn configure(config: &TrackerConfig, path: Option<&Path>, show: bool, init: bool) -> Result<()> {
    if init {
        let target = path
            .map(Path::to_path_buf)
            .unwrap_or_else(TrackerConfig::default_config_path);
        let mut fresh = TrackerConfig::default();
        fresh.save_to_file(&target)?;
        println!("{} {}", "✓ Wrote default configuration to".green(), target.display());
    }
    if show || !init {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if cli.verbose > 0 {
        config.logging.level = LogLevel::from_verbosity(cli.verbose);
    }
    let _log_guard = init_logging(&config.logging)?;

    match cli.command {
        Commands::Track {
            file,
            user,
            target_pace,
            max_hr,
            speed,
        } => track(config, file, user, target_pace, max_hr, speed).await,
        Commands::Recover { file, speed } => recover(config, file, speed).await,
        Commands::Diagnostics { json, save } => diagnostics(&config, json, save),
        Commands::History { user, limit } => history(&config, &user, limit),
        Commands::Discard => discard(&config),
        Commands::Config { show, init } => configure(&config, cli.config.as_deref(), show, init),
    }
}
