use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use screen_timeline::classifier::{Classifier, MetadataClassifier, OpenAiClassifier};
use screen_timeline::config::{ClassifierProvider, TrackerConfig};
use screen_timeline::events::TrackerEvent;
use screen_timeline::frame::{FrameSource, ScreencaptureFrameSource, SyntheticFrameSource};
use screen_timeline::tracker::{Tracker, TrackerStatus};
use screen_timeline::{logging, paths, permissions};
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Parser)]
#[command(name = "screen-timeline")]
#[command(about = "Sample the screen, label each frame, and build an activity timeline")]
struct Cli {
    /// Config file (TOML). Defaults to config.toml in the data directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, short, global = true, action = ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a session and capture until stopped.
    Run(RunArgs),
    /// List recent sessions.
    Sessions {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the timeline of a session.
    Timeline { session_id: String },
    /// Print time spent per activity in a session.
    Breakdown { session_id: String },
    /// End a session left open by an earlier run.
    Recover,
    /// Write the effective configuration to the config file.
    Init {
        #[arg(long, action = ArgAction::SetTrue)]
        force: bool,
    },
}

#[derive(Debug, Args, Clone)]
struct RunArgs {
    #[arg(long, value_parser = parse_duration)]
    every: Option<Duration>,

    #[arg(long = "for", default_value = "60m", value_parser = parse_duration)]
    run_for: Duration,

    /// Use N generated frames instead of the screen.
    #[arg(long)]
    synthetic: Option<usize>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long, action = ArgAction::SetTrue)]
    no_analyze: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlCommand {
    Pause,
    Resume,
    Status,
    Stop,
}

fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    humantime::parse_duration(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config_path = cli.config.clone().unwrap_or_else(paths::default_config_path);
    let config = TrackerConfig::load(&config_path)?;

    match cli.command {
        Commands::Run(args) => run_session(config, args).await,
        Commands::Sessions { limit } => list_sessions(&config, limit).await,
        Commands::Timeline { session_id } => print_timeline(&config, &session_id).await,
        Commands::Breakdown { session_id } => print_breakdown(&config, &session_id).await,
        Commands::Recover => recover(&config).await,
        Commands::Init { force } => init_config(&config, &config_path, force),
    }
}

async fn run_session(mut config: TrackerConfig, args: RunArgs) -> Result<()> {
    if let Some(every) = args.every {
        config.interval = every;
    }
    if let Some(model) = args.model.clone() {
        config.classifier.model = model;
    }
    if args.no_analyze {
        config.classifier.provider = ClassifierProvider::Metadata;
    }

    let source: Arc<dyn FrameSource> = match args.synthetic {
        Some(count) => Arc::new(synthetic_source(count)?),
        None => {
            permissions::ensure_screen_recording()?;
            Arc::new(ScreencaptureFrameSource)
        }
    };
    let classifier = build_classifier(&config)?;
    let tracker = Tracker::from_config(&config, source, classifier)
        .context("failed to initialize tracker")?;

    let events = tracker.subscribe();
    let event_handle = tokio::spawn(print_events(events));

    let session = tracker.start_session().await?;
    println!(
        "session {} started (every {}, data in {})",
        session.id,
        humantime::format_duration(config.interval),
        config.data_dir.display()
    );

    let mut command_rx = spawn_stdin_controls();
    let deadline = tokio::time::sleep(args.run_for);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(ControlCommand::Pause) => report_error(tracker.pause_session().await.map(drop)),
                Some(ControlCommand::Resume) => report_error(tracker.resume_session().await.map(drop)),
                Some(ControlCommand::Status) => print_status(&tracker.status().await),
                Some(ControlCommand::Stop) | None => break,
            },
            _ = &mut deadline => {
                println!("run duration reached");
                break;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let ended = tracker.end_session().await?;
    let buckets = tracker.timeline(&ended.id).await?;
    drop(tracker);
    event_handle.await.context("event task failed")?;

    println!(
        "session {} completed with {} samples",
        ended.id, ended.sample_count
    );
    for bucket in buckets {
        println!(
            "  {}  {:<13} {} ({} samples)",
            bucket.label,
            bucket.dominant_activity,
            bucket.dominant_app,
            bucket.samples.len()
        );
    }
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<TrackerEvent>) {
    loop {
        match events.recv().await {
            Ok(TrackerEvent::SampleCaptured {
                locator, timestamp, ..
            }) => println!("{} sample saved: {locator}", timestamp.format("%H:%M:%S")),
            Ok(TrackerEvent::StateChanged { status, .. }) => println!("session {status}"),
            Ok(TrackerEvent::CaptureFailed { message, .. }) => {
                eprintln!("capture failed: {message}")
            }
            Ok(TrackerEvent::CaptureStopped { reason, .. }) => {
                eprintln!("capture stopped: {reason}. type `stop` to end the session")
            }
            Ok(TrackerEvent::AnalysisUnavailable { sample_id, message, .. }) => {
                eprintln!("no analysis for sample {sample_id}: {message}")
            }
            Ok(TrackerEvent::StorageFailed { locator, message, .. }) => match locator {
                Some(locator) => eprintln!("sample {locator} not recorded: {message}"),
                None => eprintln!("frame not stored: {message}"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                eprintln!("missed {skipped} events")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Read control words from stdin on a plain thread so a pending read never
/// holds up shutdown.
fn spawn_stdin_controls() -> mpsc::UnboundedReceiver<ControlCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        eprintln!("interactive controls: pause | resume | status | stop");
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            let command = match line.trim().to_ascii_lowercase().as_str() {
                "pause" => Some(ControlCommand::Pause),
                "resume" => Some(ControlCommand::Resume),
                "status" => Some(ControlCommand::Status),
                "stop" | "quit" | "exit" => Some(ControlCommand::Stop),
                "" => None,
                _ => {
                    eprintln!("unknown command. use: pause | resume | status | stop");
                    None
                }
            };

            if let Some(command) = command
                && tx.send(command).is_err()
            {
                break;
            }
        }
    });
    rx
}

fn report_error(result: screen_timeline::error::TrackerResult<()>) {
    if let Err(err) = result {
        eprintln!("{err}");
    }
}

fn print_status(status: &TrackerStatus) {
    match (&status.session_id, status.status) {
        (Some(id), Some(state)) => {
            println!("session {id}: {state}, {} samples", status.sample_count);
            if status.is_active && !status.capturing {
                println!("  capture stopped: the frame source is gone");
            }
            if let Some(activity) = &status.current_activity {
                println!("  current activity: {activity}");
            }
        }
        _ => println!("no session"),
    }
}

async fn list_sessions(config: &TrackerConfig, limit: usize) -> Result<()> {
    let tracker = read_only_tracker(config)?;
    let sessions = tracker.sessions(limit).await?;
    if sessions.is_empty() {
        println!("no sessions for {}", tracker.owner());
    }
    for session in sessions {
        let ended = session
            .ended_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<9} {} -> {}  {} samples",
            session.id,
            session.status,
            session.started_at.to_rfc3339(),
            ended,
            session.sample_count
        );
    }
    Ok(())
}

async fn print_timeline(config: &TrackerConfig, session_id: &str) -> Result<()> {
    let tracker = read_only_tracker(config)?;
    let buckets = tracker.timeline(session_id).await?;
    if buckets.is_empty() {
        println!("no samples in session {session_id}");
    }
    for bucket in buckets {
        println!(
            "{}  {:<13} {} ({} samples)",
            bucket.label,
            bucket.dominant_activity,
            bucket.dominant_app,
            bucket.samples.len()
        );
    }
    Ok(())
}

async fn print_breakdown(config: &TrackerConfig, session_id: &str) -> Result<()> {
    let tracker = read_only_tracker(config)?;
    let breakdown = tracker.breakdown(session_id).await?;
    if breakdown.is_empty() {
        println!("no analyzed samples in session {session_id}");
    }
    for (activity, share) in breakdown {
        println!(
            "{:<13} {:>7.1} min  {:>5.1}%",
            activity.as_str(),
            share.duration_minutes,
            share.percentage
        );
    }
    Ok(())
}

async fn recover(config: &TrackerConfig) -> Result<()> {
    let tracker = read_only_tracker(config)?;
    match tracker.recover().await? {
        Some(session) => {
            let ended = tracker.end_session().await?;
            println!(
                "session {} ({} samples) was {}, now {}",
                session.id, ended.sample_count, session.status, ended.status
            );
        }
        None => println!("nothing to recover for {}", tracker.owner()),
    }
    Ok(())
}

fn init_config(config: &TrackerConfig, path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists. pass --force to overwrite", path.display());
    }
    config.validate()?;
    config.save(path)?;
    println!("wrote {}", path.display());
    Ok(())
}

/// A tracker for commands that only read the store; it never starts capturing.
fn read_only_tracker(config: &TrackerConfig) -> Result<Tracker> {
    Tracker::from_config(
        config,
        Arc::new(ScreencaptureFrameSource),
        Arc::new(MetadataClassifier),
    )
}

/// Every frame repeats once, so half the samples exercise the unchanged path.
fn synthetic_source(count: usize) -> Result<SyntheticFrameSource> {
    let colors: Vec<[u8; 3]> = (0..count)
        .map(|n| {
            let step = (n / 2) as u8;
            [step.wrapping_mul(40), 255 - step.wrapping_mul(25), 128]
        })
        .collect();
    SyntheticFrameSource::solid_colors(&colors).context("failed to generate synthetic frames")
}

fn build_classifier(config: &TrackerConfig) -> Result<Arc<dyn Classifier>> {
    if config.classifier.provider == ClassifierProvider::Metadata {
        return Ok(Arc::new(MetadataClassifier));
    }

    match std::env::var("OPENAI_API_KEY") {
        Ok(api_key) if !api_key.trim().is_empty() => Ok(Arc::new(OpenAiClassifier::new(
            api_key,
            config.classifier.model.clone(),
            config.classifier.prompt.clone(),
        )?)),
        _ => {
            eprintln!("OPENAI_API_KEY is not set. Falling back to local metadata classifier.");
            Ok(Arc::new(MetadataClassifier))
        }
    }
}
