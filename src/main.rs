use feedreel::cli::Args;
use feedreel::config::{self, FeedSettings, PathConfig};
use feedreel::core::decode::DecodeFactory;
use feedreel::core::events::FeedEvent;
use feedreel::core::item::ItemSource;
use feedreel::core::manager::{FeedSnapshot, LifecycleManager};
use feedreel::core::scheduler::NetworkClass;
use feedreel::sim::{FailureRule, SimulatedFactory};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on waiting for one scroll step to settle
const STEP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Serialize)]
struct EventCounts {
    added: usize,
    state_changes: usize,
    removed: usize,
    focus_changes: usize,
}

#[derive(Debug, Serialize)]
struct SessionCounts {
    created: usize,
    initialized: usize,
    looping: usize,
    disposed: usize,
    leaked: usize,
}

/// Final report printed to stdout
#[derive(Debug, Serialize)]
struct Report {
    snapshot: FeedSnapshot,
    sessions: SessionCounts,
    events: EventCounts,
}

fn init_logging(args: &Args, path_config: &PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .clone()
            .unwrap_or_else(|| path_config.data_file(config::LOG_FILE));
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging, respects RUST_LOG if set
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn load_settings(args: &Args, path_config: &PathConfig) -> Result<FeedSettings> {
    let settings_path = path_config.config_file(config::SETTINGS_FILE);
    info!("Config path: {}", settings_path.display());

    let mut settings = FeedSettings::load(&settings_path)?;
    // CLI overrides file
    if let Some(max_resident) = args.max_resident {
        settings.max_resident = max_resident;
    }
    settings.validate();

    if args.save_config {
        settings.save(&settings_path)?;
        info!("Settings saved to {}", settings_path.display());
    }
    Ok(settings)
}

fn load_feed(args: &Args) -> Result<Vec<ItemSource>> {
    match &args.feed {
        Some(path) => read_feed(path),
        None => Ok((0..args.items)
            .map(|i| {
                ItemSource::video(format!("https://cdn.feedreel.test/clip-{}.mp4", i))
                    .with_title(format!("Clip {}", i))
            })
            .collect()),
    }
}

fn read_feed(path: &Path) -> Result<Vec<ItemSource>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read feed: {}", path.display()))?;
    let feed: Vec<ItemSource> = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse feed: {}", path.display()))?;
    info!("Loaded {} items from {}", feed.len(), path.display());
    Ok(feed)
}

/// Every `n`th URL of the feed fails to initialize
fn failure_rule(feed: &[ItemSource], n: usize) -> FailureRule {
    if n == 0 {
        return FailureRule::Never;
    }
    let urls = feed
        .iter()
        .skip(n - 1)
        .step_by(n)
        .map(|s| s.url.clone())
        .filter(|u| !u.is_empty())
        .collect();
    FailureRule::Matching(urls)
}

fn count_events(events: impl Iterator<Item = FeedEvent>) -> EventCounts {
    let mut counts = EventCounts::default();
    for event in events {
        match event {
            FeedEvent::ItemAdded { .. } => counts.added += 1,
            FeedEvent::StateChanged { .. } => counts.state_changes += 1,
            FeedEvent::ItemRemoved { .. } => counts.removed += 1,
            FeedEvent::FocusChanged { .. } => counts.focus_changes += 1,
        }
    }
    counts
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = path_config.ensure_dirs() {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }

    init_logging(&args, &path_config)?;
    info!("Feedreel simulator starting...");
    debug!("Command-line args: {:?}", args);

    let settings = load_settings(&args, &path_config)?;
    let feed = load_feed(&args)?;

    let factory = Arc::new(
        SimulatedFactory::new(
            Duration::from_millis(args.latency_ms),
            args.bytes_mb.saturating_mul(1024 * 1024),
        )
        .with_failures(failure_rule(&feed, args.fail_every)),
    );
    let counters = factory.counters();
    let decode_factory: Arc<dyn DecodeFactory> = factory.clone();

    let manager = LifecycleManager::new(&settings, decode_factory);
    let events = manager.subscribe();
    manager.set_network_class(NetworkClass::from(args.network));

    // Arrival order: the last source ends up at display index 0
    for source in feed {
        manager.add_item(source);
    }

    for (step, &index) in args.scroll.iter().enumerate() {
        manager.set_focus(index);
        if !manager.wait_for_idle(STEP_TIMEOUT) {
            warn!("Scroll step {} did not settle within {:?}", step, STEP_TIMEOUT);
        }

        // One render pass on the focused item
        if let Some(id) = manager.focus_index().and_then(|f| manager.item_at(f)) {
            let rendered = manager.with_decode_handle(&id, |session| session.play());
            debug!("Step {}: focus {} rendered={}", step, id, rendered.is_some());
        }

        if args.pressure_at == Some(step) {
            manager.handle_memory_pressure();
        }

        let snap = manager.debug_snapshot();
        info!(
            "Step {}: focus={:?} resident={}/{} bytes={}",
            step, snap.focus_index, snap.resident, snap.max_resident, snap.estimated_bytes
        );
    }

    let report = Report {
        snapshot: manager.debug_snapshot(),
        sessions: SessionCounts {
            created: counters.created(),
            initialized: counters.initialized(),
            looping: counters.looping(),
            disposed: counters.disposed(),
            leaked: counters.leaked(),
        },
        events: count_events(events.try_iter()),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialize report")?
    );

    Ok(())
}
