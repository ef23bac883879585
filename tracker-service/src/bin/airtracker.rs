//! AirTracker command line
//!
//! `airtracker run` starts the capture daemon together with the query socket.
//! The other subcommands inspect or maintain the database directly.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracker_service::cycle::CycleTimeouts;
use tracker_service::geocode::{
    backfill_coordinates, CachedGeocoder, Geocoder, NominatimGeocoder,
};
use tracker_service::normalize::default_repair_rules;
use tracker_service::ocr::{CommandCapturer, CommandRecognizer};
use tracker_service::{
    CaptureCycle, Config, DeviceNameNormalizer, DeviceNameValidator, DeviceRegistry,
    FieldExtractor, FuzzyDeviceMatcher, QueryServer, Storage,
};

type BoxError = Box<dyn std::error::Error>;

#[derive(Debug, Parser)]
#[command(name = "airtracker")]
#[command(about = "Track Find My devices from OCR captures")]
struct Args {
    /// Config file (defaults to the per-user config path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Capture on a schedule and serve queries until interrupted
    Run,
    /// Run a single capture cycle and print its report
    Once,
    /// Parse OCR text without touching the database. Blocks are separated
    /// by blank lines.
    Parse {
        /// Read from this file instead of stdin
        #[arg(long)]
        file: Option<PathBuf>,

        /// Capture time for relative timestamps (RFC 3339, default now)
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// List devices
    Devices {
        /// Include merged and deactivated devices
        #[arg(long)]
        all: bool,
    },
    /// Show a device's observations, oldest first
    History {
        device_id: i64,

        /// Only the most recent N observations
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Merge LOSER into WINNER
    Merge { winner: i64, loser: i64 },
    /// Deactivate devices whose names are no longer valid
    Gc,
    /// Find (and unless --dry-run, merge) duplicate devices
    Dedupe {
        #[arg(long)]
        dry_run: bool,
    },
    /// List pending merge reviews
    Reviews,
    /// Approve a review, merging the new device into its candidate
    Approve { review_id: i64 },
    /// Dismiss a review, keeping both devices
    Dismiss { review_id: i64 },
    /// Geocode stored observations that have no coordinates yet
    Geocode {
        /// Only the most recent N observations
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Database statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::try_load_from_path(path)?,
        None => Config::load(),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.general.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Command::Parse { file, at } = &args.command {
        return parse_input(&config, file.as_ref(), at.unwrap_or_else(Utc::now));
    }

    let mut storage = Storage::open(&config.general.db_path)?;
    let registry = build_registry(&config);

    match args.command {
        Command::Run => {
            let cycle = Arc::new(build_cycle(&config, storage, registry)?);
            run_daemon(&config, cycle).await?;
        }
        Command::Once => {
            let cycle = build_cycle(&config, storage, registry)?;
            print_json(&cycle.run_once().await?)?;
        }
        Command::Devices { all } => print_json(&storage.list_devices(all)?)?,
        Command::History { device_id, limit } => {
            print_json(&storage.device_history(device_id, None, None, limit)?)?
        }
        Command::Merge { winner, loser } => {
            print_json(&registry.consolidate(&mut storage, winner, loser)?)?
        }
        Command::Gc => print_json(&registry.collect_garbage(&mut storage)?)?,
        Command::Dedupe { dry_run: true } => print_json(&registry.find_duplicates(&storage)?)?,
        Command::Dedupe { dry_run: false } => {
            print_json(&registry.sweep_duplicates(&mut storage)?)?
        }
        Command::Reviews => print_json(&registry.pending_reviews(&storage)?)?,
        Command::Approve { review_id } => {
            print_json(&registry.approve_review(&mut storage, review_id)?)?
        }
        Command::Dismiss { review_id } => {
            registry.dismiss_review(&mut storage, review_id)?;
            println!("Dismissed review {}", review_id);
        }
        Command::Geocode { limit } => {
            let geocoder = build_geocoder(&config)?.ok_or("geocoding is disabled in the config")?;
            print_json(&backfill_coordinates(&mut storage, geocoder.as_ref(), limit).await?)?
        }
        Command::Stats => print_json(&storage.stats()?)?,
        Command::Parse { .. } => {}
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), BoxError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_normalizer(config: &Config) -> DeviceNameNormalizer {
    let validator =
        DeviceNameValidator::new().with_blocked(config.matching.blocked_names.iter().cloned());
    DeviceNameNormalizer::new(validator, default_repair_rules())
}

fn build_registry(config: &Config) -> DeviceRegistry {
    DeviceRegistry::new(
        build_normalizer(config),
        FuzzyDeviceMatcher::new(config.matching.policy()),
    )
}

fn build_geocoder(config: &Config) -> Result<Option<Arc<dyn Geocoder>>, BoxError> {
    let settings = &config.geocoding;
    if !settings.enabled {
        info!("Geocoding disabled");
        return Ok(None);
    }

    let nominatim = NominatimGeocoder::new(
        settings.endpoint.clone(),
        &settings.user_agent,
        settings.timeout(),
        settings.rate_limit(),
    )?
    .with_custom_locations(settings.custom_coordinates())
    .with_country_hints(settings.hints());

    Ok(Some(Arc::new(CachedGeocoder::new(
        nominatim,
        settings.cache_ttl(),
        settings.cache_max_entries,
    ))))
}

fn build_cycle(
    config: &Config,
    storage: Storage,
    registry: DeviceRegistry,
) -> Result<CaptureCycle, BoxError> {
    let mut cycle = CaptureCycle::new(
        Arc::new(CommandCapturer::from_config(&config.capture)),
        Arc::new(CommandRecognizer::from_config(&config.capture)),
        Arc::new(Mutex::new(storage)),
        registry,
    )
    .with_extractor(FieldExtractor::new(build_normalizer(config)))
    .with_timeouts(CycleTimeouts::from(&config.schedule));

    if let Some(geocoder) = build_geocoder(config)? {
        cycle = cycle.with_geocoder(geocoder);
    }
    Ok(cycle)
}

fn parse_input(
    config: &Config,
    file: Option<&PathBuf>,
    capture_time: DateTime<Utc>,
) -> Result<(), BoxError> {
    let text = match file {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let extractor = FieldExtractor::new(build_normalizer(config));
    let blocks = text
        .split("\n\n")
        .map(|block| block.lines().collect::<Vec<_>>())
        .filter(|lines| lines.iter().any(|l| !l.trim().is_empty()));

    for (index, lines) in blocks.enumerate() {
        let entry = match extractor.extract(&lines, capture_time) {
            Ok(observation) => serde_json::json!({ "block": index, "observation": observation }),
            Err(rejection) => {
                serde_json::json!({ "block": index, "rejected": rejection.to_string() })
            }
        };
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}

async fn run_daemon(config: &Config, cycle: Arc<CaptureCycle>) -> Result<(), BoxError> {
    let server = config
        .server
        .enabled
        .then(|| QueryServer::with_cycle(config.server.socket_path.clone(), Arc::clone(&cycle)));

    let serve = async {
        match &server {
            Some(server) => server.run().await,
            None => std::future::pending().await,
        }
    };

    info!(
        "AirTracker running, capturing every {}s",
        config.schedule.interval().as_secs()
    );

    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                error!("Query server error: {}", e);
            }
        }
        _ = schedule(config, &cycle) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    if let Some(server) = &server {
        if server.socket_path().exists() {
            std::fs::remove_file(server.socket_path())?;
        }
    }
    Ok(())
}

/// Capture on every tick and run maintenance on its own, slower interval
async fn schedule(config: &Config, cycle: &CaptureCycle) {
    let mut captures = tokio::time::interval(config.schedule.interval());
    captures.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut maintenance = config.schedule.maintenance_interval().map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            _ = captures.tick() => {
                if let Err(e) = cycle.run_once().await {
                    error!("Capture cycle failed: {}", e);
                }
            }
            _ = next_tick(&mut maintenance) => {
                run_maintenance(cycle, config.matching.auto_sweep).await;
            }
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_maintenance(cycle: &CaptureCycle, auto_sweep: bool) {
    if let Err(e) = cycle.maintain(auto_sweep).await {
        warn!("Maintenance failed: {}", e);
    }
}
