//! Command-line interface for mapped covers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mappedcover_core::config::env_vars;
use mappedcover_core::remap::parse_value;
use mappedcover_core::{
    remap, ConfigFile, ControllerSettings, EntryConfig, InMemoryEntityRegistry, RemapDirection,
    RemapRange, SourceState,
};
use mappedcover_cover::MappedCoverPlatform;
use mappedcover_devices::{CoverSimulator, DeviceStateStore, SimulatedCover, TravelMode};

/// Mapped covers - remap cover positions onto a physical range.
#[derive(Parser, Debug)]
#[command(name = "mappedcover")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a value between the 0-100 scale and a physical range.
    Remap {
        /// Value to convert (0-100).
        value: String,
        /// Physical range as MIN:MAX.
        #[arg(short, long, default_value = "0:100")]
        range: String,
        /// Conversion direction.
        #[arg(short, long, value_enum, default_value_t = Direction::ToSource)]
        direction: Direction,
    },
    /// Validate a configuration file.
    Check {
        /// Configuration file (defaults to $MAPPEDCOVER_CONFIG).
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run a command script against simulated covers and print the result.
    Simulate {
        /// Configuration file (defaults to $MAPPEDCOVER_CONFIG).
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Entry to load (defaults to the first).
        #[arg(short, long)]
        entry: Option<String>,
        /// Initial physical position of every source cover.
        #[arg(long, default_value_t = 0)]
        position: u8,
        /// Initial physical tilt. Source covers have no tilt when omitted.
        #[arg(long)]
        tilt: Option<u8>,
        /// How simulated covers travel.
        #[arg(long, value_enum, default_value_t = Travel::Instant)]
        travel: Travel,
        /// Shorten controller timings.
        #[arg(long)]
        fast: bool,
        /// Steps: a service such as `set_cover_position=40` or `stop_cover`,
        /// `wait=MS`, or `idle`.
        #[arg(required = true)]
        script: Vec<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Direction {
    /// Normalized to physical
    ToSource,
    /// Physical to normalized
    FromSource,
}

impl From<Direction> for RemapDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::ToSource => RemapDirection::ToSource,
            Direction::FromSource => RemapDirection::FromSource,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Travel {
    Instant,
    Gradual,
    Stuck,
}

impl From<Travel> for TravelMode {
    fn from(travel: Travel) -> Self {
        match travel {
            Travel::Instant => TravelMode::Instant,
            Travel::Gradual => TravelMode::Gradual {
                step: 10,
                interval_ms: 200,
            },
            Travel::Stuck => TravelMode::Stuck,
        }
    }
}

/// One script step.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Service { name: String, value: Option<u8> },
    Wait(Duration),
    Idle,
}

impl std::str::FromStr for Step {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, value) = match s.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim())),
            None => (s.trim(), None),
        };
        match (name, value) {
            ("idle", None) => Ok(Step::Idle),
            ("wait", Some(ms)) => {
                let ms: u64 = ms.parse().with_context(|| format!("invalid wait: {}", s))?;
                Ok(Step::Wait(Duration::from_millis(ms)))
            }
            ("", _) => Err(anyhow::anyhow!("empty step")),
            (name, value) => Ok(Step::Service {
                name: name.to_string(),
                value: value
                    .map(parse_value)
                    .transpose()
                    .with_context(|| format!("invalid value in {}", s))?,
            }),
        }
    }
}

fn fast_settings() -> ControllerSettings {
    ControllerSettings {
        wait_timeout: Duration::from_secs(2),
        recent_movement: Duration::from_millis(500),
        retry_delay: Duration::from_millis(50),
        call_timeout: Duration::from_secs(2),
        tilt_settle: Duration::from_millis(200),
        ..ControllerSettings::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if args.verbose { "debug" } else { "warn" };
        tracing_subscriber::EnvFilter::new(level)
    });

    // Logs go to stderr so stdout stays machine-readable
    if env_vars::log_json() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }

    match args.command {
        Command::Remap {
            value,
            range,
            direction,
        } => run_remap(&value, &range, direction),
        Command::Check { config } => run_check(config),
        Command::Simulate {
            config,
            entry,
            position,
            tilt,
            travel,
            fast,
            script,
        } => {
            let steps = script
                .iter()
                .map(|s| s.parse())
                .collect::<Result<Vec<Step>>>()?;
            let config = load_config(config)?;
            let entry = select_entry(&config, entry.as_deref())?;
            let mut initial = SourceState::available(position);
            if let Some(tilt) = tilt {
                initial = initial.with_tilt(tilt);
            }
            let settings = if fast {
                fast_settings()
            } else {
                ControllerSettings::default()
            };
            run_simulate(entry, initial, travel.into(), settings, &steps).await
        }
    }
}

fn run_remap(value: &str, range: &str, direction: Direction) -> Result<()> {
    let value = parse_value(value)?;
    let range: RemapRange = range.parse()?;
    let result = remap(Some(value), range, direction.into()).unwrap_or_default();
    println!("{}", result);
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<ConfigFile> {
    let path = path
        .or_else(|| env_vars::config_path().map(PathBuf::from))
        .context("no configuration file given (use --config or $MAPPEDCOVER_CONFIG)")?;
    let config = ConfigFile::load(&path)?;
    config.validate()?;
    Ok(config)
}

fn select_entry<'a>(config: &'a ConfigFile, id: Option<&str>) -> Result<&'a EntryConfig> {
    match id {
        Some(id) => config
            .entry(id)
            .with_context(|| format!("entry {} not found", id)),
        None => config.entries.first().context("configuration has no entries"),
    }
}

fn run_check(path: Option<PathBuf>) -> Result<()> {
    let config = load_config(path)?;
    for entry in &config.entries {
        println!(
            "{}: {} cover(s), position {}, tilt {}, throttle {}ms",
            entry.id,
            entry.covers.len(),
            entry.position_range(),
            entry.tilt_range(),
            entry.throttle_ms
        );
    }
    Ok(())
}

async fn run_simulate(
    entry: &EntryConfig,
    initial: SourceState,
    travel: TravelMode,
    settings: ControllerSettings,
    steps: &[Step],
) -> Result<()> {
    let store = DeviceStateStore::new();
    let sim = Arc::new(CoverSimulator::new(store.clone()));
    for source_id in &entry.covers {
        sim.add_cover(SimulatedCover::new(source_id.clone(), initial.clone()).with_travel(travel));
    }

    let registry = Arc::new(InMemoryEntityRegistry::new());
    let platform =
        MappedCoverPlatform::new(registry, sim.clone(), Arc::new(store)).with_settings(settings);
    let covers = platform.setup_entry(entry).await?;

    for step in steps {
        tracing::debug!(?step, "Running step");
        match step {
            Step::Service { name, value } => {
                for cover in &covers {
                    cover
                        .handle_service(name, *value)
                        .await
                        .with_context(|| format!("{} on {}", name, cover.unique_id()))?;
                }
            }
            Step::Wait(duration) => tokio::time::sleep(*duration).await,
            Step::Idle => {
                for cover in &covers {
                    cover.wait_idle().await;
                }
            }
        }
    }
    for cover in &covers {
        cover.wait_idle().await;
    }

    let calls: Vec<_> = sim
        .calls()
        .into_iter()
        .map(|c| serde_json::json!({ "device": c.device_id, "action": c.action }))
        .collect();
    let report = serde_json::json!({
        "entry": entry.id,
        "covers": platform.snapshots(&entry.id),
        "calls": calls,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    platform.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_steps() {
        assert_eq!(
            "set_cover_position=40".parse::<Step>().unwrap(),
            Step::Service {
                name: "set_cover_position".to_string(),
                value: Some(40)
            }
        );
        assert_eq!(
            "stop_cover".parse::<Step>().unwrap(),
            Step::Service {
                name: "stop_cover".to_string(),
                value: None
            }
        );
        assert_eq!(
            "wait=250".parse::<Step>().unwrap(),
            Step::Wait(Duration::from_millis(250))
        );
        assert_eq!("idle".parse::<Step>().unwrap(), Step::Idle);
    }

    #[test]
    fn test_parse_invalid_steps() {
        assert!("set_cover_position=140".parse::<Step>().is_err());
        assert!("wait=soon".parse::<Step>().is_err());
        assert!("=5".parse::<Step>().is_err());
    }
}
