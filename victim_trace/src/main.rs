#![deny(unsafe_op_in_unsafe_fn)]

use cache_side_channel::CorePin;
use cache_utils::calibration::{calibrate_access, CalibrationProfile};
use cache_utils::mmap::MMappedMemory;
use cache_utils::{CounterSource, COUNTER_SOURCE};
use clap::{Parser, Subcommand};
use flush_reload::{NaiveFlushAndReload, SamplingScheduler, StopToken};
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use victim_trace::{
    Capture, CaptureFile, PatternDecoder, RunSummary, TargetResolver, TraceConfig, TraceError,
};

const CALIBRATION_BUFFER: usize = 1 << 21;

#[derive(Parser)]
#[command(name = "victim_trace")]
#[command(about = "Flush+Reload tracing of the code a victim process runs in a shared library")]
struct Cli {
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve targets, sample until stopped, print the summary
    Run {
        /// JSON run configuration
        #[arg(long)]
        config: PathBuf,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,

        /// Save the raw capture (MessagePack) for offline decoding
        #[arg(long)]
        save: Option<PathBuf>,

        /// Override the configured round cap
        #[arg(long)]
        max_rounds: Option<u64>,

        /// Override the configured or calibrated threshold
        #[arg(long)]
        threshold: Option<u64>,
    },

    /// Measure hit and miss reload latencies and derive a threshold
    Calibrate {
        #[arg(long, default_value_t = 100_000)]
        iterations: u32,

        #[arg(long)]
        json: bool,
    },

    /// Aggregate and decode a saved capture
    Decode {
        /// Capture written by `run --save`
        #[arg(long)]
        trace: PathBuf,

        /// Configuration holding the decoder settings
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        json: bool,
    },
}

fn calibrate(iterations: u32) -> Result<CalibrationProfile, TraceError> {
    let memory = MMappedMemory::new(CALIBRATION_BUFFER, true)?;
    let profile = calibrate_access(memory.slice(), iterations).ok_or(TraceError::Calibration)?;
    if !profile.separates() {
        warn!(
            "Hit and miss latencies overlap (hit accuracy {:.3}, miss accuracy {:.3})",
            profile.hit_accuracy(),
            profile.miss_accuracy()
        );
    }
    Ok(profile)
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<(), TraceError> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        print!("{}", summary);
    }
    Ok(())
}

fn warn_degenerate(summary: &RunSummary) {
    if let Some(d) = &summary.degenerate {
        warn!(
            "Threshold {} classifies almost everything as {:?} (mean hit rate {:.4}), recalibrate",
            d.threshold.value, d.kind, d.mean_rate
        );
    }
}

fn run(
    config: PathBuf,
    json: bool,
    save: Option<PathBuf>,
    max_rounds: Option<u64>,
    threshold: Option<u64>,
) -> Result<(), TraceError> {
    let mut config = TraceConfig::load(&config)?;
    if let Some(max_rounds) = max_rounds {
        config.max_rounds = max_rounds;
    }
    if threshold.is_some() {
        config.threshold = threshold;
    }
    config.validate()?;

    if COUNTER_SOURCE == CounterSource::MonotonicClock {
        warn!("No cycle counter on this target, timing with a monotonic clock in ns");
    }

    info!("Flush+Reload tracing (PID: {})", std::process::id());
    // keeps the library mapped until sampling is over
    let resolver = TargetResolver::new(&config.library, &config.map_name())?;
    let targets = resolver.resolve_all(&config.targets)?;

    let _pin = config.pin_core.map(CorePin::new).transpose()?;
    let save = save.map(CaptureFile::create).transpose()?;

    let threshold = match config.threshold {
        Some(t) => t,
        None => calibrate(config.calibration_iterations)?.threshold,
    };
    info!("Using threshold {}", threshold);

    let stop = StopToken::new();
    let handler = stop.clone();
    ctrlc::set_handler(move || handler.stop())?;

    let channel = NaiveFlushAndReload::from_threshold(threshold);
    // every line was checked readable by the resolver, and the resolver
    // outlives the scheduler
    let mut scheduler = unsafe { SamplingScheduler::new(channel, targets, config.scheduler_config()) };
    let outcome = scheduler.run(&stop);

    let decoded = config
        .decoder
        .as_ref()
        .map(|d| PatternDecoder::new(d.clone()).decode_store(scheduler.store()))
        .transpose()?;
    let summary = RunSummary::new(
        scheduler.store(),
        Some(scheduler.aggregator()),
        config.progress_window,
        Some(outcome.stop_reason),
        decoded,
    );
    warn_degenerate(&summary);
    print_summary(&summary, json)?;

    if let Some(file) = save {
        let path = file.path().to_owned();
        file.write(&Capture::new(scheduler.into_store(), &outcome))?;
        info!("Capture saved to {}", path.display());
    }
    Ok(())
}

fn decode(trace: PathBuf, config: PathBuf, json: bool) -> Result<(), TraceError> {
    let config = TraceConfig::load(&config)?;
    let capture = Capture::read_msgpack(&trace)?;
    info!(
        "Capture of {} rounds from {}",
        capture.store.rounds(),
        capture.captured_at.to_rfc3339()
    );
    let decoded = config
        .decoder
        .as_ref()
        .map(|d| PatternDecoder::new(d.clone()).decode_store(&capture.store))
        .transpose()?;
    let summary = RunSummary::new(
        &capture.store,
        None,
        config.progress_window,
        capture.stop_reason,
        decoded,
    );
    warn_degenerate(&summary);
    print_summary(&summary, json)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let result = match cli.command {
        Commands::Run {
            config,
            json,
            save,
            max_rounds,
            threshold,
        } => run(config, json, save, max_rounds, threshold),
        Commands::Calibrate { iterations, json } => calibrate(iterations).and_then(|profile| {
            if json {
                println!("{}", serde_json::to_string_pretty(&profile)?);
            } else {
                println!(
                    "threshold {} (hit accuracy {:.4}, miss accuracy {:.4}, {} samples)",
                    profile.threshold,
                    profile.hit_accuracy(),
                    profile.miss_accuracy(),
                    profile.sample_count
                );
            }
            Ok(())
        }),
        Commands::Decode {
            trace,
            config,
            json,
        } => decode(trace, config, json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
