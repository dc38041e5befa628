//! Emulate the resource consumption of an HPC job as a sequence of phases

#![deny(missing_docs)]

use clap::Parser;
use phase_engine::{
    CancelFlag, ExecError, MemoryPool, Phase, PhaseExecutor, RunConfig, SysinfoProbe,
    TelemetryReporter, DEFAULT_JOB_NAME,
};
use phase_spec::DurationError;
use std::{
    io,
    process::ExitCode,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Allocate memory, burn CPU and idle according to a list of phases, while
/// periodically reporting memory consumption
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Job label, repeated in every telemetry line
    #[clap(long, default_value = DEFAULT_JOB_NAME)]
    name: String,

    /// Interval between two telemetry lines (e.g. 500ms, 1s, 2m) [default: 1s]
    #[clap(long, value_parser = parse_interval)]
    log_interval: Option<Duration>,

    /// Phase to execute, e.g. type=mem,abs=2G or type=cpu,threads=4,util=0.4,duration=60s
    ///
    /// Can be repeated, phases are executed in command line order. Memory
    /// phases accept abs=SIZE, delta=±SIZE and duration=TIME, CPU phases
    /// accept threads=N, util=FRACTION and duration=TIME, sleep phases accept
    /// duration=TIME.
    #[clap(
        long = "phase",
        value_name = "SPEC",
        required = true,
        value_parser = phase_spec::parse_phase
    )]
    phases: Vec<Phase>,
}
//
impl Args {
    /// Run-level settings
    fn config(&self) -> RunConfig {
        let defaults = RunConfig::default();
        RunConfig {
            job_name: self.name.clone(),
            telemetry_interval: self.log_interval.unwrap_or(defaults.telemetry_interval),
        }
    }
}

/// Parse the telemetry interval, which must be nonzero
fn parse_interval(s: &str) -> Result<Duration, IntervalError> {
    let interval = phase_spec::parse_duration(s)?;
    if interval.is_zero() {
        return Err(IntervalError::Zero);
    }
    Ok(interval)
}

/// Invalid telemetry interval
#[derive(Debug, Error)]
enum IntervalError {
    /// Not a duration
    #[error(transparent)]
    Duration(#[from] DurationError),

    /// Zero interval
    #[error("telemetry interval must be nonzero")]
    Zero,
}

fn main() -> ExitCode {
    let origin = Instant::now();
    env_logger::init();
    let args = Args::parse();
    match run(&args.config(), &args.phases, origin) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Execute the phases, with telemetry running in the background
fn run(config: &RunConfig, phases: &[Phase], origin: Instant) -> Result<(), RunError> {
    let cancel = CancelFlag::new();
    // A second interrupt while the first one is being handled exits at once
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register_conditional_shutdown(signal, 1, cancel.as_atomic())
            .map_err(RunError::Signal)?;
        signal_hook::flag::register(signal, cancel.as_atomic()).map_err(RunError::Signal)?;
    }

    let pool = Arc::new(MemoryPool::new());
    let job_name = config.job_name.clone();
    let reporter = TelemetryReporter::start(
        pool.clone(),
        origin,
        config.telemetry_interval,
        cancel.clone(),
        SysinfoProbe::new(),
        move |sample| eprintln!("{}", sample.line(&job_name)),
    )
    .map_err(RunError::Telemetry)?;

    let result = PhaseExecutor::new(&pool, &cancel).run(phases, io::stderr());
    reporter.stop();
    let summary = result?;
    if summary.cancelled {
        log::warn!(
            "Interrupted after starting {} of {} phase(s)",
            summary.phases_started,
            phases.len()
        );
    }
    eprintln!("Done. Total allocated bytes={}", summary.final_total);
    Ok(())
}

/// Fatal error during a run
#[derive(Debug, Error)]
enum RunError {
    /// Failed to install the interrupt handlers
    #[error("failed to register signal handler ({0})")]
    Signal(#[source] io::Error),

    /// Failed to start the telemetry thread
    #[error("failed to start telemetry reporter ({0})")]
    Telemetry(#[source] io::Error),

    /// Phase execution failed
    #[error(transparent)]
    Exec(#[from] ExecError),
}
