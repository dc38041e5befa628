//! Phase-driven emulation of HPC job resource consumption
//!
//! This crate executes an ordered list of [`Phase`]s that grow or shrink the
//! resident memory of the current process, burn CPU at a controlled duty
//! cycle, or idle, while a [`TelemetryReporter`] periodically samples the
//! amount of memory that is held and the resident set size reported by the
//! operating system.
//!
//! All long-running operations observe a shared [`CancelFlag`] and wind down
//! promptly once it is raised, without ever leaving the [`MemoryPool`] in an
//! inconsistent state.

#![deny(missing_docs)]

pub mod burn;
pub mod cancel;
pub mod executor;
pub mod hold;
pub mod phase;
pub mod pool;
pub mod telemetry;

pub use self::{
    burn::{burn, BurnReport},
    cancel::{CancelFlag, Completion},
    executor::{ExecError, PhaseExecutor, RunSummary},
    hold::hold,
    phase::{CpuPhase, MemoryPhase, Phase, SleepPhase},
    pool::{MemoryPool, PoolError},
    telemetry::{ResidentMemory, SysinfoProbe, TelemetryReporter, TelemetrySample},
};
use std::time::Duration;

/// Run-level settings that are not tied to a particular phase
#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    /// Free-form job label, repeated in every telemetry line
    pub job_name: String,

    /// Interval between two telemetry samples
    pub telemetry_interval: Duration,
}
//
impl Default for RunConfig {
    fn default() -> Self {
        Self {
            job_name: DEFAULT_JOB_NAME.to_owned(),
            telemetry_interval: DEFAULT_TELEMETRY_INTERVAL,
        }
    }
}

/// Job label used when none is specified
pub const DEFAULT_JOB_NAME: &str = "job";

/// Telemetry interval used when none is specified
pub const DEFAULT_TELEMETRY_INTERVAL: Duration = Duration::from_secs(1);
