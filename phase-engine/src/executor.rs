//! Sequential execution of workload phases

use crate::{
    burn::burn,
    cancel::{CancelFlag, Completion},
    hold::hold,
    phase::{CpuPhase, MemoryPhase, Phase, SleepPhase},
    pool::{MemoryPool, PoolError},
};
use std::{io, time::Duration};
use thiserror::Error;

/// Driver of a workload script
///
/// Phases run strictly one after the other. Cancellation is checked before
/// each phase and shortens the waiting parts of a phase, but never interrupts
/// a memory change that is in progress.
///
pub struct PhaseExecutor<'run> {
    /// Memory held on behalf of the workload
    pool: &'run MemoryPool,

    /// External request to stop
    cancel: &'run CancelFlag,
}
//
impl<'run> PhaseExecutor<'run> {
    /// Set up an executor operating on `pool`
    pub fn new(pool: &'run MemoryPool, cancel: &'run CancelFlag) -> Self {
        Self { pool, cancel }
    }

    /// Run `phases` in order, writing one status line per phase action to
    /// `status`
    ///
    /// Memory allocation failures are fatal and abort the run. Cancellation
    /// is not an error: remaining phases are skipped and a summary is
    /// returned as usual.
    ///
    pub fn run(
        &self,
        phases: &[Phase],
        mut status: impl io::Write,
    ) -> Result<RunSummary, ExecError> {
        let mut phases_started = 0;
        for (idx, phase) in phases.iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::info!(
                    "Run cancelled, skipping {} remaining phase(s)",
                    phases.len() - idx
                );
                break;
            }
            writeln!(status, "== Phase {} ==", idx + 1)?;
            phases_started += 1;
            match phase {
                Phase::Memory(memory) => self.memory(memory, &mut status)?,
                Phase::Cpu(cpu) => self.cpu(cpu, &mut status)?,
                Phase::Sleep(sleep) => self.sleep(sleep, &mut status)?,
            }
        }
        Ok(RunSummary {
            phases_started,
            cancelled: self.cancel.is_cancelled(),
            final_total: self.pool.current_total(),
        })
    }

    /// Apply a memory phase
    fn memory(&self, phase: &MemoryPhase, status: &mut impl io::Write) -> Result<(), ExecError> {
        if let Some(target) = phase.absolute {
            self.pool.set_total(addressable(target)?)?;
            writeln!(status, "MEM: abs={target} bytes")?;
        }
        match phase.delta {
            Some(delta) if delta > 0 => {
                let bytes = delta.unsigned_abs();
                self.pool.grow(addressable(bytes)?)?;
                writeln!(status, "MEM: +={bytes} bytes")?;
            }
            Some(delta) if delta < 0 => {
                let bytes = delta.unsigned_abs();
                // Freeing more than the address space just empties the pool
                self.pool.shrink(usize::try_from(bytes).unwrap_or(usize::MAX))?;
                writeln!(status, "MEM: -={bytes} bytes")?;
            }
            _ => {}
        }
        log::debug!("Memory pool now holds {} bytes", self.pool.current_total());
        if let Some(duration) = phase.hold.filter(|d| !d.is_zero()) {
            self.idle(duration);
        }
        Ok(())
    }

    /// Run a CPU burn phase
    fn cpu(&self, phase: &CpuPhase, status: &mut impl io::Write) -> Result<(), ExecError> {
        writeln!(
            status,
            "CPU: threads={} util={} duration={}s",
            phase.workers,
            phase.utilization,
            phase.duration.as_secs_f64()
        )?;
        let report = burn(phase.duration, phase.workers, phase.utilization, self.cancel);
        if report.completion == Completion::Cancelled {
            log::info!("CPU burn cancelled after {:?}", report.wall_time);
        }
        Ok(())
    }

    /// Run a sleep phase
    fn sleep(&self, phase: &SleepPhase, status: &mut impl io::Write) -> Result<(), ExecError> {
        writeln!(status, "SLEEP: duration={}s", phase.duration.as_secs_f64())?;
        self.idle(phase.duration);
        Ok(())
    }

    /// Hold for some time, logging early exits
    fn idle(&self, duration: Duration) {
        if hold(duration, self.cancel) == Completion::Cancelled {
            log::info!("Hold of {duration:?} cancelled");
        }
    }
}

/// Convert a byte count to the platform's native size type
fn addressable(bytes: u64) -> Result<usize, PoolError> {
    usize::try_from(bytes).map_err(|_| PoolError::Unaddressable(bytes))
}

/// Outcome of a workload run
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunSummary {
    /// Number of phases that were started
    pub phases_started: usize,

    /// Whether cancellation was requested during the run
    pub cancelled: bool,

    /// Amount of memory held by the pool at the end of the run, in bytes
    pub final_total: usize,
}

/// Error while running a workload
#[derive(Debug, Error)]
pub enum ExecError {
    /// Failed to resize the memory pool
    #[error("failed to resize the memory pool ({0})")]
    Pool(#[from] PoolError),

    /// Failed to report phase progress
    #[error("failed to write phase status ({0})")]
    Status(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use more_asserts::{assert_ge, assert_lt};
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    const MIB: u64 = 1 << 20;

    /// Run phases on a pool, return the summary and status output
    fn run(pool: &MemoryPool, cancel: &CancelFlag, phases: &[Phase]) -> (RunSummary, String) {
        let mut status = Vec::new();
        let summary = PhaseExecutor::new(pool, cancel)
            .run(phases, &mut status)
            .unwrap();
        (summary, String::from_utf8(status).unwrap())
    }

    fn memory(absolute: Option<u64>, delta: Option<i64>) -> Phase {
        Phase::Memory(MemoryPhase {
            absolute,
            delta,
            hold: None,
        })
    }

    #[test]
    fn absolute_then_delta() {
        let pool = MemoryPool::with_chunk_size(MIB as usize);
        pool.grow(MIB as usize).unwrap();
        let phases = [memory(Some(2 * MIB), Some(MIB as i64 / 2))];
        let (summary, status) = run(&pool, &CancelFlag::new(), &phases);
        assert_eq!(summary.final_total, (2 * MIB + MIB / 2) as usize);
        assert_eq!(
            status,
            "== Phase 1 ==\nMEM: abs=2097152 bytes\nMEM: +=524288 bytes\n"
        );
    }

    #[test]
    fn absolute_shrinks() {
        let pool = MemoryPool::with_chunk_size(MIB as usize);
        pool.grow(3 * MIB as usize).unwrap();
        let (summary, _) = run(&pool, &CancelFlag::new(), &[memory(Some(MIB), None)]);
        assert_eq!(summary.final_total, MIB as usize);
        assert_eq!(pool.buffer_sizes(), vec![MIB as usize]);
    }

    #[test]
    fn negative_delta_clamps() {
        let pool = MemoryPool::with_chunk_size(MIB as usize);
        let phases = [memory(None, Some(MIB as i64)), memory(None, Some(i64::MIN))];
        let (summary, status) = run(&pool, &CancelFlag::new(), &phases);
        assert_eq!(summary.final_total, 0);
        assert_eq!(
            status,
            "== Phase 1 ==\nMEM: +=1048576 bytes\n\
             == Phase 2 ==\nMEM: -=9223372036854775808 bytes\n"
        );
    }

    #[test]
    fn cpu_and_sleep_status() {
        let pool = MemoryPool::new();
        let phases = [
            Phase::Cpu(CpuPhase {
                workers: 2,
                utilization: 0.4,
                duration: Duration::from_millis(100),
            }),
            Phase::Sleep(SleepPhase {
                duration: Duration::from_millis(250),
            }),
        ];
        let start = Instant::now();
        let (summary, status) = run(&pool, &CancelFlag::new(), &phases);
        assert_ge!(start.elapsed(), Duration::from_millis(350));
        assert_eq!(
            summary,
            RunSummary {
                phases_started: 2,
                cancelled: false,
                final_total: 0
            }
        );
        assert_eq!(
            status,
            "== Phase 1 ==\nCPU: threads=2 util=0.4 duration=0.1s\n\
             == Phase 2 ==\nSLEEP: duration=0.25s\n"
        );
    }

    #[test]
    fn memory_hold() {
        let pool = MemoryPool::with_chunk_size(MIB as usize);
        let phases = [Phase::Memory(MemoryPhase {
            absolute: Some(MIB),
            delta: None,
            hold: Some(Duration::from_millis(200)),
        })];
        let start = Instant::now();
        let (summary, _) = run(&pool, &CancelFlag::new(), &phases);
        assert_ge!(start.elapsed(), Duration::from_millis(200));
        assert_eq!(summary.final_total, MIB as usize);
    }

    #[test]
    fn cancelled_before_start() {
        let pool = MemoryPool::new();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let (summary, status) = run(&pool, &cancel, &[memory(Some(MIB), None)]);
        assert_eq!(summary.phases_started, 0);
        assert!(summary.cancelled);
        assert_eq!(summary.final_total, 0);
        assert!(status.is_empty());
    }

    #[test]
    fn cancellation_skips_remaining_phases() {
        let pool = MemoryPool::with_chunk_size(MIB as usize);
        let cancel = CancelFlag::new();
        let phases = [
            memory(Some(2 * MIB), None),
            Phase::Sleep(SleepPhase {
                duration: Duration::from_secs(60),
            }),
            memory(None, Some(-(MIB as i64))),
        ];
        let start = Instant::now();
        let (summary, status) = std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(200));
                cancel.cancel();
            });
            run(&pool, &cancel, &phases)
        });
        assert_lt!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(summary.phases_started, 2);
        assert!(summary.cancelled);
        // Memory changes that were applied are kept
        assert_eq!(summary.final_total, 2 * MIB as usize);
        assert!(!status.contains("== Phase 3 =="));
    }

    #[test]
    fn allocation_failure_is_fatal() {
        let pool = MemoryPool::with_chunk_size(usize::MAX);
        let phases = [
            memory(None, Some(i64::MAX)),
            Phase::Sleep(SleepPhase::default()),
        ];
        let result = PhaseExecutor::new(&pool, &CancelFlag::new()).run(&phases, io::sink());
        assert_matches!(result, Err(ExecError::Pool(PoolError::OutOfMemory(_))));
    }
}
