//! Periodic sampling of memory consumption

use crate::{cancel::CancelFlag, pool::MemoryPool};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Interval at which the reporter thread checks whether a sample is due
///
/// This bounds both the reporting jitter and the time it takes for the
/// reporter to notice that it should stop.
///
const TELEMETRY_POLL: Duration = Duration::from_millis(50);

/// Source of resident memory measurements
pub trait ResidentMemory: Send {
    /// Current resident set size of this process, in KiB
    fn resident_kib(&mut self) -> u64;
}
//
impl<F: FnMut() -> u64 + Send> ResidentMemory for F {
    fn resident_kib(&mut self) -> u64 {
        self()
    }
}

/// Resident memory probe based on the OS process table
pub struct SysinfoProbe {
    /// System monitor state
    system: System,

    /// Identifier of the current process, if known
    pid: Option<Pid>,
}
//
impl SysinfoProbe {
    /// Set up monitoring of the current process
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                log::warn!("Failed to identify the current process ({e}), VmRSS will read as 0");
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }
}
//
impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}
//
impl ResidentMemory for SysinfoProbe {
    fn resident_kib(&mut self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            ProcessRefreshKind::new().with_memory(),
        );
        self.system
            .process(pid)
            .map_or(0, |process| process.memory() / 1024)
    }
}

/// One periodic measurement of memory consumption
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TelemetrySample {
    /// Time elapsed since the start of the run
    pub elapsed: Duration,

    /// Amount of memory held by the memory pool, in bytes
    pub allocated_bytes: usize,

    /// Resident set size reported by the OS, in KiB
    pub resident_kib: u64,
}
//
impl TelemetrySample {
    /// Format this sample as a `[metrics]` report line
    pub fn line(&self, job_name: &str) -> String {
        format!(
            "[metrics] name={job_name} elapsed_s={:.1} alloc_bytes={} VmRSS_kib={}",
            self.elapsed.as_secs_f64(),
            self.allocated_bytes,
            self.resident_kib
        )
    }
}

/// Background thread that samples memory consumption on a fixed schedule
///
/// Samples are due at `origin + k * interval` for k = 1, 2, ... If the
/// reporter falls behind, the next due sample is taken as soon as possible,
/// one sample per poll, without drifting the rest of the schedule.
///
/// The thread runs until [`stop()`](Self::stop) is called, the reporter is
/// dropped, or cancellation is requested. Both `stop()` and `Drop` wait for
/// the current sample to be emitted before returning. Sampling also stops,
/// with a warning, once the next due time can no longer be represented.
///
pub struct TelemetryReporter {
    /// Handle to the reporter thread
    thread: Option<JoinHandle<()>>,

    /// Request for the reporter thread to stop
    stop: Arc<AtomicBool>,
}
//
impl TelemetryReporter {
    /// Start sampling
    ///
    /// Each sample reads the total of `pool`, queries `probe`, and is handed
    /// over to `emit`.
    ///
    pub fn start(
        pool: Arc<MemoryPool>,
        origin: Instant,
        interval: Duration,
        cancel: CancelFlag,
        mut probe: impl ResidentMemory + 'static,
        mut emit: impl FnMut(TelemetrySample) + Send + 'static,
    ) -> io::Result<Self> {
        assert!(!interval.is_zero(), "Telemetry interval must be nonzero");
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let thread = std::thread::Builder::new()
            .name("telemetry".to_owned())
            .spawn(move || {
                let Some(mut next_due) = origin.checked_add(interval) else {
                    log::warn!("Telemetry interval {interval:?} is out of range, not sampling");
                    return;
                };
                while !stop2.load(Ordering::Acquire) && !cancel.is_cancelled() {
                    let now = Instant::now();
                    if now >= next_due {
                        emit(TelemetrySample {
                            elapsed: now.saturating_duration_since(origin),
                            allocated_bytes: pool.current_total(),
                            resident_kib: probe.resident_kib(),
                        });
                        let Some(next) = next_due.checked_add(interval) else {
                            log::warn!("Telemetry schedule overflowed, sampling stops");
                            break;
                        };
                        next_due = next;
                    } else {
                        std::thread::sleep((next_due - now).min(TELEMETRY_POLL));
                    }
                }
            })?;
        Ok(Self {
            thread: Some(thread),
            stop,
        })
    }

    /// Stop sampling, waiting for the reporter thread to exit
    pub fn stop(mut self) {
        self.shutdown()
    }

    /// Ask the reporter thread to stop and join it
    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Telemetry reporter thread panicked");
            }
        }
    }
}
//
impl Drop for TelemetryReporter {
    fn drop(&mut self) {
        self.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use more_asserts::{assert_ge, assert_le, assert_lt};
    use pretty_assertions::assert_eq;
    use std::sync::{mpsc, Mutex};

    #[test]
    fn line_format() {
        let sample = TelemetrySample {
            elapsed: Duration::from_millis(2049),
            allocated_bytes: 2 << 30,
            resident_kib: 2_100_000,
        };
        assert_eq!(
            sample.line("CFD"),
            "[metrics] name=CFD elapsed_s=2.0 alloc_bytes=2147483648 VmRSS_kib=2100000"
        );
    }

    #[test]
    fn sysinfo_probe() {
        let mut probe = SysinfoProbe::new();
        // Any live process has some resident memory
        assert!(probe.resident_kib() > 0);
    }

    #[test]
    fn periodic_sampling() {
        let pool = Arc::new(MemoryPool::with_chunk_size(1000));
        pool.grow(1234).unwrap();
        let interval = Duration::from_millis(100);
        let (sender, receiver) = mpsc::channel();
        let reporter = TelemetryReporter::start(
            pool.clone(),
            Instant::now(),
            interval,
            CancelFlag::new(),
            || 42u64,
            move |sample| sender.send(sample).unwrap(),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(550));
        reporter.stop();

        let samples = receiver.try_iter().collect::<Vec<_>>();
        assert_ge!(samples.len(), 4);
        assert_le!(samples.len(), 6);
        for (idx, sample) in samples.iter().enumerate() {
            let due = interval * (idx as u32 + 1);
            assert_ge!(sample.elapsed, due);
            assert_lt!(sample.elapsed, due + interval);
            assert_eq!(sample.allocated_bytes, 1234);
            assert_eq!(sample.resident_kib, 42);
        }
    }

    #[test]
    fn catches_up_without_drift() {
        // Start from an origin in the past, the first samples are overdue
        let interval = Duration::from_millis(100);
        let origin = Instant::now() - Duration::from_millis(350);
        let samples = Arc::new(Mutex::new(Vec::new()));
        let samples2 = samples.clone();
        let reporter = TelemetryReporter::start(
            Arc::new(MemoryPool::new()),
            origin,
            interval,
            CancelFlag::new(),
            || 0u64,
            move |sample| samples2.lock().unwrap().push(sample),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(300));
        reporter.stop();

        let samples = samples.lock().unwrap();
        // Overdue samples 1..=3 are emitted back to back, then 4, 5, 6 on time
        assert_ge!(samples.len(), 5);
        assert_le!(samples.len(), 7);
        assert_lt!(samples[2].elapsed, Duration::from_millis(400));
        let last = samples.last().unwrap();
        assert_ge!(last.elapsed, interval * samples.len() as u32);
    }

    #[test]
    fn huge_interval() {
        let (sender, receiver) = mpsc::channel();
        let mut reporter = TelemetryReporter::start(
            Arc::new(MemoryPool::new()),
            Instant::now(),
            Duration::from_secs(u64::MAX),
            CancelFlag::new(),
            || 0u64,
            move |sample| {
                let _ = sender.send(sample);
            },
        )
        .unwrap();
        // The thread gives up on its own instead of panicking
        let thread = reporter.thread.take().unwrap();
        assert!(thread.join().is_ok());
        assert_eq!(receiver.try_iter().count(), 0);
    }

    #[test]
    fn cancellation_stops_reporter() {
        let cancel = CancelFlag::new();
        let (sender, receiver) = mpsc::channel();
        let reporter = TelemetryReporter::start(
            Arc::new(MemoryPool::new()),
            Instant::now(),
            Duration::from_millis(20),
            cancel.clone(),
            || 0u64,
            move |sample| {
                let _ = sender.send(sample);
            },
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        cancel.cancel();
        std::thread::sleep(Duration::from_millis(150));
        let count = receiver.try_iter().count();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(receiver.try_iter().count(), 0);
        assert_ge!(count, 1);
        drop(reporter);
    }
}
