//! Duty-cycled CPU burn across concurrent workers

use crate::{
    cancel::{CancelFlag, Completion},
    hold::wait_in_chunks,
};
use crossbeam_utils::CachePadded;
use std::{
    hint::black_box,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// Length of one busy/idle cycle of a burn worker
pub const DUTY_PERIOD: Duration = Duration::from_millis(10);

/// Interval at which the coordinating thread checks for the end of a burn
const COORDINATOR_POLL: Duration = Duration::from_millis(50);

/// Keep `workers` threads busy for a `utilization` fraction of the time,
/// during `duration` or until `cancel` is raised
///
/// `utilization` is clamped to [0, 1], and a worker count of 0 is treated as 1.
/// Each worker alternates between floating-point busy work and sleep with a
/// period of [`DUTY_PERIOD`], so its average utilization converges towards
/// the target over many periods.
///
/// This only returns once every worker has finished its current period and
/// exited.
///
pub fn burn(
    duration: Duration,
    workers: usize,
    utilization: f64,
    cancel: &CancelFlag,
) -> BurnReport {
    let workers = workers.max(1);
    let utilization = clamp_utilization(utilization);
    let busy_time = DUTY_PERIOD.mul_f64(utilization);
    log::debug!(
        "Burning {workers} worker(s) at {:.1}% for {duration:?}",
        utilization * 100.0
    );

    let loads = std::iter::repeat_with(|| CachePadded::new(WorkerLoad::default()))
        .take(workers)
        .collect::<Box<[_]>>();
    let stop = AtomicBool::new(false);
    let start = Instant::now();
    let completion = std::thread::scope(|s| {
        for load in loads.iter() {
            let stop = &stop;
            s.spawn(move || duty_cycle(busy_time, stop, cancel, load));
        }
        let completion = wait_in_chunks(start, duration, COORDINATOR_POLL, cancel);
        stop.store(true, Ordering::Release);
        completion
    });

    let report = BurnReport {
        wall_time: start.elapsed(),
        workers: loads.iter().map(|load| load.snapshot()).collect(),
        completion,
    };
    log::debug!(
        "Burn ended ({completion:?}) after {:?}, mean utilization {:.1}%",
        report.wall_time,
        report.mean_utilization() * 100.0
    );
    report
}

/// Bring a requested utilization within [0, 1], mapping NaN to 0
fn clamp_utilization(utilization: f64) -> f64 {
    if utilization.is_nan() {
        0.0
    } else {
        utilization.clamp(0.0, 1.0)
    }
}

/// Busy/idle loop of a single burn worker
fn duty_cycle(busy_time: Duration, stop: &AtomicBool, cancel: &CancelFlag, load: &WorkerLoad) {
    let mut x = 1.0f64;
    while !stop.load(Ordering::Acquire) && !cancel.is_cancelled() {
        let period_start = Instant::now();
        while period_start.elapsed() < busy_time {
            // Converges towards 1.0, so it never overflows or denormalizes
            x = black_box(x * 0.999_999 + 0.000_001);
        }
        let worked = period_start.elapsed();
        if let Some(idle) = DUTY_PERIOD.checked_sub(worked) {
            if !idle.is_zero() {
                std::thread::sleep(idle);
            }
        }
        load.record(worked);
    }
    black_box(x);
}

/// Load counters published by a worker
#[derive(Debug, Default)]
struct WorkerLoad {
    /// Time spent in busy work, in nanoseconds
    busy_nanos: AtomicU64,

    /// Number of completed duty periods
    periods: AtomicU64,
}
//
impl WorkerLoad {
    /// Account for one completed duty period
    fn record(&self, worked: Duration) {
        let nanos = u64::try_from(worked.as_nanos()).unwrap_or(u64::MAX);
        // Relaxed is fine, counters are only read after the worker is joined
        self.busy_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.periods.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of the counters
    fn snapshot(&self) -> WorkerReport {
        WorkerReport {
            busy_time: Duration::from_nanos(self.busy_nanos.load(Ordering::Relaxed)),
            periods: self.periods.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of a CPU burn
#[derive(Clone, Debug, PartialEq)]
pub struct BurnReport {
    /// Time elapsed between the start of the burn and the exit of all workers
    pub wall_time: Duration,

    /// Load measured on each worker
    pub workers: Vec<WorkerReport>,

    /// Whether the burn lasted for the requested duration
    pub completion: Completion,
}
//
impl BurnReport {
    /// Measured busy fraction of a worker over the whole burn
    pub fn utilization(&self, worker: usize) -> f64 {
        if self.wall_time.is_zero() {
            return 0.0;
        }
        self.workers[worker].busy_time.as_secs_f64() / self.wall_time.as_secs_f64()
    }

    /// Average of the busy fractions of all workers
    pub fn mean_utilization(&self) -> f64 {
        if self.workers.is_empty() {
            return 0.0;
        }
        (0..self.workers.len())
            .map(|worker| self.utilization(worker))
            .sum::<f64>()
            / self.workers.len() as f64
    }
}

/// Load measured on one burn worker
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WorkerReport {
    /// Time spent doing busy work
    pub busy_time: Duration,

    /// Number of duty periods that were completed
    pub periods: u64,
}
