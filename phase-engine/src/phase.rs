//! Phase descriptors

use std::time::Duration;

/// One instruction of the workload script
#[derive(Clone, Debug, PartialEq)]
pub enum Phase {
    /// Change the amount of held memory
    Memory(MemoryPhase),

    /// Burn CPU on several workers
    Cpu(CpuPhase),

    /// Idle
    Sleep(SleepPhase),
}

/// Change of the amount of held memory
///
/// When both are specified, `absolute` is applied before `delta`.
///
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryPhase {
    /// Amount of memory to hold, in bytes
    pub absolute: Option<u64>,

    /// Signed change of the amount of held memory, in bytes
    pub delta: Option<i64>,

    /// Time to idle once the memory change has been applied
    pub hold: Option<Duration>,
}

/// CPU burn across several workers
#[derive(Clone, Debug, PartialEq)]
pub struct CpuPhase {
    /// Number of concurrent workers (0 is treated as 1)
    pub workers: usize,

    /// Target busy fraction of each worker, clamped to [0, 1]
    pub utilization: f64,

    /// How long the burn lasts
    pub duration: Duration,
}
//
impl Default for CpuPhase {
    fn default() -> Self {
        Self {
            workers: 1,
            utilization: 1.0,
            duration: Duration::ZERO,
        }
    }
}

/// Idle period
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SleepPhase {
    /// How long to idle
    pub duration: Duration,
}
