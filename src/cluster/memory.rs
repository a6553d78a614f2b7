//! Resident memory probe for the worker's own process.

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Source of resident set size readings.
pub trait MemoryProbe: Send + 'static {
    /// Current RSS in bytes, or `None` if it can't be read.
    fn resident_bytes(&mut self) -> Option<u64>;
}

/// Reads RSS for one pid through sysinfo.
pub struct ProcessMemory {
    system: System,
    pid: Pid,
}

impl ProcessMemory {
    /// Probe for the calling process.
    pub fn current() -> Self {
        Self::for_pid(std::process::id())
    }

    pub fn for_pid(pid: u32) -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(pid),
        }
    }
}

impl MemoryProbe for ProcessMemory {
    fn resident_bytes(&mut self) -> Option<u64> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system.process(self.pid).map(|p| p.memory())
    }
}

impl<F> MemoryProbe for F
where
    F: FnMut() -> Option<u64> + Send + 'static,
{
    fn resident_bytes(&mut self) -> Option<u64> {
        self()
    }
}
