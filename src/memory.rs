// src/memory.rs

use std::sync::Mutex;
use sysinfo::System;

pub const MIB: u64 = 1024 * 1024;

/// Point-in-time memory readings. `None` means the value could not be read.
pub trait MemoryMonitor: Send + Sync {
    /// Resident memory of the running process, in bytes.
    fn current_usage(&self) -> Option<u64>;

    /// Memory available to new allocations system-wide, in bytes.
    fn available_system_memory(&self) -> Option<u64>;
}

/// Samples the real process and host.
pub struct SystemMemory {
    system: Mutex<System>,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMonitor for SystemMemory {
    fn current_usage(&self) -> Option<u64> {
        memory_stats::memory_stats().map(|stats| stats.physical_mem as u64)
    }

    fn available_system_memory(&self) -> Option<u64> {
        let mut system = self.system.lock().ok()?;
        system.refresh_memory();
        // sysinfo reports 0 on platforms it cannot query.
        match system.available_memory() {
            0 => None,
            available => Some(available),
        }
    }
}

/// Converts bytes to mebibytes for display.
pub fn as_mib(bytes: u64) -> f64 {
    bytes as f64 / MIB as f64
}
