//! Memory-pressure budget, level derivation and cleanup cadence
//! (spec.md §4.F "Memory pressure").

use sysinfo::System;

const GIB: u64 = 1024 * 1024 * 1024;
const FLOOR_BYTES: u64 = 512 * 1024 * 1024;

/// How aggressively cleanup should act, derived from `used / budget`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Normal,
    Elevated,
    High,
    Critical,
}

impl PressureLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            PressureLevel::Normal => 0,
            PressureLevel::Elevated => 1,
            PressureLevel::High => 2,
            PressureLevel::Critical => 3,
        }
    }
}

/// The fraction-of-total-memory allocation budget, by total system memory
/// bracket (spec.md §4.F).
pub fn budget_bytes(total_bytes: u64) -> u64 {
    let fraction_budget = if total_bytes <= 2 * GIB {
        (total_bytes as f64 * 0.20) as u64
    } else if total_bytes <= 8 * GIB {
        (total_bytes as f64 * 0.35) as u64
    } else if total_bytes <= 16 * GIB {
        ((total_bytes as f64 * 0.40) as u64).min(6 * GIB)
    } else {
        ((total_bytes as f64 * 0.30) as u64).min(12 * GIB)
    };
    fraction_budget.max(FLOOR_BYTES)
}

/// Pressure level from `used_bytes / budget_bytes` (spec.md §4.F).
pub fn pressure_level(used_bytes: u64, budget: u64) -> PressureLevel {
    if budget == 0 {
        return PressureLevel::Critical;
    }
    let ratio = used_bytes as f64 / budget as f64;
    if ratio < 0.50 {
        PressureLevel::Normal
    } else if ratio < 0.65 {
        PressureLevel::Elevated
    } else if ratio < 0.80 {
        PressureLevel::High
    } else {
        PressureLevel::Critical
    }
}

/// Cleanup cadence: every 5 minutes normally, 2 minutes from `High` up
/// (spec.md §4.F).
pub fn cleanup_interval(level: PressureLevel) -> std::time::Duration {
    if level >= PressureLevel::High {
        std::time::Duration::from_secs(2 * 60)
    } else {
        std::time::Duration::from_secs(5 * 60)
    }
}

/// Samples process/system memory and derives the current pressure level.
/// Holds its own `sysinfo::System` since refreshing is itself somewhat
/// costly — callers sample once per cleanup tick, not per request.
pub struct MemoryMonitor {
    system: System,
    budget: u64,
}

impl MemoryMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let budget = budget_bytes(system.total_memory());
        Self { system, budget }
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Refresh the sample and return the current pressure level.
    pub fn sample(&mut self) -> PressureLevel {
        self.system.refresh_memory();
        pressure_level(self.system.used_memory(), self.budget)
    }

    pub fn used_bytes(&self) -> u64 {
        self.system.used_memory()
    }
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}
