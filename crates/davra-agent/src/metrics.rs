//! Host metrics reported with the heartbeat.

use parking_lot::Mutex;
use sysinfo::System;

/// One sample of host health.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostMetrics {
    /// Seconds since boot.
    pub uptime_secs: u64,
    /// One-minute load average.
    pub cpu_load: f64,
    /// Available memory in megabytes.
    pub ram_available_mb: u64,
}

/// Source of host metrics.
pub trait MetricsSource: Send + Sync {
    /// Take a sample.
    fn sample(&self) -> HostMetrics;
}

/// Metrics read from the running host.
pub struct SystemMetrics {
    system: Mutex<System>,
}

impl SystemMetrics {
    /// Create a sampler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SystemMetrics {
    fn sample(&self) -> HostMetrics {
        let mut system = self.system.lock();
        system.refresh_memory();
        HostMetrics {
            uptime_secs: System::uptime(),
            cpu_load: System::load_average().one,
            ram_available_mb: system.available_memory() / (1024 * 1024),
        }
    }
}

/// Always returns the same sample.
#[derive(Debug, Clone, Copy)]
pub struct FixedMetrics(pub HostMetrics);

impl MetricsSource for FixedMetrics {
    fn sample(&self) -> HostMetrics {
        self.0
    }
}
