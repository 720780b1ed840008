//! Tick schedule of the control loop.
//!
//! The loop ticks once per second with a monotonically increasing counter. Each
//! tick runs the steps its [`TickPlan`] selects, in this order:
//!
//! | Step | When |
//! |------|------|
//! | heartbeat + pending-job poll | every `heartbeatInterval` ticks |
//! | function poll | a function record exists, or every 60th tick |
//! | job poll | a job record exists, or every 60th tick |
//! | capability report | every `heartbeatInterval × 10` ticks |
//!
//! Tick 0 runs every step, so a freshly started agent reports immediately.

use std::time::Duration;

/// Period between ticks.
pub const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Ticks between unconditional polls.
pub const SAFETY_NET_TICKS: u64 = 60;

/// Capability reports happen every this many heartbeats.
pub const CAPABILITY_REPORT_HEARTBEATS: u64 = 10;

/// Steps to run on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct TickPlan {
    /// Send heartbeats and poll for a pending job.
    pub heartbeat: bool,
    /// Run the function poll.
    pub poll_function: bool,
    /// Run the job poll.
    pub poll_job: bool,
    /// Re-report the capability set.
    pub report_capabilities: bool,
}

impl TickPlan {
    /// Plan tick number `tick`.
    #[must_use]
    pub const fn for_tick(
        tick: u64,
        heartbeat_interval: u64,
        function_active: bool,
        job_active: bool,
    ) -> Self {
        let heartbeat_interval = if heartbeat_interval == 0 {
            1
        } else {
            heartbeat_interval
        };
        let safety_net = tick % SAFETY_NET_TICKS == 0;
        Self {
            heartbeat: tick % heartbeat_interval == 0,
            poll_function: function_active || safety_net,
            poll_job: job_active || safety_net,
            report_capabilities: tick
                % heartbeat_interval.saturating_mul(CAPABILITY_REPORT_HEARTBEATS)
                == 0,
        }
    }

    /// Whether the tick does anything.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        !(self.heartbeat || self.poll_function || self.poll_job || self.report_capabilities)
    }
}
