//! Execution manager configuration.

use std::time::Duration;

/// Tunables for kernel execution.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Timeout applied to an execution when the caller does not supply one.
    pub default_timeout: Duration,
    /// How long to wait after an interrupt for the kernel to go idle
    /// before falling back to a restart.
    pub interrupt_grace: Duration,
    /// Bounded wait for a freshly spawned kernel to signal readiness.
    pub ready_timeout: Duration,
    /// Sessions idle for longer than this are reaped.
    pub max_idle: Duration,
    /// Capacity of each kernel's broadcast channel. If a consumer falls
    /// behind, older messages are dropped and accounted for as a
    /// decode-error output.
    pub channel_capacity: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            interrupt_grace: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(10),
            max_idle: Duration::from_secs(30 * 60),
            channel_capacity: 256,
        }
    }
}

impl ExecConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_interrupt_grace(mut self, grace: Duration) -> Self {
        self.interrupt_grace = grace;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }
}
