//! Kernel constants and host configuration

// ============================================================================
// Priorities
// ============================================================================

/// Lowest schob priority
pub const PRIO_MIN: u32 = 0;
/// Priority used when attributes don't specify one
pub const PRIO_DEFAULT: u32 = 0x8000_0000;
/// Highest schob priority
pub const PRIO_MAX: u32 = u32::MAX;

// ============================================================================
// Stacks
// ============================================================================

/// Smallest thread stack accepted by thread creation
pub const STACK_MIN: usize = 4096;
/// Thread stack size when attributes don't specify one
pub const STACK_DEFAULT: usize = 2 * 1024 * 1024;
/// Largest thread stack accepted by thread creation
pub const STACK_MAX: usize = 16 * 1024 * 1024;
/// Stack lengths are rounded up to a multiple of this
pub const STACK_GRANULE: usize = 4096;
/// Headroom mapped below every thread stack so a panic can unwind out of a
/// thread that used up its requested size
pub const STACK_RESERVE: usize = 256 * 1024;

// ============================================================================
// Workers
// ============================================================================

/// Upper bound on workers per host
pub const MAX_WORKERS: usize = 256;

/// Native stack size of each worker (runs the scheduler loop and every DPC)
pub const WORKER_STACK_DEFAULT: usize = 2 * 1024 * 1024;

// ============================================================================
// Host Configuration
// ============================================================================

/// Tunables for a [`Host`](crate::Host)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Thread nodes (with their stacks) kept for reuse
    pub thread_pool: usize,
    /// DPC nodes kept for reuse
    pub dpc_pool: usize,
    /// Worker records kept for reuse
    pub worker_pool: usize,
    /// Native stack size for each worker
    pub worker_stack_size: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            thread_pool: 64,
            dpc_pool: 256,
            worker_pool: 16,
            worker_stack_size: WORKER_STACK_DEFAULT,
        }
    }
}

impl HostConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_pool(mut self, count: usize) -> Self {
        self.thread_pool = count;
        self
    }

    pub fn with_dpc_pool(mut self, count: usize) -> Self {
        self.dpc_pool = count;
        self
    }

    pub fn with_worker_pool(mut self, count: usize) -> Self {
        self.worker_pool = count;
        self
    }

    pub fn with_worker_stack_size(mut self, bytes: usize) -> Self {
        self.worker_stack_size = bytes;
        self
    }
}

/// Round a requested stack length up to the allocation granule
pub fn round_stack_len(len: usize) -> usize {
    len.div_ceil(STACK_GRANULE) * STACK_GRANULE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_priority_is_midpoint() {
        assert_eq!(PRIO_DEFAULT, PRIO_MIN + (PRIO_MAX - PRIO_MIN) / 2 + 1);
    }

    #[test]
    fn test_round_stack_len() {
        assert_eq!(round_stack_len(STACK_MIN), STACK_MIN);
        assert_eq!(round_stack_len(STACK_MIN + 1), 2 * STACK_GRANULE);
        assert_eq!(round_stack_len(STACK_DEFAULT), STACK_DEFAULT);
        assert_eq!(STACK_RESERVE % STACK_GRANULE, 0);
    }

    #[test]
    fn test_config_builder() {
        let cfg = HostConfig::new().with_thread_pool(2).with_dpc_pool(0);
        assert_eq!(cfg.thread_pool, 2);
        assert_eq!(cfg.dpc_pool, 0);
        assert_eq!(cfg.worker_pool, HostConfig::default().worker_pool);
    }
}
