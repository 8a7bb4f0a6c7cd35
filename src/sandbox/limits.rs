//! Enforced execution bounds.
//!
//! Configuration may move the defaults around inside these ranges but can
//! never widen them.

/// Smallest memory ceiling an environment may be created with (MB)
pub const MIN_MEMORY_LIMIT_MB: u32 = 8;
/// Largest memory ceiling an environment may be created with (MB)
pub const MAX_MEMORY_LIMIT_MB: u32 = 512;
pub const DEFAULT_MEMORY_LIMIT_MB: u32 = 128;

/// Shortest time budget for a single run (ms)
pub const MIN_TIMEOUT_MS: u64 = 100;
/// Longest time budget for a single run (ms)
pub const MAX_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Fixed budget for structured-data parsing (ms)
pub const PARSE_TIMEOUT_MS: u64 = 1_000;

/// Maximum code length, counted in characters
pub const MAX_CODE_CHARS: usize = 100_000;

/// Deepest bracket nesting accepted in submitted code
pub const MAX_NESTING_DEPTH: usize = 1_000;

/// Multiple of the memory ceiling at which a breach is final, without giving
/// the collector a chance to reclaim garbage first
pub const HARD_CEILING_FACTOR: usize = 2;

/// Number of idle environments kept for reuse
pub const MAX_POOL_SIZE: usize = 5;

/// Extra time the host waits for an environment that has overrun its budget
/// before giving up on it (ms)
pub const HOST_GRACE_MS: u64 = 1_000;

pub fn clamp_memory_limit_mb(value: u32) -> u32 {
    value.clamp(MIN_MEMORY_LIMIT_MB, MAX_MEMORY_LIMIT_MB)
}

pub fn clamp_timeout_ms(value: u64) -> u64 {
    value.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS)
}

/// Engine-side limits applied to every sandbox context.
#[derive(Debug, Clone, Copy)]
pub struct ContextLimits {
    /// Maximum depth of nested JS calls
    pub recursion_limit: usize,
    /// Maximum VM value stack length
    pub stack_size_limit: usize,
    /// VM "clock cycles" executed between watchdog checks
    pub slice_budget: u32,
    /// Loop iterations a single call frame may run per millisecond of the
    /// time budget. Bounds loops the watchdog cannot see, such as those in
    /// callbacks invoked by native builtins.
    pub loop_iterations_per_ms: u64,
}

impl ContextLimits {
    /// Per-frame loop iteration cap for a run with the given time budget.
    pub fn loop_budget(&self, timeout_ms: u64) -> u64 {
        timeout_ms.saturating_mul(self.loop_iterations_per_ms)
    }
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            recursion_limit: 256,
            stack_size_limit: 16 * 1024,
            slice_budget: 4096,
            loop_iterations_per_ms: 10_000,
        }
    }
}
