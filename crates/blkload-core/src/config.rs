//! Engine configuration
//!
//! Plain struct with defaults, two presets and a `validate()` pass. The CLI
//! maps its flags onto [`EngineConfig`]; there is no config file.

use std::time::Duration;

/// Maximum number of targets a registry accepts.
pub const MAX_TARGETS: usize = 128;

/// Default read size and alignment (128 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 128 * 1024;

/// Default admission bound.
pub const DEFAULT_MAX_OUTSTANDING: usize = 512;

/// Default number of requests per group-submit call.
pub const DEFAULT_BATCH_LIMIT: usize = 256;

/// Default number of completions delivered per wait.
pub const DEFAULT_MAX_EVENTS: usize = 32;

/// Conditions that end a run besides an external stop signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunLimits {
    /// Stop admitting after this much wall time.
    pub duration: Option<Duration>,
    /// Stop admitting once this many completions have been reaped.
    pub max_completions: Option<u64>,
}

impl RunLimits {
    /// No limits: run until stopped.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self { duration: None, max_completions: None }
    }

    /// Stop after `n` completions.
    #[must_use]
    pub const fn completions(n: u64) -> Self {
        Self { duration: None, max_completions: Some(n) }
    }

    /// Stop after `d` of wall time.
    #[must_use]
    pub const fn duration(d: Duration) -> Self {
        Self { duration: Some(d), max_completions: None }
    }
}

/// Request lifecycle engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Read length and offset alignment in bytes
    pub block_size: usize,

    /// Upper bound on tracked (outstanding) requests
    pub max_outstanding: usize,

    /// Maximum requests per group-submit call
    pub batch_limit: usize,

    /// Maximum completions delivered per wait
    pub max_events: usize,

    /// Completion wait timeout
    pub wait_timeout: Duration,

    /// How long shutdown keeps draining before abandoning requests
    pub shutdown_timeout: Duration,

    /// Progress report period (`None` disables)
    pub report_interval: Option<Duration>,

    /// Run bounds
    pub limits: RunLimits,

    /// Random seed (`None` seeds from OS entropy)
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_outstanding: DEFAULT_MAX_OUTSTANDING,
            batch_limit: DEFAULT_BATCH_LIMIT,
            max_events: DEFAULT_MAX_EVENTS,
            wait_timeout: Duration::from_micros(500),
            shutdown_timeout: Duration::from_secs(5),
            report_interval: Some(Duration::from_secs(1)),
            limits: RunLimits::unbounded(),
            seed: None,
        }
    }
}

impl EngineConfig {
    /// Low-latency configuration (small batches, shallow queue, short wait)
    #[must_use]
    pub fn low_latency() -> Self {
        Self {
            block_size: 4096,
            max_outstanding: 32,
            batch_limit: 8,
            max_events: 8,
            wait_timeout: Duration::from_micros(100),
            ..Self::default()
        }
    }

    /// Saturation configuration (deep queue, large batches)
    #[must_use]
    pub fn saturate() -> Self {
        Self {
            max_outstanding: 4096,
            batch_limit: 1024,
            max_events: 256,
            wait_timeout: Duration::from_millis(1),
            ..Self::default()
        }
    }

    /// Builder-style block size override.
    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Builder-style admission bound override.
    #[must_use]
    pub fn with_max_outstanding(mut self, max_outstanding: usize) -> Self {
        self.max_outstanding = max_outstanding;
        self
    }

    /// Builder-style batch limit override.
    #[must_use]
    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit;
        self
    }

    /// Builder-style run limits override.
    #[must_use]
    pub fn with_limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Builder-style seed override.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.block_size == 0 {
            return Err("block_size must be > 0");
        }
        if u32::try_from(self.block_size).is_err() {
            return Err("block_size must fit in 32 bits");
        }
        if self.max_outstanding == 0 {
            return Err("max_outstanding must be > 0");
        }
        if u32::try_from(self.max_outstanding).is_err() {
            return Err("max_outstanding must fit in 32 bits");
        }
        if self.batch_limit == 0 {
            return Err("batch_limit must be > 0");
        }
        if self.max_events == 0 {
            return Err("max_events must be > 0");
        }
        if self.wait_timeout.is_zero() {
            return Err("wait_timeout must be > 0");
        }
        Ok(())
    }
}
