//! Tuning knobs for the engine, the worker loop and the TTL sweeper.

use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Rerun policy
// ---------------------------------------------------------------------------

/// How many times a fizzled firework is put back to WAITING automatically.
///
/// A node's `_max_reruns` spec key overrides the engine-wide limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RerunPolicy {
    /// 0 means reruns are manual only.
    pub max_auto_reruns: u32,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// A launch RESERVED longer than this without starting is reverted.
    pub reservation_ttl: Duration,
    /// A RUNNING launch without a heartbeat for this long is fizzled.
    pub lostrun_ttl: Duration,
    /// Candidates tried per claim when other workers win the race.
    pub claim_retries: u32,
    pub rerun: RerunPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::from_secs(14 * 24 * 3600),
            lostrun_ttl: Duration::from_secs(4 * 3600),
            claim_retries: 8,
            rerun: RerunPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Task pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Times a `Retryable` task error is retried in place.
    pub task_retries: u32,
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            task_retries: 0,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

// ---------------------------------------------------------------------------
// Rocket (worker loop)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RocketConfig {
    /// Each launch runs in `launch_root/launcher_<launch_id>`.
    pub launch_root: PathBuf,
    /// Heartbeat period while tasks run.
    pub ping_interval: Duration,
    /// Sleep between polls when no work is available.
    pub idle_sleep: Duration,
    pub pipeline: PipelineConfig,
}

impl Default for RocketConfig {
    fn default() -> Self {
        Self {
            launch_root: PathBuf::from("."),
            ping_interval: Duration::from_secs(60),
            idle_sleep: Duration::from_secs(5),
            pipeline: PipelineConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sweeper
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Convert a std duration to chrono, saturating at chrono's range.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
