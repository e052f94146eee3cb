//! Pipeline tuning knobs.

use std::time::Duration;

use crate::chunker::{Chunker, DEFAULT_BOUNDARY_WINDOW, DEFAULT_MAX_CHARS};
use crate::generation::Criticality;

/// Per-attempt timeouts for content generation, by who is waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Metadata and module 0, while the caller of `create` is blocked.
    pub fast_path: Duration,
    /// A caller blocked on a module that was not ready.
    pub on_demand: Duration,
    /// Background fan-out; nobody is waiting.
    pub background: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            fast_path: Duration::from_secs(4),
            on_demand: Duration::from_secs(45),
            background: Duration::from_secs(180),
        }
    }
}

impl Timeouts {
    pub fn for_criticality(&self, criticality: Criticality) -> Duration {
        match criticality {
            Criticality::FastPath => self.fast_path,
            Criticality::OnDemand => self.on_demand,
            Criticality::Background => self.background,
        }
    }
}

/// Exponential backoff for transient upstream failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let delay = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub chunk_max_chars: usize,
    pub chunk_boundary_window: usize,
    pub timeouts: Timeouts,
    /// Overall budget for `create`: metadata plus module 0.
    pub fast_path_budget: Duration,
    pub retry: RetryPolicy,
    /// Background module builds running at once, across all courses.
    pub background_concurrency: usize,
    /// Schedule the background fan-out as part of `create`.
    pub eager_background: bool,
    pub max_modules: usize,
    /// Timeout for video search during a module build.
    pub resource_timeout: Duration,
    pub max_videos: usize,
    pub progress_capacity: usize,
    /// Ceiling for the bundled in-memory key-value store.
    pub cache_memory_bytes: usize,
    /// Finished courses kept in memory before idle ones are dropped; they
    /// reload from the course store when asked for again.
    pub max_resident_courses: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_max_chars: DEFAULT_MAX_CHARS,
            chunk_boundary_window: DEFAULT_BOUNDARY_WINDOW,
            timeouts: Timeouts::default(),
            fast_path_budget: Duration::from_secs(8),
            retry: RetryPolicy::default(),
            background_concurrency: 3,
            eager_background: true,
            max_modules: 15,
            resource_timeout: Duration::from_secs(5),
            max_videos: 3,
            progress_capacity: 256,
            cache_memory_bytes: 64 * 1024 * 1024,
            max_resident_courses: 1024,
        }
    }
}

impl PipelineConfig {
    pub fn chunker(&self) -> Chunker {
        Chunker::new(self.chunk_max_chars, self.chunk_boundary_window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(30), Duration::from_secs(5));
    }

    #[test]
    fn timeouts_are_ordered_by_urgency() {
        let t = Timeouts::default();
        assert!(t.for_criticality(Criticality::FastPath) < t.for_criticality(Criticality::OnDemand));
        assert!(t.for_criticality(Criticality::OnDemand) < t.for_criticality(Criticality::Background));
    }
}
