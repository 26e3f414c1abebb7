//! Per-frame decision of whether a view-dependent resort is worth issuing.
//!
//! Two flags gate the decision: `is_sorting` (a sort is outstanding) and
//! `dirty` (data changed since the last sort). Requests are throttled to one
//! per `interval`, and keep flowing for `stable_window` after the view stops
//! changing so the final resting view gets an accurate order.

use std::time::{Duration, Instant};

use crate::math::Mat4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub stable_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            stable_window: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SortScheduler {
    config: SchedulerConfig,
    is_sorting: bool,
    dirty: bool,
    last_view: Option<Mat4>,
    last_sort: Option<Instant>,
    stable_since: Option<Instant>,
}

impl Default for SortScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl SortScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            is_sorting: false,
            dirty: true,
            last_view: None,
            last_sort: None,
            stable_since: None,
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.config.interval = interval;
    }

    pub fn set_stable_window(&mut self, stable_window: Duration) {
        self.config.stable_window = stable_window;
    }

    pub fn is_sorting(&self) -> bool {
        self.is_sorting
    }

    /// Must be called on every settlement path of a triggered sort, errors
    /// included; otherwise no further sort is ever triggered.
    pub fn finish_sort(&mut self) {
        self.is_sorting = false;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn last_view(&self) -> Option<&Mat4> {
        self.last_view.as_ref()
    }

    pub fn tick(&mut self, view: &Mat4, trigger: impl FnOnce()) -> bool {
        self.tick_at(Instant::now(), view, trigger)
    }

    /// Evaluates one frame at `now`. Returns whether `trigger` was invoked.
    pub fn tick_at(&mut self, now: Instant, view: &Mat4, trigger: impl FnOnce()) -> bool {
        let changed = self.last_view.as_ref() != Some(view);
        if changed || self.stable_since.is_none() {
            self.stable_since = Some(now);
        }

        let enough_interval = self
            .last_sort
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.interval);
        let within_stable_window = self
            .stable_since
            .map_or(true, |at| now.saturating_duration_since(at) < self.config.stable_window);

        let should_sort =
            !self.is_sorting && enough_interval && (self.dirty || changed || within_stable_window);

        if should_sort {
            self.is_sorting = true;
            self.dirty = false;
            self.last_sort = Some(now);
            trigger();
        }

        self.last_view = Some(*view);
        should_sort
    }
}
