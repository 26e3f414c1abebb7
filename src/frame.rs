//! Per-frame glue between the host renderer, the sort scheduler and the
//! data store. Nothing here blocks: results are picked up on a later frame.

use std::time::Instant;

use crate::math::Mat4;
use crate::scheduler::{SchedulerConfig, SortScheduler};
use crate::store::{SplatDataStore, StoreError};
use crate::worker::{Pending, SortResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInput {
    /// Camera-from-object transform.
    pub model_view: Mat4,
    /// Only consulted when frustum culling is on.
    pub projection: Option<Mat4>,
    /// Viewport size in pixels.
    pub viewport: [f32; 2],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameUniforms {
    pub model_view: Mat4,
    /// Third row of `model_view`; dotted with a centre it gives view-space z.
    pub view_vector: [f32; 4],
    pub viewport: [f32; 2],
    pub draw_count: u32,
}

/// What a host scene node calls once per drawn frame.
pub trait FrameHook {
    fn update_frame(&mut self, input: &FrameInput) -> FrameUniforms;
    fn dispose(&mut self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames: u64,
    pub sorts_issued: u64,
    pub sorts_applied: u64,
    pub sorts_skipped: u64,
    pub sorts_failed: u64,
    pub chunks_applied: u64,
    pub load_errors: u64,
}

pub struct FrameOrchestrator {
    store: SplatDataStore,
    scheduler: SortScheduler,
    sort: Option<Pending<Option<SortResult>>>,
    stats: FrameStats,
}

impl FrameOrchestrator {
    pub fn new(store: SplatDataStore, config: SchedulerConfig) -> Self {
        Self {
            store,
            scheduler: SortScheduler::new(config),
            sort: None,
            stats: FrameStats::default(),
        }
    }

    pub fn store(&self) -> &SplatDataStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SplatDataStore {
        &mut self.store
    }

    pub fn scheduler(&self) -> &SortScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut SortScheduler {
        &mut self.scheduler
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    fn poll_sort(&mut self) {
        let Some(pending) = &mut self.sort else {
            return;
        };
        let Some(outcome) = pending.try_take() else {
            return;
        };
        self.sort = None;
        match outcome {
            Ok(result) => {
                if self.store.apply_sort_result(result) {
                    self.stats.sorts_applied += 1;
                } else {
                    self.stats.sorts_skipped += 1;
                }
            }
            Err(err) => {
                log::warn!("sort failed: {err}");
                self.stats.sorts_failed += 1;
            }
        }
        self.scheduler.finish_sort();
    }

    pub fn update_frame_at(&mut self, now: Instant, input: &FrameInput) -> FrameUniforms {
        self.stats.frames += 1;

        let report = self.store.poll_loads();
        self.stats.chunks_applied += report.applied as u64;
        self.stats.load_errors += report.errors.len() as u64;
        if self.store.take_needs_resort() {
            self.scheduler.mark_dirty();
        }

        self.poll_sort();

        let mut triggered = false;
        self.scheduler.tick_at(now, &input.model_view, || triggered = true);
        if triggered {
            match self.store.request_sort(&input.model_view, input.projection.as_ref()) {
                Ok(pending) => {
                    self.sort = Some(pending);
                    self.stats.sorts_issued += 1;
                }
                Err(err) => {
                    if !matches!(err, StoreError::NoChannel | StoreError::EmptyDataset) {
                        log::warn!("sort not issued: {err}");
                    }
                    self.scheduler.finish_sort();
                }
            }
        }

        let store = &mut self.store;
        if store.pending_loads() == 0 && store.loaded() > 0 && store.loaded() == store.point_count() {
            store.compute_bounds();
        }

        FrameUniforms {
            model_view: input.model_view,
            view_vector: input.model_view.row(2),
            viewport: input.viewport,
            draw_count: self.store.draw_count(),
        }
    }
}

impl FrameHook for FrameOrchestrator {
    fn update_frame(&mut self, input: &FrameInput) -> FrameUniforms {
        self.update_frame_at(Instant::now(), input)
    }

    fn dispose(&mut self) {
        self.sort = None;
        self.store.dispose();
    }
}
