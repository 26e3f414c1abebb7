//! Packed, texture-shaped attribute storage for one dataset.
//!
//! The store owns two texel buffers (`center_and_scale` as f32 RGBA,
//! `rotation_and_color` as u32 RGBA) laid out `width x height`, plus the draw
//! order. Decoding and sorting happen on the compute unit; results are only
//! applied when their dataset tag still matches.

mod error;
mod layout;

use std::collections::VecDeque;
use std::sync::Arc;

pub use error::StoreError;
pub use layout::{TexelRegion, TextureLayout};

use crate::math::Mat4;
use crate::splat::{unpack_texels, Splat, SplatAttributes, RECORD_SIZE, TEXEL_LANES};
use crate::worker::{
    Bounds, BoundsResult, DatasetTag, DecodedChunk, Pending, SortRequest, SortResult,
    WorkerChannel,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreConfig {
    /// Largest texture edge the renderer accepts.
    pub max_texture_size: u32,
    /// Points nearer than this view depth are not drawn.
    pub threshold: f32,
    pub frustum_culling: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_texture_size: 4096,
            threshold: -0.00001,
            frustum_culling: false,
        }
    }
}

/// Outcome of draining settled decode calls.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub applied: usize,
    pub errors: Vec<StoreError>,
    /// Set when a failed load dropped the queue; the point to resend from.
    pub rewound_to: Option<u32>,
}

pub struct SplatDataStore {
    config: StoreConfig,
    channel: Option<Arc<WorkerChannel>>,
    tag: DatasetTag,
    point_count: u32,
    layout: TextureLayout,
    center_and_scale: Vec<f32>,
    rotation_and_color: Vec<u32>,
    order: Vec<u32>,
    draw_count: u32,
    loaded: u32,
    dispatched: u32,
    loads: VecDeque<Pending<DecodedChunk>>,
    dirty_regions: Vec<TexelRegion>,
    needs_resort: bool,
    bounds: Option<Bounds>,
    bounds_request: Option<Pending<BoundsResult>>,
}

impl SplatDataStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            channel: None,
            tag: DatasetTag::new(),
            point_count: 0,
            layout: TextureLayout::default(),
            center_and_scale: Vec::new(),
            rotation_and_color: Vec::new(),
            order: Vec::new(),
            draw_count: 0,
            loaded: 0,
            dispatched: 0,
            loads: VecDeque::new(),
            dirty_regions: Vec::new(),
            needs_resort: false,
            bounds: None,
            bounds_request: None,
        }
    }

    pub fn with_channel(config: StoreConfig, channel: Arc<WorkerChannel>) -> Self {
        let mut store = Self::new(config);
        store.set_channel(Some(channel));
        store
    }

    /// Attaches (or detaches) the compute channel. Attaching sends `init`
    /// without waiting; requests queue behind it on the unit.
    pub fn set_channel(&mut self, channel: Option<Arc<WorkerChannel>>) {
        if let Some(channel) = &channel {
            drop(channel.init());
        }
        self.channel = channel;
    }

    pub fn channel(&self) -> Option<&Arc<WorkerChannel>> {
        self.channel.as_ref()
    }

    /// The attached channel, re-sending `init` first if an earlier one
    /// failed or timed out. A pending `init` is shared, not repeated.
    fn require_channel(&self, operation: &str) -> Result<Arc<WorkerChannel>, StoreError> {
        match &self.channel {
            Some(channel) => {
                if !channel.is_ready() {
                    drop(channel.init());
                }
                Ok(channel.clone())
            }
            None => {
                log::warn!("{operation} skipped: no compute channel attached");
                Err(StoreError::NoChannel)
            }
        }
    }

    fn require_points(&self, operation: &str) -> Result<(), StoreError> {
        if self.point_count == 0 {
            log::warn!("{operation} skipped: point count is zero");
            return Err(StoreError::EmptyDataset);
        }
        Ok(())
    }

    pub fn max_points(&self) -> u32 {
        let edge = self.config.max_texture_size as u64;
        (edge * edge).min(u32::MAX as u64) as u32
    }

    /// Resizes the buffers for `n` points. Contents are discarded and the
    /// dataset generation advances, so in-flight responses become stale.
    pub fn set_point_count(&mut self, n: u32) {
        let max = self.max_points();
        let n = if n > max {
            log::warn!("point count {n} clamped to {max}");
            max
        } else {
            n
        };
        if n == self.point_count {
            return;
        }

        self.layout = TextureLayout::for_points(n, self.config.max_texture_size);
        let capacity = self.layout.capacity();
        self.point_count = n;
        self.center_and_scale = vec![0.0; capacity * TEXEL_LANES];
        self.rotation_and_color = vec![0; capacity * TEXEL_LANES];
        self.order = vec![0; capacity];
        self.draw_count = 0;
        self.loaded = 0;
        self.dispatched = 0;
        self.loads.clear();
        self.dirty_regions.clear();
        self.bounds = None;
        self.bounds_request = None;
        self.tag = self.tag.next_generation();
        log::debug!(
            "resized dataset {} to {n} points ({}x{})",
            self.tag,
            self.layout.width,
            self.layout.height
        );
    }

    /// Decodes a whole `.splat` buffer into the store. Records past the
    /// point count are dropped.
    pub fn load_raw(&mut self, mut bytes: Vec<u8>) -> Result<(), StoreError> {
        let channel = self.require_channel("load_raw")?;
        self.require_points("load_raw")?;
        let count = record_count(&bytes)?;
        if count > self.point_count {
            log::warn!("buffer of {count} points truncated to {}", self.point_count);
            bytes.truncate(self.point_count as usize * RECORD_SIZE);
        }
        self.loads.clear();
        self.dispatched = count.min(self.point_count);
        self.loads
            .push_back(channel.decode_buffer(self.tag, bytes, self.point_count, 0, true));
        Ok(())
    }

    /// Decodes the next run of `.splat` records, placed after everything
    /// dispatched so far. Returns the first point index of the run. Records
    /// that do not fit are dropped; a run with none left is not sent.
    pub fn load_raw_chunk(&mut self, mut bytes: Vec<u8>) -> Result<u32, StoreError> {
        let channel = self.require_channel("load_raw_chunk")?;
        self.require_points("load_raw_chunk")?;
        let count = record_count(&bytes)?;
        let first_point = self.dispatched;
        let room = self.point_count - first_point;
        if count > room {
            log::warn!(
                "chunk at {first_point} truncated from {count} to {room} points (capacity {})",
                self.point_count
            );
            bytes.truncate(room as usize * RECORD_SIZE);
        }
        if bytes.is_empty() {
            return Ok(first_point);
        }
        self.dispatched += count.min(room);
        self.loads.push_back(channel.decode_buffer(
            self.tag,
            bytes,
            self.point_count,
            first_point,
            false,
        ));
        Ok(first_point)
    }

    /// Decodes typed attribute arrays; `alphas` selects the compressed path.
    /// Points past the point count are dropped.
    pub fn load_from_attributes(&mut self, mut attributes: SplatAttributes) -> Result<(), StoreError> {
        let channel = self.require_channel("load_from_attributes")?;
        self.require_points("load_from_attributes")?;
        let n = attributes.validate().map_err(StoreError::AttributeMismatch)?;
        let capacity = self.point_count as usize;
        if n < capacity {
            return Err(StoreError::AttributeMismatch(format!(
                "{n} points supplied for a dataset of {capacity}"
            )));
        }
        if n > capacity {
            log::warn!("{n} supplied points truncated to {capacity}");
            attributes.truncate(capacity);
        }
        self.loads.clear();
        self.dispatched = self.point_count;
        self.loads.push_back(channel.decode_attributes(self.tag, attributes));
        Ok(())
    }

    /// Where the next chunk will be placed. Rewinds to [`Self::loaded`]
    /// after a failed load so the caller can resend from there.
    pub fn dispatched(&self) -> u32 {
        self.dispatched
    }

    pub fn pending_loads(&self) -> usize {
        self.loads.len()
    }

    /// Applies settled decode calls in the order they were issued. Stops at
    /// the first call still in flight. A failed call drops every load queued
    /// behind it and rewinds the dispatch cursor to the loaded prefix.
    pub fn poll_loads(&mut self) -> LoadReport {
        let mut report = LoadReport::default();
        while let Some(front) = self.loads.front_mut() {
            let Some(outcome) = front.try_take() else {
                break;
            };
            self.loads.pop_front();
            let result = outcome
                .map_err(StoreError::from)
                .and_then(|chunk| self.load_from_decoded(&chunk));
            match result {
                Ok(true) => report.applied += 1,
                Ok(false) => {}
                Err(err) => {
                    log::warn!("load failed, resending from point {}: {err}", self.loaded);
                    report.errors.push(err);
                    self.loads.clear();
                    self.dispatched = self.loaded;
                    report.rewound_to = Some(self.loaded);
                }
            }
        }
        report
    }

    /// Copies a decoded chunk into the texel buffers. Returns `Ok(false)` for
    /// a chunk of another dataset or generation, which is dropped untouched.
    pub fn load_from_decoded(&mut self, chunk: &DecodedChunk) -> Result<bool, StoreError> {
        if chunk.tag != self.tag {
            log::debug!("dropping stale chunk for {} (current {})", chunk.tag, self.tag);
            return Ok(false);
        }
        let lanes = chunk.count as usize * TEXEL_LANES;
        if chunk.center_and_scale.len() != lanes || chunk.rotation_and_color.len() != lanes {
            return Err(StoreError::AttributeMismatch(format!(
                "chunk of {} points carries {} float and {} integer lanes",
                chunk.count,
                chunk.center_and_scale.len(),
                chunk.rotation_and_color.len()
            )));
        }
        let expected = if chunk.whole { 0 } else { self.loaded };
        if chunk.first_point != expected {
            return Err(StoreError::ChunkOutOfOrder {
                first_point: chunk.first_point,
                loaded: expected,
            });
        }
        if chunk.first_point as u64 + chunk.count as u64 > self.point_count as u64 {
            return Err(StoreError::ChunkOverflow {
                first_point: chunk.first_point,
                count: chunk.count,
                capacity: self.point_count,
            });
        }

        for region in self.layout.regions(chunk.first_point, chunk.count) {
            for row in region.y..region.y + region.height {
                let texel = (row * self.layout.width + region.x) as usize;
                let src = (texel - chunk.first_point as usize) * TEXEL_LANES;
                let len = region.width as usize * TEXEL_LANES;
                let dst = texel * TEXEL_LANES;
                self.center_and_scale[dst..dst + len]
                    .copy_from_slice(&chunk.center_and_scale[src..src + len]);
                self.rotation_and_color[dst..dst + len]
                    .copy_from_slice(&chunk.rotation_and_color[src..src + len]);
            }
            self.dirty_regions.push(region);
        }

        self.loaded = chunk.first_point + chunk.count;
        self.needs_resort = true;
        Ok(true)
    }

    /// Sends a sort for `model_view`. With culling enabled and a projection
    /// supplied, frustum planes are sent in object space.
    pub fn request_sort(
        &self,
        model_view: &Mat4,
        projection: Option<&Mat4>,
    ) -> Result<Pending<Option<SortResult>>, StoreError> {
        let channel = self.require_channel("sort")?;
        self.require_points("sort")?;
        let planes = match projection {
            Some(projection) if self.config.frustum_culling => {
                Some(projection.mul_mat(model_view).frustum_planes())
            }
            _ => None,
        };
        Ok(channel.sort(SortRequest {
            tag: self.tag,
            view: model_view.row(2),
            planes,
            threshold: self.config.threshold,
        }))
    }

    /// Installs a draw order. Skips (returning false) on an empty result or
    /// a tag mismatch, leaving the current order as it was.
    pub fn apply_sort_result(&mut self, result: Option<SortResult>) -> bool {
        let Some(result) = result else {
            return false;
        };
        if result.tag != self.tag {
            log::debug!("dropping stale sort for {} (current {})", result.tag, self.tag);
            return false;
        }
        if result.indices.len() > self.order.len() {
            log::warn!(
                "sort returned {} indices for capacity {}",
                result.indices.len(),
                self.order.len()
            );
            return false;
        }
        self.order[..result.indices.len()].copy_from_slice(&result.indices);
        self.draw_count = result.indices.len() as u32;
        true
    }

    /// Bounding box of the loaded centres. The first call issues one request;
    /// later calls poll it and then return the memoised value.
    pub fn compute_bounds(&mut self) -> Option<Bounds> {
        if self.bounds.is_some() {
            return self.bounds;
        }
        if let Some(request) = &mut self.bounds_request {
            match request.try_take() {
                None => return None,
                Some(Ok(result)) => {
                    self.bounds_request = None;
                    if result.tag == self.tag {
                        self.bounds = Some(result.bounds);
                    }
                    return self.bounds;
                }
                Some(Err(err)) => {
                    log::warn!("bounds request failed: {err}");
                    self.bounds_request = None;
                    return None;
                }
            }
        }
        if self.loaded == 0 {
            return None;
        }
        let channel = self.require_channel("compute_bounds").ok()?;
        self.bounds_request = Some(channel.compute_bounds(self.tag));
        None
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    pub fn tag(&self) -> DatasetTag {
        self.tag
    }

    pub fn point_count(&self) -> u32 {
        self.point_count
    }

    pub fn layout(&self) -> TextureLayout {
        self.layout
    }

    pub fn loaded(&self) -> u32 {
        self.loaded
    }

    pub fn draw_count(&self) -> u32 {
        self.draw_count
    }

    pub fn center_and_scale(&self) -> &[f32] {
        &self.center_and_scale
    }

    pub fn rotation_and_color(&self) -> &[u32] {
        &self.rotation_and_color
    }

    /// Active draw order, `draw_count` long.
    pub fn order(&self) -> &[u32] {
        &self.order[..self.draw_count as usize]
    }

    pub fn center_and_scale_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.center_and_scale)
    }

    pub fn rotation_and_color_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.rotation_and_color)
    }

    pub fn order_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.order)
    }

    /// Reads point `index` back from the texel buffers.
    pub fn splat(&self, index: u32) -> Option<Splat> {
        if index >= self.loaded {
            return None;
        }
        let at = index as usize * TEXEL_LANES;
        Some(unpack_texels(
            &self.center_and_scale[at..at + TEXEL_LANES],
            &self.rotation_and_color[at..at + TEXEL_LANES],
        ))
    }

    /// Texel rectangles written since the last call.
    pub fn take_dirty_regions(&mut self) -> Vec<TexelRegion> {
        std::mem::take(&mut self.dirty_regions)
    }

    /// True once after any change that invalidates the draw order.
    pub fn take_needs_resort(&mut self) -> bool {
        std::mem::take(&mut self.needs_resort)
    }

    pub fn threshold(&self) -> f32 {
        self.config.threshold
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        if threshold != self.config.threshold {
            self.config.threshold = threshold;
            self.needs_resort = true;
        }
    }

    pub fn frustum_culling(&self) -> bool {
        self.config.frustum_culling
    }

    pub fn set_frustum_culling(&mut self, enabled: bool) {
        if enabled != self.config.frustum_culling {
            self.config.frustum_culling = enabled;
            self.needs_resort = true;
        }
    }

    /// Releases the buffers and asks the unit to forget this dataset.
    pub fn dispose(&mut self) {
        if let Some(channel) = self.channel.take() {
            drop(channel.unregister(self.tag.id));
        }
        self.loads.clear();
        self.bounds_request = None;
        self.center_and_scale = Vec::new();
        self.rotation_and_color = Vec::new();
        self.order = Vec::new();
        self.layout = TextureLayout::default();
        self.point_count = 0;
        self.draw_count = 0;
        self.loaded = 0;
        self.dispatched = 0;
    }
}

impl Drop for SplatDataStore {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn record_count(bytes: &[u8]) -> Result<u32, StoreError> {
    if bytes.len() % RECORD_SIZE != 0 {
        return Err(StoreError::AttributeMismatch(format!(
            "buffer of {} bytes is not a whole number of {RECORD_SIZE}-byte records",
            bytes.len()
        )));
    }
    Ok((bytes.len() / RECORD_SIZE) as u32)
}

#[cfg(test)]
mod tests;
