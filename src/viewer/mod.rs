mod hud;

use std::io::Write;
use std::sync::mpsc::TryRecvError;
use std::time::{Duration, Instant};

use crossterm::terminal;
use splatflow::camera::{self, Camera};
use splatflow::math::Vec3;
use splatflow::parser::dot_splat::SplatChunks;
use splatflow::splat::SplatAttributes;
use splatflow::{FrameInput, FrameOrchestrator, FrameUniforms};

use crate::input::{action_for, Action, InputMessage, InputReceiver};
use crate::AppResult;

pub const FRAME_TARGET: Duration = Duration::from_millis(16);
const HEADLESS_VIEWPORT: [f32; 2] = [1280.0, 720.0];
const MAX_LOADS_IN_FLIGHT: usize = 2;
const ORBIT_SPEED: f32 = 0.35;

/// Where point data comes from.
pub enum Source {
    /// `.splat` records, fed a chunk at a time.
    Stream(SplatChunks),
    /// Whole attribute arrays, kept so a failed load can be resent.
    Attributes(SplatAttributes),
}

impl Source {
    pub fn point_count(&self) -> u32 {
        match self {
            Self::Stream(chunks) => chunks.point_count(),
            Self::Attributes(attributes) => attributes.len() as u32,
        }
    }
}

pub struct Viewer {
    orchestrator: FrameOrchestrator,
    camera: Camera,
    source: Source,
    framed: bool,
    auto_orbit: bool,
    show_hud: bool,
    use_truecolor: bool,
    fps: f32,
    last_frame: Instant,
    last_input: Option<FrameInput>,
    last_uniforms: Option<FrameUniforms>,
    hud_buf: String,
}

impl Viewer {
    pub fn new(orchestrator: FrameOrchestrator, source: Source, use_truecolor: bool) -> Self {
        Self {
            orchestrator,
            camera: Camera::new(Vec3::ZERO, 5.0),
            source,
            framed: false,
            auto_orbit: true,
            show_hud: true,
            use_truecolor,
            fps: 0.0,
            last_frame: Instant::now(),
            last_input: None,
            last_uniforms: None,
            hud_buf: String::with_capacity(256),
        }
    }

    /// Keeps the decode queue topped up without flooding the compute unit.
    /// After a failed load the store rewinds, and sending resumes from there.
    fn feed(&mut self) -> AppResult<()> {
        let store = self.orchestrator.store_mut();
        if store.dispatched() >= store.point_count() {
            return Ok(());
        }
        match &mut self.source {
            Source::Stream(chunks) => {
                if chunks.next_point() != store.dispatched() {
                    chunks.seek_to(store.dispatched())?;
                }
                while store.pending_loads() < MAX_LOADS_IN_FLIGHT && store.dispatched() < store.point_count() {
                    let Some(chunk) = chunks.next() else {
                        break;
                    };
                    store.load_raw_chunk(chunk?)?;
                }
            }
            Source::Attributes(attributes) => {
                if store.pending_loads() == 0 {
                    store.load_from_attributes(attributes.clone())?;
                }
            }
        }
        Ok(())
    }

    /// Returns true when the viewer should exit.
    fn apply(&mut self, action: Action) -> bool {
        match action {
            Action::Quit => return true,
            Action::Orbit { yaw, pitch } => camera::orbit(&mut self.camera, yaw, pitch),
            Action::Zoom(factor) => camera::zoom(&mut self.camera, factor),
            Action::ToggleHud => self.show_hud = !self.show_hud,
            Action::ToggleAutoOrbit => self.auto_orbit = !self.auto_orbit,
            Action::ToggleCulling => {
                let store = self.orchestrator.store_mut();
                let enabled = !store.frustum_culling();
                store.set_frustum_culling(enabled);
            }
            Action::Reframe => {
                camera::reset(&mut self.camera);
                self.framed = false;
            }
        }
        false
    }

    pub fn step(&mut self, now: Instant, viewport: [f32; 2]) -> AppResult<FrameUniforms> {
        let delta_time = now
            .saturating_duration_since(self.last_frame)
            .as_secs_f32()
            .max(1e-6);
        self.last_frame = now;

        self.feed()?;
        if self.auto_orbit {
            camera::orbit(&mut self.camera, ORBIT_SPEED * delta_time, 0.0);
        }
        if !self.framed {
            if let Some(bounds) = self.orchestrator.store().bounds() {
                self.camera.frame_bounds(&bounds);
                self.framed = true;
            }
        }

        let input = FrameInput {
            model_view: self.camera.view_matrix(),
            projection: Some(self.camera.projection(viewport[0], viewport[1])),
            viewport,
        };
        let uniforms = self.orchestrator.update_frame_at(now, &input);
        self.last_input = Some(input);
        self.last_uniforms = Some(uniforms);

        let instant_fps = 1.0 / delta_time;
        self.fps = if self.fps <= 0.01 {
            instant_fps
        } else {
            0.90 * self.fps + 0.10 * instant_fps
        };
        Ok(uniforms)
    }

    pub fn summary(&self) -> String {
        let store = self.orchestrator.store();
        let stats = self.orchestrator.stats();
        let layout = store.layout();
        let bounds = match store.bounds() {
            Some(b) => format!(
                "[{:.2} {:.2} {:.2}]..[{:.2} {:.2} {:.2}]",
                b.min[0], b.min[1], b.min[2], b.max[0], b.max[1], b.max[2]
            ),
            None => "pending".to_string(),
        };
        format!(
            "frames={} points={}/{} texture={}x{} draw={} sorts: issued={} applied={} skipped={} failed={} chunks={} load_errors={} bounds={}",
            stats.frames,
            store.loaded(),
            store.point_count(),
            layout.width,
            layout.height,
            store.draw_count(),
            stats.sorts_issued,
            stats.sorts_applied,
            stats.sorts_skipped,
            stats.sorts_failed,
            stats.chunks_applied,
            stats.load_errors,
            bounds
        )
    }
}

fn pace(frame_start: Instant) {
    let spent = frame_start.elapsed();
    if spent < FRAME_TARGET {
        std::thread::sleep(FRAME_TARGET - spent);
    }
}

/// Drives `frames` frames without a terminal and prints a one-line summary.
pub fn run_headless(viewer: &mut Viewer, frames: u64, out: &mut impl Write) -> AppResult<()> {
    for _ in 0..frames {
        let frame_start = Instant::now();
        viewer.step(frame_start, HEADLESS_VIEWPORT)?;
        pace(frame_start);
    }
    writeln!(out, "{}", viewer.summary())?;
    Ok(())
}

pub fn run_terminal(viewer: &mut Viewer, input_rx: &InputReceiver, stdout: &mut impl Write) -> AppResult<()> {
    loop {
        let frame_start = Instant::now();

        loop {
            match input_rx.try_recv() {
                Ok(InputMessage::Event(event)) => {
                    if let Some(action) = action_for(&event) {
                        if viewer.apply(action) {
                            return Ok(());
                        }
                    }
                }
                Ok(InputMessage::ReadError(err)) => return Err(err.into()),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }

        let (cols, rows) = terminal::size()?;
        // Terminal cells are roughly twice as tall as they are wide.
        let viewport = [cols.max(1) as f32, rows.max(1) as f32 * 2.0];
        viewer.step(frame_start, viewport)?;
        hud::draw(viewer, cols, rows, stdout)?;

        pace(frame_start);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use splatflow::demo::generate_demo_splats;
    use splatflow::worker::{BootstrapStrategy, ChannelConfig, WorkerChannel};
    use splatflow::{SchedulerConfig, SplatDataStore, StoreConfig};

    use super::*;

    #[test]
    fn headless_run_loads_sorts_and_frames_the_scene() {
        let splats = generate_demo_splats(&mut StdRng::seed_from_u64(3), 600);
        let channel = Arc::new(WorkerChannel::new(ChannelConfig {
            strategy: Some(BootstrapStrategy::DedicatedThread),
            pool_threads: Some(2),
            ..ChannelConfig::default()
        }));
        let mut store = SplatDataStore::with_channel(StoreConfig::default(), channel);
        let source = Source::Attributes(SplatAttributes::from_splats(&splats));
        store.set_point_count(source.point_count());
        let orchestrator = FrameOrchestrator::new(store, SchedulerConfig::default());
        let mut viewer = Viewer::new(orchestrator, source, false);

        let mut out = Vec::new();
        run_headless(&mut viewer, 60, &mut out).unwrap();
        let line = String::from_utf8(out).unwrap();
        assert!(line.starts_with("frames=60 points=600/600"), "{line}");
        assert!(viewer.orchestrator.store().draw_count() > 0);
        assert!(viewer.framed);
    }

    #[test]
    fn scene_larger_than_the_texture_loads_its_first_points() {
        let splats = generate_demo_splats(&mut StdRng::seed_from_u64(5), 600);
        let channel = Arc::new(WorkerChannel::new(ChannelConfig {
            strategy: Some(BootstrapStrategy::DedicatedThread),
            pool_threads: Some(1),
            ..ChannelConfig::default()
        }));
        let config = StoreConfig {
            max_texture_size: 16,
            ..StoreConfig::default()
        };
        let mut store = SplatDataStore::with_channel(config, channel);
        let source = Source::Attributes(SplatAttributes::from_splats(&splats));
        store.set_point_count(source.point_count());
        let orchestrator = FrameOrchestrator::new(store, SchedulerConfig::default());
        let mut viewer = Viewer::new(orchestrator, source, false);

        let mut out = Vec::new();
        run_headless(&mut viewer, 30, &mut out).unwrap();
        let line = String::from_utf8(out).unwrap();
        assert!(line.starts_with("frames=30 points=256/256"), "{line}");
        assert!(line.contains("load_errors=0"), "{line}");
    }

    #[test]
    fn actions_update_viewer_state() {
        let store = SplatDataStore::new(StoreConfig::default());
        let orchestrator = FrameOrchestrator::new(store, SchedulerConfig::default());
        let mut viewer = Viewer::new(orchestrator, Source::Attributes(SplatAttributes::default()), false);
        assert!(!viewer.apply(Action::ToggleCulling));
        assert!(viewer.orchestrator.store().frustum_culling());
        assert!(!viewer.apply(Action::ToggleAutoOrbit));
        assert!(!viewer.auto_orbit);
        assert!(viewer.apply(Action::Quit));
    }
}
