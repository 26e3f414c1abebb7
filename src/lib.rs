//! Streaming pipeline for Gaussian splat datasets.
//!
//! Point data is decoded and view-sorted on a background compute unit reached
//! through [`worker::WorkerChannel`]. [`store::SplatDataStore`] keeps the
//! packed, texture-shaped buffers for one dataset, [`scheduler::SortScheduler`]
//! decides when a re-sort is worth issuing, and [`frame::FrameOrchestrator`]
//! ties them together once per rendered frame.

pub mod camera;
pub mod demo;
pub mod frame;
pub mod math;
pub mod parser;
pub mod scheduler;
pub mod sort;
pub mod splat;
pub mod store;
pub mod worker;

pub use frame::{FrameHook, FrameInput, FrameOrchestrator, FrameStats, FrameUniforms};
pub use scheduler::{SchedulerConfig, SortScheduler};
pub use store::{SplatDataStore, StoreConfig, StoreError};
pub use worker::{ChannelConfig, WorkerChannel, WorkerError};
