use thiserror::Error;

use crate::worker::WorkerError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("no compute channel attached")]
    NoChannel,
    #[error("point count is zero")]
    EmptyDataset,
    #[error("chunk of {count} points at {first_point} overflows capacity {capacity}")]
    ChunkOverflow {
        first_point: u32,
        count: u32,
        capacity: u32,
    },
    #[error("chunk starts at point {first_point} but {loaded} points are loaded")]
    ChunkOutOfOrder { first_point: u32, loaded: u32 },
    #[error("attribute arrays disagree: {0}")]
    AttributeMismatch(String),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}
