//! Messages crossing the boundary to the compute unit.
//!
//! Requests are `{id, fn, args}` and responses `{id, result, error}`. Binary
//! arguments are moved into the request, so the caller's buffer is handed
//! over rather than copied.

use std::fmt;

use uuid::Uuid;

/// Identity of one loaded point collection at one buffer shape.
///
/// `generation` advances on every resize so responses computed for an older
/// shape no longer match even though the `id` is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatasetTag {
    pub id: Uuid,
    pub generation: u32,
}

impl DatasetTag {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            generation: 0,
        }
    }

    pub fn next_generation(self) -> Self {
        Self {
            id: self.id,
            generation: self.generation.wrapping_add(1),
        }
    }
}

impl Default for DatasetTag {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DatasetTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerFn {
    Init,
    DecodeFromBuffer,
    DecodeFromGeometry,
    DecodeFromSpz,
    Sort,
    ComputeBounds,
    Unregister,
}

impl WorkerFn {
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::DecodeFromBuffer => "decode-from-buffer",
            Self::DecodeFromGeometry => "decode-from-geometry",
            Self::DecodeFromSpz => "decode-from-spz",
            Self::Sort => "sort",
            Self::ComputeBounds => "compute-bounds",
            Self::Unregister => "unregister",
        }
    }
}

impl fmt::Display for WorkerFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Tag(DatasetTag),
    Id(Uuid),
    Count(u32),
    Scalar(f32),
    View([f32; 4]),
    Planes(Option<[[f32; 4]; 6]>),
    Bytes(Vec<u8>),
    Floats(Vec<f32>),
    Absent,
}

impl Arg {
    /// Size in bytes of a binary argument, `None` for scalars.
    pub fn transfer_len(&self) -> Option<usize> {
        match self {
            Self::Bytes(b) => Some(b.len()),
            Self::Floats(f) => Some(f.len() * std::mem::size_of::<f32>()),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Request {
    pub id: u64,
    pub func: WorkerFn,
    pub args: Vec<Arg>,
}

impl Request {
    /// Number of binary arguments and their total size.
    pub fn transferables(&self) -> (usize, usize) {
        self.args
            .iter()
            .filter_map(Arg::transfer_len)
            .fold((0, 0), |(n, bytes), len| (n + 1, bytes + len))
    }
}

/// Packed attribute texels for a contiguous run of points.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChunk {
    pub tag: DatasetTag,
    pub first_point: u32,
    pub count: u32,
    /// Replaces the whole dataset instead of appending at the load cursor.
    pub whole: bool,
    pub center_and_scale: Vec<f32>,
    pub rotation_and_color: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortRequest {
    pub tag: DatasetTag,
    pub view: [f32; 4],
    pub planes: Option<[[f32; 4]; 6]>,
    pub threshold: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortResult {
    pub tag: DatasetTag,
    pub indices: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Bounds {
    pub fn center(&self) -> [f32; 3] {
        [
            (self.min[0] + self.max[0]) * 0.5,
            (self.min[1] + self.max[1]) * 0.5,
            (self.min[2] + self.max[2]) * 0.5,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundsResult {
    pub tag: DatasetTag,
    pub bounds: Bounds,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Ready,
    Decoded(DecodedChunk),
    /// `None` tells the caller to skip: the dataset is unknown or superseded.
    Sorted(Option<SortResult>),
    Bounds(BoundsResult),
    Unregistered,
}

#[derive(Debug)]
pub struct Response {
    pub id: u64,
    pub result: Option<Payload>,
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: u64, payload: Payload) -> Self {
        Self {
            id,
            result: Some(payload),
            error: None,
        }
    }

    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(message.into()),
        }
    }
}

/// Everything the compute unit can report back.
#[derive(Debug)]
pub enum WorkerEvent {
    Message(Response),
    /// Hard failure: the unit is gone.
    Error(String),
    /// A message arrived that could not be understood; logged, not fatal.
    MessageError(String),
}
