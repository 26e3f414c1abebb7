//! The built-in compute unit body: format decoding, view sorting and bounds.
//!
//! Every decode also records point centres per dataset, so later `sort` and
//! `compute-bounds` requests carry nothing but the dataset tag.

use std::collections::HashMap;

use rayon::prelude::*;
use uuid::Uuid;

use super::bootstrap::Kernel;
use super::protocol::{
    Arg, Bounds, BoundsResult, DatasetTag, DecodedChunk, Payload, SortResult, WorkerFn,
};
use crate::math::{quat_normalize, Vec3};
use crate::sort::depth_order;
use crate::splat::{decode_record, pack_texels, Splat, RECORD_SIZE, TEXEL_LANES};

type KernelResult<T> = Result<T, String>;

struct Registration {
    generation: u32,
    centers: Vec<f32>,
    loaded: usize,
}

pub struct SplatKernel {
    threads: Option<usize>,
    pool: Option<rayon::ThreadPool>,
    registry: HashMap<Uuid, Registration>,
}

impl SplatKernel {
    /// `threads` sizes the pool built by `init`; `None` lets rayon decide.
    pub fn new(threads: Option<usize>) -> Self {
        Self {
            threads,
            pool: None,
            registry: HashMap::new(),
        }
    }

    pub fn registered(&self) -> usize {
        self.registry.len()
    }

    fn init(&mut self) -> KernelResult<Payload> {
        if self.pool.is_some() {
            return Ok(Payload::Ready);
        }
        let mut builder = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("splat-kernel-{i}"));
        if let Some(n) = self.threads {
            builder = builder.num_threads(n.max(1));
        }
        let pool = builder
            .build()
            .map_err(|e| format!("failed to build compute pool: {e}"))?;
        log::debug!("compute pool ready with {} threads", pool.current_num_threads());
        self.pool = Some(pool);
        Ok(Payload::Ready)
    }

    fn pool(&self) -> KernelResult<&rayon::ThreadPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| "compute unit not initialised".to_string())
    }

    /// Packs `count` splats produced by `decode` into texels in parallel and
    /// records their centres for the dataset.
    fn pack<F>(
        &mut self,
        tag: DatasetTag,
        total: u32,
        first_point: u32,
        count: usize,
        whole: bool,
        decode: F,
    ) -> KernelResult<Payload>
    where
        F: Fn(usize) -> Splat + Sync,
    {
        let end = first_point as usize + count;
        if end > total as usize {
            return Err(format!(
                "chunk [{first_point}, {end}) exceeds dataset of {total} points"
            ));
        }

        let mut center_and_scale = vec![0.0_f32; count * TEXEL_LANES];
        let mut rotation_and_color = vec![0_u32; count * TEXEL_LANES];
        self.pool()?.install(|| {
            center_and_scale
                .par_chunks_exact_mut(TEXEL_LANES)
                .zip(rotation_and_color.par_chunks_exact_mut(TEXEL_LANES))
                .enumerate()
                .for_each(|(i, (cs, rc))| {
                    let (a, b) = pack_texels(&decode(i));
                    cs.copy_from_slice(&a);
                    rc.copy_from_slice(&b);
                });
        });

        let reg = self.registry.entry(tag.id).or_insert_with(|| Registration {
            generation: tag.generation,
            centers: Vec::new(),
            loaded: 0,
        });
        if reg.generation != tag.generation || whole || reg.centers.len() != total as usize * 3 {
            reg.generation = tag.generation;
            reg.centers = vec![0.0; total as usize * 3];
            reg.loaded = 0;
        }
        for (i, texel) in center_and_scale.chunks_exact(TEXEL_LANES).enumerate() {
            let dst = (first_point as usize + i) * 3;
            reg.centers[dst..dst + 3].copy_from_slice(&texel[..3]);
        }
        // Only a run that touches the loaded prefix extends it; a run past a
        // gap waits until the gap is filled and the run is sent again.
        if first_point as usize <= reg.loaded {
            reg.loaded = reg.loaded.max(end);
        }

        Ok(Payload::Decoded(DecodedChunk {
            tag,
            first_point,
            count: count as u32,
            whole,
            center_and_scale,
            rotation_and_color,
        }))
    }

    fn decode_from_buffer(&mut self, args: &mut ArgReader) -> KernelResult<Payload> {
        let tag = args.tag()?;
        let bytes = args.bytes()?;
        let total = args.count()?;
        let first_point = args.count()?;
        let whole = args.count()? != 0;
        if bytes.len() % RECORD_SIZE != 0 {
            return Err(format!(
                "buffer size {} is not a multiple of {RECORD_SIZE} bytes",
                bytes.len()
            ));
        }
        let count = bytes.len() / RECORD_SIZE;
        self.pack(tag, total, first_point, count, whole, |i| {
            decode_record(&bytes[i * RECORD_SIZE..(i + 1) * RECORD_SIZE])
        })
    }

    fn decode_from_geometry(&mut self, args: &mut ArgReader) -> KernelResult<Payload> {
        let tag = args.tag()?;
        let positions = args.floats()?;
        let scales = args.floats()?;
        let rotations = args.floats()?;
        let colors = args.bytes()?;
        let total = args.count()?;
        let count = check_geometry(&positions, &scales, &rotations, colors.len(), 4)?;
        self.pack(tag, total, 0, count, true, |i| Splat {
            position: vec3_at(&positions, i),
            color: [colors[i * 4], colors[i * 4 + 1], colors[i * 4 + 2]],
            opacity: colors[i * 4 + 3] as f32 / 255.0,
            scale: vec3_at(&scales, i),
            rotation: quat_at(&rotations, i),
        })
    }

    fn decode_from_spz(&mut self, args: &mut ArgReader) -> KernelResult<Payload> {
        let tag = args.tag()?;
        let positions = args.floats()?;
        let scales = args.floats()?;
        let rotations = args.floats()?;
        let colors = args.bytes()?;
        let alphas = args.bytes()?;
        let total = args.count()?;
        let count = check_geometry(&positions, &scales, &rotations, colors.len(), 3)?;
        if alphas.len() != count {
            return Err(format!("alphas has {} values, expected {count}", alphas.len()));
        }
        self.pack(tag, total, 0, count, true, |i| Splat {
            position: vec3_at(&positions, i),
            color: [colors[i * 3], colors[i * 3 + 1], colors[i * 3 + 2]],
            opacity: alphas[i] as f32 / 255.0,
            scale: exp_vec3(vec3_at(&scales, i)),
            rotation: quat_at(&rotations, i),
        })
    }

    fn sort(&mut self, args: &mut ArgReader) -> KernelResult<Payload> {
        let tag = args.tag()?;
        let view = args.view()?;
        let planes = args.planes()?;
        let threshold = args.scalar()?;
        let pool = self.pool()?;
        let reg = match self.registry.get(&tag.id) {
            Some(reg) if reg.generation == tag.generation => reg,
            _ => return Ok(Payload::Sorted(None)),
        };
        let centers = &reg.centers[..reg.loaded * 3];
        let indices = pool.install(|| depth_order(centers, &view, planes.as_ref(), threshold));
        Ok(Payload::Sorted(Some(SortResult { tag, indices })))
    }

    fn compute_bounds(&mut self, args: &mut ArgReader) -> KernelResult<Payload> {
        let tag = args.tag()?;
        let reg = self
            .registry
            .get(&tag.id)
            .filter(|reg| reg.generation == tag.generation && reg.loaded > 0)
            .ok_or_else(|| format!("no points registered for dataset {tag}"))?;
        let (min, max) = reg.centers[..reg.loaded * 3].chunks_exact(3).fold(
            (
                Vec3::new(f32::INFINITY, f32::INFINITY, f32::INFINITY),
                Vec3::new(f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY),
            ),
            |(min, max), c| {
                let p = Vec3::new(c[0], c[1], c[2]);
                (min.min(p), max.max(p))
            },
        );
        Ok(Payload::Bounds(BoundsResult {
            tag,
            bounds: Bounds {
                min: min.to_array(),
                max: max.to_array(),
            },
        }))
    }
}

impl Kernel for SplatKernel {
    fn dispatch(&mut self, func: WorkerFn, args: Vec<Arg>) -> Result<Payload, String> {
        let mut reader = ArgReader::new(func, args);
        match func {
            WorkerFn::Init => self.init(),
            WorkerFn::DecodeFromBuffer => self.decode_from_buffer(&mut reader),
            WorkerFn::DecodeFromGeometry => self.decode_from_geometry(&mut reader),
            WorkerFn::DecodeFromSpz => self.decode_from_spz(&mut reader),
            WorkerFn::Sort => self.sort(&mut reader),
            WorkerFn::ComputeBounds => self.compute_bounds(&mut reader),
            WorkerFn::Unregister => {
                let id = reader.id()?;
                self.registry.remove(&id);
                Ok(Payload::Unregistered)
            }
        }
    }
}

fn check_geometry(
    positions: &[f32],
    scales: &[f32],
    rotations: &[f32],
    color_len: usize,
    color_stride: usize,
) -> KernelResult<usize> {
    let n = positions.len() / 3;
    if positions.len() % 3 != 0 || scales.len() != n * 3 || rotations.len() != n * 4 || color_len != n * color_stride {
        return Err(format!(
            "attribute arrays disagree: {} positions, {} scales, {} rotations, {} colors",
            positions.len(),
            scales.len(),
            rotations.len(),
            color_len
        ));
    }
    Ok(n)
}

fn vec3_at(values: &[f32], i: usize) -> Vec3 {
    Vec3::new(values[i * 3], values[i * 3 + 1], values[i * 3 + 2])
}

/// The compressed format stores log scales.
fn exp_vec3(v: Vec3) -> Vec3 {
    Vec3::new(v.x.exp(), v.y.exp(), v.z.exp())
}

fn quat_at(values: &[f32], i: usize) -> [f32; 4] {
    quat_normalize([values[i * 4], values[i * 4 + 1], values[i * 4 + 2], values[i * 4 + 3]])
}

/// Positional argument decoding with errors naming the call and slot.
struct ArgReader {
    func: WorkerFn,
    args: std::vec::IntoIter<Arg>,
    position: usize,
}

impl ArgReader {
    fn new(func: WorkerFn, args: Vec<Arg>) -> Self {
        Self {
            func,
            args: args.into_iter(),
            position: 0,
        }
    }

    fn next(&mut self, expected: &str) -> KernelResult<Arg> {
        let position = self.position;
        self.position += 1;
        self.args
            .next()
            .ok_or_else(|| format!("{}: missing {expected} at argument {position}", self.func))
    }

    fn mismatch<T>(&self, expected: &str, got: &Arg) -> KernelResult<T> {
        Err(format!(
            "{}: expected {expected} at argument {}, got {got:?}",
            self.func,
            self.position - 1
        ))
    }

    fn tag(&mut self) -> KernelResult<DatasetTag> {
        match self.next("dataset tag")? {
            Arg::Tag(tag) => Ok(tag),
            other => self.mismatch("dataset tag", &other),
        }
    }

    fn id(&mut self) -> KernelResult<Uuid> {
        match self.next("dataset id")? {
            Arg::Id(id) => Ok(id),
            Arg::Tag(tag) => Ok(tag.id),
            other => self.mismatch("dataset id", &other),
        }
    }

    fn count(&mut self) -> KernelResult<u32> {
        match self.next("count")? {
            Arg::Count(n) => Ok(n),
            other => self.mismatch("count", &other),
        }
    }

    fn scalar(&mut self) -> KernelResult<f32> {
        match self.next("scalar")? {
            Arg::Scalar(v) => Ok(v),
            other => self.mismatch("scalar", &other),
        }
    }

    fn view(&mut self) -> KernelResult<[f32; 4]> {
        match self.next("view vector")? {
            Arg::View(v) => Ok(v),
            other => self.mismatch("view vector", &other),
        }
    }

    fn planes(&mut self) -> KernelResult<Option<[[f32; 4]; 6]>> {
        match self.next("culling planes")? {
            Arg::Planes(p) => Ok(p),
            Arg::Absent => Ok(None),
            other => self.mismatch("culling planes", &other),
        }
    }

    fn bytes(&mut self) -> KernelResult<Vec<u8>> {
        match self.next("byte buffer")? {
            Arg::Bytes(b) => Ok(b),
            other => self.mismatch("byte buffer", &other),
        }
    }

    fn floats(&mut self) -> KernelResult<Vec<f32>> {
        match self.next("float array")? {
            Arg::Floats(f) => Ok(f),
            other => self.mismatch("float array", &other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splat::encode_records;

    fn ready_kernel() -> SplatKernel {
        let mut kernel = SplatKernel::new(Some(2));
        kernel.dispatch(WorkerFn::Init, vec![]).expect("init");
        kernel
    }

    fn splat_at(z: f32) -> Splat {
        Splat {
            position: Vec3::new(0.0, 0.0, z),
            color: [255, 0, 0],
            opacity: 1.0,
            scale: Vec3::new(0.1, 0.1, 0.1),
            rotation: [1.0, 0.0, 0.0, 0.0],
        }
    }

    fn decode_args(tag: DatasetTag, bytes: Vec<u8>, total: u32, first: u32, whole: bool) -> Vec<Arg> {
        vec![
            Arg::Tag(tag),
            Arg::Bytes(bytes),
            Arg::Count(total),
            Arg::Count(first),
            Arg::Count(whole as u32),
        ]
    }

    #[test]
    fn requires_init_before_decoding() {
        let mut kernel = SplatKernel::new(Some(1));
        let tag = DatasetTag::new();
        let bytes = encode_records(&[splat_at(0.0)]);
        let err = kernel
            .dispatch(WorkerFn::DecodeFromBuffer, decode_args(tag, bytes, 1, 0, true))
            .unwrap_err();
        assert!(err.contains("not initialised"));
    }

    #[test]
    fn decode_then_sort_back_to_front() {
        let mut kernel = ready_kernel();
        let tag = DatasetTag::new();
        let splats = [splat_at(1.0), splat_at(-3.0), splat_at(0.0)];
        let payload = kernel
            .dispatch(WorkerFn::DecodeFromBuffer, decode_args(tag, encode_records(&splats), 3, 0, true))
            .unwrap();
        let Payload::Decoded(chunk) = payload else {
            panic!("expected decoded chunk");
        };
        assert_eq!(chunk.count, 3);
        assert_eq!(chunk.center_and_scale.len(), 12);

        let sorted = kernel
            .dispatch(
                WorkerFn::Sort,
                vec![
                    Arg::Tag(tag),
                    Arg::View([0.0, 0.0, 1.0, -5.0]),
                    Arg::Planes(None),
                    Arg::Scalar(-0.00001),
                ],
            )
            .unwrap();
        let Payload::Sorted(Some(result)) = sorted else {
            panic!("expected sort result");
        };
        assert_eq!(result.indices, vec![1, 2, 0]);
    }

    #[test]
    fn sort_for_unknown_or_stale_dataset_is_skipped() {
        let mut kernel = ready_kernel();
        let tag = DatasetTag::new();
        kernel
            .dispatch(WorkerFn::DecodeFromBuffer, decode_args(tag, encode_records(&[splat_at(0.0)]), 1, 0, true))
            .unwrap();
        let stale = tag.next_generation();
        let sorted = kernel
            .dispatch(
                WorkerFn::Sort,
                vec![Arg::Tag(stale), Arg::View([0.0; 4]), Arg::Absent, Arg::Scalar(0.0)],
            )
            .unwrap();
        assert_eq!(sorted, Payload::Sorted(None));
    }

    #[test]
    fn bounds_cover_loaded_centres_and_unregister_forgets() {
        let mut kernel = ready_kernel();
        let tag = DatasetTag::new();
        let splats = [splat_at(-2.0), splat_at(4.0)];
        kernel
            .dispatch(WorkerFn::DecodeFromBuffer, decode_args(tag, encode_records(&splats), 2, 0, true))
            .unwrap();
        let Payload::Bounds(result) = kernel.dispatch(WorkerFn::ComputeBounds, vec![Arg::Tag(tag)]).unwrap() else {
            panic!("expected bounds");
        };
        assert_eq!(result.bounds.min, [0.0, 0.0, -2.0]);
        assert_eq!(result.bounds.max, [0.0, 0.0, 4.0]);

        kernel.dispatch(WorkerFn::Unregister, vec![Arg::Id(tag.id)]).unwrap();
        assert_eq!(kernel.registered(), 0);
        assert!(kernel.dispatch(WorkerFn::ComputeBounds, vec![Arg::Tag(tag)]).is_err());
    }

    #[test]
    fn malformed_arguments_are_logical_errors() {
        let mut kernel = ready_kernel();
        let err = kernel
            .dispatch(WorkerFn::Sort, vec![Arg::Count(3)])
            .unwrap_err();
        assert!(err.starts_with("sort: expected dataset tag"), "{err}");
    }

    #[test]
    fn chunks_accumulate_centres() {
        let mut kernel = ready_kernel();
        let tag = DatasetTag::new();
        let first = encode_records(&[splat_at(1.0), splat_at(2.0)]);
        let second = encode_records(&[splat_at(3.0)]);
        kernel
            .dispatch(WorkerFn::DecodeFromBuffer, decode_args(tag, first, 3, 0, false))
            .unwrap();
        let Payload::Decoded(chunk) = kernel
            .dispatch(WorkerFn::DecodeFromBuffer, decode_args(tag, second, 3, 2, false))
            .unwrap()
        else {
            panic!("expected decoded chunk");
        };
        assert_eq!(chunk.first_point, 2);
        let Payload::Bounds(result) = kernel.dispatch(WorkerFn::ComputeBounds, vec![Arg::Tag(tag)]).unwrap() else {
            panic!("expected bounds");
        };
        assert_eq!(result.bounds.min[2], 1.0);
        assert_eq!(result.bounds.max[2], 3.0);

        let overflow = encode_records(&[splat_at(0.0), splat_at(0.0)]);
        assert!(kernel
            .dispatch(WorkerFn::DecodeFromBuffer, decode_args(tag, overflow, 3, 2, false))
            .is_err());
    }

    #[test]
    fn chunk_past_a_gap_waits_for_the_gap() {
        let mut kernel = ready_kernel();
        let tag = DatasetTag::new();
        let view = Arg::View([0.0, 0.0, 1.0, -5.0]);
        let sort = |kernel: &mut SplatKernel| {
            let args = vec![Arg::Tag(tag), view.clone(), Arg::Absent, Arg::Scalar(-0.00001)];
            match kernel.dispatch(WorkerFn::Sort, args).unwrap() {
                Payload::Sorted(Some(result)) => result.indices,
                other => panic!("expected sort result, got {other:?}"),
            }
        };

        let tail = encode_records(&[splat_at(3.0), splat_at(4.0)]);
        kernel
            .dispatch(WorkerFn::DecodeFromBuffer, decode_args(tag, tail.clone(), 4, 2, false))
            .unwrap();
        assert!(sort(&mut kernel).is_empty());
        assert!(kernel.dispatch(WorkerFn::ComputeBounds, vec![Arg::Tag(tag)]).is_err());

        let head = encode_records(&[splat_at(1.0), splat_at(2.0)]);
        kernel
            .dispatch(WorkerFn::DecodeFromBuffer, decode_args(tag, head, 4, 0, false))
            .unwrap();
        assert_eq!(sort(&mut kernel).len(), 2);

        kernel
            .dispatch(WorkerFn::DecodeFromBuffer, decode_args(tag, tail, 4, 2, false))
            .unwrap();
        assert_eq!(sort(&mut kernel).len(), 4);
    }
}
