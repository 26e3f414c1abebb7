use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::*;
use crate::math::Vec3;
use crate::splat::encode_records;
use crate::worker::{
    BootstrapStrategy, ChannelConfig, Kernel, Request, Response, SplatKernel, WorkerError,
    WorkerEvent, WorkerFn,
};

fn channel() -> Arc<WorkerChannel> {
    Arc::new(WorkerChannel::new(ChannelConfig {
        timeout: Some(Duration::from_secs(10)),
        strategy: Some(BootstrapStrategy::DedicatedThread),
        pool_threads: Some(2),
    }))
}

fn splats(n: usize) -> Vec<Splat> {
    (0..n)
        .map(|i| Splat {
            position: Vec3::new(i as f32, 0.0, -(i as f32)),
            color: [i as u8, 100, 200],
            opacity: 1.0,
            scale: Vec3::new(0.5, 0.25, 0.125),
            rotation: [1.0, 0.0, 0.0, 0.0],
        })
        .collect()
}

/// A channel whose unit is the test: each request is answered by hand.
fn relayed() -> (Arc<WorkerChannel>, Receiver<Request>, Sender<WorkerEvent>) {
    let (inbox_tx, inbox_rx) = unbounded();
    let (events_tx, events_rx) = unbounded();
    let channel = WorkerChannel::connect(
        ChannelConfig::default(),
        BootstrapStrategy::DedicatedThread,
        inbox_tx,
        events_rx,
    );
    (Arc::new(channel), inbox_rx, events_tx)
}

fn next_request(inbox: &Receiver<Request>) -> Request {
    inbox
        .recv_timeout(Duration::from_secs(5))
        .expect("request reaches the unit")
}

fn answer(kernel: &mut SplatKernel, events: &Sender<WorkerEvent>, request: Request) {
    let response = match kernel.dispatch(request.func, request.args) {
        Ok(payload) => Response::ok(request.id, payload),
        Err(message) => Response::err(request.id, message),
    };
    events.send(WorkerEvent::Message(response)).unwrap();
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < Duration::from_secs(5), "condition never held");
        thread::sleep(Duration::from_millis(1));
    }
}

fn settle_loads(store: &mut SplatDataStore) {
    let start = Instant::now();
    while store.pending_loads() > 0 {
        let report = store.poll_loads();
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert!(start.elapsed() < Duration::from_secs(5), "loads never settled");
        thread::sleep(Duration::from_millis(1));
    }
}

fn snapshot(store: &SplatDataStore) -> (Vec<u8>, Vec<u8>, Vec<u8>, u32) {
    (
        store.center_and_scale_bytes().to_vec(),
        store.rotation_and_color_bytes().to_vec(),
        store.order_bytes().to_vec(),
        store.draw_count(),
    )
}

fn config(max_texture_size: u32) -> StoreConfig {
    StoreConfig {
        max_texture_size,
        ..StoreConfig::default()
    }
}

#[test]
fn same_point_count_keeps_buffers() {
    let mut store = SplatDataStore::with_channel(config(4096), channel());
    store.set_point_count(3);
    store.load_raw(encode_records(&splats(3))).unwrap();
    settle_loads(&mut store);
    let tag = store.tag();
    let before = snapshot(&store);

    store.set_point_count(3);
    assert_eq!(store.tag(), tag);
    assert_eq!(store.loaded(), 3);
    assert_eq!(snapshot(&store), before);
}

#[test]
fn resize_discards_and_bumps_generation() {
    let mut store = SplatDataStore::with_channel(config(4), channel());
    store.set_point_count(6);
    let tag = store.tag();
    assert_eq!(store.layout(), TextureLayout { width: 4, height: 2 });
    assert_eq!(store.center_and_scale().len(), 8 * TEXEL_LANES);

    store.set_point_count(3);
    assert_eq!(store.tag().id, tag.id);
    assert_eq!(store.tag().generation, tag.generation + 1);
    assert_eq!(store.layout(), TextureLayout { width: 3, height: 1 });
    assert_eq!(store.loaded(), 0);
    assert_eq!(store.draw_count(), 0);
}

#[test]
fn point_count_is_clamped_to_texture_limit() {
    let mut store = SplatDataStore::new(config(4));
    store.set_point_count(100);
    assert_eq!(store.point_count(), 16);
    assert_eq!(store.layout(), TextureLayout { width: 4, height: 4 });
}

#[test]
fn loading_without_channel_or_points_is_skipped() {
    let mut store = SplatDataStore::new(StoreConfig::default());
    store.set_point_count(2);
    let before = snapshot(&store);
    assert_eq!(store.load_raw(encode_records(&splats(2))), Err(StoreError::NoChannel));
    assert!(matches!(
        store.request_sort(&Mat4::IDENTITY, None),
        Err(StoreError::NoChannel)
    ));
    assert_eq!(snapshot(&store), before);

    let mut empty = SplatDataStore::with_channel(StoreConfig::default(), channel());
    assert_eq!(empty.load_raw(Vec::new()), Err(StoreError::EmptyDataset));
    assert_eq!(
        empty.load_from_attributes(SplatAttributes::default()),
        Err(StoreError::EmptyDataset)
    );
}

#[test]
fn chunked_load_spans_rows() {
    let data = splats(10);
    let mut store = SplatDataStore::with_channel(config(4), channel());
    store.set_point_count(10);
    store.take_dirty_regions();

    let bytes = encode_records(&data);
    let mut firsts = Vec::new();
    for chunk in bytes.chunks(3 * RECORD_SIZE) {
        firsts.push(store.load_raw_chunk(chunk.to_vec()).unwrap());
    }
    assert_eq!(firsts, vec![0, 3, 6, 9]);
    settle_loads(&mut store);

    assert_eq!(store.loaded(), 10);
    for (i, expected) in data.iter().enumerate() {
        let got = store.splat(i as u32).unwrap();
        assert_eq!(got.position, expected.position);
        assert_eq!(got.color, expected.color);
    }
    let covered: u32 = store
        .take_dirty_regions()
        .iter()
        .map(|r| r.width * r.height)
        .sum();
    assert_eq!(covered, 10);
    assert!(store.take_needs_resort());
    assert!(!store.take_needs_resort());

    assert_eq!(store.load_raw_chunk(encode_records(&splats(1))), Ok(10));
    assert_eq!(store.pending_loads(), 0);
}

#[test]
fn stale_responses_leave_buffers_untouched() {
    let mut store = SplatDataStore::with_channel(config(4096), channel());
    store.set_point_count(4);
    store.load_raw(encode_records(&splats(4))).unwrap();
    settle_loads(&mut store);
    let sorted = store
        .request_sort(&Mat4::IDENTITY, None)
        .unwrap()
        .wait()
        .unwrap();
    assert!(store.apply_sort_result(sorted));
    let before = snapshot(&store);

    let stale_tag = DatasetTag {
        id: store.tag().id,
        generation: store.tag().generation.wrapping_sub(1),
    };
    let stale_chunk = DecodedChunk {
        tag: stale_tag,
        first_point: 0,
        count: 1,
        whole: true,
        center_and_scale: vec![9.0; 4],
        rotation_and_color: vec![9; 4],
    };
    assert_eq!(store.load_from_decoded(&stale_chunk), Ok(false));
    assert!(!store.apply_sort_result(Some(SortResult {
        tag: DatasetTag::new(),
        indices: vec![0],
    })));
    assert!(!store.apply_sort_result(None));
    assert_eq!(snapshot(&store), before);
}

#[test]
fn out_of_order_chunk_is_rejected_without_mutation() {
    let mut store = SplatDataStore::with_channel(config(4096), channel());
    store.set_point_count(8);
    let before = snapshot(&store);
    let chunk = DecodedChunk {
        tag: store.tag(),
        first_point: 4,
        count: 1,
        whole: false,
        center_and_scale: vec![1.0; 4],
        rotation_and_color: vec![1; 4],
    };
    assert_eq!(
        store.load_from_decoded(&chunk),
        Err(StoreError::ChunkOutOfOrder {
            first_point: 4,
            loaded: 0
        })
    );
    assert_eq!(snapshot(&store), before);
    assert!(store.take_dirty_regions().is_empty());
}

#[test]
fn sort_result_installs_draw_order() {
    let mut store = SplatDataStore::with_channel(config(4096), channel());
    store.set_point_count(3);
    let data = splats(3);
    store
        .load_from_attributes(SplatAttributes::from_splats(&data))
        .unwrap();
    settle_loads(&mut store);

    // Camera at z = 5 looking down -z.
    let view = Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0));
    let result = store.request_sort(&view, None).unwrap().wait().unwrap();
    assert!(store.apply_sort_result(result));
    assert_eq!(store.order(), &[2, 1, 0]);
    assert_eq!(store.draw_count(), 3);
}

#[test]
fn bounds_are_requested_once_and_memoised() {
    let channel = channel();
    let mut store = SplatDataStore::with_channel(config(4096), channel.clone());
    store.set_point_count(3);
    assert_eq!(store.compute_bounds(), None);
    store.load_raw(encode_records(&splats(3))).unwrap();
    settle_loads(&mut store);

    let start = Instant::now();
    let bounds = loop {
        if let Some(bounds) = store.compute_bounds() {
            break bounds;
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        thread::sleep(Duration::from_millis(1));
    };
    assert_eq!(bounds.min, [0.0, 0.0, -2.0]);
    assert_eq!(bounds.max, [2.0, 0.0, 0.0]);
    assert_eq!(store.compute_bounds(), Some(bounds));
    assert_eq!(channel.pending_len(), 0);

    store.set_point_count(2);
    assert_eq!(store.bounds(), None);
}

#[test]
fn dispose_unregisters_the_dataset() {
    let channel = channel();
    let mut store = SplatDataStore::with_channel(config(4096), channel.clone());
    store.set_point_count(2);
    store.load_raw(encode_records(&splats(2))).unwrap();
    settle_loads(&mut store);
    let tag = store.tag();

    store.dispose();
    assert!(store.channel().is_none());
    assert_eq!(store.point_count(), 0);
    assert!(store.center_and_scale().is_empty());

    let after = channel
        .sort(SortRequest {
            tag,
            view: [0.0, 0.0, 1.0, 0.0],
            planes: None,
            threshold: 0.0,
        })
        .wait();
    assert_eq!(after, Ok(None));
}

#[test]
fn decode_errors_are_reported() {
    let mut store = SplatDataStore::with_channel(config(4096), channel());
    store.set_point_count(2);
    let mut attributes = SplatAttributes::from_splats(&splats(2));
    attributes.rotations.pop();
    assert!(matches!(
        store.load_from_attributes(attributes),
        Err(StoreError::AttributeMismatch(_))
    ));
    assert_eq!(
        store.load_raw(vec![0; RECORD_SIZE + 1]),
        Err(StoreError::AttributeMismatch(format!(
            "buffer of {} bytes is not a whole number of {RECORD_SIZE}-byte records",
            RECORD_SIZE + 1
        )))
    );
}

#[test]
fn oversized_sources_load_up_to_the_clamped_count() {
    let data = splats(6);
    let mut store = SplatDataStore::with_channel(config(2), channel());
    store.set_point_count(6);
    assert_eq!(store.point_count(), 4);

    store.load_raw(encode_records(&data)).unwrap();
    settle_loads(&mut store);
    assert_eq!(store.loaded(), 4);
    assert_eq!(store.splat(3).unwrap().position, data[3].position);
    assert_eq!(store.splat(4), None);

    store
        .load_from_attributes(SplatAttributes::from_splats(&data))
        .unwrap();
    settle_loads(&mut store);
    assert_eq!(store.loaded(), 4);
    assert_eq!(store.splat(2).unwrap().position, data[2].position);
}

#[test]
fn chunks_past_capacity_are_truncated() {
    let data = splats(6);
    let bytes = encode_records(&data);
    let mut store = SplatDataStore::with_channel(config(2), channel());
    store.set_point_count(6);

    assert_eq!(store.load_raw_chunk(bytes[..3 * RECORD_SIZE].to_vec()).unwrap(), 0);
    assert_eq!(store.load_raw_chunk(bytes[3 * RECORD_SIZE..].to_vec()).unwrap(), 3);
    assert_eq!(store.dispatched(), 4);
    assert_eq!(store.load_raw_chunk(encode_records(&splats(1))).unwrap(), 4);
    assert_eq!(store.pending_loads(), 2);

    settle_loads(&mut store);
    assert_eq!(store.loaded(), 4);
    assert_eq!(store.splat(3).unwrap().position, data[3].position);
}

#[test]
fn failed_chunk_rewinds_for_a_resend() {
    let (channel, inbox, events) = relayed();
    let mut kernel = SplatKernel::new(Some(1));
    let mut store = SplatDataStore::with_channel(config(4096), channel.clone());
    answer(&mut kernel, &events, next_request(&inbox));
    wait_until(|| channel.is_ready());

    store.set_point_count(4);
    let data = splats(4);
    let bytes = encode_records(&data);
    let (head, tail) = bytes.split_at(2 * RECORD_SIZE);
    assert_eq!(store.load_raw_chunk(head.to_vec()).unwrap(), 0);
    assert_eq!(store.load_raw_chunk(tail.to_vec()).unwrap(), 2);

    let failed = next_request(&inbox);
    events
        .send(WorkerEvent::Message(Response::err(failed.id, "decoder out of memory")))
        .unwrap();
    answer(&mut kernel, &events, next_request(&inbox));

    let start = Instant::now();
    let report = loop {
        let report = store.poll_loads();
        if report.rewound_to.is_some() {
            break report;
        }
        assert!(start.elapsed() < Duration::from_secs(5), "failure never surfaced");
        thread::sleep(Duration::from_millis(1));
    };
    assert_eq!(report.rewound_to, Some(0));
    assert_eq!(report.errors.len(), 1);
    assert!(matches!(
        report.errors[0],
        StoreError::Worker(WorkerError::Remote { .. })
    ));
    assert_eq!(store.pending_loads(), 0);
    assert_eq!(store.dispatched(), 0);
    assert_eq!(store.loaded(), 0);

    assert_eq!(store.load_raw_chunk(head.to_vec()).unwrap(), 0);
    assert_eq!(store.load_raw_chunk(tail.to_vec()).unwrap(), 2);
    answer(&mut kernel, &events, next_request(&inbox));
    answer(&mut kernel, &events, next_request(&inbox));
    settle_loads(&mut store);
    assert_eq!(store.loaded(), 4);
    for (i, expected) in data.iter().enumerate() {
        assert_eq!(store.splat(i as u32).unwrap().position, expected.position);
    }
}

#[test]
fn failed_init_is_resent_before_the_next_load() {
    let (channel, inbox, events) = relayed();
    let mut kernel = SplatKernel::new(Some(1));
    let mut store = SplatDataStore::with_channel(config(4096), channel.clone());
    let init = next_request(&inbox);
    assert_eq!(init.func, WorkerFn::Init);
    events
        .send(WorkerEvent::Message(Response::err(init.id, "module failed to compile")))
        .unwrap();
    wait_until(|| channel.pending_len() == 0);
    assert!(!channel.is_ready());

    store.set_point_count(2);
    store.load_raw(encode_records(&splats(2))).unwrap();
    let retry = next_request(&inbox);
    assert_eq!(retry.func, WorkerFn::Init);
    answer(&mut kernel, &events, retry);
    let decode = next_request(&inbox);
    assert_eq!(decode.func, WorkerFn::DecodeFromBuffer);
    answer(&mut kernel, &events, decode);

    settle_loads(&mut store);
    assert_eq!(store.loaded(), 2);
    assert!(channel.is_ready());
}
