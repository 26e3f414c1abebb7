//! Request/response channel to the background compute unit.
//!
//! Every call returns a [`Pending`] handle at once. A router thread matches
//! responses to pending entries by correlation id, expires entries at their
//! deadline, and fans a crash out to everything still in flight.

mod bootstrap;
mod error;
mod kernel;
mod pending;
mod protocol;

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{after, never, select, unbounded, Receiver, Sender};
use uuid::Uuid;

pub use bootstrap::{BootstrapStrategy, Kernel};
pub use error::WorkerError;
pub use kernel::SplatKernel;
pub use pending::Pending;
pub use protocol::{
    Arg, Bounds, BoundsResult, DatasetTag, DecodedChunk, Payload, Request, Response, SortRequest,
    SortResult, WorkerEvent, WorkerFn,
};

use pending::{Outcome, PendingTable, PendingTask};

use crate::splat::SplatAttributes;

#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    /// Deadline per call; `None` or zero waits forever.
    pub timeout: Option<Duration>,
    /// `None` probes the environment.
    pub strategy: Option<BootstrapStrategy>,
    /// Threads for the kernel's compute pool.
    pub pool_threads: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Running,
    Failed(String),
    Disposed,
}

#[derive(Clone, Copy)]
enum InitState {
    Idle,
    InFlight(u64),
    Ready,
}

enum Control {
    Rearm,
    Shutdown,
}

struct Shared {
    next_id: u64,
    pending: PendingTable,
    init: InitState,
    health: Health,
    inbox: Option<Sender<Request>>,
}

impl Shared {
    fn settle(&mut self, id: u64, task: PendingTask, outcome: Outcome) {
        if let InitState::InFlight(init_id) = self.init {
            if init_id == id {
                self.init = if outcome.is_ok() {
                    InitState::Ready
                } else {
                    InitState::Idle
                };
            }
        }
        task.settle(outcome);
    }

    fn fail_all(&mut self, reason: &str) {
        if self.health == Health::Running {
            self.health = Health::Failed(reason.to_string());
        }
        self.inbox = None;
        self.init = InitState::Idle;
        for task in self.pending.drain() {
            task.settle(Err(WorkerError::Crashed(reason.to_string())));
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct WorkerChannel {
    shared: Arc<Mutex<Shared>>,
    control: Sender<Control>,
    router: Mutex<Option<JoinHandle<()>>>,
    timeout: Option<Duration>,
    strategy: BootstrapStrategy,
}

impl WorkerChannel {
    /// Starts the built-in [`SplatKernel`].
    pub fn new(config: ChannelConfig) -> Self {
        let kernel = SplatKernel::new(config.pool_threads);
        Self::spawn(config, kernel)
    }

    pub fn spawn<K: Kernel>(config: ChannelConfig, kernel: K) -> Self {
        let (inbox_tx, inbox_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let wanted = config.strategy.unwrap_or_else(BootstrapStrategy::probe);
        let strategy = bootstrap::launch(wanted, kernel, inbox_rx, events_tx);
        log::debug!("compute unit started ({})", strategy.name());
        Self::connect(config, strategy, inbox_tx, events_rx)
    }

    /// Wires a channel to an already running unit.
    pub(crate) fn connect(
        config: ChannelConfig,
        strategy: BootstrapStrategy,
        inbox: Sender<Request>,
        events: Receiver<WorkerEvent>,
    ) -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            next_id: 1,
            pending: PendingTable::default(),
            init: InitState::Idle,
            health: Health::Running,
            inbox: Some(inbox),
        }));
        let (control_tx, control_rx) = unbounded();
        let router_shared = shared.clone();
        let router = std::thread::Builder::new()
            .name("splat-router".to_string())
            .spawn(move || route(router_shared, events, control_rx));
        let router = match router {
            Ok(handle) => Some(handle),
            Err(err) => {
                log::error!("failed to start response router: {err}");
                lock(&shared).fail_all("response router unavailable");
                None
            }
        };
        Self {
            shared,
            control: control_tx,
            router: Mutex::new(router),
            timeout: config.timeout.filter(|t| !t.is_zero()),
            strategy,
        }
    }

    pub fn strategy(&self) -> BootstrapStrategy {
        self.strategy
    }

    pub fn health(&self) -> Health {
        lock(&self.shared).health.clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(lock(&self.shared).init, InitState::Ready)
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.shared).pending.len()
    }

    pub fn pending_ids(&self) -> Vec<u64> {
        lock(&self.shared).pending.ids()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        lock(&self.shared).pending.contains(id)
    }

    /// Registers and sends one request. The caller holds the lock so ids
    /// reach the unit in allocation order.
    fn issue(&self, shared: &mut Shared, func: WorkerFn, args: Vec<Arg>) -> Result<(u64, Receiver<Outcome>), WorkerError> {
        let Some(inbox) = shared.inbox.clone() else {
            let reason = match &shared.health {
                Health::Failed(reason) => reason.clone(),
                Health::Disposed => "channel disposed".to_string(),
                Health::Running => "no compute unit attached".to_string(),
            };
            return Err(WorkerError::Unavailable(reason));
        };

        let id = shared.next_id;
        shared.next_id += 1;
        let request = Request { id, func, args };
        let (buffers, bytes) = request.transferables();
        log::trace!("call #{id} {func}: {buffers} buffer(s), {bytes} bytes moved");

        let now = Instant::now();
        let (task, rx) = PendingTask::new(func, now, self.timeout.map(|t| now + t));
        shared.pending.insert(id, task);
        if inbox.send(request).is_err() {
            if let Some(task) = shared.pending.remove(id) {
                shared.settle(id, task, Err(WorkerError::Unavailable("compute unit inbox closed".to_string())));
            }
        } else if self.timeout.is_some() {
            let _ = self.control.send(Control::Rearm);
        }
        Ok((id, rx))
    }

    fn call_mapped<T>(&self, func: WorkerFn, args: Vec<Arg>, map: fn(Payload) -> Option<T>) -> Pending<T> {
        let mut shared = lock(&self.shared);
        match self.issue(&mut shared, func, args) {
            Ok((id, rx)) => Pending::new(id, func, rx, map),
            Err(err) => {
                log::warn!("{func} skipped: {err}");
                Pending::settled(0, func, Err(err), map)
            }
        }
    }

    pub fn call(&self, func: WorkerFn, args: Vec<Arg>) -> Pending<Payload> {
        self.call_mapped(func, args, Some)
    }

    /// One-time bootstrap of the unit. Calls made while one is in flight
    /// share its outcome; after success every call settles immediately.
    pub fn init(&self) -> Pending<()> {
        fn ready(payload: Payload) -> Option<()> {
            matches!(payload, Payload::Ready).then_some(())
        }

        let mut shared = lock(&self.shared);
        let state = shared.init;
        match state {
            InitState::Ready => return Pending::settled(0, WorkerFn::Init, Ok(Payload::Ready), ready),
            InitState::InFlight(id) => {
                if let Some(task) = shared.pending.get_mut(id) {
                    return Pending::new(id, WorkerFn::Init, task.share(), ready);
                }
            }
            InitState::Idle => {}
        }
        match self.issue(&mut shared, WorkerFn::Init, Vec::new()) {
            Ok((id, rx)) => {
                if shared.pending.contains(id) {
                    shared.init = InitState::InFlight(id);
                }
                Pending::new(id, WorkerFn::Init, rx, ready)
            }
            Err(err) => Pending::settled(0, WorkerFn::Init, Err(err), ready),
        }
    }

    pub fn decode_buffer(&self, tag: DatasetTag, bytes: Vec<u8>, total: u32, first_point: u32, whole: bool) -> Pending<DecodedChunk> {
        let args = vec![
            Arg::Tag(tag),
            Arg::Bytes(bytes),
            Arg::Count(total),
            Arg::Count(first_point),
            Arg::Count(whole as u32),
        ];
        self.call_mapped(WorkerFn::DecodeFromBuffer, args, decoded)
    }

    /// Decodes typed attribute arrays; arrays with separate alphas take the
    /// compressed-format path.
    pub fn decode_attributes(&self, tag: DatasetTag, attributes: SplatAttributes) -> Pending<DecodedChunk> {
        let total = attributes.len() as u32;
        let SplatAttributes {
            positions,
            scales,
            rotations,
            colors,
            alphas,
        } = attributes;
        let mut args = vec![
            Arg::Tag(tag),
            Arg::Floats(positions),
            Arg::Floats(scales),
            Arg::Floats(rotations),
            Arg::Bytes(colors),
        ];
        let func = match alphas {
            Some(alphas) => {
                args.push(Arg::Bytes(alphas));
                WorkerFn::DecodeFromSpz
            }
            None => WorkerFn::DecodeFromGeometry,
        };
        args.push(Arg::Count(total));
        self.call_mapped(func, args, decoded)
    }

    pub fn sort(&self, request: SortRequest) -> Pending<Option<SortResult>> {
        let args = vec![
            Arg::Tag(request.tag),
            Arg::View(request.view),
            Arg::Planes(request.planes),
            Arg::Scalar(request.threshold),
        ];
        self.call_mapped(WorkerFn::Sort, args, |payload| match payload {
            Payload::Sorted(result) => Some(result),
            _ => None,
        })
    }

    pub fn compute_bounds(&self, tag: DatasetTag) -> Pending<BoundsResult> {
        self.call_mapped(WorkerFn::ComputeBounds, vec![Arg::Tag(tag)], |payload| match payload {
            Payload::Bounds(result) => Some(result),
            _ => None,
        })
    }

    pub fn unregister(&self, id: Uuid) -> Pending<()> {
        self.call_mapped(WorkerFn::Unregister, vec![Arg::Id(id)], |payload| {
            matches!(payload, Payload::Unregistered).then_some(())
        })
    }

    /// Fails a pending call with `reason`. Returns false if it already settled.
    pub fn cancel(&self, id: u64, reason: &str) -> bool {
        let mut shared = lock(&self.shared);
        match shared.pending.remove(id) {
            Some(task) => {
                log::debug!("call #{id} {} cancelled: {reason}", task.func);
                shared.settle(id, task, Err(WorkerError::Cancelled(reason.to_string())));
                true
            }
            None => false,
        }
    }

    /// Stops the unit and abandons every pending call. Waiting handles see
    /// [`WorkerError::Disposed`].
    pub fn dispose(&self) {
        {
            let mut shared = lock(&self.shared);
            if shared.health == Health::Disposed {
                return;
            }
            shared.health = Health::Disposed;
            shared.inbox = None;
            shared.init = InitState::Idle;
            shared.pending.abandon();
        }
        let _ = self.control.send(Control::Shutdown);
        let handle = self.router.lock().ok().and_then(|mut r| r.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("response router panicked");
            }
        }
        log::debug!("worker channel disposed");
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn decoded(payload: Payload) -> Option<DecodedChunk> {
    match payload {
        Payload::Decoded(chunk) => Some(chunk),
        _ => None,
    }
}

fn route(shared: Arc<Mutex<Shared>>, events: Receiver<WorkerEvent>, control: Receiver<Control>) {
    let mut events = events;
    loop {
        let next = lock(&shared).pending.next_deadline();
        let timer = match next {
            Some(at) => after(at.saturating_duration_since(Instant::now())),
            None => never(),
        };
        let mut disconnected = false;
        select! {
            recv(events) -> event => match event {
                Ok(event) => handle_event(&shared, event),
                Err(_) => disconnected = true,
            },
            recv(control) -> msg => match msg {
                Ok(Control::Rearm) => {}
                Ok(Control::Shutdown) | Err(_) => return,
            },
            recv(timer) -> _ => expire(&shared, Instant::now()),
        }
        if disconnected {
            let mut shared = lock(&shared);
            if shared.health == Health::Running {
                log::error!("compute unit disconnected");
                shared.fail_all("compute unit disconnected");
            }
            events = never();
        }
    }
}

fn handle_event(shared: &Mutex<Shared>, event: WorkerEvent) {
    match event {
        WorkerEvent::Message(Response { id, result, error }) => {
            let mut shared = lock(shared);
            let Some(task) = shared.pending.remove(id) else {
                log::trace!("dropping response for settled call #{id}");
                return;
            };
            let function = task.func;
            log::debug!("call #{id} {function} settled after {:?}", task.started.elapsed());
            let outcome = match (error, result) {
                (Some(message), _) => Err(WorkerError::Remote { function, message }),
                (None, Some(payload)) => Ok(payload),
                (None, None) => Err(WorkerError::UnexpectedPayload { function }),
            };
            shared.settle(id, task, outcome);
        }
        WorkerEvent::Error(reason) => {
            log::error!("compute unit crashed: {reason}");
            lock(shared).fail_all(&reason);
        }
        WorkerEvent::MessageError(message) => {
            log::error!("undecodable message from compute unit: {message}");
        }
    }
}

fn expire(shared: &Mutex<Shared>, now: Instant) {
    let mut shared = lock(shared);
    for (id, task) in shared.pending.take_expired(now) {
        let function = task.func;
        let elapsed_ms = now.saturating_duration_since(task.started).as_millis() as u64;
        log::warn!("call #{id} {function} timed out after {elapsed_ms}ms");
        shared.settle(id, task, Err(WorkerError::Timeout { function, elapsed_ms }));
    }
}
