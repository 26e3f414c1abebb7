use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crossbeam_channel::{Receiver, Sender};

use super::protocol::{Arg, Payload, Request, Response, WorkerEvent, WorkerFn};

/// The body of a compute unit: turns one request into a payload or a
/// logical error message. A panic is treated as a hard crash of the unit.
pub trait Kernel: Send + 'static {
    fn dispatch(&mut self, func: WorkerFn, args: Vec<Arg>) -> Result<Payload, String>;
}

/// How the compute unit gets an execution context of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStrategy {
    /// A named OS thread owned by the unit.
    DedicatedThread,
    /// A long-lived job parked on rayon's global pool.
    SharedPool,
}

impl BootstrapStrategy {
    /// Picks the strategy the current target supports.
    pub fn probe() -> Self {
        if cfg!(target_arch = "wasm32") {
            Self::SharedPool
        } else {
            Self::DedicatedThread
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::DedicatedThread => "dedicated-thread",
            Self::SharedPool => "shared-pool",
        }
    }
}

impl std::str::FromStr for BootstrapStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dedicated-thread" | "thread" => Ok(Self::DedicatedThread),
            "shared-pool" | "pool" => Ok(Self::SharedPool),
            other => Err(format!("unknown bootstrap strategy '{other}'")),
        }
    }
}

/// Starts `kernel` serving `inbox` and reporting on `outbox`. Returns the
/// strategy actually used.
pub(crate) fn launch<K: Kernel>(
    strategy: BootstrapStrategy,
    kernel: K,
    inbox: Receiver<Request>,
    outbox: Sender<WorkerEvent>,
) -> BootstrapStrategy {
    match strategy {
        BootstrapStrategy::DedicatedThread => {
            // The closure owns the unit; if the spawn is refused it comes back
            // through the shared slot so the pool path can take over.
            let slot = std::sync::Arc::new(std::sync::Mutex::new(Some((kernel, inbox, outbox))));
            let thread_slot = slot.clone();
            let spawned = std::thread::Builder::new()
                .name("splat-compute".to_string())
                .spawn(move || {
                    let unit = thread_slot.lock().ok().and_then(|mut s| s.take());
                    if let Some((kernel, inbox, outbox)) = unit {
                        serve(kernel, inbox, outbox);
                    }
                });
            match spawned {
                Ok(_) => BootstrapStrategy::DedicatedThread,
                Err(err) => {
                    log::warn!("compute thread spawn refused ({err}); falling back to shared pool");
                    let unit = slot.lock().ok().and_then(|mut s| s.take());
                    if let Some((kernel, inbox, outbox)) = unit {
                        rayon::spawn(move || serve(kernel, inbox, outbox));
                    }
                    BootstrapStrategy::SharedPool
                }
            }
        }
        BootstrapStrategy::SharedPool => {
            rayon::spawn(move || serve(kernel, inbox, outbox));
            BootstrapStrategy::SharedPool
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "compute unit panicked".to_string()
    }
}

/// Request loop of a compute unit. Ends when the inbox closes (the channel
/// was disposed), when the outbox closes, or after a crash.
pub(crate) fn serve<K: Kernel>(mut kernel: K, inbox: Receiver<Request>, outbox: Sender<WorkerEvent>) {
    while let Ok(Request { id, func, args }) = inbox.recv() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| kernel.dispatch(func, args)));
        let event = match outcome {
            Ok(Ok(payload)) => WorkerEvent::Message(Response::ok(id, payload)),
            Ok(Err(message)) => WorkerEvent::Message(Response::err(id, message)),
            Err(payload) => {
                let reason = panic_message(payload);
                let _ = outbox.send(WorkerEvent::Error(format!("{func}: {reason}")));
                return;
            }
        };
        if outbox.send(event).is_err() {
            return;
        }
    }
}
