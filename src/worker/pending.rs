use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

use super::error::WorkerError;
use super::protocol::{Payload, WorkerFn};

pub(crate) type Outcome = Result<Payload, WorkerError>;

pub(crate) struct PendingTask {
    pub(crate) func: WorkerFn,
    pub(crate) started: Instant,
    pub(crate) deadline: Option<Instant>,
    waiters: Vec<Sender<Outcome>>,
}

impl PendingTask {
    pub(crate) fn new(func: WorkerFn, started: Instant, deadline: Option<Instant>) -> (Self, Receiver<Outcome>) {
        let (tx, rx) = bounded(1);
        (
            Self {
                func,
                started,
                deadline,
                waiters: vec![tx],
            },
            rx,
        )
    }

    /// Adds another handle that settles with the same outcome.
    pub(crate) fn share(&mut self) -> Receiver<Outcome> {
        let (tx, rx) = bounded(1);
        self.waiters.push(tx);
        rx
    }

    pub(crate) fn settle(mut self, outcome: Outcome) {
        let last = self.waiters.pop();
        for waiter in self.waiters {
            let _ = waiter.send(outcome.clone());
        }
        if let Some(waiter) = last {
            let _ = waiter.send(outcome);
        }
    }
}

/// In-flight calls keyed by correlation id, plus a deadline heap so one
/// router thread can expire them without a timer per call.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: HashMap<u64, PendingTask>,
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
}

impl PendingTable {
    pub(crate) fn insert(&mut self, id: u64, task: PendingTask) {
        if let Some(deadline) = task.deadline {
            self.deadlines.push(Reverse((deadline, id)));
        }
        self.entries.insert(id, task);
    }

    pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut PendingTask> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: u64) -> Option<PendingTask> {
        self.entries.remove(&id)
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Earliest live deadline; stale heap entries are discarded on the way.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, id))) = self.deadlines.peek().copied() {
            match self.entries.get(&id) {
                Some(task) if task.deadline == Some(at) => return Some(at),
                _ => {
                    self.deadlines.pop();
                }
            }
        }
        None
    }

    /// Removes every task whose deadline is at or before `now`.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<(u64, PendingTask)> {
        let mut expired = Vec::new();
        while let Some(Reverse((at, id))) = self.deadlines.peek().copied() {
            if at > now {
                break;
            }
            self.deadlines.pop();
            if self.entries.get(&id).is_some_and(|t| t.deadline == Some(at)) {
                if let Some(task) = self.entries.remove(&id) {
                    expired.push((id, task));
                }
            }
        }
        expired
    }

    pub(crate) fn drain(&mut self) -> Vec<PendingTask> {
        self.deadlines.clear();
        self.entries.drain().map(|(_, task)| task).collect()
    }

    /// Drops every entry without settling it.
    pub(crate) fn abandon(&mut self) {
        self.deadlines.clear();
        self.entries.clear();
    }
}

/// Handle to one call that settles asynchronously.
///
/// Never blocks unless asked to: frame code polls with [`Pending::try_take`].
#[derive(Debug)]
pub struct Pending<T> {
    id: u64,
    func: WorkerFn,
    rx: Receiver<Outcome>,
    map: fn(Payload) -> Option<T>,
}

impl<T> Pending<T> {
    pub(crate) fn new(id: u64, func: WorkerFn, rx: Receiver<Outcome>, map: fn(Payload) -> Option<T>) -> Self {
        Self { id, func, rx, map }
    }

    /// A handle that is already settled.
    pub(crate) fn settled(id: u64, func: WorkerFn, outcome: Outcome, map: fn(Payload) -> Option<T>) -> Self {
        let (tx, rx) = bounded(1);
        let _ = tx.send(outcome);
        Self::new(id, func, rx, map)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn function(&self) -> WorkerFn {
        self.func
    }

    fn finish(&self, outcome: Outcome) -> Result<T, WorkerError> {
        let payload = outcome?;
        (self.map)(payload).ok_or(WorkerError::UnexpectedPayload {
            function: self.func,
        })
    }

    /// Returns the outcome once settled, `None` while still in flight.
    pub fn try_take(&mut self) -> Option<Result<T, WorkerError>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(self.finish(outcome)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(WorkerError::Disposed)),
        }
    }

    pub fn wait(self) -> Result<T, WorkerError> {
        match self.rx.recv() {
            Ok(outcome) => self.finish(outcome),
            Err(_) => Err(WorkerError::Disposed),
        }
    }

    /// Blocks for at most `limit`; `None` if the call is still in flight.
    pub fn wait_for(&mut self, limit: Duration) -> Option<Result<T, WorkerError>> {
        match self.rx.recv_timeout(limit) {
            Ok(outcome) => Some(self.finish(outcome)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => None,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Some(Err(WorkerError::Disposed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_tasks_leave_the_table() {
        let mut table = PendingTable::default();
        let now = Instant::now();
        let (a, _rx_a) = PendingTask::new(WorkerFn::Sort, now, Some(now + Duration::from_millis(5)));
        let (b, _rx_b) = PendingTask::new(WorkerFn::Sort, now, Some(now + Duration::from_millis(50)));
        let (c, _rx_c) = PendingTask::new(WorkerFn::Sort, now, None);
        table.insert(1, a);
        table.insert(2, b);
        table.insert(3, c);

        assert_eq!(table.next_deadline(), Some(now + Duration::from_millis(5)));
        let expired = table.take_expired(now + Duration::from_millis(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, 1);
        assert!(!table.contains(1));
        assert_eq!(table.ids(), vec![2, 3]);
    }

    #[test]
    fn removed_task_deadline_is_skipped() {
        let mut table = PendingTable::default();
        let now = Instant::now();
        let (a, _rx) = PendingTask::new(WorkerFn::Sort, now, Some(now));
        table.insert(7, a);
        table.remove(7);
        assert_eq!(table.next_deadline(), None);
        assert!(table.take_expired(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn shared_task_settles_every_waiter() {
        let (mut task, rx_a) = PendingTask::new(WorkerFn::Init, Instant::now(), None);
        let rx_b = task.share();
        task.settle(Ok(Payload::Ready));
        assert_eq!(rx_a.recv(), Ok(Ok(Payload::Ready)));
        assert_eq!(rx_b.recv(), Ok(Ok(Payload::Ready)));
    }
}
