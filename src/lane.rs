//! Execution lanes: ordered work queues with explicit wait/signal handshakes.
//!
//! A lane is one worker thread draining a FIFO channel. Work on one lane runs in
//! submission order; two lanes only order against each other through [`Event`]s, one
//! lane recording an event after its work and another enqueuing a wait on it.

use crate::error::FactorError;
use crate::tensor::Tensor;
use crossbeam::channel::{self, Sender};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// One-shot completion flag shared between lanes.
#[derive(Debug, Clone, Default)]
pub struct Event {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        let (done, cvar) = &*self.inner;
        *done.lock() = true;
        cvar.notify_all();
    }

    pub fn wait(&self) {
        let (done, cvar) = &*self.inner;
        let mut done = done.lock();
        while !*done {
            cvar.wait(&mut done);
        }
    }

    pub fn is_set(&self) -> bool {
        *self.inner.0.lock()
    }
}

pub struct Lane {
    id: usize,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl std::fmt::Debug for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lane").field("id", &self.id).finish()
    }
}

impl Lane {
    pub fn spawn(id: usize) -> Result<Self, FactorError> {
        let (sender, receiver) = channel::unbounded::<Job>();
        let worker = thread::Builder::new()
            .name(format!("factor-lane-{id}"))
            .spawn(move || {
                for job in receiver {
                    // Keep draining: later events must still fire.
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                        warn!("lane {id} job panicked: {}", panic_message(&*payload));
                    }
                }
            })
            .map_err(|err| FactorError::LaneSpawn {
                reason: err.to_string(),
            })?;
        let worker_id = worker.thread().id();
        debug!("lane {id} opened");
        Ok(Self {
            id,
            sender: Some(sender),
            worker: Some(worker),
            worker_id,
        })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Enqueues `job` behind everything already submitted to this lane.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = &self.sender else {
            return;
        };
        // Worker gone: run inline so waiters still wake.
        if let Err(err) = sender.send(Box::new(job)) {
            (err.into_inner())();
        }
    }

    /// Event that fires once all work submitted so far has run.
    pub fn record_event(&self) -> Event {
        let event = Event::new();
        let signal = event.clone();
        self.submit(move || signal.signal());
        event
    }

    /// Holds back later work on this lane until `event` fires.
    pub fn wait_event(&self, event: &Event) {
        if event.is_set() {
            return;
        }
        let event = event.clone();
        self.submit(move || event.wait());
    }

    /// Blocks the calling thread until this lane has drained.
    pub fn synchronize(&self) {
        self.record_event().wait();
    }
}

impl Drop for Lane {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if thread::current().id() != self.worker_id {
                let _ = worker.join();
            }
        }
        debug!("lane {} closed", self.id);
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Lanes opened during one run; all are joined when the pool drops.
#[derive(Debug, Default)]
pub struct LanePool {
    lanes: Mutex<Vec<Arc<Lane>>>,
}

impl LanePool {
    pub fn open(&self) -> Result<Arc<Lane>, FactorError> {
        let mut lanes = self.lanes.lock();
        let lane = Arc::new(Lane::spawn(lanes.len())?);
        lanes.push(Arc::clone(&lane));
        Ok(lane)
    }

    pub fn len(&self) -> usize {
        self.lanes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type NodeResult = Result<Arc<Tensor>, FactorError>;

#[derive(Debug, Default)]
struct Slot {
    value: OnceLock<NodeResult>,
    done: Event,
}

/// Handle to a node result that may still be in flight on some lane.
#[derive(Debug, Clone, Default)]
pub struct Output {
    slot: Arc<Slot>,
}

impl Output {
    pub fn ready(result: NodeResult) -> Self {
        let out = Self::pending();
        out.fulfill(result);
        out
    }

    pub fn pending() -> Self {
        Self::default()
    }

    /// First call wins; later calls are ignored.
    pub fn fulfill(&self, result: NodeResult) {
        let _ = self.slot.value.set(result);
        self.slot.done.signal();
    }

    pub fn is_ready(&self) -> bool {
        self.slot.done.is_set()
    }

    /// Blocks until the producing lane has fulfilled this output.
    pub fn wait(&self) -> NodeResult {
        self.slot.done.wait();
        match self.slot.value.get() {
            Some(result) => result.clone(),
            None => Err(FactorError::NotPrepared {
                node: "output".to_string(),
            }),
        }
    }

    pub fn same(&self, other: &Output) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}
