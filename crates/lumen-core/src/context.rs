// src/context.rs
use crate::conn::HttpConn;
use crate::metrics::ServerMetrics;
use crate::router::Router;
use crate::signals::Notifier;
use crate::syscalls::{Epoll, TrigMode};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Shared half of a connection slot.
///
/// One-shot readiness already guarantees a single owner per event; the mutex
/// only makes that hand-off visible to the type system and is uncontended in
/// practice.
pub struct Slot {
    pub conn: Mutex<HttpConn>,
    /// Work items queued or running for this slot.
    pending: AtomicUsize,
    /// Bumped on every teardown; work items carrying an older value are
    /// ignored.
    generation: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            conn: Mutex::new(HttpConn::new()),
            pending: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Called by the event loop once the slot is torn down.
    pub fn retire(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn begin_work(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end_work(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Everything the event loop and the workers share, passed explicitly.
pub struct Context {
    pub epoll: Epoll,
    pub slots: Box<[Slot]>,
    pub metrics: ServerMetrics,
    pub router: Router,
    pub conn_trig: TrigMode,
    notifier: Notifier,
    close_requests: Mutex<Vec<(usize, u64)>>,
}

impl Context {
    pub fn new(
        epoll: Epoll,
        capacity: usize,
        router: Router,
        conn_trig: TrigMode,
        notifier: Notifier,
    ) -> Self {
        Self {
            epoll,
            slots: (0..capacity).map(|_| Slot::new()).collect(),
            metrics: ServerMetrics::new(),
            router,
            conn_trig,
            notifier,
            close_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    /// Ask the event loop to tear down `slot`. Workers never close sockets or
    /// touch timers themselves.
    pub fn request_close(&self, slot: usize, generation: u64) {
        self.close_requests.lock().push((slot, generation));
        self.notifier.wake();
    }

    pub fn take_close_requests(&self) -> Vec<(usize, u64)> {
        std::mem::take(&mut *self.close_requests.lock())
    }
}
