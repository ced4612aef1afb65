// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide counters. `live_conns` is also the admission-control count
/// checked on every accept.
#[repr(C, align(64))]
pub struct ServerMetrics {
    pub live_conns: AtomicUsize,
    pub req_count: AtomicUsize,
    pub bytes_sent: AtomicUsize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            live_conns: AtomicUsize::new(0),
            req_count: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
        }
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.live_conns.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_conn(&self) {
        self.live_conns.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn live(&self) -> usize {
        self.live_conns.load(Ordering::Acquire)
    }

    pub fn requests(&self) -> usize {
        self.req_count.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> usize {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
