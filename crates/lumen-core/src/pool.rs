// src/pool.rs
use crate::error::LumenResult;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

/// Counting semaphore.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Block until a permit is available and take it.
    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    pub fn post(&self) {
        *self.permits.lock() += 1;
        self.available.notify_one();
    }

    pub fn available(&self) -> usize {
        *self.permits.lock()
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO feeding the worker threads.
///
/// The item count doubles as the semaphore count: both are only mutated
/// inside the same critical section, so they cannot disagree.
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
    capacity: usize,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue unless the queue is at capacity or closed. On refusal the
    /// caller keeps ownership of the decision (busy response or teardown).
    pub fn append(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed || state.items.len() >= self.capacity {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Block until an item is available. `None` once the queue is closed.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            // Woken with nothing to take: wait again.
            self.ready.wait(&mut state);
        }
    }

    /// Stop accepting work and wake every waiting worker. Queued items that
    /// were never picked up are dropped.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.items.clear();
        drop(state);
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Fixed set of worker threads draining a [`WorkQueue`].
pub struct ThreadPool<T: Send + 'static> {
    queue: Arc<WorkQueue<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> ThreadPool<T> {
    pub fn new<F>(threads: usize, capacity: usize, handler: F) -> LumenResult<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let queue = Arc::new(WorkQueue::new(capacity));
        let handler = Arc::new(handler);
        let mut workers = Vec::with_capacity(threads);

        for i in 0..threads {
            let worker_queue = queue.clone();
            let worker_handler = handler.clone();
            let spawned = thread::Builder::new()
                .name(format!("lumen-worker-{}", i))
                .spawn(move || {
                    debug!(worker = i, "worker started");
                    while let Some(item) = worker_queue.pop() {
                        worker_handler(item);
                    }
                    debug!(worker = i, "worker exiting");
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Release the threads already waiting on the queue.
                    let mut partial = Self { queue, workers };
                    partial.shutdown();
                    return Err(e.into());
                }
            }
        }

        info!(threads, capacity, "thread pool ready");
        Ok(Self { queue, workers })
    }

    pub fn append(&self, item: T) -> Result<(), T> {
        self.queue.append(item)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Close the queue and join every worker. In-flight items finish;
    /// queued ones are discarded.
    pub fn shutdown(&mut self) {
        self.queue.close();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<T: Send + 'static> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn append_beyond_capacity_is_refused() {
        let queue = WorkQueue::new(2);
        assert!(queue.append(1).is_ok());
        assert!(queue.append(2).is_ok());
        assert_eq!(queue.append(3), Err(3));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), Some(1));
        assert!(queue.append(3).is_ok());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn closed_queue_wakes_waiters() {
        let queue = Arc::new(WorkQueue::<u32>::new(4));
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(waiter.join().unwrap(), None);
        assert_eq!(queue.append(1), Err(1));
    }

    #[test]
    fn workers_process_every_item() {
        let (tx, rx) = mpsc::channel();
        let tx = parking_lot::Mutex::new(tx);
        let pool = ThreadPool::new(3, 64, move |n: usize| {
            tx.lock().send(n * 2).unwrap();
        })
        .unwrap();
        assert_eq!(pool.threads(), 3);

        for n in 0..20 {
            pool.append(n).unwrap();
        }
        let mut got: Vec<usize> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        got.sort_unstable();
        assert_eq!(got, (0..20).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_joins_workers() {
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        let mut pool = ThreadPool::new(2, 8, move |_: ()| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        pool.append(()).unwrap();
        thread::sleep(Duration::from_millis(50));
        pool.shutdown();
        assert_eq!(pool.threads(), 0);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn semaphore_counts_permits() {
        let sem = Semaphore::new(2);
        sem.wait();
        sem.wait();
        assert_eq!(sem.available(), 0);
        sem.post();
        assert_eq!(sem.available(), 1);
        sem.wait();
        assert_eq!(sem.available(), 0);
    }
}
