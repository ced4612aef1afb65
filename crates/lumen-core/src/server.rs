// src/server.rs
use crate::config::ServerConfig;
use crate::context::Context;
use crate::dispatch::{self, Dispatch, Verdict};
use crate::error::{LumenError, LumenResult};
use crate::router::Router;
use crate::signals::{ShutdownHandle, SignalPipe};
use crate::slab::ConnectionSlab;
use crate::store::{CredentialStore, MemoryStore, StorePool, UserTable};
use crate::syscalls::{self, Epoll, Event, Events, Interest, TrigMode};
use crate::timer::TimerList;
use socket2::Socket;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTEN_TOKEN: u64 = u64::MAX;
const SIGNAL_TOKEN: u64 = u64::MAX - 1;
const MAX_EVENT_NUMBER: usize = 10_000;
/// Poll interval while teardowns wait for in-flight work.
const DEFERRED_POLL_MS: i32 = 10;
const BUSY_MESSAGE: &[u8] = b"Internal server busy";

/// The event loop: accepts connections, routes readiness to the dispatcher,
/// owns the timer list and performs every teardown.
pub struct Server {
    listener: Socket,
    local_addr: SocketAddr,
    listen_trig: TrigMode,
    timeslot_secs: u32,
    idle_timeout: Duration,
    ctx: Arc<Context>,
    signals: SignalPipe,
    dispatcher: Box<dyn Dispatch>,
    slab: ConnectionSlab,
    timers: TimerList,
    /// Teardowns postponed because work was still queued or running.
    deferred: Vec<(usize, u64)>,
}

impl Server {
    /// Bind with the store named by `config.users_file` (or an empty
    /// in-memory one).
    pub fn bind(config: ServerConfig) -> LumenResult<Self> {
        let store = match &config.users_file {
            Some(path) => MemoryStore::open(path)?,
            None => MemoryStore::new(),
        };
        Self::with_store(config, &store)
    }

    pub fn with_store(config: ServerConfig, store: &dyn CredentialStore) -> LumenResult<Self> {
        config.validate()?;
        syscalls::ignore_sigpipe();

        let pool = Arc::new(StorePool::connect(store, config.store_pool_size)?);
        let users = Arc::new(UserTable::load(&pool)?);
        let router = Router::new(
            config.doc_root.clone(),
            config.default_page.clone(),
            users,
            pool,
        );

        let listener = syscalls::create_listen_socket(config.server_addr()?, config.linger)?;
        let local_addr = listener
            .local_addr()?
            .as_socket()
            .ok_or_else(|| LumenError::Config("listener is not an inet socket".into()))?;

        let epoll = Epoll::new()?;
        let signals = SignalPipe::new()?;
        epoll.add(
            listener.as_raw_fd(),
            LISTEN_TOKEN,
            Interest::Read,
            config.listen_trig,
            false,
        )?;
        epoll.add(
            signals.read_fd(),
            SIGNAL_TOKEN,
            Interest::Read,
            TrigMode::Level,
            false,
        )?;

        let ctx = Arc::new(Context::new(
            epoll,
            config.max_connections,
            router,
            config.conn_trig,
            signals.notifier(),
        ));
        let dispatcher = dispatch::build(
            config.dispatch,
            ctx.clone(),
            config.threads,
            config.queue_capacity,
        )?;

        info!(
            addr = %local_addr,
            root = %config.doc_root.display(),
            dispatch = ?config.dispatch,
            listen_trig = ?config.listen_trig,
            conn_trig = ?config.conn_trig,
            threads = config.threads,
            "server bound"
        );

        Ok(Self {
            listener,
            local_addr,
            listen_trig: config.listen_trig,
            timeslot_secs: config.timeslot_secs,
            idle_timeout: config.idle_timeout(),
            ctx,
            signals,
            dispatcher,
            slab: ConnectionSlab::new(config.max_connections),
            timers: TimerList::new(),
            deferred: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.signals.shutdown_handle()
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Run until SIGTERM, SIGINT or a [`ShutdownHandle`] stops the loop.
    pub fn run(&mut self) -> LumenResult<()> {
        self.signals.install()?;
        syscalls::arm_alarm(self.timeslot_secs);
        info!(addr = %self.local_addr, "lumen listening");

        let result = self.event_loop();
        if let Err(e) = &result {
            error!(error = %e, "event loop failed");
        }
        self.stop();
        result
    }

    fn event_loop(&mut self) -> LumenResult<()> {
        let mut events = Events::with_capacity(MAX_EVENT_NUMBER);
        let mut stop = false;

        while !stop {
            let timeout = if self.deferred.is_empty() {
                -1
            } else {
                DEFERRED_POLL_MS
            };
            self.ctx.epoll.wait(&mut events, timeout)?;

            let mut tick = false;
            for event in events.iter() {
                match event.token {
                    LISTEN_TOKEN => self.accept(),
                    SIGNAL_TOKEN => {
                        let batch = self.signals.drain()?;
                        tick |= batch.tick;
                        stop |= batch.stop;
                    }
                    token => self.handle_conn_event(token as usize, event),
                }
            }

            for (slot, generation) in self.ctx.take_close_requests() {
                self.teardown(slot, generation);
            }
            self.retry_deferred();

            if tick {
                self.sweep(Instant::now());
                syscalls::arm_alarm(self.timeslot_secs);
            }
        }
        Ok(())
    }

    fn accept(&mut self) {
        loop {
            match syscalls::accept_connection(&self.listener) {
                Ok(Some((fd, peer))) => self.admit(fd, peer),
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
            // Level-triggered listeners fire again for the rest of the backlog.
            if self.listen_trig == TrigMode::Level {
                break;
            }
        }
    }

    fn admit(&mut self, fd: RawFd, peer: Option<SocketAddr>) {
        let Some(idx) = self.slab.allocate(fd) else {
            warn!(peer = ?peer, live = self.ctx.metrics.live(), "connection table full");
            let _ = syscalls::send_nonblocking(fd, BUSY_MESSAGE);
            syscalls::close_fd(fd);
            return;
        };

        let slot = &self.ctx.slots[idx];
        if let Err(e) = slot.conn.lock().init(fd, peer, idx as u64, &self.ctx) {
            error!(peer = ?peer, error = %e, "failed to register connection");
            syscalls::close_fd(fd);
            self.slab.free(idx);
            return;
        }

        let timer = self.timers.add(Instant::now() + self.idle_timeout, idx);
        if let Some(meta) = self.slab.get_mut(idx) {
            meta.timer = Some(timer);
        }
        info!(peer = ?peer, slot = idx, live = self.ctx.metrics.live(), "connection accepted");
    }

    fn handle_conn_event(&mut self, idx: usize, event: Event) {
        if self.slab.get(idx).is_none() {
            return;
        }
        let generation = self.ctx.slots[idx].generation();

        if event.hangup {
            debug!(slot = idx, "peer hung up");
            self.teardown(idx, generation);
            return;
        }

        let verdict = if event.readable {
            self.dispatcher.readable(&self.ctx, idx, generation)
        } else if event.writable {
            self.dispatcher.writable(&self.ctx, idx, generation)
        } else {
            return;
        };

        match verdict {
            Verdict::Keep => self.extend_timer(idx),
            Verdict::Close => self.teardown(idx, generation),
        }
    }

    fn extend_timer(&mut self, idx: usize) {
        if let Some(timer) = self.slab.get(idx).and_then(|meta| meta.timer) {
            self.timers.adjust(timer, Instant::now() + self.idle_timeout);
            debug!(slot = idx, "idle deadline extended");
        }
    }

    /// Evict connections idle as of `now`. Slots with work in flight get a
    /// fresh deadline instead.
    fn sweep(&mut self, now: Instant) {
        let mut expired = Vec::new();
        self.timers.tick(now, |e| expired.push(e));

        for e in expired {
            let Some(meta) = self.slab.get_mut(e.slot) else {
                continue;
            };
            if meta.timer != Some(e.id) {
                continue;
            }
            meta.timer = None;

            let slot = &self.ctx.slots[e.slot];
            if slot.pending() > 0 {
                meta.timer = Some(self.timers.add(now + self.idle_timeout, e.slot));
                continue;
            }
            info!(slot = e.slot, "idle connection expired");
            let generation = slot.generation();
            self.teardown(e.slot, generation);
        }
    }

    /// Close the connection in `idx` unless it belongs to an older
    /// generation. Postponed while a worker still owns the slot.
    fn teardown(&mut self, idx: usize, generation: u64) {
        let slot = &self.ctx.slots[idx];
        if slot.generation() != generation || self.slab.get(idx).is_none() {
            return;
        }
        if slot.pending() > 0 {
            if !self.deferred.contains(&(idx, generation)) {
                self.deferred.push((idx, generation));
            }
            return;
        }
        self.release(idx);
    }

    fn retry_deferred(&mut self) {
        for (slot, generation) in std::mem::take(&mut self.deferred) {
            self.teardown(slot, generation);
        }
    }

    fn release(&mut self, idx: usize) {
        if let Some(timer) = self.slab.get_mut(idx).and_then(|meta| meta.timer.take()) {
            self.timers.remove(timer);
        }
        let slot = &self.ctx.slots[idx];
        slot.conn.lock().close_conn(&self.ctx);
        slot.retire();
        self.slab.free(idx);
    }

    fn stop(&mut self) {
        info!("shutting down");
        self.dispatcher.shutdown();

        let active: Vec<usize> = self.slab.active().collect();
        for idx in active {
            self.release(idx);
        }
        self.deferred.clear();

        let metrics = &self.ctx.metrics;
        info!(
            requests = metrics.requests(),
            bytes_sent = metrics.bytes(),
            "server stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpStream;
    use std::thread;

    fn server() -> (tempfile::TempDir, Server) {
        let root = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            doc_root: root.path().to_path_buf(),
            threads: 1,
            ..ServerConfig::default()
        };
        let server = Server::with_store(config, &MemoryStore::new()).unwrap();
        (root, server)
    }

    /// Connect a client and admit it through the accept path.
    fn admit_one(server: &mut Server) -> (TcpStream, usize) {
        let client = TcpStream::connect(server.local_addr()).unwrap();
        for _ in 0..100 {
            server.accept();
            if let Some(idx) = server.slab.active().next() {
                return (client, idx);
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("connection was never accepted");
    }

    #[test]
    fn teardown_waits_for_in_flight_work() {
        let (_root, mut server) = server();
        let (mut client, idx) = admit_one(&mut server);
        let ctx = server.ctx.clone();
        let generation = ctx.slots[idx].generation();

        ctx.slots[idx].begin_work();
        server.teardown(idx, generation);
        server.teardown(idx, generation);
        assert!(server.slab.get(idx).is_some());
        assert_eq!(server.deferred, vec![(idx, generation)]);

        // Still busy: the retry defers again.
        server.retry_deferred();
        assert!(server.slab.get(idx).is_some());
        assert_eq!(server.deferred.len(), 1);

        ctx.slots[idx].end_work();
        server.retry_deferred();
        assert!(server.slab.get(idx).is_none());
        assert!(server.deferred.is_empty());
        assert_eq!(ctx.slots[idx].generation(), generation + 1);
        assert_eq!(ctx.metrics.live(), 0);

        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn stale_teardown_is_ignored() {
        let (_root, mut server) = server();
        let (_client, idx) = admit_one(&mut server);
        let generation = server.ctx.slots[idx].generation();

        server.teardown(idx, generation + 1);
        assert!(server.slab.get(idx).is_some());
        server.teardown(idx, generation);
        assert!(server.slab.get(idx).is_none());
    }

    #[test]
    fn due_timer_on_busy_slot_gets_fresh_deadline() {
        let (_root, mut server) = server();
        let (_client, idx) = admit_one(&mut server);
        let ctx = server.ctx.clone();
        let first = server.slab.get(idx).and_then(|meta| meta.timer).unwrap();
        let due = server.timers.expiry(first).unwrap();

        ctx.slots[idx].begin_work();
        server.sweep(due);
        let renewed = server
            .slab
            .get(idx)
            .and_then(|meta| meta.timer)
            .expect("busy slot keeps a timer");
        assert_ne!(renewed, first);
        assert_eq!(server.timers.expiry(first), None);
        assert_eq!(server.timers.expiry(renewed), Some(due + server.idle_timeout));
        assert_eq!(server.timers.len(), 1);

        ctx.slots[idx].end_work();
        server.sweep(due + server.idle_timeout);
        assert!(server.slab.get(idx).is_none());
        assert_eq!(server.timers.len(), 0);
    }

    #[test]
    fn sweep_leaves_fresh_connections_alone() {
        let (_root, mut server) = server();
        let (_client, idx) = admit_one(&mut server);
        server.sweep(Instant::now());
        assert!(server.slab.get(idx).is_some());
    }
}
