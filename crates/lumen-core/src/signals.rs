//! Self-pipe for signals and cross-thread wakeups.
//!
//! Signal handlers write exactly one byte (the signal number) into the pipe
//! and do nothing else. The read end is registered in the event loop's
//! readiness set, so all real handling happens on the event-loop thread.
//! Worker threads use the same pipe with a zero byte to wake the loop.

use crate::error::{LumenError, LumenResult};
use crate::syscalls::{self, recv_nonblocking, send_nonblocking};
use signal_hook::SigId;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use tracing::{debug, warn};

const WAKE_BYTE: u8 = 0;

/// Flags recovered from one drain of the pipe.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SignalBatch {
    /// SIGALRM arrived: run the timer sweep.
    pub tick: bool,
    /// SIGTERM or SIGINT arrived: leave the loop.
    pub stop: bool,
    /// A worker posted completion notices.
    pub woken: bool,
}

/// Write side of the pipe, shared by workers and shutdown handles.
#[derive(Clone, Debug)]
pub struct Notifier {
    fd: Arc<OwnedFd>,
}

impl Notifier {
    pub fn notify(&self, byte: u8) {
        match send_nonblocking(self.fd.as_raw_fd(), &[byte]) {
            Ok(Some(_)) => {}
            // Pipe full: the loop already has unread bytes and will wake.
            Ok(None) => {}
            Err(e) => warn!(error = %e, "self-pipe write failed"),
        }
    }

    pub fn wake(&self) {
        self.notify(WAKE_BYTE);
    }
}

/// Stops a running server from any thread.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    notifier: Notifier,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.notifier.notify(libc::SIGTERM as u8);
    }
}

pub struct SignalPipe {
    read: OwnedFd,
    notifier: Notifier,
    installed: Vec<SigId>,
}

impl SignalPipe {
    pub fn new() -> LumenResult<Self> {
        let (read, write) = syscalls::socket_pair()?;
        Ok(Self {
            read,
            notifier: Notifier {
                fd: Arc::new(write),
            },
            installed: Vec::new(),
        })
    }

    /// Route SIGALRM, SIGTERM and SIGINT into the pipe.
    pub fn install(&mut self) -> LumenResult<()> {
        for signal in [libc::SIGALRM, libc::SIGTERM, libc::SIGINT] {
            let fd = self.notifier.fd.clone();
            let byte = signal as u8;
            // SAFETY: the action only calls send(2), which is async-signal-safe,
            // and the captured Arc keeps the descriptor open for its lifetime.
            let id = unsafe {
                signal_hook::low_level::register(signal, move || {
                    libc::send(
                        fd.as_raw_fd(),
                        &byte as *const u8 as *const libc::c_void,
                        1,
                        libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
                    );
                })
            }
            .map_err(|e| LumenError::Signal(format!("signal {}: {}", signal, e)))?;
            self.installed.push(id);
        }
        debug!("signal handlers installed");
        Ok(())
    }

    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            notifier: self.notifier.clone(),
        }
    }

    /// Read every pending byte and fold them into flags.
    pub fn drain(&self) -> LumenResult<SignalBatch> {
        let mut batch = SignalBatch::default();
        let mut buf = [0u8; 1024];
        loop {
            match recv_nonblocking(self.read.as_raw_fd(), &mut buf)? {
                None | Some(0) => break,
                Some(n) => {
                    for &byte in &buf[..n] {
                        match byte as i32 {
                            libc::SIGALRM => batch.tick = true,
                            libc::SIGTERM | libc::SIGINT => batch.stop = true,
                            _ => batch.woken = true,
                        }
                    }
                }
            }
        }
        Ok(batch)
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        for id in self.installed.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_folds_bytes_into_flags() {
        let pipe = SignalPipe::new().unwrap();
        assert_eq!(pipe.drain().unwrap(), SignalBatch::default());

        pipe.notifier().wake();
        pipe.notifier().notify(libc::SIGALRM as u8);
        pipe.notifier().notify(libc::SIGALRM as u8);
        let batch = pipe.drain().unwrap();
        assert!(batch.tick && batch.woken);
        assert!(!batch.stop);

        // Fully drained.
        assert_eq!(pipe.drain().unwrap(), SignalBatch::default());
    }

    #[test]
    fn shutdown_handle_requests_stop() {
        let pipe = SignalPipe::new().unwrap();
        pipe.shutdown_handle().shutdown();
        assert!(pipe.drain().unwrap().stop);
    }

    #[test]
    fn alarm_signal_lands_in_pipe() {
        let mut pipe = SignalPipe::new().unwrap();
        pipe.install().unwrap();
        unsafe {
            libc::raise(libc::SIGALRM);
        }
        assert!(pipe.drain().unwrap().tick);
    }
}
