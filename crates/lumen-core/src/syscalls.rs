// src/syscalls.rs
use crate::error::LumenResult;
use libc::{c_int, c_void};
use serde::Deserialize;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// How readiness is reported for a registered descriptor.
///
/// `Edge` only fires on a state transition, so the owner must drain the
/// socket until it would block. `Level` re-fires while data remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrigMode {
    #[default]
    Level,
    Edge,
}

/// Which readiness a one-shot registration waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// A readiness event translated out of the platform representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    /// Peer hangup, half-close or socket error.
    pub hangup: bool,
}

#[cfg(target_os = "linux")]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: c_int = libc::MSG_DONTWAIT;

// ---- Socket Operations ----

/// Create the non-blocking listening socket.
///
/// `linger` mirrors the classic SO_LINGER switch: when set, `close()` waits up
/// to one second for unsent data instead of returning immediately.
pub fn create_listen_socket(addr: SocketAddr, linger: bool) -> LumenResult<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if linger {
        socket.set_linger(Some(Duration::from_secs(1)))?;
    } else {
        socket.set_linger(None)?;
    }
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(libc::SOMAXCONN)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Accept one pending connection. `Ok(None)` means the backlog is empty.
///
/// The returned descriptor is non-blocking and owned by the caller.
pub fn accept_connection(listener: &Socket) -> LumenResult<Option<(RawFd, Option<SocketAddr>)>> {
    match listener.accept() {
        Ok((socket, addr)) => {
            socket.set_nonblocking(true)?;
            #[cfg(target_os = "macos")]
            socket.set_nosigpipe(true)?;
            Ok(Some((socket.into_raw_fd(), addr.as_socket())))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn set_nonblocking(fd: RawFd) -> LumenResult<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Single `recv` call. `Ok(Some(0))` is an orderly peer shutdown,
/// `Ok(None)` means the socket would block.
pub fn recv_nonblocking(fd: RawFd, buf: &mut [u8]) -> LumenResult<Option<usize>> {
    loop {
        let res = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }
}

/// Non-blocking `send` that never raises SIGPIPE on Linux.
pub fn send_nonblocking(fd: RawFd, buf: &[u8]) -> LumenResult<Option<usize>> {
    loop {
        let res = unsafe { libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), SEND_FLAGS) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }
}

/// Vectored write: all segments in a single syscall (scatter-gather I/O).
pub fn writev_nonblocking(fd: RawFd, bufs: &[&[u8]]) -> LumenResult<Option<usize>> {
    if bufs.is_empty() {
        return Ok(Some(0));
    }

    // Build iovec array on stack (max 8 segments)
    let mut iovecs: [libc::iovec; 8] = unsafe { std::mem::zeroed() };
    let iov_count = bufs.len().min(8);

    for (iov, buf) in iovecs.iter_mut().zip(&bufs[..iov_count]) {
        *iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }

    loop {
        let res = unsafe { libc::writev(fd, iovecs.as_ptr(), iov_count as c_int) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }
}

pub fn close_fd(fd: RawFd) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

/// Create a connected, non-blocking AF_UNIX stream pair. Returns (read, write).
pub fn socket_pair() -> LumenResult<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    // Owned from here on, so an early return closes both ends.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_nonblocking(fds[0])?;
    set_nonblocking(fds[1])?;
    Ok((read, write))
}

/// Writing to a socket the peer already closed must not kill the process.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Schedule SIGALRM in `secs` seconds, replacing any pending alarm.
pub fn arm_alarm(secs: u32) {
    unsafe {
        libc::alarm(secs);
    }
}

// ---- Epoll Operations (Linux) ----

#[cfg(target_os = "linux")]
pub use linux_epoll::*;

#[cfg(target_os = "linux")]
mod linux_epoll {
    use super::*;
    use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, epoll_event};

    /// Buffer that `Epoll::wait` fills.
    pub struct Events {
        raw: Vec<epoll_event>,
        len: usize,
    }

    impl Events {
        pub fn with_capacity(capacity: usize) -> Self {
            Self {
                raw: vec![epoll_event { events: 0, u64: 0 }; capacity.max(1)],
                len: 0,
            }
        }

        pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
            self.raw[..self.len].iter().map(|ev| {
                let bits = ev.events as c_int;
                let token = ev.u64;
                Event {
                    token,
                    readable: bits & EPOLLIN != 0,
                    writable: bits & EPOLLOUT != 0,
                    hangup: bits & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0,
                }
            })
        }
    }

    fn event_bits(interest: Interest, mode: TrigMode, one_shot: bool) -> u32 {
        let mut bits = EPOLLRDHUP
            | match interest {
                Interest::Read => EPOLLIN,
                Interest::Write => EPOLLOUT,
            };
        if mode == TrigMode::Edge {
            bits |= EPOLLET;
        }
        if one_shot {
            bits |= EPOLLONESHOT;
        }
        bits as u32
    }

    pub struct Epoll {
        fd: c_int,
    }

    impl Epoll {
        pub fn new() -> LumenResult<Self> {
            unsafe {
                let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self { fd })
            }
        }

        /// Register `fd`. Connection sockets pass `one_shot = true` so that a
        /// delivered event disarms the descriptor until [`Epoll::rearm`].
        pub fn add(
            &self,
            fd: RawFd,
            token: u64,
            interest: Interest,
            mode: TrigMode,
            one_shot: bool,
        ) -> LumenResult<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, token, event_bits(interest, mode, one_shot))
        }

        /// Re-enable a one-shot registration for the given readiness.
        pub fn rearm(&self, fd: RawFd, token: u64, interest: Interest, mode: TrigMode) -> LumenResult<()> {
            self.ctl(libc::EPOLL_CTL_MOD, fd, token, event_bits(interest, mode, true))
        }

        fn ctl(&self, op: c_int, fd: RawFd, token: u64, events: u32) -> LumenResult<()> {
            let mut event = epoll_event { events, u64: token };
            unsafe {
                if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn delete(&self, fd: RawFd) -> LumenResult<()> {
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ENOENT) {
                        return Err(err.into());
                    }
                }
            }
            Ok(())
        }

        /// Block until readiness or `timeout_ms` (-1 = forever). A signal
        /// interrupting the wait yields `Ok(0)`.
        pub fn wait(&self, events: &mut Events, timeout_ms: i32) -> LumenResult<usize> {
            unsafe {
                let res = libc::epoll_wait(
                    self.fd,
                    events.raw.as_mut_ptr(),
                    events.raw.len() as c_int,
                    timeout_ms,
                );

                if res < 0 {
                    events.len = 0;
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err.into());
                }

                events.len = res as usize;
                Ok(events.len)
            }
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

// ---- Kqueue fallback for macOS development ----

#[cfg(target_os = "macos")]
pub use macos_kqueue::*;

#[cfg(target_os = "macos")]
mod macos_kqueue {
    use super::*;
    use libc::{EV_ADD, EV_CLEAR, EV_DELETE, EV_EOF, EV_ERROR, EV_ONESHOT, EVFILT_READ, EVFILT_WRITE, kevent};
    use std::ptr;

    pub struct Events {
        raw: Vec<kevent>,
        len: usize,
    }

    impl Events {
        pub fn with_capacity(capacity: usize) -> Self {
            Self {
                raw: vec![unsafe { std::mem::zeroed::<kevent>() }; capacity.max(1)],
                len: 0,
            }
        }

        pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
            self.raw[..self.len].iter().map(|ev| Event {
                token: ev.udata as u64,
                readable: ev.filter == EVFILT_READ,
                writable: ev.filter == EVFILT_WRITE,
                hangup: ev.flags & (EV_EOF | EV_ERROR) != 0,
            })
        }
    }

    pub struct Epoll {
        fd: c_int,
    }

    impl Epoll {
        pub fn new() -> LumenResult<Self> {
            unsafe {
                let fd = libc::kqueue();
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self { fd })
            }
        }

        pub fn add(
            &self,
            fd: RawFd,
            token: u64,
            interest: Interest,
            mode: TrigMode,
            one_shot: bool,
        ) -> LumenResult<()> {
            let mut flags = EV_ADD;
            if mode == TrigMode::Edge {
                flags |= EV_CLEAR;
            }
            if one_shot {
                flags |= EV_ONESHOT;
            }
            self.change(fd, token, interest, flags)
        }

        pub fn rearm(&self, fd: RawFd, token: u64, interest: Interest, mode: TrigMode) -> LumenResult<()> {
            self.add(fd, token, interest, mode, true)
        }

        pub fn delete(&self, fd: RawFd) -> LumenResult<()> {
            // Either filter may already be gone after a one-shot fire.
            let _ = self.change(fd, 0, Interest::Read, EV_DELETE);
            let _ = self.change(fd, 0, Interest::Write, EV_DELETE);
            Ok(())
        }

        fn change(&self, fd: RawFd, token: u64, interest: Interest, flags: u16) -> LumenResult<()> {
            let change = kevent {
                ident: fd as usize,
                filter: match interest {
                    Interest::Read => EVFILT_READ,
                    Interest::Write => EVFILT_WRITE,
                },
                flags,
                fflags: 0,
                data: 0,
                udata: token as *mut c_void,
            };
            unsafe {
                if libc::kevent(self.fd, &change, 1, ptr::null_mut(), 0, ptr::null()) < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut Events, timeout_ms: i32) -> LumenResult<usize> {
            let ts = (timeout_ms >= 0).then(|| libc::timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
            });
            let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const libc::timespec);

            unsafe {
                let res = libc::kevent(
                    self.fd,
                    ptr::null(),
                    0,
                    events.raw.as_mut_ptr(),
                    events.raw.len() as c_int,
                    ts_ptr,
                );
                if res < 0 {
                    events.len = 0;
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err.into());
                }
                events.len = res as usize;
                Ok(events.len)
            }
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}
