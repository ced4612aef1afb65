//! Per-socket HTTP/1.1 state machine.
//!
//! An [`HttpConn`] owns the read and write buffers of one client socket. The
//! request is parsed incrementally: [`HttpConn::parse_line`] finds CRLF
//! terminated lines in the unread part of the read buffer and the main state
//! machine (`RequestLine -> Headers -> Body`) consumes them one at a time.
//! Responses are written with a two-segment `writev`: the header block from
//! the write buffer, then the memory-mapped file.

use crate::buffer::FixedBuf;
use crate::context::Context;
use crate::error::LumenResult;
use crate::router::{Router, StaticFile};
use crate::syscalls::{self, Interest, TrigMode};
use std::fmt;
use std::net::SocketAddr;
use std::ops::Range;
use std::os::fd::RawFd;
use std::path::PathBuf;
use tracing::{debug, trace};

pub const READ_BUFFER_SIZE: usize = 2048;
pub const WRITE_BUFFER_SIZE: usize = 1024;

const EMPTY_PAGE: &str = "<html><body></body></html>";
const HTML: &str = "text/html";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
}

/// Main parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    RequestLine,
    Headers,
    Body,
}

/// Result of one [`HttpConn::parse_line`] scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line was found and its CRLF rewritten to two NULs.
    Ok,
    /// A bare `\n` without a preceding `\r`.
    Bad,
    /// The received data ends mid-line.
    Open,
}

/// Outcome of parsing and resolving a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// Incomplete; wait for more bytes.
    NoRequest,
    GetRequest,
    BadRequest,
    NoResource,
    Forbidden,
    FileRequest,
    InternalError,
}

impl HttpCode {
    /// Status, reason phrase and fixed body of an error response.
    fn error_page(self) -> Option<(u16, &'static str, &'static str)> {
        match self {
            HttpCode::BadRequest => Some((
                400,
                "Bad Request",
                "Your request has bad syntax or is inherently impossible to satisfy.\n",
            )),
            HttpCode::Forbidden => Some((
                403,
                "Forbidden",
                "You do not have permission to get file from this server.\n",
            )),
            HttpCode::NoResource => Some((
                404,
                "Not Found",
                "The requested file was not found on this server.\n",
            )),
            HttpCode::InternalError => Some((
                500,
                "Internal Error",
                "There was an unusual problem serving the request file.\n",
            )),
            _ => None,
        }
    }
}

/// What [`HttpConn::process`] left the connection waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// Request incomplete; re-armed for read.
    NeedMore,
    /// Response built; re-armed for write.
    Ready,
    /// Response could not be built or the socket could not be re-armed.
    /// The caller must close.
    Failed,
}

/// Parsed request fields. Strings keep their capacity across keep-alive
/// requests.
#[derive(Debug, Default)]
pub struct Request {
    pub method: Method,
    pub target: String,
    pub version: String,
    pub host: String,
    pub content_length: usize,
    pub keep_alive: bool,
    /// Body location inside the read buffer.
    pub body: Range<usize>,
}

enum HeaderLine {
    Field,
    End,
}

const BLANKS: [char; 2] = [' ', '\t'];

impl Request {
    fn reset(&mut self) {
        self.method = Method::Get;
        self.target.clear();
        self.version.clear();
        self.host.clear();
        self.content_length = 0;
        self.keep_alive = false;
        self.body = 0..0;
    }

    /// `METHOD SP target SP version`, blanks being spaces or tabs.
    fn parse_request_line(&mut self, text: &[u8], default_page: &str) -> bool {
        let Ok(text) = std::str::from_utf8(text) else {
            return false;
        };
        let Some((method, rest)) = text.split_once(BLANKS) else {
            return false;
        };
        self.method = if method.eq_ignore_ascii_case("GET") {
            Method::Get
        } else if method.eq_ignore_ascii_case("POST") {
            Method::Post
        } else {
            return false;
        };

        let rest = rest.trim_start_matches(BLANKS);
        let Some((mut url, version)) = rest.split_once(BLANKS) else {
            return false;
        };
        let version = version.trim_start_matches(BLANKS);
        if !version.eq_ignore_ascii_case("HTTP/1.1") {
            return false;
        }

        for scheme in ["http://", "https://"] {
            let prefixed = url
                .as_bytes()
                .get(..scheme.len())
                .is_some_and(|p| p.eq_ignore_ascii_case(scheme.as_bytes()));
            if prefixed {
                match url[scheme.len()..].find('/') {
                    Some(p) => url = &url[scheme.len() + p..],
                    None => return false,
                }
            }
        }
        if !url.starts_with('/') {
            return false;
        }

        self.target.clear();
        self.target.push_str(url);
        if url.len() == 1 {
            self.target.push_str(default_page);
        }
        self.version.clear();
        self.version.push_str(version);
        true
    }

    /// One header line; an empty line ends the header block. Only
    /// `Connection`, `Content-Length` and `Host` are interpreted.
    fn parse_header(&mut self, text: &[u8]) -> Option<HeaderLine> {
        if text.is_empty() {
            return Some(HeaderLine::End);
        }
        let Some((name, value)) = std::str::from_utf8(text)
            .ok()
            .and_then(|t| t.split_once(':'))
        else {
            trace!(line = %String::from_utf8_lossy(text), "unrecognized header line");
            return Some(HeaderLine::Field);
        };
        let value = value.trim_matches(BLANKS);

        if name.eq_ignore_ascii_case("Connection") {
            if value.eq_ignore_ascii_case("keep-alive") {
                self.keep_alive = true;
            }
        } else if name.eq_ignore_ascii_case("Content-Length") {
            // A body larger than the read buffer can never be buffered.
            self.content_length = value.parse::<usize>().ok().filter(|&n| n <= READ_BUFFER_SIZE)?;
        } else if name.eq_ignore_ascii_case("Host") {
            self.host.clear();
            self.host.push_str(value);
        } else {
            trace!(header = name, "header ignored");
        }
        Some(HeaderLine::Field)
    }
}

/// The text of the line starting at `start`, up to the first NUL that
/// `parse_line` left behind.
fn line_at(buf: &[u8], start: usize) -> &[u8] {
    let rest = &buf[start..];
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    &rest[..end]
}

pub struct HttpConn {
    fd: RawFd,
    token: u64,
    peer: Option<SocketAddr>,
    trig: TrigMode,

    read_buf: FixedBuf,
    checked_idx: usize,
    start_line: usize,
    check_state: CheckState,
    request: Request,

    write_buf: FixedBuf,
    real_file: PathBuf,
    file: Option<StaticFile>,
    bytes_sent: usize,
    bytes_to_send: usize,
}

impl Default for HttpConn {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpConn {
    /// An idle slot with no socket.
    pub fn new() -> Self {
        Self {
            fd: -1,
            token: 0,
            peer: None,
            trig: TrigMode::Level,
            read_buf: FixedBuf::with_capacity(READ_BUFFER_SIZE),
            checked_idx: 0,
            start_line: 0,
            check_state: CheckState::RequestLine,
            request: Request::default(),
            write_buf: FixedBuf::with_capacity(WRITE_BUFFER_SIZE),
            real_file: PathBuf::new(),
            file: None,
            bytes_sent: 0,
            bytes_to_send: 0,
        }
    }

    /// Adopt a freshly accepted socket: reset all request state, register it
    /// for one-shot read readiness and count it as live.
    pub fn init(
        &mut self,
        fd: RawFd,
        peer: Option<SocketAddr>,
        token: u64,
        ctx: &Context,
    ) -> LumenResult<()> {
        self.fd = fd;
        self.peer = peer;
        self.token = token;
        self.trig = ctx.conn_trig;
        self.reset();

        syscalls::set_nonblocking(fd)?;
        ctx.epoll.add(fd, token, Interest::Read, self.trig, true)?;
        ctx.metrics.inc_conn();
        Ok(())
    }

    /// Clear per-request state. The socket and its registration are kept.
    fn reset(&mut self) {
        self.read_buf.clear();
        self.checked_idx = 0;
        self.start_line = 0;
        self.check_state = CheckState::RequestLine;
        self.request.reset();
        self.write_buf.clear();
        self.file = None;
        self.bytes_sent = 0;
        self.bytes_to_send = 0;
    }

    /// Remove the socket from the readiness set, close it and release the
    /// mapping. Safe to call twice.
    pub fn close_conn(&mut self, ctx: &Context) {
        if self.fd == -1 {
            return;
        }
        if let Err(e) = ctx.epoll.delete(self.fd) {
            debug!(fd = self.fd, error = %e, "epoll delete failed");
        }
        syscalls::close_fd(self.fd);
        debug!(fd = self.fd, peer = ?self.peer, "connection closed");
        self.fd = -1;
        self.file = None;
        ctx.metrics.dec_conn();
    }

    /// Pull available bytes into the read buffer.
    ///
    /// Level-triggered sockets get one `recv`; edge-triggered sockets are
    /// drained until they would block. Returns `false` on peer close, socket
    /// error or a full read buffer.
    pub fn read_once(&mut self) -> bool {
        if self.read_buf.remaining_capacity() == 0 {
            return false;
        }
        match self.trig {
            TrigMode::Level => match syscalls::recv_nonblocking(self.fd, self.read_buf.spare_mut()) {
                Ok(Some(0)) => false,
                Ok(Some(n)) => {
                    self.read_buf.commit(n);
                    true
                }
                Ok(None) => true,
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "recv failed");
                    false
                }
            },
            TrigMode::Edge => loop {
                if self.read_buf.remaining_capacity() == 0 {
                    return false;
                }
                match syscalls::recv_nonblocking(self.fd, self.read_buf.spare_mut()) {
                    Ok(Some(0)) => return false,
                    Ok(Some(n)) => self.read_buf.commit(n),
                    Ok(None) => return true,
                    Err(e) => {
                        debug!(fd = self.fd, error = %e, "recv failed");
                        return false;
                    }
                }
            },
        }
    }

    /// Scan `[checked_idx, read_len)` for the next CRLF.
    ///
    /// On `Ok` the terminator has been rewritten to `\0\0` and `checked_idx`
    /// points just past it. A `\r` as the very last received byte is `Open`,
    /// since its `\n` may still be in flight.
    pub fn parse_line(&mut self) -> LineStatus {
        let read_idx = self.read_buf.len();
        let buf = self.read_buf.filled_mut();
        while self.checked_idx < read_idx {
            match buf[self.checked_idx] {
                b'\r' => {
                    if self.checked_idx + 1 == read_idx {
                        return LineStatus::Open;
                    }
                    if buf[self.checked_idx + 1] == b'\n' {
                        buf[self.checked_idx] = 0;
                        buf[self.checked_idx + 1] = 0;
                        self.checked_idx += 2;
                        return LineStatus::Ok;
                    }
                    return LineStatus::Bad;
                }
                b'\n' => {
                    if self.checked_idx > 0 && buf[self.checked_idx - 1] == b'\r' {
                        buf[self.checked_idx - 1] = 0;
                        buf[self.checked_idx] = 0;
                        self.checked_idx += 1;
                        return LineStatus::Ok;
                    }
                    return LineStatus::Bad;
                }
                _ => self.checked_idx += 1,
            }
        }
        LineStatus::Open
    }

    /// Advance the main state machine over everything buffered so far. A
    /// complete request is resolved immediately via [`HttpConn::do_request`].
    pub fn process_read(&mut self, router: &Router) -> HttpCode {
        let mut line_status = LineStatus::Ok;
        loop {
            // Body bytes are counted, never scanned for line terminators.
            let in_body = self.check_state == CheckState::Body && line_status == LineStatus::Ok;
            if !in_body {
                line_status = self.parse_line();
                if line_status != LineStatus::Ok {
                    break;
                }
            }

            let start = self.start_line;
            self.start_line = self.checked_idx;

            match self.check_state {
                CheckState::RequestLine => {
                    let text = line_at(self.read_buf.filled(), start);
                    trace!(line = %String::from_utf8_lossy(text), "request line");
                    if !self.request.parse_request_line(text, router.default_page()) {
                        return HttpCode::BadRequest;
                    }
                    self.check_state = CheckState::Headers;
                }
                CheckState::Headers => {
                    let text = line_at(self.read_buf.filled(), start);
                    match self.request.parse_header(text) {
                        None => return HttpCode::BadRequest,
                        Some(HeaderLine::Field) => {}
                        Some(HeaderLine::End) if self.request.content_length != 0 => {
                            self.check_state = CheckState::Body;
                        }
                        Some(HeaderLine::End) => return self.do_request(router),
                    }
                }
                CheckState::Body => {
                    let Some(end) = self.checked_idx.checked_add(self.request.content_length)
                    else {
                        return HttpCode::BadRequest;
                    };
                    if self.read_buf.len() >= end {
                        self.request.body = self.checked_idx..end;
                        return self.do_request(router);
                    }
                    break;
                }
            }
        }

        if line_status == LineStatus::Bad {
            HttpCode::BadRequest
        } else {
            HttpCode::NoRequest
        }
    }

    /// Apply routing to the parsed target and resolve it to a mapped file.
    pub fn do_request(&mut self, router: &Router) -> HttpCode {
        let body = &self.read_buf.filled()[self.request.body.clone()];
        let target = router.route(self.request.method, &self.request.target, body);
        match router.resolve(&target, &mut self.real_file) {
            Ok(file) => {
                debug!(path = %self.real_file.display(), size = file.size, "serving file");
                self.file = Some(file);
                HttpCode::FileRequest
            }
            Err(code) => {
                debug!(url = %target, ?code, "request rejected");
                code
            }
        }
    }

    fn add_response(&mut self, args: fmt::Arguments<'_>) -> bool {
        match self.write_buf.append_fmt(args) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "response header overflow");
                false
            }
        }
    }

    fn add_status_line(&mut self, status: u16, title: &str) -> bool {
        self.add_response(format_args!("HTTP/1.1 {} {}\r\n", status, title))
    }

    fn add_headers(&mut self, content_len: usize, content_type: &str) -> bool {
        let connection = if self.request.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.add_response(format_args!(
            "Content-Length: {}\r\nConnection: {}\r\nContent-Type: {}\r\n\r\n",
            content_len, connection, content_type
        ))
    }

    fn add_content(&mut self, content: &str) -> bool {
        self.add_response(format_args!("{}", content))
    }

    /// Build the header block (and the body for anything but a non-empty
    /// file) into the write buffer.
    pub fn process_write(&mut self, code: HttpCode) -> bool {
        self.write_buf.clear();
        self.bytes_sent = 0;

        let built = match code {
            HttpCode::FileRequest => {
                let Some((size, content_type)) = self.file.as_ref().map(|f| (f.size, f.content_type))
                else {
                    return false;
                };
                if size != 0 {
                    self.add_status_line(200, "OK") && self.add_headers(size, content_type)
                } else {
                    self.add_status_line(200, "OK")
                        && self.add_headers(EMPTY_PAGE.len(), HTML)
                        && self.add_content(EMPTY_PAGE)
                }
            }
            code => match code.error_page() {
                Some((status, title, form)) => {
                    self.add_status_line(status, title)
                        && self.add_headers(form.len(), HTML)
                        && self.add_content(form)
                }
                None => false,
            },
        };
        if !built {
            return false;
        }

        self.bytes_to_send = self.write_buf.len() + self.mapped().len();
        true
    }

    /// Parse what has arrived and, once a request is complete, prepare its
    /// response. Re-arms the socket for read or write before returning.
    pub fn process(&mut self, ctx: &Context) -> Processed {
        let code = self.process_read(&ctx.router);
        if code == HttpCode::NoRequest {
            return match self.rearm(ctx, Interest::Read) {
                Ok(()) => Processed::NeedMore,
                Err(_) => Processed::Failed,
            };
        }

        ctx.metrics.inc_req();
        if !self.process_write(code) {
            return Processed::Failed;
        }
        match self.rearm(ctx, Interest::Write) {
            Ok(()) => Processed::Ready,
            Err(_) => Processed::Failed,
        }
    }

    /// Send the pending response with `writev`.
    ///
    /// Would-block re-arms for write and returns `true`. A finished response
    /// either resets the connection for the next keep-alive request (re-armed
    /// for read, `true`) or returns `false` so the caller closes it.
    pub fn write(&mut self, ctx: &Context) -> bool {
        if self.bytes_to_send == 0 {
            self.reset();
            return self.rearm(ctx, Interest::Read).is_ok();
        }

        loop {
            let header = self.write_buf.filled();
            let body = self.mapped();
            let sent = if self.bytes_sent < header.len() {
                syscalls::writev_nonblocking(self.fd, &[&header[self.bytes_sent..], body])
            } else {
                syscalls::writev_nonblocking(self.fd, &[&body[self.bytes_sent - header.len()..]])
            };

            match sent {
                Ok(Some(n)) if n > 0 => {
                    self.bytes_sent += n;
                    self.bytes_to_send -= n.min(self.bytes_to_send);
                    ctx.metrics.add_bytes(n);
                }
                Ok(None) => return self.rearm(ctx, Interest::Write).is_ok(),
                Ok(Some(_)) => {
                    self.file = None;
                    return false;
                }
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "writev failed");
                    self.file = None;
                    return false;
                }
            }

            if self.bytes_to_send == 0 {
                self.file = None;
                if self.request.keep_alive {
                    self.reset();
                    return self.rearm(ctx, Interest::Read).is_ok();
                }
                return false;
            }
        }
    }

    fn rearm(&self, ctx: &Context, interest: Interest) -> LumenResult<()> {
        ctx.epoll
            .rearm(self.fd, self.token, interest, self.trig)
            .inspect_err(|e| debug!(fd = self.fd, error = %e, "rearm failed"))
    }

    fn mapped(&self) -> &[u8] {
        self.file.as_ref().map(StaticFile::bytes).unwrap_or(&[])
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn check_state(&self) -> CheckState {
        self.check_state
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Body bytes of the current request (empty until complete).
    pub fn body(&self) -> &[u8] {
        &self.read_buf.filled()[self.request.body.clone()]
    }

    /// Bytes still owed to the peer for the current response.
    pub fn bytes_to_send(&self) -> usize {
        self.bytes_to_send
    }

    /// Length of the header block of the current response.
    pub fn header_len(&self) -> usize {
        self.write_buf.len()
    }

    /// Append raw bytes to the read buffer as if they had been received.
    #[cfg(test)]
    fn feed(&mut self, bytes: &[u8]) {
        self.read_buf.append(bytes).unwrap();
    }
}

impl fmt::Debug for HttpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConn")
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("check_state", &self.check_state)
            .field("read_len", &self.read_buf.len())
            .field("checked_idx", &self.checked_idx)
            .field("bytes_to_send", &self.bytes_to_send)
            .finish()
    }
}
