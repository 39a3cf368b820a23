//! The server reactor.
//!
//! A single thread multiplexes the listener and every connection on an
//! epoll poller. Each connection owns a frame decoder for input and a byte
//! queue for output; replies of an active call are pulled from its
//! [`ReplyProducer`](crate::ReplyProducer) one at a time, and the next one
//! is not produced before the previous one has drained into the socket.
//! Requests on one connection are handled strictly in sequence. A peer
//! closing its connection cancels the active call within one poll cycle.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs;
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{env, process};

use bitflags::bitflags;
use log::{debug, error};

use crate::address::{Address, Stream};
use crate::error::*;
use crate::service::{ReplyProducer, VarlinkService};
use crate::wire::{parse_request, serialize_reply, FrameDecoder, MAX_MESSAGE_SIZE};

bitflags! {
    struct Events: u32 {
        const IN    = libc::EPOLLIN as u32;
        const OUT   = libc::EPOLLOUT as u32;
        const ERR   = libc::EPOLLERR as u32;
        const HUP   = libc::EPOLLHUP as u32;
        const RDHUP = libc::EPOLLRDHUP as u32;
    }
}

#[repr(C)]
#[cfg_attr(target_arch = "x86_64", repr(packed))]
#[derive(Clone, Copy)]
struct Event {
    events: u32,
    data: u64,
}

trait IsMinusOne {
    fn is_minus_one(&self) -> bool;
}

macro_rules! impl_is_minus_one {
    ($($t:ident)*) => ($(impl IsMinusOne for $t {
        fn is_minus_one(&self) -> bool {
            *self == -1
        }
    })*)
}

impl_is_minus_one! { i8 i16 i32 i64 isize }

fn cvt<T: IsMinusOne>(t: T) -> io::Result<T> {
    if t.is_minus_one() {
        Err(io::Error::last_os_error())
    } else {
        Ok(t)
    }
}

struct Poller {
    epfd: RawFd,
}

impl Poller {
    fn new() -> io::Result<Self> {
        let epfd = unsafe { cvt(libc::epoll_create1(libc::EPOLL_CLOEXEC))? };
        Ok(Poller { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: Events, token: u64) -> io::Result<()> {
        let mut event = Event {
            events: events.bits(),
            data: token,
        };
        let e = &mut event as *mut _ as *mut libc::epoll_event;
        unsafe { cvt(libc::epoll_ctl(self.epfd, op, fd, e))? };
        Ok(())
    }

    fn add(&self, fd: RawFd, events: Events, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, token)
    }

    fn modify(&self, fd: RawFd, events: Events, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, token)
    }

    fn delete(&self, fd: RawFd) -> io::Result<()> {
        unsafe {
            cvt(libc::epoll_ctl(
                self.epfd,
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            ))?
        };
        Ok(())
    }

    fn wait(&self, timeout_ms: i32, buf: &mut [Event]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    buf.as_mut_ptr() as *mut libc::epoll_event,
                    buf.len() as i32,
                    timeout_ms,
                )
            };
            match cvt(n) {
                Ok(n) => return Ok(n as usize),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

/// Take the pre-bound listening descriptor when started under socket
/// activation (`LISTEN_FDS`/`LISTEN_PID`, optionally `LISTEN_FDNAMES`).
fn activation_listener() -> Option<RawFd> {
    let nfds: usize = env::var("LISTEN_FDS").ok()?.parse().ok()?;
    if nfds < 1 {
        return None;
    }
    let pid: u32 = env::var("LISTEN_PID").ok()?.parse().ok()?;
    if pid != process::id() {
        return None;
    }
    if nfds == 1 {
        return Some(3);
    }
    let names = env::var("LISTEN_FDNAMES").ok()?;
    names
        .split(':')
        .position(|name| name == "varlink")
        .map(|i| 3 + i as RawFd)
}

enum ListenerKind {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// A bound listening socket for any listenable address form.
pub struct Listener {
    kind: ListenerKind,
    // filesystem node to remove on close
    unlink: Option<String>,
}

impl Listener {
    pub fn new<S: ?Sized + AsRef<str>>(address: &S) -> Result<Self> {
        let address = address.as_ref();

        if let Some(fd) = activation_listener() {
            if address.starts_with("tcp:") {
                return Ok(Listener {
                    kind: ListenerKind::Tcp(unsafe { TcpListener::from_raw_fd(fd) }),
                    unlink: None,
                });
            }
            if address.starts_with("unix:") {
                return Ok(Listener {
                    kind: ListenerKind::Unix(unsafe { UnixListener::from_raw_fd(fd) }),
                    unlink: None,
                });
            }
            return Err(context!(ErrorKind::InvalidAddress(address.to_string())));
        }

        match Address::parse(address)? {
            // std sets SO_REUSEADDR on every TcpListener bind
            Address::Tcp(sockaddr) => Ok(Listener {
                kind: ListenerKind::Tcp(TcpListener::bind(sockaddr).map_err(map_context!())?),
                unlink: None,
            }),
            Address::Unix {
                path,
                mode,
                user,
                group,
            } => {
                if let Some(name) = path.strip_prefix('@') {
                    return Ok(Listener {
                        kind: ListenerKind::Unix(bind_abstract(name, address)?),
                        unlink: None,
                    });
                }
                // a stale node from a previous run would fail the bind
                let _ = fs::remove_file(&path);
                let listener = UnixListener::bind(&path).map_err(map_context!())?;
                // access restrictions are in place before the first accept
                if let Some(mode) = mode {
                    fs::set_permissions(&path, fs::Permissions::from_mode(mode))
                        .map_err(map_context!())?;
                }
                if user.is_some() || group.is_some() {
                    chown_socket(&path, user.as_deref(), group.as_deref())?;
                }
                Ok(Listener {
                    kind: ListenerKind::Unix(listener),
                    unlink: Some(path),
                })
            }
            _ => Err(context!(ErrorKind::InvalidAddress(address.to_string()))),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match &self.kind {
            ListenerKind::Tcp(l) => l.set_nonblocking(nonblocking).map_err(map_context!())?,
            ListenerKind::Unix(l) => l.set_nonblocking(nonblocking).map_err(map_context!())?,
        }
        Ok(())
    }

    /// Accept one connection; `None` when no connection is pending.
    pub fn accept(&self) -> Result<Option<Box<dyn Stream>>> {
        match &self.kind {
            ListenerKind::Tcp(l) => match l.accept() {
                Ok((s, _addr)) => Ok(Some(Box::new(s))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => {
                    let kind = e.kind();
                    Err(Error::from(context!(e, ErrorKind::Io(kind))))
                }
            },
            ListenerKind::Unix(l) => match l.accept() {
                Ok((s, _addr)) => Ok(Some(Box::new(s))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => {
                    let kind = e.kind();
                    Err(Error::from(context!(e, ErrorKind::Io(kind))))
                }
            },
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        match &self.kind {
            ListenerKind::Tcp(l) => l.as_raw_fd(),
            ListenerKind::Unix(l) => l.as_raw_fd(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(ref path) = self.unlink {
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_abstract(name: &str, _address: &str) -> Result<UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    let sockaddr =
        std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes()).map_err(map_context!())?;
    UnixListener::bind_addr(&sockaddr).map_err(map_context!())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_abstract(_name: &str, address: &str) -> Result<UnixListener> {
    Err(context!(ErrorKind::InvalidAddress(address.to_string())))
}

fn chown_socket(path: &str, user: Option<&str>, group: Option<&str>) -> Result<()> {
    let uid = match user {
        Some(name) => resolve_uid(name)?,
        None => libc::uid_t::MAX, // -1: leave unchanged
    };
    let gid = match group {
        Some(name) => resolve_gid(name)?,
        None => libc::gid_t::MAX,
    };
    let cpath = CString::new(path).map_err(|_| {
        Error::from(context!(ErrorKind::InvalidAddress(path.to_string())))
    })?;
    cvt(unsafe { libc::chown(cpath.as_ptr(), uid, gid) }).map_err(map_context!())?;
    Ok(())
}

fn resolve_uid(user: &str) -> Result<libc::uid_t> {
    if let Ok(uid) = user.parse() {
        return Ok(uid);
    }
    let cname = CString::new(user)
        .map_err(|_| Error::from(context!(ErrorKind::InvalidAddress(user.to_string()))))?;
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        return Err(context!(ErrorKind::InvalidAddress(user.to_string())));
    }
    Ok(unsafe { (*pw).pw_uid })
}

fn resolve_gid(group: &str) -> Result<libc::gid_t> {
    if let Ok(gid) = group.parse() {
        return Ok(gid);
    }
    let cname = CString::new(group)
        .map_err(|_| Error::from(context!(ErrorKind::InvalidAddress(group.to_string()))))?;
    let gr = unsafe { libc::getgrnam(cname.as_ptr()) };
    if gr.is_null() {
        return Err(context!(ErrorKind::InvalidAddress(group.to_string())));
    }
    Ok(unsafe { (*gr).gr_gid })
}

/// Tuning for [`listen`].
pub struct ListenConfig {
    /// Return with `ErrorKind::Timeout` after this many seconds without any
    /// connection. Zero disables the timeout.
    pub idle_timeout: u64,
    /// Per-frame payload limit.
    pub max_frame_size: usize,
    /// Raise this flag to stop accepting, drain in-flight calls and return.
    pub stop_listening: Option<Arc<AtomicBool>>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            idle_timeout: 0,
            max_frame_size: MAX_MESSAGE_SIZE,
            stop_listening: None,
        }
    }
}

const LISTENER_TOKEN: u64 = 0;
// replies pulled per connection per poll cycle, so one fast streaming call
// cannot starve the loop
const PULL_BUDGET: usize = 64;

enum ConnMode {
    Framed,
    Raw(String),
}

struct ActiveCall {
    producer: Box<dyn ReplyProducer>,
    more: bool,
    upgrade: Option<String>,
}

struct Conn {
    stream: Box<dyn Stream>,
    decoder: FrameDecoder,
    outbuf: Vec<u8>,
    outpos: usize,
    call: Option<ActiveCall>,
    mode: ConnMode,
    registered: Events,
}

impl Conn {
    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn output_pending(&self) -> bool {
        self.outpos < self.outbuf.len()
    }

    /// Work that can make progress without another poller event.
    fn runnable(&self) -> bool {
        if self.output_pending() {
            return false;
        }
        match self.mode {
            ConnMode::Framed => self.call.is_some() || self.decoder.has_buffered(),
            ConnMode::Raw(_) => self.decoder.has_buffered(),
        }
    }

    fn cancel(&mut self) {
        if let Some(ref mut call) = self.call {
            call.producer.cancel();
        }
        self.call = None;
    }
}

/// Serve `service` on `address` until the stop flag is raised or the idle
/// timeout strikes.
///
/// # Examples
///
/// ```rust,no_run
/// let service = varlink::VarlinkService::new(
///     "org.varlink",
///     "test service",
///     "0.1",
///     "https://varlink.org",
///     vec![/* your varlink interfaces go here */],
/// ).unwrap();
///
/// if let Err(e) = varlink::listen(service, "unix:/tmp/org.example.service",
///     &varlink::ListenConfig { idle_timeout: 1, ..Default::default() },
/// ) {
///     if *e.kind() != varlink::ErrorKind::Timeout {
///         panic!("listen: {:?}", e);
///     }
/// }
/// ```
pub fn listen<S: ?Sized + AsRef<str>>(
    service: VarlinkService,
    address: &S,
    config: &ListenConfig,
) -> Result<()> {
    let listener = Listener::new(address)?;
    listener.set_nonblocking(true)?;

    let poller = Poller::new().map_err(map_context!())?;
    poller
        .add(listener.as_raw_fd(), Events::IN, LISTENER_TOKEN)
        .map_err(map_context!())?;

    let mut conns: HashMap<u64, Conn> = HashMap::new();
    let mut next_token: u64 = LISTENER_TOKEN + 1;
    let mut events = [Event { events: 0, data: 0 }; 32];
    let mut accepting = true;
    let mut last_connection = Instant::now();

    loop {
        if accepting {
            if let Some(ref stop) = config.stop_listening {
                if stop.load(Ordering::SeqCst) {
                    poller.delete(listener.as_raw_fd()).map_err(map_context!())?;
                    accepting = false;
                }
            }
        }
        if !accepting {
            // drain: keep connections with in-flight calls or unflushed
            // output, drop the rest
            conns.retain(|_, conn| {
                if conn.call.is_none() && !conn.output_pending() {
                    let _ = poller.delete(conn.fd());
                    false
                } else {
                    true
                }
            });
            if conns.is_empty() {
                return Ok(());
            }
        }

        let timeout_ms = poll_timeout(config, &conns, accepting, last_connection);

        let n = poller.wait(timeout_ms, &mut events).map_err(map_context!())?;

        for event in events.iter().take(n) {
            let token = event.data;
            let revents = Events::from_bits_truncate(event.events);

            if token == LISTENER_TOKEN {
                while let Some(stream) = listener.accept()? {
                    stream.set_nonblocking(true)?;
                    let token = next_token;
                    next_token += 1;
                    let conn = Conn {
                        stream,
                        decoder: FrameDecoder::new(config.max_frame_size),
                        outbuf: Vec::new(),
                        outpos: 0,
                        call: None,
                        mode: ConnMode::Framed,
                        registered: Events::IN | Events::RDHUP,
                    };
                    poller
                        .add(conn.fd(), conn.registered, token)
                        .map_err(map_context!())?;
                    conns.insert(token, conn);
                    last_connection = Instant::now();
                }
                continue;
            }

            if revents.intersects(Events::ERR | Events::HUP | Events::RDHUP) {
                // peer went away: cancel the active call, write nothing more
                close_conn(&poller, &mut conns, token);
                continue;
            }

            if revents.contains(Events::IN) {
                let filled = match conns.get_mut(&token) {
                    Some(conn) => fill_input(conn),
                    None => continue,
                };
                match filled {
                    Ok(true) => {}
                    Ok(false) => close_conn(&poller, &mut conns, token),
                    Err(e) => {
                        log_conn_error(&e);
                        close_conn(&poller, &mut conns, token);
                    }
                }
            }
        }

        // make progress on every connection that can, with a bounded budget
        let tokens: Vec<u64> = conns.keys().copied().collect();
        for token in tokens {
            let advanced = match conns.get_mut(&token) {
                Some(conn) => {
                    let advanced = advance(&service, conn);
                    if advanced.is_ok() {
                        let want = if conn.output_pending() {
                            Events::IN | Events::OUT | Events::RDHUP
                        } else {
                            Events::IN | Events::RDHUP
                        };
                        if want != conn.registered {
                            let fd = conn.fd();
                            poller.modify(fd, want, token).map_err(map_context!())?;
                            conn.registered = want;
                        }
                    }
                    advanced
                }
                None => continue,
            };
            if let Err(e) = advanced {
                log_conn_error(&e);
                close_conn(&poller, &mut conns, token);
            }
        }

        if conns.is_empty() {
            if config.idle_timeout > 0
                && last_connection.elapsed() >= Duration::from_secs(config.idle_timeout)
            {
                return Err(context!(ErrorKind::Timeout));
            }
        } else {
            last_connection = Instant::now();
        }
    }
}

fn poll_timeout(
    config: &ListenConfig,
    conns: &HashMap<u64, Conn>,
    accepting: bool,
    last_connection: Instant,
) -> i32 {
    if conns.values().any(Conn::runnable) {
        return 0;
    }
    let mut timeout_ms = -1i64;
    if config.stop_listening.is_some() || !accepting {
        timeout_ms = 100;
    }
    if accepting && config.idle_timeout > 0 && conns.is_empty() {
        let deadline = Duration::from_secs(config.idle_timeout);
        let remaining = deadline
            .checked_sub(last_connection.elapsed())
            .unwrap_or(Duration::ZERO);
        let remaining = remaining.as_millis() as i64 + 1;
        if timeout_ms < 0 || remaining < timeout_ms {
            timeout_ms = remaining;
        }
    }
    timeout_ms.min(i32::MAX as i64) as i32
}

fn log_conn_error(e: &Error) {
    match e.kind() {
        ErrorKind::ConnectionClosed | ErrorKind::SerdeJsonDe(_) => {
            debug!("connection closed: {}", e)
        }
        _ => error!("connection error: {}", e),
    }
}

fn close_conn(poller: &Poller, conns: &mut HashMap<u64, Conn>, token: u64) {
    if let Some(mut conn) = conns.remove(&token) {
        conn.cancel();
        let _ = poller.delete(conn.fd());
        let _ = conn.stream.shutdown();
    }
}

/// Drain readable bytes into the connection's decoder. `Ok(false)` means
/// end of stream.
fn fill_input(conn: &mut Conn) -> Result<bool> {
    let mut buf = [0u8; 8192];
    loop {
        match conn.stream.read(&mut buf) {
            Ok(0) => return Ok(false),
            Ok(n) => conn.decoder.push(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return Ok(false),
        }
    }
}

/// Run one connection forward: flush output, pull replies, dispatch frames.
///
/// Returns `Err` when the connection must be closed.
fn advance(service: &VarlinkService, conn: &mut Conn) -> Result<()> {
    let mut budget = PULL_BUDGET;
    loop {
        // flush before anything else; an unflushed reply blocks the call
        while conn.output_pending() {
            match conn.stream.write(&conn.outbuf[conn.outpos..]) {
                Ok(0) => return Err(context!(ErrorKind::ConnectionClosed)),
                Ok(n) => {
                    conn.outpos += n;
                    if !conn.output_pending() {
                        conn.outbuf.clear();
                        conn.outpos = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from(context!(e, ErrorKind::ConnectionClosed))),
            }
        }

        if let Some(ref mut call) = conn.call {
            if budget == 0 {
                // leave the rest for the next cycle
                return Ok(());
            }
            budget -= 1;
            match call.producer.next_reply() {
                Some(mut reply) => {
                    if reply.is_continues() && !call.more {
                        // handler bug: streaming replies on a plain call
                        error!("dropping continues on a call made without more");
                        reply.continues = None;
                    }
                    let last = !reply.is_continues();
                    let bytes = serialize_reply(&reply)?;
                    conn.outbuf.extend_from_slice(&bytes);
                    if last {
                        let upgrade = call.upgrade.take();
                        conn.call = None;
                        if let (Some(iface), None) = (upgrade, reply.error.as_ref()) {
                            conn.mode = ConnMode::Raw(iface);
                        }
                    }
                    continue;
                }
                None => {
                    conn.call = None;
                    continue;
                }
            }
        }

        match conn.mode {
            ConnMode::Framed => {
                match conn.decoder.next_frame()? {
                    Some(frame) => {
                        let request = parse_request(&frame)?;
                        let more = request.wants_more();
                        let upgrade = if request.wants_upgrade() {
                            request.split_method().map(|(iface, _)| iface.to_string())
                        } else {
                            None
                        };
                        match service.handle_call(request)? {
                            Some(producer) => {
                                conn.call = Some(ActiveCall {
                                    producer,
                                    more,
                                    upgrade,
                                });
                            }
                            // oneway: nothing to send
                            None => {}
                        }
                        continue;
                    }
                    None => return Ok(()),
                }
            }
            ConnMode::Raw(ref iface) => {
                if !conn.decoder.has_buffered() {
                    return Ok(());
                }
                let input = conn.decoder.take_buffered();
                let mut out = Vec::new();
                let consumed = service.handle_upgraded(iface, &input, &mut out)?;
                if consumed < input.len() {
                    conn.decoder.push(&input[consumed..]);
                }
                conn.outbuf.extend_from_slice(&out);
                if consumed == 0 && out.is_empty() {
                    // needs more input
                    return Ok(());
                }
                continue;
            }
        }
    }
}
