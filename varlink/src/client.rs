//! Client-side connection handling for varlink services.

use std::borrow::Cow;
use std::io::Write;
use std::marker::PhantomData;
use std::net::TcpStream;
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, RwLock};
use std::{env, thread, time};

use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::{tempdir, TempDir};

use crate::address::{Address, Stream};
use crate::error::*;
use crate::service::{GetInfoArgs, GetInterfaceDescriptionArgs, GetInterfaceDescriptionReply, ServiceInfo};
use crate::wire::{serialize_request, FrameReader, Request};

/// Open a byte stream to a `unix:` or `tcp:` address.
pub fn varlink_connect<S: ?Sized + AsRef<str>>(address: &S) -> Result<(Box<dyn Stream>, String)> {
    let address = address.as_ref();
    match Address::parse(address)? {
        Address::Unix { path, .. } => {
            if let Some(name) = path.strip_prefix('@') {
                return Ok((connect_abstract(name, address)?, address.to_string()));
            }
            let stream = UnixStream::connect(path).map_err(map_context!())?;
            Ok((Box::new(stream), address.to_string()))
        }
        Address::Tcp(sockaddr) => {
            let stream = TcpStream::connect(sockaddr).map_err(map_context!())?;
            Ok((Box::new(stream), address.to_string()))
        }
        _ => Err(context!(ErrorKind::InvalidAddress(address.to_string()))),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn connect_abstract(name: &str, _address: &str) -> Result<Box<dyn Stream>> {
    use std::os::linux::net::SocketAddrExt;
    let sockaddr =
        std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes()).map_err(map_context!())?;
    let stream = UnixStream::connect_addr(&sockaddr).map_err(map_context!())?;
    Ok(Box::new(stream))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn connect_abstract(_name: &str, address: &str) -> Result<Box<dyn Stream>> {
    Err(context!(ErrorKind::InvalidAddress(address.to_string())))
}

/// Spawn `command` with a listening socket inherited as fd 3 and the
/// socket-activation environment set (`VARLINK_ADDRESS`, `LISTEN_FDS`,
/// `LISTEN_FDNAMES`, `LISTEN_PID`).
pub fn varlink_exec<S: ?Sized + AsRef<str>>(
    command: &S,
) -> Result<(Child, String, Option<TempDir>)> {
    let executable = String::from("exec ") + command.as_ref();

    let dir = tempdir().map_err(map_context!())?;
    let file_path = dir.path().join("varlink-socket");

    let listener = UnixListener::bind(&file_path).map_err(map_context!())?;
    let fd = listener.into_raw_fd();

    let address = format!("unix:{}", file_path.display());
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(executable)
        .env("VARLINK_ADDRESS", &address)
        .env("LISTEN_FDS", "1")
        .env("LISTEN_FDNAMES", "varlink");
    unsafe {
        cmd.pre_exec(move || {
            if fd == 3 {
                // keep the descriptor across exec
                libc::fcntl(3, libc::F_SETFD, 0);
            } else {
                libc::dup2(fd, 3);
                libc::close(fd);
            }
            env::set_var("LISTEN_PID", format!("{}", libc::getpid()));
            Ok(())
        });
    }
    let child = cmd.spawn().map_err(map_context!())?;
    // the child owns the listening side now
    unsafe {
        libc::close(fd);
    }
    Ok((child, address, Some(dir)))
}

fn spawn_with_stdio_pair(mut cmd: Command) -> Result<(Child, Box<dyn Stream>)> {
    let (ours, theirs) = UnixStream::pair().map_err(map_context!())?;
    let fd = theirs.into_raw_fd();

    let child = unsafe {
        cmd.stdin(Stdio::from_raw_fd(libc::dup(fd)))
            .stdout(Stdio::from_raw_fd(fd))
            .spawn()
            .map_err(map_context!())?
    };
    Ok((child, Box::new(ours)))
}

/// Run `command` through the shell and speak varlink over its stdio.
pub fn varlink_bridge<S: ?Sized + AsRef<str>>(command: &S) -> Result<(Child, Box<dyn Stream>)> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command.as_ref());
    spawn_with_stdio_pair(cmd)
}

/// Run `ssh <host> varlink bridge` and speak varlink over its stdio.
pub fn varlink_ssh<S: ?Sized + AsRef<str>>(host: &S) -> Result<(Child, Box<dyn Stream>)> {
    let mut cmd = Command::new("ssh");
    cmd.arg(host.as_ref()).arg("varlink").arg("bridge");
    spawn_with_stdio_pair(cmd)
}

/// A client connection to a varlink service.
///
/// Built from an address URI; `exec:`, `ssh:` and `bridge:` addresses spawn
/// the peer as a child process. The protocol is strictly sequential per
/// connection: the framed `reader` and the `writer` move into the
/// [`Replies`] of the call in flight and come back once its final reply has
/// been read.
#[derive(Default)]
pub struct Connection {
    pub reader: Option<FrameReader>,
    pub writer: Option<Box<dyn Write + Send + Sync>>,
    address: String,
    pub stream: Option<Box<dyn Stream>>,
    pub child: Option<Child>,
    pub tempdir: Option<TempDir>,
}

impl Connection {
    /// Create a connection with a varlink address URI.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use varlink::Connection;
    /// let connection = Connection::with_address("unix:/run/org.example.myservice");
    /// let connection = Connection::with_address("tcp:127.0.0.1:12345");
    /// ```
    pub fn with_address<S: ?Sized + AsRef<str>>(address: &S) -> Result<Arc<RwLock<Self>>> {
        match Address::parse(address.as_ref())? {
            Address::Unix { .. } | Address::Tcp(_) => {
                let (stream, address) = varlink_connect(address)?;
                let (r, w) = stream.split()?;
                Ok(Arc::new(RwLock::new(Connection {
                    reader: Some(FrameReader::new(r)),
                    writer: Some(w),
                    address,
                    stream: Some(stream),
                    child: None,
                    tempdir: None,
                })))
            }
            Address::Exec(command) => Self::with_activate(&command),
            Address::Ssh(host) => {
                let (child, stream) = varlink_ssh(&host)?;
                Self::with_child(child, stream, format!("ssh:{}", host))
            }
            Address::Bridge(command) => Self::with_bridge(&command),
        }
    }

    /// See [`with_address`](#method.with_address).
    #[allow(clippy::new_ret_no_self)]
    pub fn new<S: ?Sized + AsRef<str>>(address: &S) -> Result<Arc<RwLock<Self>>> {
        Self::with_address(address)
    }

    /// Connect to a service started on demand with a socket passed as fd 3.
    ///
    /// The service sees the usual activation environment; the temporary
    /// socket lives as long as the connection.
    pub fn with_activate<S: ?Sized + AsRef<str>>(command: &S) -> Result<Arc<RwLock<Self>>> {
        // the listening socket is bound before the child is spawned, so the
        // connect below lands in its backlog even if the service is slow
        let (child, unix_address, tempdir) = varlink_exec(command)?;
        let (stream, address) = varlink_connect(&unix_address)?;
        let (r, w) = stream.split()?;
        Ok(Arc::new(RwLock::new(Connection {
            reader: Some(FrameReader::new(r)),
            writer: Some(w),
            address,
            stream: Some(stream),
            child: Some(child),
            tempdir,
        })))
    }

    /// Connect through the stdio of `command`, e.g. a remote `varlink
    /// bridge` behind ssh.
    pub fn with_bridge<S: ?Sized + AsRef<str>>(command: &S) -> Result<Arc<RwLock<Self>>> {
        let (child, stream) = varlink_bridge(command)?;
        Self::with_child(child, stream, "bridge".to_string())
    }

    /// Look up `interface` via the resolver and connect to the address it
    /// returns.
    pub fn with_resolved_interface<S: ?Sized + AsRef<str>>(
        interface: &S,
        resolver_address: Option<&str>,
    ) -> Result<Arc<RwLock<Self>>> {
        let resolver_address = resolver_address.unwrap_or("unix:/run/org.varlink.resolver");
        if interface.as_ref() == "org.varlink.resolver" {
            return Self::with_address(resolver_address);
        }
        let address = {
            let conn = Self::with_address(resolver_address)?;
            let mut resolver = OrgVarlinkResolverClient::new(conn);
            resolver.resolve(interface.as_ref().to_string())?.address
        };
        Self::with_address(&address)
    }

    fn with_child(
        child: Child,
        stream: Box<dyn Stream>,
        address: String,
    ) -> Result<Arc<RwLock<Self>>> {
        let (r, w) = stream.split()?;
        Ok(Arc::new(RwLock::new(Connection {
            reader: Some(FrameReader::new(r)),
            writer: Some(w),
            address,
            stream: Some(stream),
            child: Some(child),
            tempdir: None,
        })))
    }

    /// The address this connection was built from.
    pub fn address(&self) -> String {
        self.address.clone()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(ref mut stream) = self.stream {
            let _r = stream.shutdown();
        }

        if let Some(ref mut child) = self.child {
            // ask nicely first, then force it
            unsafe {
                libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
            }
            let mut ended = false;
            for _ in 0..10 {
                match child.try_wait() {
                    Ok(Some(_)) | Err(_) => {
                        ended = true;
                        break;
                    }
                    Ok(None) => thread::sleep(time::Duration::from_millis(50)),
                }
            }
            if !ended {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

/// The requested call modality, as it ends up on the wire.
enum CallMode {
    Plain,
    More,
    Oneway,
    Upgrade,
}

/// Checks reply parameters against the output struct of the called method.
/// Extra fields pass through; error replies are never checked against it.
pub(crate) struct ReplyValidator {
    interface: Arc<varlink_idl::Interface>,
    method: String,
}

impl ReplyValidator {
    fn check(&self, parameters: &Value) -> Result<()> {
        if let Some(definition) = self.interface.get_method(&self.method) {
            self.interface
                .validate_struct(&definition.output, parameters, false)
                .map_err(|parameter| context!(ErrorKind::InvalidParameter(parameter)))?;
        }
        Ok(())
    }
}

/// A single method call on a connection.
///
/// `MRequest` serializes into the call parameters, `MReply` deserializes
/// from reply parameters. Every entry point consumes the call, so a call
/// value cannot be sent twice; the modality is picked by which one is
/// used: [`call`](Self::call), [`more`](Self::more),
/// [`oneway`](Self::oneway) or [`upgrade`](Self::upgrade).
pub struct MethodCall<MRequest, MReply, MError>
where
    MRequest: Serialize,
    MReply: DeserializeOwned,
    MError: From<Error>,
{
    connection: Arc<RwLock<Connection>>,
    method: Cow<'static, str>,
    parameters: MRequest,
    validate: Option<ReplyValidator>,
    phantom: PhantomData<(MReply, MError)>,
}

impl<MRequest, MReply, MError> MethodCall<MRequest, MReply, MError>
where
    MRequest: Serialize,
    MReply: DeserializeOwned,
    MError: From<Error>,
{
    pub fn new<S: Into<Cow<'static, str>>>(
        connection: Arc<RwLock<Connection>>,
        method: S,
        parameters: MRequest,
    ) -> Self {
        MethodCall {
            connection,
            method: method.into(),
            parameters,
            validate: None,
            phantom: PhantomData,
        }
    }

    /// Check every reply against the method's output struct in the given
    /// interface definition before handing it out.
    pub(crate) fn with_reply_validation(
        mut self,
        interface: Arc<varlink_idl::Interface>,
        method: String,
    ) -> Self {
        self.validate = Some(ReplyValidator { interface, method });
        self
    }

    /// Plain call: exactly one reply.
    pub fn call(self) -> ::std::result::Result<MReply, MError> {
        self.start(CallMode::Plain)?.expect_single()
    }

    /// Fire-and-forget: the request is written, nothing is read.
    pub fn oneway(self) -> ::std::result::Result<(), MError> {
        self.start(CallMode::Oneway).map(drop)
    }

    /// Streaming call: a lazy sequence of replies.
    pub fn more(self) -> ::std::result::Result<Replies<MReply, MError>, MError> {
        self.start(CallMode::More)
    }

    /// Upgrade call: one reply, after which the caller may take the raw
    /// byte stream from the connection.
    pub fn upgrade(self) -> ::std::result::Result<MReply, MError> {
        self.start(CallMode::Upgrade)?.expect_single()
    }

    /// Serialize and write the request, then hand the connection's stream
    /// halves to the reply sequence. For oneway calls nothing will come
    /// back and the halves stay with the connection.
    fn start(self, mode: CallMode) -> ::std::result::Result<Replies<MReply, MError>, MError> {
        let MethodCall {
            connection,
            method,
            parameters,
            validate,
            ..
        } = self;

        let parameters = serde_json::to_value(parameters)
            .map_err(map_context!())
            .map_err(Error::from)?;
        let mut request = Request::create(method, Some(parameters));
        match mode {
            CallMode::Plain => {}
            CallMode::More => request.more = Some(true),
            CallMode::Oneway => request.oneway = Some(true),
            CallMode::Upgrade => request.upgrade = Some(true),
        }
        let frame = serialize_request(&request).map_err(Error::from)?;

        let mut conn = connection.write().unwrap();
        if conn.reader.is_none() || conn.writer.is_none() {
            return Err(context!(ErrorKind::ConnectionBusy).into());
        }
        {
            let writer = conn.writer.as_mut().unwrap();
            writer
                .write_all(&frame)
                .map_err(map_context!())
                .map_err(Error::from)?;
            writer.flush().map_err(map_context!()).map_err(Error::from)?;
        }

        let oneway = matches!(mode, CallMode::Oneway);
        let (reader, writer) = if oneway {
            (None, None)
        } else {
            (conn.reader.take(), conn.writer.take())
        };
        drop(conn);

        Ok(Replies {
            connection,
            reader,
            writer,
            done: oneway,
            validate,
            phantom: PhantomData,
        })
    }
}

/// The lazy reply sequence of one call in flight.
///
/// Each `next()` reads one frame off the connection; the sequence ends
/// with the first reply that does not carry `continues: true`, at which
/// point the stream halves return to the connection. Not restartable.
pub struct Replies<MReply, MError>
where
    MReply: DeserializeOwned,
    MError: From<Error>,
{
    connection: Arc<RwLock<Connection>>,
    reader: Option<FrameReader>,
    writer: Option<Box<dyn Write + Send + Sync>>,
    done: bool,
    validate: Option<ReplyValidator>,
    phantom: PhantomData<(MReply, MError)>,
}

impl<MReply, MError> Replies<MReply, MError>
where
    MReply: DeserializeOwned,
    MError: From<Error>,
{
    fn read_next(&mut self) -> ::std::result::Result<MReply, MError> {
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Err(context!(ErrorKind::IteratorOldReply).into()),
        };

        let reply = match reader.read_reply() {
            Ok(reply) => reply,
            Err(e) => {
                // a broken stream ends the sequence
                self.done = true;
                return Err(MError::from(e));
            }
        };

        if !reply.is_continues() {
            self.done = true;
            let mut conn = self.connection.write().unwrap();
            conn.reader = self.reader.take();
            conn.writer = self.writer.take();
        }

        if reply.error.is_some() {
            return Err(context!(ErrorKind::from(reply)).into());
        }

        let parameters = reply
            .parameters
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        if let Some(ref validate) = self.validate {
            validate.check(&parameters).map_err(MError::from)?;
        }
        serde_json::from_value(parameters)
            .map_err(map_context!())
            .map_err(Error::from)
            .map_err(MError::from)
    }

    /// The one reply of a non-streaming call. A continuation here is a
    /// protocol violation by the peer.
    fn expect_single(mut self) -> ::std::result::Result<MReply, MError> {
        let reply = self.read_next()?;
        if !self.done {
            return Err(context!(ErrorKind::CallContinuesMismatch).into());
        }
        Ok(reply)
    }
}

impl<MReply, MError> Iterator for Replies<MReply, MError>
where
    MReply: DeserializeOwned,
    MError: From<Error>,
{
    type Item = ::std::result::Result<MReply, MError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        Some(self.read_next())
    }
}

/// Typed client for the `org.varlink.service` interface every service
/// provides.
pub struct OrgVarlinkServiceClient {
    connection: Arc<RwLock<Connection>>,
}

impl OrgVarlinkServiceClient {
    pub fn new(connection: Arc<RwLock<Connection>>) -> Self {
        OrgVarlinkServiceClient { connection }
    }
}

pub trait OrgVarlinkServiceInterface {
    fn get_info(&mut self) -> Result<ServiceInfo>;
    fn get_interface_description<S: Into<Cow<'static, str>>>(
        &mut self,
        interface: S,
    ) -> Result<GetInterfaceDescriptionReply>;
}

impl OrgVarlinkServiceInterface for OrgVarlinkServiceClient {
    fn get_info(&mut self) -> Result<ServiceInfo> {
        MethodCall::<GetInfoArgs, ServiceInfo, Error>::new(
            self.connection.clone(),
            "org.varlink.service.GetInfo",
            GetInfoArgs {},
        )
        .call()
    }

    fn get_interface_description<S: Into<Cow<'static, str>>>(
        &mut self,
        interface: S,
    ) -> Result<GetInterfaceDescriptionReply> {
        MethodCall::<GetInterfaceDescriptionArgs, GetInterfaceDescriptionReply, Error>::new(
            self.connection.clone(),
            "org.varlink.service.GetInterfaceDescription",
            GetInterfaceDescriptionArgs {
                interface: interface.into(),
            },
        )
        .call()
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default, Clone)]
pub struct ResolveArgs {
    pub interface: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default, Clone)]
pub struct ResolveReply {
    pub address: String,
}

/// Typed client for `org.varlink.resolver`.
pub struct OrgVarlinkResolverClient {
    connection: Arc<RwLock<Connection>>,
}

impl OrgVarlinkResolverClient {
    pub fn new(connection: Arc<RwLock<Connection>>) -> Self {
        OrgVarlinkResolverClient { connection }
    }

    pub fn resolve(&mut self, interface: String) -> Result<ResolveReply> {
        MethodCall::<ResolveArgs, ResolveReply, Error>::new(
            self.connection.clone(),
            "org.varlink.resolver.Resolve",
            ResolveArgs { interface },
        )
        .call()
    }
}
