use failure::{Backtrace, Context, Fail};

pub struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, PartialEq, Fail, Debug)]
pub enum ErrorKind {
    #[fail(display = "IO error")]
    Io(::std::io::ErrorKind),
    #[fail(display = "JSON Serialization Error")]
    SerdeJsonSer(::serde_json::error::Category),
    #[fail(display = "JSON Deserialization Error of '{}'", _0)]
    SerdeJsonDe(String),
    #[fail(display = "Interface definition error: {}", _0)]
    Idl(String),
    #[fail(display = "Argument Error: {}", _0)]
    Argument(String),
    #[fail(display = "Connection Error for '{}'", _0)]
    Connection(String),
    #[fail(display = "Call failed with error: {}\n{}", error, parameters)]
    VarlinkError { error: String, parameters: String },
    #[fail(display = "{}", _0)]
    Varlink(::varlink::ErrorKind),
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl ::std::fmt::Display for Error {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        ::std::fmt::Display::fmt(&self.inner, f)
    }
}

impl ::std::fmt::Debug for Error {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        ::std::fmt::Display::fmt(&self.inner, f)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.inner.get_context().clone()
    }

    /// Process exit code: 0 on success, 1 for connection failures, 2 for
    /// protocol or argument problems, 3 for an error reply from the peer.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Connection(_) | ErrorKind::Io(_) => 1,
            ErrorKind::VarlinkError { .. } => 3,
            ErrorKind::Varlink(kind) => match kind {
                ::varlink::ErrorKind::ConnectionClosed | ::varlink::ErrorKind::Io(_) => 1,
                _ => 2,
            },
            _ => 2,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error { inner }
    }
}

impl From<::std::io::Error> for Error {
    fn from(e: ::std::io::Error) -> Error {
        let kind = e.kind();
        e.context(ErrorKind::Io(kind)).into()
    }
}

impl From<::serde_json::Error> for Error {
    fn from(e: ::serde_json::Error) -> Error {
        let cat = e.classify();
        e.context(ErrorKind::SerdeJsonSer(cat)).into()
    }
}

impl From<::varlink_idl::Error> for Error {
    fn from(e: ::varlink_idl::Error) -> Self {
        ErrorKind::Idl(e.to_string()).into()
    }
}

impl From<::varlink::Error> for Error {
    fn from(e: ::varlink::Error) -> Self {
        let kind = e.kind().clone();
        match kind {
            ::varlink::ErrorKind::Io(kind) => ErrorKind::Io(kind).into(),
            ::varlink::ErrorKind::SerdeJsonSer(cat) => ErrorKind::SerdeJsonSer(cat).into(),
            ::varlink::ErrorKind::SerdeJsonDe(buf) => ErrorKind::SerdeJsonDe(buf).into(),
            ::varlink::ErrorKind::VarlinkErrorReply(reply) => ErrorKind::VarlinkError {
                error: reply.error.unwrap_or_default().into(),
                parameters: ::serde_json::to_string_pretty(&reply.parameters.unwrap_or_default())
                    .unwrap_or_default(),
            }
            .into(),
            ::varlink::ErrorKind::InterfaceNotFound(i) => ErrorKind::VarlinkError {
                error: "org.varlink.service.InterfaceNotFound".into(),
                parameters: format!("{{\"interface\": \"{}\"}}", i),
            }
            .into(),
            ::varlink::ErrorKind::MethodNotFound(m) => ErrorKind::VarlinkError {
                error: "org.varlink.service.MethodNotFound".into(),
                parameters: format!("{{\"method\": \"{}\"}}", m),
            }
            .into(),
            ::varlink::ErrorKind::MethodNotImplemented(m) => ErrorKind::VarlinkError {
                error: "org.varlink.service.MethodNotImplemented".into(),
                parameters: format!("{{\"method\": \"{}\"}}", m),
            }
            .into(),
            kind => ErrorKind::Varlink(kind).into(),
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;
