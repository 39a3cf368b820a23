use std::io;

#[derive(Clone, PartialEq, Debug)]
pub enum ErrorKind {
    Io(::std::io::ErrorKind),
    SerdeJsonSer(::serde_json::error::Category),
    SerdeJsonDe(String),
    Idl(String),
    InterfaceNotFound(String),
    InvalidParameter(String),
    MethodNotFound(String),
    MethodNotImplemented(String),
    VarlinkErrorReply(crate::Reply),
    CallContinuesMismatch,
    ConnectionBusy,
    IteratorOldReply,
    Timeout,
    ConnectionClosed,
    InvalidAddress(String),
    MessageTooLarge(usize),
}

impl ::std::error::Error for ErrorKind {}

impl ::std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        match self {
            ErrorKind::Io(_) => write!(f, "IO error"),
            ErrorKind::SerdeJsonSer(_) => write!(f, "JSON Serialization Error"),
            ErrorKind::SerdeJsonDe(v) => write!(f, "JSON Deserialization Error of '{}'", v),
            ErrorKind::Idl(v) => write!(f, "Interface definition error: {}", v),
            ErrorKind::InterfaceNotFound(v) => write!(f, "Interface not found: '{}'", v),
            ErrorKind::InvalidParameter(v) => write!(f, "Invalid parameter: '{}'", v),
            ErrorKind::MethodNotFound(v) => write!(f, "Method not found: '{}'", v),
            ErrorKind::MethodNotImplemented(v) => write!(f, "Method not implemented: '{}'", v),
            ErrorKind::VarlinkErrorReply(v) => write!(f, "Error reply: '{:#?}'", v),
            ErrorKind::CallContinuesMismatch => {
                write!(f, "reply with continues, but without more in the request")
            }
            ErrorKind::ConnectionBusy => write!(f, "Varlink: connection busy with other method"),
            ErrorKind::IteratorOldReply => write!(f, "Varlink: Iterator called on old reply"),
            ErrorKind::Timeout => write!(f, "Timeout Error"),
            ErrorKind::ConnectionClosed => write!(f, "Connection Closed"),
            ErrorKind::InvalidAddress(v) => write!(f, "Invalid varlink address URI: '{}'", v),
            ErrorKind::MessageTooLarge(v) => write!(f, "Message of {} bytes exceeds size limit", v),
        }
    }
}

pub type Error = chainerror::Error<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

/// Converts a foreign error into a `chainerror::Error<ErrorKind>`, preserving it as the cause.
pub trait ChainErrorFrom<T> {
    fn chain_error_from(e: T, line_filename: Option<(u32, &'static str)>) -> Error;
}

impl ChainErrorFrom<std::io::Error> for ErrorKind {
    fn chain_error_from(e: io::Error, line_filename: Option<(u32, &'static str)>) -> Error {
        let occurrence = line_filename.map(|(line, file)| format!("{}:{}", file, line));
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset => {
                Error::new(ErrorKind::ConnectionClosed, Some(Box::new(e)), occurrence)
            }

            kind => Error::new(ErrorKind::Io(kind), Some(Box::new(e)), occurrence),
        }
    }
}

impl ChainErrorFrom<serde_json::error::Error> for ErrorKind {
    fn chain_error_from(
        e: serde_json::error::Error,
        line_filename: Option<(u32, &'static str)>,
    ) -> Error {
        let occurrence = line_filename.map(|(line, file)| format!("{}:{}", file, line));
        Error::new(ErrorKind::SerdeJsonSer(e.classify()), Some(Box::new(e)), occurrence)
    }
}

impl ChainErrorFrom<varlink_idl::Error> for ErrorKind {
    fn chain_error_from(
        e: varlink_idl::Error,
        line_filename: Option<(u32, &'static str)>,
    ) -> Error {
        let occurrence = line_filename.map(|(line, file)| format!("{}:{}", file, line));
        Error::new(ErrorKind::Idl(e.to_string()), Some(Box::new(e)), occurrence)
    }
}

/// Builds a `chainerror::Error<ErrorKind>`, optionally wrapping a causing error, capturing the
/// call site. Mirrors the `context!` macro of older `chainerror` releases that this crate's
/// call sites were written against.
macro_rules! context {
    ($kind:expr) => {
        $crate::error::Error::new($kind, None, Some(format!("{}:{}", file!(), line!())))
    };
    ($cause:expr, $kind:expr) => {
        $crate::error::Error::new(
            $kind,
            Some(Box::from($cause)),
            Some(format!("{}:{}", file!(), line!())),
        )
    };
}

/// Returns a closure converting a foreign error into a `chainerror::Error<ErrorKind>` via
/// `ChainErrorFrom`, capturing the call site.
macro_rules! map_context {
    () => {
        |e| {
            <$crate::error::ErrorKind as $crate::error::ChainErrorFrom<_>>::chain_error_from(
                e,
                Some((line!(), file!())),
            )
        }
    };
}

pub(crate) use context;
pub(crate) use map_context;
