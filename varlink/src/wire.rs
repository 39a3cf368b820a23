//! The varlink wire format.
//!
//! One message is one UTF-8 JSON object followed by a single NUL byte. The
//! [`FrameDecoder`] accumulates raw bytes and cuts complete frames out of
//! them; serialization appends the terminator. Nothing in here performs I/O.

use std::borrow::Cow;
use std::io::{self, Read};

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::*;

/// Default limit on the JSON payload of a single frame (excluding the NUL
/// terminator).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// The structure of a varlink request.
#[derive(Serialize, Deserialize, Debug, PartialEq, Default, Clone)]
pub struct Request<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub more: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oneway: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<bool>,
    pub method: Cow<'a, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl<'a> Request<'a> {
    pub fn create<S: Into<Cow<'a, str>>>(method: S, parameters: Option<Value>) -> Self {
        Request {
            more: None,
            oneway: None,
            upgrade: None,
            method: method.into(),
            parameters,
        }
    }

    pub fn wants_more(&self) -> bool {
        self.more == Some(true)
    }

    pub fn is_oneway(&self) -> bool {
        self.oneway == Some(true)
    }

    pub fn wants_upgrade(&self) -> bool {
        self.upgrade == Some(true)
    }

    /// Split `method` into interface and member name at the last dot.
    pub fn split_method(&self) -> Option<(&str, &str)> {
        self.method.rfind('.').map(|n| {
            let (iface, member) = self.method.split_at(n);
            (iface, &member[1..])
        })
    }
}

/// The structure of a varlink reply.
#[derive(Serialize, Deserialize, Debug, PartialEq, Default, Clone)]
pub struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continues: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Cow<'static, str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl Reply {
    pub fn parameters(parameters: Option<Value>) -> Self {
        Reply {
            continues: None,
            error: None,
            parameters,
        }
    }

    pub fn error<S: Into<Cow<'static, str>>>(name: S, parameters: Option<Value>) -> Self {
        Reply {
            continues: None,
            error: Some(name.into()),
            parameters,
        }
    }

    pub fn is_continues(&self) -> bool {
        self.continues == Some(true)
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ErrorInterfaceNotFound {
    pub interface: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ErrorMethodNotFound {
    pub method: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ErrorMethodNotImplemented {
    pub method: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ErrorInvalidParameter {
    pub parameter: Option<String>,
}

fn error_field<T: serde::de::DeserializeOwned, F: FnOnce(T) -> String>(
    parameters: Option<Value>,
    get: F,
) -> String {
    parameters
        .and_then(|p| serde_json::from_value::<T>(p).ok())
        .map(get)
        .unwrap_or_default()
}

/// Decode the standard `org.varlink.service` error replies into local error
/// kinds; anything else surfaces as a generic error reply.
impl From<Reply> for ErrorKind {
    fn from(reply: Reply) -> Self {
        match reply.error.as_deref() {
            Some("org.varlink.service.InterfaceNotFound") => ErrorKind::InterfaceNotFound(
                error_field::<ErrorInterfaceNotFound, _>(reply.parameters, |p| {
                    p.interface.unwrap_or_default()
                }),
            ),
            Some("org.varlink.service.MethodNotFound") => ErrorKind::MethodNotFound(error_field::<
                ErrorMethodNotFound,
                _,
            >(
                reply.parameters,
                |p| p.method.unwrap_or_default(),
            )),
            Some("org.varlink.service.MethodNotImplemented") => ErrorKind::MethodNotImplemented(
                error_field::<ErrorMethodNotImplemented, _>(reply.parameters, |p| {
                    p.method.unwrap_or_default()
                }),
            ),
            Some("org.varlink.service.InvalidParameter") => ErrorKind::InvalidParameter(
                error_field::<ErrorInvalidParameter, _>(reply.parameters, |p| {
                    p.parameter.unwrap_or_default()
                }),
            ),
            _ => ErrorKind::VarlinkErrorReply(reply),
        }
    }
}

/// Serialize a request and append the frame terminator.
pub fn serialize_request(request: &Request) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(request).map_err(map_context!())?;
    bytes.push(0);
    Ok(bytes)
}

/// Serialize a reply and append the frame terminator.
pub fn serialize_reply(reply: &Reply) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(reply).map_err(map_context!())?;
    bytes.push(0);
    Ok(bytes)
}

pub fn parse_request(frame: &[u8]) -> Result<Request<'static>> {
    let request: Request = serde_json::from_slice(frame).map_err(|e| {
        context!(
            e,
            ErrorKind::SerdeJsonDe(String::from_utf8_lossy(frame).to_string())
        )
    })?;
    Ok(Request {
        method: Cow::Owned(request.method.into_owned()),
        parameters: request.parameters,
        more: request.more,
        oneway: request.oneway,
        upgrade: request.upgrade,
    })
}

pub fn parse_reply(frame: &[u8]) -> Result<Reply> {
    serde_json::from_slice(frame).map_err(|e| {
        context!(
            e,
            ErrorKind::SerdeJsonDe(String::from_utf8_lossy(frame).to_string())
        )
    })
}

/// Incremental frame decoder with a payload size limit.
///
/// Feed raw bytes with [`push`](FrameDecoder::push), pull complete JSON
/// payloads (terminator already removed) with
/// [`next_frame`](FrameDecoder::next_frame). Oversized payloads error out as
/// soon as the limit is exceeded, terminator seen or not.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    scanned: usize,
    limit: usize,
}

impl FrameDecoder {
    pub fn new(limit: usize) -> Self {
        FrameDecoder {
            buf: Vec::new(),
            scanned: 0,
            limit,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        match self.buf[self.scanned..].iter().position(|&b| b == 0) {
            Some(offset) => {
                let end = self.scanned + offset;
                if end > self.limit {
                    return Err(context!(ErrorKind::MessageTooLarge(end)));
                }
                let mut frame: Vec<u8> = self.buf.drain(..=end).collect();
                frame.pop();
                self.scanned = 0;
                Ok(Some(frame))
            }
            None => {
                self.scanned = self.buf.len();
                if self.scanned > self.limit {
                    Err(context!(ErrorKind::MessageTooLarge(self.scanned)))
                } else {
                    Ok(None)
                }
            }
        }
    }

    pub fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Hand out everything still buffered, e.g. when a connection switches
    /// to a raw tunnel after an upgrade.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        self.scanned = 0;
        std::mem::take(&mut self.buf)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

/// Blocking frame source: a raw reader feeding a [`FrameDecoder`].
///
/// This is the client-side counterpart of the reactor's per-connection
/// decoder; both sides cut frames out of the same machinery.
pub struct FrameReader {
    inner: Box<dyn Read + Send + Sync>,
    decoder: FrameDecoder,
}

impl FrameReader {
    pub fn new(inner: Box<dyn Read + Send + Sync>) -> Self {
        FrameReader {
            inner,
            decoder: FrameDecoder::default(),
        }
    }

    /// Block until one complete frame has arrived. End of stream is a
    /// `ConnectionClosed` error.
    pub fn read_frame(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(frame);
            }
            let mut buf = [0u8; 8192];
            let n = self.inner.read(&mut buf).map_err(map_context!())?;
            if n == 0 {
                return Err(context!(ErrorKind::ConnectionClosed));
            }
            self.decoder.push(&buf[..n]);
        }
    }

    pub fn read_reply(&mut self) -> Result<Reply> {
        let frame = self.read_frame()?;
        parse_reply(&frame)
    }
}

/// After an upgrade the same reader continues as a plain byte stream;
/// anything the decoder buffered past the last frame comes out first.
impl Read for FrameReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.decoder.has_buffered() {
            let data = self.decoder.take_buffered();
            let n = buf.len().min(data.len());
            buf[..n].copy_from_slice(&data[..n]);
            if n < data.len() {
                self.decoder.push(&data[n..]);
            }
            return Ok(n);
        }
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_complete_frame() {
        let mut dec = FrameDecoder::default();
        dec.push(b"{\"method\":\"org.example.Ping\"}\0");
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame, b"{\"method\":\"org.example.Ping\"}");
        assert!(dec.next_frame().unwrap().is_none());
        assert!(!dec.has_buffered());
    }

    #[test]
    fn test_decode_split_delivery() {
        let mut dec = FrameDecoder::default();
        dec.push(b"{\"method\":\"org.exam");
        assert!(dec.next_frame().unwrap().is_none());
        dec.push(b"ple.Ping\"}\0");
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame, b"{\"method\":\"org.example.Ping\"}");
    }

    #[test]
    fn test_decode_two_frames_in_one_read() {
        let mut dec = FrameDecoder::default();
        dec.push(b"{}\0{\"a\":1}\0");
        assert_eq!(dec.next_frame().unwrap().unwrap(), b"{}");
        assert_eq!(dec.next_frame().unwrap().unwrap(), b"{\"a\":1}");
        assert!(dec.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_size_limit_boundary() {
        let limit = 64;
        // payload of exactly `limit` bytes passes
        let mut payload = String::from("{\"pad\":\"");
        while payload.len() < limit - 2 {
            payload.push('x');
        }
        payload.push_str("\"}");
        assert_eq!(payload.len(), limit);

        let mut dec = FrameDecoder::new(limit);
        dec.push(payload.as_bytes());
        dec.push(b"\0");
        assert_eq!(dec.next_frame().unwrap().unwrap().len(), limit);

        // one byte over fails
        let mut dec = FrameDecoder::new(limit - 1);
        dec.push(payload.as_bytes());
        dec.push(b"\0");
        let e = dec.next_frame().unwrap_err();
        assert!(matches!(e.kind(), ErrorKind::MessageTooLarge(_)));
    }

    #[test]
    fn test_size_limit_without_terminator() {
        let mut dec = FrameDecoder::new(8);
        dec.push(b"12345678");
        assert!(dec.next_frame().unwrap().is_none());
        dec.push(b"9");
        assert!(dec.next_frame().is_err());
    }

    #[test]
    fn test_request_roundtrip() {
        let req = Request {
            more: Some(true),
            oneway: None,
            upgrade: None,
            method: "org.example.more.TestMore".into(),
            parameters: Some(serde_json::json!({"n": 10})),
        };
        let bytes = serialize_request(&req).unwrap();
        assert_eq!(*bytes.last().unwrap(), 0);
        let parsed = parse_request(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(parsed, req);
        assert_eq!(
            parsed.split_method(),
            Some(("org.example.more", "TestMore"))
        );
    }

    #[test]
    fn test_absent_options_are_not_serialized() {
        let req = Request::create("org.example.Ping", None);
        let bytes = serialize_request(&req).unwrap();
        assert_eq!(&bytes[..bytes.len() - 1], b"{\"method\":\"org.example.Ping\"}");

        let reply = Reply::parameters(Some(serde_json::json!({"pong": "Test"})));
        let bytes = serialize_reply(&reply).unwrap();
        assert_eq!(
            &bytes[..bytes.len() - 1],
            b"{\"parameters\":{\"pong\":\"Test\"}}"
        );
    }

    #[test]
    fn test_standard_error_decoding() {
        let reply = Reply::error(
            "org.varlink.service.MethodNotFound",
            Some(serde_json::json!({"method": "Bogus"})),
        );
        assert_eq!(ErrorKind::from(reply), ErrorKind::MethodNotFound("Bogus".into()));

        let reply = Reply::error("org.example.custom.SomeError", None);
        assert!(matches!(
            ErrorKind::from(reply),
            ErrorKind::VarlinkErrorReply(_)
        ));
    }

    #[test]
    fn test_malformed_json_frame() {
        assert!(parse_request(b"not json").is_err());
        assert!(parse_reply(&[0xff, 0xfe]).is_err());
    }
}
