//! Parsing of varlink address URIs, and the [`Stream`] abstraction over the
//! socket families they select.
//!
//! ```text
//! unix:PATH[;mode=OOO][;user=USER][;group=GROUP]
//! tcp:HOST:PORT
//! exec:COMMAND
//! ssh:HOST
//! bridge:COMMAND
//! ```
//!
//! A `unix:` path starting with `@` names an abstract socket (Linux).
//! `tcp:` hosts are numeric literals, IPv6 in brackets. CLI-style URLs may
//! carry a trailing `/INTERFACE`, split off explicitly with
//! [`split_address_interface`] before the address is parsed.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;


use crate::error::*;

/// A connected socket of either family, as one duplex byte stream.
///
/// The transport never interprets bytes; framing lives in
/// [`wire`](crate::wire). This covers exactly what the rest of the crate
/// needs from a socket: the client clones it into separately owned halves,
/// the reactor drives it nonblocking by fd, and both sides shut it down.
pub trait Stream: Read + Write + Send + Sync + AsRawFd {
    /// Clone the socket into a read half and a write half.
    fn split(&self) -> Result<(Box<dyn Read + Send + Sync>, Box<dyn Write + Send + Sync>)>;
    fn shutdown(&self) -> Result<()>;
    fn set_nonblocking(&self, nonblocking: bool) -> Result<()>;
}

macro_rules! impl_stream {
    ($($t:ty),*) => {$(
        impl Stream for $t {
            fn split(&self) -> Result<(Box<dyn Read + Send + Sync>, Box<dyn Write + Send + Sync>)> {
                let r = self.try_clone().map_err(map_context!())?;
                let w = self.try_clone().map_err(map_context!())?;
                Ok((Box::new(r), Box::new(w)))
            }

            fn shutdown(&self) -> Result<()> {
                <$t>::shutdown(self, Shutdown::Both).map_err(map_context!())
            }

            fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
                <$t>::set_nonblocking(self, nonblocking).map_err(map_context!())
            }
        }
    )*}
}

impl_stream!(TcpStream, UnixStream);

#[derive(Debug, Clone, PartialEq)]
pub enum Address {
    Unix {
        path: String,
        mode: Option<u32>,
        user: Option<String>,
        group: Option<String>,
    },
    Tcp(SocketAddr),
    Exec(String),
    Ssh(String),
    Bridge(String),
}

impl Address {
    pub fn parse(address: &str) -> Result<Self> {
        let invalid = || Error::from(context!(ErrorKind::InvalidAddress(address.to_string())));

        if let Some(body) = address.strip_prefix("unix:") {
            let mut parts = body.split(';');
            let path = parts.next().unwrap_or("");
            if path.is_empty() {
                return Err(invalid());
            }
            let mut mode = None;
            let mut user = None;
            let mut group = None;
            for option in parts {
                match option.split_once('=') {
                    Some(("mode", v)) => {
                        mode = Some(u32::from_str_radix(v, 8).map_err(|_| invalid())?)
                    }
                    Some(("user", v)) if !v.is_empty() => user = Some(v.to_string()),
                    Some(("group", v)) if !v.is_empty() => group = Some(v.to_string()),
                    _ => return Err(invalid()),
                }
            }
            if path.starts_with('@') {
                // no filesystem node, nothing to chmod or chown
                mode = None;
                user = None;
                group = None;
            }
            Ok(Address::Unix {
                path: path.to_string(),
                mode,
                user,
                group,
            })
        } else if let Some(body) = address.strip_prefix("tcp:") {
            // only numeric literals; IPv6 requires brackets
            let sockaddr: SocketAddr = body.parse().map_err(|_| invalid())?;
            Ok(Address::Tcp(sockaddr))
        } else if let Some(body) = address.strip_prefix("exec:") {
            if body.is_empty() {
                return Err(invalid());
            }
            Ok(Address::Exec(body.to_string()))
        } else if let Some(body) = address.strip_prefix("ssh:") {
            if body.is_empty() || body.contains(char::is_whitespace) {
                return Err(invalid());
            }
            Ok(Address::Ssh(body.to_string()))
        } else if let Some(body) = address.strip_prefix("bridge:") {
            if body.is_empty() {
                return Err(invalid());
            }
            Ok(Address::Bridge(body.to_string()))
        } else {
            Err(invalid())
        }
    }

    /// `true` for a Linux abstract socket address.
    pub fn is_abstract(&self) -> bool {
        matches!(self, Address::Unix { path, .. } if path.starts_with('@'))
    }
}

/// Split a CLI-style `ADDRESS/INTERFACE` URL at the last slash.
///
/// The suffix only counts as an interface when it looks like one (a dotted
/// name without slashes); otherwise the URL is returned unchanged. Note that
/// a bare `unix:` path may itself end in a dotted segment, so this is only
/// called on URLs known to carry an interface.
pub fn split_address_interface(url: &str) -> (&str, Option<&str>) {
    if let Some(pos) = url.rfind('/') {
        let suffix = &url[pos + 1..];
        if suffix.contains('.')
            && !suffix.is_empty()
            && suffix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        {
            return (&url[..pos], Some(suffix));
        }
    }
    (url, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix() {
        assert_eq!(
            Address::parse("unix:/run/org.example.ping").unwrap(),
            Address::Unix {
                path: "/run/org.example.ping".into(),
                mode: None,
                user: None,
                group: None,
            }
        );
        assert_eq!(
            Address::parse("unix:/run/test;mode=0660;user=nobody;group=wheel").unwrap(),
            Address::Unix {
                path: "/run/test".into(),
                mode: Some(0o660),
                user: Some("nobody".into()),
                group: Some("wheel".into()),
            }
        );
        assert!(Address::parse("unix:").is_err());
        assert!(Address::parse("unix:/run/test;mode=99z").is_err());
        assert!(Address::parse("unix:/run/test;color=red").is_err());
    }

    #[test]
    fn test_unix_abstract() {
        let a = Address::parse("unix:@org.example.ping;mode=0600").unwrap();
        assert!(a.is_abstract());
        // filesystem options are meaningless on abstract sockets
        assert!(matches!(a, Address::Unix { mode: None, .. }));
    }

    #[test]
    fn test_tcp() {
        assert!(matches!(
            Address::parse("tcp:127.0.0.1:12345").unwrap(),
            Address::Tcp(addr) if addr.port() == 12345
        ));
        assert!(matches!(
            Address::parse("tcp:[::1]:8080").unwrap(),
            Address::Tcp(addr) if addr.is_ipv6()
        ));
        assert!(matches!(
            Address::parse("tcp:0.0.0.0:0").unwrap(),
            Address::Tcp(_)
        ));
        // IPv6 literals need brackets
        assert!(Address::parse("tcp:::1:8080").is_err());
        assert!(Address::parse("tcp:[::1:8080").is_err());
        assert!(Address::parse("tcp:127.0.0.1").is_err());
        assert!(Address::parse("tcp:127.0.0.1:99999").is_err());
        assert!(Address::parse("tcp:localhost:8080").is_err());
    }

    #[test]
    fn test_subprocess_schemes() {
        assert_eq!(
            Address::parse("exec:/usr/bin/service --flag").unwrap(),
            Address::Exec("/usr/bin/service --flag".into())
        );
        assert_eq!(
            Address::parse("ssh:example.org").unwrap(),
            Address::Ssh("example.org".into())
        );
        assert_eq!(
            Address::parse("bridge:ssh host varlink bridge").unwrap(),
            Address::Bridge("ssh host varlink bridge".into())
        );
        assert!(Address::parse("exec:").is_err());
        assert!(Address::parse("ssh:two words").is_err());
    }

    #[test]
    fn test_unknown_scheme() {
        assert!(Address::parse("udp:127.0.0.1:1").is_err());
        assert!(Address::parse("/run/test").is_err());
        let e = Address::parse("quic:x").unwrap_err();
        assert!(matches!(e.kind(), ErrorKind::InvalidAddress(_)));
    }

    #[test]
    fn test_split_interface() {
        assert_eq!(
            split_address_interface("unix:/run/sock/org.example.ping"),
            ("unix:/run/sock", Some("org.example.ping"))
        );
        assert_eq!(
            split_address_interface("tcp:127.0.0.1:1234/org.example.more"),
            ("tcp:127.0.0.1:1234", Some("org.example.more"))
        );
        assert_eq!(split_address_interface("unix:/run/sock"), ("unix:/run/sock", None));
        assert_eq!(split_address_interface("exec:./service"), ("exec:./service", None));
    }
}
