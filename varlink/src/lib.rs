//! [Server](#server) and [client](#client) support for the
//! [varlink protocol](https://varlink.org).
//!
//! Varlink is a schema-defined IPC protocol: peers exchange
//! NUL-terminated JSON objects over a bidirectional byte stream, and every
//! interface is described in a small textual definition language that is
//! parsed at runtime (see the `varlink_idl` crate) and consulted to
//! validate parameters in both directions.
//!
//! # Server
//!
//! Implement [`Interface`] for your service object, register it with a
//! [`VarlinkService`] and hand that to [`listen`]:
//!
//! ```rust,no_run
//! use varlink::{Call, Interface, Reply, ReplyProducer, Result, VarlinkService};
//!
//! struct Ping;
//!
//! impl Interface for Ping {
//!     fn get_name(&self) -> &str {
//!         "org.example.ping"
//!     }
//!
//!     fn get_description(&self) -> &str {
//!         "# Example service\n\
//!          interface org.example.ping\n\
//!          \n\
//!          # Returns the same string\n\
//!          method Ping(ping: string) -> (pong: string)\n"
//!     }
//!
//!     fn invoke(&self, call: Call) -> Result<Box<dyn ReplyProducer>> {
//!         // parameters were validated against the definition already
//!         let pong = call.parameters["ping"].clone();
//!         Ok(varlink::reply_once(Reply::parameters(Some(
//!             serde_json::json!({ "pong": pong }),
//!         ))))
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let service = VarlinkService::new(
//!         "org.varlink",
//!         "example service",
//!         "0.1",
//!         "https://varlink.org",
//!         vec![Box::new(Ping)],
//!     )?;
//!     varlink::listen(service, "unix:/run/org.example.ping", &Default::default())
//! }
//! ```
//!
//! The server is a single-threaded, readiness-driven reactor. Streaming
//! (`more`) methods hand back a [`ReplyProducer`] which is pulled one reply
//! at a time as the peer drains them; closing the connection cancels it.
//!
//! # Client
//!
//! A [`Client`] fetches and caches interface definitions from the peer and
//! validates every call against them:
//!
//! ```rust,no_run
//! use serde_json::json;
//!
//! # fn main() -> varlink::Result<()> {
//! let mut client = varlink::Client::with_address("unix:/run/org.example.ping")?;
//! let mut ping = client.open("org.example.ping")?;
//!
//! let reply = ping.call("Ping", json!({"ping": "Test"}))?;
//! assert_eq!(reply["pong"], json!("Test"));
//!
//! for reply in ping.call_more("PingStream", json!({"count": 10}))? {
//!     println!("{}", reply?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Supported address URIs:
//!
//! - TCP `tcp:127.0.0.1:12345`, numeric host and port
//! - UNIX socket `unix:/run/org.example.ftl` with optional
//!   `;mode=0600;user=nobody;group=nobody` applied on bind
//! - UNIX abstract namespace socket `unix:@org.example.ftl` (Linux only)
//! - `exec:./service`, spawn a service and pass it a listening socket as
//!   fd 3
//! - `ssh:host`, run `varlink bridge` on a remote host
//! - `bridge:<command>`, speak varlink over a child's stdio

#![allow(clippy::needless_doctest_main)]

pub mod address;
mod client;
pub mod error;
mod proxy;
mod server;
mod service;
pub mod wire;


pub use crate::address::{split_address_interface, Address, Stream};
pub use crate::client::{
    varlink_bridge, varlink_connect, varlink_exec, varlink_ssh, Connection, MethodCall,
    OrgVarlinkResolverClient, OrgVarlinkServiceClient, OrgVarlinkServiceInterface, Replies,
    ResolveArgs, ResolveReply,
};
pub use crate::error::{Error, ErrorKind, Result};
pub(crate) use crate::error::{context, map_context};
pub use crate::proxy::{Client, InterfaceProxy, MoreReplies, UpgradedStream};
pub use crate::server::{listen, ListenConfig, Listener};
pub use crate::service::{
    reply_once, Call, GetInfoArgs, GetInterfaceDescriptionArgs, GetInterfaceDescriptionReply,
    Interface, ReplyProducer, ServiceInfo, VarlinkService,
};
pub use crate::wire::{
    serialize_reply, serialize_request, ErrorInterfaceNotFound, ErrorInvalidParameter,
    ErrorMethodNotFound, ErrorMethodNotImplemented, FrameDecoder, FrameReader, Reply, Request,
    MAX_MESSAGE_SIZE,
};
