//! Reflective client surface.
//!
//! A [`Client`] fetches interface definitions from the peer via
//! `org.varlink.service.GetInterfaceDescription`, parses them and caches the
//! models by name; the remote text is authoritative even when a local copy
//! exists. An [`InterfaceProxy`] then makes dynamic calls with
//! `serde_json::Value` parameters: arguments are validated against the
//! method's input struct before a single byte is written, and every reply
//! is checked against its output struct on the way in.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, RwLock};

use serde_json::Value;

use varlink_idl::Interface as InterfaceDefinition;

use crate::client::{
    Connection, MethodCall, OrgVarlinkServiceClient, OrgVarlinkServiceInterface, Replies,
};
use crate::error::*;
use crate::service::ServiceInfo;
use crate::wire::FrameReader;

pub struct Client {
    connection: Arc<RwLock<Connection>>,
    interfaces: HashMap<String, Arc<InterfaceDefinition>>,
}

impl Client {
    pub fn with_connection(connection: Arc<RwLock<Connection>>) -> Self {
        Client {
            connection,
            interfaces: HashMap::new(),
        }
    }

    pub fn with_address<S: ?Sized + AsRef<str>>(address: &S) -> Result<Self> {
        Ok(Self::with_connection(Connection::with_address(address)?))
    }

    /// Connect via the resolver, given only an interface name.
    pub fn with_resolved_interface<S: ?Sized + AsRef<str>>(
        interface: &S,
        resolver_address: Option<&str>,
    ) -> Result<Self> {
        Ok(Self::with_connection(Connection::with_resolved_interface(
            interface,
            resolver_address,
        )?))
    }

    /// Register a locally known definition. A later
    /// [`get_interface`](Self::get_interface) fetch of the same name
    /// replaces it with what the peer reports.
    pub fn add_interface(&mut self, definition: InterfaceDefinition) {
        self.interfaces
            .insert(definition.name.clone(), Arc::new(definition));
    }

    /// The peer's `GetInfo` data.
    pub fn get_info(&mut self) -> Result<ServiceInfo> {
        OrgVarlinkServiceClient::new(self.connection.clone()).get_info()
    }

    /// The parsed definition of `interface`, fetched from the peer unless
    /// already cached.
    pub fn get_interface(&mut self, interface: &str) -> Result<Arc<InterfaceDefinition>> {
        if let Some(definition) = self.interfaces.get(interface) {
            return Ok(definition.clone());
        }
        let reply = OrgVarlinkServiceClient::new(self.connection.clone())
            .get_interface_description(interface.to_string())?;
        let description = match reply.description {
            Some(description) => description,
            None => return Err(context!(ErrorKind::InterfaceNotFound(interface.to_string()))),
        };
        let definition =
            InterfaceDefinition::from_string(&description).map_err(map_context!())?;
        let definition = Arc::new(definition);
        self.interfaces
            .insert(definition.name.clone(), definition.clone());
        Ok(definition)
    }

    /// A proxy for making validated calls on `interface`.
    pub fn open(&mut self, interface: &str) -> Result<InterfaceProxy> {
        let definition = self.get_interface(interface)?;
        Ok(InterfaceProxy {
            connection: self.connection.clone(),
            interface: definition,
        })
    }
}

/// Lazy reply sequence of a streaming proxy call, each element checked
/// against the method's output struct.
pub type MoreReplies = Replies<Value, Error>;

/// Dynamic, validated calls on one interface over a shared connection.
///
/// Method names are the bare names from the definition; the proxy
/// qualifies them with the interface name on the wire.
pub struct InterfaceProxy {
    connection: Arc<RwLock<Connection>>,
    interface: Arc<InterfaceDefinition>,
}

impl InterfaceProxy {
    pub fn interface(&self) -> &InterfaceDefinition {
        &self.interface
    }

    /// Validate the arguments and build the call; nothing has been written
    /// yet when this fails.
    fn prepare(
        &self,
        method: &str,
        parameters: Value,
    ) -> Result<MethodCall<Value, Value, Error>> {
        let definition = self
            .interface
            .get_method(method)
            .ok_or_else(|| context!(ErrorKind::MethodNotFound(method.to_string())))?;
        self.interface
            .validate_struct(&definition.input, &parameters, true)
            .map_err(|parameter| context!(ErrorKind::InvalidParameter(parameter)))?;

        let qualified = format!("{}.{}", self.interface.name, method);
        Ok(
            MethodCall::new(self.connection.clone(), qualified, parameters)
                .with_reply_validation(self.interface.clone(), method.to_string()),
        )
    }

    /// Plain call: one reply.
    pub fn call(&mut self, method: &str, parameters: Value) -> Result<Value> {
        self.prepare(method, parameters)?.call()
    }

    /// Fire-and-forget: no reply is read, none will be sent.
    pub fn call_oneway(&mut self, method: &str, parameters: Value) -> Result<()> {
        self.prepare(method, parameters)?.oneway()
    }

    /// Streaming call: a lazy sequence of replies, ending with the first
    /// reply that does not carry `continues: true`.
    pub fn call_more(&mut self, method: &str, parameters: Value) -> Result<MoreReplies> {
        self.prepare(method, parameters)?.more()
    }

    /// Upgrade call: after the reply, the connection's byte stream is handed
    /// back for direct use.
    pub fn call_upgrade(&mut self, method: &str, parameters: Value) -> Result<(Value, UpgradedStream)> {
        let reply = self.prepare(method, parameters)?.upgrade()?;
        let mut conn = self.connection.write().unwrap();
        match (conn.reader.take(), conn.writer.take()) {
            (Some(reader), Some(writer)) => Ok((reply, UpgradedStream { reader, writer })),
            _ => Err(context!(ErrorKind::ConnectionBusy)),
        }
    }
}

/// The raw byte tunnel of an upgraded connection. Reads drain the frame
/// reader, so bytes the server sent right after its reply are not lost.
pub struct UpgradedStream {
    reader: FrameReader,
    writer: Box<dyn Write + Send + Sync>,
}

impl Read for UpgradedStream {
    fn read(&mut self, buf: &mut [u8]) -> ::std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Write for UpgradedStream {
    fn write(&mut self, buf: &[u8]) -> ::std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> ::std::io::Result<()> {
        self.writer.flush()
    }
}
