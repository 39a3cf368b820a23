//! The `varlink bridge` subcommand: relay NUL-framed varlink messages
//! between stdio and local services, resolving each target interface unless
//! a fixed address was given.

use std::io::{self, Write};
use std::sync::{Arc, RwLock};

use failure::ResultExt;
use serde_json::json;

use varlink::{Connection, FrameReader, Reply, Request};

use crate::error::{ErrorKind, Result};

fn connection_for(
    connect: Option<&str>,
    activate: Option<&str>,
    bridge: Option<&str>,
) -> Result<Option<Arc<RwLock<Connection>>>> {
    match (connect, activate, bridge) {
        (Some(address), _, _) => Ok(Some(
            Connection::with_address(address).context(ErrorKind::Connection(address.into()))?,
        )),
        (None, Some(command), _) => Ok(Some(
            Connection::with_activate(command).context(ErrorKind::Connection(command.into()))?,
        )),
        (None, None, Some(command)) => Ok(Some(
            Connection::with_bridge(command).context(ErrorKind::Connection(command.into()))?,
        )),
        _ => Ok(None),
    }
}

/// Which interface a request has to be routed to when going through the
/// resolver. Service introspection goes to the resolver itself.
fn resolving_interface(request: &Request) -> String {
    if request.method == "org.varlink.service.GetInfo" {
        return "org.varlink.resolver".into();
    }
    if request.method == "org.varlink.service.GetInterfaceDescription" {
        return request
            .parameters
            .as_ref()
            .and_then(|p| p.get("interface"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
    }
    match request.split_method() {
        Some((interface, _)) => interface.to_string(),
        None => String::new(),
    }
}

pub fn run_bridge(
    connect: Option<&str>,
    resolver: Option<&str>,
    activate: Option<&str>,
    bridge: Option<&str>,
) -> Result<()> {
    let mut stdin = FrameReader::new(Box::new(io::stdin()));
    let stdout = io::stdout();
    let mut stdout = stdout.lock();

    let mut conn = connection_for(connect, activate, bridge)?;
    let fixed = conn.is_some();
    let mut last_interface: Option<String> = None;

    loop {
        let message = match stdin.read_frame() {
            Ok(message) => message,
            // end of input ends the bridge
            Err(e) => match e.kind() {
                varlink::ErrorKind::ConnectionClosed => return Ok(()),
                _ => return Err(e.into()),
            },
        };
        if message.is_empty() {
            continue;
        }

        let request: Request = serde_json::from_slice(&message)
            .context(ErrorKind::SerdeJsonDe(
                String::from_utf8_lossy(&message).to_string(),
            ))?;

        if !fixed {
            let interface = resolving_interface(&request);
            if !interface.contains('.') {
                let reply = Reply::error(
                    "org.varlink.service.InterfaceNotFound",
                    Some(json!({ "interface": request.method.as_ref() })),
                );
                stdout.write_all(&varlink::serialize_reply(&reply)?)?;
                stdout.flush()?;
                continue;
            }
            if last_interface.as_deref() != Some(interface.as_str()) {
                conn = Some(
                    Connection::with_resolved_interface(&interface, resolver)
                        .context(ErrorKind::Connection(interface.clone()))?,
                );
                last_interface = Some(interface);
            }
        }

        let conn = conn.as_ref().unwrap();
        let mut c = conn.write().unwrap();

        {
            let writer = c.writer.as_mut().unwrap();
            writer.write_all(&message)?;
            writer.write_all(b"\0")?;
            writer.flush()?;
        }

        if request.is_oneway() {
            continue;
        }

        let reader = c.reader.as_mut().unwrap();
        loop {
            let target = last_interface.clone().unwrap_or_else(|| "bridge".into());
            let frame = reader
                .read_frame()
                .context(ErrorKind::Connection(target))?;
            stdout.write_all(&frame)?;
            stdout.write_all(b"\0")?;
            stdout.flush()?;

            let reply: Reply = serde_json::from_slice(&frame).context(
                ErrorKind::SerdeJsonDe(String::from_utf8_lossy(&frame).to_string()),
            )?;
            if !reply.is_continues() {
                break;
            }
        }
    }
}
