//! Method dispatch: the [`Interface`] handler capability, pull-based
//! [`ReplyProducer`]s, and the [`VarlinkService`] registry implementing
//! `org.varlink.service`.

use std::borrow::Cow;
use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::*;
use crate::wire::{Reply, Request};

/// What `org.varlink.service.GetInfo` returns.
#[derive(Serialize, Deserialize, Debug, PartialEq, Default, Clone)]
pub struct ServiceInfo {
    pub vendor: Cow<'static, str>,
    pub product: Cow<'static, str>,
    pub version: Cow<'static, str>,
    pub url: Cow<'static, str>,
    pub interfaces: Vec<Cow<'static, str>>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default, Clone)]
pub struct GetInfoArgs;

#[derive(Serialize, Deserialize, Debug, PartialEq, Default, Clone)]
pub struct GetInterfaceDescriptionArgs<'a> {
    pub interface: Cow<'a, str>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default, Clone)]
pub struct GetInterfaceDescriptionReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One validated method invocation, handed to [`Interface::invoke`].
#[derive(Debug, Clone)]
pub struct Call {
    /// Bare method name, without the interface prefix.
    pub method: String,
    /// Parameters, already validated against the registered definition.
    pub parameters: Value,
    /// The caller asked for streamed replies.
    pub more: bool,
}

/// A pull-based source of replies for one active call.
///
/// The reactor asks for one reply at a time and does not ask for the next
/// before the previous one has been accepted by the connection's output
/// buffer. A reply without `continues: true`, or `None`, ends the call.
pub trait ReplyProducer: Send {
    fn next_reply(&mut self) -> Option<Reply>;

    /// The peer went away; the producer is dropped afterwards and never
    /// pulled again.
    fn cancel(&mut self) {}
}

impl<F> ReplyProducer for F
where
    F: FnMut() -> Option<Reply> + Send,
{
    fn next_reply(&mut self) -> Option<Reply> {
        self()
    }
}

/// Producer of a single reply, for plain one-shot methods.
pub fn reply_once(reply: Reply) -> Box<dyn ReplyProducer> {
    let mut slot = Some(reply);
    Box::new(move || slot.take())
}

/// A varlink interface handler, registered with a [`VarlinkService`] under
/// the name its definition text declares.
pub trait Interface: Send + Sync {
    fn get_name(&self) -> &str;

    /// The interface definition text handed out by
    /// `org.varlink.service.GetInterfaceDescription`.
    fn get_description(&self) -> &str;

    /// Start handling a call and hand back its reply producer.
    ///
    /// Wire-level errors are replies: yield `Reply::error(..)` from the
    /// producer, or return one of the standard error kinds
    /// (`MethodNotImplemented`, `InvalidParameter`, ...), which the service
    /// translates. Any other error is fatal to the connection.
    fn invoke(&self, call: Call) -> Result<Box<dyn ReplyProducer>>;

    /// Whether `method` may be called with `more: true`.
    fn supports_more(&self, _method: &str) -> bool {
        false
    }

    /// Raw bytes arriving after this interface accepted an upgrade.
    ///
    /// Returns how much of `input` was consumed; bytes pushed into `out` go
    /// back to the peer. The default refuses the tunnel and drops the
    /// connection.
    fn handle_upgraded(&self, _input: &[u8], _out: &mut Vec<u8>) -> Result<usize> {
        Err(context!(ErrorKind::ConnectionClosed))
    }
}

const SERVICE_DESCRIPTION: &str = r#"# The Varlink Service Interface is provided by every varlink service. It
# describes the service and the interfaces it implements.
interface org.varlink.service

# Get a list of all the interfaces a service provides and information
# about the implementation.
method GetInfo() -> (
  vendor: string,
  product: string,
  version: string,
  url: string,
  interfaces: []string
)

# Get the description of an interface that is implemented by this service.
method GetInterfaceDescription(interface: string) -> (description: string)

# The requested interface was not found.
error InterfaceNotFound (interface: string)

# The requested method was not found
error MethodNotFound (method: string)

# The interface defines the requested method, but the service does not
# implement it.
error MethodNotImplemented (method: string)

# One of the passed parameters is invalid.
error InvalidParameter (parameter: string)
"#;

fn error_interface_not_found(interface: &str) -> Reply {
    Reply::error(
        "org.varlink.service.InterfaceNotFound",
        Some(json!({ "interface": interface })),
    )
}

fn error_method_not_found(method: &str) -> Reply {
    Reply::error(
        "org.varlink.service.MethodNotFound",
        Some(json!({ "method": method })),
    )
}

fn error_method_not_implemented(method: &str) -> Reply {
    Reply::error(
        "org.varlink.service.MethodNotImplemented",
        Some(json!({ "method": method })),
    )
}

fn error_invalid_parameter(parameter: &str) -> Reply {
    Reply::error(
        "org.varlink.service.InvalidParameter",
        Some(json!({ "parameter": parameter })),
    )
}

enum RouteError {
    /// Answered with an error reply.
    Reply(Reply),
    /// Fatal to the connection.
    Fatal(Error),
}

impl From<Reply> for RouteError {
    fn from(r: Reply) -> Self {
        RouteError::Reply(r)
    }
}

/// The method-dispatch registry: interface handlers plus their parsed
/// definitions, and the implementation of `org.varlink.service` itself.
pub struct VarlinkService {
    info: ServiceInfo,
    ifaces: HashMap<String, Box<dyn Interface>>,
    models: HashMap<String, varlink_idl::Interface>,
}

impl VarlinkService {
    /// Create a service. Every registered description is parsed here; a
    /// definition that does not parse, or whose interface name does not
    /// match the handler's, is refused.
    pub fn new<S: Into<Cow<'static, str>>>(
        vendor: S,
        product: S,
        version: S,
        url: S,
        interfaces: Vec<Box<dyn Interface>>,
    ) -> Result<Self> {
        let mut ifaces = HashMap::new();
        let mut models = HashMap::new();
        let mut names: Vec<Cow<'static, str>> = vec!["org.varlink.service".into()];

        let service_model = varlink_idl::Interface::from_string(SERVICE_DESCRIPTION)
            .map_err(map_context!())?;
        models.insert("org.varlink.service".to_string(), service_model);

        for iface in interfaces {
            let model =
                varlink_idl::Interface::from_string(iface.get_description()).map_err(map_context!())?;
            if model.name != iface.get_name() {
                return Err(context!(ErrorKind::Idl(format!(
                    "handler `{}` registered with a definition of `{}`",
                    iface.get_name(),
                    model.name
                ))));
            }
            names.push(model.name.clone().into());
            models.insert(model.name.clone(), model);
            ifaces.insert(iface.get_name().to_string(), iface);
        }

        Ok(VarlinkService {
            info: ServiceInfo {
                vendor: vendor.into(),
                product: product.into(),
                version: version.into(),
                url: url.into(),
                interfaces: names,
            },
            ifaces,
            models,
        })
    }

    pub fn get_info(&self) -> &ServiceInfo {
        &self.info
    }

    /// Dispatch one request.
    ///
    /// `Ok(None)` means nothing is to be sent (oneway). `Err` is fatal to
    /// the connection.
    pub fn handle_call(&self, request: Request) -> Result<Option<Box<dyn ReplyProducer>>> {
        if request.wants_more() && request.is_oneway() {
            // mutually exclusive; this is malformed, not a oneway call
            return Ok(Some(reply_once(error_invalid_parameter("more"))));
        }
        let oneway = request.is_oneway();
        match self.route(request) {
            Ok(producer) => {
                if oneway {
                    // invoked for its side effects, no reply bytes at all
                    Ok(None)
                } else {
                    Ok(Some(producer))
                }
            }
            Err(RouteError::Reply(reply)) => {
                if oneway {
                    Ok(None)
                } else {
                    Ok(Some(reply_once(reply)))
                }
            }
            Err(RouteError::Fatal(e)) => Err(e),
        }
    }

    fn route(&self, request: Request) -> ::std::result::Result<Box<dyn ReplyProducer>, RouteError> {
        let (iface, member) = match request.split_method() {
            Some(split) => split,
            None => {
                return Err(error_interface_not_found(&request.method).into());
            }
        };
        let (iface, member) = (iface.to_string(), member.to_string());

        if iface == "org.varlink.service" {
            return self.service_call(&member, request.parameters.unwrap_or(Value::Null));
        }

        let handler = match self.ifaces.get(&iface) {
            Some(handler) => handler,
            None => return Err(error_interface_not_found(&iface).into()),
        };
        let model = &self.models[&iface];
        let method = match model.get_method(&member) {
            Some(method) => method,
            None => return Err(error_method_not_found(&member).into()),
        };

        let more = request.wants_more();
        if more && !handler.supports_more(&member) {
            return Err(error_method_not_implemented(&member).into());
        }

        let parameters = request.parameters.unwrap_or(Value::Null);
        if let Err(parameter) = model.validate_struct(&method.input, &parameters, true) {
            return Err(error_invalid_parameter(&parameter).into());
        }

        let call = Call {
            method: member,
            parameters,
            more,
        };
        handler.invoke(call).map_err(|e| {
            let reply = match e.kind() {
                ErrorKind::MethodNotFound(m) => Some(error_method_not_found(m)),
                ErrorKind::MethodNotImplemented(m) => Some(error_method_not_implemented(m)),
                ErrorKind::InvalidParameter(p) => Some(error_invalid_parameter(p)),
                ErrorKind::InterfaceNotFound(i) => Some(error_interface_not_found(i)),
                _ => None,
            };
            match reply {
                Some(reply) => RouteError::Reply(reply),
                None => RouteError::Fatal(e),
            }
        })
    }

    fn service_call(
        &self,
        method: &str,
        parameters: Value,
    ) -> ::std::result::Result<Box<dyn ReplyProducer>, RouteError> {
        let model = &self.models["org.varlink.service"];
        let definition = match model.get_method(method) {
            Some(definition) => definition,
            None => return Err(error_method_not_found(method).into()),
        };
        if let Err(parameter) = model.validate_struct(&definition.input, &parameters, true) {
            return Err(error_invalid_parameter(&parameter).into());
        }

        match method {
            "GetInfo" => {
                let info = serde_json::to_value(&self.info).map_err(|e| {
                    let category = e.classify();
                    RouteError::Fatal(context!(e, ErrorKind::SerdeJsonSer(category)))
                })?;
                Ok(reply_once(Reply::parameters(Some(info))))
            }
            "GetInterfaceDescription" => {
                let args: GetInterfaceDescriptionArgs = serde_json::from_value(parameters)
                    .map_err(|_| RouteError::Reply(error_invalid_parameter("interface")))?;
                let description = match args.interface.as_ref() {
                    "org.varlink.service" => SERVICE_DESCRIPTION,
                    name => match self.ifaces.get(name) {
                        Some(iface) => iface.get_description(),
                        None => {
                            return Err(error_interface_not_found(&args.interface).into());
                        }
                    },
                };
                Ok(reply_once(Reply::parameters(Some(
                    json!({ "description": description }),
                ))))
            }
            _ => Err(error_method_not_found(method).into()),
        }
    }

    /// Forward raw tunnel bytes of an upgraded connection.
    pub fn handle_upgraded(&self, iface: &str, input: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        match self.ifaces.get(iface) {
            Some(handler) => handler.handle_upgraded(input, out),
            None => Err(context!(ErrorKind::InterfaceNotFound(iface.to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Interface for Echo {
        fn get_name(&self) -> &str {
            "org.example.echo"
        }
        fn get_description(&self) -> &str {
            "interface org.example.echo\nmethod Echo(text: string) -> (text: string)\n"
        }
        fn invoke(&self, call: Call) -> Result<Box<dyn ReplyProducer>> {
            Ok(reply_once(Reply::parameters(Some(call.parameters))))
        }
    }

    fn service() -> VarlinkService {
        VarlinkService::new(
            "org.varlink",
            "test service",
            "0.1",
            "https://varlink.org",
            vec![Box::new(Echo)],
        )
        .unwrap()
    }

    fn call_single(service: &VarlinkService, request: Request) -> Option<Reply> {
        let mut producer = service.handle_call(request).unwrap()?;
        let reply = producer.next_reply();
        assert!(producer.next_reply().is_none());
        reply
    }

    #[test]
    fn test_echo_roundtrip() {
        let req = Request::create(
            "org.example.echo.Echo",
            Some(json!({"text": "hello"})),
        );
        let reply = call_single(&service(), req).unwrap();
        assert_eq!(reply.parameters, Some(json!({"text": "hello"})));
        assert_eq!(reply.error, None);
    }

    #[test]
    fn test_unknown_interface() {
        let req = Request::create("no.such.Iface.Foo", Some(json!({})));
        let reply = call_single(&service(), req).unwrap();
        assert_eq!(
            reply.error.as_deref(),
            Some("org.varlink.service.InterfaceNotFound")
        );
        assert_eq!(reply.parameters, Some(json!({"interface": "no.such.Iface"})));
    }

    #[test]
    fn test_unknown_method() {
        let req = Request::create("org.varlink.service.Bogus", Some(json!({})));
        let reply = call_single(&service(), req).unwrap();
        assert_eq!(
            reply.error.as_deref(),
            Some("org.varlink.service.MethodNotFound")
        );
        assert_eq!(reply.parameters, Some(json!({"method": "Bogus"})));
    }

    #[test]
    fn test_invalid_parameter() {
        let req = Request::create("org.example.echo.Echo", Some(json!({"text": 17})));
        let reply = call_single(&service(), req).unwrap();
        assert_eq!(
            reply.error.as_deref(),
            Some("org.varlink.service.InvalidParameter")
        );
        assert_eq!(reply.parameters, Some(json!({"parameter": "text"})));
    }

    #[test]
    fn test_more_on_plain_handler() {
        let mut req = Request::create("org.example.echo.Echo", Some(json!({"text": "x"})));
        req.more = Some(true);
        let reply = call_single(&service(), req).unwrap();
        assert_eq!(
            reply.error.as_deref(),
            Some("org.varlink.service.MethodNotImplemented")
        );
    }

    #[test]
    fn test_more_oneway_exclusion() {
        let mut req = Request::create("org.example.echo.Echo", Some(json!({"text": "x"})));
        req.more = Some(true);
        req.oneway = Some(true);
        let reply = call_single(&service(), req).unwrap();
        assert_eq!(
            reply.error.as_deref(),
            Some("org.varlink.service.InvalidParameter")
        );
        assert_eq!(reply.parameters, Some(json!({"parameter": "more"})));
    }

    #[test]
    fn test_oneway_produces_nothing() {
        let mut req = Request::create("org.example.echo.Echo", Some(json!({"text": "x"})));
        req.oneway = Some(true);
        assert!(service().handle_call(req).unwrap().is_none());

        // even a failing oneway call stays silent
        let mut req = Request::create("org.example.echo.Echo", Some(json!({"text": 1})));
        req.oneway = Some(true);
        assert!(service().handle_call(req).unwrap().is_none());
    }

    #[test]
    fn test_get_info() {
        let req = Request::create("org.varlink.service.GetInfo", None);
        let reply = call_single(&service(), req).unwrap();
        let info: ServiceInfo = serde_json::from_value(reply.parameters.unwrap()).unwrap();
        assert_eq!(info.vendor, "org.varlink");
        assert_eq!(
            info.interfaces,
            vec![
                Cow::from("org.varlink.service"),
                Cow::from("org.example.echo")
            ]
        );
    }

    #[test]
    fn test_get_interface_description() {
        let req = Request::create(
            "org.varlink.service.GetInterfaceDescription",
            Some(json!({"interface": "org.example.echo"})),
        );
        let reply = call_single(&service(), req).unwrap();
        assert_eq!(
            reply.parameters.unwrap()["description"].as_str().unwrap(),
            Echo.get_description()
        );

        let req = Request::create(
            "org.varlink.service.GetInterfaceDescription",
            Some(json!({"interface": "org.example.unknown"})),
        );
        let reply = call_single(&service(), req).unwrap();
        assert_eq!(
            reply.error.as_deref(),
            Some("org.varlink.service.InterfaceNotFound")
        );
    }

    #[test]
    fn test_missing_parameters_object() {
        let req = Request::create("org.varlink.service.GetInterfaceDescription", None);
        let reply = call_single(&service(), req).unwrap();
        assert_eq!(
            reply.error.as_deref(),
            Some("org.varlink.service.InvalidParameter")
        );
        assert_eq!(reply.parameters, Some(json!({"parameter": "interface"})));
    }

    #[test]
    fn test_method_without_interface() {
        let req = Request::create("WhereAmI", None);
        let reply = call_single(&service(), req).unwrap();
        assert_eq!(
            reply.error.as_deref(),
            Some("org.varlink.service.InterfaceNotFound")
        );
    }

    #[test]
    fn test_registration_rejects_bad_definition() {
        struct Broken;
        impl Interface for Broken {
            fn get_name(&self) -> &str {
                "org.example.broken"
            }
            fn get_description(&self) -> &str {
                "interface org.example.broken\nmethod ("
            }
            fn invoke(&self, _call: Call) -> Result<Box<dyn ReplyProducer>> {
                unreachable!()
            }
        }
        assert!(VarlinkService::new("v", "p", "1", "u", vec![Box::new(Broken)]).is_err());
    }
}
