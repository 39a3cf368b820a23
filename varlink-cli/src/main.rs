use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::process::exit;

use clap::{App, Arg, SubCommand};
use failure::ResultExt;

use varlink::{Client, Connection, OrgVarlinkResolverClient};
use varlink_idl::Interface;

use crate::error::{Error, ErrorKind, Result};

mod error;
mod proxy;

fn varlink_format(filename: &str) -> Result<()> {
    let mut buffer = String::new();
    File::open(Path::new(filename))?.read_to_string(&mut buffer)?;

    let interface = Interface::from_string(&buffer)?;
    println!("{}", interface);
    Ok(())
}

fn varlink_info(
    address: Option<&str>,
    activate: Option<&str>,
    bridge: Option<&str>,
) -> Result<()> {
    let connection = match (address, activate, bridge) {
        (Some(address), _, _) => {
            Connection::with_address(address).context(ErrorKind::Connection(address.into()))?
        }
        (None, Some(command), _) => {
            Connection::with_activate(command).context(ErrorKind::Connection(command.into()))?
        }
        (None, None, Some(command)) => {
            Connection::with_bridge(command).context(ErrorKind::Connection(command.into()))?
        }
        _ => {
            return Err(ErrorKind::Argument(
                "need ADDRESS, --activate or --bridge".into(),
            )
            .into());
        }
    };

    let info = Client::with_connection(connection).get_info()?;
    println!("Vendor: {}", info.vendor);
    println!("Product: {}", info.product);
    println!("Version: {}", info.version);
    println!("URL: {}", info.url);
    println!("Interfaces:");
    for i in info.interfaces {
        println!("  {}", i)
    }

    Ok(())
}

fn client_for_interface(
    address: Option<&str>,
    interface: &str,
    resolver: Option<&str>,
    activate: Option<&str>,
    bridge: Option<&str>,
) -> Result<Client> {
    match (address, activate, bridge) {
        (Some(address), _, _) => Ok(Client::with_address(address)
            .context(ErrorKind::Connection(address.into()))?),
        (None, Some(command), _) => Ok(Client::with_connection(
            Connection::with_activate(command).context(ErrorKind::Connection(command.into()))?,
        )),
        (None, None, Some(command)) => Ok(Client::with_connection(
            Connection::with_bridge(command).context(ErrorKind::Connection(command.into()))?,
        )),
        _ => Ok(Client::with_resolved_interface(interface, resolver)
            .context(ErrorKind::Connection(interface.into()))?),
    }
}

fn varlink_help(
    url: &str,
    resolver: Option<&str>,
    activate: Option<&str>,
    bridge: Option<&str>,
) -> Result<()> {
    let (address, interface) = match varlink::split_address_interface(url) {
        (address, Some(interface)) => (Some(address), interface),
        (interface, None) => (None, interface),
    };
    if !interface.contains('.') {
        return Err(ErrorKind::Argument(format!("invalid interface '{}'", interface)).into());
    }

    let mut client = client_for_interface(address, interface, resolver, activate, bridge)?;
    let definition = client.get_interface(interface)?;
    println!("{}", definition.get_description().trim_end());

    Ok(())
}

fn varlink_call(
    url: &str,
    arguments: Option<&str>,
    more: bool,
    oneway: bool,
    resolver: Option<&str>,
    activate: Option<&str>,
    bridge: Option<&str>,
) -> Result<()> {
    let (address, qualified) = match varlink::split_address_interface(url) {
        (address, Some(method)) => (Some(address), method),
        (method, None) => (None, method),
    };
    let dot = qualified
        .rfind('.')
        .ok_or_else(|| Error::from(ErrorKind::Argument(format!("no method in '{}'", url))))?;
    let interface = &qualified[..dot];
    let method = &qualified[dot + 1..];
    if !interface.contains('.') {
        return Err(ErrorKind::Argument(format!("invalid method '{}'", qualified)).into());
    }

    let parameters = match arguments {
        Some(args) => {
            serde_json::from_str(args).context(ErrorKind::SerdeJsonDe(args.to_string()))?
        }
        None => serde_json::json!({}),
    };

    let mut client = client_for_interface(address, interface, resolver, activate, bridge)?;
    let mut proxy = client.open(interface)?;

    if oneway {
        proxy.call_oneway(method, parameters)?;
    } else if more {
        for reply in proxy.call_more(method, parameters)? {
            println!("{}", serde_json::to_string(&reply?)?);
        }
    } else {
        let reply = proxy.call(method, parameters)?;
        println!("{}", serde_json::to_string(&reply)?);
    }

    Ok(())
}

fn varlink_resolve(interface: &str, resolver: Option<&str>) -> Result<()> {
    let resolver = resolver.unwrap_or("unix:/run/org.varlink.resolver");
    let connection =
        Connection::with_address(resolver).context(ErrorKind::Connection(resolver.into()))?;
    let reply = OrgVarlinkResolverClient::new(connection).resolve(interface.to_string())?;
    println!("{}", reply.address);
    Ok(())
}

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn run() -> Result<()> {
    let mut app = App::new("varlink")
        .version(VERSION)
        .arg(
            Arg::with_name("resolver")
                .short("R")
                .long("resolver")
                .value_name("ADDRESS")
                .help("address of the resolver")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("activate")
                .short("A")
                .long("activate")
                .value_name("COMMAND")
                .help("service to socket-activate and connect to")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("bridge")
                .short("b")
                .long("bridge")
                .value_name("COMMAND")
                .help("command to execute and connect to")
                .takes_value(true),
        )
        .subcommand(
            SubCommand::with_name("bridge")
                .version(VERSION)
                .about("Bridge varlink messages to services on this machine")
                .long_about(
                    "Bridge varlink messages on standard in and out to varlink services on this \
                     machine.",
                )
                .arg(
                    Arg::with_name("connect")
                        .short("c")
                        .long("connect")
                        .value_name("ADDRESS")
                        .help("fixed varlink address to relay to, bypassing the resolver")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("call")
                .version(VERSION)
                .about("Call a method")
                .long_about("Call METHOD on INTERFACE at ADDRESS. ARGUMENTS must be valid JSON.")
                .arg(
                    Arg::with_name("more")
                        .short("m")
                        .long("more")
                        .help("wait for multiple method returns if supported"),
                )
                .arg(
                    Arg::with_name("oneway")
                        .long("oneway")
                        .help("send the call and do not wait for a reply"),
                )
                .arg(
                    Arg::with_name("METHOD")
                        .value_name("[ADDRESS/]INTERFACE.METHOD")
                        .required(true),
                )
                .arg(Arg::with_name("ARGUMENTS").required(false)),
        )
        .subcommand(
            SubCommand::with_name("format")
                .version(VERSION)
                .about("Format a varlink service file")
                .arg(
                    Arg::with_name("FILE")
                        .required(true)
                        .help("The varlink interface definition file to format"),
                ),
        )
        .subcommand(
            SubCommand::with_name("info")
                .version(VERSION)
                .about("Print information about a service")
                .long_about("Prints information about the service running at ADDRESS.")
                .arg(Arg::with_name("ADDRESS").required(false)),
        )
        .subcommand(
            SubCommand::with_name("help")
                .version(VERSION)
                .about("Print interface description or service information")
                .long_about("Prints information about INTERFACE.")
                .arg(
                    Arg::with_name("INTERFACE")
                        .value_name("[ADDRESS/]INTERFACE")
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("resolve")
                .version(VERSION)
                .about("Resolve an interface name to a varlink address")
                .long_about("Resolve INTERFACE to the varlink address that implements it.")
                .arg(Arg::with_name("INTERFACE").required(true)),
        )
        .subcommand(
            SubCommand::with_name("completions")
                .version(VERSION)
                .about("Generates completion scripts for your shell")
                .arg(
                    Arg::with_name("SHELL")
                        .required(true)
                        .possible_values(&["bash", "fish", "zsh"])
                        .help("The shell to generate the script for"),
                ),
        );
    let matches = app.clone().get_matches();

    let resolver = matches.value_of("resolver");
    let activate = matches.value_of("activate");
    let bridge = matches.value_of("bridge");

    match matches.subcommand() {
        ("completions", Some(sub_matches)) => {
            let shell = sub_matches.value_of("SHELL").unwrap();
            app.gen_completions_to("varlink", shell.parse().unwrap(), &mut io::stdout());
            Ok(())
        }
        ("format", Some(sub_matches)) => {
            let filename = sub_matches.value_of("FILE").unwrap();
            varlink_format(filename)
        }
        ("info", Some(sub_matches)) => {
            varlink_info(sub_matches.value_of("ADDRESS"), activate, bridge)
        }
        ("help", Some(sub_matches)) => {
            let interface = sub_matches.value_of("INTERFACE").unwrap();
            varlink_help(interface, resolver, activate, bridge)
        }
        ("call", Some(sub_matches)) => {
            let method = sub_matches.value_of("METHOD").unwrap();
            let arguments = sub_matches.value_of("ARGUMENTS");
            let more = sub_matches.is_present("more");
            let oneway = sub_matches.is_present("oneway");
            varlink_call(method, arguments, more, oneway, resolver, activate, bridge)
        }
        ("resolve", Some(sub_matches)) => {
            let interface = sub_matches.value_of("INTERFACE").unwrap();
            varlink_resolve(interface, resolver)
        }
        ("bridge", Some(sub_matches)) => {
            proxy::run_bridge(sub_matches.value_of("connect"), resolver, activate, bridge)
        }
        (_, _) => {
            app.print_help().context(ErrorKind::Argument("no command".into()))?;
            println!();
            Ok(())
        }
    }
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        match e.kind() {
            ErrorKind::VarlinkError { error, parameters } => {
                eprintln!("Call failed with error: {}", error);
                eprintln!("{}", parameters);
            }
            _ => eprintln!("Error: {}", e),
        }
        exit(e.exit_code());
    }
}
