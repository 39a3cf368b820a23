//! varlink_idl parses [varlink](https://varlink.org) interface definition
//! files into a runtime type model and validates JSON values against it.
//!
//! # Examples
//!
//! ```rust
//! use varlink_idl::Interface;
//!
//! let interface = Interface::from_string(
//! "# Example service
//! interface org.example.ping
//!
//! # Returns the same string
//! method Ping(ping: string) -> (pong: string)
//! ").unwrap();
//!
//! assert_eq!(interface.name, "org.example.ping");
//! assert!(interface.get_method("Ping").is_some());
//! ```
//!
//! The parsed [`Interface`] keeps the source text it was built from; this
//! text is what `org.varlink.service.GetInterfaceDescription` hands out on
//! the wire. `Display` renders it normalized: trailing whitespace stripped
//! and runs of blank lines collapsed.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use itertools::Itertools;

pub use crate::scanner::ParseError;

mod parser;
mod scanner;
mod validate;

#[cfg(test)]
mod test;

/// Errors from [`Interface::from_string`].
#[derive(Debug)]
pub enum Error {
    /// Syntax error with source position.
    Syntax(ParseError),
    /// The definition parsed but is inconsistent (duplicate or unresolved
    /// names); the message aggregates every defect found.
    Interface(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Syntax(e) => write!(f, "varlink parse error: {}", e),
            Error::Interface(msg) => write!(f, "interface definition error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::Syntax(e)
    }
}

/// A base type.
#[derive(Debug, Clone, PartialEq)]
pub enum VType {
    Bool,
    Int,
    Float,
    String,
    Object,
    Typename(String),
    Struct(Box<VStruct>),
    Enum(Box<VEnum>),
}

/// A type with its modifiers.
#[derive(Debug, Clone, PartialEq)]
pub enum VTypeExt {
    Plain(VType),
    /// `?T`
    Option(Box<VTypeExt>),
    /// `[]T`
    Array(Box<VTypeExt>),
    /// `[string]T`
    Dict(Box<VTypeExt>),
}

impl VTypeExt {
    pub fn is_option(&self) -> bool {
        matches!(self, VTypeExt::Option(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub vtype: VTypeExt,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VStruct {
    pub fields: Vec<Field>,
}

impl VStruct {
    pub fn get_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VEnum {
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VStructOrEnum {
    Struct(Box<VStruct>),
    Enum(Box<VEnum>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Typedef {
    pub name: String,
    pub doc: String,
    pub elt: VStructOrEnum,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Method {
    pub name: String,
    pub doc: String,
    pub input: VStruct,
    pub output: VStruct,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VError {
    pub name: String,
    pub doc: String,
    pub parm: VStruct,
}

/// A parsed interface definition.
///
/// Immutable once built; servers and clients share one instance per
/// interface and consult it to validate call parameters and replies.
#[derive(Debug, Clone)]
pub struct Interface {
    /// The source text the interface was parsed from.
    pub description: String,
    pub name: String,
    pub doc: String,
    pub methods: BTreeMap<String, Method>,
    pub method_keys: Vec<String>,
    pub typedefs: BTreeMap<String, Typedef>,
    pub typedef_keys: Vec<String>,
    pub errors: BTreeMap<String, VError>,
    pub error_keys: Vec<String>,
}

impl Interface {
    pub fn from_string(src: &str) -> Result<Self, Error> {
        let (mut interface, members) = parser::parse(src)?;
        let mut defects = HashSet::new();

        for member in members {
            match member {
                parser::Member::Method(m) => {
                    if interface.typedef_keys.contains(&m.name)
                        || interface.error_keys.contains(&m.name)
                    {
                        defects.insert(format!(
                            "interface `{}`: multiple definitions of `{}`!",
                            interface.name, m.name
                        ));
                    }
                    interface.method_keys.push(m.name.clone());
                    if let Some(d) = interface.methods.insert(m.name.clone(), m) {
                        defects.insert(format!(
                            "interface `{}`: multiple definitions of method `{}`!",
                            interface.name, d.name
                        ));
                    }
                }
                parser::Member::Typedef(t) => {
                    if interface.method_keys.contains(&t.name)
                        || interface.error_keys.contains(&t.name)
                    {
                        defects.insert(format!(
                            "interface `{}`: multiple definitions of `{}`!",
                            interface.name, t.name
                        ));
                    }
                    interface.typedef_keys.push(t.name.clone());
                    if let Some(d) = interface.typedefs.insert(t.name.clone(), t) {
                        defects.insert(format!(
                            "interface `{}`: multiple definitions of type `{}`!",
                            interface.name, d.name
                        ));
                    }
                }
                parser::Member::Error(e) => {
                    if interface.method_keys.contains(&e.name)
                        || interface.typedef_keys.contains(&e.name)
                    {
                        defects.insert(format!(
                            "interface `{}`: multiple definitions of `{}`!",
                            interface.name, e.name
                        ));
                    }
                    interface.error_keys.push(e.name.clone());
                    if let Some(d) = interface.errors.insert(e.name.clone(), e) {
                        defects.insert(format!(
                            "interface `{}`: multiple definitions of error `{}`!",
                            interface.name, d.name
                        ));
                    }
                }
            }
        }

        interface.check_consistency(&mut defects);

        if !defects.is_empty() {
            return Err(Error::Interface(defects.into_iter().sorted().join("\n")));
        }
        Ok(interface)
    }

    /// Every referenced type name must resolve within this interface and
    /// field names must be unique per struct.
    fn check_consistency(&self, defects: &mut HashSet<String>) {
        for t in self.typedefs.values() {
            if let VStructOrEnum::Struct(s) = &t.elt {
                self.check_struct(s, &t.name, defects);
            }
        }
        for m in self.methods.values() {
            self.check_struct(&m.input, &m.name, defects);
            self.check_struct(&m.output, &m.name, defects);
        }
        for e in self.errors.values() {
            self.check_struct(&e.parm, &e.name, defects);
        }
    }

    fn check_struct(&self, s: &VStruct, member: &str, defects: &mut HashSet<String>) {
        let mut seen = HashSet::new();
        for field in &s.fields {
            if !seen.insert(field.name.as_str()) {
                defects.insert(format!(
                    "interface `{}`: `{}` has multiple fields named `{}`!",
                    self.name, member, field.name
                ));
            }
            self.check_type(&field.vtype, member, defects);
        }
    }

    fn check_type(&self, t: &VTypeExt, member: &str, defects: &mut HashSet<String>) {
        match t {
            VTypeExt::Plain(VType::Typename(name)) => {
                if !self.typedefs.contains_key(name) {
                    defects.insert(format!(
                        "interface `{}`: `{}` references unknown type `{}`!",
                        self.name, member, name
                    ));
                }
            }
            VTypeExt::Plain(VType::Struct(s)) => self.check_struct(s, member, defects),
            VTypeExt::Plain(_) => {}
            VTypeExt::Option(inner) | VTypeExt::Array(inner) | VTypeExt::Dict(inner) => {
                self.check_type(inner, member, defects)
            }
        }
    }

    pub fn get_method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    /// The interface definition text as handed to the parser.
    pub fn get_description(&self) -> &str {
        &self.description
    }
}

/// The normalized definition text: per-line trailing whitespace removed,
/// blank-line runs collapsed to one, exactly one trailing newline.
impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut blank_pending = false;
        let mut wrote_any = false;
        for line in self.description.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                blank_pending = wrote_any;
                continue;
            }
            if blank_pending {
                f.write_str("\n")?;
                blank_pending = false;
            }
            f.write_str(line)?;
            f.write_str("\n")?;
            wrote_any = true;
        }
        Ok(())
    }
}
