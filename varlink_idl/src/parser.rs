//! Recursive-descent parser lowering interface definition text to the type
//! model in the crate root.

use crate::scanner::{ParseError, Scanner};
use crate::{Field, Interface, Method, Typedef, VEnum, VError, VStruct, VStructOrEnum, VType, VTypeExt};

pub(crate) enum Member {
    Typedef(Typedef),
    Method(Method),
    Error(VError),
}

pub(crate) fn parse(src: &str) -> Result<(Interface, Vec<Member>), ParseError> {
    let mut s = Scanner::new(src);

    if !s.get("interface") {
        return Err(s.error("'interface'"));
    }
    let doc = s.take_doc();
    let name = match s.get_interface_name() {
        Some(n) => n.to_string(),
        None => return Err(s.error("interface name")),
    };

    let mut members = Vec::new();
    while !s.at_end() {
        members.push(read_member(&mut s)?);
    }

    let interface = Interface {
        description: src.to_string(),
        name,
        doc,
        methods: Default::default(),
        method_keys: Vec::new(),
        typedefs: Default::default(),
        typedef_keys: Vec::new(),
        errors: Default::default(),
        error_keys: Vec::new(),
    };
    Ok((interface, members))
}

fn read_member(s: &mut Scanner) -> Result<Member, ParseError> {
    if s.get("type") {
        let doc = s.take_doc();
        let name = match s.get_member_name() {
            Some(n) => n.to_string(),
            None => return Err(s.error("type name")),
        };
        let elt = read_struct_or_enum(s)?;
        Ok(Member::Typedef(Typedef { name, doc, elt }))
    } else if s.get("method") {
        let doc = s.take_doc();
        let name = match s.get_member_name() {
            Some(n) => n.to_string(),
            None => return Err(s.error("method name")),
        };
        let input = read_struct(s)?;
        s.expect("->")?;
        let output = read_struct(s)?;
        Ok(Member::Method(Method {
            name,
            doc,
            input,
            output,
        }))
    } else if s.get("error") {
        let doc = s.take_doc();
        let name = match s.get_member_name() {
            Some(n) => n.to_string(),
            None => return Err(s.error("error name")),
        };
        let parm = read_struct(s)?;
        Ok(Member::Error(VError { name, doc, parm }))
    } else {
        Err(s.error("'type', 'method', or 'error'"))
    }
}

/// Parameter lists of methods and errors must be plain structs, never the
/// bare-identifier enum form.
fn read_struct(s: &mut Scanner) -> Result<VStruct, ParseError> {
    match read_struct_or_enum(s)? {
        VStructOrEnum::Struct(v) => Ok(*v),
        VStructOrEnum::Enum(_) => Err(s.error("field declarations")),
    }
}

fn read_struct_or_enum(s: &mut Scanner) -> Result<VStructOrEnum, ParseError> {
    s.expect("(")?;
    let mut is_enum: Option<bool> = None;
    let mut fields: Vec<Field> = Vec::new();
    let mut values: Vec<String> = Vec::new();

    if !s.get(")") {
        loop {
            let name = match s.get_field_name() {
                Some(n) => n.to_string(),
                None => return Err(s.error("field name")),
            };
            match is_enum {
                None => {
                    // the first entry decides between struct and enum form
                    if s.get(":") {
                        is_enum = Some(false);
                        let vtype = read_type(s, false)?;
                        fields.push(Field { name, vtype });
                    } else {
                        is_enum = Some(true);
                        values.push(name);
                    }
                }
                Some(false) => {
                    s.expect(":")?;
                    let vtype = read_type(s, false)?;
                    fields.push(Field { name, vtype });
                }
                Some(true) => values.push(name),
            }
            if !s.get(",") {
                break;
            }
        }
        s.expect(")")?;
    }

    if is_enum == Some(true) {
        Ok(VStructOrEnum::Enum(Box::new(VEnum { values })))
    } else {
        Ok(VStructOrEnum::Struct(Box::new(VStruct { fields })))
    }
}

fn read_type(s: &mut Scanner, after_option: bool) -> Result<VTypeExt, ParseError> {
    if s.get("?") {
        if after_option {
            return Err(s.error("a type, not '??'"));
        }
        return Ok(VTypeExt::Option(Box::new(read_type(s, true)?)));
    }
    if s.get("[string]") {
        return Ok(VTypeExt::Dict(Box::new(read_type(s, false)?)));
    }
    if s.get("[]") {
        return Ok(VTypeExt::Array(Box::new(read_type(s, false)?)));
    }

    let plain = if s.get("bool") {
        VType::Bool
    } else if s.get("int") {
        VType::Int
    } else if s.get("float") {
        VType::Float
    } else if s.get("string") {
        VType::String
    } else if s.get("object") {
        VType::Object
    } else if let Some(n) = s.get_member_name() {
        VType::Typename(n.to_string())
    } else {
        match read_struct_or_enum(s)? {
            VStructOrEnum::Struct(v) => VType::Struct(v),
            VStructOrEnum::Enum(v) => VType::Enum(v),
        }
    };
    Ok(VTypeExt::Plain(plain))
}
