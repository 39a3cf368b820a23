//! Validation of JSON values against the parsed type model.
//!
//! Both sides of a connection use this: clients check call parameters before
//! anything is written, servers check incoming parameters before dispatching
//! and report the offending parameter in an `InvalidParameter` reply. On
//! failure the dotted path of the first bad parameter is returned, relative
//! to the parameters object (`a.b`, `entries[]`, `map[key]`).

use serde_json::Value;

use crate::{Interface, VEnum, VStruct, VStructOrEnum, VType, VTypeExt};

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

impl Interface {
    /// Validate a parameters object against a struct type.
    ///
    /// In strict mode fields not named by the struct are rejected; otherwise
    /// extra fields pass through untouched. Absent parameters objects count
    /// as empty.
    pub fn validate_struct(
        &self,
        vstruct: &VStruct,
        parameters: &Value,
        strict: bool,
    ) -> Result<(), String> {
        match parameters {
            Value::Null => {
                for field in &vstruct.fields {
                    if !field.vtype.is_option() {
                        return Err(field.name.clone());
                    }
                }
                Ok(())
            }
            _ => self.validate_struct_at(vstruct, parameters, "", strict),
        }
    }

    fn validate_struct_at(
        &self,
        vstruct: &VStruct,
        value: &Value,
        path: &str,
        strict: bool,
    ) -> Result<(), String> {
        let obj = match value.as_object() {
            Some(obj) => obj,
            None => {
                return Err(if path.is_empty() {
                    "parameters".to_string()
                } else {
                    path.to_string()
                });
            }
        };

        for field in &vstruct.fields {
            let fpath = join(path, &field.name);
            match obj.get(&field.name) {
                Some(v) => self.validate_type(&field.vtype, v, &fpath, strict)?,
                None => {
                    if !field.vtype.is_option() {
                        return Err(fpath);
                    }
                }
            }
        }

        if strict {
            for key in obj.keys() {
                if vstruct.get_field(key).is_none() {
                    return Err(join(path, key));
                }
            }
        }
        Ok(())
    }

    fn validate_type(
        &self,
        vtype: &VTypeExt,
        value: &Value,
        path: &str,
        strict: bool,
    ) -> Result<(), String> {
        match vtype {
            VTypeExt::Option(inner) => {
                if value.is_null() {
                    Ok(())
                } else {
                    self.validate_type(inner, value, path, strict)
                }
            }
            VTypeExt::Array(inner) => match value.as_array() {
                Some(items) => {
                    let epath = format!("{}[]", path);
                    for item in items {
                        self.validate_type(inner, item, &epath, strict)?;
                    }
                    Ok(())
                }
                None => Err(path.to_string()),
            },
            VTypeExt::Dict(inner) => match value.as_object() {
                Some(map) => {
                    for (key, item) in map {
                        let epath = format!("{}[{}]", path, key);
                        self.validate_type(inner, item, &epath, strict)?;
                    }
                    Ok(())
                }
                None => Err(path.to_string()),
            },
            VTypeExt::Plain(plain) => self.validate_plain(plain, value, path, strict),
        }
    }

    fn validate_plain(
        &self,
        vtype: &VType,
        value: &Value,
        path: &str,
        strict: bool,
    ) -> Result<(), String> {
        let ok = match vtype {
            VType::Bool => value.is_boolean(),
            // must be representable as a signed 64-bit integer
            VType::Int => value.as_i64().is_some(),
            VType::Float => value.is_number(),
            VType::String => value.is_string(),
            VType::Object => true,
            VType::Enum(e) => enum_accepts(e, value),
            VType::Struct(s) => return self.validate_struct_at(s, value, path, strict),
            VType::Typename(name) => match self.typedefs.get(name) {
                Some(t) => match &t.elt {
                    VStructOrEnum::Struct(s) => {
                        return self.validate_struct_at(s, value, path, strict)
                    }
                    VStructOrEnum::Enum(e) => enum_accepts(e, value),
                },
                // unresolved names are rejected at parse time
                None => false,
            },
        };
        if ok {
            Ok(())
        } else {
            Err(path.to_string())
        }
    }
}

fn enum_accepts(e: &VEnum, value: &Value) -> bool {
    match value.as_str() {
        Some(s) => e.values.iter().any(|v| v == s),
        None => false,
    }
}
