use serde_json::json;

use crate::*;

#[test]
fn test_standard() {
    let v = Interface::from_string(
        "
# The Varlink Service Interface is provided by every varlink service. It
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
",
    )
    .unwrap();
    assert_eq!(v.name, "org.varlink.service");
    assert_eq!(
        v.doc,
        "The Varlink Service Interface is provided by every varlink service. It\n\
         describes the service and the interfaces it implements."
    );
    assert_eq!(
        v.methods.get("GetInterfaceDescription").unwrap().doc,
        "Get the description of an interface that is implemented by this service."
    );
    assert_eq!(
        v.method_keys,
        vec!["GetInfo".to_string(), "GetInterfaceDescription".to_string()]
    );
    assert_eq!(v.error_keys.len(), 4);

    let get_info = v.get_method("GetInfo").unwrap();
    assert!(get_info.input.fields.is_empty());
    assert_eq!(get_info.output.fields.len(), 5);
    assert_eq!(get_info.output.fields[4].name, "interfaces");
    assert!(matches!(
        get_info.output.fields[4].vtype,
        VTypeExt::Array(_)
    ));
}

#[test]
fn test_complex() {
    let v = Interface::from_string(
        "interface org.example.complex
type TypeEnum ( a, b, c )

type TypeFoo (
bool: bool,
int: int,
float: float,
string: string,
array: ?[]string,
enum: ( foo, bar, baz ),
type: TypeEnum,
anon: ( foo: bool, bar: int, baz: ( a: int, b: int) )
)

method Foo(a: (b: bool, c: int), foo: TypeFoo) -> (a: (b: bool, c: int), foo: TypeFoo)

error ErrorFoo (a: (b: bool, c: int), foo: TypeFoo)
",
    )
    .unwrap();
    assert_eq!(v.name, "org.example.complex");

    let t = v.typedefs.get("TypeEnum").unwrap();
    assert!(matches!(&t.elt, VStructOrEnum::Enum(e) if e.values == ["a", "b", "c"]));

    let foo = v.typedefs.get("TypeFoo").unwrap();
    let fields = match &foo.elt {
        VStructOrEnum::Struct(s) => &s.fields,
        _ => panic!("TypeFoo should be a struct"),
    };
    // keywords stay usable as field names
    assert_eq!(fields[0].name, "bool");
    assert_eq!(fields[6].name, "type");
    assert_eq!(
        fields[6].vtype,
        VTypeExt::Plain(VType::Typename("TypeEnum".into()))
    );
}

#[test]
fn test_one_method() {
    assert!(Interface::from_string("interface foo.bar\nmethod Foo()->()").is_ok());
}

#[test]
fn test_one_method_no_type() {
    let e = Interface::from_string("interface foo.bar\nmethod Foo()->(b:)").unwrap_err();
    match e {
        Error::Syntax(p) => assert_eq!(p.line, 2),
        other => panic!("expected syntax error, got {:?}", other),
    }
}

#[test]
fn test_domainnames() {
    fn ok(name: &str) -> bool {
        Interface::from_string(&format!("interface {}\nmethod F()->()", name)).is_ok()
    }
    assert!(ok("org.varlink.service"));
    assert!(ok("com.example.0example"));
    assert!(ok("com.example.example-dash"));
    assert!(ok("xn--lgbbat1ad8j.example.algeria"));
    assert!(ok("com.Example"));
    assert!(ok("a.b"));
    assert!(ok("a.b.c"));
    assert!(ok("a.21.c"));
    assert!(ok("a.1"));
    assert!(ok("a1.b--1.c--1"));
    assert!(!ok("ab"));
    assert!(!ok(".a.b.c"));
    assert!(!ok("a.b.c."));
    assert!(!ok("a..b.c"));
    assert!(!ok("1.b.c"));
    assert!(!ok("8a.0.0"));
    assert!(!ok("-a.b.c"));
    assert!(!ok("a.b.c-"));
    assert!(!ok("com.-example.leadinghyphen"));
    assert!(!ok("com.example-.danglinghyphen-"));
    assert!(!ok("a.*.c"));
    assert!(!ok("a.?"));
}

#[test]
fn test_type_forms() {
    assert!(Interface::from_string("interface foo.bar\ntype I ()\nmethod F()->()").is_ok());
    assert!(Interface::from_string("interface foo.bar\ntype I (b: bool)\nmethod F()->()").is_ok());
    assert!(
        Interface::from_string("interface foo.bar\ntype I (b: (foo, bar, baz))\nmethod F()->()")
            .is_ok()
    );
    assert!(
        Interface::from_string("interface foo.bar\ntype I (b: [string]string)\nmethod F()->()")
            .is_ok()
    );
    assert!(
        Interface::from_string("interface foo.bar\ntype I (b: [string]())\nmethod F()->()").is_ok()
    );
    assert!(Interface::from_string("interface foo.bar\ntype I (b: object)\nmethod F()->()").is_ok());
    assert!(Interface::from_string("interface foo.bar\ntype I (b: []bool)\nmethod F()->()").is_ok());
    assert!(Interface::from_string("interface foo.bar\ntype I (b: ?[]?int)\nmethod F()->()").is_ok());
    assert!(Interface::from_string("interface foo.bar\ntype I (b: ??bool)\nmethod F()->()").is_err());
    assert!(
        Interface::from_string("interface foo.bar\ntype I (b: bool[])\nmethod F()->()").is_err()
    );
    assert!(
        Interface::from_string("interface foo.bar\ntype I (b: [ ]bool)\nmethod F()->()").is_err()
    );
    assert!(
        Interface::from_string("interface foo.bar\ntype I (b: [1]bool)\nmethod F()->()").is_err()
    );
}

#[test]
fn test_nested_modifiers() {
    let v =
        Interface::from_string("interface foo.bar\ntype I (b: ?[][]string)\nmethod F()->()")
            .unwrap();
    let t = v.typedefs.get("I").unwrap();
    let field = match &t.elt {
        VStructOrEnum::Struct(s) => &s.fields[0],
        _ => panic!(),
    };
    assert_eq!(
        field.vtype,
        VTypeExt::Option(Box::new(VTypeExt::Array(Box::new(VTypeExt::Array(
            Box::new(VTypeExt::Plain(VType::String))
        )))))
    );
}

#[test]
fn test_mixed_enum_struct_form() {
    assert!(Interface::from_string("interface foo.bar\ntype I (a, b: int)\nmethod F()->()").is_err());
    assert!(Interface::from_string("interface foo.bar\ntype I (a: int, b)\nmethod F()->()").is_err());
    // method parameters cannot use the enum form
    assert!(Interface::from_string("interface foo.bar\nmethod F(a, b)->()").is_err());
}

#[test]
fn test_duplicate() {
    let e = Interface::from_string(
        "
interface foo.example
type Device()
type Device()
type T()
type T()
method F() -> ()
method F() -> ()
",
    )
    .unwrap_err();
    assert_eq!(
        e.to_string(),
        "interface definition error: \
interface `foo.example`: multiple definitions of method `F`!
interface `foo.example`: multiple definitions of type `Device`!
interface `foo.example`: multiple definitions of type `T`!"
    );
}

#[test]
fn test_unresolved_typename() {
    let e = Interface::from_string("interface foo.bar\nmethod F(a: Missing) -> ()").unwrap_err();
    assert!(e.to_string().contains("unknown type `Missing`"));
}

#[test]
fn test_duplicate_field() {
    let e =
        Interface::from_string("interface foo.bar\nmethod F(a: int, a: string) -> ()").unwrap_err();
    assert!(e.to_string().contains("multiple fields named `a`"));
}

#[test]
fn test_normalize() {
    let v = Interface::from_string(
        "interface foo.bar  \n\n\n\ntype I (b: []bool)\t\n\nmethod F() -> ()",
    )
    .unwrap();
    assert_eq!(
        v.to_string(),
        "interface foo.bar\n\ntype I (b: []bool)\n\nmethod F() -> ()\n"
    );
    // normalizing is idempotent over already-normal text
    let w = Interface::from_string(&v.to_string()).unwrap();
    assert_eq!(w.to_string(), v.to_string());
}

fn test_interface() -> Interface {
    Interface::from_string(
        "interface org.example.test
type Mode (host, container)
type Entry (key: string, count: int)
method Configure(mode: Mode, entries: []Entry, extra: ?object, labels: [string]string) -> ()
method Ping(ping: string) -> (pong: string)
",
    )
    .unwrap()
}

#[test]
fn test_validate_accepts() {
    let v = test_interface();
    let m = v.get_method("Configure").unwrap();
    let params = json!({
        "mode": "host",
        "entries": [{"key": "a", "count": 1}, {"key": "b", "count": 2}],
        "labels": {"x": "y"}
    });
    assert_eq!(v.validate_struct(&m.input, &params, true), Ok(()));

    // optional field may be present, null, or absent
    let with_extra = json!({"mode": "host", "entries": [], "extra": {"free": ["form"]}, "labels": {}});
    assert_eq!(v.validate_struct(&m.input, &with_extra, true), Ok(()));
    let with_null = json!({"mode": "host", "entries": [], "extra": null, "labels": {}});
    assert_eq!(v.validate_struct(&m.input, &with_null, true), Ok(()));
}

#[test]
fn test_validate_rejects() {
    let v = test_interface();
    let m = v.get_method("Configure").unwrap();

    let bad_enum = json!({"mode": "vm", "entries": [], "labels": {}});
    assert_eq!(v.validate_struct(&m.input, &bad_enum, true), Err("mode".into()));

    let bad_nested = json!({"mode": "host", "entries": [{"key": "a", "count": "one"}], "labels": {}});
    assert_eq!(
        v.validate_struct(&m.input, &bad_nested, true),
        Err("entries[].count".into())
    );

    let missing = json!({"mode": "host", "labels": {}});
    assert_eq!(v.validate_struct(&m.input, &missing, true), Err("entries".into()));

    let bad_map = json!({"mode": "host", "entries": [], "labels": {"x": 3}});
    assert_eq!(
        v.validate_struct(&m.input, &bad_map, true),
        Err("labels[x]".into())
    );

    let not_a_list = json!({"mode": "host", "entries": {"key": "a"}, "labels": {}});
    assert_eq!(
        v.validate_struct(&m.input, &not_a_list, true),
        Err("entries".into())
    );
}

#[test]
fn test_validate_wrong_scalar() {
    let v = test_interface();
    let m = v.get_method("Ping").unwrap();
    assert_eq!(
        v.validate_struct(&m.input, &json!({"ping": 17}), true),
        Err("ping".into())
    );
    assert_eq!(v.validate_struct(&m.input, &json!({"ping": "Test"}), true), Ok(()));
}

#[test]
fn test_validate_strictness() {
    let v = test_interface();
    let m = v.get_method("Ping").unwrap();
    let extra = json!({"ping": "x", "stray": true});
    assert_eq!(v.validate_struct(&m.input, &extra, true), Err("stray".into()));
    assert_eq!(v.validate_struct(&m.input, &extra, false), Ok(()));
}

#[test]
fn test_validate_int_bounds() {
    let v = Interface::from_string("interface a.b\nmethod F(n: int) -> ()").unwrap();
    let m = v.get_method("F").unwrap();
    assert_eq!(
        v.validate_struct(&m.input, &json!({ "n": i64::MAX }), true),
        Ok(())
    );
    assert_eq!(
        v.validate_struct(&m.input, &json!({ "n": i64::MAX as u64 + 1 }), true),
        Err("n".into())
    );
    // fractional numbers are not integers
    assert_eq!(
        v.validate_struct(&m.input, &json!({"n": 1.5}), true),
        Err("n".into())
    );
    // floats take any number
    let v = Interface::from_string("interface a.b\nmethod F(x: float) -> ()").unwrap();
    let m = v.get_method("F").unwrap();
    assert_eq!(v.validate_struct(&m.input, &json!({"x": 1}), true), Ok(()));
    assert_eq!(v.validate_struct(&m.input, &json!({"x": 1.5}), true), Ok(()));
}

#[test]
fn test_validate_absent_parameters() {
    let v = Interface::from_string("interface a.b\nmethod F(n: ?int) -> ()\nmethod G(n: int) -> ()")
        .unwrap();
    let f = v.get_method("F").unwrap();
    let g = v.get_method("G").unwrap();
    assert_eq!(v.validate_struct(&f.input, &serde_json::Value::Null, true), Ok(()));
    assert_eq!(
        v.validate_struct(&g.input, &serde_json::Value::Null, true),
        Err("n".into())
    );
}
