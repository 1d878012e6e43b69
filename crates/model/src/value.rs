/// The in-memory value model.
///
/// Arguments observed during recording and values reconstructed at startup
/// are all `Value`s. Sharing and cycles are expressed through `Rc`: two
/// arguments are "the same object" exactly when they hold the same `Rc`,
/// which is what the recorder's identity map keys on.

use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::types::TypeExpr;
use crate::RecorderDispatch;

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Str(Rc<str>),
    Duration(Duration),
    /// Absolute URL kept as its external text form.
    Url(Rc<str>),
    /// Optional analog. A present value boxes its content; no identity.
    Opt(Option<Box<Value>>),
    Enum(Rc<EnumValue>),
    /// A class reference by name.
    Type(Rc<str>),
    /// A reflective type expression.
    TypeExpr(Rc<TypeExpr>),
    List(Rc<ListValue>),
    Set(Rc<SetValue>),
    Map(Rc<MapValue>),
    Array(Rc<ArrayValue>),
    Object(Rc<ObjectInstance>),
    /// Stand-in for a value a recorded call will produce at startup.
    Proxy(Rc<ProxyHandle>),
    /// The runtime-value container.
    Runtime(Rc<RuntimeValue>),
    /// A live recorder instance; only exists while a startup program runs.
    Recorder(Rc<RecorderInstance>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumValue {
    pub class: String,
    pub constant: String,
}

#[derive(Debug)]
pub struct ListValue {
    /// True for the `List.of` / empty-list / singleton-list family.
    pub immutable: bool,
    pub elems: RefCell<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetKind {
    Hash,
    /// Insertion-ordered.
    Linked,
    Sorted,
}

#[derive(Debug)]
pub struct SetValue {
    pub kind: SetKind,
    pub immutable: bool,
    /// A sorted set built with a custom comparator cannot be recorded.
    pub custom_comparator: bool,
    pub elems: RefCell<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Hash,
    /// Insertion-ordered.
    Linked,
    Sorted,
}

#[derive(Debug)]
pub struct MapValue {
    pub kind: MapKind,
    pub immutable: bool,
    pub custom_comparator: bool,
    /// Entries in iteration order.
    pub entries: RefCell<Vec<(Value, Value)>>,
}

#[derive(Debug)]
pub struct ArrayValue {
    pub elem_type: TypeExpr,
    pub elems: RefCell<Vec<Value>>,
}

/// An instance of a registered class: its name plus the current
/// property/field values, in the order they were assigned.
#[derive(Debug)]
pub struct ObjectInstance {
    pub class: String,
    pub fields: RefCell<IndexMap<String, Value>>,
}

impl ObjectInstance {
    pub fn new(class: &str) -> ObjectInstance {
        ObjectInstance { class: class.to_string(), fields: RefCell::new(IndexMap::new()) }
    }

    pub fn with_fields(class: &str, fields: Vec<(&str, Value)>) -> ObjectInstance {
        let map = fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        ObjectInstance { class: class.to_string(), fields: RefCell::new(map) }
    }

    pub fn get(&self, name: &str) -> Value {
        self.fields.borrow().get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn set(&self, name: &str, value: Value) {
        self.fields.borrow_mut().insert(name.to_string(), value);
    }
}

/// Identity of a not-yet-existing value produced by a recorded call,
/// published into the startup context under `key` when the program runs.
#[derive(Debug)]
pub struct ProxyHandle {
    pub key: String,
    /// True when minted by a static-init recorder.
    pub static_init: bool,
    pub result_type: TypeExpr,
}

impl fmt::Display for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Accidental logging of a proxy must never look like a real value.
        write!(f, "ignition$$ReturnedProxy${}", self.key)
    }
}

/// The runtime-value container: holds the object a startup instruction
/// constructed, so later recorded calls can receive it.
#[derive(Debug)]
pub struct RuntimeValue {
    value: RefCell<Value>,
}

impl RuntimeValue {
    pub fn new(value: Value) -> RuntimeValue {
        RuntimeValue { value: RefCell::new(value) }
    }

    pub fn get(&self) -> Value {
        self.value.borrow().clone()
    }

    pub fn set(&self, value: Value) {
        *self.value.borrow_mut() = value;
    }
}

/// A live recorder plus the class it was constructed for.
pub struct RecorderInstance {
    pub class: String,
    pub dispatch: RefCell<Box<dyn RecorderDispatch>>,
}

impl RecorderInstance {
    pub fn new(class: &str, dispatch: Box<dyn RecorderDispatch>) -> RecorderInstance {
        RecorderInstance { class: class.to_string(), dispatch: RefCell::new(dispatch) }
    }
}

impl fmt::Debug for RecorderInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecorderInstance({})", self.class)
    }
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Rc::from(s))
    }

    pub fn url(s: &str) -> Value {
        Value::Url(Rc::from(s))
    }

    pub fn enum_const(class: &str, constant: &str) -> Value {
        Value::Enum(Rc::new(EnumValue { class: class.to_string(), constant: constant.to_string() }))
    }

    pub fn class_ref(name: &str) -> Value {
        Value::Type(Rc::from(name))
    }

    pub fn type_expr(expr: TypeExpr) -> Value {
        Value::TypeExpr(Rc::new(expr))
    }

    pub fn some(inner: Value) -> Value {
        Value::Opt(Some(Box::new(inner)))
    }

    pub fn none() -> Value {
        Value::Opt(None)
    }

    /// A plain mutable list.
    pub fn list(elems: Vec<Value>) -> Value {
        Value::List(Rc::new(ListValue { immutable: false, elems: RefCell::new(elems) }))
    }

    /// The `List.of` family: immutable, any length.
    pub fn immutable_list(elems: Vec<Value>) -> Value {
        Value::List(Rc::new(ListValue { immutable: true, elems: RefCell::new(elems) }))
    }

    pub fn set(kind: SetKind, elems: Vec<Value>) -> Value {
        Value::Set(Rc::new(SetValue {
            kind,
            immutable: false,
            custom_comparator: false,
            elems: RefCell::new(elems),
        }))
    }

    pub fn immutable_set(kind: SetKind, elems: Vec<Value>) -> Value {
        Value::Set(Rc::new(SetValue {
            kind,
            immutable: true,
            custom_comparator: false,
            elems: RefCell::new(elems),
        }))
    }

    pub fn map(kind: MapKind, entries: Vec<(Value, Value)>) -> Value {
        Value::Map(Rc::new(MapValue {
            kind,
            immutable: false,
            custom_comparator: false,
            entries: RefCell::new(entries),
        }))
    }

    pub fn immutable_map(kind: MapKind, entries: Vec<(Value, Value)>) -> Value {
        Value::Map(Rc::new(MapValue {
            kind,
            immutable: true,
            custom_comparator: false,
            entries: RefCell::new(entries),
        }))
    }

    pub fn array(elem_type: TypeExpr, elems: Vec<Value>) -> Value {
        Value::Array(Rc::new(ArrayValue { elem_type, elems: RefCell::new(elems) }))
    }

    pub fn object(instance: ObjectInstance) -> Value {
        Value::Object(Rc::new(instance))
    }

    /// Pointer identity for shared values; `None` for unshared scalars.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::Str(rc) => Some(Rc::as_ptr(rc) as *const u8 as usize),
            Value::Url(rc) => Some(Rc::as_ptr(rc) as *const u8 as usize),
            Value::Type(rc) => Some(Rc::as_ptr(rc) as *const u8 as usize),
            Value::Enum(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::TypeExpr(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::List(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Set(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Map(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Array(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Object(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Proxy(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Runtime(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Recorder(rc) => Some(Rc::as_ptr(rc) as usize),
            _ => None,
        }
    }

    /// The runtime class name, as the serialization dispatch and error
    /// messages see it.
    pub fn class_name(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Int(_) => "int".to_string(),
            Value::Float(_) => "float".to_string(),
            Value::Char(_) => "char".to_string(),
            Value::Str(_) => "string".to_string(),
            Value::Duration(_) => "duration".to_string(),
            Value::Url(_) => "url".to_string(),
            Value::Opt(_) => "optional".to_string(),
            Value::Enum(e) => e.class.clone(),
            Value::Type(_) => "class".to_string(),
            Value::TypeExpr(_) => "type".to_string(),
            Value::List(_) => "list".to_string(),
            Value::Set(_) => "set".to_string(),
            Value::Map(_) => "map".to_string(),
            Value::Array(_) => "array".to_string(),
            Value::Object(o) => o.class.clone(),
            Value::Proxy(_) => "proxy".to_string(),
            Value::Runtime(_) => crate::RUNTIME_VALUE_CLASS.to_string(),
            Value::Recorder(r) => r.class.clone(),
        }
    }
}

/// Deep structural equality. Shared sub-values are compared by content;
/// proxies and recorders by identity. Not safe on cyclic graphs.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Duration(a), Value::Duration(b)) => a == b,
            (Value::Url(a), Value::Url(b)) => a == b,
            (Value::Opt(a), Value::Opt(b)) => a == b,
            (Value::Enum(a), Value::Enum(b)) => a == b,
            (Value::Type(a), Value::Type(b)) => a == b,
            (Value::TypeExpr(a), Value::TypeExpr(b)) => a == b,
            (Value::List(a), Value::List(b)) => *a.elems.borrow() == *b.elems.borrow(),
            (Value::Set(a), Value::Set(b)) => {
                a.kind == b.kind && *a.elems.borrow() == *b.elems.borrow()
            }
            (Value::Map(a), Value::Map(b)) => {
                a.kind == b.kind && *a.entries.borrow() == *b.entries.borrow()
            }
            (Value::Array(a), Value::Array(b)) => *a.elems.borrow() == *b.elems.borrow(),
            (Value::Object(a), Value::Object(b)) => {
                a.class == b.class && *a.fields.borrow() == *b.fields.borrow()
            }
            (Value::Proxy(a), Value::Proxy(b)) => Rc::ptr_eq(a, b),
            (Value::Runtime(a), Value::Runtime(b)) => {
                Rc::ptr_eq(a, b) || a.get() == b.get()
            }
            (Value::Recorder(a), Value::Recorder(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Shallow rendering for logs and error messages. Containers and objects
/// are summarized, never walked, so cyclic values print safely.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(v) => write!(f, "{}", v),
            Value::Char(c) => write!(f, "'{}'", c),
            Value::Str(s) => write!(f, "\"{}\"", s),
            Value::Duration(d) => write!(f, "{:?}", d),
            Value::Url(u) => write!(f, "url({})", u),
            Value::Opt(Some(_)) => write!(f, "optional(present)"),
            Value::Opt(None) => write!(f, "optional(empty)"),
            Value::Enum(e) => write!(f, "{}.{}", e.class, e.constant),
            Value::Type(name) => write!(f, "class {}", name),
            Value::TypeExpr(t) => write!(f, "type {}", t),
            Value::List(l) => write!(f, "list(len={})", l.elems.borrow().len()),
            Value::Set(s) => write!(f, "set(len={})", s.elems.borrow().len()),
            Value::Map(m) => write!(f, "map(len={})", m.entries.borrow().len()),
            Value::Array(a) => write!(f, "array(len={})", a.elems.borrow().len()),
            Value::Object(o) => write!(f, "object({})", o.class),
            Value::Proxy(p) => write!(f, "{}", p),
            Value::Runtime(_) => write!(f, "runtime-value"),
            Value::Recorder(r) => write!(f, "recorder({})", r.class),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_follows_sharing() {
        let shared = Value::list(vec![Value::Int(1)]);
        let again = shared.clone();
        assert_eq!(shared.identity(), again.identity());

        let other = Value::list(vec![Value::Int(1)]);
        assert_ne!(shared.identity(), other.identity());
        // Structurally they are still equal.
        assert_eq!(shared, other);
    }

    #[test]
    fn test_scalars_have_no_identity() {
        assert_eq!(Value::Int(7).identity(), None);
        assert_eq!(Value::Null.identity(), None);
    }

    #[test]
    fn test_object_field_access() {
        let obj = ObjectInstance::with_fields("com.example.Person", vec![
            ("name", Value::str("A")),
            ("age", Value::Int(3)),
        ]);
        assert_eq!(obj.get("name"), Value::str("A"));
        assert_eq!(obj.get("missing"), Value::Null);
    }

    #[test]
    fn test_proxy_display_is_opaque() {
        let p = ProxyHandle {
            key: "k1".to_string(),
            static_init: false,
            result_type: TypeExpr::object(),
        };
        assert_eq!(p.to_string(), "ignition$$ReturnedProxy$k1");
    }
}
