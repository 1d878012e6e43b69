/// Type names, type expressions, and method descriptors.
///
/// Type metadata is explicit in Ignition: whatever a reflective runtime
/// would discover about a class is registered up front (see `registry`),
/// and values carry their declared types as `TypeExpr` trees.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Built-in primitive type names. Everything else is a class name.
pub mod primitive {
    pub const BOOL: &str = "bool";
    pub const INT: &str = "int";
    pub const FLOAT: &str = "float";
    pub const CHAR: &str = "char";
    pub const STRING: &str = "string";
    pub const VOID: &str = "void";
    /// The top type: any value is assignable to it.
    pub const OBJECT: &str = "object";
}

/// True for the non-class scalar names (`string` and `object` are not
/// primitives: strings are proper values, `object` is the top type).
pub fn is_primitive(name: &str) -> bool {
    matches!(
        name,
        primitive::BOOL | primitive::INT | primitive::FLOAT | primitive::CHAR
    )
}

/// A declared type: raw class, parameterized class, array, or wildcard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeExpr {
    Raw(String),
    Parameterized { raw: String, args: Vec<TypeExpr> },
    ArrayOf(Box<TypeExpr>),
    /// `upper` are extends-bounds, `lower` are super-bounds. At most one
    /// of each is supported; more than one upper bound is a build error
    /// at serialization time.
    Wildcard { upper: Vec<TypeExpr>, lower: Vec<TypeExpr> },
}

impl TypeExpr {
    pub fn raw(name: &str) -> TypeExpr {
        TypeExpr::Raw(name.to_string())
    }

    pub fn object() -> TypeExpr {
        TypeExpr::Raw(primitive::OBJECT.to_string())
    }

    pub fn void() -> TypeExpr {
        TypeExpr::Raw(primitive::VOID.to_string())
    }

    pub fn parameterized(raw: &str, args: Vec<TypeExpr>) -> TypeExpr {
        TypeExpr::Parameterized { raw: raw.to_string(), args }
    }

    /// The erased class name, if this type has one.
    pub fn raw_name(&self) -> Option<&str> {
        match self {
            TypeExpr::Raw(name) => Some(name),
            TypeExpr::Parameterized { raw, .. } => Some(raw),
            TypeExpr::ArrayOf(_) | TypeExpr::Wildcard { .. } => None,
        }
    }

    pub fn is_void(&self) -> bool {
        self.raw_name() == Some(primitive::VOID)
    }

    pub fn is_primitive(&self) -> bool {
        self.raw_name().is_some_and(is_primitive)
    }

    /// The declared type argument at `idx`, or the top type when this
    /// expression carries no usable argument there.
    pub fn type_arg(&self, idx: usize) -> TypeExpr {
        match self {
            TypeExpr::Parameterized { args, .. } => {
                args.get(idx).cloned().unwrap_or_else(TypeExpr::object)
            }
            _ => TypeExpr::object(),
        }
    }

    /// The element type for array expressions, top type otherwise.
    pub fn element_type(&self) -> TypeExpr {
        match self {
            TypeExpr::ArrayOf(elem) => (**elem).clone(),
            _ => TypeExpr::object(),
        }
    }
}

/// Loose assignability on erasures: the top type accepts everything,
/// otherwise raw names must agree. Parameter lists are erased.
pub fn assignable(expected: &TypeExpr, actual: &TypeExpr) -> bool {
    match expected.raw_name() {
        Some(name) if name == primitive::OBJECT => true,
        Some(name) => actual.raw_name() == Some(name),
        None => expected == actual,
    }
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeExpr::Raw(name) => write!(f, "{}", name),
            TypeExpr::Parameterized { raw, args } => {
                write!(f, "{}<", raw)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ">")
            }
            TypeExpr::ArrayOf(elem) => write!(f, "{}[]", elem),
            TypeExpr::Wildcard { upper, lower } => {
                write!(f, "?")?;
                if let Some(u) = upper.first() {
                    write!(f, " extends {}", u)?;
                }
                if let Some(l) = lower.first() {
                    write!(f, " super {}", l)?;
                }
                Ok(())
            }
        }
    }
}

/// One declared parameter of a recorder method.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub ty: TypeExpr,
    /// Relaxes the property/field consistency checks for values recorded
    /// through this parameter.
    pub relaxed: bool,
}

impl ParamSpec {
    pub fn of(ty: TypeExpr) -> ParamSpec {
        ParamSpec { ty, relaxed: false }
    }

    pub fn relaxed(ty: TypeExpr) -> ParamSpec {
        ParamSpec { ty, relaxed: true }
    }
}

/// Stable identity of a recordable method: declaring class, name,
/// parameter types, return type.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDescriptor {
    pub owner: String,
    pub name: String,
    pub params: Vec<ParamSpec>,
    pub ret: TypeExpr,
}

impl MethodDescriptor {
    pub fn new(owner: &str, name: &str, params: Vec<ParamSpec>, ret: TypeExpr) -> Self {
        Self { owner: owner.to_string(), name: name.to_string(), params, ret }
    }

    pub fn returns_void(&self) -> bool {
        self.ret.is_void()
    }

    /// `Owner.name`, as error messages and logs render it.
    pub fn id(&self) -> String {
        format!("{}.{}", self.owner, self.name)
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}(", self.owner, self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p.ty)?;
        }
        write!(f, ")")
    }
}
