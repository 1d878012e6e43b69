/// Class descriptors and the registry holding them.
///
/// The registry is the stand-in for runtime reflection: user code
/// registers, per class, what a reflective runtime would discover —
/// constructors with parameter names, bean-style properties, public
/// fields, enum constants, annotation members, finality. Both phases use
/// it: the recorder to pick construction strategies, the startup
/// interpreter to actually build instances.

use indexmap::IndexMap;

use crate::types::{MethodDescriptor, TypeExpr};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Plain,
    Enum,
    Annotation,
}

/// One constructor parameter. A `None` name models absent parameter-name
/// metadata, which is a build error wherever names are required.
#[derive(Debug, Clone)]
pub struct CtorParam {
    pub name: Option<String>,
    pub ty: TypeExpr,
}

impl CtorParam {
    pub fn named(name: &str, ty: TypeExpr) -> CtorParam {
        CtorParam { name: Some(name.to_string()), ty }
    }

    pub fn unnamed(ty: TypeExpr) -> CtorParam {
        CtorParam { name: None, ty }
    }
}

#[derive(Debug, Clone)]
pub struct CtorDef {
    pub public: bool,
    /// Marked as the constructor to use when recording this class.
    pub recordable: bool,
    /// Marked for injection; relevant to recorder classes only.
    pub injectable: bool,
    pub params: Vec<CtorParam>,
}

impl CtorDef {
    pub fn no_arg() -> CtorDef {
        CtorDef { public: true, recordable: false, injectable: false, params: vec![] }
    }

    pub fn of(params: Vec<CtorParam>) -> CtorDef {
        CtorDef { public: true, recordable: false, injectable: false, params }
    }
}

/// A bean-style property as seen through its accessors.
#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub name: String,
    /// The getter's declared type.
    pub ty: TypeExpr,
    pub has_getter: bool,
    pub has_setter: bool,
    /// The setter's parameter type, when it differs from the getter's.
    pub setter_type: Option<TypeExpr>,
    /// Additional setter overloads, by first-parameter type.
    pub setter_overloads: Vec<TypeExpr>,
    /// The getter is marked ignored.
    pub ignored: bool,
    /// A same-named backing field exists on the class.
    pub backing_field: bool,
}

impl PropertyDef {
    pub fn read_write(name: &str, ty: TypeExpr) -> PropertyDef {
        PropertyDef {
            name: name.to_string(),
            ty,
            has_getter: true,
            has_setter: true,
            setter_type: None,
            setter_overloads: vec![],
            ignored: false,
            backing_field: true,
        }
    }

    pub fn read_only(name: &str, ty: TypeExpr) -> PropertyDef {
        PropertyDef {
            name: name.to_string(),
            ty,
            has_getter: true,
            has_setter: false,
            setter_type: None,
            setter_overloads: vec![],
            ignored: false,
            backing_field: false,
        }
    }

    /// The type the setter actually takes.
    pub fn effective_setter_type(&self) -> &TypeExpr {
        self.setter_type.as_ref().unwrap_or(&self.ty)
    }
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub ty: TypeExpr,
    pub public: bool,
    pub final_field: bool,
    pub static_field: bool,
    /// Transient or explicitly marked ignored.
    pub transient: bool,
}

impl FieldDef {
    pub fn public(name: &str, ty: TypeExpr) -> FieldDef {
        FieldDef {
            name: name.to_string(),
            ty,
            public: true,
            final_field: false,
            static_field: false,
            transient: false,
        }
    }
}

/// One member of an annotation class: name, type, optional default.
#[derive(Debug, Clone)]
pub struct AnnotationMember {
    pub name: String,
    pub ty: TypeExpr,
    pub default: Option<Value>,
}

#[derive(Debug)]
pub struct ClassDef {
    pub name: String,
    pub kind: ClassKind,
    pub final_class: bool,
    /// Interfaces and abstract classes cannot be constructed directly.
    pub interface: bool,
    pub ctors: Vec<CtorDef>,
    pub properties: Vec<PropertyDef>,
    pub fields: Vec<FieldDef>,
    /// Recordable methods; populated for recorder classes.
    pub methods: Vec<MethodDescriptor>,
    pub enum_constants: Vec<String>,
    pub annotation_members: Vec<AnnotationMember>,
}

impl ClassDef {
    pub fn new(name: &str) -> ClassDef {
        ClassDef {
            name: name.to_string(),
            kind: ClassKind::Plain,
            final_class: false,
            interface: false,
            ctors: vec![],
            properties: vec![],
            fields: vec![],
            methods: vec![],
            enum_constants: vec![],
            annotation_members: vec![],
        }
    }

    pub fn an_enum(name: &str, constants: &[&str]) -> ClassDef {
        let mut def = ClassDef::new(name);
        def.kind = ClassKind::Enum;
        def.final_class = true;
        def.enum_constants = constants.iter().map(|c| c.to_string()).collect();
        def
    }

    pub fn annotation(name: &str, members: Vec<AnnotationMember>) -> ClassDef {
        let mut def = ClassDef::new(name);
        def.kind = ClassKind::Annotation;
        def.annotation_members = members;
        def
    }

    pub fn has_no_arg_ctor(&self) -> bool {
        self.ctors.iter().any(|c| c.public && c.params.is_empty())
    }

    pub fn public_ctors(&self) -> impl Iterator<Item = (usize, &CtorDef)> {
        self.ctors.iter().enumerate().filter(|(_, c)| c.public)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn has_enum_constant(&self, constant: &str) -> bool {
        self.enum_constants.iter().any(|c| c == constant)
    }
}

/// Name-keyed class descriptors, in registration order.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: IndexMap<String, ClassDef>,
}

impl ClassRegistry {
    pub fn new() -> ClassRegistry {
        ClassRegistry { classes: IndexMap::new() }
    }

    pub fn register(&mut self, def: ClassDef) {
        self.classes.insert(def.name.clone(), def);
    }

    pub fn lookup(&self, name: &str) -> Option<&ClassDef> {
        self.classes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut reg = ClassRegistry::new();
        let mut def = ClassDef::new("com.example.Person");
        def.ctors.push(CtorDef::of(vec![
            CtorParam::named("name", TypeExpr::raw("string")),
            CtorParam::named("age", TypeExpr::raw("int")),
        ]));
        reg.register(def);

        let found = reg.lookup("com.example.Person").unwrap();
        assert_eq!(found.ctors.len(), 1);
        assert!(!found.has_no_arg_ctor());
    }

    #[test]
    fn test_enum_constants() {
        let def = ClassDef::an_enum("com.example.Color", &["RED", "GREEN"]);
        assert!(def.has_enum_constant("RED"));
        assert!(!def.has_enum_constant("BLUE"));
        assert_eq!(def.kind, ClassKind::Enum);
    }
}
