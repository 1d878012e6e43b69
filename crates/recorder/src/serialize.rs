/// Serialization dispatch: lowers an observed argument into a deferred
/// node. The match order is a priority chain; the first branch that
/// recognizes the value wins. Shared values are deduplicated through the
/// graph's identity map before any branch runs, so reference identity in
/// the source graph survives replay.

use std::collections::HashSet;

use log::warn;

use ignition_model::registry::{ClassDef, ClassKind, ClassRegistry};
use ignition_model::types::{primitive, TypeExpr};
use ignition_model::value::{MapKind, ObjectInstance, SetKind, Value};

use crate::error::RecorderError;
use crate::graph::{ContainerFamily, DedupKey, DeferredGraph, InlineValue, NodeId, Plan, Step};
use crate::ir::{family, Constant};
use crate::recorder::Hooks;
use crate::MAX_STRING_BYTES;

pub struct Serializer<'a> {
    pub graph: &'a mut DeferredGraph,
    pub registry: &'a ClassRegistry,
    pub hooks: &'a Hooks,
    /// False switches the identity map to value-equality deduplication
    /// for strings; shared structures always deduplicate by identity.
    pub identity_mode: bool,
    pub static_init: bool,
}

fn declared_of(expected: &TypeExpr) -> Option<TypeExpr> {
    match expected.raw_name() {
        Some(name) if name == primitive::OBJECT => None,
        _ => Some(expected.clone()),
    }
}

fn unsupported(value: &Value, reason: &str) -> RecorderError {
    RecorderError::UnsupportedValue {
        value: value.to_string(),
        ty: value.class_name(),
        reason: reason.to_string(),
    }
}

impl Serializer<'_> {
    /// Lower `value` (declared as `expected`) into a deferred node.
    pub fn serialize(
        &mut self,
        value: &Value,
        expected: &TypeExpr,
        relaxed: bool,
    ) -> Result<NodeId, RecorderError> {
        if let Value::Null = value {
            return self.graph.inline(InlineValue::Null, "null");
        }

        let key = self.dedup_key(value);
        if let Some(k) = &key {
            if let Some(existing) = self.graph.lookup(k) {
                return Ok(existing);
            }
        }

        let id = self.dispatch(value, expected, relaxed, key.clone())?;
        if let Some(k) = key {
            if self.graph.lookup(&k).is_none() {
                self.graph.remember(k, id);
            }
        }
        Ok(id)
    }

    fn dedup_key(&self, value: &Value) -> Option<DedupKey> {
        if !self.identity_mode {
            match value {
                Value::Str(s) => return Some(DedupKey::Text(format!("s:{}", s))),
                Value::Url(u) => return Some(DedupKey::Text(format!("u:{}", u))),
                _ => {}
            }
        }
        value.identity().map(DedupKey::Ptr)
    }

    fn dispatch(
        &mut self,
        value: &Value,
        expected: &TypeExpr,
        relaxed: bool,
        key: Option<DedupKey>,
    ) -> Result<NodeId, RecorderError> {
        // Pluggable loaders come before everything except null and the
        // identity map.
        for (i, loader) in self.hooks.loaders.iter().enumerate() {
            if loader.can_handle(value, self.static_init) {
                let id = self.graph.stored(declared_of(expected), &value.to_string())?;
                self.graph.set_plan(id, Plan::Loader { loader: i, value: value.clone() });
                return Ok(id);
            }
        }

        // Empty and singleton immutable collections inline their factory
        // calls; singletons recurse into their element(s).
        match value {
            Value::List(l) if l.immutable => {
                let elems: Vec<Value> = l.elems.borrow().clone();
                match elems.len() {
                    0 => {
                        return self
                            .graph
                            .inline(InlineValue::EmptyColl { family: family::LIST }, "empty list");
                    }
                    1 => {
                        let id = self.alloc_shared(expected, value, key)?;
                        let elem = self.serialize(&elems[0], &expected.type_arg(0), relaxed)?;
                        self.graph.set_plan(id, Plan::SingletonList { elem });
                        return Ok(id);
                    }
                    _ => {}
                }
            }
            Value::Set(s) if s.immutable => {
                self.check_comparator(s.kind == SetKind::Sorted, s.custom_comparator, value)?;
                let elems: Vec<Value> = s.elems.borrow().clone();
                match elems.len() {
                    0 => {
                        let fam = if s.kind == SetKind::Sorted {
                            family::SORTED_SET
                        } else {
                            family::SET
                        };
                        return self
                            .graph
                            .inline(InlineValue::EmptyColl { family: fam }, "empty set");
                    }
                    1 => {
                        let id = self.alloc_shared(expected, value, key)?;
                        let elem = self.serialize(&elems[0], &expected.type_arg(0), relaxed)?;
                        self.graph.set_plan(id, Plan::SingletonSet { elem });
                        return Ok(id);
                    }
                    _ => {}
                }
            }
            Value::Map(m) if m.immutable => {
                self.check_comparator(m.kind == MapKind::Sorted, m.custom_comparator, value)?;
                let entries: Vec<(Value, Value)> = m.entries.borrow().clone();
                match entries.len() {
                    0 => {
                        let fam = if m.kind == MapKind::Sorted {
                            family::SORTED_MAP
                        } else {
                            family::MAP
                        };
                        return self
                            .graph
                            .inline(InlineValue::EmptyColl { family: fam }, "empty map");
                    }
                    1 => {
                        let id = self.alloc_shared(expected, value, key)?;
                        let k = self.serialize(&entries[0].0, &expected.type_arg(0), relaxed)?;
                        let v = self.serialize(&entries[0].1, &expected.type_arg(1), relaxed)?;
                        self.graph.set_plan(id, Plan::SingletonMap { key: k, value: v });
                        return Ok(id);
                    }
                    _ => {}
                }
            }
            _ => {}
        }

        // A registered substitution for the runtime class or the expected
        // type serializes now and deserializes at startup.
        let sub = self
            .hooks
            .substitutions
            .get(&value.class_name())
            .or_else(|| expected.raw_name().and_then(|n| self.hooks.substitutions.get(n)));
        if let Some(sub) = sub {
            let id = self.alloc_shared(expected, value, key)?;
            let to = sub.provider.serialize(value).map_err(|e| {
                unsupported(value, &format!("substitution provider failed: {}", e))
            })?;
            let serialized = self.serialize(&to, &TypeExpr::raw(&sub.to_class), relaxed)?;
            self.graph.set_plan(
                id,
                Plan::Substituted { provider: sub.provider_name.clone(), serialized },
            );
            return Ok(id);
        }

        match value {
            // Present optionals always reconstruct through the nullable
            // factory: a build-time non-null value may be null at startup
            // when it is backed by a proxy.
            Value::Opt(Some(inner)) => {
                let id = self.alloc_shared(expected, value, key)?;
                let inner = self.serialize(inner, &expected.type_arg(0), relaxed)?;
                self.graph.set_plan(id, Plan::OptionalOf { inner });
                Ok(id)
            }
            Value::Opt(None) => self.graph.inline(InlineValue::OptEmpty, "empty optional"),

            Value::Str(s) => {
                if s.len() > MAX_STRING_BYTES {
                    return Err(RecorderError::StringTooLong { len: s.len() });
                }
                self.graph
                    .inline(InlineValue::Const(Constant::Str(s.to_string())), "string")
            }

            Value::Url(u) => {
                let id = self.graph.stored(Some(TypeExpr::raw("url")), "url")?;
                self.graph.set_plan(id, Plan::ConstFragment { constant: Constant::Url(u.to_string()) });
                Ok(id)
            }

            Value::Enum(e) => {
                if let Some(def) = self.registry.lookup(&e.class) {
                    if !def.has_enum_constant(&e.constant) {
                        return Err(unsupported(value, "unknown enum constant"));
                    }
                }
                self.graph.inline(
                    InlineValue::Const(Constant::Enum {
                        class: e.class.clone(),
                        constant: e.constant.clone(),
                    }),
                    "enum",
                )
            }

            Value::Proxy(p) => self
                .graph
                .inline(InlineValue::ContextLoad { key: p.key.clone() }, "proxy"),

            Value::Duration(d) => {
                let id = self.graph.stored(Some(TypeExpr::raw("duration")), "duration")?;
                self.graph.set_plan(
                    id,
                    Plan::ConstFragment {
                        constant: Constant::Duration { secs: d.as_secs(), nanos: d.subsec_nanos() },
                    },
                );
                Ok(id)
            }

            Value::Type(name) => {
                // A class-name proxy resolves back to the original name it
                // stands in for.
                let resolved = self
                    .hooks
                    .class_proxies
                    .get(name.as_ref())
                    .cloned()
                    .unwrap_or_else(|| name.to_string());
                self.graph
                    .inline(InlineValue::Const(Constant::Type(resolved)), "class reference")
            }

            Value::TypeExpr(t) => {
                self.validate_type_expr(t, value)?;
                let id = self.graph.stored(Some(TypeExpr::raw("type")), "type")?;
                self.graph
                    .set_plan(id, Plan::ConstFragment { constant: Constant::TypeExpr((**t).clone()) });
                Ok(id)
            }

            // Scalars matching their declared primitive type are literals.
            Value::Bool(b) if expected.raw_name() == Some(primitive::BOOL) => {
                self.graph.inline(InlineValue::Const(Constant::Bool(*b)), "bool")
            }
            Value::Int(n) if expected.raw_name() == Some(primitive::INT) => {
                self.graph.inline(InlineValue::Const(Constant::Int(*n)), "int")
            }
            Value::Float(v) if expected.raw_name() == Some(primitive::FLOAT) => {
                self.graph.inline(InlineValue::Const(Constant::Float(*v)), "float")
            }
            Value::Char(c) if expected.raw_name() == Some(primitive::CHAR) => {
                self.graph.inline(InlineValue::Const(Constant::Char(*c)), "char")
            }

            Value::Array(arr) => {
                let id = self.alloc_shared(expected, value, key)?;
                let elem_type = arr.elem_type.clone();
                let elems: Vec<Value> = arr.elems.borrow().clone();
                let mut nodes = Vec::with_capacity(elems.len());
                for e in &elems {
                    nodes.push(self.serialize(e, &elem_type, relaxed)?);
                }
                self.graph.set_plan(id, Plan::NewArray { elem_type, elems: nodes });
                Ok(id)
            }

            Value::Object(obj) => {
                let def = self.registry.lookup(&obj.class).ok_or_else(|| {
                    RecorderError::MissingClassDescriptor {
                        class: obj.class.clone(),
                        context: "recorded object".to_string(),
                    }
                })?;
                match def.kind {
                    ClassKind::Annotation => self.serialize_annotation(obj, def, relaxed, key),
                    ClassKind::Enum => Err(unsupported(value, "enum classes record as constants")),
                    ClassKind::Plain => self.serialize_object(value, obj, def, relaxed, key),
                }
            }

            Value::List(_) | Value::Set(_) | Value::Map(_) => {
                self.serialize_container(value, expected, relaxed, key)
            }

            // Boxed scalars that did not match their declared type share
            // one node per (type, bits), like a boxed-value cache.
            Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Char(_) => {
                self.serialize_boxed_scalar(value)
            }

            Value::Runtime(_) => Err(unsupported(
                value,
                "runtime values reach recorded calls only through their proxies",
            )),
            Value::Recorder(_) => Err(unsupported(value, "recorder instances are not recordable")),
            Value::Null => self.graph.inline(InlineValue::Null, "null"),
        }
    }

    /// Allocate the stored node *before* recursing into children and put
    /// it in the identity map, so self-referential values terminate.
    fn alloc_shared(
        &mut self,
        expected: &TypeExpr,
        value: &Value,
        key: Option<DedupKey>,
    ) -> Result<NodeId, RecorderError> {
        let id = self.graph.stored(declared_of(expected), &value.to_string())?;
        if let Some(k) = key {
            self.graph.remember(k, id);
        }
        Ok(id)
    }

    fn check_comparator(
        &self,
        sorted: bool,
        custom: bool,
        value: &Value,
    ) -> Result<(), RecorderError> {
        if sorted && custom {
            return Err(unsupported(
                value,
                "sorted collections with custom comparators cannot be recorded; \
                 the comparator would be silently replaced by natural ordering",
            ));
        }
        Ok(())
    }

    fn validate_type_expr(&self, t: &TypeExpr, origin: &Value) -> Result<(), RecorderError> {
        match t {
            TypeExpr::Raw(_) => Ok(()),
            TypeExpr::Parameterized { args, .. } => {
                for a in args {
                    self.validate_type_expr(a, origin)?;
                }
                Ok(())
            }
            TypeExpr::ArrayOf(elem) => self.validate_type_expr(elem, origin),
            TypeExpr::Wildcard { upper, lower } => {
                if upper.len() > 1 {
                    return Err(unsupported(origin, "wildcard with multiple upper bounds"));
                }
                if !upper.is_empty() && !lower.is_empty() {
                    return Err(unsupported(origin, "wildcard with both bound kinds"));
                }
                if lower.len() > 1 {
                    return Err(unsupported(origin, "wildcard with multiple lower bounds"));
                }
                for b in upper.iter().chain(lower.iter()) {
                    self.validate_type_expr(b, origin)?;
                }
                Ok(())
            }
        }
    }

    fn serialize_boxed_scalar(&mut self, value: &Value) -> Result<NodeId, RecorderError> {
        let (tag, bits, constant) = match value {
            Value::Bool(b) => (1u8, *b as u64, Constant::Bool(*b)),
            Value::Int(n) => (2, *n as u64, Constant::Int(*n)),
            Value::Float(f) => (3, f.to_bits(), Constant::Float(*f)),
            Value::Char(c) => (4, *c as u64, Constant::Char(*c)),
            other => return Err(unsupported(other, "not a scalar")),
        };
        let key = DedupKey::Scalar { tag, bits };
        if let Some(existing) = self.graph.lookup(&key) {
            return Ok(existing);
        }
        let id = self.graph.stored(None, &value.to_string())?;
        self.graph.set_plan(id, Plan::ConstFragment { constant });
        self.graph.remember(key, id);
        Ok(id)
    }

    /// A collection or map with no dedicated branch replays as a
    /// fallback container plus population steps.
    fn serialize_container(
        &mut self,
        value: &Value,
        expected: &TypeExpr,
        relaxed: bool,
        key: Option<DedupKey>,
    ) -> Result<NodeId, RecorderError> {
        match value {
            Value::List(l) => {
                let id = self.alloc_shared(expected, value, key)?;
                let elems: Vec<Value> = l.elems.borrow().clone();
                let mut steps = Vec::with_capacity(elems.len());
                for e in &elems {
                    let node = self.serialize(e, &expected.type_arg(0), relaxed)?;
                    steps.push(Step::Add { value: node });
                }
                self.graph
                    .set_plan(id, Plan::Container { family: ContainerFamily::List, steps });
                Ok(id)
            }
            Value::Set(s) => {
                self.check_comparator(s.kind == SetKind::Sorted, s.custom_comparator, value)?;
                let fam = if s.kind == SetKind::Sorted {
                    ContainerFamily::SortedSet
                } else {
                    ContainerFamily::LinkedSet
                };
                let id = self.alloc_shared(expected, value, key)?;
                let elems: Vec<Value> = s.elems.borrow().clone();
                let mut steps = Vec::with_capacity(elems.len());
                for e in &elems {
                    let node = self.serialize(e, &expected.type_arg(0), relaxed)?;
                    steps.push(Step::Add { value: node });
                }
                self.graph.set_plan(id, Plan::Container { family: fam, steps });
                Ok(id)
            }
            Value::Map(m) => {
                self.check_comparator(m.kind == MapKind::Sorted, m.custom_comparator, value)?;
                let fam = if m.kind == MapKind::Sorted {
                    ContainerFamily::SortedMap
                } else {
                    ContainerFamily::LinkedMap
                };
                let id = self.alloc_shared(expected, value, key)?;
                let entries: Vec<(Value, Value)> = m.entries.borrow().clone();
                let mut steps = Vec::with_capacity(entries.len());
                for (k, v) in &entries {
                    let kn = self.serialize(k, &expected.type_arg(0), relaxed)?;
                    let vn = self.serialize(v, &expected.type_arg(1), relaxed)?;
                    steps.push(Step::Put { key: kn, value: vn });
                }
                self.graph.set_plan(id, Plan::Container { family: fam, steps });
                Ok(id)
            }
            other => Err(unsupported(other, "not a container")),
        }
    }

    fn serialize_annotation(
        &mut self,
        obj: &ObjectInstance,
        def: &ClassDef,
        relaxed: bool,
        key: Option<DedupKey>,
    ) -> Result<NodeId, RecorderError> {
        let id = self.graph.stored(Some(TypeExpr::raw(&def.name)), &def.name)?;
        if let Some(k) = key {
            self.graph.remember(k, id);
        }
        // Annotation literals construct from their members by name,
        // falling back to declared defaults.
        let mut args = Vec::with_capacity(def.annotation_members.len());
        for member in &def.annotation_members {
            let provided = obj.fields.borrow().get(&member.name).cloned();
            let v = provided.or_else(|| member.default.clone()).ok_or_else(|| {
                RecorderError::UnsupportedValue {
                    value: format!("object({})", def.name),
                    ty: def.name.clone(),
                    reason: format!("annotation member {} has no value and no default", member.name),
                }
            })?;
            args.push(self.serialize(&v, &member.ty, relaxed)?);
        }
        self.graph.set_plan(
            id,
            Plan::Construct { class: def.name.clone(), ctor: 0, args, steps: vec![] },
        );
        Ok(id)
    }

    /// Complex-object serialization: pick a construction strategy, then
    /// append population steps for whatever the constructor left over.
    fn serialize_object(
        &mut self,
        value: &Value,
        obj: &ObjectInstance,
        def: &ClassDef,
        relaxed: bool,
        key: Option<DedupKey>,
    ) -> Result<NodeId, RecorderError> {
        let class = def.name.clone();
        let id = self.graph.stored(Some(TypeExpr::raw(&class)), &class)?;
        if let Some(k) = key {
            self.graph.remember(k, id);
        }

        let mut consumed: HashSet<String> = HashSet::new();

        let plan = if let Some(registered) = self.hooks.non_default_ctors.get(&class) {
            let ctor = def.ctors.get(registered.ctor).ok_or_else(|| {
                RecorderError::UnsupportedValue {
                    value: format!("object({})", class),
                    ty: class.clone(),
                    reason: format!("registered constructor #{} does not exist", registered.ctor),
                }
            })?;
            let values = (registered.extractor)(value);
            if values.len() != ctor.params.len() {
                return Err(RecorderError::UnsupportedValue {
                    value: format!("object({})", class),
                    ty: class.clone(),
                    reason: format!(
                        "parameter extractor produced {} value(s) for a {}-parameter constructor",
                        values.len(),
                        ctor.params.len()
                    ),
                });
            }
            let mut args = Vec::with_capacity(values.len());
            for (p, v) in ctor.params.iter().zip(values.iter()) {
                args.push(self.serialize(v, &p.ty, relaxed)?);
                if let Some(name) = &p.name {
                    consumed.insert(name.clone());
                }
            }
            let steps = self.population_steps(obj, def, &consumed, relaxed)?;
            Plan::Construct { class: class.clone(), ctor: registered.ctor, args, steps }
        } else if let Some(ctor_idx) = self.select_ctor(def)? {
            let args = self.ctor_args_by_name(obj, def, ctor_idx, relaxed, &mut consumed)?;
            let steps = self.population_steps(obj, def, &consumed, relaxed)?;
            Plan::Construct { class: class.clone(), ctor: ctor_idx, args, steps }
        } else if def.has_no_arg_ctor() {
            let steps = self.population_steps(obj, def, &consumed, relaxed)?;
            Plan::ConstructNoArg { class: class.clone(), steps }
        } else {
            return Err(RecorderError::UnsupportedValue {
                value: format!("object({})", class),
                ty: class,
                reason: "no viable construction strategy".to_string(),
            });
        };

        self.graph.set_plan(id, plan);
        Ok(id)
    }

    /// Constructor choice when no non-default constructor is registered:
    /// a class marked constructor-recordable takes its unique widest
    /// public constructor; a class with exactly one public constructor
    /// uses it; otherwise a constructor marked recordable wins.
    fn select_ctor(&self, def: &ClassDef) -> Result<Option<usize>, RecorderError> {
        if self.hooks.ctor_recordable.contains(&def.name) {
            let widest = def.public_ctors().map(|(_, c)| c.params.len()).max();
            if let Some(width) = widest {
                let candidates: Vec<usize> = def
                    .public_ctors()
                    .filter(|(_, c)| c.params.len() == width)
                    .map(|(i, _)| i)
                    .collect();
                if candidates.len() > 1 {
                    return Err(RecorderError::AmbiguousConstructor {
                        class: def.name.clone(),
                        count: candidates.len(),
                    });
                }
                return Ok(candidates.first().copied());
            }
            return Ok(None);
        }

        let publics: Vec<usize> = def.public_ctors().map(|(i, _)| i).collect();
        if publics.len() == 1 {
            return Ok(Some(publics[0]));
        }
        if let Some((i, _)) = def.public_ctors().find(|(_, c)| c.recordable) {
            return Ok(Some(i));
        }
        Ok(None)
    }

    /// Name-based parameter matching: each constructor parameter must
    /// name a readable property or public field, whose current value
    /// becomes the argument.
    fn ctor_args_by_name(
        &mut self,
        obj: &ObjectInstance,
        def: &ClassDef,
        ctor_idx: usize,
        relaxed: bool,
        consumed: &mut HashSet<String>,
    ) -> Result<Vec<NodeId>, RecorderError> {
        let params = def.ctors[ctor_idx].params.clone();
        let mut args = Vec::with_capacity(params.len());
        let mut unmatched: Vec<String> = vec![];
        for (i, p) in params.iter().enumerate() {
            let name = p.name.as_ref().ok_or_else(|| RecorderError::MissingParameterNames {
                class: def.name.clone(),
                index: i,
            })?;
            let readable =
                def.property(name).map(|pr| pr.has_getter && !pr.ignored).unwrap_or(false);
            let has_field =
                def.field(name).map(|f| f.public && !f.static_field).unwrap_or(false);
            if readable || has_field {
                let v = obj.get(name);
                args.push(self.serialize(&v, &p.ty, relaxed)?);
                consumed.insert(name.clone());
            } else {
                unmatched.push(name.clone());
            }
        }
        if !unmatched.is_empty() {
            return Err(RecorderError::UnusedConstructorParameter {
                class: def.name.clone(),
                params: unmatched.join(", "),
            });
        }
        Ok(args)
    }

    /// Steps that run after construction: setters for writable
    /// properties, container population for getter-only collections,
    /// then direct field writes in name order.
    fn population_steps(
        &mut self,
        obj: &ObjectInstance,
        def: &ClassDef,
        consumed: &HashSet<String>,
        relaxed: bool,
    ) -> Result<Vec<Step>, RecorderError> {
        let mut steps = vec![];

        for prop in &def.properties {
            if consumed.contains(&prop.name) || prop.ignored || !prop.has_getter {
                continue;
            }
            let current = obj.get(&prop.name);

            if prop.has_setter {
                if let Some(setter_ty) = &prop.setter_type {
                    if setter_ty != &prop.ty {
                        if !relaxed {
                            return Err(RecorderError::PropertyInconsistency {
                                class: def.name.clone(),
                                property: prop.name.clone(),
                                reason: "getter and setter disagree on the property type"
                                    .to_string(),
                            });
                        }
                        let fits = prop
                            .setter_overloads
                            .iter()
                            .any(|o| ignition_model::types::assignable(o, &prop.ty));
                        if !fits {
                            return Err(RecorderError::PropertyInconsistency {
                                class: def.name.clone(),
                                property: prop.name.clone(),
                                reason: format!(
                                    "no setter overload accepts the declared type {}",
                                    prop.ty
                                ),
                            });
                        }
                        warn!(
                            "property {}.{}: using a setter overload to bridge a type mismatch",
                            def.name, prop.name
                        );
                    }
                }
                let node = self.serialize(&current, &prop.ty, relaxed)?;
                steps.push(Step::SetProp { name: prop.name.clone(), value: node });
                continue;
            }

            // Getter without setter.
            match &current {
                Value::List(l) => {
                    let elems: Vec<Value> = l.elems.borrow().clone();
                    let mut nodes = Vec::with_capacity(elems.len());
                    for e in &elems {
                        nodes.push(self.serialize(e, &prop.ty.type_arg(0), relaxed)?);
                    }
                    steps.push(Step::AddToExisting { property: prop.name.clone(), values: nodes });
                }
                Value::Set(s) => {
                    let elems: Vec<Value> = s.elems.borrow().clone();
                    let mut nodes = Vec::with_capacity(elems.len());
                    for e in &elems {
                        nodes.push(self.serialize(e, &prop.ty.type_arg(0), relaxed)?);
                    }
                    steps.push(Step::AddToExisting { property: prop.name.clone(), values: nodes });
                }
                Value::Map(m) => {
                    let entries: Vec<(Value, Value)> = m.entries.borrow().clone();
                    let mut nodes = Vec::with_capacity(entries.len());
                    for (k, v) in &entries {
                        let kn = self.serialize(k, &prop.ty.type_arg(0), relaxed)?;
                        let vn = self.serialize(v, &prop.ty.type_arg(1), relaxed)?;
                        nodes.push((kn, vn));
                    }
                    steps.push(Step::PutToExisting { property: prop.name.clone(), entries: nodes });
                }
                _ => {
                    // A read-only non-collection property is restorable
                    // only through its constructor; with a backing field
                    // present that silently loses state.
                    if prop.backing_field && !relaxed {
                        return Err(RecorderError::PropertyInconsistency {
                            class: def.name.clone(),
                            property: prop.name.clone(),
                            reason: "read-only property with a backing field cannot be restored"
                                .to_string(),
                        });
                    }
                }
            }
        }

        let mut field_names: Vec<&str> = def
            .fields
            .iter()
            .filter(|f| f.public && !f.final_field && !f.static_field && !f.transient)
            .filter(|f| !consumed.contains(&f.name))
            .filter(|f| def.property(&f.name).is_none())
            .map(|f| f.name.as_str())
            .collect();
        // Deterministic output: fields write in name order.
        field_names.sort_unstable();
        for name in field_names {
            let field = match def.field(name) {
                Some(f) => f,
                None => continue,
            };
            let current = obj.get(name);
            let node = self.serialize(&current, &field.ty, relaxed)?;
            steps.push(Step::SetField { name: name.to_string(), value: node });
        }

        Ok(steps)
    }

    /// A recorder instance is itself a deferred value: single accessible
    /// (or injection-marked) constructor, injected parameters resolved
    /// from the constant registry.
    pub fn serialize_recorder(&mut self, class: &str) -> Result<NodeId, RecorderError> {
        let def = self.registry.lookup(class).ok_or_else(|| {
            RecorderError::MissingClassDescriptor {
                class: class.to_string(),
                context: "recorder class".to_string(),
            }
        })?;

        let injectable: Vec<usize> =
            def.ctors.iter().enumerate().filter(|(_, c)| c.injectable).map(|(i, _)| i).collect();
        let ctor_idx = match injectable.len() {
            1 => injectable[0],
            0 => {
                if def.ctors.is_empty() {
                    // An unlisted constructor is the implicit no-arg one.
                    usize::MAX
                } else if def.ctors.len() == 1 {
                    0
                } else {
                    return Err(RecorderError::UnsupportedValue {
                        value: format!("recorder({})", class),
                        ty: class.to_string(),
                        reason: "recorder classes need a single accessible constructor \
                                 or exactly one marked for injection"
                            .to_string(),
                    });
                }
            }
            n => {
                return Err(RecorderError::UnsupportedValue {
                    value: format!("recorder({})", class),
                    ty: class.to_string(),
                    reason: format!("{} constructors are marked for injection", n),
                });
            }
        };

        let params = if ctor_idx == usize::MAX {
            vec![]
        } else {
            def.ctors[ctor_idx].params.clone()
        };
        let mut args = Vec::with_capacity(params.len());
        for (i, p) in params.iter().enumerate() {
            let ty_name = p.ty.raw_name().unwrap_or(primitive::OBJECT);
            let constant = self.hooks.constants.get(ty_name).cloned().ok_or_else(|| {
                RecorderError::LoaderAbsent {
                    class: class.to_string(),
                    param: p.name.clone().unwrap_or_else(|| format!("#{} ({})", i, p.ty)),
                }
            })?;
            args.push(self.serialize(&constant, &p.ty, false)?);
        }

        let id = self
            .graph
            .stored(Some(TypeExpr::raw(class)), &format!("recorder({})", class))?;
        self.graph
            .set_plan(id, Plan::Recorder { class: class.to_string(), args });
        Ok(id)
    }
}
