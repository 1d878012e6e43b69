/// Startup interpreter: replays an emitted program against live
/// recorder instances, register by register.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use log::debug;
use url::Url;

use ignition_model::registry::ClassKind;
use ignition_model::types::{is_primitive, primitive};
use ignition_model::value::{
    MapKind, ObjectInstance, RecorderInstance, RuntimeValue, SetKind, Value,
};
use ignition_recorder::ir::{
    container, family, Constant, Opcode, StartupMethod, StartupProgram, ARRAY_REG, NO_TYPE,
};

use crate::context::StartupContext;

/// The emitted artifact's contract: run the recorded program against a
/// startup context.
pub trait StartupTask {
    fn deploy(&self, ctx: &mut StartupContext) -> Result<(), String>;
}

/// A startup task backed by the interpreter.
pub struct ProgramTask {
    program: StartupProgram,
}

impl ProgramTask {
    pub fn new(program: StartupProgram) -> ProgramTask {
        ProgramTask { program }
    }

    pub fn program(&self) -> &StartupProgram {
        &self.program
    }
}

impl StartupTask for ProgramTask {
    fn deploy(&self, ctx: &mut StartupContext) -> Result<(), String> {
        StartupVm::new(&self.program).deploy(ctx)
    }
}

/// One call frame: registers plus per-run materialized constants.
/// Constants materialize once per run, so two loads of the same pool
/// entry yield the same value — string identity behaves like interning.
struct Frame<'m> {
    method: &'m StartupMethod,
    registers: Vec<Value>,
    consts: Vec<Option<Value>>,
}

impl<'m> Frame<'m> {
    fn new(method: &'m StartupMethod, array: Value) -> Frame<'m> {
        let locals = method.locals.max(1) as usize;
        let mut registers = vec![Value::Null; locals];
        registers[ARRAY_REG as usize] = array;
        Frame { method, registers, consts: vec![None; method.constants.len()] }
    }

    fn reg(&self, idx: u16) -> Result<&Value, String> {
        self.registers
            .get(idx as usize)
            .ok_or_else(|| format!("register {} out of range in {}", idx, self.method.name))
    }

    fn set_reg(&mut self, idx: u16, value: Value) -> Result<(), String> {
        let slot = self
            .registers
            .get_mut(idx as usize)
            .ok_or_else(|| format!("register {} out of range in {}", idx, self.method.name))?;
        *slot = value;
        Ok(())
    }

    fn raw_constant(&self, idx: u16) -> Result<&Constant, String> {
        self.method
            .constants
            .get(idx as usize)
            .ok_or_else(|| format!("constant {} out of range in {}", idx, self.method.name))
    }

    fn args(&self, base: u16, count: u16) -> Result<Vec<Value>, String> {
        (0..count).map(|i| self.reg(base + 1 + i).cloned()).collect()
    }

    fn str_constant(&self, idx: u16) -> Result<String, String> {
        match self.raw_constant(idx)? {
            Constant::Str(s) => Ok(s.clone()),
            other => Err(format!("expected a string constant, found {}", other)),
        }
    }
}

pub struct StartupVm<'a> {
    program: &'a StartupProgram,
    /// The immutable empty collections are shared, one per family.
    empties: RefCell<HashMap<u16, Value>>,
}

impl<'a> StartupVm<'a> {
    pub fn new(program: &'a StartupProgram) -> StartupVm<'a> {
        StartupVm { program, empties: RefCell::new(HashMap::new()) }
    }

    /// Run the entry method.
    pub fn deploy(&self, ctx: &mut StartupContext) -> Result<(), String> {
        debug!("deploying {}", self.program.name);
        self.run_method(&self.program.entry, Value::Null, ctx).map(|_| ())
    }

    fn method(&self, idx: usize) -> Result<&StartupMethod, String> {
        self.program.methods.get(idx).ok_or_else(|| format!("no method #{}", idx))
    }

    /// Materialize pool entry `idx`, caching per run.
    fn load_constant(
        &self,
        frame: &mut Frame<'_>,
        idx: u16,
        ctx: &StartupContext,
    ) -> Result<Value, String> {
        if let Some(v) = frame.consts.get(idx as usize).and_then(|v| v.clone()) {
            return Ok(v);
        }
        let value = match frame.raw_constant(idx)? {
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(n) => Value::Int(*n),
            Constant::Float(f) => Value::Float(*f),
            Constant::Char(c) => Value::Char(*c),
            Constant::Str(s) => Value::str(s),
            Constant::Duration { secs, nanos } => Value::Duration(Duration::new(*secs, *nanos)),
            Constant::Url(u) => {
                Url::parse(u).map_err(|e| format!("malformed URL {}: {}", u, e))?;
                Value::url(u)
            }
            Constant::Type(name) => {
                let loadable = is_primitive(name)
                    || name == primitive::OBJECT
                    || name == primitive::STRING
                    || name == primitive::VOID
                    || ctx.registry().contains(name);
                if !loadable {
                    return Err(format!("class {} is not loadable at startup", name));
                }
                Value::class_ref(name)
            }
            Constant::TypeExpr(t) => Value::type_expr(t.clone()),
            Constant::Enum { class, constant } => {
                let def = ctx
                    .registry()
                    .lookup(class)
                    .ok_or_else(|| format!("enum class {} is not loadable", class))?;
                if !def.has_enum_constant(constant) {
                    return Err(format!("no enum constant {}.{}", class, constant));
                }
                Value::enum_const(class, constant)
            }
            other => return Err(format!("constant {} cannot be loaded into a register", other)),
        };
        if let Some(slot) = frame.consts.get_mut(idx as usize) {
            *slot = Some(value.clone());
        }
        Ok(value)
    }

    fn empty_collection(&self, fam: u16) -> Result<Value, String> {
        if let Some(v) = self.empties.borrow().get(&fam) {
            return Ok(v.clone());
        }
        let v = if fam == family::LIST {
            Value::immutable_list(vec![])
        } else if fam == family::SET {
            Value::immutable_set(SetKind::Hash, vec![])
        } else if fam == family::SORTED_SET {
            Value::immutable_set(SetKind::Sorted, vec![])
        } else if fam == family::MAP {
            Value::immutable_map(MapKind::Hash, vec![])
        } else if fam == family::SORTED_MAP {
            Value::immutable_map(MapKind::Sorted, vec![])
        } else {
            return Err(format!("unknown collection family {}", fam));
        };
        self.empties.borrow_mut().insert(fam, v.clone());
        Ok(v)
    }

    fn construct(
        &self,
        class: &str,
        ctor: usize,
        args: Vec<Value>,
        ctx: &StartupContext,
    ) -> Result<Value, String> {
        let def = ctx
            .registry()
            .lookup(class)
            .ok_or_else(|| format!("class {} is not loadable at startup", class))?;
        let instance = match def.kind {
            ClassKind::Annotation => {
                if def.annotation_members.len() != args.len() {
                    return Err(format!(
                        "annotation {} takes {} member(s), got {}",
                        class,
                        def.annotation_members.len(),
                        args.len()
                    ));
                }
                let inst = ObjectInstance::new(class);
                for (member, value) in def.annotation_members.iter().zip(args) {
                    inst.set(&member.name, value);
                }
                inst
            }
            _ => {
                let ctor_def = def
                    .ctors
                    .get(ctor)
                    .ok_or_else(|| format!("{} has no constructor #{}", class, ctor))?;
                if ctor_def.params.len() != args.len() {
                    return Err(format!(
                        "constructor #{} of {} takes {} parameter(s), got {}",
                        ctor,
                        class,
                        ctor_def.params.len(),
                        args.len()
                    ));
                }
                let inst = ObjectInstance::new(class);
                for (param, value) in ctor_def.params.iter().zip(args) {
                    let name = param
                        .name
                        .as_ref()
                        .ok_or_else(|| format!("constructor parameter of {} is unnamed", class))?;
                    inst.set(name, value);
                }
                inst
            }
        };
        Ok(Value::Object(Rc::new(instance)))
    }

    fn run_method(
        &self,
        method: &StartupMethod,
        array: Value,
        ctx: &mut StartupContext,
    ) -> Result<Value, String> {
        let mut frame = Frame::new(method, array);

        for instr in &method.instructions {
            match instr.opcode {
                Opcode::LoadConst => {
                    let v = self.load_constant(&mut frame, instr.b, ctx)?;
                    frame.set_reg(instr.a, v)?;
                }
                Opcode::LoadNull => frame.set_reg(instr.a, Value::Null)?,
                Opcode::LoadTrue => frame.set_reg(instr.a, Value::Bool(true))?,
                Opcode::LoadFalse => frame.set_reg(instr.a, Value::Bool(false))?,
                Opcode::Move => {
                    let v = frame.reg(instr.b)?.clone();
                    frame.set_reg(instr.a, v)?;
                }

                Opcode::GetCtx => {
                    let key = frame.str_constant(instr.b)?;
                    let v = ctx
                        .get_value(&key)
                        .ok_or_else(|| format!("no startup value under key {}", key))?;
                    frame.set_reg(instr.a, v)?;
                }
                Opcode::PutCtx => {
                    let key = frame.str_constant(instr.a)?;
                    let v = frame.reg(instr.b)?.clone();
                    ctx.put_value(&key, v);
                }
                Opcode::SetStepName => {
                    let name = frame.str_constant(instr.a)?;
                    ctx.set_current_build_step_name(&name);
                }

                Opcode::NewRecorder => {
                    let class = match frame.raw_constant(instr.b)? {
                        Constant::Type(c) | Constant::Str(c) => c.clone(),
                        other => return Err(format!("not a recorder class constant: {}", other)),
                    };
                    let args = frame.args(instr.a, instr.c)?;
                    let dispatch = ctx.make_recorder(&class, args)?;
                    frame.set_reg(
                        instr.a,
                        Value::Recorder(Rc::new(RecorderInstance::new(&class, dispatch))),
                    )?;
                }
                Opcode::InvokeRecorder => {
                    let name = match frame.raw_constant(instr.b)? {
                        Constant::MethodRef { name, .. } => name.clone(),
                        other => return Err(format!("not a method constant: {}", other)),
                    };
                    let args = frame.args(instr.a, instr.c)?;
                    let result = match frame.reg(instr.a)? {
                        Value::Recorder(r) => r.dispatch.borrow_mut().dispatch(&name, args)?,
                        other => return Err(format!("{} is not a recorder", other)),
                    };
                    frame.set_reg(instr.a, result)?;
                }

                Opcode::Construct => {
                    let (class, ctor) = match frame.raw_constant(instr.b)? {
                        Constant::Ctor { class, ctor } => (class.clone(), *ctor),
                        other => return Err(format!("not a constructor constant: {}", other)),
                    };
                    let args = frame.args(instr.a, instr.c)?;
                    let v = self.construct(&class, ctor, args, ctx)?;
                    frame.set_reg(instr.a, v)?;
                }
                Opcode::NewObj => {
                    let class = match frame.raw_constant(instr.b)? {
                        Constant::Type(c) | Constant::Str(c) => c.clone(),
                        other => return Err(format!("not a class constant: {}", other)),
                    };
                    if !ctx.registry().contains(&class) {
                        return Err(format!("class {} is not loadable at startup", class));
                    }
                    frame.set_reg(instr.a, Value::Object(Rc::new(ObjectInstance::new(&class))))?;
                }
                Opcode::WrapRuntime => {
                    let v = frame.reg(instr.b)?.clone();
                    frame.set_reg(instr.a, Value::Runtime(Rc::new(RuntimeValue::new(v))))?;
                }
                Opcode::NewList => frame.set_reg(instr.a, Value::list(vec![]))?,
                Opcode::NewSet => {
                    let kind = match instr.b {
                        container::HASH => SetKind::Hash,
                        container::LINKED => SetKind::Linked,
                        container::SORTED => SetKind::Sorted,
                        other => return Err(format!("unknown set kind {}", other)),
                    };
                    frame.set_reg(instr.a, Value::set(kind, vec![]))?;
                }
                Opcode::NewMap => {
                    let kind = match instr.b {
                        container::HASH => MapKind::Hash,
                        container::LINKED => MapKind::Linked,
                        container::SORTED => MapKind::Sorted,
                        other => return Err(format!("unknown map kind {}", other)),
                    };
                    frame.set_reg(instr.a, Value::map(kind, vec![]))?;
                }
                Opcode::NewArray => {
                    let elem_type = match frame.raw_constant(instr.c)? {
                        Constant::TypeExpr(t) => t.clone(),
                        other => return Err(format!("not an element type constant: {}", other)),
                    };
                    let elems = vec![Value::Null; instr.b as usize];
                    frame.set_reg(instr.a, Value::array(elem_type, elems))?;
                }
                Opcode::MakeEmptyColl => {
                    let v = self.empty_collection(instr.b)?;
                    frame.set_reg(instr.a, v)?;
                }
                Opcode::MakeSingletonList => {
                    let v = frame.reg(instr.b)?.clone();
                    frame.set_reg(instr.a, Value::immutable_list(vec![v]))?;
                }
                Opcode::MakeSingletonSet => {
                    let v = frame.reg(instr.b)?.clone();
                    frame.set_reg(instr.a, Value::immutable_set(SetKind::Hash, vec![v]))?;
                }
                Opcode::MakeSingletonMap => {
                    let k = frame.reg(instr.b)?.clone();
                    let v = frame.reg(instr.c)?.clone();
                    frame.set_reg(instr.a, Value::immutable_map(MapKind::Hash, vec![(k, v)]))?;
                }
                Opcode::MakeOpt => {
                    let v = match frame.reg(instr.b)? {
                        Value::Null => Value::none(),
                        other => Value::some(other.clone()),
                    };
                    frame.set_reg(instr.a, v)?;
                }
                Opcode::MakeEmptyOpt => frame.set_reg(instr.a, Value::none())?,

                Opcode::Add => {
                    let v = frame.reg(instr.b)?.clone();
                    match frame.reg(instr.a)? {
                        Value::List(l) => {
                            if l.immutable {
                                return Err("cannot add to an immutable list".to_string());
                            }
                            l.elems.borrow_mut().push(v);
                        }
                        Value::Set(s) => {
                            if s.immutable {
                                return Err("cannot add to an immutable set".to_string());
                            }
                            let mut elems = s.elems.borrow_mut();
                            if !elems.contains(&v) {
                                elems.push(v);
                            }
                        }
                        other => return Err(format!("cannot add to {}", other)),
                    }
                }
                Opcode::Put => {
                    let k = frame.reg(instr.b)?.clone();
                    let v = frame.reg(instr.c)?.clone();
                    match frame.reg(instr.a)? {
                        Value::Map(m) => {
                            if m.immutable {
                                return Err("cannot put into an immutable map".to_string());
                            }
                            let mut entries = m.entries.borrow_mut();
                            if let Some(entry) = entries.iter_mut().find(|(ek, _)| *ek == k) {
                                entry.1 = v;
                            } else {
                                entries.push((k, v));
                            }
                        }
                        other => return Err(format!("cannot put into {}", other)),
                    }
                }
                Opcode::SetProp => {
                    let name = frame.str_constant(instr.b)?;
                    let v = frame.reg(instr.c)?.clone();
                    match frame.reg(instr.a)? {
                        Value::Object(o) => {
                            let writable = ctx
                                .registry()
                                .lookup(&o.class)
                                .and_then(|d| d.property(&name))
                                .map(|p| p.has_setter)
                                .unwrap_or(false);
                            if !writable {
                                return Err(format!("{} has no setter for {}", o.class, name));
                            }
                            o.set(&name, v);
                        }
                        other => return Err(format!("cannot set property on {}", other)),
                    }
                }
                Opcode::SetField => {
                    let name = frame.str_constant(instr.b)?;
                    let v = frame.reg(instr.c)?.clone();
                    match frame.reg(instr.a)? {
                        Value::Object(o) => {
                            let ok = ctx
                                .registry()
                                .lookup(&o.class)
                                .and_then(|d| d.field(&name))
                                .map(|f| f.public && !f.final_field)
                                .unwrap_or(false);
                            if !ok {
                                return Err(format!("{} has no writable field {}", o.class, name));
                            }
                            o.set(&name, v);
                        }
                        other => return Err(format!("cannot write a field of {}", other)),
                    }
                }
                Opcode::GetProp => {
                    let name = frame.str_constant(instr.c)?;
                    let v = match frame.reg(instr.b)? {
                        Value::Object(o) => o.get(&name),
                        other => return Err(format!("cannot read a property of {}", other)),
                    };
                    if let Value::Null = v {
                        return Err(format!("read-only property {} is empty at startup", name));
                    }
                    frame.set_reg(instr.a, v)?;
                }
                Opcode::SetIndex => {
                    let v = frame.reg(instr.c)?.clone();
                    match frame.reg(instr.a)? {
                        Value::Array(arr) => {
                            let mut elems = arr.elems.borrow_mut();
                            let slot = elems
                                .get_mut(instr.b as usize)
                                .ok_or_else(|| format!("array index {} out of range", instr.b))?;
                            *slot = v;
                        }
                        other => return Err(format!("cannot index into {}", other)),
                    }
                }

                Opcode::Restore => {
                    let name = frame.str_constant(instr.b)?;
                    let provider = ctx
                        .provider(&name)
                        .ok_or_else(|| format!("no substitution provider {} registered", name))?;
                    let v = provider.deserialize(frame.reg(instr.c)?.clone())?;
                    frame.set_reg(instr.a, v)?;
                }

                Opcode::NewSharedArray => {
                    let elems = vec![Value::Null; instr.b as usize];
                    frame.set_reg(
                        instr.a,
                        Value::array(ignition_model::types::TypeExpr::object(), elems),
                    )?;
                }
                Opcode::ArrRead => {
                    let v = match frame.reg(ARRAY_REG)? {
                        Value::Array(arr) => arr
                            .elems
                            .borrow()
                            .get(instr.b as usize)
                            .cloned()
                            .ok_or_else(|| format!("shared slot {} out of range", instr.b))?,
                        other => return Err(format!("{} is not the shared array", other)),
                    };
                    if instr.c != NO_TYPE {
                        if let (Constant::TypeExpr(t), Value::Object(o)) =
                            (frame.raw_constant(instr.c)?, &v)
                        {
                            if let Some(raw) = t.raw_name() {
                                if ctx.registry().contains(raw) && o.class != raw {
                                    return Err(format!(
                                        "cannot cast {} to {} reading shared slot {}",
                                        o.class, raw, instr.b
                                    ));
                                }
                            }
                        }
                    }
                    frame.set_reg(instr.a, v)?;
                }
                Opcode::ArrWrite => {
                    let v = frame.reg(instr.b)?.clone();
                    match frame.reg(ARRAY_REG)? {
                        Value::Array(arr) => {
                            let mut elems = arr.elems.borrow_mut();
                            let slot = elems.get_mut(instr.a as usize).ok_or_else(|| {
                                format!("shared slot {} out of range", instr.a)
                            })?;
                            *slot = v;
                        }
                        other => return Err(format!("{} is not the shared array", other)),
                    }
                }

                Opcode::Invoke => {
                    let idx = match frame.raw_constant(instr.b)? {
                        Constant::Method(idx) => *idx,
                        other => return Err(format!("not a method constant: {}", other)),
                    };
                    let callee = self.method(idx)?;
                    let array = frame.reg(instr.a)?.clone();
                    let result = self.run_method(callee, array, ctx)?;
                    frame.set_reg(instr.a, result)?;
                }
                Opcode::Return => return Ok(frame.reg(instr.a)?.clone()),
                Opcode::ReturnVoid => return Ok(Value::Null),
            }
        }
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ignition_model::registry::{
        AnnotationMember, ClassDef, ClassRegistry, CtorDef, CtorParam, FieldDef, PropertyDef,
    };
    use ignition_model::types::{MethodDescriptor, ParamSpec, TypeExpr};
    use ignition_model::{RecorderDispatch, SubstitutionProvider};
    use ignition_recorder::emit::{MethodWriter, ObjectLoader};
    use ignition_recorder::error::RecorderError;
    use ignition_recorder::ir::Instruction;
    use ignition_recorder::StartupRecorder;

    /// Observed calls, shared between the test and the live recorder.
    #[derive(Default)]
    struct CallLog {
        calls: Vec<(String, Vec<Value>)>,
    }

    struct TestRecorder {
        log: Rc<RefCell<CallLog>>,
        results: HashMap<String, Value>,
    }

    impl RecorderDispatch for TestRecorder {
        fn dispatch(&mut self, method: &str, args: Vec<Value>) -> Result<Value, String> {
            self.log.borrow_mut().calls.push((method.to_string(), args));
            Ok(self.results.get(method).cloned().unwrap_or(Value::Null))
        }
    }

    /// A registry with one recorder class exposing the given methods.
    fn registry_with(methods: Vec<MethodDescriptor>) -> ClassRegistry {
        let mut reg = ClassRegistry::new();
        let mut rec = ClassDef::new("Rec");
        rec.ctors.push(CtorDef::no_arg());
        rec.methods = methods;
        reg.register(rec);
        reg
    }

    fn void_method(name: &str, params: Vec<ParamSpec>) -> MethodDescriptor {
        MethodDescriptor::new("Rec", name, params, TypeExpr::void())
    }

    /// Emit, deploy against a fresh context, and hand back the observed
    /// calls plus the context.
    fn deploy(
        recorder: &StartupRecorder,
        registry: Rc<ClassRegistry>,
        results: HashMap<String, Value>,
        setup: impl FnOnce(&mut StartupContext),
    ) -> (Rc<RefCell<CallLog>>, StartupContext) {
        let program = recorder.finish().expect("emission failed");
        let mut ctx = StartupContext::new(registry);
        let log = Rc::new(RefCell::new(CallLog::default()));
        let factory_log = Rc::clone(&log);
        ctx.register_recorder(
            "Rec",
            Box::new(move |_args| {
                Ok(Box::new(TestRecorder {
                    log: Rc::clone(&factory_log),
                    results: results.clone(),
                }) as Box<dyn RecorderDispatch>)
            }),
        );
        setup(&mut ctx);
        ProgramTask::new(program).deploy(&mut ctx).expect("deploy failed");
        (log, ctx)
    }

    #[test]
    fn test_replays_literal_arguments() {
        let registry = Rc::new(registry_with(vec![void_method(
            "greet",
            vec![ParamSpec::of(TypeExpr::raw("string")), ParamSpec::of(TypeExpr::raw("int"))],
        )]));
        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        proxy.invoke("greet", vec![Value::str("hi"), Value::Int(7)]).unwrap();

        let (log, ctx) = deploy(&recorder, registry, HashMap::new(), |_| {});
        let calls = &log.borrow().calls;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "greet");
        assert_eq!(calls[0].1, vec![Value::str("hi"), Value::Int(7)]);
        assert_eq!(ctx.current_build_step_name(), "step.run");
    }

    #[test]
    fn test_calls_replay_in_recorded_order() {
        let registry = Rc::new(registry_with(vec![void_method(
            "greet",
            vec![ParamSpec::of(TypeExpr::raw("int"))],
        )]));
        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        for i in 0..20 {
            proxy.invoke("greet", vec![Value::Int(i)]).unwrap();
        }
        let (log, _) = deploy(&recorder, registry, HashMap::new(), |_| {});
        let observed: Vec<i64> = log
            .borrow()
            .calls
            .iter()
            .map(|(_, args)| match &args[0] {
                Value::Int(n) => *n,
                other => panic!("unexpected argument {}", other),
            })
            .collect();
        assert_eq!(observed, (0..20).collect::<Vec<_>>());
    }

    struct UrlAsString;

    impl SubstitutionProvider for UrlAsString {
        fn serialize(&self, from: &Value) -> Result<Value, String> {
            match from {
                Value::Url(u) => Ok(Value::str(u)),
                other => Err(format!("not a url: {}", other)),
            }
        }

        fn deserialize(&self, to: Value) -> Result<Value, String> {
            match to {
                Value::Str(s) => Ok(Value::url(&s)),
                other => Err(format!("not a string: {}", other)),
            }
        }
    }

    #[test]
    fn test_substitution_roundtrip() {
        let registry = Rc::new(registry_with(vec![void_method(
            "fetch",
            vec![ParamSpec::of(TypeExpr::raw("url"))],
        )]));
        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        recorder.register_substitution("url", "string", "UrlAsString", Rc::new(UrlAsString));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        proxy.invoke("fetch", vec![Value::url("https://a/b")]).unwrap();

        let (log, _) = deploy(&recorder, registry, HashMap::new(), |ctx| {
            ctx.register_provider("UrlAsString", Rc::new(UrlAsString));
        });
        assert_eq!(log.borrow().calls[0].1, vec![Value::url("https://a/b")]);
    }

    #[test]
    fn test_returned_value_reaches_consumer_identically() {
        let mut registry = registry_with(vec![
            MethodDescriptor::new(
                "Rec",
                "create",
                vec![],
                TypeExpr::raw(ignition_model::RUNTIME_VALUE_CLASS),
            ),
            void_method(
                "use",
                vec![ParamSpec::of(TypeExpr::raw(ignition_model::RUNTIME_VALUE_CLASS))],
            ),
        ]);
        registry.register(ClassDef::new("Widget"));
        let registry = Rc::new(registry);

        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        let handle = proxy.invoke("create", vec![]).unwrap();
        assert!(matches!(handle, Value::Proxy(_)));
        proxy.invoke("use", vec![handle]).unwrap();

        let produced = Value::Runtime(Rc::new(RuntimeValue::new(Value::str("payload"))));
        let mut results = HashMap::new();
        results.insert("create".to_string(), produced.clone());

        let (log, _) = deploy(&recorder, registry, results, |_| {});
        let calls = &log.borrow().calls;
        assert_eq!(calls.len(), 2);
        // The consumer received the exact object the producer made.
        assert_eq!(calls[1].1[0].identity(), produced.identity());
    }

    #[test]
    fn test_immutable_list_replays_in_order() {
        let registry = Rc::new(registry_with(vec![void_method(
            "take",
            vec![ParamSpec::of(TypeExpr::parameterized("list", vec![TypeExpr::raw("string")]))],
        )]));
        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        proxy
            .invoke("take", vec![Value::immutable_list(vec![Value::str("x"), Value::str("y")])])
            .unwrap();

        let (log, _) = deploy(&recorder, registry, HashMap::new(), |_| {});
        match &log.borrow().calls[0].1[0] {
            Value::List(l) => {
                assert_eq!(*l.elems.borrow(), vec![Value::str("x"), Value::str("y")]);
            }
            other => panic!("expected a list, got {}", other),
        }
    }

    fn person_registry() -> ClassRegistry {
        let mut registry = registry_with(vec![void_method(
            "keep",
            vec![ParamSpec::of(TypeExpr::raw("Person"))],
        )]);
        let mut person = ClassDef::new("Person");
        person.ctors.push(CtorDef::of(vec![
            CtorParam::named("name", TypeExpr::raw("string")),
            CtorParam::named("age", TypeExpr::raw("int")),
        ]));
        person.fields.push(FieldDef::public("name", TypeExpr::raw("string")));
        person.fields.push(FieldDef::public("age", TypeExpr::raw("int")));
        registry.register(person);
        registry
    }

    #[test]
    fn test_object_reconstructed_through_named_constructor() {
        let registry = Rc::new(person_registry());
        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        let person = Value::object(ObjectInstance::with_fields("Person", vec![
            ("name", Value::str("A")),
            ("age", Value::Int(3)),
        ]));
        proxy.invoke("keep", vec![person]).unwrap();

        let (log, _) = deploy(&recorder, registry, HashMap::new(), |_| {});
        match &log.borrow().calls[0].1[0] {
            Value::Object(o) => {
                assert_eq!(o.class, "Person");
                assert_eq!(o.get("name"), Value::str("A"));
                assert_eq!(o.get("age"), Value::Int(3));
            }
            other => panic!("expected an object, got {}", other),
        }
    }

    #[test]
    fn test_shared_boxed_scalar_is_materialized_once() {
        let registry = Rc::new(registry_with(vec![void_method(
            "pair",
            vec![ParamSpec::of(TypeExpr::object()), ParamSpec::of(TypeExpr::object())],
        )]));
        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        proxy.invoke("pair", vec![Value::Int(42), Value::Int(42)]).unwrap();

        let program = recorder.finish().unwrap();
        let loads_of_42: usize = std::iter::once(&program.entry)
            .chain(program.methods.iter())
            .map(|m| {
                m.instructions
                    .iter()
                    .filter(|i| {
                        matches!(i.opcode, Opcode::LoadConst)
                            && matches!(
                                m.constants.get(i.b as usize),
                                Some(Constant::Int(42))
                            )
                    })
                    .count()
            })
            .sum();
        assert_eq!(loads_of_42, 1);

        let (log, _) = deploy(&recorder, registry, HashMap::new(), |_| {});
        assert_eq!(log.borrow().calls[0].1, vec![Value::Int(42), Value::Int(42)]);
    }

    #[test]
    fn test_self_referential_map_preserves_identity() {
        let registry = Rc::new(registry_with(vec![void_method(
            "put",
            vec![ParamSpec::of(TypeExpr::raw("map"))],
        )]));
        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let proxy = recorder.recording_proxy("Rec").unwrap();

        let map = Value::map(MapKind::Linked, vec![]);
        if let Value::Map(m) = &map {
            m.entries.borrow_mut().push((Value::str("self"), map.clone()));
        }
        proxy.invoke("put", vec![map]).unwrap();

        let (log, _) = deploy(&recorder, registry, HashMap::new(), |_| {});
        match &log.borrow().calls[0].1[0] {
            Value::Map(m) => {
                let entries = m.entries.borrow();
                assert_eq!(entries.len(), 1);
                let inner = entries[0].1.identity();
                assert_eq!(inner, Some(Rc::as_ptr(m) as usize));
            }
            other => panic!("expected a map, got {}", other),
        }
    }

    #[test]
    fn test_large_argument_graph() {
        let registry = Rc::new(registry_with(vec![void_method(
            "bulk",
            vec![ParamSpec::of(TypeExpr::raw("list"))],
        )]));
        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        let big = Value::list((0..10_000).map(|i| Value::list(vec![Value::Int(i)])).collect());
        proxy.invoke("bulk", vec![big]).unwrap();

        let (log, _) = deploy(&recorder, registry, HashMap::new(), |_| {});
        match &log.borrow().calls[0].1[0] {
            Value::List(l) => {
                let elems = l.elems.borrow();
                assert_eq!(elems.len(), 10_000);
                assert_eq!(elems[9_999], Value::list(vec![Value::Int(9_999)]));
            }
            other => panic!("expected a list, got {}", other),
        }
    }

    #[test]
    fn test_cross_phase_proxy_is_rejected() {
        let methods = || {
            vec![
                MethodDescriptor::new("Rec", "create", vec![], TypeExpr::raw(ignition_model::RUNTIME_VALUE_CLASS)),
                void_method("use", vec![ParamSpec::of(TypeExpr::raw(ignition_model::RUNTIME_VALUE_CLASS))]),
            ]
        };
        let registry = Rc::new(registry_with(methods()));

        let runtime_rec = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let runtime_proxy = runtime_rec.recording_proxy("Rec").unwrap();
        let handle = runtime_proxy.invoke("create", vec![]).unwrap();

        let static_rec = StartupRecorder::new(true, "step", "init", Rc::clone(&registry));
        let static_proxy = static_rec.recording_proxy("Rec").unwrap();
        let err = static_proxy.invoke("use", vec![handle]).unwrap_err();
        assert!(matches!(err, RecorderError::CrossPhaseProxy { .. }));

        // The reverse direction is allowed: static-init proxies may flow
        // into runtime recorders.
        let static_handle = static_proxy.invoke("create", vec![]).unwrap();
        runtime_proxy.invoke("use", vec![static_handle]).unwrap();
    }

    #[test]
    fn test_scalar_and_reference_constants_roundtrip() {
        let mut registry = registry_with(vec![void_method(
            "mix",
            vec![
                ParamSpec::of(TypeExpr::raw("bool")),
                ParamSpec::of(TypeExpr::raw("float")),
                ParamSpec::of(TypeExpr::raw("char")),
                ParamSpec::of(TypeExpr::raw("duration")),
                ParamSpec::of(TypeExpr::raw("Color")),
                ParamSpec::of(TypeExpr::raw("class")),
                ParamSpec::of(TypeExpr::raw("type")),
                ParamSpec::of(TypeExpr::raw("optional")),
                ParamSpec::of(TypeExpr::raw("optional")),
            ],
        )]);
        registry.register(ClassDef::an_enum("Color", &["RED", "GREEN"]));
        registry.register(ClassDef::new("Widget"));
        let registry = Rc::new(registry);

        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        let args = vec![
            Value::Bool(true),
            Value::Float(2.5),
            Value::Char('k'),
            Value::Duration(Duration::new(90, 250)),
            Value::enum_const("Color", "GREEN"),
            Value::class_ref("Widget"),
            Value::type_expr(TypeExpr::parameterized("list", vec![TypeExpr::raw("Widget")])),
            Value::some(Value::str("present")),
            Value::none(),
        ];
        proxy.invoke("mix", vec![args[0].clone(), args[1].clone(), args[2].clone(),
            args[3].clone(), args[4].clone(), args[5].clone(), args[6].clone(),
            args[7].clone(), args[8].clone()]).unwrap();

        let (log, _) = deploy(&recorder, registry, HashMap::new(), |_| {});
        assert_eq!(log.borrow().calls[0].1, args);
    }

    #[test]
    fn test_empty_immutable_collections_are_shared() {
        let registry = Rc::new(registry_with(vec![void_method(
            "both",
            vec![ParamSpec::of(TypeExpr::raw("list")), ParamSpec::of(TypeExpr::raw("list"))],
        )]));
        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        proxy
            .invoke("both", vec![Value::immutable_list(vec![]), Value::immutable_list(vec![])])
            .unwrap();

        let (log, _) = deploy(&recorder, registry, HashMap::new(), |_| {});
        let calls = &log.borrow().calls;
        let a = &calls[0].1[0];
        let b = &calls[0].1[1];
        assert_eq!(a, &Value::immutable_list(vec![]));
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn test_new_instance_publishes_a_runtime_value() {
        let mut registry = registry_with(vec![void_method(
            "consume",
            vec![ParamSpec::of(TypeExpr::raw(ignition_model::RUNTIME_VALUE_CLASS))],
        )]);
        registry.register(ClassDef::new("Widget"));
        let registry = Rc::new(registry);

        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let handle = recorder.new_instance("Widget");
        let proxy = recorder.recording_proxy("Rec").unwrap();
        proxy.invoke("consume", vec![handle]).unwrap();

        let (log, _) = deploy(&recorder, registry, HashMap::new(), |_| {});
        match &log.borrow().calls[0].1[0] {
            Value::Runtime(rv) => match rv.get() {
                Value::Object(o) => assert_eq!(o.class, "Widget"),
                other => panic!("expected a wrapped object, got {}", other),
            },
            other => panic!("expected a runtime value, got {}", other),
        }
    }

    struct MysteryLoader;

    impl ObjectLoader for MysteryLoader {
        fn can_handle(&self, value: &Value, _static_init: bool) -> bool {
            matches!(value, Value::Object(o) if o.class == "Mystery")
        }

        fn emit(
            &self,
            w: &mut MethodWriter<'_>,
            _value: &Value,
            _static_init: bool,
        ) -> Result<u16, RecorderError> {
            Ok(w.load_const(Constant::Str("loaded!".to_string())))
        }
    }

    #[test]
    fn test_object_loader_emits_the_creation_fragment() {
        let registry = Rc::new(registry_with(vec![void_method(
            "take",
            vec![ParamSpec::of(TypeExpr::object())],
        )]));
        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        recorder.register_object_loader(Box::new(MysteryLoader));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        // Mystery has no descriptor; only the loader can handle it.
        proxy.invoke("take", vec![Value::object(ObjectInstance::new("Mystery"))]).unwrap();

        let (log, _) = deploy(&recorder, registry, HashMap::new(), |_| {});
        assert_eq!(log.borrow().calls[0].1, vec![Value::str("loaded!")]);
    }

    #[test]
    fn test_registered_non_default_constructor() {
        let mut registry = registry_with(vec![void_method(
            "keep",
            vec![ParamSpec::of(TypeExpr::raw("Temp"))],
        )]);
        let mut temp = ClassDef::new("Temp");
        temp.ctors.push(CtorDef::no_arg());
        temp.ctors.push(CtorDef::of(vec![CtorParam::named("celsius", TypeExpr::raw("float"))]));
        registry.register(temp);
        let registry = Rc::new(registry);

        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        recorder.register_non_default_constructor(
            "Temp",
            1,
            Box::new(|v| match v {
                Value::Object(o) => vec![o.get("celsius")],
                _ => vec![],
            }),
        );
        let proxy = recorder.recording_proxy("Rec").unwrap();
        let temp = Value::object(ObjectInstance::with_fields("Temp", vec![(
            "celsius",
            Value::Float(21.5),
        )]));
        proxy.invoke("keep", vec![temp]).unwrap();

        let (log, _) = deploy(&recorder, registry, HashMap::new(), |_| {});
        match &log.borrow().calls[0].1[0] {
            Value::Object(o) => assert_eq!(o.get("celsius"), Value::Float(21.5)),
            other => panic!("expected an object, got {}", other),
        }
    }

    #[test]
    fn test_recorder_constructor_injection_from_constants() {
        let mut registry = ClassRegistry::new();
        let mut rec = ClassDef::new("Rec");
        rec.ctors.push(CtorDef::of(vec![CtorParam::named("config", TypeExpr::raw("Config"))]));
        rec.methods.push(void_method("go", vec![]));
        registry.register(rec);
        let registry = Rc::new(registry);

        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        recorder.register_constant("Config", Value::str("cfg"));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        proxy.invoke("go", vec![]).unwrap();
        let program = recorder.finish().unwrap();

        let mut ctx = StartupContext::new(Rc::clone(&registry));
        let injected: Rc<RefCell<Vec<Value>>> = Rc::default();
        let seen = Rc::clone(&injected);
        let log: Rc<RefCell<CallLog>> = Rc::default();
        let factory_log = Rc::clone(&log);
        ctx.register_recorder(
            "Rec",
            Box::new(move |args| {
                seen.borrow_mut().extend(args);
                Ok(Box::new(TestRecorder {
                    log: Rc::clone(&factory_log),
                    results: HashMap::new(),
                }) as Box<dyn RecorderDispatch>)
            }),
        );
        ProgramTask::new(program).deploy(&mut ctx).unwrap();
        assert_eq!(*injected.borrow(), vec![Value::str("cfg")]);
        assert_eq!(log.borrow().calls.len(), 1);
    }

    #[test]
    fn test_missing_injection_constant_fails_the_build() {
        let mut registry = ClassRegistry::new();
        let mut rec = ClassDef::new("Rec");
        rec.ctors.push(CtorDef::of(vec![CtorParam::named("config", TypeExpr::raw("Config"))]));
        rec.methods.push(void_method("go", vec![]));
        registry.register(rec);
        let registry = Rc::new(registry);

        let recorder = StartupRecorder::new(false, "step", "run", registry);
        let proxy = recorder.recording_proxy("Rec").unwrap();
        proxy.invoke("go", vec![]).unwrap();
        let err = recorder.finish().unwrap_err();
        assert!(matches!(err, RecorderError::LoaderAbsent { .. }));
    }

    #[test]
    fn test_class_proxy_records_the_original_name() {
        let mut registry = registry_with(vec![void_method(
            "refer",
            vec![ParamSpec::of(TypeExpr::raw("class"))],
        )]);
        registry.register(ClassDef::new("lazy.Widget"));
        let registry = Rc::new(registry);

        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let stand_in = recorder.class_proxy("lazy.Widget");
        let proxy = recorder.recording_proxy("Rec").unwrap();
        proxy.invoke("refer", vec![stand_in]).unwrap();

        let (log, _) = deploy(&recorder, registry, HashMap::new(), |_| {});
        assert_eq!(log.borrow().calls[0].1, vec![Value::class_ref("lazy.Widget")]);
    }

    #[test]
    fn test_annotation_literal_uses_defaults() {
        let mut registry = registry_with(vec![void_method(
            "mark",
            vec![ParamSpec::of(TypeExpr::raw("Anno"))],
        )]);
        registry.register(ClassDef::annotation("Anno", vec![
            AnnotationMember { name: "value".to_string(), ty: TypeExpr::raw("string"), default: None },
            AnnotationMember { name: "count".to_string(), ty: TypeExpr::raw("int"), default: Some(Value::Int(1)) },
        ]));
        let registry = Rc::new(registry);

        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        let anno = Value::object(ObjectInstance::with_fields("Anno", vec![(
            "value",
            Value::str("x"),
        )]));
        proxy.invoke("mark", vec![anno]).unwrap();

        let (log, _) = deploy(&recorder, registry, HashMap::new(), |_| {});
        match &log.borrow().calls[0].1[0] {
            Value::Object(o) => {
                assert_eq!(o.get("value"), Value::str("x"));
                assert_eq!(o.get("count"), Value::Int(1));
            }
            other => panic!("expected an annotation literal, got {}", other),
        }
    }

    #[test]
    fn test_read_only_property_with_backing_field_is_strict_error() {
        let mut registry = registry_with(vec![
            void_method("keep", vec![ParamSpec::of(TypeExpr::raw("Box"))]),
            void_method("keep_relaxed", vec![ParamSpec::relaxed(TypeExpr::raw("Box"))]),
        ]);
        let mut boxed = ClassDef::new("Box");
        boxed.ctors.push(CtorDef::no_arg());
        let mut prop = PropertyDef::read_only("label", TypeExpr::raw("string"));
        prop.backing_field = true;
        boxed.properties.push(prop);
        registry.register(boxed);
        let registry = Rc::new(registry);

        let value = Value::object(ObjectInstance::with_fields("Box", vec![(
            "label",
            Value::str("x"),
        )]));

        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        proxy.invoke("keep", vec![value.clone()]).unwrap();
        let err = recorder.finish().unwrap_err();
        assert!(matches!(err, RecorderError::PropertyInconsistency { .. }));

        // Relaxed validation ignores the unrestorable property.
        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        proxy.invoke("keep_relaxed", vec![value]).unwrap();
        recorder.finish().unwrap();
    }

    #[test]
    fn test_getter_setter_type_mismatch() {
        let build_registry = |overload: bool| {
            let mut registry = registry_with(vec![
                void_method("keep", vec![ParamSpec::of(TypeExpr::raw("Holder"))]),
                void_method("keep_relaxed", vec![ParamSpec::relaxed(TypeExpr::raw("Holder"))]),
            ]);
            let mut holder = ClassDef::new("Holder");
            holder.ctors.push(CtorDef::no_arg());
            let mut prop = PropertyDef::read_write("item", TypeExpr::raw("string"));
            prop.setter_type = Some(TypeExpr::raw("object"));
            if overload {
                prop.setter_overloads.push(TypeExpr::raw("string"));
            }
            holder.properties.push(prop);
            registry.register(holder);
            Rc::new(registry)
        };

        let value = || {
            Value::object(ObjectInstance::with_fields("Holder", vec![(
                "item",
                Value::str("x"),
            )]))
        };

        // Strict mode rejects the mismatch outright.
        let registry = build_registry(true);
        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        proxy.invoke("keep", vec![value()]).unwrap();
        assert!(matches!(
            recorder.finish().unwrap_err(),
            RecorderError::PropertyInconsistency { .. }
        ));

        // Relaxed mode bridges through an assignable overload.
        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        proxy.invoke("keep_relaxed", vec![value()]).unwrap();
        let (log, _) = deploy(&recorder, registry, HashMap::new(), |_| {});
        match &log.borrow().calls[0].1[0] {
            Value::Object(o) => assert_eq!(o.get("item"), Value::str("x")),
            other => panic!("expected an object, got {}", other),
        }

        // Relaxed mode without a usable overload still fails.
        let registry = build_registry(false);
        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        proxy.invoke("keep_relaxed", vec![value()]).unwrap();
        assert!(matches!(
            recorder.finish().unwrap_err(),
            RecorderError::PropertyInconsistency { .. }
        ));
    }

    #[test]
    fn test_read_only_collection_population_shape() {
        let mut registry = registry_with(vec![void_method(
            "keep",
            vec![ParamSpec::of(TypeExpr::raw("Basket"))],
        )]);
        let mut basket = ClassDef::new("Basket");
        basket.ctors.push(CtorDef::no_arg());
        basket.properties.push(PropertyDef::read_only(
            "items",
            TypeExpr::parameterized("list", vec![TypeExpr::raw("string")]),
        ));
        registry.register(basket);
        let registry = Rc::new(registry);

        let recorder = StartupRecorder::new(false, "step", "run", registry);
        let proxy = recorder.recording_proxy("Rec").unwrap();
        let basket = Value::object(ObjectInstance::with_fields("Basket", vec![(
            "items",
            Value::list(vec![Value::str("a"), Value::str("b")]),
        )]));
        proxy.invoke("keep", vec![basket]).unwrap();

        // The emitted program reads the existing container and adds the
        // recorded elements into it.
        let program = recorder.finish().unwrap();
        let shape: Vec<(usize, usize)> = program
            .methods
            .iter()
            .map(|m| {
                let gets = m
                    .instructions
                    .iter()
                    .filter(|i: &&Instruction| matches!(i.opcode, Opcode::GetProp))
                    .count();
                let adds = m
                    .instructions
                    .iter()
                    .filter(|i: &&Instruction| matches!(i.opcode, Opcode::Add))
                    .count();
                (gets, adds)
            })
            .collect();
        assert!(shape.iter().any(|(g, a)| *g == 1 && *a == 2), "got {:?}", shape);
    }

    #[test]
    fn test_sorted_collection_with_custom_comparator_is_rejected() {
        let registry = Rc::new(registry_with(vec![void_method(
            "keep",
            vec![ParamSpec::of(TypeExpr::raw("map"))],
        )]));
        let recorder = StartupRecorder::new(false, "step", "run", registry);
        let proxy = recorder.recording_proxy("Rec").unwrap();
        let m = Value::Map(Rc::new(ignition_model::value::MapValue {
            kind: MapKind::Sorted,
            immutable: false,
            custom_comparator: true,
            entries: RefCell::new(vec![(Value::str("k"), Value::Int(1))]),
        }));
        proxy.invoke("keep", vec![m]).unwrap();
        let err = recorder.finish().unwrap_err();
        assert!(matches!(err, RecorderError::UnsupportedValue { .. }));
        assert!(err.to_string().contains("comparator"));
    }

    #[test]
    fn test_arrays_rebuild_slot_by_slot() {
        let registry = Rc::new(registry_with(vec![void_method(
            "take",
            vec![ParamSpec::of(TypeExpr::ArrayOf(Box::new(TypeExpr::raw("int"))))],
        )]));
        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        let arr = Value::array(TypeExpr::raw("int"), vec![Value::Int(1), Value::Int(2)]);
        proxy.invoke("take", vec![arr.clone()]).unwrap();

        let (log, _) = deploy(&recorder, registry, HashMap::new(), |_| {});
        assert_eq!(log.borrow().calls[0].1[0], arr);
    }

    #[test]
    fn test_shared_subgraph_is_materialized_once() {
        let registry = Rc::new(registry_with(vec![void_method(
            "both",
            vec![ParamSpec::of(TypeExpr::raw("list")), ParamSpec::of(TypeExpr::raw("list"))],
        )]));
        let recorder = StartupRecorder::new(false, "step", "run", Rc::clone(&registry));
        let proxy = recorder.recording_proxy("Rec").unwrap();
        let shared = Value::list(vec![Value::Int(5)]);
        proxy.invoke("both", vec![shared.clone(), shared]).unwrap();

        let (log, _) = deploy(&recorder, registry, HashMap::new(), |_| {});
        let calls = &log.borrow().calls;
        // One materialization, two references.
        assert_eq!(calls[0].1[0].identity(), calls[0].1[1].identity());
    }
}
