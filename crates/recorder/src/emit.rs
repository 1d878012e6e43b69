/// Method splitter and program assembler.
///
/// The emitter owns the continuation methods and exactly one *current*
/// method. Every top-level unit written (a deferred value's creation
/// fragment, a recorded call, a new-instance publication) is one
/// instruction group; when the current method reaches the group budget a
/// fresh continuation is allocated and becomes current. Groups are
/// atomic: a group never spans two methods.
///
/// The assembler drives deferred nodes through their lifecycle: `prepare`
/// emits the creation fragment once into the then-current method; `load`
/// reuses the local register inside that method and goes through the
/// shared object array from any other, assigning the slot index lazily on
/// the first cross-method use.

use std::collections::HashMap;

use log::debug;

use ignition_model::types::MethodDescriptor;
use ignition_model::value::Value;

use crate::error::RecorderError;
use crate::graph::{
    ContainerFamily, DeferredGraph, InlineValue, NodeId, NodeKind, Plan, Step,
};
use crate::ir::{
    container, Constant, Instruction, Opcode, StartupMethod, StartupProgram, ARRAY_REG, NO_TYPE,
};

/// Maximum instruction groups per generated method.
pub const GROUP_LIMIT: usize = 300;

struct MethodState {
    body: StartupMethod,
    next_reg: u16,
    /// Slot index -> register holding it; a slot is read at most once
    /// per method.
    slot_regs: HashMap<u16, u16>,
    groups: usize,
}

impl MethodState {
    fn new(name: String) -> MethodState {
        MethodState {
            body: StartupMethod::new(name),
            // Register 0 carries the shared object array.
            next_reg: ARRAY_REG + 1,
            slot_regs: HashMap::new(),
            groups: 0,
        }
    }
}

/// Borrowed write access to one method: registers, constants,
/// instructions. Object loaders receive this to emit their fragments.
pub struct MethodWriter<'a> {
    state: &'a mut MethodState,
}

impl MethodWriter<'_> {
    pub fn alloc_reg(&mut self) -> u16 {
        let r = self.state.next_reg;
        self.state.next_reg += 1;
        r
    }

    /// Make sure `reg` is within the allocated range.
    pub fn ensure_reg(&mut self, reg: u16) {
        if self.state.next_reg <= reg {
            self.state.next_reg = reg + 1;
        }
    }

    pub fn constant(&mut self, c: Constant) -> u16 {
        self.state.body.add_constant(c)
    }

    pub fn emit(&mut self, instr: Instruction) {
        self.state.body.emit(instr);
    }

    /// Load a constant into a fresh register.
    pub fn load_const(&mut self, c: Constant) -> u16 {
        let r = self.alloc_reg();
        match c {
            Constant::Bool(true) => self.emit(Instruction::a_only(Opcode::LoadTrue, r)),
            Constant::Bool(false) => self.emit(Instruction::a_only(Opcode::LoadFalse, r)),
            other => {
                let idx = self.constant(other);
                self.emit(Instruction::ab(Opcode::LoadConst, r, idx));
            }
        }
        r
    }
}

/// A pluggable creation-fragment emitter for values the built-in
/// dispatch does not know how to serialize.
pub trait ObjectLoader {
    fn can_handle(&self, value: &Value, static_init: bool) -> bool;
    /// Emit instructions producing the value, returning the register
    /// that holds it.
    fn emit(
        &self,
        w: &mut MethodWriter<'_>,
        value: &Value,
        static_init: bool,
    ) -> Result<u16, RecorderError>;
}

pub struct SplitEmitter {
    methods: Vec<MethodState>,
    current: usize,
    array_slots: u16,
}

impl SplitEmitter {
    pub fn new() -> SplitEmitter {
        SplitEmitter {
            methods: vec![MethodState::new("deploy$1".to_string())],
            current: 0,
            array_slots: 0,
        }
    }

    /// Open the next instruction group, rolling over to a fresh
    /// continuation when the current method is full.
    pub fn begin_group(&mut self) {
        if self.methods[self.current].groups >= GROUP_LIMIT {
            let name = format!("deploy${}", self.methods.len() + 1);
            debug!("method {} full, continuing in {}", self.methods[self.current].body.name, name);
            self.methods.push(MethodState::new(name));
            self.current = self.methods.len() - 1;
        }
        self.methods[self.current].groups += 1;
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn writer(&mut self) -> MethodWriter<'_> {
        MethodWriter { state: &mut self.methods[self.current] }
    }

    pub fn writer_for(&mut self, method: usize) -> MethodWriter<'_> {
        MethodWriter { state: &mut self.methods[method] }
    }

    /// Assign the next shared-array slot, monotonically.
    pub fn assign_slot(&mut self) -> u16 {
        let slot = self.array_slots;
        self.array_slots += 1;
        slot
    }

    fn slot_cached(&self, method: usize, slot: u16) -> Option<u16> {
        self.methods[method].slot_regs.get(&slot).copied()
    }

    fn cache_slot(&mut self, method: usize, slot: u16, reg: u16) {
        self.methods[method].slot_regs.insert(slot, reg);
    }

    #[cfg(test)]
    fn group_count(&self, method: usize) -> usize {
        self.methods[method].groups
    }

    /// Seal the continuations and assemble the program: the array
    /// factory (one `new Object[N]`), then the entry method that sets
    /// the build-step name, allocates the array, and invokes every
    /// continuation in order.
    pub fn finish(mut self, name: String, version: String, step_name: String) -> StartupProgram {
        if self.methods.last().is_some_and(|m| m.groups == 0) {
            self.methods.pop();
        }

        let mut factory = StartupMethod::new("$create_array".to_string());
        factory.emit(Instruction::ab(Opcode::NewSharedArray, ARRAY_REG, self.array_slots));
        factory.emit(Instruction::a_only(Opcode::Return, ARRAY_REG));
        factory.locals = 1;

        let mut methods = vec![factory];
        let mut continuation_ids = vec![];
        for mut state in self.methods {
            state.body.emit(Instruction::a_only(Opcode::ReturnVoid, 0));
            state.body.locals = state.next_reg;
            continuation_ids.push(methods.len());
            methods.push(state.body);
        }

        let mut entry = StartupMethod::new("deploy".to_string());
        let step_idx = entry.add_constant(Constant::Str(step_name));
        entry.emit(Instruction::a_only(Opcode::SetStepName, step_idx));
        let factory_idx = entry.add_constant(Constant::Method(0));
        entry.emit(Instruction::ab(Opcode::Invoke, ARRAY_REG, factory_idx));
        for id in &continuation_ids {
            let m = entry.add_constant(Constant::Method(*id));
            entry.emit(Instruction::ab(Opcode::Invoke, ARRAY_REG, m));
        }
        entry.emit(Instruction::a_only(Opcode::ReturnVoid, 0));
        entry.locals = 1;

        debug!(
            "assembled {}: {} continuation(s), {} shared slot(s)",
            name,
            continuation_ids.len(),
            self.array_slots
        );

        StartupProgram {
            name,
            version,
            entry,
            methods,
            array_factory: 0,
            array_size: self.array_slots,
        }
    }
}

impl Default for SplitEmitter {
    fn default() -> Self {
        SplitEmitter::new()
    }
}

/// Drives the prepared graph into the emitter.
pub struct Assembler<'a> {
    pub graph: &'a mut DeferredGraph,
    pub emit: &'a mut SplitEmitter,
    pub loaders: &'a [Box<dyn ObjectLoader>],
    pub static_init: bool,
}

impl Assembler<'_> {
    /// Prepare a node as its own top-level instruction group. Inline and
    /// already-prepared nodes emit nothing.
    pub fn prepare_root(&mut self, id: NodeId) -> Result<(), RecorderError> {
        let needs_group = matches!(
            &self.graph.node(id).kind,
            NodeKind::Stored(s) if !s.prepared
        );
        if needs_group {
            self.emit.begin_group();
            self.prepare(id)?;
        }
        Ok(())
    }

    /// Idempotent: the creation fragment is emitted at most once, into
    /// whichever method is current on first preparation. Children
    /// prepared from inside a fragment join the current group.
    fn prepare(&mut self, id: NodeId) -> Result<(), RecorderError> {
        let plan = match &mut self.graph.node_mut(id).kind {
            NodeKind::Inline(_) => return Ok(()),
            NodeKind::Stored(state) => {
                if state.prepared {
                    return Ok(());
                }
                state.prepared = true;
                state.plan.clone()
            }
        };
        let plan = plan.ok_or_else(|| RecorderError::UnsupportedValue {
            value: "<deferred>".to_string(),
            ty: "<unknown>".to_string(),
            reason: "node has no construction plan".to_string(),
        })?;

        match plan {
            Plan::Construct { class, ctor, args, steps } => {
                for a in &args {
                    self.prepare(*a)?;
                }
                let dest = self.emit.writer().alloc_reg();
                self.load_args(dest, &args)?;
                let mut w = self.emit.writer();
                let c = w.constant(Constant::Ctor { class, ctor });
                w.emit(Instruction::new(Opcode::Construct, dest, c, args.len() as u16));
                self.record_creation(id, dest);
                self.run_steps(dest, &steps)?;
            }
            Plan::ConstructNoArg { class, steps } => {
                let mut w = self.emit.writer();
                let dest = w.alloc_reg();
                let c = w.constant(Constant::Type(class));
                w.emit(Instruction::ab(Opcode::NewObj, dest, c));
                self.record_creation(id, dest);
                self.run_steps(dest, &steps)?;
            }
            Plan::Container { family, steps } => {
                let mut w = self.emit.writer();
                let dest = w.alloc_reg();
                match family {
                    ContainerFamily::List => w.emit(Instruction::a_only(Opcode::NewList, dest)),
                    ContainerFamily::LinkedSet => {
                        w.emit(Instruction::ab(Opcode::NewSet, dest, container::LINKED))
                    }
                    ContainerFamily::SortedSet => {
                        w.emit(Instruction::ab(Opcode::NewSet, dest, container::SORTED))
                    }
                    ContainerFamily::LinkedMap => {
                        w.emit(Instruction::ab(Opcode::NewMap, dest, container::LINKED))
                    }
                    ContainerFamily::SortedMap => {
                        w.emit(Instruction::ab(Opcode::NewMap, dest, container::SORTED))
                    }
                }
                self.record_creation(id, dest);
                self.run_steps(dest, &steps)?;
            }
            Plan::NewArray { elem_type, elems } => {
                for e in &elems {
                    self.prepare(*e)?;
                }
                let mut w = self.emit.writer();
                let dest = w.alloc_reg();
                let t = w.constant(Constant::TypeExpr(elem_type));
                w.emit(Instruction::new(Opcode::NewArray, dest, elems.len() as u16, t));
                self.record_creation(id, dest);
                for (i, e) in elems.iter().enumerate() {
                    let r = self.load(*e)?;
                    self.emit
                        .writer()
                        .emit(Instruction::new(Opcode::SetIndex, dest, i as u16, r));
                }
            }
            Plan::Substituted { provider, serialized } => {
                self.prepare(serialized)?;
                let r = self.load(serialized)?;
                let mut w = self.emit.writer();
                let dest = w.alloc_reg();
                let p = w.constant(Constant::Str(provider));
                w.emit(Instruction::new(Opcode::Restore, dest, p, r));
                self.record_creation(id, dest);
            }
            Plan::SingletonList { elem } => {
                self.prepare(elem)?;
                let r = self.load(elem)?;
                let mut w = self.emit.writer();
                let dest = w.alloc_reg();
                w.emit(Instruction::ab(Opcode::MakeSingletonList, dest, r));
                self.record_creation(id, dest);
            }
            Plan::SingletonSet { elem } => {
                self.prepare(elem)?;
                let r = self.load(elem)?;
                let mut w = self.emit.writer();
                let dest = w.alloc_reg();
                w.emit(Instruction::ab(Opcode::MakeSingletonSet, dest, r));
                self.record_creation(id, dest);
            }
            Plan::SingletonMap { key, value } => {
                self.prepare(key)?;
                self.prepare(value)?;
                let rk = self.load(key)?;
                let rv = self.load(value)?;
                let mut w = self.emit.writer();
                let dest = w.alloc_reg();
                w.emit(Instruction::new(Opcode::MakeSingletonMap, dest, rk, rv));
                self.record_creation(id, dest);
            }
            Plan::OptionalOf { inner } => {
                self.prepare(inner)?;
                let r = self.load(inner)?;
                let mut w = self.emit.writer();
                let dest = w.alloc_reg();
                w.emit(Instruction::ab(Opcode::MakeOpt, dest, r));
                self.record_creation(id, dest);
            }
            Plan::ConstFragment { constant } => {
                let dest = self.emit.writer().load_const(constant);
                self.record_creation(id, dest);
            }
            Plan::Recorder { class, args } => {
                for a in &args {
                    self.prepare(*a)?;
                }
                let dest = self.emit.writer().alloc_reg();
                self.load_args(dest, &args)?;
                let mut w = self.emit.writer();
                let c = w.constant(Constant::Type(class));
                w.emit(Instruction::new(Opcode::NewRecorder, dest, c, args.len() as u16));
                self.record_creation(id, dest);
            }
            Plan::Loader { loader, value } => {
                let handler = self.loaders.get(loader).ok_or_else(|| {
                    RecorderError::UnsupportedValue {
                        value: value.to_string(),
                        ty: value.class_name(),
                        reason: "object loader is no longer registered".to_string(),
                    }
                })?;
                let dest = handler.emit(&mut self.emit.writer(), &value, self.static_init)?;
                self.record_creation(id, dest);
            }
        }
        Ok(())
    }

    fn record_creation(&mut self, id: NodeId, reg: u16) {
        let method = self.emit.current_index();
        if let NodeKind::Stored(state) = &mut self.graph.node_mut(id).kind {
            state.creation = Some((method, reg));
        }
    }

    /// Load already-prepared argument nodes into the consecutive
    /// registers a call-style instruction expects.
    fn load_args(&mut self, base: u16, args: &[NodeId]) -> Result<(), RecorderError> {
        for (j, a) in args.iter().enumerate() {
            let expected = base + 1 + j as u16;
            let r = self.load(*a)?;
            let mut w = self.emit.writer();
            if r != expected {
                w.ensure_reg(expected);
                w.emit(Instruction::ab(Opcode::Move, expected, r));
            }
        }
        Ok(())
    }

    fn run_steps(&mut self, owner: u16, steps: &[Step]) -> Result<(), RecorderError> {
        for step in steps {
            match step {
                Step::Add { value } => {
                    self.prepare(*value)?;
                    let r = self.load(*value)?;
                    self.emit.writer().emit(Instruction::ab(Opcode::Add, owner, r));
                }
                Step::Put { key, value } => {
                    self.prepare(*key)?;
                    self.prepare(*value)?;
                    let rk = self.load(*key)?;
                    let rv = self.load(*value)?;
                    self.emit.writer().emit(Instruction::new(Opcode::Put, owner, rk, rv));
                }
                Step::SetProp { name, value } => {
                    self.prepare(*value)?;
                    let r = self.load(*value)?;
                    let mut w = self.emit.writer();
                    let c = w.constant(Constant::Str(name.clone()));
                    w.emit(Instruction::new(Opcode::SetProp, owner, c, r));
                }
                Step::SetField { name, value } => {
                    self.prepare(*value)?;
                    let r = self.load(*value)?;
                    let mut w = self.emit.writer();
                    let c = w.constant(Constant::Str(name.clone()));
                    w.emit(Instruction::new(Opcode::SetField, owner, c, r));
                }
                Step::AddToExisting { property, values } => {
                    let container = {
                        let mut w = self.emit.writer();
                        let dest = w.alloc_reg();
                        let c = w.constant(Constant::Str(property.clone()));
                        w.emit(Instruction::new(Opcode::GetProp, dest, owner, c));
                        dest
                    };
                    for v in values {
                        self.prepare(*v)?;
                        let r = self.load(*v)?;
                        self.emit.writer().emit(Instruction::ab(Opcode::Add, container, r));
                    }
                }
                Step::PutToExisting { property, entries } => {
                    let container = {
                        let mut w = self.emit.writer();
                        let dest = w.alloc_reg();
                        let c = w.constant(Constant::Str(property.clone()));
                        w.emit(Instruction::new(Opcode::GetProp, dest, owner, c));
                        dest
                    };
                    for (k, v) in entries {
                        self.prepare(*k)?;
                        self.prepare(*v)?;
                        let rk = self.load(*k)?;
                        let rv = self.load(*v)?;
                        self.emit
                            .writer()
                            .emit(Instruction::new(Opcode::Put, container, rk, rv));
                    }
                }
            }
        }
        Ok(())
    }

    /// Produce a register holding the node's value in the current
    /// method. Inline nodes re-emit; stored nodes reuse their local
    /// register or go through the shared array.
    pub fn load(&mut self, id: NodeId) -> Result<u16, RecorderError> {
        enum Loaded {
            Inline(InlineValue),
            Stored { creation: Option<(usize, u16)>, array_index: Option<u16>, declared: Option<ignition_model::types::TypeExpr> },
        }
        let info = match &self.graph.node(id).kind {
            NodeKind::Inline(v) => Loaded::Inline(v.clone()),
            NodeKind::Stored(s) => Loaded::Stored {
                creation: s.creation,
                array_index: s.array_index,
                declared: s.declared_type.clone(),
            },
        };

        match info {
            Loaded::Inline(v) => {
                let mut w = self.emit.writer();
                Ok(match v {
                    InlineValue::Null => {
                        let r = w.alloc_reg();
                        w.emit(Instruction::a_only(Opcode::LoadNull, r));
                        r
                    }
                    InlineValue::Const(c) => w.load_const(c),
                    InlineValue::ContextLoad { key } => {
                        let r = w.alloc_reg();
                        let c = w.constant(Constant::Str(key));
                        w.emit(Instruction::ab(Opcode::GetCtx, r, c));
                        r
                    }
                    InlineValue::EmptyColl { family } => {
                        let r = w.alloc_reg();
                        w.emit(Instruction::ab(Opcode::MakeEmptyColl, r, family));
                        r
                    }
                    InlineValue::OptEmpty => {
                        let r = w.alloc_reg();
                        w.emit(Instruction::a_only(Opcode::MakeEmptyOpt, r));
                        r
                    }
                })
            }
            Loaded::Stored { creation, array_index, declared } => {
                let (creation_method, creation_reg) =
                    creation.ok_or_else(|| RecorderError::UnsupportedValue {
                        value: "<deferred>".to_string(),
                        ty: "<unknown>".to_string(),
                        reason: "value participates in an unresolvable constructor cycle"
                            .to_string(),
                    })?;
                let current = self.emit.current_index();
                if creation_method == current {
                    return Ok(creation_reg);
                }

                // First cross-method use assigns the slot and stashes the
                // value at the end of the creating method.
                let slot = match array_index {
                    Some(slot) => slot,
                    None => {
                        let slot = self.emit.assign_slot();
                        if let NodeKind::Stored(s) = &mut self.graph.node_mut(id).kind {
                            s.array_index = Some(slot);
                        }
                        self.emit
                            .writer_for(creation_method)
                            .emit(Instruction::ab(Opcode::ArrWrite, slot, creation_reg));
                        slot
                    }
                };

                if let Some(reg) = self.emit.slot_cached(current, slot) {
                    return Ok(reg);
                }
                let mut w = self.emit.writer();
                let t = match declared {
                    Some(ty) => w.constant(Constant::TypeExpr(ty)),
                    None => NO_TYPE,
                };
                let r = w.alloc_reg();
                w.emit(Instruction::new(Opcode::ArrRead, r, slot, t));
                self.emit.cache_slot(current, slot, r);
                Ok(r)
            }
        }
    }

    /// One recorded call: load the recorder and the prepared parameters
    /// into the teacher calling convention, dispatch, publish the result
    /// when the method returns one.
    pub fn emit_stored_call(
        &mut self,
        class: &str,
        method: &MethodDescriptor,
        recorder: NodeId,
        params: &[NodeId],
        publish_key: Option<&str>,
    ) -> Result<(), RecorderError> {
        self.prepare_root(recorder)?;
        for p in params {
            self.prepare_root(*p)?;
        }

        self.emit.begin_group();
        let rreg = self.load(recorder)?;
        let call_reg = {
            let mut w = self.emit.writer();
            let call_reg = w.alloc_reg();
            w.emit(Instruction::ab(Opcode::Move, call_reg, rreg));
            call_reg
        };
        self.load_args(call_reg, params)?;
        let mut w = self.emit.writer();
        let m = w.constant(Constant::MethodRef {
            class: class.to_string(),
            name: method.name.clone(),
        });
        w.emit(Instruction::new(Opcode::InvokeRecorder, call_reg, m, params.len() as u16));
        if let Some(key) = publish_key {
            let k = w.constant(Constant::Str(key.to_string()));
            w.emit(Instruction::ab(Opcode::PutCtx, k, call_reg));
        }
        Ok(())
    }

    /// One new-instance publication: no-arg construct, wrap in the
    /// runtime-value container, publish.
    pub fn emit_new_instance(&mut self, class: &str, key: &str) -> Result<(), RecorderError> {
        self.emit.begin_group();
        let mut w = self.emit.writer();
        let obj = w.alloc_reg();
        let c = w.constant(Constant::Type(class.to_string()));
        w.emit(Instruction::ab(Opcode::NewObj, obj, c));
        let wrapped = w.alloc_reg();
        w.emit(Instruction::ab(Opcode::WrapRuntime, wrapped, obj));
        let k = w.constant(Constant::Str(key.to_string()));
        w.emit(Instruction::ab(Opcode::PutCtx, k, wrapped));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_at_group_limit() {
        let mut e = SplitEmitter::new();
        for _ in 0..GROUP_LIMIT {
            e.begin_group();
        }
        assert_eq!(e.current_index(), 0);
        assert_eq!(e.group_count(0), GROUP_LIMIT);
        e.begin_group();
        assert_eq!(e.current_index(), 1);
        assert_eq!(e.group_count(1), 1);
    }

    #[test]
    fn test_slot_assignment_is_monotonic() {
        let mut e = SplitEmitter::new();
        assert_eq!(e.assign_slot(), 0);
        assert_eq!(e.assign_slot(), 1);
        assert_eq!(e.assign_slot(), 2);
    }

    #[test]
    fn test_finish_drops_trailing_empty_method() {
        let e = SplitEmitter::new();
        let program = e.finish("p".to_string(), "0".to_string(), "step.m".to_string());
        // Factory only; no continuations were needed.
        assert_eq!(program.methods.len(), 1);
        assert_eq!(program.array_size, 0);
        // deploy = set step name, create array, return.
        assert_eq!(program.entry.instructions.len(), 3);
    }

    #[test]
    fn test_cross_method_load_goes_through_array() {
        let mut graph = DeferredGraph::new();
        let id = graph.stored(None, "x").unwrap();
        graph.set_plan(id, Plan::ConstFragment { constant: Constant::Int(7) });
        let mut emitter = SplitEmitter::new();
        let loaders: Vec<Box<dyn ObjectLoader>> = vec![];
        let mut asm = Assembler {
            graph: &mut graph,
            emit: &mut emitter,
            loaders: &loaders,
            static_init: false,
        };

        asm.prepare_root(id).unwrap();
        let r1 = asm.load(id).unwrap();
        // Same method: the local register is reused, no slot assigned.
        assert_eq!(asm.load(id).unwrap(), r1);
        assert_eq!(asm.graph.slotted_count(), 0);

        // Force a split, then load again from the new method.
        for _ in 0..GROUP_LIMIT {
            asm.emit.begin_group();
        }
        asm.emit.begin_group();
        let r2 = asm.load(id).unwrap();
        assert_eq!(asm.graph.slotted_count(), 1);
        // Second load in the same method reuses the fetched register.
        assert_eq!(asm.load(id).unwrap(), r2);
    }
}
