/// The recorder façade: owns the recorded instruction list, the
/// extension hooks, and the emission that turns both into a startup
/// program.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use uuid::Uuid;

use ignition_model::registry::ClassRegistry;
use ignition_model::types::MethodDescriptor;
use ignition_model::value::{ProxyHandle, Value};
use ignition_model::SubstitutionProvider;

use crate::bundle;
use crate::emit::{Assembler, ObjectLoader, SplitEmitter};
use crate::error::RecorderError;
use crate::graph::{DeferredGraph, NodeId};
use crate::ir::StartupProgram;
use crate::proxy::{runtime_value_type, RecordingProxy};
use crate::serialize::Serializer;

/// Package prefix of generated program names.
pub const BASE_PACKAGE: &str = "ignition.generated";

/// Process-wide suffix source; program names are unique within a build.
static PROGRAM_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A registered substitution: record `from` values as `to`, deserialize
/// back through the named provider at startup.
pub(crate) struct Substitution {
    pub to_class: String,
    pub provider_name: String,
    pub provider: Rc<dyn SubstitutionProvider>,
}

pub(crate) struct NonDefaultCtor {
    pub ctor: usize,
    pub extractor: Box<dyn Fn(&Value) -> Vec<Value>>,
}

/// The extension hooks, owned per recorder.
#[derive(Default)]
pub struct Hooks {
    pub(crate) substitutions: HashMap<String, Substitution>,
    pub(crate) non_default_ctors: HashMap<String, NonDefaultCtor>,
    pub(crate) constants: HashMap<String, Value>,
    pub(crate) loaders: Vec<Box<dyn ObjectLoader>>,
    /// Synthetic class-proxy name -> original name.
    pub(crate) class_proxies: HashMap<String, String>,
    pub(crate) ctor_recordable: HashSet<String>,
}

/// One recorded build instruction.
pub(crate) enum BuildInstruction {
    StoredCall {
        class: String,
        method: MethodDescriptor,
        args: Vec<Value>,
        /// (context key, minted proxy) for non-void methods.
        proxy: Option<(String, Rc<ProxyHandle>)>,
    },
    NewInstance {
        class: String,
        key: String,
    },
}

pub(crate) struct RecorderInner {
    pub static_init: bool,
    /// True (the default) keys the dedup map on object identity; false
    /// switches string deduplication to value equality.
    pub identity_mode: bool,
    pub build_step: String,
    pub method_name: String,
    pub program_name: String,
    pub registry: Rc<ClassRegistry>,
    pub instructions: Vec<BuildInstruction>,
    pub proxies: HashMap<String, RecordingProxy>,
    pub hooks: Hooks,
}

/// Receives the finished program in its serialized bundle form.
pub trait ProgramOutput {
    fn write(&mut self, name: &str, bytes: &[u8]);
}

/// One recorder context per generated program family. Build steps
/// request recording proxies, call methods on them, then `finish` (or
/// `write_program`) emits the startup program.
pub struct StartupRecorder {
    inner: Rc<RefCell<RecorderInner>>,
}

impl StartupRecorder {
    pub fn new(
        static_init: bool,
        build_step: &str,
        method_name: &str,
        registry: Rc<ClassRegistry>,
    ) -> StartupRecorder {
        let suffix = PROGRAM_COUNTER.fetch_add(1, Ordering::Relaxed);
        let program_name =
            format!("{}.{}${}{:x}", BASE_PACKAGE, build_step, method_name, suffix);
        StartupRecorder {
            inner: Rc::new(RefCell::new(RecorderInner {
                static_init,
                identity_mode: true,
                build_step: build_step.to_string(),
                method_name: method_name.to_string(),
                program_name,
                registry,
                instructions: vec![],
                proxies: HashMap::new(),
                hooks: Hooks::default(),
            })),
        }
    }

    pub fn is_static_init(&self) -> bool {
        self.inner.borrow().static_init
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().instructions.is_empty()
    }

    /// Name of the generated program.
    pub fn program_name(&self) -> String {
        self.inner.borrow().program_name.clone()
    }

    /// Switch the argument dedup map to value-equality comparison.
    pub fn set_identity_comparison(&self, enabled: bool) {
        self.inner.borrow_mut().identity_mode = enabled;
    }

    /// The recording proxy for `class`; repeated calls return the same
    /// proxy.
    pub fn recording_proxy(&self, class: &str) -> Result<RecordingProxy, RecorderError> {
        let mut inner = self.inner.borrow_mut();
        if let Some(existing) = inner.proxies.get(class) {
            return Ok(existing.clone());
        }
        if !inner.registry.contains(class) {
            return Err(RecorderError::MissingClassDescriptor {
                class: class.to_string(),
                context: "recording proxy".to_string(),
            });
        }
        let proxy = RecordingProxy::new(class, Rc::downgrade(&self.inner));
        inner.proxies.insert(class.to_string(), proxy.clone());
        debug!("created recording proxy for {}", class);
        Ok(proxy)
    }

    /// Record "construct `class` by no-arg constructor, wrap it in a
    /// runtime value, publish it". Returns the handle for later calls.
    pub fn new_instance(&self, class: &str) -> Value {
        let mut inner = self.inner.borrow_mut();
        let key = format!("new-instance-{}", Uuid::new_v4().simple());
        let handle = Rc::new(ProxyHandle {
            key: key.clone(),
            static_init: inner.static_init,
            result_type: runtime_value_type(),
        });
        inner
            .instructions
            .push(BuildInstruction::NewInstance { class: class.to_string(), key });
        Value::Proxy(handle)
    }

    /// A stand-in class reference for a class that only becomes loadable
    /// at startup; the original name is restored during emission.
    pub fn class_proxy(&self, original: &str) -> Value {
        let mut inner = self.inner.borrow_mut();
        let synthetic = format!("ignition$$ClassProxy${}", inner.hooks.class_proxies.len());
        inner.hooks.class_proxies.insert(synthetic.clone(), original.to_string());
        Value::class_ref(&synthetic)
    }

    pub fn register_substitution(
        &self,
        from: &str,
        to: &str,
        provider_name: &str,
        provider: Rc<dyn SubstitutionProvider>,
    ) {
        self.inner.borrow_mut().hooks.substitutions.insert(
            from.to_string(),
            Substitution {
                to_class: to.to_string(),
                provider_name: provider_name.to_string(),
                provider,
            },
        );
    }

    /// Use constructor `ctor` of `class` at startup; the extractor
    /// produces its ordered arguments from the recorded object.
    pub fn register_non_default_constructor(
        &self,
        class: &str,
        ctor: usize,
        extractor: Box<dyn Fn(&Value) -> Vec<Value>>,
    ) {
        self.inner
            .borrow_mut()
            .hooks
            .non_default_ctors
            .insert(class.to_string(), NonDefaultCtor { ctor, extractor });
    }

    pub fn register_object_loader(&self, loader: Box<dyn ObjectLoader>) {
        self.inner.borrow_mut().hooks.loaders.push(loader);
    }

    /// Injection points of `type_name` receive this value.
    pub fn register_constant(&self, type_name: &str, value: Value) {
        self.inner.borrow_mut().hooks.constants.insert(type_name.to_string(), value);
    }

    pub fn mark_constructor_recordable(&self, class: &str) {
        self.inner.borrow_mut().hooks.ctor_recordable.insert(class.to_string());
    }

    /// Emit the startup program. Each call rebuilds the deferred graph
    /// from the recorded history, so emitting twice yields identical
    /// output.
    pub fn finish(&self) -> Result<StartupProgram, RecorderError> {
        let inner = self.inner.borrow();

        let mut graph = DeferredGraph::new();
        let mut recorder_nodes: Vec<(String, NodeId)> = vec![];
        let mut params: Vec<Vec<NodeId>> = Vec::with_capacity(inner.instructions.len());
        {
            let mut ser = Serializer {
                graph: &mut graph,
                registry: &inner.registry,
                hooks: &inner.hooks,
                identity_mode: inner.identity_mode,
                static_init: inner.static_init,
            };
            for instr in &inner.instructions {
                match instr {
                    BuildInstruction::StoredCall { class, method, args, .. } => {
                        if !recorder_nodes.iter().any(|(c, _)| c == class) {
                            let node = ser.serialize_recorder(class)?;
                            recorder_nodes.push((class.clone(), node));
                        }
                        let mut nodes = Vec::with_capacity(args.len());
                        for (arg, p) in args.iter().zip(method.params.iter()) {
                            nodes.push(ser.serialize(arg, &p.ty, p.relaxed)?);
                        }
                        params.push(nodes);
                    }
                    BuildInstruction::NewInstance { .. } => params.push(vec![]),
                }
            }
        }
        graph.load_complete = true;

        let mut emitter = SplitEmitter::new();
        {
            let mut asm = Assembler {
                graph: &mut graph,
                emit: &mut emitter,
                loaders: &inner.hooks.loaders,
                static_init: inner.static_init,
            };
            for (i, instr) in inner.instructions.iter().enumerate() {
                match instr {
                    BuildInstruction::StoredCall { class, method, proxy, .. } => {
                        let recorder = recorder_nodes
                            .iter()
                            .find(|(c, _)| c == class)
                            .map(|(_, n)| *n)
                            .ok_or_else(|| RecorderError::MissingClassDescriptor {
                                class: class.clone(),
                                context: "recorded call emission".to_string(),
                            })?;
                        asm.emit_stored_call(
                            class,
                            method,
                            recorder,
                            &params[i],
                            proxy.as_ref().map(|(k, _)| k.as_str()),
                        )?;
                    }
                    BuildInstruction::NewInstance { class, key } => {
                        let resolved = inner
                            .hooks
                            .class_proxies
                            .get(class)
                            .cloned()
                            .unwrap_or_else(|| class.clone());
                        asm.emit_new_instance(&resolved, key)?;
                    }
                }
            }
        }

        let program = emitter.finish(
            inner.program_name.clone(),
            crate::ENGINE_VERSION.to_string(),
            format!("{}.{}", inner.build_step, inner.method_name),
        );
        debug!(
            "emitted {}: {} instruction(s), {} deferred node(s), {} shared slot(s)",
            program.name,
            inner.instructions.len(),
            graph.len(),
            program.array_size
        );
        Ok(program)
    }

    /// Emit and hand the serialized bundle to the output sink.
    pub fn write_program(&self, out: &mut dyn ProgramOutput) -> Result<(), RecorderError> {
        let program = self.finish()?;
        let mut bytes = Vec::new();
        bundle::write_bundle(&mut bytes, &program)?;
        out.write(&program.name, &bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ignition_model::registry::{ClassDef, CtorDef};
    use ignition_model::types::{ParamSpec, TypeExpr};
    use crate::emit::GROUP_LIMIT;
    use crate::ir::Opcode;

    fn greeter_registry() -> Rc<ClassRegistry> {
        let mut reg = ClassRegistry::new();
        let mut rec = ClassDef::new("GreetRecorder");
        rec.ctors.push(CtorDef::no_arg());
        rec.methods.push(MethodDescriptor::new(
            "GreetRecorder",
            "greet",
            vec![ParamSpec::of(TypeExpr::raw("string")), ParamSpec::of(TypeExpr::raw("int"))],
            TypeExpr::void(),
        ));
        reg.register(rec);
        Rc::new(reg)
    }

    #[test]
    fn test_empty_recorder_emits_empty_deploy() {
        let recorder = StartupRecorder::new(false, "step", "build", greeter_registry());
        assert!(recorder.is_empty());
        let program = recorder.finish().unwrap();
        // Set step name, allocate the array, return: no recorded actions.
        assert_eq!(program.entry.instructions.len(), 3);
        assert_eq!(program.array_size, 0);
    }

    #[test]
    fn test_recording_proxy_is_cached() {
        let recorder = StartupRecorder::new(false, "step", "build", greeter_registry());
        let a = recorder.recording_proxy("GreetRecorder").unwrap();
        let b = recorder.recording_proxy("GreetRecorder").unwrap();
        a.invoke("greet", vec![Value::str("hi"), Value::Int(7)]).unwrap();
        b.invoke("greet", vec![Value::str("ho"), Value::Int(8)]).unwrap();
        assert_eq!(recorder.inner.borrow().instructions.len(), 2);
    }

    #[test]
    fn test_program_names_are_unique() {
        let reg = greeter_registry();
        let a = StartupRecorder::new(false, "step", "build", Rc::clone(&reg));
        let b = StartupRecorder::new(false, "step", "build", reg);
        assert_ne!(a.program_name(), b.program_name());
    }

    #[test]
    fn test_double_emission_is_identical() {
        let recorder = StartupRecorder::new(false, "step", "build", greeter_registry());
        let proxy = recorder.recording_proxy("GreetRecorder").unwrap();
        proxy.invoke("greet", vec![Value::str("hi"), Value::Int(7)]).unwrap();

        let first = serde_json::to_vec(&recorder.finish().unwrap()).unwrap();
        let second = serde_json::to_vec(&recorder.finish().unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_many_calls_split_into_continuations() {
        let recorder = StartupRecorder::new(false, "step", "build", greeter_registry());
        let proxy = recorder.recording_proxy("GreetRecorder").unwrap();
        for i in 0..(GROUP_LIMIT as i64 + 10) {
            proxy.invoke("greet", vec![Value::str("x"), Value::Int(i)]).unwrap();
        }
        let program = recorder.finish().unwrap();
        // Factory + at least two continuations.
        assert!(program.methods.len() >= 3, "expected a split, got {}", program.methods.len());
        // The recorder instance is created once and crosses methods via
        // the shared array.
        let news: usize = program
            .methods
            .iter()
            .map(|m| {
                m.instructions
                    .iter()
                    .filter(|i| matches!(i.opcode, Opcode::NewRecorder))
                    .count()
            })
            .sum();
        assert_eq!(news, 1);
        assert!(program.array_size >= 1);
    }

    #[test]
    fn test_oversized_string_is_rejected() {
        let recorder = StartupRecorder::new(false, "step", "build", greeter_registry());
        let proxy = recorder.recording_proxy("GreetRecorder").unwrap();
        let ok = "a".repeat(crate::MAX_STRING_BYTES);
        proxy.invoke("greet", vec![Value::str(&ok), Value::Int(1)]).unwrap();
        recorder.finish().unwrap();

        let recorder = StartupRecorder::new(false, "step", "build", greeter_registry());
        let proxy = recorder.recording_proxy("GreetRecorder").unwrap();
        let too_long = "a".repeat(crate::MAX_STRING_BYTES + 1);
        proxy.invoke("greet", vec![Value::str(&too_long), Value::Int(1)]).unwrap();
        let err = recorder.finish().unwrap_err();
        assert!(matches!(err, RecorderError::StringTooLong { .. }));
    }
}
