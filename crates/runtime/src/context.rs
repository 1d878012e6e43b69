/// The startup context: a string-keyed value registry plus the runtime
/// collaborators an emitted program needs — recorder factories, the
/// class registry (the class-loader stand-in), and substitution
/// providers.

use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;

use ignition_model::registry::ClassRegistry;
use ignition_model::value::Value;
use ignition_model::{RecorderDispatch, SubstitutionProvider};

/// Builds one live recorder from its injected constructor arguments.
pub type RecorderFactory = Box<dyn Fn(Vec<Value>) -> Result<Box<dyn RecorderDispatch>, String>>;

pub struct StartupContext {
    values: IndexMap<String, Value>,
    current_build_step_name: String,
    recorders: HashMap<String, RecorderFactory>,
    providers: HashMap<String, Rc<dyn SubstitutionProvider>>,
    registry: Rc<ClassRegistry>,
}

impl StartupContext {
    pub fn new(registry: Rc<ClassRegistry>) -> StartupContext {
        StartupContext {
            values: IndexMap::new(),
            current_build_step_name: String::new(),
            recorders: HashMap::new(),
            providers: HashMap::new(),
            registry,
        }
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    pub fn put_value(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn set_current_build_step_name(&mut self, name: &str) {
        self.current_build_step_name = name.to_string();
    }

    pub fn current_build_step_name(&self) -> &str {
        &self.current_build_step_name
    }

    pub fn register_recorder(&mut self, class: &str, factory: RecorderFactory) {
        self.recorders.insert(class.to_string(), factory);
    }

    pub fn register_provider(&mut self, name: &str, provider: Rc<dyn SubstitutionProvider>) {
        self.providers.insert(name.to_string(), provider);
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    pub(crate) fn make_recorder(
        &self,
        class: &str,
        args: Vec<Value>,
    ) -> Result<Box<dyn RecorderDispatch>, String> {
        let factory = self
            .recorders
            .get(class)
            .ok_or_else(|| format!("no recorder factory registered for {}", class))?;
        factory(args)
    }

    pub(crate) fn provider(&self, name: &str) -> Option<Rc<dyn SubstitutionProvider>> {
        self.providers.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_registry() {
        let mut ctx = StartupContext::new(Rc::new(ClassRegistry::new()));
        assert!(ctx.get_value("k").is_none());
        ctx.put_value("k", Value::Int(3));
        assert_eq!(ctx.get_value("k"), Some(Value::Int(3)));
    }

    #[test]
    fn test_step_name() {
        let mut ctx = StartupContext::new(Rc::new(ClassRegistry::new()));
        ctx.set_current_build_step_name("steps.CoreStep.build");
        assert_eq!(ctx.current_build_step_name(), "steps.CoreStep.build");
    }

    #[test]
    fn test_missing_recorder_factory() {
        let ctx = StartupContext::new(Rc::new(ClassRegistry::new()));
        let err = match ctx.make_recorder("Nope", vec![]) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.contains("no recorder factory"));
    }
}
