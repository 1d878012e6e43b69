/// Ignition Model - shared vocabulary for the recording engine and the
/// startup runtime: the value model, type expressions, class descriptors,
/// and the traits both phases agree on.

pub mod types;
pub mod value;
pub mod registry;

pub use types::{MethodDescriptor, ParamSpec, TypeExpr};
pub use value::Value;

/// Class name of the library-provided runtime-value wrapper. A recorder
/// method whose declared return type cannot be proxied must return this
/// wrapper (or void) instead.
pub const RUNTIME_VALUE_CLASS: &str = "ignition.RuntimeValue";

/// A recorder as the startup program sees it: a capability that executes
/// one recorded method at a time. Build-time recording proxies implement
/// the same shape by logging instead of executing.
pub trait RecorderDispatch {
    /// Execute `method` with the reconstructed arguments. Void methods
    /// return `Value::Null`.
    fn dispatch(&mut self, method: &str, args: Vec<Value>) -> Result<Value, String>;
}

/// Two-way conversion that makes an otherwise-unsupported type recordable:
/// `serialize` runs at build time, `deserialize` at startup.
pub trait SubstitutionProvider {
    fn serialize(&self, from: &Value) -> Result<Value, String>;
    fn deserialize(&self, to: Value) -> Result<Value, String>;
}
