/// Build-phase failures. Every recording or emission failure is
/// synchronous and fatal for the build step that caused it; each variant
/// names the offending method, class, or value so build logs point at the
/// source.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error(
        "cannot be proxied: {method} returns {ty}; recorder methods must return void, \
         a proxiable class, or a runtime value"
    )]
    UnrecordableReturn { method: String, ty: String },

    #[error("runtime-phase proxy {key} cannot be consumed by static-init recorder method {method}")]
    CrossPhaseProxy { key: String, method: String },

    #[error("unsupported recorded value {value} of type {ty}: {reason}")]
    UnsupportedValue { value: String, ty: String, reason: String },

    #[error("string of {len} bytes exceeds the 65535-byte limit")]
    StringTooLong { len: usize },

    #[error("class {class} has {count} equally wide public constructors; register or mark one")]
    AmbiguousConstructor { class: String, count: usize },

    #[error("constructor parameter {index} of {class} carries no name metadata")]
    MissingParameterNames { class: String, index: usize },

    #[error("property {property} of {class}: {reason}")]
    PropertyInconsistency { class: String, property: String, reason: String },

    #[error("constructor parameter(s) {params} of {class} match no readable property or public field")]
    UnusedConstructorParameter { class: String, params: String },

    #[error("no registered constant can supply injected parameter {param} of recorder {class}")]
    LoaderAbsent { class: String, param: String },

    #[error("cannot record new value {value}: emission has already begun")]
    LateAllocation { value: String },

    #[error("{method} cannot be invoked directly on a returned value; pass it back into the recorder")]
    DirectProxyCall { method: String },

    #[error("no descriptor registered for class {class} (required by {context})")]
    MissingClassDescriptor { class: String, context: String },

    #[error("bundle i/o failed: {0}")]
    Bundle(#[from] std::io::Error),
}
