/// Recording proxies and return-value proxies.
///
/// A recording proxy is the build step's handle on a recorder class:
/// every `invoke` is logged instead of executed. Non-void methods hand
/// back a return-value proxy — an opaque stand-in keyed into the startup
/// context — which the build step can only pass back into a recorder.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};
use std::cell::RefCell;

use log::debug;
use uuid::Uuid;

use ignition_model::registry::ClassRegistry;
use ignition_model::types::{is_primitive, primitive, MethodDescriptor, TypeExpr};
use ignition_model::value::{ProxyHandle, Value};
use ignition_model::RUNTIME_VALUE_CLASS;

use crate::error::RecorderError;
use crate::recorder::{BuildInstruction, RecorderInner};

/// A recording proxy for one recorder class. Cloning shares the proxy;
/// repeated requests for the same class return the same one.
#[derive(Clone)]
pub struct RecordingProxy {
    class: String,
    inner: Weak<RefCell<RecorderInner>>,
}

impl RecordingProxy {
    pub(crate) fn new(class: &str, inner: Weak<RefCell<RecorderInner>>) -> RecordingProxy {
        RecordingProxy { class: class.to_string(), inner }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// The interceptor. Logs the call; for non-void methods mints and
    /// returns a fresh return-value proxy.
    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, RecorderError> {
        let inner = self.inner.upgrade().ok_or_else(|| RecorderError::UnsupportedValue {
            value: format!("recorder proxy {}", self.class),
            ty: self.class.clone(),
            reason: "the recorder context is gone".to_string(),
        })?;
        let mut inner = inner.borrow_mut();

        let desc: MethodDescriptor = inner
            .registry
            .lookup(&self.class)
            .and_then(|d| d.method(method))
            .cloned()
            .ok_or_else(|| RecorderError::MissingClassDescriptor {
                class: self.class.clone(),
                context: format!("recorder method {}", method),
            })?;

        if args.len() != desc.params.len() {
            return Err(RecorderError::UnsupportedValue {
                value: format!("{} argument(s)", args.len()),
                ty: self.class.clone(),
                reason: format!("{} declares {} parameter(s)", desc, desc.params.len()),
            });
        }

        // A static-init program runs before runtime-phase values exist.
        if inner.static_init {
            for arg in &args {
                if let Value::Proxy(p) = arg {
                    if !p.static_init {
                        return Err(RecorderError::CrossPhaseProxy {
                            key: p.key.clone(),
                            method: desc.id(),
                        });
                    }
                }
            }
        }

        let minted = if desc.returns_void() {
            None
        } else {
            check_proxiable(&desc, &inner.registry)?;
            let key = format!("proxy-{}", Uuid::new_v4().simple());
            let handle = Rc::new(ProxyHandle {
                key: key.clone(),
                static_init: inner.static_init,
                result_type: desc.ret.clone(),
            });
            Some((key, handle))
        };

        debug!("recorded {} ({} argument(s))", desc.id(), args.len());

        let ret = match &minted {
            Some((_, handle)) => Value::Proxy(Rc::clone(handle)),
            None => Value::Null,
        };
        inner.instructions.push(BuildInstruction::StoredCall {
            class: self.class.clone(),
            method: desc,
            args,
            proxy: minted,
        });
        Ok(ret)
    }
}

/// A return type is proxiable when it is not primitive, not final, and —
/// for a concrete registered class — carries a no-arg constructor. The
/// runtime-value wrapper is always proxiable.
fn check_proxiable(
    desc: &MethodDescriptor,
    registry: &ClassRegistry,
) -> Result<(), RecorderError> {
    let unrecordable = || RecorderError::UnrecordableReturn {
        method: desc.id(),
        ty: desc.ret.to_string(),
    };

    let raw = match desc.ret.raw_name() {
        Some(raw) => raw,
        None => return Err(unrecordable()),
    };
    if raw == RUNTIME_VALUE_CLASS || raw == primitive::OBJECT {
        return Ok(());
    }
    // Primitives and strings are final; neither can be subclassed into a
    // proxy.
    if is_primitive(raw) || raw == primitive::STRING {
        return Err(unrecordable());
    }
    let def = registry.lookup(raw).ok_or_else(|| RecorderError::MissingClassDescriptor {
        class: raw.to_string(),
        context: format!("return type of {}", desc.id()),
    })?;
    if def.final_class {
        return Err(unrecordable());
    }
    if !def.interface && !def.has_no_arg_ctor() {
        return Err(unrecordable());
    }
    Ok(())
}

/// The only methods a returned value answers. Everything else is a
/// direct-call error: the value does not exist yet.
pub fn invoke_returned(
    proxy: &Rc<ProxyHandle>,
    method: &str,
    args: &[Value],
) -> Result<Value, RecorderError> {
    match method {
        "toString" => Ok(Value::str(&proxy.to_string())),
        "hashCode" => {
            let mut hasher = DefaultHasher::new();
            proxy.key.hash(&mut hasher);
            Ok(Value::Int(hasher.finish() as i64))
        }
        "equals" => Ok(Value::Bool(matches!(
            args.first(),
            Some(Value::Proxy(other)) if Rc::ptr_eq(proxy, other)
        ))),
        "key" => Ok(Value::str(&proxy.key)),
        "isStaticInit" => Ok(Value::Bool(proxy.static_init)),
        other => Err(RecorderError::DirectProxyCall { method: format!("{} on {}", other, proxy) }),
    }
}

/// Mint the result type helper for tests and the recorder façade.
pub(crate) fn runtime_value_type() -> TypeExpr {
    TypeExpr::raw(RUNTIME_VALUE_CLASS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(key: &str, static_init: bool) -> Rc<ProxyHandle> {
        Rc::new(ProxyHandle {
            key: key.to_string(),
            static_init,
            result_type: TypeExpr::object(),
        })
    }

    #[test]
    fn test_returned_proxy_allows_tagging_methods() {
        let p = handle("k7", true);
        assert_eq!(invoke_returned(&p, "key", &[]).unwrap(), Value::str("k7"));
        assert_eq!(invoke_returned(&p, "isStaticInit", &[]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_returned_proxy_equals_is_identity() {
        let p = handle("k", false);
        let same = Rc::clone(&p);
        let other = handle("k", false);
        assert_eq!(
            invoke_returned(&p, "equals", &[Value::Proxy(same)]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            invoke_returned(&p, "equals", &[Value::Proxy(other)]).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_returned_proxy_rejects_direct_calls() {
        let p = handle("k", false);
        let err = invoke_returned(&p, "fetchData", &[]).unwrap_err();
        assert!(matches!(err, RecorderError::DirectProxyCall { .. }));
        assert!(err.to_string().contains("pass it back into the recorder"));
    }
}
