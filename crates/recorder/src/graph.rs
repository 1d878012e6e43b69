/// Deferred-parameter graph.
///
/// Every argument observed during recording is lowered into a node
/// describing how to reconstruct it at startup. Nodes live in an
/// id-addressed arena and form a DAG through identity-keyed
/// deduplication: an argument object appears at most once per emission,
/// so shared subgraphs are materialized once and reference identity
/// survives replay.

use std::collections::HashMap;

use ignition_model::types::TypeExpr;
use ignition_model::value::Value;

use crate::error::RecorderError;
use crate::ir::Constant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// Deduplication key for the identity map. `Ptr` is the default
/// (object identity); `Text` keys strings when value-equality
/// deduplication is configured; `Scalar` keys boxed scalars that fall
/// through to the complex path, mirroring a boxed-value cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    Ptr(usize),
    Text(String),
    Scalar { tag: u8, bits: u64 },
}

/// An inline node re-emits its value at every use site.
#[derive(Debug, Clone)]
pub enum InlineValue {
    Null,
    Const(Constant),
    /// A return-value proxy: read the published value from the context.
    ContextLoad { key: String },
    /// One of the shared immutable empty collections (`ir::family`).
    EmptyColl { family: u16 },
    OptEmpty,
}

/// Fallback container families for the complex-object path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFamily {
    List,
    LinkedSet,
    SortedSet,
    LinkedMap,
    SortedMap,
}

/// A population step that runs after its owner's construction. Steps do
/// the linking, which is what lets cyclic values reconstruct: by the
/// time steps run, the owner already has a register.
#[derive(Debug, Clone)]
pub enum Step {
    Add { value: NodeId },
    Put { key: NodeId, value: NodeId },
    SetProp { name: String, value: NodeId },
    SetField { name: String, value: NodeId },
    /// Getter-only collection property: add into the container the
    /// constructed object already holds. Elements already present in the
    /// fresh container are not deduplicated against the recorded ones.
    AddToExisting { property: String, values: Vec<NodeId> },
    /// Getter-only map property.
    PutToExisting { property: String, entries: Vec<(NodeId, NodeId)> },
}

/// How an array-stored node creates its value.
#[derive(Debug, Clone)]
pub enum Plan {
    /// Call constructor `ctor` of `class` with recursed args, then steps.
    Construct { class: String, ctor: usize, args: Vec<NodeId>, steps: Vec<Step> },
    /// No-arg construction on the concrete class, then steps.
    ConstructNoArg { class: String, steps: Vec<Step> },
    /// Fallback container, then population steps.
    Container { family: ContainerFamily, steps: Vec<Step> },
    NewArray { elem_type: TypeExpr, elems: Vec<NodeId> },
    /// Provider deserializes the recursed serialized form at startup.
    Substituted { provider: String, serialized: NodeId },
    SingletonList { elem: NodeId },
    SingletonSet { elem: NodeId },
    SingletonMap { key: NodeId, value: NodeId },
    OptionalOf { inner: NodeId },
    /// A single pool constant (boxed scalars, URLs, durations, types).
    ConstFragment { constant: Constant },
    /// A recorder instance with its injected constructor arguments.
    Recorder { class: String, args: Vec<NodeId> },
    /// A registered object loader emits the creation fragment.
    Loader { loader: usize, value: Value },
}

/// State of an array-stored node. The creation fragment runs at most
/// once; the slot index is assigned at most once, on the first load from
/// a method other than the creating one.
#[derive(Debug)]
pub struct StoredState {
    pub plan: Option<Plan>,
    /// Cast target for cross-method reads, when one is known.
    pub declared_type: Option<TypeExpr>,
    pub prepared: bool,
    /// (method index, local register) of the emitted creation fragment.
    pub creation: Option<(usize, u16)>,
    pub array_index: Option<u16>,
}

#[derive(Debug)]
pub enum NodeKind {
    Inline(InlineValue),
    Stored(StoredState),
}

#[derive(Debug)]
pub struct DeferredNode {
    pub kind: NodeKind,
}

/// The per-emission node arena plus the identity map.
#[derive(Debug, Default)]
pub struct DeferredGraph {
    nodes: Vec<DeferredNode>,
    dedup: HashMap<DedupKey, NodeId>,
    /// Once emission begins no new node may be created.
    pub load_complete: bool,
}

impl DeferredGraph {
    pub fn new() -> DeferredGraph {
        DeferredGraph::default()
    }

    fn check_open(&self, what: &str) -> Result<(), RecorderError> {
        if self.load_complete {
            return Err(RecorderError::LateAllocation { value: what.to_string() });
        }
        Ok(())
    }

    pub fn inline(&mut self, value: InlineValue, what: &str) -> Result<NodeId, RecorderError> {
        self.check_open(what)?;
        let id = NodeId(self.nodes.len());
        self.nodes.push(DeferredNode { kind: NodeKind::Inline(value) });
        Ok(id)
    }

    /// Allocate a stored node whose plan is filled in later; the node
    /// must exist (and be in the identity map) before its children are
    /// serialized, or self-referential values could not terminate.
    pub fn stored(
        &mut self,
        declared_type: Option<TypeExpr>,
        what: &str,
    ) -> Result<NodeId, RecorderError> {
        self.check_open(what)?;
        let id = NodeId(self.nodes.len());
        self.nodes.push(DeferredNode {
            kind: NodeKind::Stored(StoredState {
                plan: None,
                declared_type,
                prepared: false,
                creation: None,
                array_index: None,
            }),
        });
        Ok(id)
    }

    pub fn set_plan(&mut self, id: NodeId, plan: Plan) {
        if let NodeKind::Stored(state) = &mut self.nodes[id.0].kind {
            state.plan = Some(plan);
        }
    }

    pub fn node(&self, id: NodeId) -> &DeferredNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut DeferredNode {
        &mut self.nodes[id.0]
    }

    pub fn lookup(&self, key: &DedupKey) -> Option<NodeId> {
        self.dedup.get(key).copied()
    }

    pub fn remember(&mut self, key: DedupKey, id: NodeId) {
        self.dedup.insert(key, id);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of nodes that were parked in the shared object array.
    pub fn slotted_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(&n.kind, NodeKind::Stored(s) if s.array_index.is_some()))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_dedup() {
        let mut g = DeferredGraph::new();
        let key = DedupKey::Ptr(0x1000);
        assert!(g.lookup(&key).is_none());
        let id = g.stored(None, "x").unwrap();
        g.remember(key.clone(), id);
        assert_eq!(g.lookup(&key), Some(id));
    }

    #[test]
    fn test_late_allocation_guard() {
        let mut g = DeferredGraph::new();
        g.load_complete = true;
        let err = g.inline(InlineValue::Null, "late").unwrap_err();
        assert!(matches!(err, RecorderError::LateAllocation { .. }));
    }

    #[test]
    fn test_plan_fill_after_alloc() {
        let mut g = DeferredGraph::new();
        let id = g.stored(Some(TypeExpr::raw("list")), "list").unwrap();
        g.set_plan(id, Plan::Container { family: ContainerFamily::List, steps: vec![] });
        match &g.node(id).kind {
            NodeKind::Stored(s) => assert!(s.plan.is_some()),
            _ => panic!("expected stored node"),
        }
    }
}
