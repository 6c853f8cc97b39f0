use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use ulid::Ulid;

use crate::arena::FieldId;
use crate::error::GraphError;
use crate::field::Access;
use crate::graph::Graph;

/// Identity of a scene-graph node. Presented to access checks as the
/// caller; a field's owner passes them all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Ulid);

impl NodeId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub(crate) fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Registry entry for one node: its type name, lifecycle flag, and the
/// fields it owns in declaration order.
pub struct NodeInfo {
    pub(crate) type_name: Arc<str>,
    pub(crate) initialized: bool,
    pub(crate) fields: IndexMap<Arc<str>, FieldId>,
    pub(crate) cache: Option<FieldId>,
}

impl NodeInfo {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, FieldId)> {
        self.fields.iter().map(|(name, &id)| (&**name, id))
    }

    /// The node's draw cache field, if one was attached.
    pub fn cache(&self) -> Option<FieldId> {
        self.cache
    }
}

#[derive(Default)]
pub(crate) struct NodeRegistry {
    nodes: FxHashMap<NodeId, NodeInfo>,
}

impl NodeRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, id: NodeId, type_name: &str) {
        self.nodes.insert(
            id,
            NodeInfo {
                type_name: type_name.into(),
                initialized: false,
                fields: IndexMap::new(),
                cache: None,
            },
        );
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut NodeInfo> {
        self.nodes.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: NodeId) -> Option<NodeInfo> {
        self.nodes.remove(&id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (NodeId, &NodeInfo)> {
        self.nodes.iter().map(|(&id, info)| (id, info))
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }
}

impl Graph {
    /// Register a node and return its identity. Fields added with this
    /// owner land in the node's field table.
    pub fn register_node(&mut self, type_name: &str) -> NodeId {
        let id = NodeId::new();
        self.registry.insert(id, type_name);
        id
    }

    /// Close the node's setup window. From here on its initialize-only
    /// fields reject writes from anyone but the owner.
    pub fn mark_initialized(&mut self, node: NodeId) {
        if let Some(info) = self.registry.get_mut(node) {
            info.initialized = true;
        }
    }

    pub fn is_initialized(&self, node: NodeId) -> bool {
        self.registry.get(node).is_some_and(|info| info.initialized)
    }

    pub fn node_info(&self, node: NodeId) -> Option<&NodeInfo> {
        self.registry.get(node)
    }

    pub fn node_cache(&self, node: NodeId) -> Option<FieldId> {
        self.registry.get(node).and_then(|info| info.cache)
    }

    pub fn node_count(&self) -> usize {
        self.registry.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &NodeInfo)> {
        self.registry.iter()
    }

    /// Look up a field by name. When no field matches exactly, `set_foo`
    /// and `foo_changed` fall back to a field named `foo`, but only if that
    /// field is INPUT_OUTPUT; directional fields are never reachable
    /// through the sugar.
    pub fn node_field(&self, node: NodeId, name: &str) -> Result<FieldId, GraphError> {
        let info = self
            .registry
            .get(node)
            .ok_or(GraphError::UnknownNode(node))?;
        if let Some(&id) = info.fields.get(name) {
            return Ok(id);
        }
        let base = name
            .strip_prefix("set_")
            .or_else(|| name.strip_suffix("_changed"));
        if let Some(base) = base {
            if let Some(&id) = info.fields.get(base) {
                let open = self
                    .arena
                    .get(id)
                    .is_some_and(|slot| slot.access == Access::InputOutput);
                if open {
                    return Ok(id);
                }
            }
        }
        Err(GraphError::UnknownField {
            node: info.type_name.to_string(),
            name: name.to_string(),
        })
    }

    /// Drop a node and every field it owns.
    pub fn remove_node(&mut self, node: NodeId) {
        let owned: Vec<FieldId> = match self.registry.get(node) {
            Some(info) => info.fields.values().copied().collect(),
            None => return,
        };
        for f in owned {
            self.remove_field(f);
        }
        self.registry.remove(node);
    }
}
