//! Snapshot system for state persistence.
//!
//! Captures the reactive graph (fields, values, routes, pending events,
//! nodes, cache bookkeeping) into a serializable form and rebuilds a
//! graph from it. Closures are code, not data: map rules and render
//! callbacks come back unbound and are re-attached with
//! [`Graph::set_rule`] and [`Graph::set_cache_render`]. Draw artifacts
//! are backend-owned and never persisted; restored caches start invalid
//! and rebuild on the next replay call.
//!
//! Note: JSON serialization requires the `cli` feature.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::arena::FieldId;
use crate::cache::{CacheMode, CacheState};
use crate::field::{Access, FieldDef, FieldKind, UpdateRule};
use crate::graph::Graph;
use crate::node::NodeId;
use crate::value::{TypeTag, Value};

/// A serializable snapshot of the reactive graph state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// Version for migration support
    pub version: u32,
    /// Field records keyed by "indexvgeneration". String keys because
    /// JSON requires string keys in maps.
    pub fields: HashMap<String, FieldSnapshot>,
    /// Node records keyed by ULID string.
    pub nodes: HashMap<String, NodeSnapshot>,
    pub clock: u64,
    pub use_caching: bool,
    pub default_delay: u32,
    pub time_root: Option<String>,
    pub break_root: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSnapshot {
    pub name: String,
    pub owner: Option<String>,
    pub access: String,
    pub access_check: bool,
    pub tag: String,
    pub value: SerializedValue,
    pub rule: SerializedRule,
    pub auto_update: bool,
    pub stamp: u64,
    pub pending: Option<String>,
    /// Both directions are stored because input order is meaningful.
    pub routes_out: Vec<String>,
    pub routes_in: Vec<String>,
    pub cache: Option<CacheSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub type_name: String,
    pub initialized: bool,
    /// (field name, field key) in declaration order.
    pub fields: Vec<(String, String)>,
    pub cache: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub mode: String,
    pub delay: u32,
    pub delay_reset: u32,
    pub is_active: String,
    pub ran_since_tick: bool,
}

/// A serializable representation of a Value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SerializedValue {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    NodeRef(Option<String>),
    List(Vec<SerializedValue>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SerializedRule {
    Source,
    CopyInput,
    /// Restored as `Source` until the closure is re-bound.
    Map,
    ActivityProbe { cache: String },
}

#[derive(Debug, Error)]
#[error("corrupt snapshot: {0}")]
pub struct RestoreError(pub String);

fn field_key(id: FieldId) -> String {
    id.to_string()
}

fn parse_field_key(key: &str) -> Result<FieldId, RestoreError> {
    let (index, generation) = key
        .split_once('v')
        .ok_or_else(|| RestoreError(format!("bad field key {key:?}")))?;
    let index = index
        .parse()
        .map_err(|_| RestoreError(format!("bad field key {key:?}")))?;
    let generation = generation
        .parse()
        .map_err(|_| RestoreError(format!("bad field key {key:?}")))?;
    Ok(FieldId { index, generation })
}

fn parse_node_key(key: &str) -> Result<NodeId, RestoreError> {
    Ulid::from_string(key)
        .map(NodeId::from_ulid)
        .map_err(|_| RestoreError(format!("bad node id {key:?}")))
}

fn access_name(access: Access) -> String {
    access.to_string()
}

fn parse_access(name: &str) -> Result<Access, RestoreError> {
    match name {
        "INPUT_ONLY" => Ok(Access::InputOnly),
        "OUTPUT_ONLY" => Ok(Access::OutputOnly),
        "INITIALIZE_ONLY" => Ok(Access::InitializeOnly),
        "INPUT_OUTPUT" => Ok(Access::InputOutput),
        other => Err(RestoreError(format!("unknown access type {other:?}"))),
    }
}

fn parse_tag(name: &str) -> Result<TypeTag, RestoreError> {
    match name {
        "Any" => Ok(TypeTag::Any),
        "Unit" => Ok(TypeTag::Unit),
        "Bool" => Ok(TypeTag::Bool),
        "Int" => Ok(TypeTag::Int),
        "Float" => Ok(TypeTag::Float),
        "Text" => Ok(TypeTag::Text),
        "NodeRef" => Ok(TypeTag::NodeRef),
        "List" => Ok(TypeTag::List),
        other => Err(RestoreError(format!("unknown type tag {other:?}"))),
    }
}

fn cache_mode_name(mode: CacheMode) -> String {
    match mode {
        CacheMode::On => "on",
        CacheMode::Off => "off",
        CacheMode::Options => "options",
    }
    .to_string()
}

fn parse_cache_mode(name: &str) -> Result<CacheMode, RestoreError> {
    match name {
        "on" => Ok(CacheMode::On),
        "off" => Ok(CacheMode::Off),
        "options" => Ok(CacheMode::Options),
        other => Err(RestoreError(format!("unknown cache mode {other:?}"))),
    }
}

fn serialize_value(value: &Value) -> SerializedValue {
    match value {
        Value::Unit => SerializedValue::Unit,
        Value::Bool(b) => SerializedValue::Bool(*b),
        Value::Int(n) => SerializedValue::Int(*n),
        Value::Float(n) => SerializedValue::Float(*n),
        Value::Text(s) => SerializedValue::Text(s.to_string()),
        Value::NodeRef(node) => SerializedValue::NodeRef(node.map(|n| n.to_string())),
        Value::List(items) => SerializedValue::List(items.iter().map(serialize_value).collect()),
    }
}

fn restore_value(value: &SerializedValue) -> Result<Value, RestoreError> {
    Ok(match value {
        SerializedValue::Unit => Value::Unit,
        SerializedValue::Bool(b) => Value::Bool(*b),
        SerializedValue::Int(n) => Value::Int(*n),
        SerializedValue::Float(n) => Value::Float(*n),
        SerializedValue::Text(s) => Value::Text(s.as_str().into()),
        SerializedValue::NodeRef(None) => Value::NodeRef(None),
        SerializedValue::NodeRef(Some(key)) => Value::NodeRef(Some(parse_node_key(key)?)),
        SerializedValue::List(items) => Value::List(
            items
                .iter()
                .map(restore_value)
                .collect::<Result<Vec<_>, _>>()?,
        ),
    })
}

fn serialize_rule(rule: &UpdateRule) -> SerializedRule {
    match rule {
        UpdateRule::Source => SerializedRule::Source,
        UpdateRule::CopyInput => SerializedRule::CopyInput,
        UpdateRule::Map(_) => SerializedRule::Map,
        UpdateRule::ActivityProbe { cache } => SerializedRule::ActivityProbe {
            cache: field_key(*cache),
        },
    }
}

impl GraphSnapshot {
    /// Current snapshot version.
    pub const VERSION: u32 = 1;

    /// Capture the full graph state.
    pub fn capture(graph: &Graph) -> Self {
        let mut fields = HashMap::new();
        for (id, slot) in graph.arena.iter() {
            let cache = slot.cache().map(|state| CacheSnapshot {
                mode: cache_mode_name(state.mode),
                delay: state.delay,
                delay_reset: state.delay_reset,
                is_active: field_key(state.is_active),
                ran_since_tick: state.ran_since_tick,
            });
            fields.insert(
                field_key(id),
                FieldSnapshot {
                    name: slot.name.to_string(),
                    owner: slot.owner.map(|n| n.to_string()),
                    access: access_name(slot.access),
                    access_check: slot.access_check,
                    tag: slot.tag.to_string(),
                    value: serialize_value(&slot.value),
                    rule: serialize_rule(&slot.rule),
                    auto_update: slot.auto_update,
                    stamp: slot.stamp,
                    pending: slot.pending.map(field_key),
                    routes_out: slot.routes_out.iter().copied().map(field_key).collect(),
                    routes_in: slot.routes_in.iter().copied().map(field_key).collect(),
                    cache,
                },
            );
        }

        let mut nodes = HashMap::new();
        for (id, info) in graph.nodes() {
            nodes.insert(
                id.to_string(),
                NodeSnapshot {
                    type_name: info.type_name().to_string(),
                    initialized: info.is_initialized(),
                    fields: info
                        .fields()
                        .map(|(name, field)| (name.to_string(), field_key(field)))
                        .collect(),
                    cache: info.cache().map(field_key),
                },
            );
        }

        Self {
            version: Self::VERSION,
            fields,
            nodes,
            clock: graph.clock.last(),
            use_caching: graph.options.use_caching,
            default_delay: graph.options.delay,
            time_root: graph.time_root.map(field_key),
            break_root: graph.break_root.map(field_key),
        }
    }

    /// Rebuild a graph. Field handles are reallocated, so the returned map
    /// translates snapshot keys to live ids; node ids are ULIDs and come
    /// back unchanged.
    pub fn restore(&self) -> Result<(Graph, HashMap<String, FieldId>), RestoreError> {
        let mut graph = Graph::new();
        graph.options.use_caching = self.use_caching;
        graph.options.delay = self.default_delay;

        // Stable allocation order so restored index assignment is
        // reproducible even though HashMap iteration is not.
        let mut keys: Vec<&String> = self.fields.keys().collect();
        keys.sort_by_key(|key| {
            parse_field_key(key.as_str())
                .map(|id| (id.index, id.generation))
                .ok()
        });

        let mut remap: HashMap<String, FieldId> = HashMap::new();
        for key in &keys {
            let record = &self.fields[*key];
            let tag = parse_tag(&record.tag)?;
            let id = graph.add(FieldDef::new(record.name.as_str(), tag));
            remap.insert((*key).clone(), id);
        }
        let lookup = |key: &String| -> Result<FieldId, RestoreError> {
            remap
                .get(key)
                .copied()
                .ok_or_else(|| RestoreError(format!("dangling field key {key:?}")))
        };

        // Nodes first so owners resolve while fields are being filled in.
        for (key, record) in &self.nodes {
            let id = parse_node_key(key)?;
            graph.registry.insert(id, &record.type_name);
            let info = graph
                .registry
                .get_mut(id)
                .ok_or_else(|| RestoreError(format!("node {key:?} vanished")))?;
            info.initialized = record.initialized;
            for (name, field) in &record.fields {
                info.fields.insert(name.as_str().into(), lookup(field)?);
            }
            info.cache = match &record.cache {
                Some(field) => Some(lookup(field)?),
                None => None,
            };
        }

        for (key, record) in &self.fields {
            let id = lookup(key)?;
            let owner = match &record.owner {
                Some(node) => Some(parse_node_key(node)?),
                None => None,
            };
            let access = parse_access(&record.access)?;
            let value = restore_value(&record.value)?;
            let rule = match &record.rule {
                SerializedRule::Source | SerializedRule::Map => UpdateRule::Source,
                SerializedRule::CopyInput => UpdateRule::CopyInput,
                SerializedRule::ActivityProbe { cache } => UpdateRule::ActivityProbe {
                    cache: lookup(cache)?,
                },
            };
            let pending = match &record.pending {
                Some(source) => Some(lookup(source)?),
                None => None,
            };
            let mut routes_out = Vec::with_capacity(record.routes_out.len());
            for out in &record.routes_out {
                routes_out.push(lookup(out)?);
            }
            let mut routes_in = Vec::with_capacity(record.routes_in.len());
            for r#in in &record.routes_in {
                routes_in.push(lookup(r#in)?);
            }
            let kind = match &record.cache {
                Some(cache) => FieldKind::Cache(Box::new(CacheState::restored(
                    parse_cache_mode(&cache.mode)?,
                    cache.delay,
                    cache.delay_reset,
                    lookup(&cache.is_active)?,
                    cache.ran_since_tick,
                ))),
                None => FieldKind::Data,
            };

            let slot = graph
                .arena
                .get_mut(id)
                .ok_or_else(|| RestoreError(format!("field {key:?} vanished")))?;
            slot.owner = owner;
            slot.access = access;
            slot.access_check = record.access_check;
            slot.value = value;
            slot.rule = rule;
            slot.auto_update = record.auto_update;
            slot.stamp = record.stamp;
            slot.pending = pending;
            slot.routes_out = routes_out.into_iter().collect();
            slot.routes_in = routes_in.into_iter().collect();
            slot.kind = kind;
        }

        graph.clock.advance_to(self.clock);
        graph.time_root = match &self.time_root {
            Some(key) => Some(lookup(key)?),
            None => None,
        };
        graph.break_root = match &self.break_root {
            Some(key) => Some(lookup(key)?),
            None => None,
        };
        Ok((graph, remap))
    }

    /// Serialize snapshot to JSON string.
    #[cfg(feature = "cli")]
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize snapshot from JSON string.
    #[cfg(feature = "cli")]
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn sample_graph() -> (Graph, FieldId, FieldId) {
        let mut g = Graph::new();
        let shape = g.register_node("Shape");
        let size = g.add(FieldDef::new("size", TypeTag::Float).owner(shape));
        let out = g.add(FieldDef::new("out", TypeTag::Float));
        g.route(size, out, Some(shape)).unwrap();
        g.set(size, Value::Float(1.5), Some(shape)).unwrap();
        g.mark_initialized(shape);
        (g, size, out)
    }

    #[test]
    fn field_keys_round_trip() {
        let id = FieldId {
            index: 7,
            generation: 2,
        };
        assert_eq!(parse_field_key(&field_key(id)).unwrap(), id);
        assert!(parse_field_key("junk").is_err());
    }

    #[test]
    fn capture_and_restore_preserve_the_graph() {
        let (g, size, out) = sample_graph();
        let snapshot = GraphSnapshot::capture(&g);
        assert_eq!(snapshot.version, GraphSnapshot::VERSION);

        let (mut restored, remap) = snapshot.restore().unwrap();
        let new_size = remap[&size.to_string()];
        let new_out = remap[&out.to_string()];

        assert_eq!(restored.full_name(new_size), "Shape.size");
        assert_eq!(restored.peek(new_size), Some(&Value::Float(1.5)));
        assert_eq!(restored.routes_out(new_size), &[new_out]);
        assert_eq!(restored.routes_in(new_out), &[new_size]);
        assert!(restored.routes_symmetric());

        // the unpulled event survives the round trip
        assert_eq!(restored.pending_source(new_out), Some(new_size));
        assert_eq!(restored.get(new_out, None).unwrap(), Value::Float(1.5));
    }

    #[test]
    fn restored_clock_outruns_captured_stamps() {
        let (g, size, _) = sample_graph();
        let snapshot = GraphSnapshot::capture(&g);
        let (mut restored, remap) = snapshot.restore().unwrap();
        let new_size = remap[&size.to_string()];

        // a fresh event must beat every restored stamp
        let probe = restored.add(FieldDef::new("probe", TypeTag::Float));
        restored.route_no_event(new_size, probe, None).unwrap();
        restored.set(new_size, Value::Float(2.0), None).unwrap();
        assert_eq!(restored.pending_source(probe), Some(new_size));
    }

    #[test]
    fn cache_bookkeeping_survives_without_artifacts() {
        let mut g = Graph::new();
        let cache = g.add_cache_field(FieldDef::new("draw", TypeTag::Any), |_, _| {});
        g.set_cache_mode(cache, CacheMode::On);

        let snapshot = GraphSnapshot::capture(&g);
        let (restored, remap) = snapshot.restore().unwrap();
        let new_cache = remap[&cache.to_string()];

        assert_eq!(restored.cache_mode(new_cache), Some(CacheMode::On));
        assert_eq!(restored.caching_delay(new_cache), g.caching_delay(cache));
        // artifacts are backend-owned: a restored cache always rebuilds
        assert!(!restored.cache_valid(new_cache));
    }

    #[cfg(feature = "cli")]
    #[test]
    fn json_round_trip() {
        let (g, _, _) = sample_graph();
        let snapshot = GraphSnapshot::capture(&g);
        let json = snapshot.to_json().unwrap();
        let parsed = GraphSnapshot::from_json(&json).unwrap();
        assert_eq!(parsed.version, snapshot.version);
        assert_eq!(parsed.fields.len(), snapshot.fields.len());
        parsed.restore().unwrap();
    }
}
