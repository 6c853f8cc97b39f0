use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::arena::FieldId;
use crate::cache::CacheState;
use crate::node::NodeId;
use crate::value::{TypeTag, Value};

/// Per-field read/write/route policy, enforced against the owning node's
/// identity and lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Writable from anywhere; readable from outside the owner only once
    /// something has routed from it. Rejects outgoing routes from non-owners.
    InputOnly,
    /// Written and read by the owner; rejects incoming routes.
    OutputOnly,
    /// Writable until the owning node is initialized; rejects incoming routes
    /// from non-owners.
    InitializeOnly,
    /// Unrestricted in both directions.
    InputOutput,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Access::InputOnly => "INPUT_ONLY",
            Access::OutputOnly => "OUTPUT_ONLY",
            Access::InitializeOnly => "INITIALIZE_ONLY",
            Access::InputOutput => "INPUT_OUTPUT",
        };
        f.write_str(name)
    }
}

/// Re-entrancy state of a field. Propagating blocks event re-delivery
/// through cycles; Updating blocks recursive recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Propagating,
    Updating,
}

/// Logical timestamp from the graph's monotonic clock.
/// Only compared with strict `>`, never used for wall-clock math.
pub type Stamp = u64;

/// A change notification carried through outgoing routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub source: FieldId,
    pub stamp: Stamp,
}

pub type MapFn = dyn FnMut(&[Value]) -> Value + 'static;
pub type ChangeFn = dyn FnMut(&Value) + 'static;

/// How a field recomputes when pulled with a pending event.
pub enum UpdateRule {
    /// No recomputation; the stored value is authoritative (roots, sinks).
    Source,
    /// Copy the value of the field that sent the pending event.
    CopyInput,
    /// Pull every input in route order and map their values.
    Map(Box<MapFn>),
    /// Reports whether the cache's replay entry point ran since the last
    /// pull, then clears the flag. Auto-updated from the scene time route.
    ActivityProbe { cache: FieldId },
}

impl fmt::Debug for UpdateRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateRule::Source => f.write_str("Source"),
            UpdateRule::CopyInput => f.write_str("CopyInput"),
            UpdateRule::Map(_) => f.write_str("Map(..)"),
            UpdateRule::ActivityProbe { cache } => {
                write!(f, "ActivityProbe({cache})")
            }
        }
    }
}

/// When an on-change callback fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notify {
    /// Only when the stored value actually changed.
    OnChange,
    /// On every write and every recomputation.
    Always,
}

/// Kind-specific state of a field.
#[derive(Debug, Default)]
pub enum FieldKind {
    #[default]
    Data,
    Cache(Box<CacheState>),
}

/// A reactive cell in the arena.
pub struct FieldSlot {
    pub name: Arc<str>,
    pub owner: Option<NodeId>,
    pub access: Access,
    pub access_check: bool,
    pub phase: Phase,
    /// Timestamp of the newest event this field has seen. Retained after the
    /// pending marker clears; the strict `>` guard compares against it.
    pub stamp: Stamp,
    /// Source of the pending event, if any. None means up to date.
    pub pending: Option<FieldId>,
    pub tag: TypeTag,
    pub value: Value,
    pub rule: UpdateRule,
    /// Pull immediately after an event reaches this field.
    pub auto_update: bool,
    pub on_change: Option<(Notify, Box<ChangeFn>)>,
    /// Fields this one feeds. Ordered, duplicates forbidden.
    pub routes_out: SmallVec<[FieldId; 4]>,
    /// Fields this one consumes. Position is meaningful to update rules.
    pub routes_in: SmallVec<[FieldId; 4]>,
    pub kind: FieldKind,
}

impl FieldSlot {
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn cache(&self) -> Option<&CacheState> {
        match &self.kind {
            FieldKind::Cache(cs) => Some(cs),
            FieldKind::Data => None,
        }
    }

    pub fn cache_mut(&mut self) -> Option<&mut CacheState> {
        match &mut self.kind {
            FieldKind::Cache(cs) => Some(cs),
            FieldKind::Data => None,
        }
    }
}

impl fmt::Debug for FieldSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSlot")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("access", &self.access)
            .field("phase", &self.phase)
            .field("stamp", &self.stamp)
            .field("pending", &self.pending)
            .field("tag", &self.tag)
            .field("value", &self.value)
            .field("rule", &self.rule)
            .field("routes_out", &self.routes_out)
            .field("routes_in", &self.routes_in)
            .finish()
    }
}

/// Builder for a field record, consumed by [`Graph::add`](crate::graph::Graph::add).
pub struct FieldDef {
    name: String,
    tag: TypeTag,
    access: Access,
    access_check: bool,
    owner: Option<NodeId>,
    value: Option<Value>,
    rule: UpdateRule,
    auto_update: bool,
    on_change: Option<(Notify, Box<ChangeFn>)>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, tag: TypeTag) -> Self {
        Self {
            name: name.into(),
            tag,
            access: Access::InputOutput,
            access_check: true,
            owner: None,
            value: None,
            rule: UpdateRule::CopyInput,
            auto_update: false,
            on_change: None,
        }
    }

    pub fn access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn owner(mut self, owner: NodeId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn rule(mut self, rule: UpdateRule) -> Self {
        self.rule = rule;
        self
    }

    /// Shorthand for a field computed from all of its inputs.
    pub fn map(mut self, f: impl FnMut(&[Value]) -> Value + 'static) -> Self {
        self.rule = UpdateRule::Map(Box::new(f));
        self
    }

    /// Pull this field as soon as an event reaches it, instead of waiting
    /// for a reader.
    pub fn auto_update(mut self) -> Self {
        self.auto_update = true;
        self
    }

    pub fn on_change(mut self, notify: Notify, f: impl FnMut(&Value) + 'static) -> Self {
        self.on_change = Some((notify, Box::new(f)));
        self
    }

    /// Disable access checking for this field (trusted internal wiring).
    pub fn unchecked(mut self) -> Self {
        self.access_check = false;
        self
    }

    pub(crate) fn owner_id(&self) -> Option<NodeId> {
        self.owner
    }

    pub(crate) fn into_slot(self) -> FieldSlot {
        let value = self.value.unwrap_or_else(|| self.tag.default_value());
        FieldSlot {
            name: self.name.into(),
            owner: self.owner,
            access: self.access,
            access_check: self.access_check,
            phase: Phase::Idle,
            stamp: 0,
            pending: None,
            tag: self.tag,
            value,
            rule: self.rule,
            auto_update: self.auto_update,
            on_change: self.on_change,
            routes_out: SmallVec::new(),
            routes_in: SmallVec::new(),
            kind: FieldKind::Data,
        }
    }
}
