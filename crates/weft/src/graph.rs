use std::mem;

use log::trace;

use crate::arena::{Arena, FieldId};
use crate::cache::{ArtifactId, CacheOptions};
use crate::error::{AccessError, GraphError};
use crate::field::{Access, Event, FieldDef, FieldKind, Notify, Phase, Stamp, UpdateRule};
use crate::node::{NodeId, NodeRegistry};
use crate::value::Value;

/// Monotonic event clock. Stamps start at 1 so a fresh field (stamp 0)
/// accepts its first event.
#[derive(Debug, Default)]
pub(crate) struct EventClock {
    last: Stamp,
}

impl EventClock {
    pub(crate) fn now(&mut self) -> Stamp {
        self.last += 1;
        self.last
    }

    pub(crate) fn last(&self) -> Stamp {
        self.last
    }

    pub(crate) fn advance_to(&mut self, stamp: Stamp) {
        if stamp > self.last {
            self.last = stamp;
        }
    }
}

/// The reactive graph: an arena of fields wired by routes, a node registry,
/// and the event clock that stamps every change.
///
/// Events push staleness through outgoing routes; values are recomputed
/// lazily when pulled. Both directions are re-entrancy guarded, so cyclic
/// route graphs terminate.
pub struct Graph {
    pub(crate) arena: Arena,
    pub(crate) registry: NodeRegistry,
    pub(crate) clock: EventClock,
    pub(crate) options: CacheOptions,
    /// Fans a rebuild-everything event out to every draw cache.
    pub(crate) break_root: Option<FieldId>,
    /// The scene time field, wired to every cache activity probe.
    pub(crate) time_root: Option<FieldId>,
    /// Draw artifacts displaced without a backend at hand; discarded on
    /// the next replay entry.
    pub(crate) retired: Vec<ArtifactId>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
            registry: NodeRegistry::new(),
            clock: EventClock::default(),
            options: CacheOptions::default(),
            break_root: None,
            time_root: None,
            retired: Vec::new(),
        }
    }

    pub fn with_options(options: CacheOptions) -> Self {
        Self {
            options,
            ..Self::new()
        }
    }

    /// Add a field to the graph. If the definition names a registered owner,
    /// the field is also entered into that node's field table.
    pub fn add(&mut self, def: FieldDef) -> FieldId {
        let owner = def.owner_id();
        let slot = def.into_slot();
        let name = slot.name.clone();
        let id = self.arena.alloc(slot);
        if let Some(node) = owner {
            if let Some(info) = self.registry.get_mut(node) {
                info.fields.insert(name, id);
            }
        }
        id
    }

    /// Remove a field. All of its routes are detached first and any peer
    /// still holding it as a pending-event source is cleared, so surviving
    /// fields never dangle into the freed slot.
    pub fn remove_field(&mut self, f: FieldId) {
        self.unroute_all(f);
        let Some(slot) = self.arena.free(f) else {
            return;
        };
        if let Some(node) = slot.owner {
            if let Some(info) = self.registry.get_mut(node) {
                info.fields.shift_remove(&slot.name);
                if info.cache == Some(f) {
                    info.cache = None;
                }
            }
        }
        if let FieldKind::Cache(cs) = slot.kind {
            if let Some(artifact) = cs.artifact {
                self.retired.push(artifact);
            }
            self.remove_field(cs.is_active);
        }
    }

    pub fn contains(&self, f: FieldId) -> bool {
        self.arena.is_valid(f)
    }

    pub fn field_count(&self) -> usize {
        self.arena.live_count()
    }

    /// "Type.name" for owned fields, "<unowned>.name" otherwise.
    pub fn full_name(&self, f: FieldId) -> String {
        let Some(slot) = self.arena.get(f) else {
            return format!("<freed {f}>");
        };
        match slot.owner.and_then(|o| self.registry.get(o)) {
            Some(info) => format!("{}.{}", info.type_name, slot.name),
            None => format!("<unowned>.{}", slot.name),
        }
    }

    // ------------------------------------------------------------------
    // Values

    /// Write a value and fire an event from the field. `caller` is the
    /// identity presented to the access check; the owner bypasses it.
    pub fn set(
        &mut self,
        f: FieldId,
        value: Value,
        caller: Option<NodeId>,
    ) -> Result<(), GraphError> {
        self.check_write(f, caller)?;
        let tag = match self.arena.get(f) {
            Some(slot) => slot.tag,
            None => return Err(GraphError::Stale(f)),
        };
        if !tag.accepts(value.tag()) {
            return Err(GraphError::ValueType {
                field: self.full_name(f),
                expected: tag,
                found: value.tag(),
            });
        }
        self.store_value(f, value);
        self.start_event(f);
        Ok(())
    }

    /// Read a value, recomputing first if an event is pending.
    pub fn get(&mut self, f: FieldId, caller: Option<NodeId>) -> Result<Value, GraphError> {
        self.check_read(f, caller)?;
        self.up_to_date(f);
        match self.arena.get(f) {
            Some(slot) => Ok(slot.value.clone()),
            None => Err(GraphError::Stale(f)),
        }
    }

    /// Read the stored value without recomputing or checking access.
    pub fn peek(&self, f: FieldId) -> Option<&Value> {
        self.arena.get(f).map(|slot| &slot.value)
    }

    /// Store without firing an event or checking access. Used by update
    /// rules and trusted internal writers.
    pub(crate) fn store_value(&mut self, f: FieldId, value: Value) {
        let changed = {
            let Some(slot) = self.arena.get_mut(f) else {
                return;
            };
            let changed = slot.value != value;
            slot.value = value;
            changed
        };
        self.notify_change(f, changed);
    }

    fn notify_change(&mut self, f: FieldId, changed: bool) {
        let (notify, mut callback, value) = {
            let Some(slot) = self.arena.get_mut(f) else {
                return;
            };
            let Some((notify, callback)) = slot.on_change.take() else {
                return;
            };
            (notify, callback, slot.value.clone())
        };
        if changed || notify == Notify::Always {
            callback(&value);
        }
        if let Some(slot) = self.arena.get_mut(f) {
            slot.on_change = Some((notify, callback));
        }
    }

    // ------------------------------------------------------------------
    // Push: events

    /// Stamp the field with a fresh timestamp and forward an event through
    /// its outgoing routes. The field's own pending marker is left alone,
    /// so a touched-but-stale field stays stale.
    pub fn touch(&mut self, f: FieldId) {
        let stamp = self.clock.now();
        let Some(slot) = self.arena.get_mut(f) else {
            return;
        };
        slot.stamp = stamp;
        self.fire(f, stamp);
    }

    /// Like [`touch`](Self::touch), but also clears the field's own pending
    /// marker: the value just written is authoritative, nothing upstream
    /// needs pulling.
    pub fn start_event(&mut self, f: FieldId) {
        let stamp = self.clock.now();
        let Some(slot) = self.arena.get_mut(f) else {
            return;
        };
        slot.stamp = stamp;
        slot.pending = None;
        self.fire(f, stamp);
    }

    /// Forward an event carrying `stamp` from `f` to every outgoing route.
    /// The field is held in the propagating phase for the duration, which
    /// is what stops a cycle from re-delivering the event to it.
    fn fire(&mut self, f: FieldId, stamp: Stamp) {
        let outs: Vec<FieldId> = {
            let Some(slot) = self.arena.get_mut(f) else {
                return;
            };
            slot.phase = Phase::Propagating;
            slot.routes_out.to_vec()
        };
        for to in outs {
            self.propagate_event(to, Event { source: f, stamp });
        }
        if let Some(slot) = self.arena.get_mut(f) {
            slot.phase = Phase::Idle;
        }
    }

    /// Deliver an event to `f`. Accepted only when the field is not already
    /// propagating and the stamp is strictly newer than anything it has
    /// seen; an accepted event records the sender as the pending source and
    /// is forwarded with this field as the new source.
    pub(crate) fn propagate_event(&mut self, f: FieldId, event: Event) {
        let (accepted, is_cache) = {
            let Some(slot) = self.arena.get_mut(f) else {
                return;
            };
            let accepted = slot.phase != Phase::Propagating && event.stamp > slot.stamp;
            if accepted {
                slot.stamp = event.stamp;
                slot.pending = Some(event.source);
            }
            (accepted, matches!(slot.kind, FieldKind::Cache(_)))
        };
        // A draw cache invalidates on every delivery, even one the stamp
        // guard drops: the sender did change, whatever its clock says.
        if is_cache {
            self.cache_note_event(f, event.source);
        }
        if !accepted {
            return;
        }
        trace!(
            "event {} -> {} (stamp {})",
            event.source,
            f,
            event.stamp
        );
        self.fire(f, event.stamp);
        let auto = self.arena.get(f).is_some_and(|slot| slot.auto_update);
        if auto {
            self.up_to_date(f);
        }
    }

    // ------------------------------------------------------------------
    // Pull: lazy recomputation

    /// Recompute `f` if an event is pending, then clear the marker.
    /// A field already in its updating phase is left alone, which both
    /// breaks pull cycles and makes a diamond recompute its apex once.
    pub fn up_to_date(&mut self, f: FieldId) {
        {
            let Some(slot) = self.arena.get_mut(f) else {
                return;
            };
            if slot.pending.is_none() || slot.phase == Phase::Updating {
                return;
            }
            slot.phase = Phase::Updating;
        }
        trace!("update {}", f);
        self.run_rule(f);
        if let Some(slot) = self.arena.get_mut(f) {
            slot.pending = None;
            slot.phase = Phase::Idle;
        }
    }

    pub fn is_up_to_date(&self, f: FieldId) -> bool {
        self.arena.get(f).is_some_and(|slot| !slot.is_pending())
    }

    /// Swap the field's update rule. Also the way closures are re-bound
    /// after restoring a snapshot, since rules are code, not data.
    pub fn set_rule(&mut self, f: FieldId, rule: UpdateRule) {
        if let Some(slot) = self.arena.get_mut(f) {
            slot.rule = rule;
        }
    }

    /// Attach or replace the field's change callback.
    pub fn set_on_change(
        &mut self,
        f: FieldId,
        notify: Notify,
        callback: impl FnMut(&Value) + 'static,
    ) {
        if let Some(slot) = self.arena.get_mut(f) {
            slot.on_change = Some((notify, Box::new(callback)));
        }
    }

    /// The field whose event this one has not yet consumed, if any.
    pub fn pending_source(&self, f: FieldId) -> Option<FieldId> {
        self.arena.get(f).and_then(|slot| slot.pending)
    }

    /// Run the field's update rule. Rules pull their inputs with owner
    /// privilege; access checks apply to external readers, not to a field
    /// consuming what is routed into it.
    fn run_rule(&mut self, f: FieldId) {
        let (mut rule, pending) = {
            let Some(slot) = self.arena.get_mut(f) else {
                return;
            };
            (
                mem::replace(&mut slot.rule, UpdateRule::Source),
                slot.pending,
            )
        };
        match &mut rule {
            UpdateRule::Source => {}
            UpdateRule::CopyInput => {
                if let Some(src) = pending {
                    self.up_to_date(src);
                    if let Some(value) = self.arena.get(src).map(|s| s.value.clone()) {
                        self.store_value(f, value);
                    }
                }
            }
            UpdateRule::Map(map) => {
                let ins: Vec<FieldId> = self
                    .arena
                    .get(f)
                    .map(|s| s.routes_in.to_vec())
                    .unwrap_or_default();
                let mut inputs = Vec::with_capacity(ins.len());
                for i in ins {
                    self.up_to_date(i);
                    if let Some(slot) = self.arena.get(i) {
                        inputs.push(slot.value.clone());
                    }
                }
                let out = map(&inputs);
                self.store_value(f, out);
            }
            UpdateRule::ActivityProbe { cache } => {
                let ran = self.cache_take_activity(*cache);
                self.store_value(f, Value::Bool(ran));
            }
        }
        if let Some(slot) = self.arena.get_mut(f) {
            slot.rule = rule;
        }
    }

    // ------------------------------------------------------------------
    // Routes (wiring lives in routing.rs; the inspectors sit here)

    pub fn routes_out(&self, f: FieldId) -> &[FieldId] {
        self.arena
            .get(f)
            .map(|slot| slot.routes_out.as_slice())
            .unwrap_or(&[])
    }

    pub fn routes_in(&self, f: FieldId) -> &[FieldId] {
        self.arena
            .get(f)
            .map(|slot| slot.routes_in.as_slice())
            .unwrap_or(&[])
    }

    /// Every outgoing route is mirrored by the target's incoming list and
    /// vice versa. Holds after any sequence of route edits or removals.
    pub fn routes_symmetric(&self) -> bool {
        for (id, slot) in self.arena.iter() {
            for &to in &slot.routes_out {
                let Some(target) = self.arena.get(to) else {
                    return false;
                };
                if !target.routes_in.contains(&id) {
                    return false;
                }
            }
            for &from in &slot.routes_in {
                let Some(source) = self.arena.get(from) else {
                    return false;
                };
                if !source.routes_out.contains(&id) {
                    return false;
                }
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Access checks

    fn owner_initialized(&self, node: NodeId) -> bool {
        self.registry.get(node).is_some_and(|info| info.initialized)
    }

    /// A field with no owner, a field with checking disabled, or a caller
    /// presenting the owner's identity passes every check.
    fn exempt(&self, f: FieldId, caller: Option<NodeId>) -> Result<Option<NodeId>, GraphError> {
        let Some(slot) = self.arena.get(f) else {
            return Err(GraphError::Stale(f));
        };
        if !slot.access_check {
            return Ok(None);
        }
        let Some(owner) = slot.owner else {
            return Ok(None);
        };
        if caller == Some(owner) {
            return Ok(None);
        }
        Ok(Some(owner))
    }

    pub(crate) fn check_route_out(
        &self,
        from: FieldId,
        to: FieldId,
        caller: Option<NodeId>,
    ) -> Result<(), GraphError> {
        if self.exempt(from, caller)?.is_none() {
            return Ok(());
        }
        let access = match self.arena.get(from) {
            Some(slot) => slot.access,
            None => return Err(GraphError::Stale(from)),
        };
        if access == Access::InputOnly {
            return Err(AccessError::RouteOut {
                access,
                from: self.full_name(from),
                to: self.full_name(to),
            }
            .into());
        }
        Ok(())
    }

    pub(crate) fn check_route_in(
        &self,
        from: FieldId,
        to: FieldId,
        caller: Option<NodeId>,
    ) -> Result<(), GraphError> {
        if self.exempt(to, caller)?.is_none() {
            return Ok(());
        }
        let access = match self.arena.get(to) {
            Some(slot) => slot.access,
            None => return Err(GraphError::Stale(to)),
        };
        if access == Access::OutputOnly || access == Access::InitializeOnly {
            return Err(AccessError::RouteIn {
                access,
                from: self.full_name(from),
                to: self.full_name(to),
            }
            .into());
        }
        Ok(())
    }

    fn check_write(&self, f: FieldId, caller: Option<NodeId>) -> Result<(), GraphError> {
        let Some(owner) = self.exempt(f, caller)? else {
            return Ok(());
        };
        let access = match self.arena.get(f) {
            Some(slot) => slot.access,
            None => return Err(GraphError::Stale(f)),
        };
        match access {
            Access::InitializeOnly if self.owner_initialized(owner) => {
                Err(AccessError::WriteAfterInit {
                    access,
                    field: self.full_name(f),
                }
                .into())
            }
            Access::OutputOnly => Err(AccessError::Write {
                access,
                field: self.full_name(f),
            }
            .into()),
            _ => Ok(()),
        }
    }

    fn check_read(&self, f: FieldId, caller: Option<NodeId>) -> Result<(), GraphError> {
        if self.exempt(f, caller)?.is_none() {
            return Ok(());
        }
        let Some(slot) = self.arena.get(f) else {
            return Err(GraphError::Stale(f));
        };
        let rejected = match slot.access {
            Access::OutputOnly => true,
            // An input is observable from outside only through what it
            // feeds; unrouted, its value is the owner's business.
            Access::InputOnly => slot.routes_out.is_empty(),
            _ => false,
        };
        if rejected {
            return Err(AccessError::Read {
                access: slot.access,
                field: self.full_name(f),
            }
            .into());
        }
        Ok(())
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
