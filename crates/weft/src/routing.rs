//! Route wiring. An edge always exists on both sides at once: the source's
//! outgoing list and the target's incoming list. Every operation here checks
//! everything that can fail before touching either list, so a rejected call
//! leaves no half-edge behind.

use crate::arena::FieldId;
use crate::error::GraphError;
use crate::field::{Event, Phase};
use crate::graph::Graph;
use crate::node::NodeId;

impl Graph {
    /// Route `from` into `to` and fire a catch-up event along the new edge
    /// only. Routing a pair that is already connected is a silent no-op and
    /// fires nothing, but the source's outgoing access is still checked.
    pub fn route(
        &mut self,
        from: FieldId,
        to: FieldId,
        caller: Option<NodeId>,
    ) -> Result<(), GraphError> {
        self.check_route_out(from, to, caller)?;
        if self.routes_out(from).contains(&to) {
            return Ok(());
        }
        self.wire(from, to, caller)?;
        self.fire_at(from, to);
        Ok(())
    }

    /// Route without the catch-up event. The target stays up to date until
    /// the source actually changes.
    pub fn route_no_event(
        &mut self,
        from: FieldId,
        to: FieldId,
        caller: Option<NodeId>,
    ) -> Result<(), GraphError> {
        self.check_route_out(from, to, caller)?;
        if self.routes_out(from).contains(&to) {
            return Ok(());
        }
        self.wire(from, to, caller)
    }

    /// Swap `from` in place of the field at `to.routes_in[index]`, keeping
    /// the input position stable for position-sensitive update rules.
    /// Returns the displaced field, or `None` (without touching the index)
    /// when `from` already feeds `to`.
    pub fn replace_route(
        &mut self,
        from: FieldId,
        to: FieldId,
        index: usize,
        caller: Option<NodeId>,
    ) -> Result<Option<FieldId>, GraphError> {
        let displaced = self.swap_route(from, to, index, caller)?;
        if displaced.is_some() {
            self.fire_at(from, to);
        }
        Ok(displaced)
    }

    /// [`replace_route`](Self::replace_route) without the catch-up event.
    pub fn replace_route_no_event(
        &mut self,
        from: FieldId,
        to: FieldId,
        index: usize,
        caller: Option<NodeId>,
    ) -> Result<Option<FieldId>, GraphError> {
        self.swap_route(from, to, index, caller)
    }

    /// Remove the edge if present. Also clears either endpoint's pending
    /// marker when it names the other, so no field is left waiting on an
    /// event source it is no longer connected to. Absent edges are ignored.
    pub fn unroute(&mut self, from: FieldId, to: FieldId) {
        if let Some(slot) = self.arena.get_mut(from) {
            if let Some(i) = slot.routes_out.iter().position(|&id| id == to) {
                slot.routes_out.remove(i);
            }
            if slot.pending == Some(to) {
                slot.pending = None;
            }
        }
        if let Some(slot) = self.arena.get_mut(to) {
            if let Some(i) = slot.routes_in.iter().position(|&id| id == from) {
                slot.routes_in.remove(i);
            }
            if slot.pending == Some(from) {
                slot.pending = None;
            }
        }
    }

    /// Detach every route touching `f`, in both directions.
    pub fn unroute_all(&mut self, f: FieldId) {
        let outs: Vec<FieldId> = self.routes_out(f).to_vec();
        for to in outs {
            self.unroute(f, to);
        }
        let ins: Vec<FieldId> = self.routes_in(f).to_vec();
        for from in ins {
            self.unroute(from, f);
        }
    }

    /// Add the edge to both lists. Incoming access and value types are
    /// checked first; nothing is pushed unless both pass.
    fn wire(&mut self, from: FieldId, to: FieldId, caller: Option<NodeId>) -> Result<(), GraphError> {
        self.check_route_in(from, to, caller)?;
        let from_tag = match self.arena.get(from) {
            Some(slot) => slot.tag,
            None => return Err(GraphError::Stale(from)),
        };
        let to_tag = match self.arena.get(to) {
            Some(slot) => slot.tag,
            None => return Err(GraphError::Stale(to)),
        };
        if !to_tag.accepts(from_tag) {
            return Err(GraphError::TypeMismatch {
                from: self.full_name(from),
                from_tag,
                to: self.full_name(to),
                to_tag,
            });
        }
        if let Some(slot) = self.arena.get_mut(from) {
            slot.routes_out.push(to);
        }
        if let Some(slot) = self.arena.get_mut(to) {
            slot.routes_in.push(from);
        }
        Ok(())
    }

    fn swap_route(
        &mut self,
        from: FieldId,
        to: FieldId,
        index: usize,
        caller: Option<NodeId>,
    ) -> Result<Option<FieldId>, GraphError> {
        self.check_route_out(from, to, caller)?;
        if !self.arena.is_valid(to) {
            return Err(GraphError::Stale(to));
        }
        if self.routes_out(from).contains(&to) {
            return Ok(None);
        }
        let len = self.routes_in(to).len();
        if index >= len {
            return Err(GraphError::BadRouteIndex {
                field: self.full_name(to),
                index,
                len,
            });
        }
        self.check_route_in(from, to, caller)?;
        let from_tag = match self.arena.get(from) {
            Some(slot) => slot.tag,
            None => return Err(GraphError::Stale(from)),
        };
        let to_tag = match self.arena.get(to) {
            Some(slot) => slot.tag,
            None => return Err(GraphError::Stale(to)),
        };
        if !to_tag.accepts(from_tag) {
            return Err(GraphError::TypeMismatch {
                from: self.full_name(from),
                from_tag,
                to: self.full_name(to),
                to_tag,
            });
        }

        let displaced = {
            let Some(slot) = self.arena.get_mut(to) else {
                return Err(GraphError::Stale(to));
            };
            let displaced = slot.routes_in[index];
            slot.routes_in[index] = from;
            if slot.pending == Some(displaced) {
                slot.pending = None;
            }
            displaced
        };
        if let Some(slot) = self.arena.get_mut(displaced) {
            if let Some(i) = slot.routes_out.iter().position(|&id| id == to) {
                slot.routes_out.remove(i);
            }
        }
        if let Some(slot) = self.arena.get_mut(from) {
            slot.routes_out.push(to);
        }
        Ok(Some(displaced))
    }

    /// Stamp `from` and deliver an event along one edge only, holding the
    /// source in its propagating phase for the duration.
    fn fire_at(&mut self, from: FieldId, to: FieldId) {
        let stamp = self.clock.now();
        let Some(slot) = self.arena.get_mut(from) else {
            return;
        };
        slot.stamp = stamp;
        slot.phase = Phase::Propagating;
        self.propagate_event(to, Event { source: from, stamp });
        if let Some(slot) = self.arena.get_mut(from) {
            slot.phase = Phase::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldDef;
    use crate::value::{TypeTag, Value};

    fn graph_with(tags: &[(&str, TypeTag)]) -> (Graph, Vec<FieldId>) {
        let mut g = Graph::new();
        let ids = tags
            .iter()
            .map(|(name, tag)| g.add(FieldDef::new(*name, *tag)))
            .collect();
        (g, ids)
    }

    #[test]
    fn route_wires_both_sides_and_fires_catch_up() {
        let (mut g, ids) = graph_with(&[("a", TypeTag::Int), ("b", TypeTag::Int)]);
        let (a, b) = (ids[0], ids[1]);
        g.set(a, Value::Int(5), None).unwrap();

        g.route(a, b, None).unwrap();
        assert_eq!(g.routes_out(a), &[b]);
        assert_eq!(g.routes_in(b), &[a]);
        assert_eq!(g.pending_source(b), Some(a));
        assert!(g.routes_symmetric());

        // the catch-up event lets the new target pull the current value
        assert_eq!(g.get(b, None).unwrap(), Value::Int(5));
    }

    #[test]
    fn route_twice_is_a_silent_no_op() {
        let (mut g, ids) = graph_with(&[("a", TypeTag::Int), ("b", TypeTag::Int)]);
        let (a, b) = (ids[0], ids[1]);
        g.route(a, b, None).unwrap();
        g.get(b, None).unwrap();

        g.route(a, b, None).unwrap();
        assert_eq!(g.routes_out(a).len(), 1);
        assert_eq!(g.routes_in(b).len(), 1);
        // no second catch-up event either
        assert!(g.is_up_to_date(b));
    }

    #[test]
    fn route_no_event_leaves_target_up_to_date() {
        let (mut g, ids) = graph_with(&[("a", TypeTag::Int), ("b", TypeTag::Int)]);
        let (a, b) = (ids[0], ids[1]);
        g.route_no_event(a, b, None).unwrap();
        assert_eq!(g.routes_out(a), &[b]);
        assert!(g.is_up_to_date(b));

        // later changes still flow
        g.set(a, Value::Int(9), None).unwrap();
        assert_eq!(g.get(b, None).unwrap(), Value::Int(9));
    }

    #[test]
    fn type_mismatch_leaves_no_half_edge() {
        let (mut g, ids) = graph_with(&[("a", TypeTag::Float), ("b", TypeTag::Bool)]);
        let (a, b) = (ids[0], ids[1]);
        let err = g.route(a, b, None).unwrap_err();
        assert!(matches!(err, GraphError::TypeMismatch { .. }));
        assert!(g.routes_out(a).is_empty());
        assert!(g.routes_in(b).is_empty());
        assert!(g.routes_symmetric());
    }

    #[test]
    fn any_target_accepts_every_source() {
        let (mut g, ids) = graph_with(&[("a", TypeTag::Float), ("sink", TypeTag::Any)]);
        g.route(ids[0], ids[1], None).unwrap();
        assert_eq!(g.routes_in(ids[1]), &[ids[0]]);
    }

    #[test]
    fn unroute_detaches_and_cancels_pending() {
        let (mut g, ids) = graph_with(&[("a", TypeTag::Int), ("b", TypeTag::Int)]);
        let (a, b) = (ids[0], ids[1]);
        g.route(a, b, None).unwrap();
        g.get(b, None).unwrap();
        g.set(a, Value::Int(7), None).unwrap();
        assert_eq!(g.pending_source(b), Some(a));

        g.unroute(a, b);
        assert!(g.routes_out(a).is_empty());
        assert!(g.routes_in(b).is_empty());
        // b must not try to pull from a field it is no longer fed by
        assert!(g.is_up_to_date(b));
        assert_eq!(g.get(b, None).unwrap(), Value::Int(0));

        // absent edge: nothing to do
        g.unroute(a, b);
        assert!(g.routes_symmetric());
    }

    #[test]
    fn replace_route_swaps_one_input_in_place() {
        let (mut g, ids) = graph_with(&[
            ("a", TypeTag::Int),
            ("b", TypeTag::Int),
            ("c", TypeTag::Int),
        ]);
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        g.route(a, c, None).unwrap();
        g.get(c, None).unwrap();
        g.set(b, Value::Int(42), None).unwrap();

        let displaced = g.replace_route(b, c, 0, None).unwrap();
        assert_eq!(displaced, Some(a));
        assert_eq!(g.routes_in(c), &[b]);
        assert!(g.routes_out(a).is_empty());
        assert_eq!(g.routes_out(b), &[c]);
        assert!(g.routes_symmetric());

        // catch-up event came from the new source
        assert_eq!(g.pending_source(c), Some(b));
        assert_eq!(g.get(c, None).unwrap(), Value::Int(42));
    }

    #[test]
    fn replace_route_with_existing_source_keeps_index_untouched() {
        let (mut g, ids) = graph_with(&[
            ("a", TypeTag::Int),
            ("b", TypeTag::Int),
            ("c", TypeTag::Int),
        ]);
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        g.route(a, c, None).unwrap();
        g.route(b, c, None).unwrap();

        // b already feeds c: no swap, a keeps its slot
        let displaced = g.replace_route(b, c, 0, None).unwrap();
        assert_eq!(displaced, None);
        assert_eq!(g.routes_in(c), &[a, b]);
    }

    #[test]
    fn replace_route_index_out_of_bounds() {
        let (mut g, ids) = graph_with(&[("a", TypeTag::Int), ("b", TypeTag::Int)]);
        let (a, b) = (ids[0], ids[1]);
        let err = g.replace_route(a, b, 0, None).unwrap_err();
        assert!(matches!(
            err,
            GraphError::BadRouteIndex { index: 0, len: 0, .. }
        ));
    }

    #[test]
    fn event_cycle_terminates() {
        let (mut g, ids) = graph_with(&[
            ("a", TypeTag::Int),
            ("b", TypeTag::Int),
            ("c", TypeTag::Int),
        ]);
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        g.route(a, b, None).unwrap();
        g.route(b, c, None).unwrap();
        g.route(c, a, None).unwrap();

        // one write must visit each field at most once and return
        g.set(a, Value::Int(1), None).unwrap();
        assert_eq!(g.pending_source(b), Some(a));
        assert_eq!(g.pending_source(c), Some(b));
        // the event died at its origin instead of looping
        assert!(g.is_up_to_date(a));

        assert_eq!(g.get(c, None).unwrap(), Value::Int(1));
    }

    #[test]
    fn removing_a_field_detaches_every_edge() {
        let (mut g, ids) = graph_with(&[
            ("a", TypeTag::Int),
            ("mid", TypeTag::Int),
            ("z", TypeTag::Int),
        ]);
        let (a, mid, z) = (ids[0], ids[1], ids[2]);
        g.route(a, mid, None).unwrap();
        g.route(mid, z, None).unwrap();
        g.set(a, Value::Int(3), None).unwrap();

        g.remove_field(mid);
        assert!(!g.contains(mid));
        assert!(g.routes_out(a).is_empty());
        assert!(g.routes_in(z).is_empty());
        assert!(g.is_up_to_date(z));
        assert!(g.routes_symmetric());
    }
}
