//! Cross-thread mirrors. The graph itself is single-threaded per tick;
//! a mirror is the one sanctioned way across that boundary. It double
//! buffers a value behind a lock: one side is a plain field in the graph,
//! the other a cloneable handle usable from any thread. Each mirror
//! carries values in one direction only.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::FieldId;
use crate::error::GraphError;
use crate::field::FieldDef;
use crate::graph::Graph;
use crate::value::Value;

#[derive(Debug)]
struct Buffer {
    value: Value,
    dirty: bool,
}

/// Graph-side end of a mirror. Held by whoever runs the tick loop;
/// [`drain`](Self::drain) and [`publish`](Self::publish) are the only
/// points where the buffer and the graph meet.
pub struct MirrorField {
    field: FieldId,
    shared: Arc<Mutex<Buffer>>,
}

/// Thread-side end. Clone it freely and move clones into worker threads.
#[derive(Clone)]
pub struct MirrorHandle {
    shared: Arc<Mutex<Buffer>>,
}

impl MirrorField {
    /// Add the backing field to the graph and return both ends. The buffer
    /// starts out holding the field's initial value, not dirty.
    pub fn new(graph: &mut Graph, def: FieldDef) -> (MirrorField, MirrorHandle) {
        let field = graph.add(def);
        let value = graph.peek(field).cloned().unwrap_or(Value::Unit);
        let shared = Arc::new(Mutex::new(Buffer {
            value,
            dirty: false,
        }));
        (
            MirrorField {
                field,
                shared: shared.clone(),
            },
            MirrorHandle { shared },
        )
    }

    pub fn field(&self) -> FieldId {
        self.field
    }

    /// Inbound direction: move a value written by another thread into the
    /// graph. If the buffer is dirty its value is taken, type checked, and
    /// written with a full event; returns `Ok(true)`. Otherwise the field
    /// is merely pulled so graph-side updates stay visible; `Ok(false)`.
    ///
    /// The lock is released before the graph is touched, so a worker
    /// storing concurrently never waits on propagation.
    pub fn drain(&self, graph: &mut Graph) -> Result<bool, GraphError> {
        let taken = {
            let mut buffer = self.shared.lock();
            if buffer.dirty {
                buffer.dirty = false;
                Some(buffer.value.clone())
            } else {
                None
            }
        };
        let Some(value) = taken else {
            graph.up_to_date(self.field);
            return Ok(false);
        };
        let tag = match graph.arena.get(self.field) {
            Some(slot) => slot.tag,
            None => return Err(GraphError::Stale(self.field)),
        };
        if !tag.accepts(value.tag()) {
            return Err(GraphError::ValueType {
                field: graph.full_name(self.field),
                expected: tag,
                found: value.tag(),
            });
        }
        graph.store_value(self.field, value);
        graph.start_event(self.field);
        Ok(true)
    }

    /// Outbound direction: pull the field and copy its current value into
    /// the buffer for worker threads to [`load`](MirrorHandle::load).
    pub fn publish(&self, graph: &mut Graph) {
        graph.up_to_date(self.field);
        if let Some(value) = graph.peek(self.field).cloned() {
            self.shared.lock().value = value;
        }
    }
}

impl MirrorHandle {
    /// Store a value for the next [`MirrorField::drain`]. Overwrites any
    /// value stored since the last drain; the graph only ever sees the
    /// latest one.
    pub fn store(&self, value: Value) {
        let mut buffer = self.shared.lock();
        buffer.value = value;
        buffer.dirty = true;
    }

    /// Read the most recently published (or stored) value.
    pub fn load(&self) -> Value {
        self.shared.lock().value.clone()
    }
}
