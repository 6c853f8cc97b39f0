//! Scene driver. Owns the graph, advances the time root once per tick,
//! and pulls watched fields on their schedule so values that nobody reads
//! explicitly still refresh.

use log::warn;

use crate::arena::FieldId;
use crate::cache::CacheOptions;
use crate::field::{Access, FieldDef, UpdateRule};
use crate::graph::Graph;
use crate::node::NodeId;
use crate::value::{TypeTag, Value};

/// When a watched field is pulled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PullPolicy {
    EveryTick,
    /// Every n-th tick.
    EveryTicks(u32),
    /// Whenever at least this much scene time has passed since the
    /// previous pull.
    EverySeconds(f64),
}

struct Watch {
    field: FieldId,
    policy: PullPolicy,
    countdown: u32,
    next_at: f64,
}

impl Watch {
    fn due(&mut self, now: f64) -> bool {
        match self.policy {
            PullPolicy::EveryTick => true,
            PullPolicy::EveryTicks(n) => {
                self.countdown = self.countdown.saturating_sub(1);
                if self.countdown == 0 {
                    self.countdown = n.max(1);
                    true
                } else {
                    false
                }
            }
            PullPolicy::EverySeconds(period) => {
                if now >= self.next_at {
                    self.next_at = now + period;
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// A graph plus the per-tick machinery around it: the time root every
/// cache activity probe hangs off, a frame sink that bounds event lifetime
/// to the tick, and the watch list.
pub struct Scene {
    pub graph: Graph,
    node: NodeId,
    time: FieldId,
    sink: FieldId,
    watches: Vec<Watch>,
    ticks: u64,
    now: f64,
}

impl Scene {
    pub fn new() -> Self {
        Self::with_options(CacheOptions::default())
    }

    pub fn with_options(options: CacheOptions) -> Self {
        let mut graph = Graph::with_options(options);
        let node = graph.register_node("Scene");
        let time = graph.add(
            FieldDef::new("time", TypeTag::Float)
                .access(Access::OutputOnly)
                .owner(node)
                .rule(UpdateRule::Source),
        );
        graph.time_root = Some(time);
        let sink = graph.add(
            FieldDef::new("frame_sink", TypeTag::Any)
                .owner(node)
                .map(|_| Value::Unit),
        );
        graph.mark_initialized(node);
        Self {
            graph,
            node,
            time,
            sink,
            watches: Vec::new(),
            ticks: 0,
            now: 0.0,
        }
    }

    /// The scene clock field. Owned output of the scene; anything may
    /// route from it.
    pub fn time(&self) -> FieldId {
        self.time
    }

    /// Catch-all sink. Route terminal outputs here; the sink pulls every
    /// one of them at the end of each tick, so their events never outlive
    /// the tick that raised them.
    pub fn frame_sink(&self) -> FieldId {
        self.sink
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    /// Pull `field` on the given schedule at the end of each tick.
    /// Watching a field again replaces its previous policy.
    pub fn watch(&mut self, field: FieldId, policy: PullPolicy) {
        self.unwatch(field);
        let countdown = match policy {
            PullPolicy::EveryTicks(n) => n.max(1),
            _ => 0,
        };
        let next_at = match policy {
            PullPolicy::EverySeconds(period) => self.now + period,
            _ => self.now,
        };
        self.watches.push(Watch {
            field,
            policy,
            countdown,
            next_at,
        });
    }

    pub fn unwatch(&mut self, field: FieldId) {
        self.watches.retain(|watch| watch.field != field);
    }

    /// Advance the scene by `dt` seconds: stamp and fire the time root,
    /// pull whatever watches are due, then drain the frame sink. Watches
    /// on removed fields are dropped here.
    pub fn tick(&mut self, dt: f64) {
        self.ticks += 1;
        self.now += dt;
        if let Err(err) = self.graph.set(self.time, Value::Float(self.now), Some(self.node)) {
            warn!("scene time write failed: {err}");
        }

        let mut due: Vec<FieldId> = Vec::new();
        let graph = &self.graph;
        let now = self.now;
        self.watches.retain_mut(|watch| {
            if !graph.contains(watch.field) {
                return false;
            }
            if watch.due(now) {
                due.push(watch.field);
            }
            true
        });
        for field in due {
            self.graph.up_to_date(field);
        }
        self.graph.up_to_date(self.sink);
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}
