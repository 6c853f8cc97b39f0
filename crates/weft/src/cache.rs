//! Dependency-aware draw caching. A cache field's "value" is a compiled,
//! replayable draw artifact; events arriving through its routes invalidate
//! the artifact, and the replay entry point rebuilds it once the upstream
//! caches are ready and the churn-damping delay has drained.

use std::fmt;

use log::{debug, warn};
use rustc_hash::FxHashSet;

use crate::arena::FieldId;
use crate::error::{CacheBuildFailure, GraphError};
use crate::field::{FieldDef, FieldKind, Phase, UpdateRule};
use crate::graph::Graph;
use crate::value::{TypeTag, Value};

/// Backend handle for a compiled draw list. Opaque to the graph.
pub type ArtifactId = u64;

/// How many times a cache renders directly after a break before it
/// compiles again.
pub const DEFAULT_CACHE_DELAY: u32 = 3;

/// Per-cache caching policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Always cache, whatever the graph-wide setting says.
    On,
    /// Never cache; every replay call renders directly.
    Off,
    /// Follow the graph-wide setting.
    #[default]
    Options,
}

/// Graph-wide caching policy, consulted by caches in [`CacheMode::Options`].
#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    pub use_caching: bool,
    /// Delay counter reset value for newly created caches.
    pub delay: u32,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            use_caching: true,
            delay: DEFAULT_CACHE_DELAY,
        }
    }
}

/// What the cache layer needs from a renderer: record a command stream
/// into an artifact, play it back, and throw it away. Everything else
/// about drawing is the owner callback's business.
pub trait RenderBackend {
    /// Open an artifact; commands issued by the render callback until
    /// [`finish_compile`](Self::finish_compile) are recorded into it.
    fn begin_compile(&mut self) -> ArtifactId;
    fn finish_compile(&mut self, artifact: ArtifactId) -> Result<(), CacheBuildFailure>;
    fn replay(&mut self, artifact: ArtifactId) -> Result<(), CacheBuildFailure>;
    fn discard(&mut self, artifact: ArtifactId);
}

/// The owner's side-effecting draw callback. May read other fields through
/// the graph; dependencies are established by routing, not by this call.
pub type RenderFn = Box<dyn FnMut(&mut Graph, &mut dyn RenderBackend)>;

/// Cache bookkeeping carried by a cache field.
pub struct CacheState {
    pub(crate) mode: CacheMode,
    pub(crate) artifact: Option<ArtifactId>,
    pub(crate) have_valid: bool,
    /// Compiles are held off while this counter is above zero; every
    /// direct-render miss drains it by one, every event refills it.
    pub(crate) delay: u32,
    pub(crate) delay_reset: u32,
    /// Probe field reporting whether the replay entry point ran recently.
    pub(crate) is_active: FieldId,
    pub(crate) ran_since_tick: bool,
    /// Fields that delivered an event since the last rebuild or direct
    /// render, kept for [`Graph::has_caused_event`].
    pub(crate) event_sources: FxHashSet<FieldId>,
    pub(crate) render: Option<RenderFn>,
}

impl CacheState {
    fn new(delay_reset: u32) -> Self {
        Self {
            mode: CacheMode::default(),
            artifact: None,
            have_valid: false,
            delay: delay_reset,
            delay_reset,
            is_active: FieldId::INVALID,
            ran_since_tick: true,
            event_sources: FxHashSet::default(),
            render: None,
        }
    }

    /// Rebuild bookkeeping from persisted state. Artifacts and event
    /// sources are transient and start empty; so does the render callback,
    /// which is re-bound with [`Graph::set_cache_render`].
    pub(crate) fn restored(
        mode: CacheMode,
        delay: u32,
        delay_reset: u32,
        is_active: FieldId,
        ran_since_tick: bool,
    ) -> Self {
        Self {
            mode,
            artifact: None,
            have_valid: false,
            delay,
            delay_reset,
            is_active,
            ran_since_tick,
            event_sources: FxHashSet::default(),
            render: None,
        }
    }
}

impl fmt::Debug for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheState")
            .field("mode", &self.mode)
            .field("artifact", &self.artifact)
            .field("have_valid", &self.have_valid)
            .field("delay", &self.delay)
            .field("is_active", &self.is_active)
            .finish()
    }
}

impl Graph {
    /// Add a cache field. It accepts routes of any type (dependencies are
    /// wired into it like into any field), owns the given render callback,
    /// and gets a companion activity probe wired to the scene time.
    pub fn add_cache_field(
        &mut self,
        def: FieldDef,
        render: impl FnMut(&mut Graph, &mut dyn RenderBackend) + 'static,
    ) -> FieldId {
        let cache = self.add(def);
        let delay = self.options.delay;
        let (owner, probe_name) = match self.arena.get_mut(cache) {
            Some(slot) => {
                slot.tag = TypeTag::Any;
                slot.rule = UpdateRule::Source;
                let mut state = CacheState::new(delay);
                state.render = Some(Box::new(render));
                slot.kind = FieldKind::Cache(Box::new(state));
                (slot.owner, format!("{}_active", slot.name))
            }
            None => return cache,
        };

        // The probe accepts the time route (hence Any) but holds a Bool.
        let probe = self.add(
            FieldDef::new(probe_name, TypeTag::Any)
                .value(Value::Bool(true))
                .rule(UpdateRule::ActivityProbe { cache })
                .auto_update()
                .unchecked(),
        );
        if let Some(state) = self.cache_state_mut(cache) {
            state.is_active = probe;
        }
        if let Some(time) = self.time_root {
            let _ = self.route_no_event(time, probe, None);
        }
        let break_root = self.ensure_break_root();
        let _ = self.route_no_event(break_root, cache, owner);

        if let Some(node) = owner {
            if let Some(info) = self.registry.get_mut(node) {
                info.cache = Some(cache);
            }
        }
        cache
    }

    fn ensure_break_root(&mut self) -> FieldId {
        if let Some(root) = self.break_root {
            if self.arena.is_valid(root) {
                return root;
            }
        }
        let root = self.add(
            FieldDef::new("break_caches", TypeTag::Unit)
                .rule(UpdateRule::Source)
                .unchecked(),
        );
        self.break_root = Some(root);
        root
    }

    fn cache_state(&self, f: FieldId) -> Option<&CacheState> {
        self.arena.get(f).and_then(|slot| slot.cache())
    }

    fn cache_state_mut(&mut self, f: FieldId) -> Option<&mut CacheState> {
        self.arena.get_mut(f).and_then(|slot| slot.cache_mut())
    }

    /// Event bookkeeping for a cache. Runs on every delivery, even one the
    /// stamp guard dropped: the sender did change, whatever its clock says.
    pub(crate) fn cache_note_event(&mut self, f: FieldId, source: FieldId) {
        let Some(state) = self.cache_state_mut(f) else {
            return;
        };
        state.have_valid = false;
        state.delay = state.delay_reset;
        state.event_sources.insert(source);
    }

    /// Hand the probe the ran-recently flag and clear it.
    pub(crate) fn cache_take_activity(&mut self, f: FieldId) -> bool {
        let Some(state) = self.cache_state_mut(f) else {
            return false;
        };
        let ran = state.ran_since_tick;
        state.ran_since_tick = false;
        ran
    }

    /// Whether caching applies to this field right now.
    pub fn using_caching(&self, f: FieldId) -> bool {
        match self.cache_state(f).map(|state| state.mode) {
            Some(CacheMode::On) => true,
            Some(CacheMode::Off) => false,
            Some(CacheMode::Options) => self.options.use_caching,
            None => false,
        }
    }

    pub fn cache_mode(&self, f: FieldId) -> Option<CacheMode> {
        self.cache_state(f).map(|state| state.mode)
    }

    /// Change the caching policy. Turning caching off invalidates and
    /// retires the artifact so a stale recording can never be replayed.
    pub fn set_cache_mode(&mut self, f: FieldId, mode: CacheMode) {
        let displaced = {
            let Some(slot) = self.arena.get_mut(f) else {
                return;
            };
            let Some(state) = slot.cache_mut() else {
                return;
            };
            state.mode = mode;
            if mode == CacheMode::Off {
                state.have_valid = false;
                state.artifact.take()
            } else {
                None
            }
        };
        if let Some(artifact) = displaced {
            self.retired.push(artifact);
        }
    }

    pub fn set_use_caching(&mut self, on: bool) {
        self.options.use_caching = on;
    }

    /// Attach or replace the owner's draw callback. Restored snapshots
    /// carry cache bookkeeping but no code; bind the callback here.
    pub fn set_cache_render(
        &mut self,
        f: FieldId,
        render: impl FnMut(&mut Graph, &mut dyn RenderBackend) + 'static,
    ) {
        if let Some(state) = self.cache_state_mut(f) {
            state.render = Some(Box::new(render));
        }
    }

    /// How many direct renders this cache makes after a break before it
    /// compiles again.
    pub fn caching_delay(&self, f: FieldId) -> u32 {
        self.cache_state(f).map_or(0, |state| state.delay_reset)
    }

    pub fn cache_valid(&self, f: FieldId) -> bool {
        self.cache_state(f).is_some_and(|state| state.have_valid)
    }

    /// Whether `source` has delivered an event to the cache since its last
    /// rebuild or direct render.
    pub fn has_caused_event(&self, cache: FieldId, source: FieldId) -> bool {
        self.cache_state(cache)
            .is_some_and(|state| state.event_sources.contains(&source))
    }

    /// Whether the cache's replay entry point ran during or since the last
    /// scene tick. Consults (and refreshes) the activity probe.
    pub fn cache_active(&mut self, f: FieldId) -> bool {
        let Some(probe) = self.cache_state(f).map(|state| state.is_active) else {
            return false;
        };
        self.up_to_date(probe);
        self.peek(probe).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Invalidate one cache: the artifact is marked stale, the churn delay
    /// refills, and an event fires so dependent caches re-evaluate.
    pub fn break_cache(&mut self, f: FieldId) -> Result<(), GraphError> {
        if !self.arena.is_valid(f) {
            return Err(GraphError::Stale(f));
        }
        if self.cache_state(f).is_none() {
            return Err(GraphError::NotCache(self.full_name(f)));
        }
        debug!("break cache {}", self.full_name(f));
        if let Some(state) = self.cache_state_mut(f) {
            state.have_valid = false;
            state.delay = state.delay_reset;
        }
        self.start_event(f);
        Ok(())
    }

    /// Invalidate every cache in the graph by firing the shared break
    /// root they are all wired to.
    pub fn rebuild_all(&mut self) {
        if let Some(root) = self.break_root {
            debug!("rebuild all caches");
            self.touch(root);
        }
    }

    /// The replay entry point, called once per cache per frame. Draws the
    /// cache's content by whichever means its state allows: replaying the
    /// artifact, rebuilding it, or invoking the owner's callback directly.
    ///
    /// Structural mistakes (not a cache, stale handle) are errors; a failed
    /// build is not, it degrades to a direct render for this frame and the
    /// next call re-evaluates from scratch.
    pub fn call_list(
        &mut self,
        f: FieldId,
        build: bool,
        backend: &mut dyn RenderBackend,
    ) -> Result<(), GraphError> {
        for artifact in self.retired.drain(..) {
            backend.discard(artifact);
        }
        let probe = match self.cache_state(f) {
            Some(state) => state.is_active,
            None if self.arena.is_valid(f) => {
                return Err(GraphError::NotCache(self.full_name(f)));
            }
            None => return Err(GraphError::Stale(f)),
        };
        self.store_value(probe, Value::Bool(true));
        if let Some(state) = self.cache_state_mut(f) {
            state.ran_since_tick = true;
        }

        if !self.using_caching(f) {
            // Suppressed: the owner's callback always runs, nothing is
            // replayed, and a stale artifact stays untouched.
            if let Some(slot) = self.arena.get_mut(f) {
                slot.pending = None;
            }
            self.render_direct(f, backend);
            return Ok(());
        }

        if build {
            let pending = self
                .arena
                .get(f)
                .is_some_and(|slot| slot.pending.is_some());
            if pending {
                self.rebuild(f, backend);
                return Ok(());
            }
            if !self.cache_valid(f) {
                let built = self.try_build(f, false, backend);
                if let Some(state) = self.cache_state_mut(f) {
                    state.have_valid = built;
                }
            }
        }

        let artifact = match self.cache_state(f) {
            Some(state) if state.have_valid => state.artifact,
            _ => None,
        };
        match artifact {
            Some(artifact) => self.replay(f, artifact, backend),
            None => self.render_direct(f, backend),
        }
        Ok(())
    }

    /// Pull specialization for a cache with a pending event: compile a new
    /// artifact if the graph is ready for one, draw either way, and consume
    /// the pending marker.
    fn rebuild(&mut self, f: FieldId, backend: &mut dyn RenderBackend) {
        {
            let Some(slot) = self.arena.get_mut(f) else {
                return;
            };
            if slot.phase == Phase::Updating {
                return;
            }
            slot.phase = Phase::Updating;
        }
        let built = self.try_build(f, true, backend);
        if let Some(state) = self.cache_state_mut(f) {
            state.have_valid = built;
        }
        if built {
            let artifact = self.cache_state(f).and_then(|state| state.artifact);
            if let Some(artifact) = artifact {
                self.replay(f, artifact, backend);
            }
        } else {
            self.run_render(f, backend);
            if let Some(state) = self.cache_state_mut(f) {
                if state.delay > 0 {
                    state.delay -= 1;
                }
            }
        }
        if let Some(state) = self.cache_state_mut(f) {
            state.event_sources.clear();
        }
        if let Some(slot) = self.arena.get_mut(f) {
            slot.pending = None;
            slot.phase = Phase::Idle;
        }
    }

    /// Compile an artifact from one run of the render callback. Refuses
    /// while the churn delay is draining or upstream caches are not ready.
    fn try_build(&mut self, f: FieldId, during_break: bool, backend: &mut dyn RenderBackend) -> bool {
        match self.cache_state(f) {
            Some(state) if state.delay == 0 => {}
            _ => return false,
        }
        if !self.using_caching(f) {
            return false;
        }
        let mut visited = FxHashSet::default();
        visited.insert(f);
        if !self.children_ready(f, during_break, &mut visited) {
            return false;
        }

        let artifact = backend.begin_compile();
        self.run_render(f, backend);
        match backend.finish_compile(artifact) {
            Ok(()) => {
                if let Some(state) = self.cache_state_mut(f) {
                    if let Some(old) = state.artifact.replace(artifact) {
                        backend.discard(old);
                    }
                }
                true
            }
            Err(err) => {
                warn!("draw list build failed for {}: {err}", self.full_name(f));
                backend.discard(artifact);
                false
            }
        }
    }

    /// Readiness of the caches feeding `f`, directly or through node
    /// references carried by its inputs.
    ///
    /// A caching child must already hold a valid artifact; while settled
    /// operation additionally waives that for children that have not been
    /// drawn recently, a rebuild sweep cannot trust the activity probes
    /// (they may themselves be mid-rebuild) and requires validity outright.
    /// A non-caching child renders directly, so its own children decide.
    fn children_ready(
        &mut self,
        f: FieldId,
        during_break: bool,
        visited: &mut FxHashSet<FieldId>,
    ) -> bool {
        let ins: Vec<FieldId> = self.routes_in(f).to_vec();
        for input in ins {
            let tag = match self.arena.get(input) {
                Some(slot) => slot.tag,
                None => continue,
            };
            if matches!(tag, TypeTag::NodeRef | TypeTag::List) {
                self.up_to_date(input);
            }
            for child in self.resolve_child_caches(input) {
                if !visited.insert(child) {
                    continue;
                }
                if !self.using_caching(child) {
                    if !self.children_ready(child, during_break, visited) {
                        return false;
                    }
                    continue;
                }
                let Some(valid) = self.cache_state(child).map(|state| state.have_valid) else {
                    continue;
                };
                if during_break {
                    if !valid {
                        return false;
                    }
                } else if self.cache_active(child) && !valid {
                    return false;
                }
            }
        }
        true
    }

    /// The cache fields an input contributes: the input itself if it is
    /// one, or the caches of the node(s) it refers to.
    fn resolve_child_caches(&self, input: FieldId) -> Vec<FieldId> {
        let Some(slot) = self.arena.get(input) else {
            return Vec::new();
        };
        if matches!(slot.kind, FieldKind::Cache(_)) {
            return vec![input];
        }
        match &slot.value {
            Value::NodeRef(Some(node)) => self.node_cache(*node).into_iter().collect(),
            Value::List(items) => items
                .iter()
                .filter_map(Value::as_node)
                .filter_map(|node| self.node_cache(node))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn replay(&mut self, f: FieldId, artifact: ArtifactId, backend: &mut dyn RenderBackend) {
        if let Err(err) = backend.replay(artifact) {
            warn!("replay failed for {}: {err}", self.full_name(f));
            if let Some(state) = self.cache_state_mut(f) {
                state.have_valid = false;
            }
        }
    }

    /// A miss: the owner's callback draws this frame with nothing recorded.
    fn render_direct(&mut self, f: FieldId, backend: &mut dyn RenderBackend) {
        self.run_render(f, backend);
        if let Some(state) = self.cache_state_mut(f) {
            state.event_sources.clear();
            if state.delay > 0 {
                state.delay -= 1;
            }
        }
    }

    fn run_render(&mut self, f: FieldId, backend: &mut dyn RenderBackend) {
        let Some(mut render) = self
            .cache_state_mut(f)
            .and_then(|state| state.render.take())
        else {
            return;
        };
        render(self, backend);
        if let Some(state) = self.cache_state_mut(f) {
            state.render = Some(render);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::field::FieldDef;

    #[derive(Default)]
    struct TestBackend {
        next: ArtifactId,
        live: FxHashSet<ArtifactId>,
        replays: Vec<ArtifactId>,
        discards: Vec<ArtifactId>,
        fail_next_compile: bool,
    }

    impl RenderBackend for TestBackend {
        fn begin_compile(&mut self) -> ArtifactId {
            self.next += 1;
            self.next
        }

        fn finish_compile(&mut self, artifact: ArtifactId) -> Result<(), CacheBuildFailure> {
            if self.fail_next_compile {
                self.fail_next_compile = false;
                return Err(CacheBuildFailure::new("compile rejected"));
            }
            self.live.insert(artifact);
            Ok(())
        }

        fn replay(&mut self, artifact: ArtifactId) -> Result<(), CacheBuildFailure> {
            if !self.live.contains(&artifact) {
                return Err(CacheBuildFailure::new("unknown artifact"));
            }
            self.replays.push(artifact);
            Ok(())
        }

        fn discard(&mut self, artifact: ArtifactId) {
            self.live.remove(&artifact);
            self.discards.push(artifact);
        }
    }

    fn counting_cache(g: &mut Graph, name: &str) -> (FieldId, Rc<Cell<u32>>) {
        let renders = Rc::new(Cell::new(0u32));
        let seen = renders.clone();
        let cache = g.add_cache_field(FieldDef::new(name, TypeTag::Any), move |_, _| {
            seen.set(seen.get() + 1);
        });
        (cache, renders)
    }

    fn eager_graph() -> Graph {
        // delay 0 so compiles are not held off in these tests
        Graph::with_options(CacheOptions {
            use_caching: true,
            delay: 0,
        })
    }

    #[test]
    fn renders_once_then_replays() {
        let mut g = eager_graph();
        let mut backend = TestBackend::default();
        let (cache, renders) = counting_cache(&mut g, "draw");

        g.call_list(cache, true, &mut backend).unwrap();
        g.call_list(cache, true, &mut backend).unwrap();

        // one recorded run of the callback, two replays of the artifact
        assert_eq!(renders.get(), 1);
        assert_eq!(backend.replays.len(), 2);
        assert!(g.cache_valid(cache));
    }

    #[test]
    fn break_cache_forces_a_fresh_render() {
        let mut g = eager_graph();
        let mut backend = TestBackend::default();
        let (cache, renders) = counting_cache(&mut g, "draw");

        g.call_list(cache, true, &mut backend).unwrap();
        assert_eq!(renders.get(), 1);

        g.break_cache(cache).unwrap();
        assert!(!g.cache_valid(cache));
        g.call_list(cache, true, &mut backend).unwrap();
        assert_eq!(renders.get(), 2);
    }

    #[test]
    fn events_invalidate_and_refill_the_delay() {
        let mut g = Graph::new(); // default delay of 3
        let mut backend = TestBackend::default();
        let (cache, renders) = counting_cache(&mut g, "draw");
        let input = g.add(FieldDef::new("geometry", TypeTag::Int));
        g.route_no_event(input, cache, None).unwrap();

        // three misses drain the delay, the fourth call compiles
        for _ in 0..4 {
            g.call_list(cache, true, &mut backend).unwrap();
        }
        assert_eq!(renders.get(), 4);
        assert!(g.cache_valid(cache));
        assert_eq!(backend.replays.len(), 1);

        g.set(input, Value::Int(9), None).unwrap();
        assert!(!g.cache_valid(cache));
        assert!(g.has_caused_event(cache, input));

        // the event refilled the delay, so this is a direct render again
        g.call_list(cache, true, &mut backend).unwrap();
        assert_eq!(renders.get(), 5);
        assert!(!g.has_caused_event(cache, input));
    }

    #[test]
    fn suppressed_cache_never_replays() {
        let mut g = eager_graph();
        let mut backend = TestBackend::default();
        let (cache, renders) = counting_cache(&mut g, "draw");

        g.call_list(cache, true, &mut backend).unwrap();
        assert!(g.cache_valid(cache));

        g.set_cache_mode(cache, CacheMode::Off);
        g.call_list(cache, true, &mut backend).unwrap();
        g.call_list(cache, true, &mut backend).unwrap();

        assert_eq!(renders.get(), 3);
        assert_eq!(backend.replays.len(), 1);
        // the stale artifact was handed back to the backend
        assert_eq!(backend.discards.len(), 1);
        assert!(backend.live.is_empty());
    }

    #[test]
    fn graph_wide_toggle_governs_options_mode() {
        let mut g = eager_graph();
        let mut backend = TestBackend::default();
        let (cache, renders) = counting_cache(&mut g, "draw");

        g.set_use_caching(false);
        g.call_list(cache, true, &mut backend).unwrap();
        assert_eq!(renders.get(), 1);
        assert!(!g.cache_valid(cache));

        // per-cache On overrides the graph-wide off switch
        g.set_cache_mode(cache, CacheMode::On);
        g.call_list(cache, true, &mut backend).unwrap();
        assert!(g.cache_valid(cache));
    }

    #[test]
    fn failed_build_degrades_to_direct_render() {
        let mut g = eager_graph();
        let mut backend = TestBackend {
            fail_next_compile: true,
            ..TestBackend::default()
        };
        let (cache, renders) = counting_cache(&mut g, "draw");

        g.call_list(cache, true, &mut backend).unwrap();
        assert_eq!(renders.get(), 2); // failed compile run, then the direct draw
        assert!(!g.cache_valid(cache));
        assert!(backend.live.is_empty());

        // nothing is poisoned: the next call compiles normally
        g.call_list(cache, true, &mut backend).unwrap();
        assert!(g.cache_valid(cache));
        assert_eq!(backend.replays.len(), 1);
    }

    #[test]
    fn plain_fields_are_not_caches() {
        let mut g = eager_graph();
        let mut backend = TestBackend::default();
        let plain = g.add(FieldDef::new("x", TypeTag::Int));
        let err = g.call_list(plain, true, &mut backend).unwrap_err();
        assert!(matches!(err, GraphError::NotCache(_)));
    }

    #[test]
    fn stale_child_cache_blocks_the_parent_build() {
        let mut g = eager_graph();
        let mut backend = TestBackend::default();
        let (child, child_renders) = counting_cache(&mut g, "leaf");
        let (parent, parent_renders) = counting_cache(&mut g, "group");
        g.route_no_event(child, parent, None).unwrap();

        // the child has never been built and its probe still reads active
        g.call_list(parent, true, &mut backend).unwrap();
        assert!(!g.cache_valid(parent));
        assert_eq!(parent_renders.get(), 1);

        g.call_list(child, true, &mut backend).unwrap();
        assert!(g.cache_valid(child));
        assert_eq!(child_renders.get(), 1);

        g.call_list(parent, true, &mut backend).unwrap();
        assert!(g.cache_valid(parent));
    }
}
