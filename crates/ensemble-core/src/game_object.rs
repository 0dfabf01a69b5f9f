//! The composite entity and its per-tick scheduler.
//!
//! A [`GameObject`] owns
//!
//! - a [`ModuleTree`] of spatial modules (and docked objects, by handle),
//! - a map of virtual modules that take no part in the spatial tree,
//! - one instance per attached concept kind,
//! - the event-demand multimap (event id → subscribed concepts),
//! - the concept dependency pairs and the update order derived from them,
//! - object-wide values.
//!
//! Attaching a module instantiates (or reuses) the concepts the module asks
//! for and rebuilds the update order. Each tick, [`GameObject::update`] walks
//! that order, dependencies first.
//!
//! Objects are created through [`GameObject::new`], which registers them in
//! the session [`Environment`]; they deregister when dropped.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::adapter::{compose_chain, Adapter, AdapterId};
use crate::concept::{Concept, ConceptContext, ConceptId, ConceptSetup, ConceptState};
use crate::environment::Environment;
use crate::event::{
    ActionId, Event, EventId, EventPayload, EventQueue, GameObjectEvent, PhysicsEvent, ViewEvent,
};
use crate::factory::PluginMap;
use crate::handle::GameHandle;
use crate::module::Module;
use crate::tree::{ModuleTree, NodeKey, Part};
use crate::value::{
    read_as, Location, PluginId, Value, ValueId, ValueStorage, ValueType, VarId,
};
use crate::CoreError;

/// Maximum number of value-update notifications delivered in one cascade
/// before the owner gives up with [`CoreError::ValueUpdateCascade`].
pub const MAX_VALUE_UPDATE_CASCADE: usize = 1024;

/// Plugin id reserved for object-level values owned by this crate.
pub const RESERVED_PLUGIN: PluginId = PluginId(0);

/// World pose of the object, when known. Used to place docked objects that
/// are released and re-announced on reinitialize.
pub const LOCATION: ValueId = ValueId {
    var: VarId(0),
    plugin: RESERVED_PLUGIN,
};

// ---------------------------------------------------------------------------
// Parts
// ---------------------------------------------------------------------------

/// Module storage of one object: the spatial tree plus virtual modules.
#[derive(Debug)]
pub(crate) struct Parts {
    pub(crate) tree: ModuleTree,
    pub(crate) virtual_modules: BTreeMap<GameHandle, Module>,
}

impl Parts {
    pub(crate) fn module(&self, handle: GameHandle) -> Option<&Module> {
        self.tree
            .module(handle)
            .or_else(|| self.virtual_modules.get(&handle))
    }

    pub(crate) fn module_mut(&mut self, handle: GameHandle) -> Option<&mut Module> {
        if self.tree.contains(handle) {
            self.tree.module_mut(handle)
        } else {
            self.virtual_modules.get_mut(&handle)
        }
    }

    /// Pose of the spatial part `handle` relative to the root.
    pub(crate) fn location_from_root(&self, handle: GameHandle) -> Option<Location> {
        let key = self.tree.find(handle)?;
        Some(self.location_of_key(key))
    }

    fn location_of_key(&self, key: NodeKey) -> Location {
        let chain = self.tree.path_to_root(key);
        compose_chain(chain.iter().rev())
    }
}

/// Human-readable dump of an object's concepts, values and modules. Used in
/// error messages for missing values.
pub(crate) fn dump_state<'a>(
    owner: GameHandle,
    concepts: impl Iterator<Item = &'a ConceptId>,
    values: &ValueStorage,
    parts: &Parts,
) -> String {
    let mut names: Vec<&str> = concepts.map(ConceptId::as_str).collect();
    names.sort_unstable();

    let mut out = String::new();
    let _ = writeln!(out, "GameObject {owner}");
    let _ = writeln!(out, "  concepts: [{}]", names.join(", "));
    let _ = writeln!(out, "  values:");
    for (id, value) in values {
        let _ = writeln!(out, "    {id} = {value} ({})", value.kind_name());
    }
    let _ = writeln!(out, "  modules:");
    let spatial = parts.tree.parts().filter_map(Part::as_module).map(|m| (m, "spatial"));
    let virtuals = parts.virtual_modules.values().map(|m| (m, "virtual"));
    for (module, kind) in spatial.chain(virtuals) {
        let wanted: Vec<&str> = module
            .required_concepts()
            .iter()
            .map(ConceptId::as_str)
            .collect();
        let _ = writeln!(
            out,
            "    {} ({kind}) concepts: [{}]",
            module.handle(),
            wanted.join(", ")
        );
        for (id, value) in module.values() {
            let _ = writeln!(out, "      {id} = {value}");
        }
    }
    for handle in parts.tree.parts().filter_map(|p| match p {
        Part::Object(h) => Some(*h),
        Part::Module(_) => None,
    }) {
        let _ = writeln!(out, "    {handle} (docked object)");
    }
    out
}

// ---------------------------------------------------------------------------
// GameObject
// ---------------------------------------------------------------------------

struct ConceptSlot {
    state: ConceptState,
    behavior: Box<dyn Concept>,
}

/// A composite entity: module tree + concepts + update schedule.
pub struct GameObject {
    handle: GameHandle,
    environment: Environment,
    plugins: Rc<PluginMap>,
    parts: Parts,
    /// Handles of every attached module, spatial and virtual.
    module_handles: BTreeSet<GameHandle>,
    /// Attach order.
    concepts: Vec<ConceptSlot>,
    concept_index: HashMap<ConceptId, usize>,
    event_demands: BTreeMap<EventId, Vec<usize>>,
    /// `(dependent, dependency)` pairs in registration order.
    dependencies: Vec<(ConceptId, ConceptId)>,
    update_order: Vec<usize>,
    values: ValueStorage,
    docked: bool,
    activated: bool,
    pending: VecDeque<Event>,
    outbox: EventQueue,
}

impl std::fmt::Debug for GameObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameObject")
            .field("handle", &self.handle)
            .field("modules", &self.module_handles.len())
            .field("concepts", &self.concept_ids())
            .field("docked", &self.docked)
            .field("activated", &self.activated)
            .finish()
    }
}

impl GameObject {
    /// Create an empty object and register it in `environment`.
    ///
    /// The root module (carrying the same `handle`) must be attached next via
    /// [`attach_module`](Self::attach_module) with a null parent.
    pub fn new(
        handle: GameHandle,
        environment: &Environment,
        plugins: Rc<PluginMap>,
    ) -> Rc<RefCell<GameObject>> {
        let object = Rc::new(RefCell::new(GameObject {
            handle,
            environment: environment.clone(),
            plugins,
            parts: Parts {
                tree: ModuleTree::new(handle),
                virtual_modules: BTreeMap::new(),
            },
            module_handles: BTreeSet::new(),
            concepts: Vec::new(),
            concept_index: HashMap::new(),
            event_demands: BTreeMap::new(),
            dependencies: Vec::new(),
            update_order: Vec::new(),
            values: ValueStorage::new(),
            docked: false,
            activated: true,
            pending: VecDeque::new(),
            outbox: EventQueue::new(),
        }));
        environment.add(handle, &object);
        debug!(object = %handle, "game object created");
        object
    }

    // -- accessors ----------------------------------------------------------

    pub fn handle(&self) -> GameHandle {
        self.handle
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn is_docked(&self) -> bool {
        self.docked
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    pub fn set_activated(&mut self, activated: bool) {
        self.activated = activated;
    }

    pub fn tree(&self) -> &ModuleTree {
        &self.parts.tree
    }

    /// Number of virtual modules.
    pub fn virtual_module_count(&self) -> usize {
        self.parts.virtual_modules.len()
    }

    /// Handles of every attached module (spatial and virtual), ascending.
    pub fn module_handles(&self) -> impl Iterator<Item = GameHandle> + '_ {
        self.module_handles.iter().copied()
    }

    pub fn has_module(&self, handle: GameHandle) -> bool {
        self.module_handles.contains(&handle)
    }

    pub fn module(&self, handle: GameHandle) -> Option<&Module> {
        self.parts.module(handle)
    }

    pub fn module_mut(&mut self, handle: GameHandle) -> Option<&mut Module> {
        self.parts.module_mut(handle)
    }

    /// Handles of docked objects in this object's tree.
    pub fn docked_objects(&self) -> Vec<GameHandle> {
        self.parts
            .tree
            .parts()
            .filter_map(|p| match p {
                Part::Object(h) => Some(*h),
                Part::Module(_) => None,
            })
            .collect()
    }

    /// Attached concept ids, in attach order.
    pub fn concept_ids(&self) -> Vec<&ConceptId> {
        self.concepts.iter().map(|s| &s.state.id).collect()
    }

    pub fn has_concept(&self, concept: &ConceptId) -> bool {
        self.concept_index.contains_key(concept)
    }

    pub fn concept_state(&self, concept: &ConceptId) -> Option<&ConceptState> {
        self.concept_index
            .get(concept)
            .map(|&i| &self.concepts[i].state)
    }

    /// Typed access to an attached concept.
    pub fn concept<T: Concept + 'static>(&self, concept: &ConceptId) -> Option<&T> {
        let &i = self.concept_index.get(concept)?;
        self.concepts[i].behavior.as_ref().as_any().downcast_ref::<T>()
    }

    pub fn concept_mut<T: Concept + 'static>(&mut self, concept: &ConceptId) -> Option<&mut T> {
        let &i = self.concept_index.get(concept)?;
        self.concepts[i]
            .behavior
            .as_mut()
            .as_any_mut()
            .downcast_mut::<T>()
    }

    /// The current tick order.
    pub fn update_order(&self) -> Vec<&ConceptId> {
        self.update_order
            .iter()
            .map(|&i| &self.concepts[i].state.id)
            .collect()
    }

    /// Registered `(dependent, dependency)` pairs.
    pub fn dependencies(&self) -> &[(ConceptId, ConceptId)] {
        &self.dependencies
    }

    /// Concepts subscribed to `event`, in subscription order.
    pub fn subscribers(&self, event: EventId) -> Vec<&ConceptId> {
        self.event_demands
            .get(&event)
            .map(|v| v.iter().map(|&i| &self.concepts[i].state.id).collect())
            .unwrap_or_default()
    }

    /// Take everything queued for the session driver.
    pub fn drain_events(&mut self) -> Vec<Event> {
        self.outbox.drain()
    }

    pub fn pending_event_count(&self) -> usize {
        self.outbox.len()
    }

    // -- object-wide values ---------------------------------------------------

    /// Read an object-wide value. A missing value is an authoring bug, so
    /// the error carries a full dump of this object.
    pub fn value<T: ValueType>(&self, id: ValueId) -> Result<T, CoreError> {
        match self.values.get(&id) {
            Some(value) => read_as(id, value),
            None => Err(CoreError::ValueNotFound {
                owner: self.handle,
                id,
                dump: self.debug_dump(),
            }),
        }
    }

    pub fn has_value(&self, id: ValueId) -> bool {
        self.values.contains_key(&id)
    }

    pub fn values(&self) -> &ValueStorage {
        &self.values
    }

    /// Store an object-wide value and deliver
    /// [`GameObjectEvent::ValueUpdated`] to subscribed concepts.
    pub fn set_value(&mut self, id: ValueId, value: impl Into<Value>) -> Result<(), CoreError> {
        self.values.insert(id, value.into());
        self.pending.push_back(Event::new(
            GameObjectEvent::ValueUpdated,
            EventPayload::Value(id),
            self.handle,
            self.handle,
        ));
        self.pump_value_updates()
    }

    /// Concepts, values and modules of this object, one per line.
    pub fn debug_dump(&self) -> String {
        dump_state(
            self.handle,
            self.concept_index.keys(),
            &self.values,
            &self.parts,
        )
    }

    // -- structure ------------------------------------------------------------

    /// Attach a spatial part.
    ///
    /// With a null `parent` this attaches the root, which must be the first
    /// part and carry this object's own handle. Otherwise `part` is welded
    /// with its slot `child_adapter` to slot `parent_adapter` of the
    /// already attached `parent`.
    ///
    /// Attaching a module instantiates the concepts it asks for. Attaching a
    /// [`Part::Object`] docks that object here; its concepts stay its own.
    pub fn attach_module(
        &mut self,
        part: Part,
        adapters: &[Adapter],
        child_adapter: AdapterId,
        parent: GameHandle,
        parent_adapter: AdapterId,
    ) -> Result<(), CoreError> {
        let handle = part.handle();
        let docking = matches!(part, Part::Object(_));

        let parent_key = if parent.is_null() {
            if !self.parts.tree.is_empty() {
                return Err(CoreError::RootAlreadyAttached { owner: self.handle });
            }
            if handle != self.handle || docking {
                return Err(CoreError::RootHandleMismatch {
                    owner: self.handle,
                    root: handle,
                });
            }
            None
        } else {
            let key = self
                .parts
                .tree
                .find(parent)
                .ok_or(CoreError::ParentNotFound {
                    owner: self.handle,
                    parent,
                })?;
            Some(key)
        };
        if self.module_handles.contains(&handle) {
            return Err(CoreError::DuplicateHandle {
                owner: self.handle,
                handle,
            });
        }
        if docking {
            self.check_dockable(handle)?;
        }

        let key = self.parts.tree.add_vertex(part, adapters)?;
        match parent_key {
            None => self.parts.tree.set_root(key),
            Some(parent_key) => {
                if let Err(err) =
                    self.parts
                        .tree
                        .connect(parent_key, parent_adapter, key, child_adapter)
                {
                    self.parts.tree.remove_subtree(key);
                    return Err(err);
                }
            }
        }

        let location = self.parts.location_of_key(key);
        debug!(
            object = %self.handle,
            part = %handle,
            parent = %parent,
            docking,
            "attached part"
        );

        if docking {
            if let Err(err) = self.connect_other_game_object(handle, location) {
                warn!(object = %self.handle, docked = %handle, error = %err, "rolling back dock");
                self.discard_part(key);
                return Err(err);
            }
            return Ok(());
        }

        self.module_handles.insert(handle);
        self.emit_module_pose(handle, location);
        if let Err(err) = self.notify_property_concepts(handle) {
            warn!(object = %self.handle, module = %handle, error = %err, "rolling back module attach");
            self.discard_part(key);
            self.rebuild_concept_update_order();
            return Err(err);
        }
        Ok(())
    }

    /// Attach a virtual (non-spatial) module.
    pub fn attach_virtual_module(&mut self, module: Module) -> Result<(), CoreError> {
        let handle = module.handle();
        if self.module_handles.contains(&handle) || self.parts.tree.contains(handle) {
            return Err(CoreError::DuplicateHandle {
                owner: self.handle,
                handle,
            });
        }
        self.parts.virtual_modules.insert(handle, module);
        self.module_handles.insert(handle);
        debug!(object = %self.handle, module = %handle, "attached virtual module");

        if let Err(err) = self.notify_property_concepts(handle) {
            warn!(object = %self.handle, module = %handle, error = %err, "rolling back module attach");
            self.discard_virtual(handle);
            self.rebuild_concept_update_order();
            return Err(err);
        }
        Ok(())
    }

    /// Detach a module (and everything hanging below it) or undock a docked
    /// object.
    ///
    /// The parent's slot becomes free again. Returns `Ok(false)` if `handle`
    /// is not attached here.
    pub fn detach_module(&mut self, handle: GameHandle) -> Result<bool, CoreError> {
        if handle == self.handle {
            return Err(CoreError::DetachRoot { owner: self.handle });
        }
        if self.parts.virtual_modules.contains_key(&handle) {
            self.discard_virtual(handle);
            self.pump_value_updates()?;
            debug!(object = %self.handle, module = %handle, "detached virtual module");
            return Ok(true);
        }
        let Some(key) = self.parts.tree.find(handle) else {
            return Ok(false);
        };

        // Docked objects anywhere below are released at their current pose.
        let released: Vec<(GameHandle, Location)> = self
            .parts
            .tree
            .subtree(key)
            .into_iter()
            .filter_map(|k| match self.parts.tree.part(k) {
                Some(Part::Object(h)) => Some((*h, self.parts.location_of_key(k))),
                _ => None,
            })
            .collect();

        self.discard_part(key);
        for (object, location) in released {
            self.disconnect_other_game_object(object, location)?;
        }
        self.pump_value_updates()?;
        debug!(object = %self.handle, part = %handle, "detached part");
        Ok(true)
    }

    /// Undock every object docked anywhere in this object's tree, releasing
    /// each at its current world pose. Returns the released handles.
    pub fn release_docked(&mut self) -> Result<Vec<GameHandle>, CoreError> {
        let docked = self.docked_objects();
        for &object in &docked {
            self.detach_module(object)?;
        }
        Ok(docked)
    }

    /// Weld `child` to `parent` in the tree. See [`ModuleTree::connect`].
    pub fn connect_child_to_parent(
        &mut self,
        parent: GameHandle,
        parent_adapter: AdapterId,
        child: GameHandle,
        child_adapter: AdapterId,
    ) -> Result<Adapter, CoreError> {
        let tree = &mut self.parts.tree;
        let parent_key = tree.find(parent).ok_or(CoreError::ParentNotFound {
            owner: self.handle,
            parent,
        })?;
        let child_key = tree.find(child).ok_or(CoreError::ModuleNotFound {
            owner: self.handle,
            module: child,
        })?;
        tree.connect(parent_key, parent_adapter, child_key, child_adapter)
    }

    /// Pose of the spatial part `handle` relative to the root, computed by
    /// welding every adapter on the path from the root down.
    pub fn vector_to_module_from_root(&self, handle: GameHandle) -> Result<Location, CoreError> {
        self.parts
            .location_from_root(handle)
            .ok_or(CoreError::ModuleNotFound {
                owner: self.handle,
                module: handle,
            })
    }

    // -- concepts -------------------------------------------------------------

    /// Instantiate (or reuse) every concept `module` asks for, hand the
    /// module to each of them, then rebuild the update order.
    pub fn notify_property_concepts(&mut self, module: GameHandle) -> Result<(), CoreError> {
        let required: Vec<ConceptId> = self
            .parts
            .module(module)
            .ok_or(CoreError::ModuleNotFound {
                owner: self.handle,
                module,
            })?
            .required_concepts()
            .to_vec();

        let result = self.admit_module(module, &required);
        self.rebuild_concept_update_order();
        result
    }

    fn admit_module(&mut self, module: GameHandle, required: &[ConceptId]) -> Result<(), CoreError> {
        for id in required {
            let index = match self.concept_index.get(id) {
                Some(&i) => {
                    let m = self.parts.module(module).ok_or(CoreError::ModuleNotFound {
                        owner: self.handle,
                        module,
                    })?;
                    self.concepts[i].state.admit(self.handle, m)?;
                    i
                }
                None => {
                    let (mut slot, deps) = self.build_concept(id)?;
                    let m = self.parts.module(module).ok_or(CoreError::ModuleNotFound {
                        owner: self.handle,
                        module,
                    })?;
                    slot.state.admit(self.handle, m)?;
                    self.insert_concept(slot, deps)
                }
            };
            self.run_hook(index, |concept, ctx| concept.on_module_attached(ctx, module))?;
            self.pump_value_updates()?;
        }
        Ok(())
    }

    /// Run the constructor for `id` without attaching the result yet.
    fn build_concept(
        &self,
        id: &ConceptId,
    ) -> Result<(ConceptSlot, Vec<(ConceptId, ConceptId)>), CoreError> {
        let factory = self.plugins.factory(id)?;
        let mut setup = ConceptSetup::new(self.handle, id, factory.plugin(), &self.concept_index);
        let behavior = factory.build(&mut setup)?;

        let deps = setup
            .requires
            .iter()
            .chain(setup.after.iter())
            .map(|other| (id.clone(), other.clone()))
            .collect();
        let state = ConceptState {
            id: id.clone(),
            plugin: factory.plugin(),
            modules: BTreeSet::new(),
            init_vars: setup.init_vars,
            events: setup.events,
        };
        Ok((ConceptSlot { state, behavior }, deps))
    }

    fn insert_concept(&mut self, slot: ConceptSlot, deps: Vec<(ConceptId, ConceptId)>) -> usize {
        let index = self.concepts.len();
        for event in &slot.state.events {
            self.event_demands.entry(*event).or_default().push(index);
        }
        debug!(
            object = %self.handle,
            concept = %slot.state.id,
            events = slot.state.events.len(),
            dependencies = deps.len(),
            "concept attached"
        );
        self.concept_index.insert(slot.state.id.clone(), index);
        self.dependencies.extend(deps);
        self.concepts.push(slot);
        index
    }

    /// Recompute the tick order: a depth-first walk over the dependency
    /// graph appends each concept when it finishes, so dependencies come
    /// first. Concepts without dependency edges follow in attach order.
    pub fn rebuild_concept_update_order(&mut self) {
        let mut vertices: Vec<usize> = Vec::new();
        let mut edges: HashMap<usize, Vec<usize>> = HashMap::new();
        for (dependent, dependency) in &self.dependencies {
            let (Some(&from), Some(&to)) = (
                self.concept_index.get(dependent),
                self.concept_index.get(dependency),
            ) else {
                // Ordering-only dependency on something not attached.
                continue;
            };
            for v in [from, to] {
                if !vertices.contains(&v) {
                    vertices.push(v);
                }
            }
            edges.entry(from).or_default().push(to);
        }

        fn visit(
            v: usize,
            edges: &HashMap<usize, Vec<usize>>,
            visited: &mut HashSet<usize>,
            on_stack: &mut HashSet<usize>,
            order: &mut Vec<usize>,
        ) -> bool {
            if on_stack.contains(&v) {
                return false;
            }
            if !visited.insert(v) {
                return true;
            }
            on_stack.insert(v);
            let mut acyclic = true;
            for &next in edges.get(&v).map(Vec::as_slice).unwrap_or_default() {
                acyclic &= visit(next, edges, visited, on_stack, order);
            }
            on_stack.remove(&v);
            order.push(v);
            acyclic
        }

        let mut order = Vec::with_capacity(self.concepts.len());
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        for &v in &vertices {
            if !visit(v, &edges, &mut visited, &mut on_stack, &mut order) {
                warn!(
                    object = %self.handle,
                    concept = %self.concepts[v].state.id,
                    "cycle among concept dependencies; order within the cycle is arbitrary"
                );
            }
        }
        for i in 0..self.concepts.len() {
            if !visited.contains(&i) {
                order.push(i);
            }
        }

        self.update_order = order;
        trace!(object = %self.handle, order = ?self.update_order(), "rebuilt concept update order");
    }

    // -- tick -----------------------------------------------------------------

    /// Run one tick: every concept's `update`, in dependency order. Does
    /// nothing while the object is deactivated.
    pub fn update(&mut self, dt: f32) -> Result<(), CoreError> {
        if !self.activated {
            return Ok(());
        }
        for pos in 0..self.update_order.len() {
            let index = self.update_order[pos];
            self.run_hook(index, |concept, ctx| concept.update(ctx, dt))?;
            self.pump_value_updates()?;
        }
        Ok(())
    }

    // -- events ---------------------------------------------------------------

    /// Whether `destination` is this object or one of its modules.
    pub fn is_addressed(&self, destination: GameHandle) -> bool {
        destination == self.handle || self.module_handles.contains(&destination)
    }

    /// Entry point for events routed to this object.
    ///
    /// Events for other destinations are ignored (`Ok(false)`). Otherwise the
    /// event goes to every subscribed concept, then the object-level side
    /// effects run:
    ///
    /// - `Reinitialize` re-announces poses to physics and broadcasts a
    ///   [`ActionId::MAGIC_STOP`] control action to every concept;
    /// - `DetachModule` detaches the destination module.
    pub fn handle_event(&mut self, event: &Event) -> Result<bool, CoreError> {
        if !self.is_addressed(event.destination) {
            trace!(object = %self.handle, event = ?event.id, destination = %event.destination, "event not addressed here");
            return Ok(false);
        }
        self.distribute_event(event)?;

        match event.id {
            EventId::GameObject(GameObjectEvent::Reinitialize) => {
                self.announce_poses();
                let stop = Event::new(
                    GameObjectEvent::Control,
                    EventPayload::Action {
                        action: ActionId::MAGIC_STOP,
                        value: 1.0,
                    },
                    self.handle,
                    self.handle,
                );
                for index in 0..self.concepts.len() {
                    self.run_hook(index, |concept, ctx| concept.on_event(ctx, &stop))?;
                }
                self.pump_value_updates()?;
            }
            EventId::GameObject(GameObjectEvent::DetachModule) if event.destination != self.handle => {
                self.detach_module(event.destination)?;
            }
            _ => {}
        }
        Ok(true)
    }

    /// Deliver `event` to every concept that requested it, regardless of
    /// which module it names.
    pub fn distribute_event(&mut self, event: &Event) -> Result<(), CoreError> {
        self.deliver(event)?;
        self.pump_value_updates()
    }

    fn deliver(&mut self, event: &Event) -> Result<(), CoreError> {
        let Some(subscribers) = self.event_demands.get(&event.id).cloned() else {
            return Ok(());
        };
        for index in subscribers {
            trace!(
                object = %self.handle,
                concept = %self.concepts[index].state.id,
                event = ?event.id,
                "delivering event"
            );
            self.run_hook(index, |concept, ctx| concept.on_event(ctx, event))?;
        }
        Ok(())
    }

    /// Deliver queued value-update notifications, including any they cause.
    fn pump_value_updates(&mut self) -> Result<(), CoreError> {
        let mut delivered = 0;
        while let Some(event) = self.pending.pop_front() {
            delivered += 1;
            if delivered > MAX_VALUE_UPDATE_CASCADE {
                self.pending.clear();
                return Err(CoreError::ValueUpdateCascade {
                    owner: self.handle,
                    limit: MAX_VALUE_UPDATE_CASCADE,
                });
            }
            self.deliver(&event)?;
        }
        Ok(())
    }

    /// Call `hook` on concept `index` with a context borrowing the rest of
    /// this object.
    fn run_hook<R>(
        &mut self,
        index: usize,
        hook: impl FnOnce(&mut dyn Concept, &mut ConceptContext<'_>) -> R,
    ) -> R {
        let ConceptSlot { state, behavior } = &mut self.concepts[index];
        let mut ctx = ConceptContext {
            owner: self.handle,
            state,
            concept_index: &self.concept_index,
            parts: &mut self.parts,
            values: &mut self.values,
            pending: &mut self.pending,
            outbox: &mut self.outbox,
            environment: &self.environment,
        };
        hook(behavior.as_mut(), &mut ctx)
    }

    // -- internals ------------------------------------------------------------

    /// Remove the vertex `key` and its subtree, and tell the concepts.
    fn discard_part(&mut self, key: NodeKey) {
        self.parts.tree.disconnect(key);
        for part in self.parts.tree.remove_subtree(key) {
            if let Part::Module(module) = part {
                self.forget_module(&module);
            }
        }
    }

    fn discard_virtual(&mut self, handle: GameHandle) {
        if let Some(module) = self.parts.virtual_modules.remove(&handle) {
            self.forget_module(&module);
        }
    }

    fn forget_module(&mut self, module: &Module) {
        let handle = module.handle();
        self.module_handles.remove(&handle);
        for id in module.required_concepts() {
            let Some(&index) = self.concept_index.get(id) else {
                continue;
            };
            if self.concepts[index].state.modules.remove(&handle) {
                self.run_hook(index, |concept, ctx| concept.on_module_detached(ctx, handle));
            }
        }
    }

    /// Reject docking `object` here if that would make a cycle or dock it
    /// twice.
    fn check_dockable(&self, object: GameHandle) -> Result<(), CoreError> {
        if object == self.handle {
            return Err(CoreError::AttachCycle {
                owner: self.handle,
                object,
            });
        }
        let candidate = self
            .environment
            .get(object)
            .ok_or(CoreError::ObjectNotFound { handle: object })?;
        let candidate = candidate
            .try_borrow()
            .map_err(|_| CoreError::ObjectBusy { handle: object })?;
        if candidate.docked {
            return Err(CoreError::AlreadyDocked { object });
        }

        // Does `object` (transitively) hold this object?
        let mut seen = HashSet::new();
        let mut work = candidate.docked_objects();
        while let Some(next) = work.pop() {
            if next == self.handle {
                return Err(CoreError::AttachCycle {
                    owner: self.handle,
                    object,
                });
            }
            if !seen.insert(next) {
                continue;
            }
            if let Some(inner) = self.environment.get(next) {
                if let Ok(inner) = inner.try_borrow() {
                    work.extend(inner.docked_objects());
                }
            }
        }
        Ok(())
    }

    /// Spatially parent `object` under this one.
    fn connect_other_game_object(
        &mut self,
        object: GameHandle,
        offset: Location,
    ) -> Result<(), CoreError> {
        let other = self
            .environment
            .get(object)
            .ok_or(CoreError::ObjectNotFound { handle: object })?;
        other
            .try_borrow_mut()
            .map_err(|_| CoreError::ObjectBusy { handle: object })?
            .docked = true;

        let payload = EventPayload::Attach {
            parent: self.handle,
            child: object,
            offset,
        };
        self.outbox
            .emit(PhysicsEvent::AttachObject, payload.clone(), object, self.handle);
        self.outbox
            .emit(ViewEvent::AttachObject, payload, object, self.handle);
        debug!(object = %self.handle, docked = %object, "docked object");
        Ok(())
    }

    /// Release a docked `object` that sat at `offset` relative to our root,
    /// and re-announce it standalone at the matching world pose.
    fn disconnect_other_game_object(
        &mut self,
        object: GameHandle,
        offset: Location,
    ) -> Result<(), CoreError> {
        let world = self.world_location(&offset);
        if let Some(other) = self.environment.get(object) {
            let mut other = other
                .try_borrow_mut()
                .map_err(|_| CoreError::ObjectBusy { handle: object })?;
            other.docked = false;
            other.set_value(LOCATION, world)?;
        }

        self.outbox.emit(
            PhysicsEvent::DetachObject,
            EventPayload::Handle(self.handle),
            object,
            self.handle,
        );
        self.outbox.emit(
            ViewEvent::DetachObject,
            EventPayload::Handle(self.handle),
            object,
            self.handle,
        );
        self.outbox.emit(
            PhysicsEvent::UpdatePosition,
            EventPayload::Position(world.position),
            object,
            self.handle,
        );
        self.outbox.emit(
            PhysicsEvent::UpdateOrientation,
            EventPayload::Orientation(world.orientation),
            object,
            self.handle,
        );
        debug!(object = %self.handle, released = %object, "undocked object");
        Ok(())
    }

    /// Our world pose composed with a root-relative pose.
    fn world_location(&self, relative: &Location) -> Location {
        let base = self
            .values
            .get(&LOCATION)
            .and_then(Location::from_value)
            .unwrap_or_default();
        Location::new(
            base.position + base.orientation * relative.position,
            base.orientation * relative.orientation,
        )
    }

    fn emit_module_pose(&mut self, module: GameHandle, location: Location) {
        self.outbox.emit(
            PhysicsEvent::UpdateModulePosition,
            EventPayload::Position(location.position),
            module,
            self.handle,
        );
        self.outbox.emit(
            PhysicsEvent::UpdateModuleOrientation,
            EventPayload::Orientation(location.orientation),
            module,
            self.handle,
        );
        self.outbox.emit(
            ViewEvent::UpdatePosition,
            EventPayload::Position(location.position),
            module,
            self.handle,
        );
        self.outbox.emit(
            ViewEvent::UpdateOrientation,
            EventPayload::Orientation(location.orientation),
            module,
            self.handle,
        );
    }

    /// Re-send the object pose (if known) and every module pose to physics.
    fn announce_poses(&mut self) {
        if let Some(location) = self.values.get(&LOCATION).and_then(Location::from_value) {
            self.outbox.emit(
                PhysicsEvent::UpdatePosition,
                EventPayload::Position(location.position),
                self.handle,
                self.handle,
            );
            self.outbox.emit(
                PhysicsEvent::UpdateOrientation,
                EventPayload::Orientation(location.orientation),
                self.handle,
                self.handle,
            );
        }
        let modules: Vec<GameHandle> = self
            .parts
            .tree
            .parts()
            .filter_map(Part::as_module)
            .map(Module::handle)
            .collect();
        for module in modules {
            if let Some(location) = self.parts.location_from_root(module) {
                self.outbox.emit(
                    PhysicsEvent::UpdateModulePosition,
                    EventPayload::Position(location.position),
                    module,
                    self.handle,
                );
                self.outbox.emit(
                    PhysicsEvent::UpdateModuleOrientation,
                    EventPayload::Orientation(location.orientation),
                    module,
                    self.handle,
                );
            }
        }
    }
}

impl Drop for GameObject {
    fn drop(&mut self) {
        for object in self.docked_objects() {
            if let Some(other) = self.environment.get(object) {
                if let Ok(mut other) = other.try_borrow_mut() {
                    other.docked = false;
                }
            }
        }
        self.environment.remove(self.handle);
        debug!(object = %self.handle, "game object destroyed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::Plugin;
    use crate::value::{Quat, Vec3};
    use approx::assert_relative_eq;

    const TEST_PLUGIN: PluginId = PluginId(7);
    const HEALTH: VarId = VarId(1);
    const TICKS: VarId = VarId(2);

    /// Counts its updates in a per-module scratch value.
    struct Counter;

    impl Concept for Counter {
        fn update(&mut self, ctx: &mut ConceptContext<'_>, _dt: f32) -> Result<(), CoreError> {
            for module in ctx.modules() {
                *ctx.value_mut::<i32>(TICKS, module)? += 1;
            }
            Ok(())
        }
    }

    fn counter(_: &mut ConceptSetup<'_>) -> Result<Box<dyn Concept>, CoreError> {
        Ok(Box::new(Counter))
    }

    struct Health;
    impl Concept for Health {}

    fn health(setup: &mut ConceptSetup<'_>) -> Result<Box<dyn Concept>, CoreError> {
        setup.initvar(HEALTH);
        Ok(Box::new(Health))
    }

    fn plugins() -> Rc<PluginMap> {
        Rc::new(
            PluginMap::new()
                .with_plugin(
                    Plugin::new(TEST_PLUGIN, "test")
                        .with_concept("Counter", counter)
                        .with_concept("Health", health),
                )
                .unwrap(),
        )
    }

    fn h(raw: u64) -> GameHandle {
        GameHandle::from_raw(raw)
    }

    fn slots() -> Vec<Adapter> {
        vec![
            Adapter::at(0, Vec3::new(-1.0, 0.0, 0.0)),
            Adapter::at(1, Vec3::new(1.0, 0.0, 0.0)),
        ]
    }

    fn object_with_root(env: &Environment, raw: u64) -> Rc<RefCell<GameObject>> {
        let go = GameObject::new(h(raw), env, plugins());
        go.borrow_mut()
            .attach_module(Part::Module(Module::new(h(raw))), &slots(), 0, GameHandle::NULL, 0)
            .unwrap();
        go
    }

    #[test]
    fn root_must_come_first_and_match_handle() {
        let env = Environment::new();
        let go = GameObject::new(h(1), &env, plugins());
        let err = go
            .borrow_mut()
            .attach_module(Module::new(h(2)).into(), &[], 0, GameHandle::NULL, 0)
            .unwrap_err();
        assert!(matches!(err, CoreError::RootHandleMismatch { .. }));

        go.borrow_mut()
            .attach_module(Module::new(h(1)).into(), &[], 0, GameHandle::NULL, 0)
            .unwrap();
        let err = go
            .borrow_mut()
            .attach_module(Module::new(h(1)).into(), &[], 0, GameHandle::NULL, 0)
            .unwrap_err();
        assert!(matches!(err, CoreError::RootAlreadyAttached { .. }));
    }

    #[test]
    fn unknown_parent_rejected() {
        let env = Environment::new();
        let go = object_with_root(&env, 1);
        let err = go
            .borrow_mut()
            .attach_module(Module::new(h(2)).into(), &slots(), 0, h(99), 1)
            .unwrap_err();
        assert!(matches!(err, CoreError::ParentNotFound { parent, .. } if parent == h(99)));
        assert_eq!(go.borrow().tree().len(), 1);
    }

    #[test]
    fn attach_emits_module_pose() {
        let env = Environment::new();
        let go = object_with_root(&env, 1);
        let mut go = go.borrow_mut();
        go.drain_events();
        go.attach_module(Module::new(h(2)).into(), &slots(), 0, h(1), 1)
            .unwrap();

        let events = go.drain_events();
        let position = events
            .iter()
            .find(|e| e.id == EventId::Physics(PhysicsEvent::UpdateModulePosition))
            .unwrap();
        assert_eq!(position.destination, h(2));
        match position.payload {
            EventPayload::Position(p) => {
                assert_relative_eq!(p, Vec3::new(2.0, 0.0, 0.0), epsilon = 1e-5)
            }
            ref other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn concept_counts_updates_only_while_activated() {
        let env = Environment::new();
        let go = GameObject::new(h(1), &env, plugins());
        let mut go = go.borrow_mut();
        go.attach_module(
            Module::new(h(1)).with_concept("Counter").into(),
            &[],
            0,
            GameHandle::NULL,
            0,
        )
        .unwrap();

        go.update(0.1).unwrap();
        go.update(0.1).unwrap();
        go.set_activated(false);
        go.update(0.1).unwrap();

        let ticks = go
            .module(h(1))
            .unwrap()
            .value::<i32>(ValueId { var: TICKS, plugin: TEST_PLUGIN })
            .unwrap();
        assert_eq!(ticks, 2);
    }

    #[test]
    fn failed_initvar_rolls_back_module() {
        let env = Environment::new();
        let go = object_with_root(&env, 1);
        let mut go = go.borrow_mut();
        let err = go
            .attach_module(Module::new(h(2)).with_concept("Health").into(), &slots(), 0, h(1), 1)
            .unwrap_err();
        assert!(matches!(err, CoreError::MissingInitVars { .. }));
        assert!(!go.has_module(h(2)));
        assert!(!go.has_concept(&"Health".into()));
        assert_eq!(go.tree().free_adapters(go.tree().root().unwrap()), vec![0, 1]);
    }

    #[test]
    fn detach_root_rejected_and_unknown_is_noop() {
        let env = Environment::new();
        let go = object_with_root(&env, 1);
        let mut go = go.borrow_mut();
        assert!(matches!(
            go.detach_module(h(1)),
            Err(CoreError::DetachRoot { .. })
        ));
        assert!(!go.detach_module(h(42)).unwrap());
    }

    #[test]
    fn virtual_modules_join_concepts_but_not_tree() {
        let env = Environment::new();
        let go = object_with_root(&env, 1);
        let mut go = go.borrow_mut();
        go.attach_virtual_module(Module::new(h(5)).with_concept("Counter"))
            .unwrap();
        assert_eq!(go.tree().len(), 1);
        assert_eq!(go.virtual_module_count(), 1);
        assert!(go.is_addressed(h(5)));
        assert_eq!(go.update_order(), vec![&ConceptId::from("Counter")]);

        assert!(go.detach_module(h(5)).unwrap());
        assert!(!go.is_addressed(h(5)));
        assert_eq!(
            go.concept_state(&"Counter".into()).unwrap().modules().count(),
            0
        );
    }

    #[test]
    fn busy_object_dock_leaves_no_vertex_behind() {
        let env = Environment::new();
        let carrier = object_with_root(&env, 1);
        let fighter = object_with_root(&env, 2);

        let held = fighter.borrow();
        let err = carrier
            .borrow_mut()
            .attach_module(Part::Object(h(2)), &slots(), 0, h(1), 1)
            .unwrap_err();
        assert!(matches!(err, CoreError::ObjectBusy { handle } if handle == h(2)));
        assert!(!held.is_docked());
        drop(held);

        let carrier = carrier.borrow();
        assert_eq!(carrier.tree().len(), 1);
        assert!(carrier.docked_objects().is_empty());
        assert_eq!(
            carrier.tree().free_adapters(carrier.tree().root().unwrap()),
            vec![0, 1]
        );
    }

    #[test]
    fn release_docked_frees_every_cargo() {
        let env = Environment::new();
        let carrier = object_with_root(&env, 1);
        let fighter = object_with_root(&env, 2);
        carrier
            .borrow_mut()
            .set_value(LOCATION, Location::new(Vec3::new(10.0, 0.0, 0.0), Quat::identity()))
            .unwrap();
        carrier
            .borrow_mut()
            .attach_module(Part::Object(h(2)), &slots(), 0, h(1), 1)
            .unwrap();
        assert!(fighter.borrow().is_docked());
        carrier.borrow_mut().drain_events();

        let released = carrier.borrow_mut().release_docked().unwrap();
        assert_eq!(released, vec![h(2)]);
        assert!(!fighter.borrow().is_docked());
        assert!(carrier.borrow().docked_objects().is_empty());

        let position = fighter.borrow().value::<Location>(LOCATION).unwrap().position;
        assert_relative_eq!(position, Vec3::new(12.0, 0.0, 0.0), epsilon = 1e-5);

        let events = carrier.borrow_mut().drain_events();
        for id in [
            EventId::Physics(PhysicsEvent::DetachObject),
            EventId::View(ViewEvent::DetachObject),
        ] {
            assert!(events.iter().any(|e| e.id == id && e.destination == h(2)));
        }
    }

    #[test]
    fn environment_tracks_lifetime() {
        let env = Environment::new();
        let go = object_with_root(&env, 3);
        assert!(env.exists(h(3)));
        assert_eq!(env.find(|o| o.has_module(h(3))), Some(h(3)));
        drop(go);
        assert!(!env.exists(h(3)));
        assert!(env.is_empty());
    }
}
