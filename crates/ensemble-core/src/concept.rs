//! Concepts: named, pluggable behaviour units attached to a game object.
//!
//! A concept is built by a [`ConceptCtor`] registered in a
//! [`Plugin`](crate::factory::Plugin). The constructor receives a
//! [`ConceptSetup`], the only place where a concept may declare
//!
//! - hard dependencies ([`ConceptSetup::require`]), which must already be
//!   attached to the owner and update before this concept,
//! - ordering-only dependencies ([`ConceptSetup::update_after`]),
//! - variables every governed module must carry ([`ConceptSetup::initvar`]),
//! - event subscriptions ([`ConceptSetup::request_event`]).
//!
//! At runtime every hook receives a [`ConceptContext`] that exposes the
//! owner's modules and values, the outbound event queue and the session
//! [`Environment`].
//!
//! # Value-update re-entrancy
//!
//! [`ConceptContext::set_go_value`] always announces the change with a
//! [`GameObjectEvent::ValueUpdated`] event that is delivered before control
//! returns to the scheduler. A concept must never call `set_go_value` while
//! handling `ValueUpdated` itself: each call schedules another delivery. The
//! owner aborts such a cascade with [`CoreError::ValueUpdateCascade`] after
//! [`MAX_VALUE_UPDATE_CASCADE`](crate::game_object::MAX_VALUE_UPDATE_CASCADE)
//! deliveries.

use std::any::Any;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::environment::Environment;
use crate::event::{Event, EventId, EventPayload, EventQueue, GameObjectEvent};
use crate::game_object::{dump_state, Parts};
use crate::handle::GameHandle;
use crate::module::Module;
use crate::value::{
    read_as, slot_mut, Location, PluginId, Value, ValueId, ValueStorage, ValueType, VarId,
};
use crate::CoreError;

// ---------------------------------------------------------------------------
// ConceptId
// ---------------------------------------------------------------------------

/// Name of a concept kind, e.g. `"ThrustControl"`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConceptId(String);

impl ConceptId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConceptId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ConceptId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&ConceptId> for ConceptId {
    fn from(id: &ConceptId) -> Self {
        id.clone()
    }
}

impl fmt::Debug for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConceptId({:?})", self.0)
    }
}

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Concept trait
// ---------------------------------------------------------------------------

/// Downcasting support for boxed concepts.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Behaviour of one concept kind. Every hook defaults to a no-op.
pub trait Concept: AsAny {
    /// A module that asked for this concept was attached. Runs after the
    /// initvar check and after the module has been recorded.
    fn on_module_attached(
        &mut self,
        _ctx: &mut ConceptContext<'_>,
        _module: GameHandle,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    /// A governed module was detached. It is already gone from the owner.
    fn on_module_detached(&mut self, _ctx: &mut ConceptContext<'_>, _module: GameHandle) {}

    /// Per-tick work. Called at most once per tick, only while the owner is
    /// activated.
    fn update(&mut self, _ctx: &mut ConceptContext<'_>, _dt: f32) -> Result<(), CoreError> {
        Ok(())
    }

    /// A requested event reached the owner.
    fn on_event(&mut self, _ctx: &mut ConceptContext<'_>, _event: &Event) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Builds a concept instance.
pub type ConceptCtor = fn(&mut ConceptSetup<'_>) -> Result<Box<dyn Concept>, CoreError>;

// ---------------------------------------------------------------------------
// ConceptSetup
// ---------------------------------------------------------------------------

/// Declarations collected while a concept is being constructed.
pub struct ConceptSetup<'a> {
    owner: GameHandle,
    id: &'a ConceptId,
    plugin: PluginId,
    attached: &'a HashMap<ConceptId, usize>,
    pub(crate) requires: Vec<ConceptId>,
    pub(crate) after: Vec<ConceptId>,
    pub(crate) init_vars: Vec<VarId>,
    pub(crate) events: Vec<EventId>,
}

impl<'a> ConceptSetup<'a> {
    pub(crate) fn new(
        owner: GameHandle,
        id: &'a ConceptId,
        plugin: PluginId,
        attached: &'a HashMap<ConceptId, usize>,
    ) -> Self {
        Self {
            owner,
            id,
            plugin,
            attached,
            requires: Vec::new(),
            after: Vec::new(),
            init_vars: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn owner(&self) -> GameHandle {
        self.owner
    }

    pub fn concept_id(&self) -> &ConceptId {
        self.id
    }

    pub fn plugin(&self) -> PluginId {
        self.plugin
    }

    /// Depend on `concept`, which must already be attached to the owner.
    pub fn require(&mut self, concept: impl Into<ConceptId>) -> Result<(), CoreError> {
        let concept = concept.into();
        if !self.attached.contains_key(&concept) {
            return Err(CoreError::MissingRequiredConcept {
                owner: self.owner,
                concept: self.id.clone(),
                required: concept,
            });
        }
        self.requires.push(concept);
        Ok(())
    }

    /// Update after `concept` whenever both are attached. No presence check.
    pub fn update_after(&mut self, concept: impl Into<ConceptId>) {
        self.after.push(concept.into());
    }

    /// Every module governed by this concept must carry `var` (under this
    /// concept's plugin).
    pub fn initvar(&mut self, var: VarId) {
        if !self.init_vars.contains(&var) {
            self.init_vars.push(var);
        }
    }

    /// Subscribe to `event`.
    pub fn request_event(&mut self, event: impl Into<EventId>) {
        let event = event.into();
        if !self.events.contains(&event) {
            self.events.push(event);
        }
    }
}

// ---------------------------------------------------------------------------
// ConceptState
// ---------------------------------------------------------------------------

/// Bookkeeping the owner keeps for each attached concept.
#[derive(Debug, Clone)]
pub struct ConceptState {
    pub(crate) id: ConceptId,
    pub(crate) plugin: PluginId,
    pub(crate) modules: BTreeSet<GameHandle>,
    pub(crate) init_vars: Vec<VarId>,
    pub(crate) events: Vec<EventId>,
}

impl ConceptState {
    pub fn id(&self) -> &ConceptId {
        &self.id
    }

    pub fn plugin(&self) -> PluginId {
        self.plugin
    }

    /// Handles of the modules this concept governs.
    pub fn modules(&self) -> impl Iterator<Item = GameHandle> + '_ {
        self.modules.iter().copied()
    }

    pub fn requested_events(&self) -> &[EventId] {
        &self.events
    }

    /// Check the initvars against `module` and record it.
    pub(crate) fn admit(&mut self, owner: GameHandle, module: &Module) -> Result<(), CoreError> {
        let missing: Vec<ValueId> = self
            .init_vars
            .iter()
            .map(|var| ValueId {
                var: *var,
                plugin: self.plugin,
            })
            .filter(|id| !module.has_value(*id))
            .collect();
        if !missing.is_empty() {
            return Err(CoreError::MissingInitVars {
                owner,
                concept: self.id.clone(),
                module: module.handle(),
                missing,
            });
        }
        self.modules.insert(module.handle());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ConceptContext
// ---------------------------------------------------------------------------

/// What a concept can see and touch while one of its hooks runs.
pub struct ConceptContext<'a> {
    pub(crate) owner: GameHandle,
    pub(crate) state: &'a ConceptState,
    pub(crate) concept_index: &'a HashMap<ConceptId, usize>,
    pub(crate) parts: &'a mut Parts,
    pub(crate) values: &'a mut ValueStorage,
    pub(crate) pending: &'a mut VecDeque<Event>,
    pub(crate) outbox: &'a mut EventQueue,
    pub(crate) environment: &'a Environment,
}

impl ConceptContext<'_> {
    pub fn owner(&self) -> GameHandle {
        self.owner
    }

    pub fn concept_id(&self) -> &ConceptId {
        &self.state.id
    }

    pub fn plugin(&self) -> PluginId {
        self.state.plugin
    }

    /// Modules governed by this concept.
    pub fn modules(&self) -> Vec<GameHandle> {
        self.state.modules.iter().copied().collect()
    }

    pub fn environment(&self) -> &Environment {
        self.environment
    }

    pub fn has_concept(&self, concept: &ConceptId) -> bool {
        self.concept_index.contains_key(concept)
    }

    /// This concept's key for `var`.
    pub fn value_id(&self, var: VarId) -> ValueId {
        ValueId {
            var,
            plugin: self.state.plugin,
        }
    }

    // -- per-module values --------------------------------------------------

    fn module(&self, module: GameHandle) -> Result<&Module, CoreError> {
        self.parts.module(module).ok_or(CoreError::ModuleNotFound {
            owner: self.owner,
            module,
        })
    }

    fn module_mut(&mut self, module: GameHandle) -> Result<&mut Module, CoreError> {
        let owner = self.owner;
        self.parts
            .module_mut(module)
            .ok_or(CoreError::ModuleNotFound { owner, module })
    }

    /// Read `var` of `module`. The value must exist.
    pub fn value<T: ValueType>(&self, var: VarId, module: GameHandle) -> Result<T, CoreError> {
        let id = self.value_id(var);
        self.module(module)?.value(id)
    }

    /// Mutable access to `var` of `module`, created with a default value if
    /// absent. Intended for per-concept scratch values.
    pub fn value_mut<T: ValueType>(
        &mut self,
        var: VarId,
        module: GameHandle,
    ) -> Result<&mut T, CoreError> {
        let id = self.value_id(var);
        slot_mut(self.module_mut(module)?.values_mut(), id)
    }

    pub fn set_value(
        &mut self,
        var: VarId,
        module: GameHandle,
        value: impl Into<Value>,
    ) -> Result<(), CoreError> {
        let id = self.value_id(var);
        self.module_mut(module)?.set_value(id, value);
        Ok(())
    }

    pub fn has_value(&self, var: VarId, module: GameHandle) -> bool {
        let id = self.value_id(var);
        self.parts
            .module(module)
            .is_some_and(|m| m.has_value(id))
    }

    /// Pose of a spatial module relative to the owner's root.
    pub fn module_location(&self, module: GameHandle) -> Option<Location> {
        self.parts.location_from_root(module)
    }

    // -- object-wide values -------------------------------------------------

    /// Read an object-wide value. Fails with a full dump if absent.
    pub fn go_value<T: ValueType>(&self, id: ValueId) -> Result<T, CoreError> {
        match self.values.get(&id) {
            Some(value) => read_as(id, value),
            None => Err(CoreError::ValueNotFound {
                owner: self.owner,
                id,
                dump: dump_state(
                    self.owner,
                    self.concept_index.keys(),
                    &*self.values,
                    &*self.parts,
                ),
            }),
        }
    }

    pub fn has_go_value(&self, id: ValueId) -> bool {
        self.values.contains_key(&id)
    }

    /// Store an object-wide value and announce it with
    /// [`GameObjectEvent::ValueUpdated`]. See the module docs for the
    /// re-entrancy rule.
    pub fn set_go_value(&mut self, id: ValueId, value: impl Into<Value>) {
        self.values.insert(id, value.into());
        self.pending.push_back(Event::new(
            GameObjectEvent::ValueUpdated,
            EventPayload::Value(id),
            self.owner,
            self.owner,
        ));
    }

    // -- events -------------------------------------------------------------

    /// Queue an event for the session driver, sent by the owner.
    pub fn emit(&mut self, id: impl Into<EventId>, payload: EventPayload, destination: GameHandle) {
        self.outbox.emit(id, payload, destination, self.owner);
    }
}
