//! Ensemble core -- composite game objects built from modules and concepts.
//!
//! A [`GameObject`](game_object::GameObject) is assembled from *modules*:
//! spatial modules form a tree connected through adapter slots, virtual
//! modules just carry data. Each module names the *concepts* (pluggable
//! behaviour units) it needs; the object instantiates one concept per kind,
//! hands it every module that asked for it, and ticks all concepts in
//! dependency order.
//!
//! # Quick Start
//!
//! ```
//! use std::rc::Rc;
//! use ensemble_core::prelude::*;
//!
//! struct Spin;
//! impl Concept for Spin {}
//!
//! fn spin(_: &mut ConceptSetup<'_>) -> Result<Box<dyn Concept>, CoreError> {
//!     Ok(Box::new(Spin))
//! }
//!
//! let plugins = PluginMap::new()
//!     .with_plugin(Plugin::new(PluginId(1), "demo").with_concept("Spin", spin))
//!     .unwrap();
//!
//! let env = Environment::new();
//! let handle = GameHandle::from_raw(1);
//! let object = GameObject::new(handle, &env, Rc::new(plugins));
//! object
//!     .borrow_mut()
//!     .attach_module(
//!         Module::new(handle).with_concept("Spin").into(),
//!         &[],
//!         0,
//!         GameHandle::NULL,
//!         0,
//!     )
//!     .unwrap();
//!
//! object.borrow_mut().update(1.0 / 60.0).unwrap();
//! assert!(object.borrow().has_concept(&"Spin".into()));
//! assert!(env.exists(handle));
//! ```

#![deny(unsafe_code)]

pub mod adapter;
pub mod concept;
pub mod environment;
pub mod event;
pub mod factory;
pub mod game_object;
pub mod handle;
pub mod module;
pub mod tree;
pub mod value;

use concept::ConceptId;
use handle::GameHandle;
use value::{PluginId, ValueId};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced while assembling or running game objects.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A concept declared a hard dependency that is not attached yet.
    #[error("concept '{concept}' on object {owner} requires '{required}', which is not attached")]
    MissingRequiredConcept {
        owner: GameHandle,
        concept: ConceptId,
        required: ConceptId,
    },

    /// A module lacks variables a concept marked as initvars.
    #[error("module {module} of object {owner} lacks initvars {missing:?} required by concept '{concept}'")]
    MissingInitVars {
        owner: GameHandle,
        concept: ConceptId,
        module: GameHandle,
        missing: Vec<ValueId>,
    },

    #[error("unknown concept '{concept}'. Registered concepts: [{registered}]")]
    UnknownConcept {
        concept: ConceptId,
        registered: String,
    },

    #[error("concept '{concept}' is already provided by plugin {plugin:?}")]
    DuplicateConcept { concept: ConceptId, plugin: PluginId },

    #[error("object {owner} already has a root module")]
    RootAlreadyAttached { owner: GameHandle },

    /// The root module must carry the object's own handle.
    #[error("root of object {owner} must carry its handle, got {root}")]
    RootHandleMismatch { owner: GameHandle, root: GameHandle },

    #[error("parent {parent} is not part of object {owner}")]
    ParentNotFound { owner: GameHandle, parent: GameHandle },

    #[error("part {module} of object {owner} has no adapter slot {adapter}")]
    AdapterNotFound {
        owner: GameHandle,
        module: GameHandle,
        adapter: i32,
    },

    #[error("adapter slot {adapter} of part {module} in object {owner} is already connected")]
    AdapterInUse {
        owner: GameHandle,
        module: GameHandle,
        adapter: i32,
    },

    #[error("module {module} is not attached to object {owner}")]
    ModuleNotFound { owner: GameHandle, module: GameHandle },

    #[error("module {module} has no value {id}")]
    ModuleValueNotFound { module: GameHandle, id: ValueId },

    #[error("handle {handle} is already used in object {owner}")]
    DuplicateHandle { owner: GameHandle, handle: GameHandle },

    #[error("the root module of object {owner} cannot be detached")]
    DetachRoot { owner: GameHandle },

    /// Missing object-wide value. `dump` lists everything the object holds.
    #[error("object {owner} has no value {id}\n{dump}")]
    ValueNotFound {
        owner: GameHandle,
        id: ValueId,
        dump: String,
    },

    #[error("value {id} holds {found}, expected {expected}")]
    ValueType {
        id: ValueId,
        expected: &'static str,
        found: &'static str,
    },

    /// Docking `object` into `owner` would make an object contain itself.
    #[error("docking object {object} into {owner} would form a cycle")]
    AttachCycle { owner: GameHandle, object: GameHandle },

    #[error("object {object} is already docked")]
    AlreadyDocked { object: GameHandle },

    #[error("object {handle} does not exist")]
    ObjectNotFound { handle: GameHandle },

    /// The object is mutably borrowed (usually: it is the one running).
    #[error("object {handle} is busy")]
    ObjectBusy { handle: GameHandle },

    #[error("value updates on object {owner} kept cascading past {limit} deliveries")]
    ValueUpdateCascade { owner: GameHandle, limit: usize },

    #[error("text of {len} bytes exceeds capacity {capacity}")]
    TextTooLong { len: usize, capacity: usize },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::adapter::{compose_chain, weld_step, Adapter, AdapterId};
    pub use crate::concept::{Concept, ConceptContext, ConceptCtor, ConceptId, ConceptSetup, ConceptState};
    pub use crate::environment::Environment;
    pub use crate::event::{
        ActionId, Event, EventId, EventPayload, EventQueue, GameObjectEvent, PhysicsEvent,
        ViewEvent,
    };
    pub use crate::factory::{ConceptFactory, Plugin, PluginMap};
    pub use crate::game_object::{GameObject, LOCATION, MAX_VALUE_UPDATE_CASCADE, RESERVED_PLUGIN};
    pub use crate::handle::{GameHandle, HandleAllocator};
    pub use crate::module::Module;
    pub use crate::tree::{ModuleTree, NodeKey, Part};
    pub use crate::value::{
        Location, PluginId, Quat, ShortString, Value, ValueId, ValueStorage, ValueType, Vec3,
        VarId,
    };
    pub use crate::CoreError;
}
