//! Session snapshots with BLAKE3 hashing.
//!
//! A [`SessionSnapshot`] is a serializable picture of the observable session
//! state (tick counter, and for each live object its flags, concepts, values
//! and module layout) plus a BLAKE3 content hash. Two sessions fed the same
//! blueprints and the same events hash identically:
//!
//! ```
//! use ensemble_engine::prelude::*;
//!
//! let blueprint = ObjectParameter::from_json(r#"{
//!     "name": "drone",
//!     "root": "hull",
//!     "modules": [{ "name": "hull", "concepts": ["ThrustControl"] }]
//! }"#).unwrap();
//!
//! let run = || {
//!     let mut session = Session::new(SessionConfig::default(), core_plugins());
//!     session.spawn(&blueprint).unwrap();
//!     session.run_ticks(20).unwrap();
//!     session.capture_snapshot()
//! };
//!
//! let (a, b) = (run(), run());
//! assert_eq!(a.hash, b.hash);
//! assert_eq!(a.hash.len(), 64); // BLAKE3 hex digest
//! assert!(a.verify().is_ok());
//! ```
//!
//! # What Is NOT Captured
//!
//! - **Concept internals** -- concepts are behaviour objects; only their ids
//!   and the values they keep in modules are recorded.
//! - **Queued events** and **diagnostics**.
//!
//! Snapshots are for comparison and inspection; there is no restore.

use serde::{Deserialize, Serialize};

use ensemble_core::game_object::GameObject;
use ensemble_core::handle::GameHandle;
use ensemble_core::value::{Location, Value, ValueId, ValueStorage};

use crate::session::Session;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// One attached module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSnapshot {
    pub handle: GameHandle,
    pub values: Vec<(ValueId, Value)>,
    /// Pose relative to the object's root; `None` for virtual modules.
    pub location: Option<Location>,
}

/// One live game object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    pub handle: GameHandle,
    pub docked: bool,
    pub activated: bool,
    /// Concept ids in attach order.
    pub concepts: Vec<String>,
    /// Object-wide values, ordered by id.
    pub values: Vec<(ValueId, Value)>,
    /// Modules ordered by handle.
    pub modules: Vec<ModuleSnapshot>,
    /// Objects docked into this one.
    pub docked_objects: Vec<GameHandle>,
}

/// The whole session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub tick_counter: u64,
    pub fixed_dt: f64,
    /// Objects in creation order.
    pub objects: Vec<ObjectSnapshot>,
    /// BLAKE3 hex digest (64 lowercase hex chars) of everything above.
    pub hash: String,
}

impl SessionSnapshot {
    /// Recompute the hash and compare it with the recorded one.
    pub fn verify(&self) -> Result<(), EngineError> {
        let computed = compute_hash(self.tick_counter, self.fixed_dt, &self.objects);
        if computed == self.hash {
            Ok(())
        } else {
            Err(EngineError::SnapshotHashMismatch {
                recorded: self.hash.clone(),
                computed,
            })
        }
    }

    pub fn to_json(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and verify a snapshot.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let snapshot: Self = serde_json::from_str(json)?;
        snapshot.verify()?;
        Ok(snapshot)
    }

    pub fn object(&self, handle: GameHandle) -> Option<&ObjectSnapshot> {
        self.objects.iter().find(|o| o.handle == handle)
    }
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

fn sorted_values(values: &ValueStorage) -> Vec<(ValueId, Value)> {
    values.iter().map(|(id, v)| (*id, v.clone())).collect()
}

impl ObjectSnapshot {
    pub fn capture(object: &GameObject) -> Self {
        let modules = object
            .module_handles()
            .filter_map(|handle| {
                let module = object.module(handle)?;
                let location = if object.tree().contains(handle) {
                    object.vector_to_module_from_root(handle).ok()
                } else {
                    None
                };
                Some(ModuleSnapshot {
                    handle,
                    values: sorted_values(module.values()),
                    location,
                })
            })
            .collect();

        Self {
            handle: object.handle(),
            docked: object.is_docked(),
            activated: object.is_activated(),
            concepts: object
                .concept_ids()
                .into_iter()
                .map(|id| id.as_str().to_owned())
                .collect(),
            values: sorted_values(object.values()),
            modules,
            docked_objects: object.docked_objects(),
        }
    }
}

fn compute_hash(tick_counter: u64, fixed_dt: f64, objects: &[ObjectSnapshot]) -> String {
    #[derive(Serialize)]
    struct HashableState<'a> {
        tick_counter: u64,
        fixed_dt: f64,
        objects: &'a [ObjectSnapshot],
    }

    let hashable = HashableState {
        tick_counter,
        fixed_dt,
        objects,
    };
    let json_bytes = serde_json::to_vec(&hashable)
        .expect("SessionSnapshot state should always be JSON-serializable");

    blake3::hash(&json_bytes).to_hex().to_string()
}

impl Session {
    /// Capture every live object, in creation order.
    pub fn capture_snapshot(&self) -> SessionSnapshot {
        let objects: Vec<ObjectSnapshot> = self
            .objects()
            .map(|o| ObjectSnapshot::capture(&o.borrow()))
            .collect();
        let hash = compute_hash(self.tick_count(), self.fixed_dt(), &objects);
        SessionSnapshot {
            tick_counter: self.tick_count(),
            fixed_dt: self.fixed_dt(),
            objects,
            hash,
        }
    }

    /// Shorthand for `capture_snapshot().hash`.
    pub fn state_hash(&self) -> String {
        self.capture_snapshot().hash
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
