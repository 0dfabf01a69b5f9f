//! Ensemble engine -- session driver for composite game objects.
//!
//! This crate builds on [`ensemble_core`] to provide the simulation driver: a
//! [`Session`](session::Session) owns every game object, spawns them from
//! loader blueprints, ticks them at a fixed timestep in creation order and
//! routes the events they emit. Events addressed to game objects are
//! delivered back into the session; physics and view events are handed to
//! the caller.
//!
//! # Quick Start
//!
//! ```
//! use ensemble_engine::prelude::*;
//!
//! let mut session = Session::new(SessionConfig::default(), core_plugins());
//! let blueprint = ObjectParameter::from_json(r#"{
//!     "name": "drone",
//!     "root": "hull",
//!     "modules": [
//!         { "name": "hull", "concepts": ["ThrustControl"] }
//!     ]
//! }"#).unwrap();
//!
//! let drone = session.spawn(&blueprint).unwrap();
//! session.run_ticks(10).unwrap();
//! assert_eq!(session.tick_count(), 10);
//! assert!(session.environment().exists(drone));
//! ```

#![deny(unsafe_code)]

pub mod blueprint;
pub mod concepts;
pub mod session;
pub mod snapshot;

use ensemble_core::handle::GameHandle;
use ensemble_core::CoreError;

/// Re-export the core crate for convenience.
pub use ensemble_core;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by the session driver and the loader.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A blueprint could not be parsed.
    #[error("invalid blueprint: {0}")]
    Json(#[from] serde_json::Error),

    /// A blueprint references a module name it does not define.
    #[error("object '{object}' has no module named '{module}'")]
    UnknownModule { object: String, module: String },

    #[error("object '{object}' defines module '{module}' twice")]
    DuplicateModuleName { object: String, module: String },

    /// A spatial module that is neither the root nor the child of a
    /// connection.
    #[error("spatial module '{module}' of object '{object}' is never connected")]
    UnconnectedModule { object: String, module: String },

    #[error("object {handle} is not part of this session")]
    UnknownObject { handle: GameHandle },

    #[error("snapshot hash mismatch: recorded {recorded}, computed {computed}")]
    SnapshotHashMismatch { recorded: String, computed: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    // Re-export everything from the core prelude.
    pub use ensemble_core::prelude::*;

    pub use crate::blueprint::{
        AdapterParameter, ConnectionParameter, ModuleParameter, ObjectParameter, ValueParameter,
    };
    pub use crate::concepts::{
        core_plugin, core_plugins, AutoNavigator, Destroyable, PoseTracker, ThrustControl,
        CORE_PLUGIN_ID,
    };
    pub use crate::session::{Session, SessionConfig, SessionDiagnostics, TickReport};
    pub use crate::snapshot::{ModuleSnapshot, ObjectSnapshot, SessionSnapshot};
    pub use crate::EngineError;
}
