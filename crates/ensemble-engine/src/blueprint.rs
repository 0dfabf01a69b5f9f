//! Loader blueprints: plain-data descriptions of game objects.
//!
//! An [`ObjectParameter`] names its modules, says which one is the root and
//! lists the adapter connections between them by module name. Blueprints are
//! `serde` types, usually loaded from JSON:
//!
//! ```
//! use ensemble_engine::blueprint::ObjectParameter;
//!
//! let ship = ObjectParameter::from_json(r#"{
//!     "name": "ship",
//!     "root": "hull",
//!     "modules": [
//!         { "name": "hull", "adapters": [{ "id": 3, "position": [1.0, 0.0, 0.0] }] },
//!         { "name": "turret", "adapters": [{ "id": 0, "position": [-1.0, 0.0, 0.0] }] }
//!     ],
//!     "connections": [
//!         { "parent": "hull", "parent_adapter": 3, "child": "turret", "child_adapter": 0 }
//!     ]
//! }"#).unwrap();
//!
//! assert_eq!(ship.modules.len(), 2);
//! assert!(ship.validate().is_ok());
//! ```
//!
//! [`Session::spawn`](crate::session::Session::spawn) turns a blueprint into
//! a live object.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use ensemble_core::adapter::{Adapter, AdapterId};
use ensemble_core::concept::ConceptId;
use ensemble_core::handle::GameHandle;
use ensemble_core::module::Module;
use ensemble_core::value::{Location, Quat, Value, ValueId, Vec3};

use crate::EngineError;

fn identity() -> Quat {
    Quat::identity()
}

fn yes() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// One adapter slot of a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterParameter {
    pub id: AdapterId,
    pub position: Vec3,
    #[serde(default = "identity")]
    pub orientation: Quat,
}

impl AdapterParameter {
    pub fn to_adapter(&self) -> Adapter {
        Adapter::new(self.id, self.position, self.orientation)
    }
}

/// One typed value, keyed by `(var, plugin)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueParameter {
    pub var: u32,
    pub plugin: u32,
    pub value: Value,
}

impl ValueParameter {
    pub fn id(&self) -> ValueId {
        ValueId::new(self.var, self.plugin)
    }
}

/// A module of the blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleParameter {
    pub name: String,
    #[serde(default)]
    pub concepts: Vec<ConceptId>,
    #[serde(default)]
    pub values: Vec<ValueParameter>,
    #[serde(default)]
    pub adapters: Vec<AdapterParameter>,
    /// Virtual modules carry data and concepts but take no place in the
    /// spatial tree.
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
}

impl ModuleParameter {
    /// Build the module under `handle`.
    pub fn to_module(&self, handle: GameHandle) -> Module {
        let mut module = Module::new(handle);
        for value in &self.values {
            module.set_value(value.id(), value.value.clone());
        }
        for concept in &self.concepts {
            module.require_concept(concept);
        }
        module
    }

    pub fn adapters(&self) -> Vec<Adapter> {
        self.adapters.iter().map(AdapterParameter::to_adapter).collect()
    }
}

/// "Weld `child` at its slot `child_adapter` to slot `parent_adapter` of
/// `parent`", by module name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParameter {
    pub parent: String,
    pub parent_adapter: AdapterId,
    pub child: String,
    pub child_adapter: AdapterId,
}

/// A complete game object description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectParameter {
    pub name: String,
    /// Name of the root module. It receives the object's own handle.
    pub root: String,
    pub modules: Vec<ModuleParameter>,
    /// Applied in order; every parent must already be attached.
    #[serde(default)]
    pub connections: Vec<ConnectionParameter>,
    /// Object-wide values.
    #[serde(default)]
    pub values: Vec<ValueParameter>,
    /// Initial world pose.
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default = "yes")]
    pub activated: bool,
}

impl ObjectParameter {
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn module(&self, name: &str) -> Option<&ModuleParameter> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Check names before anything is built: module names are unique, the
    /// root and every connection endpoint exist, and every spatial module
    /// other than the root is the child of some connection.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut seen = BTreeSet::new();
        for module in &self.modules {
            if !seen.insert(module.name.as_str()) {
                return Err(EngineError::DuplicateModuleName {
                    object: self.name.clone(),
                    module: module.name.clone(),
                });
            }
        }

        let known = |name: &str| -> Result<(), EngineError> {
            if seen.contains(name) {
                Ok(())
            } else {
                Err(EngineError::UnknownModule {
                    object: self.name.clone(),
                    module: name.to_owned(),
                })
            }
        };
        known(&self.root)?;
        for connection in &self.connections {
            known(&connection.parent)?;
            known(&connection.child)?;
        }

        let children: BTreeSet<&str> = self.connections.iter().map(|c| c.child.as_str()).collect();
        if let Some(loose) = self
            .modules
            .iter()
            .find(|m| !m.is_virtual && m.name != self.root && !children.contains(m.name.as_str()))
        {
            return Err(EngineError::UnconnectedModule {
                object: self.name.clone(),
                module: loose.name.clone(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ship() -> ObjectParameter {
        ObjectParameter::from_json(
            r#"{
                "name": "ship",
                "root": "hull",
                "modules": [
                    { "name": "hull", "adapters": [{ "id": 1, "position": [1.0, 0.0, 0.0] }] },
                    {
                        "name": "engine",
                        "concepts": ["ThrustControl"],
                        "values": [{ "var": 2, "plugin": 1, "value": { "Float": 3.5 } }],
                        "adapters": [{ "id": 0, "position": [-1.0, 0.0, 0.0] }]
                    },
                    { "name": "cargo", "virtual": true }
                ],
                "connections": [
                    { "parent": "hull", "parent_adapter": 1, "child": "engine", "child_adapter": 0 }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let ship = ship();
        assert!(ship.activated);
        assert!(ship.location.is_none());
        assert!(ship.module("cargo").unwrap().is_virtual);
        assert_eq!(ship.module("hull").unwrap().adapters[0].orientation, Quat::identity());
        ship.validate().unwrap();
    }

    #[test]
    fn module_parameter_builds_module() {
        let ship = ship();
        let engine = ship.module("engine").unwrap().to_module(GameHandle::from_raw(9));
        assert_eq!(engine.handle(), GameHandle::from_raw(9));
        assert_eq!(engine.required_concepts(), &[ConceptId::from("ThrustControl")]);
        assert_eq!(engine.value::<f32>(ValueId::new(2, 1)).unwrap(), 3.5);
    }

    #[test]
    fn json_survives_a_trip() {
        let ship = ship();
        let again = ObjectParameter::from_json(&ship.to_json().unwrap()).unwrap();
        assert_eq!(again, ship);
    }

    #[test]
    fn validation_names_the_problem() {
        let mut ship = ship();
        ship.connections[0].parent = "bridge".into();
        assert!(matches!(
            ship.validate(),
            Err(EngineError::UnknownModule { ref module, .. }) if module == "bridge"
        ));

        let mut ship = self::ship();
        ship.connections.clear();
        assert!(matches!(
            ship.validate(),
            Err(EngineError::UnconnectedModule { ref module, .. }) if module == "engine"
        ));

        let mut ship = self::ship();
        let hull = ship.modules[0].clone();
        ship.modules.push(hull);
        assert!(matches!(
            ship.validate(),
            Err(EngineError::DuplicateModuleName { .. })
        ));
    }

    #[test]
    fn malformed_json_is_reported() {
        let err = ObjectParameter::from_json("{ \"name\": 3 }").unwrap_err();
        assert!(matches!(err, EngineError::Json(_)));
    }
}
