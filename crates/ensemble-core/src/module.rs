//! Modules: the leaf parts of a composite game object.

use crate::concept::ConceptId;
use crate::handle::GameHandle;
use crate::value::{read_as, Value, ValueId, ValueStorage, ValueType};
use crate::CoreError;

/// A part of a game object.
///
/// A module is either spatial (a vertex of the owner's
/// [`ModuleTree`](crate::tree::ModuleTree)) or virtual (a plain data holder
/// keyed by handle). Either way it owns its attribute storage and names the
/// concepts it wants attached to its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    handle: GameHandle,
    values: ValueStorage,
    required_concepts: Vec<ConceptId>,
}

impl Module {
    pub fn new(handle: GameHandle) -> Self {
        Self {
            handle,
            values: ValueStorage::new(),
            required_concepts: Vec::new(),
        }
    }

    /// Builder: add one attribute.
    pub fn with_value(mut self, id: ValueId, value: impl Into<Value>) -> Self {
        self.values.insert(id, value.into());
        self
    }

    /// Builder: ask for a concept. Duplicates are ignored.
    pub fn with_concept(mut self, concept: impl Into<ConceptId>) -> Self {
        self.require_concept(concept);
        self
    }

    pub fn handle(&self) -> GameHandle {
        self.handle
    }

    pub fn values(&self) -> &ValueStorage {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut ValueStorage {
        &mut self.values
    }

    /// Concepts this module wants attached, in declaration order.
    pub fn required_concepts(&self) -> &[ConceptId] {
        &self.required_concepts
    }

    pub fn require_concept(&mut self, concept: impl Into<ConceptId>) {
        let concept = concept.into();
        if !self.required_concepts.contains(&concept) {
            self.required_concepts.push(concept);
        }
    }

    pub fn has_value(&self, id: ValueId) -> bool {
        self.values.contains_key(&id)
    }

    pub fn set_value(&mut self, id: ValueId, value: impl Into<Value>) {
        self.values.insert(id, value.into());
    }

    /// Typed read of an existing attribute.
    pub fn value<T: ValueType>(&self, id: ValueId) -> Result<T, CoreError> {
        let value = self
            .values
            .get(&id)
            .ok_or(CoreError::ModuleValueNotFound {
                module: self.handle,
                id,
            })?;
        read_as(id, value)
    }
}
