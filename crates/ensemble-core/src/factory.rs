//! Concept factories grouped into plugins.
//!
//! A [`Plugin`] owns a set of [`ConceptFactory`]s and a [`PluginId`] that
//! namespaces its variables. Plugins are registered into a [`PluginMap`],
//! which resolves a [`ConceptId`] to the factory that builds it. A concept
//! name may only be claimed by one plugin.

use std::collections::{BTreeMap, HashMap};

use crate::concept::{Concept, ConceptCtor, ConceptId, ConceptSetup};
use crate::value::PluginId;
use crate::CoreError;

// ---------------------------------------------------------------------------
// ConceptFactory
// ---------------------------------------------------------------------------

/// Builds instances of one concept kind.
#[derive(Clone)]
pub struct ConceptFactory {
    id: ConceptId,
    plugin: PluginId,
    ctor: ConceptCtor,
}

impl ConceptFactory {
    pub fn id(&self) -> &ConceptId {
        &self.id
    }

    pub fn plugin(&self) -> PluginId {
        self.plugin
    }

    pub(crate) fn build(&self, setup: &mut ConceptSetup<'_>) -> Result<Box<dyn Concept>, CoreError> {
        (self.ctor)(setup)
    }
}

impl std::fmt::Debug for ConceptFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConceptFactory")
            .field("id", &self.id)
            .field("plugin", &self.plugin)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Plugin
// ---------------------------------------------------------------------------

/// A named group of concept factories sharing one [`PluginId`].
#[derive(Debug, Clone)]
pub struct Plugin {
    id: PluginId,
    name: String,
    factories: BTreeMap<ConceptId, ConceptFactory>,
}

impl Plugin {
    pub fn new(id: PluginId, name: &str) -> Self {
        Self {
            id,
            name: name.to_owned(),
            factories: BTreeMap::new(),
        }
    }

    /// Builder: register a concept constructor.
    ///
    /// # Panics
    ///
    /// Panics if `concept` is already registered in this plugin.
    pub fn with_concept(mut self, concept: impl Into<ConceptId>, ctor: ConceptCtor) -> Self {
        let concept = concept.into();
        assert!(
            !self.factories.contains_key(&concept),
            "concept '{concept}' registered twice in plugin '{}'",
            self.name
        );
        self.factories.insert(
            concept.clone(),
            ConceptFactory {
                id: concept,
                plugin: self.id,
                ctor,
            },
        );
        self
    }

    pub fn id(&self) -> PluginId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concepts(&self) -> impl Iterator<Item = &ConceptId> {
        self.factories.keys()
    }
}

// ---------------------------------------------------------------------------
// PluginMap
// ---------------------------------------------------------------------------

/// All plugins known to a session.
#[derive(Debug, Default, Clone)]
pub struct PluginMap {
    plugins: Vec<Plugin>,
    /// ConceptId -> (plugin index, so lookups stay cheap).
    by_concept: HashMap<ConceptId, usize>,
}

impl PluginMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. Fails if one of its concepts is already provided by
    /// another plugin; nothing is registered in that case.
    pub fn register(&mut self, plugin: Plugin) -> Result<(), CoreError> {
        for concept in plugin.concepts() {
            if let Some(&existing) = self.by_concept.get(concept) {
                return Err(CoreError::DuplicateConcept {
                    concept: concept.clone(),
                    plugin: self.plugins[existing].id,
                });
            }
        }
        let index = self.plugins.len();
        for concept in plugin.concepts() {
            self.by_concept.insert(concept.clone(), index);
        }
        tracing::debug!(
            plugin = %plugin.name,
            id = plugin.id.0,
            concepts = plugin.factories.len(),
            "registered concept plugin"
        );
        self.plugins.push(plugin);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_plugin(mut self, plugin: Plugin) -> Result<Self, CoreError> {
        self.register(plugin)?;
        Ok(self)
    }

    /// The factory for `concept`, or [`CoreError::UnknownConcept`].
    pub fn factory(&self, concept: &ConceptId) -> Result<&ConceptFactory, CoreError> {
        self.by_concept
            .get(concept)
            .and_then(|&i| self.plugins[i].factories.get(concept))
            .ok_or_else(|| CoreError::UnknownConcept {
                concept: concept.clone(),
                registered: self.registered_names().join(", "),
            })
    }

    pub fn contains(&self, concept: &ConceptId) -> bool {
        self.by_concept.contains_key(concept)
    }

    pub fn plugin(&self, id: PluginId) -> Option<&Plugin> {
        self.plugins.iter().find(|p| p.id == id)
    }

    /// Every registered concept name, sorted.
    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_concept.keys().map(ConceptId::as_str).collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;
    impl Concept for Nothing {}

    fn nothing(_setup: &mut ConceptSetup<'_>) -> Result<Box<dyn Concept>, CoreError> {
        Ok(Box::new(Nothing))
    }

    #[test]
    fn lookup_resolves_plugin() {
        let map = PluginMap::new()
            .with_plugin(Plugin::new(PluginId(1), "core").with_concept("A", nothing))
            .unwrap()
            .with_plugin(Plugin::new(PluginId(2), "extra").with_concept("B", nothing))
            .unwrap();

        assert_eq!(map.factory(&"A".into()).unwrap().plugin(), PluginId(1));
        assert_eq!(map.factory(&"B".into()).unwrap().plugin(), PluginId(2));
        assert_eq!(map.registered_names(), vec!["A", "B"]);
        assert_eq!(map.plugin(PluginId(2)).unwrap().name(), "extra");
    }

    #[test]
    fn unknown_concept_lists_registered() {
        let map = PluginMap::new()
            .with_plugin(Plugin::new(PluginId(1), "core").with_concept("A", nothing))
            .unwrap();
        let err = map.factory(&"Zzz".into()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Zzz") && msg.contains("[A]"), "got: {msg}");
    }

    #[test]
    fn concept_claimed_by_two_plugins_rejected() {
        let mut map = PluginMap::new();
        map.register(Plugin::new(PluginId(1), "core").with_concept("A", nothing))
            .unwrap();
        let err = map
            .register(
                Plugin::new(PluginId(2), "other")
                    .with_concept("B", nothing)
                    .with_concept("A", nothing),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateConcept { plugin: PluginId(1), .. }));
        // Nothing from the rejected plugin leaked in.
        assert!(!map.contains(&"B".into()));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_within_plugin_panics() {
        let _ = Plugin::new(PluginId(1), "core")
            .with_concept("A", nothing)
            .with_concept("A", nothing);
    }
}
