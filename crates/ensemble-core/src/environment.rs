//! Per-session registry of live game objects.
//!
//! The [`Environment`] maps handles to *weak* references. It never keeps an
//! object alive: the session owns its objects, and an object removes its own
//! entry when it is dropped. Concepts use [`Environment::exists`] to check a
//! previously captured handle before using it, because the target may have
//! been destroyed in the meantime.
//!
//! Cloning an `Environment` is cheap and yields another view of the same
//! registry.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use crate::game_object::GameObject;
use crate::handle::GameHandle;
use crate::value::{ValueId, ValueType};
use crate::CoreError;

type Registry = BTreeMap<GameHandle, Weak<RefCell<GameObject>>>;

/// Shared handle to the registry of live game objects.
#[derive(Clone, Default)]
pub struct Environment {
    inner: Rc<RefCell<Registry>>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("objects", &self.len())
            .finish()
    }
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `object`, pruning entries whose objects are gone.
    pub(crate) fn add(&self, handle: GameHandle, object: &Rc<RefCell<GameObject>>) {
        let mut registry = self.inner.borrow_mut();
        registry.retain(|_, weak| weak.strong_count() > 0);
        registry.insert(handle, Rc::downgrade(object));
    }

    /// Forget `handle`. Tolerates a registry that is borrowed elsewhere (a
    /// drop during a search); the dead weak entry is then skipped by every
    /// query and pruned by the next [`add`](Self::add).
    pub(crate) fn remove(&self, handle: GameHandle) {
        if let Ok(mut registry) = self.inner.try_borrow_mut() {
            registry.remove(&handle);
        }
    }

    /// The live object behind `handle`.
    pub fn get(&self, handle: GameHandle) -> Option<Rc<RefCell<GameObject>>> {
        self.inner.borrow().get(&handle).and_then(Weak::upgrade)
    }

    /// Whether `handle` names a live object.
    pub fn exists(&self, handle: GameHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.inner
            .borrow()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles of all live objects, ascending.
    pub fn handles(&self) -> Vec<GameHandle> {
        self.live().into_iter().map(|(h, _)| h).collect()
    }

    /// First live object (in handle order) matching `predicate`.
    ///
    /// Objects that are mutably borrowed at the time of the call (typically
    /// the caller's own owner, mid-update) are skipped.
    pub fn find(&self, mut predicate: impl FnMut(&GameObject) -> bool) -> Option<GameHandle> {
        self.live().into_iter().find_map(|(handle, object)| {
            let object = object.try_borrow().ok()?;
            predicate(&object).then_some(handle)
        })
    }

    /// Every live object matching `predicate`, in handle order. Busy objects
    /// are skipped as in [`find`](Self::find).
    pub fn find_all(&self, mut predicate: impl FnMut(&GameObject) -> bool) -> Vec<GameHandle> {
        self.live()
            .into_iter()
            .filter_map(|(handle, object)| {
                let object = object.try_borrow().ok()?;
                predicate(&object).then_some(handle)
            })
            .collect()
    }

    /// Read an object-wide value of another object.
    pub fn go_value<T: ValueType>(&self, handle: GameHandle, id: ValueId) -> Result<T, CoreError> {
        let object = self
            .get(handle)
            .ok_or(CoreError::ObjectNotFound { handle })?;
        let object = object
            .try_borrow()
            .map_err(|_| CoreError::ObjectBusy { handle })?;
        object.value(id)
    }

    /// Snapshot of the live entries, so callbacks never run while the
    /// registry itself is borrowed.
    fn live(&self) -> Vec<(GameHandle, Rc<RefCell<GameObject>>)> {
        self.inner
            .borrow()
            .iter()
            .filter_map(|(h, w)| w.upgrade().map(|o| (*h, o)))
            .collect()
    }
}
