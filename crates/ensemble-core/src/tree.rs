//! The spatial module tree of a game object.
//!
//! Vertices live in a [`SlotMap`] arena and are addressed by stable
//! [`NodeKey`]s, so inserting or removing a vertex never invalidates other
//! keys. Each vertex holds a [`Part`] (a module, or the handle of a docked
//! game object), its out-edges, and its parent.
//!
//! A single sentinel *dummy* vertex stands for "nothing connected here":
//! every free adapter slot of every vertex is an out-edge to the dummy. The
//! dummy has no handle and is never removed.

use std::collections::HashMap;

use slotmap::{new_key_type, SlotMap};

use crate::adapter::{Adapter, AdapterId};
use crate::handle::GameHandle;
use crate::module::Module;
use crate::CoreError;

new_key_type! {
    /// Stable key of a vertex in a [`ModuleTree`].
    pub struct NodeKey;
}

// ---------------------------------------------------------------------------
// Part
// ---------------------------------------------------------------------------

/// What a tree vertex holds.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Module(Module),
    /// A docked game object, referenced by handle. The tree does not own it.
    Object(GameHandle),
}

impl Part {
    pub fn handle(&self) -> GameHandle {
        match self {
            Part::Module(m) => m.handle(),
            Part::Object(h) => *h,
        }
    }

    pub fn as_module(&self) -> Option<&Module> {
        match self {
            Part::Module(m) => Some(m),
            Part::Object(_) => None,
        }
    }

    pub fn as_module_mut(&mut self) -> Option<&mut Module> {
        match self {
            Part::Module(m) => Some(m),
            Part::Object(_) => None,
        }
    }
}

impl From<Module> for Part {
    fn from(m: Module) -> Self {
        Part::Module(m)
    }
}

// ---------------------------------------------------------------------------
// Vertices and edges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Edge {
    target: NodeKey,
    adapter: Adapter,
}

#[derive(Debug, Clone)]
struct Vertex {
    /// `None` only for the dummy.
    part: Option<Part>,
    parent: Option<NodeKey>,
    out: Vec<Edge>,
}

// ---------------------------------------------------------------------------
// ModuleTree
// ---------------------------------------------------------------------------

/// Arena-backed tree of parts connected through adapters.
#[derive(Debug, Clone)]
pub struct ModuleTree {
    owner: GameHandle,
    nodes: SlotMap<NodeKey, Vertex>,
    by_handle: HashMap<GameHandle, NodeKey>,
    dummy: NodeKey,
    root: Option<NodeKey>,
}

impl ModuleTree {
    /// Empty tree (dummy vertex only) belonging to `owner`.
    pub fn new(owner: GameHandle) -> Self {
        let mut nodes = SlotMap::with_key();
        let dummy = nodes.insert(Vertex {
            part: None,
            parent: None,
            out: Vec::new(),
        });
        Self {
            owner,
            nodes,
            by_handle: HashMap::new(),
            dummy,
            root: None,
        }
    }

    pub fn dummy(&self) -> NodeKey {
        self.dummy
    }

    pub fn root(&self) -> Option<NodeKey> {
        self.root
    }

    /// Number of vertices, dummy included.
    pub fn vertex_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of parts (vertices other than the dummy).
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, handle: GameHandle) -> Option<NodeKey> {
        self.by_handle.get(&handle).copied()
    }

    pub fn contains(&self, handle: GameHandle) -> bool {
        self.by_handle.contains_key(&handle)
    }

    pub fn part(&self, key: NodeKey) -> Option<&Part> {
        self.nodes.get(key).and_then(|v| v.part.as_ref())
    }

    pub fn part_mut(&mut self, key: NodeKey) -> Option<&mut Part> {
        self.nodes.get_mut(key).and_then(|v| v.part.as_mut())
    }

    pub fn module(&self, handle: GameHandle) -> Option<&Module> {
        self.find(handle)
            .and_then(|k| self.part(k))
            .and_then(Part::as_module)
    }

    pub fn module_mut(&mut self, handle: GameHandle) -> Option<&mut Module> {
        let key = self.find(handle)?;
        self.part_mut(key).and_then(Part::as_module_mut)
    }

    /// Every part, in arena order.
    pub fn parts(&self) -> impl Iterator<Item = &Part> {
        self.nodes.values().filter_map(|v| v.part.as_ref())
    }

    /// Parent vertex of `key`, if connected.
    pub fn parent(&self, key: NodeKey) -> Option<NodeKey> {
        self.nodes.get(key).and_then(|v| v.parent)
    }

    /// Connected children of `key` (dummy edges excluded).
    pub fn children(&self, key: NodeKey) -> Vec<NodeKey> {
        self.nodes
            .get(key)
            .map(|v| {
                v.out
                    .iter()
                    .filter(|e| e.target != self.dummy)
                    .map(|e| e.target)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Adapter ids of the free (unconnected) slots of `key`.
    pub fn free_adapters(&self, key: NodeKey) -> Vec<AdapterId> {
        self.nodes
            .get(key)
            .map(|v| {
                v.out
                    .iter()
                    .filter(|e| e.target == self.dummy)
                    .map(|e| e.adapter.identifier)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Add a vertex for `part` whose adapter slots all start unconnected.
    pub fn add_vertex(&mut self, part: Part, adapters: &[Adapter]) -> Result<NodeKey, CoreError> {
        let handle = part.handle();
        if self.by_handle.contains_key(&handle) {
            return Err(CoreError::DuplicateHandle {
                owner: self.owner,
                handle,
            });
        }
        let dummy = self.dummy;
        let key = self.nodes.insert(Vertex {
            part: Some(part),
            parent: None,
            out: adapters
                .iter()
                .map(|a| Edge {
                    target: dummy,
                    adapter: *a,
                })
                .collect(),
        });
        self.by_handle.insert(handle, key);
        Ok(key)
    }

    /// Mark `key` as the root vertex.
    pub fn set_root(&mut self, key: NodeKey) {
        self.root = Some(key);
    }

    /// Weld `child` to `parent`.
    ///
    /// Removes the parent's free slot `parent_adapter` and the child's free
    /// slot `child_adapter` and replaces them with a single parent→child edge
    /// carrying both frames. Both slots are located before anything is
    /// modified, so a failure leaves the tree untouched.
    pub fn connect(
        &mut self,
        parent: NodeKey,
        parent_adapter: AdapterId,
        child: NodeKey,
        child_adapter: AdapterId,
    ) -> Result<Adapter, CoreError> {
        let parent_slot = self.free_slot(parent, parent_adapter)?;
        let child_slot = self.free_slot(child, child_adapter)?;

        let child_edge = self.nodes[child].out.remove(child_slot);
        let parent_edge = &mut self.nodes[parent].out[parent_slot];
        parent_edge.adapter = parent_edge.adapter.welded_with(&child_edge.adapter);
        parent_edge.target = child;
        let welded = parent_edge.adapter;
        self.nodes[child].parent = Some(parent);
        Ok(welded)
    }

    /// Cut `child` loose from its parent.
    ///
    /// The parent's edge goes back to the dummy, keeping the parent-side
    /// frame and id so the slot can be reused. Returns the parent and the
    /// restored slot, or `None` if `child` had no parent.
    pub fn disconnect(&mut self, child: NodeKey) -> Option<(NodeKey, Adapter)> {
        let parent = self.nodes.get(child)?.parent?;
        let dummy = self.dummy;
        let edge = self.nodes[parent]
            .out
            .iter_mut()
            .find(|e| e.target == child)?;
        edge.target = dummy;
        edge.adapter = edge.adapter.unwelded();
        let restored = edge.adapter;
        self.nodes[child].parent = None;
        Some((parent, restored))
    }

    /// Welded adapters on the path from `key` up to the root, leaf first.
    pub fn path_to_root(&self, key: NodeKey) -> Vec<Adapter> {
        let mut chain = Vec::new();
        let mut current = key;
        while let Some(parent) = self.parent(current) {
            let Some(edge) = self.nodes[parent].out.iter().find(|e| e.target == current) else {
                break;
            };
            chain.push(edge.adapter);
            current = parent;
        }
        chain
    }

    /// `key` and every vertex below it, pre-order.
    pub fn subtree(&self, key: NodeKey) -> Vec<NodeKey> {
        let mut out = Vec::new();
        let mut stack = vec![key];
        while let Some(current) = stack.pop() {
            if current == self.dummy || out.contains(&current) || !self.nodes.contains_key(current) {
                continue;
            }
            out.push(current);
            stack.extend(self.children(current).into_iter().rev());
        }
        out
    }

    /// Remove `key` and everything hanging below it, depth first.
    ///
    /// Uses an explicit worklist and removes each vertex as it is visited,
    /// so the walk terminates even on a malformed graph. The caller is
    /// expected to [`disconnect`](Self::disconnect) `key` first. Returns the
    /// removed parts in visiting order.
    pub fn remove_subtree(&mut self, key: NodeKey) -> Vec<Part> {
        let mut removed = Vec::new();
        let mut stack = vec![key];
        while let Some(current) = stack.pop() {
            if current == self.dummy {
                continue;
            }
            let Some(vertex) = self.nodes.remove(current) else {
                continue;
            };
            if self.root == Some(current) {
                self.root = None;
            }
            stack.extend(
                vertex
                    .out
                    .iter()
                    .rev()
                    .filter(|e| e.target != self.dummy)
                    .map(|e| e.target),
            );
            if let Some(part) = vertex.part {
                self.by_handle.remove(&part.handle());
                removed.push(part);
            }
        }
        removed
    }

    /// Index of the out-edge of `key` that is the free slot `adapter`.
    fn free_slot(&self, key: NodeKey, adapter: AdapterId) -> Result<usize, CoreError> {
        let vertex = &self.nodes[key];
        let module = vertex.part.as_ref().map(Part::handle).unwrap_or_default();
        match vertex.out.iter().position(|e| e.adapter.identifier == adapter) {
            Some(i) if vertex.out[i].target == self.dummy => Ok(i),
            Some(_) => Err(CoreError::AdapterInUse {
                owner: self.owner,
                module,
                adapter,
            }),
            None => Err(CoreError::AdapterNotFound {
                owner: self.owner,
                module,
                adapter,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Vec3;

    fn h(raw: u64) -> GameHandle {
        GameHandle::from_raw(raw)
    }

    fn part(raw: u64) -> Part {
        Part::Module(Module::new(h(raw)))
    }

    fn slots() -> Vec<Adapter> {
        vec![
            Adapter::at(0, Vec3::new(-1.0, 0.0, 0.0)),
            Adapter::at(1, Vec3::new(1.0, 0.0, 0.0)),
        ]
    }

    #[test]
    fn new_tree_has_only_dummy() {
        let tree = ModuleTree::new(h(1));
        assert_eq!(tree.vertex_count(), 1);
        assert!(tree.is_empty());
        assert!(tree.root().is_none());
    }

    #[test]
    fn connect_welds_both_frames() {
        let mut tree = ModuleTree::new(h(1));
        let root = tree.add_vertex(part(1), &slots()).unwrap();
        tree.set_root(root);
        let child = tree.add_vertex(part(2), &slots()).unwrap();

        let welded = tree.connect(root, 1, child, 0).unwrap();
        assert_eq!(welded.identifier, 1);
        assert_eq!(welded.parent_position, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(welded.child_position, Vec3::new(-1.0, 0.0, 0.0));
        assert!(welded.good);

        assert_eq!(tree.parent(child), Some(root));
        assert_eq!(tree.children(root), vec![child]);
        assert_eq!(tree.free_adapters(root), vec![0]);
        assert_eq!(tree.free_adapters(child), vec![1]);
        assert_eq!(tree.path_to_root(child), vec![welded]);
    }

    #[test]
    fn connect_failure_leaves_tree_untouched() {
        let mut tree = ModuleTree::new(h(1));
        let root = tree.add_vertex(part(1), &slots()).unwrap();
        let child = tree.add_vertex(part(2), &slots()).unwrap();

        let err = tree.connect(root, 1, child, 7).unwrap_err();
        assert!(matches!(err, CoreError::AdapterNotFound { adapter: 7, .. }));
        assert_eq!(tree.free_adapters(root), vec![0, 1]);

        tree.connect(root, 1, child, 0).unwrap();
        let other = tree.add_vertex(part(3), &slots()).unwrap();
        let err = tree.connect(root, 1, other, 0).unwrap_err();
        assert!(matches!(err, CoreError::AdapterInUse { adapter: 1, .. }));
    }

    #[test]
    fn duplicate_handle_rejected() {
        let mut tree = ModuleTree::new(h(1));
        tree.add_vertex(part(5), &[]).unwrap();
        assert!(matches!(
            tree.add_vertex(part(5), &[]),
            Err(CoreError::DuplicateHandle { .. })
        ));
    }

    #[test]
    fn disconnect_then_remove_subtree() {
        let mut tree = ModuleTree::new(h(1));
        let root = tree.add_vertex(part(1), &slots()).unwrap();
        tree.set_root(root);
        let a = tree.add_vertex(part(2), &slots()).unwrap();
        tree.connect(root, 1, a, 0).unwrap();
        let b = tree.add_vertex(part(3), &slots()).unwrap();
        tree.connect(a, 1, b, 0).unwrap();
        assert_eq!(tree.path_to_root(b).len(), 2);

        let (parent, slot) = tree.disconnect(a).unwrap();
        assert_eq!(parent, root);
        assert_eq!(slot.identifier, 1);
        assert_eq!(tree.free_adapters(root), vec![0, 1]);

        let removed: Vec<_> = tree.remove_subtree(a).iter().map(Part::handle).collect();
        assert_eq!(removed, vec![h(2), h(3)]);
        assert_eq!(tree.len(), 1);
        assert!(!tree.contains(h(3)));

        // The vacated slot accepts a new child.
        let c = tree.add_vertex(part(4), &slots()).unwrap();
        tree.connect(root, 1, c, 0).unwrap();
    }
}
