//! Hierarchical mix bus tree.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::ids::{BusId, IdAllocator};
use crate::marshaller::MarshallerHandle;

/// Snapshot of a bus's effective (inherited) values, published after every
/// recomputation so any thread can read it without going through the
/// marshaller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusSnapshot {
    pub effective_gain: f32,
    pub effective_pitch: f32,
    pub effective_priority_bias: i32,
    pub effective_muted: bool,
    pub version: u64,
}

struct BusNode {
    #[allow(dead_code)] // kept for diagnostics / future path-rendering
    name: String,
    parent: Option<BusId>,
    children: Vec<BusId>,

    local_gain: f32,
    local_pitch: f32,
    local_priority_bias: i32,
    local_muted: bool,

    effective_gain: f32,
    effective_pitch: f32,
    effective_priority_bias: i32,
    effective_muted: bool,
    version: u64,

    published: Arc<ArcSwap<BusSnapshot>>,
}

impl BusNode {
    fn snapshot(&self) -> BusSnapshot {
        BusSnapshot {
            effective_gain: self.effective_gain,
            effective_pitch: self.effective_pitch,
            effective_priority_bias: self.effective_priority_bias,
            effective_muted: self.effective_muted,
            version: self.version,
        }
    }

    fn publish(&self) {
        self.published.store(Arc::new(self.snapshot()));
    }
}

pub struct BusTree {
    nodes: HashMap<BusId, BusNode>,
    master: BusId,
    ids: IdAllocator,
}

impl BusTree {
    pub fn new() -> Self {
        let ids = IdAllocator::default();
        let master = BusId(ids.next());
        let mut nodes = HashMap::new();
        nodes.insert(
            master,
            BusNode {
                name: "Master".to_string(),
                parent: None,
                children: Vec::new(),
                local_gain: 1.0,
                local_pitch: 1.0,
                local_priority_bias: 0,
                local_muted: false,
                effective_gain: 1.0,
                effective_pitch: 1.0,
                effective_priority_bias: 0,
                effective_muted: false,
                version: 0,
                published: Arc::new(ArcSwap::from_pointee(BusSnapshot {
                    effective_gain: 1.0,
                    effective_pitch: 1.0,
                    effective_priority_bias: 0,
                    effective_muted: false,
                    version: 0,
                })),
            },
        );
        Self { nodes, master, ids }
    }

    pub fn master(&self) -> BusId {
        self.master
    }

    fn segments(path: &str) -> Vec<&str> {
        path.trim_start_matches('/').split('/').filter(|s| !s.is_empty()).collect()
    }

    fn child_by_name(&self, parent: BusId, name: &str) -> Option<BusId> {
        self.nodes
            .get(&parent)?
            .children
            .iter()
            .copied()
            .find(|c| self.nodes[c].name == name)
    }

    /// Resolve `path`, creating any missing segments along the way. Empty
    /// path (or `/`) resolves to Master; double slashes are ignored.
    pub fn resolve_or_create(&mut self, path: &str) -> BusId {
        let mut current = self.master;
        for seg in Self::segments(path) {
            current = match self.child_by_name(current, seg) {
                Some(id) => id,
                None => self.create_child(current, seg.to_string()),
            };
        }
        current
    }

    /// Resolve `path` without creating missing segments.
    pub fn lookup(&self, path: &str) -> Option<BusId> {
        let mut current = self.master;
        for seg in Self::segments(path) {
            current = self.child_by_name(current, seg)?;
        }
        Some(current)
    }

    fn create_child(&mut self, parent: BusId, name: String) -> BusId {
        let parent_snapshot = self.nodes[&parent].snapshot();
        let id = BusId(self.ids.next());
        let effective_muted = parent_snapshot.effective_muted; // local_muted defaults false
        let effective_gain = if effective_muted { 0.0 } else { parent_snapshot.effective_gain };
        let node = BusNode {
            name,
            parent: Some(parent),
            children: Vec::new(),
            local_gain: 1.0,
            local_pitch: 1.0,
            local_priority_bias: 0,
            local_muted: false,
            effective_gain,
            effective_pitch: parent_snapshot.effective_pitch,
            effective_priority_bias: parent_snapshot.effective_priority_bias,
            effective_muted,
            version: 0,
            published: Arc::new(ArcSwap::from_pointee(BusSnapshot {
                effective_gain,
                effective_pitch: parent_snapshot.effective_pitch,
                effective_priority_bias: parent_snapshot.effective_priority_bias,
                effective_muted,
                version: 0,
            })),
        };
        node.publish();
        self.nodes.insert(id, node);
        self.nodes.get_mut(&parent).unwrap().children.push(id);
        id
    }

    /// Delete the bus at `path` (and its whole subtree). Returns `false` if
    /// the path doesn't resolve to an existing bus, or resolves to Master.
    pub fn delete(&mut self, path: &str) -> bool {
        let Some(target) = self.lookup(path) else {
            return false;
        };
        if target == self.master {
            return false;
        }
        let parent = self.nodes[&target].parent.unwrap();
        self.delete_subtree(target);
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.retain(|c| *c != target);
        }
        true
    }

    fn delete_subtree(&mut self, id: BusId) {
        if let Some(node) = self.nodes.remove(&id) {
            for child in node.children {
                self.delete_subtree(child);
            }
        }
    }

    pub fn exists(&self, id: BusId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn snapshot(&self, id: BusId) -> Option<BusSnapshot> {
        self.nodes.get(&id).map(BusNode::snapshot)
    }

    pub fn published_handle(&self, id: BusId) -> Option<Arc<ArcSwap<BusSnapshot>>> {
        self.nodes.get(&id).map(|n| n.published.clone())
    }

    pub fn set_local_gain(&mut self, id: BusId, gain: f32) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.local_gain = gain.max(0.0);
            self.recompute_from(id);
        }
    }

    pub fn set_local_pitch(&mut self, id: BusId, pitch: f32) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.local_pitch = pitch.max(f32::MIN_POSITIVE);
            self.recompute_from(id);
        }
    }

    pub fn set_local_priority_bias(&mut self, id: BusId, bias: i32) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.local_priority_bias = bias;
            self.recompute_from(id);
        }
    }

    pub fn set_local_muted(&mut self, id: BusId, muted: bool) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.local_muted = muted;
            self.recompute_from(id);
        }
    }

    /// Recompute effective values depth-first, parents before children,
    /// starting at `start` and covering every descendant, bumping each
    /// visited node's version.
    fn recompute_from(&mut self, start: BusId) {
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            let parent_snapshot = self.nodes[&id]
                .parent
                .map(|p| self.nodes[&p].snapshot())
                .unwrap_or(BusSnapshot {
                    effective_gain: 1.0,
                    effective_pitch: 1.0,
                    effective_priority_bias: 0,
                    effective_muted: false,
                    version: 0,
                });
            let node = self.nodes.get_mut(&id).unwrap();
            node.effective_muted = node.local_muted || parent_snapshot.effective_muted;
            node.effective_gain = if node.effective_muted {
                0.0
            } else {
                node.local_gain * parent_snapshot.effective_gain
            };
            node.effective_pitch = node.local_pitch * parent_snapshot.effective_pitch;
            node.effective_priority_bias = node.local_priority_bias + parent_snapshot.effective_priority_bias;
            node.version += 1;
            node.publish();
            stack.extend(node.children.iter().copied());
        }
    }
}

impl Default for BusTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Off-audio-thread handle to a single bus. All mutators are deferred
/// through the marshaller; reads come from the published snapshot.
#[derive(Clone)]
pub struct BusHandle {
    id: BusId,
    marshaller: MarshallerHandle,
    published: Arc<ArcSwap<BusSnapshot>>,
}

impl BusHandle {
    pub(crate) fn new(id: BusId, marshaller: MarshallerHandle, published: Arc<ArcSwap<BusSnapshot>>) -> Self {
        Self { id, marshaller, published }
    }

    pub fn id(&self) -> BusId {
        self.id
    }

    pub fn effective(&self) -> BusSnapshot {
        **self.published.load()
    }

    pub fn set_gain(&self, gain: f32) {
        let id = self.id;
        self.marshaller.defer("bus.set_gain", move |state| state.buses.set_local_gain(id, gain));
    }

    pub fn set_pitch(&self, pitch: f32) {
        let id = self.id;
        self.marshaller.defer("bus.set_pitch", move |state| state.buses.set_local_pitch(id, pitch));
    }

    pub fn set_priority_bias(&self, bias: i32) {
        let id = self.id;
        self.marshaller
            .defer("bus.set_priority_bias", move |state| state.buses.set_local_priority_bias(id, bias));
    }

    pub fn set_muted(&self, muted: bool) {
        let id = self.id;
        self.marshaller.defer("bus.set_muted", move |state| state.buses.set_local_muted(id, muted));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_gain_cascade() {
        let mut tree = BusTree::new();
        let sfx = tree.resolve_or_create("/sfx");
        let guns = tree.resolve_or_create("/sfx/guns");

        tree.set_local_gain(sfx, 0.5);
        tree.set_local_gain(guns, 0.5);
        assert_eq!(tree.snapshot(guns).unwrap().effective_gain, 0.25);

        tree.set_local_muted(sfx, true);
        assert_eq!(tree.snapshot(guns).unwrap().effective_gain, 0.0);
    }

    #[test]
    fn double_slash_and_leading_slash_are_tolerated() {
        let mut tree = BusTree::new();
        let a = tree.resolve_or_create("/sfx//guns");
        let b = tree.resolve_or_create("sfx/guns");
        assert_eq!(a, b);
    }

    #[test]
    fn empty_path_resolves_to_master() {
        let tree = BusTree::new();
        assert_eq!(tree.lookup(""), Some(tree.master()));
        assert_eq!(tree.lookup("/"), Some(tree.master()));
    }

    #[test]
    fn lookup_missing_path_is_none() {
        let tree = BusTree::new();
        assert_eq!(tree.lookup("/does/not/exist"), None);
    }

    #[test]
    fn delete_removes_subtree() {
        let mut tree = BusTree::new();
        let sfx = tree.resolve_or_create("/sfx");
        let guns = tree.resolve_or_create("/sfx/guns");
        assert!(tree.delete("/sfx"));
        assert!(!tree.exists(sfx));
        assert!(!tree.exists(guns));
        assert!(!tree.delete("/sfx"));
    }

    #[test]
    fn delete_master_is_refused() {
        let mut tree = BusTree::new();
        assert!(!tree.delete(""));
    }

    #[test]
    fn version_strictly_increases_on_mutation() {
        let mut tree = BusTree::new();
        let sfx = tree.resolve_or_create("/sfx");
        let before = tree.snapshot(sfx).unwrap().version;
        tree.set_local_gain(sfx, 0.3);
        let after = tree.snapshot(sfx).unwrap().version;
        assert!(after > before);
    }

    #[test]
    fn recomputation_from_scratch_matches_cache_after_random_mutations() {
        let mut tree = BusTree::new();
        let a = tree.resolve_or_create("/a");
        let b = tree.resolve_or_create("/a/b");
        let c = tree.resolve_or_create("/a/b/c");

        tree.set_local_gain(a, 0.8);
        tree.set_local_pitch(b, 1.25);
        tree.set_local_priority_bias(c, 3);
        tree.set_local_muted(b, true);
        tree.set_local_muted(b, false);
        tree.set_local_gain(c, 0.5);

        let snap_a = tree.snapshot(a).unwrap();
        let snap_b = tree.snapshot(b).unwrap();
        let snap_c = tree.snapshot(c).unwrap();

        assert_eq!(snap_a.effective_gain, 0.8);
        assert_eq!(snap_b.effective_gain, 1.0 * 0.8);
        assert_eq!(snap_c.effective_gain, 0.5 * snap_b.effective_gain);
        assert_eq!(snap_c.effective_pitch, 1.0 * snap_b.effective_pitch);
        assert_eq!(snap_c.effective_priority_bias, 3 + snap_b.effective_priority_bias);
    }
}
