//! Resident and persisted nodes, and the pointer that joins them.

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc, OnceLock,
};

use arc_swap::ArcSwapOption;
use bytes::Bytes;

use crate::storage::{
    changeset::Changeset,
    layout::{BranchLayout, LeafLayout},
};
use crate::types::{Hash, IavlError, NodeId, Result};

/// In-memory node. Nodes of the staged version are never shared with a
/// committed tree; once a commit starts only `hash` is ever written.
pub struct MemNode {
    pub(crate) height: u8,
    pub(crate) size: i64,
    pub(crate) version: u32,
    pub(crate) key: Bytes,
    pub(crate) value: Option<Bytes>,
    pub(crate) hash: OnceLock<Hash>,
    pub(crate) left: Option<Arc<NodePointer>>,
    pub(crate) right: Option<Arc<NodePointer>>,
}

impl MemNode {
    /// New leaf of `version`.
    pub fn leaf(key: Bytes, value: Bytes, version: u32) -> Self {
        Self {
            height: 0,
            size: 1,
            version,
            key,
            value: Some(value),
            hash: OnceLock::new(),
            left: None,
            right: None,
        }
    }

    /// New branch of `version`; callers fix height and size afterwards when
    /// the children are not two leaves.
    pub(crate) fn branch(
        key: Bytes,
        left: Arc<NodePointer>,
        right: Arc<NodePointer>,
        version: u32,
    ) -> Self {
        Self {
            height: 1,
            size: 2,
            version,
            key,
            value: None,
            hash: OnceLock::new(),
            left: Some(left),
            right: Some(right),
        }
    }

    /// True for leaves.
    pub fn is_leaf(&self) -> bool {
        self.height == 0
    }

    /// Version that created the node.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Leaf key or branch pivot.
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Hash, once the node has been committed.
    pub fn hash(&self) -> Option<Hash> {
        self.hash.get().copied()
    }

    pub(crate) fn left_ptr(&self) -> Result<&Arc<NodePointer>> {
        self.left
            .as_ref()
            .ok_or(IavlError::Corruption("branch without left child"))
    }

    pub(crate) fn right_ptr(&self) -> Result<&Arc<NodePointer>> {
        self.right
            .as_ref()
            .ok_or(IavlError::Corruption("branch without right child"))
    }

    /// Recomputes height and size from the children.
    pub(crate) fn update_height_size(&mut self) -> Result<()> {
        let left = self.left_ptr()?.resolve()?;
        let right = self.right_ptr()?.resolve()?;
        self.height = left
            .height()
            .max(right.height())
            .checked_add(1)
            .ok_or(IavlError::OutOfRange("tree height exceeds u8"))?;
        self.size = left
            .size()
            .checked_add(right.size())
            .ok_or(IavlError::OutOfRange("subtree size overflow"))?;
        Ok(())
    }

    /// Left height minus right height.
    pub(crate) fn balance(&self) -> Result<i32> {
        let left = self.left_ptr()?.resolve()?;
        let right = self.right_ptr()?.resolve()?;
        Ok(i32::from(left.height()) - i32::from(right.height()))
    }
}

/// Handle to a node that is resident, persisted, or both.
///
/// `mem` is cleared by eviction once the node is persisted; `id`, `file_idx`
/// and `store` are published by the commit pipeline before that happens.
pub struct NodePointer {
    mem: ArcSwapOption<MemNode>,
    id: AtomicU64,
    file_idx: AtomicU32,
    store: ArcSwapOption<Changeset>,
}

impl NodePointer {
    /// Pointer to a fresh resident node.
    pub fn from_mem(node: MemNode) -> Arc<Self> {
        Arc::new(Self {
            mem: ArcSwapOption::from_pointee(node),
            id: AtomicU64::new(0),
            file_idx: AtomicU32::new(0),
            store: ArcSwapOption::empty(),
        })
    }

    /// Pointer to a persisted node. `file_idx == 0` means "look up by id".
    pub(crate) fn persisted(id: NodeId, file_idx: u32, store: Arc<Changeset>) -> Arc<Self> {
        Arc::new(Self {
            mem: ArcSwapOption::empty(),
            id: AtomicU64::new(id.0),
            file_idx: AtomicU32::new(file_idx),
            store: ArcSwapOption::new(Some(store)),
        })
    }

    /// Id assigned at commit, `NodeId::NONE` before.
    pub fn id(&self) -> NodeId {
        NodeId(self.id.load(Ordering::Acquire))
    }

    pub(crate) fn set_id(&self, id: NodeId) {
        self.id.store(id.0, Ordering::Release);
    }

    /// 1-based record index in the owning changeset, 0 when unknown.
    pub fn file_idx(&self) -> u32 {
        self.file_idx.load(Ordering::Acquire)
    }

    /// Changeset holding the persisted record, if written.
    pub fn store(&self) -> Option<Arc<Changeset>> {
        self.store.load_full()
    }

    /// True once the node has a persisted record.
    pub fn is_persisted(&self) -> bool {
        self.store.load().is_some()
    }

    pub(crate) fn mark_persisted(&self, file_idx: u32, store: &Arc<Changeset>) {
        self.file_idx.store(file_idx, Ordering::Release);
        self.store.store(Some(Arc::clone(store)));
    }

    /// Resident node, if any.
    pub fn mem(&self) -> Option<Arc<MemNode>> {
        self.mem.load_full()
    }

    /// Drops the resident node of a persisted pointer.
    pub(crate) fn evict(&self) -> bool {
        if !self.is_persisted() {
            return false;
        }
        self.mem.swap(None).is_some()
    }

    /// Returns the resident node or materializes the persisted one.
    pub fn resolve(&self) -> Result<Node> {
        if let Some(mem) = self.mem.load_full() {
            return Ok(Node::Mem(mem));
        }
        let store = self
            .store
            .load_full()
            .ok_or(IavlError::Corruption("node pointer has neither node nor store"))?;
        let node = store.resolve(self.id(), self.file_idx())?;
        if let Some(file_idx) = node.file_idx() {
            self.file_idx.store(file_idx, Ordering::Release);
        }
        Ok(node)
    }
}

/// Leaf read from a changeset.
#[derive(Clone)]
pub struct PersistedLeaf {
    pub(crate) layout: LeafLayout,
    pub(crate) store: Arc<Changeset>,
    pub(crate) file_idx: u32,
}

/// Branch read from a changeset.
#[derive(Clone)]
pub struct PersistedBranch {
    pub(crate) layout: BranchLayout,
    pub(crate) store: Arc<Changeset>,
    pub(crate) file_idx: u32,
}

/// A resolved node.
#[derive(Clone)]
pub enum Node {
    /// Resident node.
    Mem(Arc<MemNode>),
    /// Persisted leaf.
    Leaf(PersistedLeaf),
    /// Persisted branch.
    Branch(PersistedBranch),
}

impl Node {
    /// True for leaves.
    pub fn is_leaf(&self) -> bool {
        match self {
            Node::Mem(mem) => mem.is_leaf(),
            Node::Leaf(_) => true,
            Node::Branch(_) => false,
        }
    }

    /// Subtree height; 0 for leaves.
    pub fn height(&self) -> u8 {
        match self {
            Node::Mem(mem) => mem.height,
            Node::Leaf(_) => 0,
            Node::Branch(branch) => branch.layout.height,
        }
    }

    /// Leaves in the subtree.
    pub fn size(&self) -> i64 {
        match self {
            Node::Mem(mem) => mem.size,
            Node::Leaf(_) => 1,
            Node::Branch(branch) => i64::from(branch.layout.size),
        }
    }

    /// Version that created the node.
    pub fn version(&self) -> u32 {
        match self {
            Node::Mem(mem) => mem.version,
            Node::Leaf(leaf) => leaf.layout.id.version() as u32,
            Node::Branch(branch) => branch.layout.id.version() as u32,
        }
    }

    /// Id of a persisted node; `None` for resident nodes.
    pub fn persisted_id(&self) -> Option<NodeId> {
        match self {
            Node::Mem(_) => None,
            Node::Leaf(leaf) => Some(leaf.layout.id),
            Node::Branch(branch) => Some(branch.layout.id),
        }
    }

    /// 1-based record index of a persisted node.
    pub fn file_idx(&self) -> Option<u32> {
        match self {
            Node::Mem(_) => None,
            Node::Leaf(leaf) => Some(leaf.file_idx),
            Node::Branch(branch) => Some(branch.file_idx),
        }
    }

    /// Leaf key or branch pivot.
    pub fn key(&self) -> Result<Bytes> {
        match self {
            Node::Mem(mem) => Ok(mem.key.clone()),
            Node::Leaf(leaf) => leaf.store.read_k(leaf.layout.key_offset),
            Node::Branch(branch) => branch.store.read_k(branch.layout.key_offset),
        }
    }

    /// Leaf value; `None` for branches.
    pub fn value(&self) -> Result<Option<Bytes>> {
        match self {
            Node::Mem(mem) => Ok(mem.value.clone()),
            Node::Leaf(leaf) => {
                let (_, value) = leaf.store.read_kv(leaf.layout.key_offset)?;
                Ok(Some(value))
            }
            Node::Branch(_) => Ok(None),
        }
    }

    /// Key and value of a leaf.
    pub fn key_value(&self) -> Result<(Bytes, Bytes)> {
        match self {
            Node::Mem(mem) => {
                let value = mem
                    .value
                    .clone()
                    .ok_or(IavlError::Invalid("branch has no value"))?;
                Ok((mem.key.clone(), value))
            }
            Node::Leaf(leaf) => leaf.store.read_kv(leaf.layout.key_offset),
            Node::Branch(_) => Err(IavlError::Invalid("branch has no value")),
        }
    }

    /// Merkle hash; resident nodes have one only after commit.
    pub fn hash(&self) -> Result<Hash> {
        match self {
            Node::Mem(mem) => mem
                .hash()
                .ok_or(IavlError::Invalid("node hash is computed at commit")),
            Node::Leaf(leaf) => Ok(leaf.layout.hash),
            Node::Branch(branch) => Ok(branch.layout.hash),
        }
    }

    /// Left child of a branch.
    pub fn left(&self) -> Result<Arc<NodePointer>> {
        match self {
            Node::Mem(mem) => mem.left_ptr().map(Arc::clone),
            Node::Leaf(_) => Err(IavlError::Invalid("leaf has no children")),
            Node::Branch(branch) => branch
                .store
                .resolve_node_ref(branch.layout.left, branch.file_idx),
        }
    }

    /// Right child of a branch.
    pub fn right(&self) -> Result<Arc<NodePointer>> {
        match self {
            Node::Mem(mem) => mem.right_ptr().map(Arc::clone),
            Node::Leaf(_) => Err(IavlError::Invalid("leaf has no children")),
            Node::Branch(branch) => branch
                .store
                .resolve_node_ref(branch.layout.right, branch.file_idx),
        }
    }

    /// Left height minus right height.
    pub fn balance(&self) -> Result<i32> {
        let left = self.left()?.resolve()?;
        let right = self.right()?.resolve()?;
        Ok(i32::from(left.height()) - i32::from(right.height()))
    }

    /// Looks up `key` below this node, returning the in-order index at which
    /// it is (or would be) found and its value.
    pub fn get(&self, key: &[u8]) -> Result<(i64, Option<Bytes>)> {
        let mut node = self.clone();
        let mut index = 0i64;
        loop {
            if node.is_leaf() {
                let leaf_key = node.key()?;
                return match key.cmp(&leaf_key[..]) {
                    std::cmp::Ordering::Equal => Ok((index, node.value()?)),
                    std::cmp::Ordering::Less => Ok((index, None)),
                    std::cmp::Ordering::Greater => Ok((index + 1, None)),
                };
            }
            let pivot = node.key()?;
            if key < &pivot[..] {
                node = node.left()?.resolve()?;
            } else {
                let left = node.left()?.resolve()?;
                index += left.size();
                node = node.right()?.resolve()?;
            }
        }
    }
}
