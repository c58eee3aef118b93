//! Packed node identifiers and on-disk child references.

use std::fmt;

use super::{IavlError, Result};

const RELATIVE_BIT: u64 = 1 << 63;
const LEAF_BIT: u64 = 1 << 62;
const VERSION_SHIFT: u32 = 23;
const VERSION_BITS: u32 = 39;
const INDEX_MASK: u64 = (1 << VERSION_SHIFT) - 1;
const VERSION_MASK: u64 = (1 << VERSION_BITS) - 1;
const OFFSET_MASK: u64 = (1 << 62) - 1;

/// Largest version a [`NodeId`] can carry.
pub const MAX_NODE_VERSION: u64 = VERSION_MASK;
/// Largest per-version index a [`NodeId`] can carry.
pub const MAX_NODE_INDEX: u32 = INDEX_MASK as u32;
/// Largest magnitude of a relative [`NodeRef`] offset.
pub const MAX_RELATIVE_OFFSET: i64 = (1 << 61) - 1;

/// Globally unique node identifier.
///
/// Bit 63 is always clear, bit 62 marks a leaf, bits 61..23 hold the version
/// and bits 22..0 the 1-based index within that version's leaf or branch
/// sequence. `NodeId(0)` means "none".
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct NodeId(pub u64);

impl NodeId {
    /// The "none" sentinel.
    pub const NONE: NodeId = NodeId(0);

    /// Packs a node id, rejecting versions and indexes that do not fit.
    pub fn new(is_leaf: bool, version: u64, index: u32) -> Result<NodeId> {
        if version > VERSION_MASK {
            return Err(IavlError::OutOfRange("node version exceeds 39 bits"));
        }
        if u64::from(index) > INDEX_MASK {
            return Err(IavlError::OutOfRange("node index exceeds 23 bits"));
        }
        let mut raw = (version << VERSION_SHIFT) | u64::from(index);
        if is_leaf {
            raw |= LEAF_BIT;
        }
        Ok(NodeId(raw))
    }

    /// True for the sentinel.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// True when the id names a leaf.
    pub fn is_leaf(self) -> bool {
        self.0 & LEAF_BIT != 0
    }

    /// Version that created the node.
    pub fn version(self) -> u64 {
        (self.0 >> VERSION_SHIFT) & VERSION_MASK
    }

    /// 1-based index within the version.
    pub fn index(self) -> u32 {
        (self.0 & INDEX_MASK) as u32
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("none");
        }
        let kind = if self.is_leaf() { 'L' } else { 'B' };
        write!(f, "{kind}{}.{}", self.version(), self.index())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

/// Child reference stored in a branch record.
///
/// With bit 63 clear the value is an absolute [`NodeId`]. With bit 63 set it
/// is a relative pointer into the same changeset: bit 62 marks a leaf and
/// bits 61..0 hold a two's-complement offset.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct NodeRef(pub u64);

/// Decoded form of a [`NodeRef`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeRefKind {
    /// Reference to a node anywhere in the store.
    Id(NodeId),
    /// Reference to a node written in the same version of the same changeset.
    /// Leaves carry their 1-based file index; branches carry
    /// `child_index - parent_index`.
    Relative {
        /// Whether the target is a leaf record.
        is_leaf: bool,
        /// Signed offset as described above.
        offset: i64,
    },
}

impl NodeRef {
    /// Absolute reference to `id`.
    pub fn from_id(id: NodeId) -> NodeRef {
        NodeRef(id.0)
    }

    /// Relative reference; the offset must fit in 62 signed bits.
    pub fn relative(is_leaf: bool, offset: i64) -> Result<NodeRef> {
        if !(-MAX_RELATIVE_OFFSET..=MAX_RELATIVE_OFFSET).contains(&offset) {
            return Err(IavlError::OutOfRange("relative node offset exceeds 62 bits"));
        }
        let mut raw = RELATIVE_BIT | ((offset as u64) & OFFSET_MASK);
        if is_leaf {
            raw |= LEAF_BIT;
        }
        Ok(NodeRef(raw))
    }

    /// True when the reference is relative.
    pub fn is_relative(self) -> bool {
        self.0 & RELATIVE_BIT != 0
    }

    /// True when the target is a leaf, for either encoding.
    pub fn is_leaf(self) -> bool {
        self.0 & LEAF_BIT != 0
    }

    /// Splits the reference into its two forms.
    pub fn decode(self) -> NodeRefKind {
        if !self.is_relative() {
            return NodeRefKind::Id(NodeId(self.0));
        }
        // Sign-extend the low 62 bits.
        let offset = ((self.0 << 2) as i64) >> 2;
        NodeRefKind::Relative {
            is_leaf: self.is_leaf(),
            offset,
        }
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            NodeRefKind::Id(id) => write!(f, "NodeRef({id})"),
            NodeRefKind::Relative { is_leaf, offset } => {
                let kind = if is_leaf { "leaf" } else { "branch" };
                write!(f, "NodeRef({kind}{offset:+})")
            }
        }
    }
}
