//! In-order iteration over a key range.

use bytes::Bytes;

use super::node::Node;
use crate::types::Result;

/// Iterator over the leaves of a tree whose keys fall in `[start, end)`.
///
/// Subtrees entirely outside the range are never resolved, so iterating a
/// narrow range of an evicted tree only touches the nodes on its path.
pub struct TreeIter {
    start: Option<Bytes>,
    end: Option<Bytes>,
    ascending: bool,
    stack: Vec<Node>,
}

impl TreeIter {
    pub(crate) fn new(root: Option<Node>, start: Option<Bytes>, end: Option<Bytes>, ascending: bool) -> Self {
        Self {
            start,
            end,
            ascending,
            stack: root.into_iter().collect(),
        }
    }

    fn in_range(&self, key: &[u8]) -> bool {
        self.start.as_deref().map_or(true, |start| key >= start)
            && self.end.as_deref().map_or(true, |end| key < end)
    }

    fn next_entry(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        while let Some(node) = self.stack.pop() {
            if node.is_leaf() {
                let (key, value) = node.key_value()?;
                if self.in_range(&key) {
                    return Ok(Some((key, value)));
                }
                continue;
            }
            let pivot = node.key()?;
            // Left holds keys below the pivot, right holds the pivot and above.
            let want_left = self.start.as_deref().map_or(true, |start| start < &pivot[..]);
            let want_right = self.end.as_deref().map_or(true, |end| &pivot[..] < end);
            let left = if want_left { Some(node.left()?.resolve()?) } else { None };
            let right = if want_right { Some(node.right()?.resolve()?) } else { None };
            // The side visited first is pushed last.
            let (first, second) = if self.ascending { (left, right) } else { (right, left) };
            self.stack.extend(second);
            self.stack.extend(first);
        }
        Ok(None)
    }
}

impl Iterator for TreeIter {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(entry) => entry.map(Ok),
            Err(err) => {
                self.stack.clear();
                Some(Err(err))
            }
        }
    }
}
