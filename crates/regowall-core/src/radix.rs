//! Persistent radix tree over byte keys.
//!
//! Nodes are immutable once shared and live behind `Arc`. An insert copies
//! only the nodes on the path from the root to the changed node and returns a
//! new tree; every older tree keeps pointing at its own root and stays valid.
//! Readers therefore never need a lock, even while another thread builds a
//! newer version.
//!
//! Invariants:
//! - every child edge label (`prefix`) is non-empty;
//! - siblings are sorted by the first byte of their label and no two siblings
//!   share a first byte.

use std::fmt;
use std::sync::Arc;

struct Node<V> {
    prefix: Box<[u8]>,
    value: Option<V>,
    children: Vec<Arc<Node<V>>>,
}

impl<V: Clone> Node<V> {
    fn empty() -> Self {
        Self {
            prefix: Box::default(),
            value: None,
            children: Vec::new(),
        }
    }

    fn leaf(prefix: &[u8], value: V) -> Self {
        Self {
            prefix: prefix.into(),
            value: Some(value),
            children: Vec::new(),
        }
    }

    /// Copy of this node sharing all children.
    fn path_copy(&self) -> Self {
        Self {
            prefix: self.prefix.clone(),
            value: self.value.clone(),
            children: self.children.clone(),
        }
    }

    fn child_index(&self, first: u8) -> Result<usize, usize> {
        self.children
            .binary_search_by(|c| c.prefix.first().copied().cmp(&Some(first)))
    }
}

/// Persistent map from byte strings to `V`.
pub struct RadixTree<V> {
    root: Arc<Node<V>>,
    len: usize,
}

impl<V> Clone for RadixTree<V> {
    fn clone(&self) -> Self {
        Self {
            root: Arc::clone(&self.root),
            len: self.len,
        }
    }
}

impl<V: Clone> Default for RadixTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + fmt::Debug> fmt::Debug for RadixTree<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in self.entries() {
            map.entry(&String::from_utf8_lossy(&k), v);
        }
        map.finish()
    }
}

impl<V: Clone> RadixTree<V> {
    pub fn new() -> Self {
        Self {
            root: Arc::new(Node::empty()),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert `key`, returning the new tree and the value it replaced.
    /// `self` is left untouched.
    pub fn insert(&self, key: &[u8], value: V) -> (Self, Option<V>) {
        let (root, previous) = insert_at(&self.root, key, value);
        let len = if previous.is_some() { self.len } else { self.len + 1 };
        (
            Self {
                root: Arc::new(root),
                len,
            },
            previous,
        )
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        let mut node: &Node<V> = &self.root;
        let mut rest = key;
        loop {
            let Some(&first) = rest.first() else {
                return node.value.as_ref();
            };
            let pos = node.child_index(first).ok()?;
            let child = node.children.get(pos)?;
            rest = rest.strip_prefix(&child.prefix[..])?;
            node = child.as_ref();
        }
    }

    /// All entries in ascending key order.
    pub fn entries(&self) -> Vec<(Vec<u8>, &V)> {
        let mut out = Vec::with_capacity(self.len);
        let mut key = Vec::new();
        collect(&self.root, &mut key, &mut out);
        out
    }
}

fn insert_at<V: Clone>(node: &Node<V>, key: &[u8], value: V) -> (Node<V>, Option<V>) {
    let mut copy = node.path_copy();

    let Some(&first) = key.first() else {
        let previous = copy.value.replace(value);
        return (copy, previous);
    };

    let pos = match copy.child_index(first) {
        Ok(pos) => pos,
        Err(pos) => {
            copy.children.insert(pos, Arc::new(Node::leaf(key, value)));
            return (copy, None);
        }
    };

    let child = Arc::clone(&copy.children[pos]);
    let common = common_prefix_len(&child.prefix, key);

    if common == child.prefix.len() {
        let (updated, previous) = insert_at(&child, &key[common..], value);
        copy.children[pos] = Arc::new(updated);
        return (copy, previous);
    }

    // The key diverges inside the child's edge: split it at `common`.
    let mut lower = child.path_copy();
    lower.prefix = child.prefix[common..].into();

    let mut split = Node {
        prefix: child.prefix[..common].into(),
        value: None,
        children: vec![Arc::new(lower)],
    };

    let rest = &key[common..];
    match rest.first() {
        None => split.value = Some(value),
        Some(&b) => {
            let at = split.child_index(b).unwrap_or_else(|at| at);
            split.children.insert(at, Arc::new(Node::leaf(rest, value)));
        }
    }

    copy.children[pos] = Arc::new(split);
    (copy, None)
}

fn collect<'a, V>(node: &'a Node<V>, key: &mut Vec<u8>, out: &mut Vec<(Vec<u8>, &'a V)>) {
    let mark = key.len();
    key.extend_from_slice(&node.prefix);
    if let Some(v) = &node.value {
        out.push((key.clone(), v));
    }
    for child in &node.children {
        collect(child, key, out);
    }
    key.truncate(mark);
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn keys(tree: &RadixTree<u32>) -> Vec<String> {
        tree.entries()
            .into_iter()
            .map(|(k, _)| String::from_utf8(k).unwrap())
            .collect()
    }

    #[test]
    fn split_extend_and_prefix_keys() {
        let t = RadixTree::new();
        let (t, _) = t.insert(b"1.2.3.4", 1);
        let (t, _) = t.insert(b"1.2.3.40", 2);
        let (t, _) = t.insert(b"1.2.3.5", 3);
        let (t, _) = t.insert(b"1.2", 4);
        let (t, _) = t.insert(b"10.0.0.1", 5);

        assert_eq!(t.len(), 5);
        assert_eq!(t.get(b"1.2.3.4"), Some(&1));
        assert_eq!(t.get(b"1.2.3.40"), Some(&2));
        assert_eq!(t.get(b"1.2.3.5"), Some(&3));
        assert_eq!(t.get(b"1.2"), Some(&4));
        assert_eq!(t.get(b"10.0.0.1"), Some(&5));
        assert_eq!(t.get(b"1.2.3"), None);
        assert_eq!(t.get(b"1.2.3.44"), None);
        assert_eq!(t.get(b""), None);

        assert_eq!(
            keys(&t),
            vec!["1.2", "1.2.3.4", "1.2.3.40", "1.2.3.5", "10.0.0.1"]
        );
    }

    #[test]
    fn overwrite_returns_previous_and_keeps_len() {
        let (t, prev) = RadixTree::new().insert(b"a", 1);
        assert!(prev.is_none());
        let (t2, prev) = t.insert(b"a", 2);
        assert_eq!(prev, Some(1));
        assert_eq!(t2.len(), 1);
        assert_eq!(t2.get(b"a"), Some(&2));
    }

    #[test]
    fn older_versions_are_untouched() {
        let (v1, _) = RadixTree::new().insert(b"abc", 1);
        let (v2, _) = v1.insert(b"abd", 2);
        let (v3, _) = v2.insert(b"abc", 3);

        assert_eq!(v1.get(b"abc"), Some(&1));
        assert_eq!(v1.get(b"abd"), None);
        assert_eq!(v2.get(b"abc"), Some(&1));
        assert_eq!(v2.get(b"abd"), Some(&2));
        assert_eq!(v3.get(b"abc"), Some(&3));
        assert_eq!((v1.len(), v2.len(), v3.len()), (1, 2, 2));
    }

    #[test]
    fn empty_key_lives_on_root() {
        let (t, _) = RadixTree::new().insert(b"", 7);
        assert_eq!(t.get(b""), Some(&7));
        assert_eq!(keys(&t), vec![""]);
    }
}
