//! Interning chains of things linked to their parent (e.g. call stacks)
//!
//! Each interned chain link is an `(item, parent)` pair, where the parent is
//! itself a previously interned link (or nothing for a chain root). Since a
//! parent must exist before its children can be interned, parent keys are
//! always smaller than child keys and chains cannot form cycles.

use crate::InternerKey;
use ahash::RandomState;
use hashbrown::HashMap;
use std::hash::Hash;
use thiserror::Error;

/// One link of an interned chain
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Link<Item, K> {
    /// Item carried by this link
    pub item: Item,

    /// Parent link, if this is not a chain root
    pub parent: Option<K>,
}

/// Interner for chains of things
#[derive(Clone, Debug)]
pub struct ChainInterner<Item: Copy + Eq + Hash, K: InternerKey> {
    /// Links interned so far, indexed by key
    links: Vec<Link<Item, K>>,

    /// Keys of links interned so far
    keys: HashMap<Link<Item, K>, K, RandomState>,
}
//
impl<Item: Copy + Eq + Hash, K: InternerKey> ChainInterner<Item, K> {
    /// Set up a chain interner
    pub fn new() -> Self {
        Self {
            links: Vec::new(),
            keys: HashMap::with_hasher(RandomState::new()),
        }
    }

    /// Intern a chain link, panics if the parent key is unknown
    ///
    /// Providing an unknown parent is a programming error: parent keys can
    /// only come from earlier calls to this interner.
    ///
    pub fn intern(&mut self, item: Item, parent: Option<K>) -> K {
        self.try_intern(item, parent)
            .unwrap_or_else(|e| panic!("Invalid chain interning request: {e}"))
    }

    /// Intern a chain link, returning the existing key if it was seen before
    pub fn try_intern(&mut self, item: Item, parent: Option<K>) -> Result<K, ChainError> {
        if let Some(parent) = parent {
            if parent.index() >= self.links.len() {
                return Err(ChainError::UnknownParent {
                    parent: parent.index(),
                    len: self.links.len(),
                });
            }
        }
        let link = Link { item, parent };
        if let Some(key) = self.keys.get(&link) {
            return Ok(*key);
        }
        let index = self.links.len();
        let key = K::from_index(index).ok_or(ChainError::KeySpaceExhausted(index))?;
        self.links.push(link);
        self.keys.insert(link, key);
        Ok(key)
    }

    /// Key of a previously interned link, if any
    pub fn lookup(&self, item: Item, parent: Option<K>) -> Option<K> {
        self.keys.get(&Link { item, parent }).copied()
    }

    /// Retrieve a link, if the key came from this interner
    pub fn get(&self, key: K) -> Option<&Link<Item, K>> {
        self.links.get(key.index())
    }

    /// Iterate from a link to the root of its chain, starting with the link
    pub fn ancestry(&self, key: K) -> Ancestry<'_, Item, K> {
        Ancestry {
            links: &self.links,
            next: Some(key),
        }
    }

    /// Truth that no link has been interned yet
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Number of distinct links interned so far
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Finalize the collection of chains, keeping all keys valid
    pub fn finalize(self) -> InternedChains<Item, K> {
        InternedChains {
            links: self.links.into_boxed_slice(),
        }
    }
}
//
impl<Item: Copy + Eq + Hash, K: InternerKey> Default for ChainInterner<Item, K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only collection of interned chains
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InternedChains<Item, K> {
    /// Interned links, indexed by key
    links: Box<[Link<Item, K>]>,
}
//
impl<Item, K: InternerKey> InternedChains<Item, K> {
    /// Retrieve a link, if the key is valid
    pub fn get(&self, key: K) -> Option<&Link<Item, K>> {
        self.links.get(key.index())
    }

    /// Truth that a key designates a link of this collection
    pub fn contains(&self, key: K) -> bool {
        key.index() < self.links.len()
    }

    /// Iterate from a link to the root of its chain, starting with the link
    ///
    /// An invalid key yields an empty iterator.
    ///
    pub fn ancestry(&self, key: K) -> Ancestry<'_, Item, K> {
        Ancestry {
            links: &self.links,
            next: Some(key),
        }
    }

    /// Truth that there are no links
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Number of links
    pub fn len(&self) -> usize {
        self.links.len()
    }
}

/// Iterator from a chain link to its root
#[derive(Clone, Debug)]
pub struct Ancestry<'links, Item, K> {
    /// Links of the underlying interner
    links: &'links [Link<Item, K>],

    /// Next link to be yielded
    next: Option<K>,
}
//
impl<'links, Item, K: InternerKey> Iterator for Ancestry<'links, Item, K> {
    type Item = (K, &'links Link<Item, K>);

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.next?;
        let link = self.links.get(key.index())?;
        self.next = link.parent;
        Some((key, link))
    }
}

/// What can go wrong while interning a chain link
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ChainError {
    /// Parent key does not designate a previously interned link
    #[error("parent link #{parent} is unknown (only {len} links interned)")]
    UnknownParent {
        /// Index of the unknown parent
        parent: usize,

        /// Number of links interned so far
        len: usize,
    },

    /// Ran out of keys
    #[error("interning key space exhausted at link #{0}")]
    KeySpaceExhausted(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestKey;
    use more_asserts::assert_lt;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    type TestedInterner = ChainInterner<char, TestKey>;

    #[test]
    fn initial() {
        let interner = TestedInterner::new();
        assert!(interner.is_empty());
        assert_eq!(interner.len(), 0);
        assert_eq!(interner.lookup('a', None), None);
        assert!(interner.finalize().is_empty());
    }

    #[test]
    fn intern_chain() {
        let mut interner = TestedInterner::new();
        let root = interner.intern('a', None);
        let mid = interner.intern('b', Some(root));
        let leaf = interner.intern('c', Some(mid));
        let sibling = interner.intern('c', Some(root));
        assert_eq!(interner.len(), 4);
        assert_eq!(interner.intern('b', Some(root)), mid);
        assert_eq!(interner.lookup('c', Some(root)), Some(sibling));
        assert_eq!(interner.len(), 4);

        let chains = interner.finalize();
        let items = chains
            .ancestry(leaf)
            .map(|(_, link)| link.item)
            .collect::<String>();
        assert_eq!(items, "cba");
        assert_eq!(
            chains.get(sibling),
            Some(&Link {
                item: 'c',
                parent: Some(root)
            })
        );
        assert!(chains.contains(leaf));
    }

    #[test]
    fn unknown_parent() {
        let mut interner = TestedInterner::new();
        let root = interner.intern('a', None);
        let bad_parent = TestKey::from_index(root.index() + 1).unwrap();
        assert_eq!(
            interner.try_intern('b', Some(bad_parent)),
            Err(ChainError::UnknownParent { parent: 1, len: 1 })
        );
        assert_eq!(interner.len(), 1);

        let chains = interner.finalize();
        assert!(!chains.contains(bad_parent));
        assert_eq!(chains.ancestry(bad_parent).count(), 0);
    }

    #[test]
    #[should_panic]
    fn unknown_parent_panics() {
        let mut interner = TestedInterner::new();
        interner.intern('a', TestKey::from_index(0));
    }

    proptest! {
        #[test]
        fn idempotence_and_well_foundedness(
            requests in prop::collection::vec(
                (prop::char::range('a', 'd'), any::<prop::sample::Index>(), any::<bool>()),
                1..64
            )
        ) {
            let mut interner = TestedInterner::new();
            let mut keys = Vec::new();
            for (item, parent_idx, is_root) in requests {
                let parent = (!is_root && !keys.is_empty()).then(|| *parent_idx.get(&keys));
                let key = interner.intern(item, parent);
                prop_assert_eq!(interner.intern(item, parent), key);
                if let Some(parent) = parent {
                    assert_lt!(parent.index(), key.index());
                }
                keys.push(key);
            }
            let len = interner.len();
            let chains = interner.finalize();
            for key in keys {
                prop_assert!(chains.ancestry(key).count() <= len);
            }
        }
    }
}
