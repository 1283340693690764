//! Interning names

use crate::InternerKey;
use ahash::RandomState;
use lasso::{Key, Rodeo, RodeoReader, Spur};
use std::{
    fmt::{self, Debug, Formatter},
    marker::PhantomData,
};

/// Interner for names
///
/// Each distinct name gets a dense key, allocated in increasing order as new
/// names are seen. Keys are never reused and stay valid for the lifetime of
/// the interner and of the [`InternedNames`] it is finalized into.
///
pub struct NameInterner<K: InternerKey> {
    /// Names interned so far
    names: Rodeo<Spur, RandomState>,

    /// Keys handed out to the user
    keys: PhantomData<K>,
}
//
impl<K: InternerKey> NameInterner<K> {
    /// Set up a name interner
    pub fn new() -> Self {
        Self {
            names: Rodeo::with_hasher(RandomState::new()),
            keys: PhantomData,
        }
    }

    /// Intern a name, returning the existing key if it was seen before
    pub fn intern(&mut self, name: &str) -> K {
        from_spur(self.names.get_or_intern(name))
    }

    /// Key of a previously interned name, if any
    pub fn lookup(&self, name: &str) -> Option<K> {
        self.names.get(name).map(from_spur)
    }

    /// Retrieve a name, panics if the key did not come from this interner
    pub fn resolve(&self, key: K) -> &str {
        self.try_resolve(key)
            .unwrap_or_else(|| panic!("Key {key:?} does not come from this interner"))
    }

    /// Retrieve a name, if the key came from this interner
    pub fn try_resolve(&self, key: K) -> Option<&str> {
        self.names.try_resolve(&to_spur(key)?)
    }

    /// Truth that no name has been interned yet
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Number of distinct names interned so far
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Finalize the set of names, keeping all keys valid
    pub fn finalize(self) -> InternedNames<K> {
        InternedNames {
            names: self.names.into_reader(),
            keys: PhantomData,
        }
    }
}
//
impl<K: InternerKey> Default for NameInterner<K> {
    fn default() -> Self {
        Self::new()
    }
}
//
impl<K: InternerKey> Debug for NameInterner<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("NameInterner")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Read-only collection of interned names
pub struct InternedNames<K: InternerKey> {
    /// Interned names
    names: RodeoReader<Spur, RandomState>,

    /// Keys handed out to the user
    keys: PhantomData<K>,
}
//
impl<K: InternerKey> InternedNames<K> {
    /// Key of an interned name, if any
    pub fn lookup(&self, name: &str) -> Option<K> {
        self.names.get(name).map(from_spur)
    }

    /// Retrieve a name, panics if the key is invalid
    pub fn resolve(&self, key: K) -> &str {
        self.try_resolve(key)
            .unwrap_or_else(|| panic!("Key {key:?} does not come from this interner"))
    }

    /// Retrieve a name, if the key is valid
    pub fn try_resolve(&self, key: K) -> Option<&str> {
        self.names.try_resolve(&to_spur(key)?)
    }

    /// Truth that there are no names
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Number of distinct names
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Iterate over (key, name) pairs in key order
    pub fn iter(&self) -> impl Iterator<Item = (K, &str)> + '_ {
        self.names.iter().map(|(spur, name)| (from_spur(spur), name))
    }
}
//
impl<K: InternerKey> Debug for InternedNames<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("InternedNames")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Translate a lasso key into a user key
///
/// Both are dense 32-bit indices, and lasso runs out of keys first.
///
fn from_spur<K: InternerKey>(spur: Spur) -> K {
    let index = spur.into_usize();
    K::from_index(index).unwrap_or_else(|| panic!("Name #{index} does not fit in the key type"))
}

/// Translate a user key into a lasso key, if it is in lasso's range
fn to_spur(key: impl InternerKey) -> Option<Spur> {
    Spur::try_from_usize(key.index())
}
