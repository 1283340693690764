//! Tools for interning more than just strings

#![deny(missing_docs)]

pub mod chain;
pub mod name;

use std::{fmt::Debug, hash::Hash};

/// Re-export used crates to avoid duplicate dependencies
pub use lasso;

/// Key that identifies an interned entity by a dense index
///
/// Keys are allocated in increasing order starting from 0, so they can also
/// be used to index side tables that are built alongside an interner.
///
pub trait InternerKey: Copy + Debug + Eq + Hash {
    /// Build a key from its index, if it fits in the key type
    fn from_index(index: usize) -> Option<Self>;

    /// Index of this key
    fn index(self) -> usize;
}

/// Define a 32-bit interning key type
///
/// The resulting type implements [`InternerKey`], so it can be used both with
/// [`name::NameInterner`] and with [`chain::ChainInterner`].
///
#[macro_export]
macro_rules! interner_key {
    ($(#[$attr:meta])* $vis:vis struct $name:ident;) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
        $vis struct $name(u32);
        //
        impl $name {
            /// Dense index of this key, starting at 0
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
        //
        impl $crate::InternerKey for $name {
            fn from_index(index: usize) -> Option<Self> {
                u32::try_from(index).ok().map(Self)
            }

            fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    interner_key! {
        /// Key type used throughout the asylum tests
        pub struct TestKey;
    }

    #[test]
    fn key_roundtrip() {
        for index in [0, 1, 42, u32::MAX as usize] {
            let key = TestKey::from_index(index).expect("Index should fit");
            assert_eq!(InternerKey::index(key), index);
            assert_eq!(key.index(), index);
        }
        assert_eq!(TestKey::from_index(u32::MAX as usize + 1), None);
    }
}
