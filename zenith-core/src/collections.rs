//! Collection aliases used throughout the workspace.
//!
//! Maps and sets are `hashbrown` containers keyed with `foldhash`, construct them with
//! `default()` rather than `new()`.

pub use smallvec::{smallvec, SmallVec};

pub type DefaultHasher = foldhash::fast::RandomState;

pub mod hashmap {
    pub use hashbrown::hash_map::Entry;

    pub type HashMap<K, V> = hashbrown::HashMap<K, V, super::DefaultHasher>;
}

pub mod hashset {
    pub type HashSet<K> = hashbrown::HashSet<K, super::DefaultHasher>;
}
