//! Stable arena identifiers.
//!
//! Every entity lives in an [`Arena`] slot addressed by a typed id. Slots are
//! never reused, so an id held by a reverse index either resolves to the same
//! entity or to nothing.

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

/// Conversion between a typed id and its arena slot index.
pub trait ArenaId: Copy + Eq + std::hash::Hash + fmt::Debug {
    fn from_index(index: usize) -> Self;
    fn index(self) -> usize;
}

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u32);

        impl $name {
            #[inline]
            #[must_use]
            pub const fn raw(self) -> u32 {
                self.0
            }
        }

        impl ArenaId for $name {
            #[inline]
            fn from_index(index: usize) -> Self {
                Self(u32::try_from(index).unwrap_or(u32::MAX))
            }

            #[inline]
            fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

arena_id!(
    /// Identifies a [`crate::Dataset`].
    DatasetId
);
arena_id!(
    /// Identifies a [`crate::Block`].
    BlockId
);
arena_id!(
    /// Identifies a [`crate::Site`].
    SiteId
);
arena_id!(
    /// Identifies a [`crate::Group`]. Slot 0 is always the null group.
    GroupId
);
arena_id!(
    /// Identifies a linked [`crate::DatasetReplica`].
    DatasetReplicaId
);
arena_id!(
    /// Identifies a linked [`crate::BlockReplica`].
    BlockReplicaId
);
arena_id!(
    /// Identifies a [`crate::Partition`].
    PartitionId
);

impl GroupId {
    /// The universal "unowned" group.
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

/// Append-only slot storage with tombstones.
#[derive(Debug, Clone)]
pub struct Arena<I, T> {
    slots: Vec<Option<T>>,
    live: usize,
    _id: PhantomData<I>,
}

impl<I: ArenaId, T> Arena<I, T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            live: 0,
            _id: PhantomData,
        }
    }

    /// Store a value and return its new id.
    pub fn insert(&mut self, value: T) -> I {
        let id = I::from_index(self.slots.len());
        self.slots.push(Some(value));
        self.live += 1;
        id
    }

    #[inline]
    pub fn get(&self, id: I) -> Option<&T> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    #[inline]
    pub fn get_mut(&mut self, id: I) -> Option<&mut T> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Replace the value in a live slot, returning the previous value.
    pub fn replace(&mut self, id: I, value: T) -> Option<T> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.is_none() {
            return None;
        }
        slot.replace(value)
    }

    /// Tombstone a slot.
    pub fn remove(&mut self, id: I) -> Option<T> {
        let taken = self.slots.get_mut(id.index()).and_then(Option::take);
        if taken.is_some() {
            self.live -= 1;
        }
        taken
    }

    #[inline]
    pub fn contains(&self, id: I) -> bool {
        self.get(id).is_some()
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Live entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = (I, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|value| (I::from_index(idx), value)))
    }

    /// Ids of live entries in id order.
    pub fn ids(&self) -> impl Iterator<Item = I> + '_ {
        self.iter().map(|(id, _)| id)
    }
}

impl<I: ArenaId, T> Default for Arena<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_slots_are_not_reused() {
        let mut arena: Arena<SiteId, &str> = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.len(), 2);

        assert_eq!(arena.remove(a), Some("a"));
        assert!(arena.get(a).is_none());
        assert_eq!(arena.len(), 1);

        let c = arena.insert("c");
        assert_ne!(c, a);
        assert_eq!(arena.ids().collect::<Vec<_>>(), vec![b, c]);
    }

    #[test]
    fn test_arena_replace_requires_live_slot() {
        let mut arena: Arena<BlockReplicaId, u32> = Arena::new();
        let id = arena.insert(1);
        assert_eq!(arena.replace(id, 2), Some(1));
        assert_eq!(arena.get(id), Some(&2));
        arena.remove(id);
        assert_eq!(arena.replace(id, 3), None);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_null_group() {
        assert!(GroupId::NULL.is_null());
        assert!(!GroupId::from_index(3).is_null());
        assert_eq!(GroupId::NULL.to_string(), "GroupId#0");
    }
}
