//! Arena-style registries keyed by stable typed ids.
//!
//! A registry owns one `Arc` per entry. Lookups hand out clones, so a caller
//! holding an object past its deletion keeps it alive until the last clone
//! drops; the native release still happens exactly once.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::runtime::opencl::{Kernel, MemoryObject, Program};

/// Stable handle to an entry of a [`Registry`].
///
/// Ids are never reused within one registry.
pub struct Id<T: ?Sized> {
    index: u64,
    _marker: PhantomData<fn() -> Box<T>>,
}

impl<T: ?Sized> Id<T> {
    fn new(index: u64) -> Self {
        Id {
            index,
            _marker: PhantomData,
        }
    }

    /// Returns the raw index.
    pub fn index(&self) -> u64 {
        self.index
    }
}

impl<T: ?Sized> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for Id<T> {}

impl<T: ?Sized> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T: ?Sized> Eq for Id<T> {}

impl<T: ?Sized> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: ?Sized> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T: ?Sized> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T: ?Sized> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.index)
    }
}

impl<T: ?Sized> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

pub type ProgramId = Id<Program>;
pub type KernelId = Id<Kernel>;
pub type MemId = Id<dyn MemoryObject>;

/// Insertion-ordered collection of shared objects behind one lock.
pub struct Registry<T: ?Sized> {
    entries: RwLock<BTreeMap<u64, Arc<T>>>,
    next_id: AtomicU64,
}

impl<T: ?Sized> Registry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Registry {
            entries: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Stores an object and returns its id.
    pub fn insert(&self, value: Arc<T>) -> Id<T> {
        let index = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.write().insert(index, value);
        Id::new(index)
    }

    /// Looks up an object.
    pub fn get(&self, id: Id<T>) -> Option<Arc<T>> {
        self.read().get(&id.index).cloned()
    }

    /// Returns true if the id is registered.
    pub fn contains(&self, id: Id<T>) -> bool {
        self.read().contains_key(&id.index)
    }

    /// Removes an object, handing back the registry's reference.
    pub fn remove(&self, id: Id<T>) -> Option<Arc<T>> {
        self.write().remove(&id.index)
    }

    /// Removes every object, oldest first.
    pub fn drain(&self) -> Vec<Arc<T>> {
        std::mem::take(&mut *self.write()).into_values().collect()
    }

    /// Returns the registered ids in insertion order.
    pub fn ids(&self) -> Vec<Id<T>> {
        self.read().keys().map(|&index| Id::new(index)).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // Poisoning is ignored, the map is never left half-updated.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<u64, Arc<T>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<u64, Arc<T>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
