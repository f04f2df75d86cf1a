//! Shared attribute cells and the arena that names them.
//!
//! Tasks never hold references to each other; they declare reads and writes
//! in terms of [`AttributeId`]s handed out by the [`AttributeArena`]. The
//! dependency resolver works purely on these ids, which keeps schedule
//! creation deterministic and the task graph serializable. The actual data
//! travels through [`Attr`] handles cloned into the tasks that touch them.

use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use indexmap::IndexSet;

/// Stable integer id of a named attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeId(pub u32);

/// Interns attribute names and hands out stable ids in insertion order.
#[derive(Debug, Default)]
pub struct AttributeArena {
    names: IndexSet<String>,
}

impl AttributeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id for `name`, interning it on first use.
    pub fn intern(&mut self, name: &str) -> AttributeId {
        let (idx, _) = self.names.insert_full(name.to_owned());
        AttributeId(idx as u32)
    }

    pub fn name(&self, id: AttributeId) -> Option<&str> {
        self.names.get_index(id.0 as usize).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Shared handle to the arena, passed to component constructors.
pub type ArenaRef = Arc<Mutex<AttributeArena>>;

pub fn new_arena() -> ArenaRef {
    Arc::new(Mutex::new(AttributeArena::new()))
}

/// A named, typed cell shared between tasks.
///
/// The level schedule guarantees that within one level no two tasks touch the
/// same attribute, so the inner lock is never contended during a step.
#[derive(Debug)]
pub struct Attr<T> {
    id: AttributeId,
    cell: Arc<RwLock<T>>,
}

impl<T> Clone for Attr<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> Attr<T> {
    pub fn new(arena: &ArenaRef, name: &str, value: T) -> Self {
        let id = arena.lock().unwrap().intern(name);
        Self {
            id,
            cell: Arc::new(RwLock::new(value)),
        }
    }

    pub fn id(&self) -> AttributeId {
        self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.cell.read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.cell.write().unwrap()
    }

    pub fn set(&self, value: T) {
        *self.write() = value;
    }
}

impl<T: Clone> Attr<T> {
    pub fn get(&self) -> T {
        self.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_stable() {
        let mut arena = AttributeArena::new();
        let a = arena.intern("r1.right_vector");
        let b = arena.intern("n1.v");
        let a2 = arena.intern("r1.right_vector");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(arena.name(a), Some("r1.right_vector"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn attr_shares_cell_between_clones() {
        let arena = new_arena();
        let v = Attr::new(&arena, "x", 1.0f64);
        let w = v.clone();
        w.set(2.5);
        assert_eq!(v.get(), 2.5);
        assert_eq!(v.id(), w.id());
    }
}
