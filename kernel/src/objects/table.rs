//! The object table
//!
//! A kernel-wide map from koid to object. Koids come from a monotonic
//! 64-bit counter and are never reused, so a stale koid can only ever
//! miss. Removal happens exactly once, when an object's refcount hits
//! zero; the kernel root drives the type-specific teardown.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use j6::Koid;

use super::{Body, Object};

/// First koid handed out. Koid 0 is never a valid object.
const FIRST_KOID: Koid = 1;

/// Kernel-wide object registry.
pub struct ObjectTable {
    objects: BTreeMap<Koid, Arc<Object>>,
    next_koid: Koid,
}

impl ObjectTable {
    pub const fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            next_koid: FIRST_KOID,
        }
    }

    /// Allocate a koid and register a new object.
    ///
    /// `initial_refs` seeds the refcount with the handles and internal
    /// users the caller is about to create; it must be at least 1 or
    /// the object would be destroyed before it could be referenced.
    pub fn insert(&mut self, body: Body, initial_refs: u32) -> Arc<Object> {
        debug_assert!(initial_refs >= 1);
        let koid = self.next_koid;
        self.next_koid += 1;

        let obj = Arc::new(Object::new(koid, body, initial_refs));
        self.objects.insert(koid, obj.clone());
        obj
    }

    /// Look up a live object.
    pub fn get(&self, koid: Koid) -> Option<Arc<Object>> {
        self.objects.get(&koid).cloned()
    }

    /// Remove an object from the table. The caller is the destruction
    /// path; anyone still holding an `Arc` sees the `closed` signal.
    pub fn remove(&mut self, koid: Koid) -> Option<Arc<Object>> {
        self.objects.remove(&koid)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn koids_are_never_reused() {
        let mut table = ObjectTable::new();
        let a = table.insert(Body::Event, 1);
        let first = a.koid();
        table.remove(first);

        let b = table.insert(Body::Event, 1);
        assert!(b.koid() > first);
        assert!(table.get(first).is_none());
    }

    #[test]
    fn lookup_returns_live_objects() {
        let mut table = ObjectTable::new();
        let obj = table.insert(Body::Event, 1);
        let found = table.get(obj.koid()).expect("object should be live");
        assert_eq!(found.koid(), obj.koid());
    }
}
