//! Per-process handle tables
//!
//! A handle names an object from inside one process: the low 32 bits
//! of the handle are an index into that process's table, the high 32
//! bits echo the capability mask granted at creation. The table entry
//! is authoritative for both the target koid and the mask; the echoed
//! mask in the handle value is a convenience for user space.
//!
//! Transfers between tables are two-phase: reserve a slot in the
//! destination, then remove from the source, so a failure on either
//! side leaves both tables unchanged.

use hashbrown::HashMap;

use j6::caps::Caps;
use j6::{handle_from_parts, handle_index, Handle, HandleDescriptor, Koid, ObjectType, Status};

use crate::config::{FIRST_HANDLE_INDEX, HANDLE_TABLE_INITIAL};

/// One handle-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleEntry {
    pub koid: Koid,
    pub object_type: ObjectType,
    pub caps: Caps,
}

/// A slot reserved for the second phase of a transfer.
#[derive(Debug, Clone, Copy)]
pub struct Reservation(u32);

impl Reservation {
    #[inline]
    pub fn index(&self) -> u32 {
        self.0
    }
}

/// A process's handle table: a resizable hashed array keyed by the
/// 32-bit table index.
pub struct HandleTable {
    entries: HashMap<u32, HandleEntry>,
    next_index: u32,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::with_capacity(HANDLE_TABLE_INITIAL),
            next_index: FIRST_HANDLE_INDEX,
        }
    }

    fn take_index(&mut self) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    /// Add an entry, returning the new handle value.
    pub fn insert(&mut self, koid: Koid, object_type: ObjectType, caps: Caps) -> Handle {
        let index = self.take_index();
        self.entries.insert(
            index,
            HandleEntry {
                koid,
                object_type,
                caps,
            },
        );
        handle_from_parts(index, caps.bits())
    }

    /// Look up the entry a handle names.
    pub fn get(&self, handle: Handle) -> Option<&HandleEntry> {
        self.entries.get(&handle_index(handle))
    }

    /// Remove the entry a handle names. The caller owns dropping the
    /// object reference the entry carried.
    pub fn remove(&mut self, handle: Handle) -> Option<HandleEntry> {
        self.entries.remove(&handle_index(handle))
    }

    /// Resolve a handle for an operation: the entry must exist, match
    /// the expected type, and grant all of `required`.
    ///
    /// A missing or wrong-typed handle is `invalid_arg`; a live entry
    /// without the required capability is `denied`.
    pub fn resolve(
        &self,
        handle: Handle,
        expected: ObjectType,
        required: Caps,
    ) -> Result<&HandleEntry, Status> {
        let entry = self.get(handle).ok_or(Status::InvalidArg)?;
        if entry.object_type != expected {
            return Err(Status::InvalidArg);
        }
        if !entry.caps.grants(required) {
            return Err(Status::Denied);
        }
        Ok(entry)
    }

    /// Phase one of a transfer: claim a destination slot without
    /// making it visible.
    pub fn reserve(&mut self) -> Reservation {
        Reservation(self.take_index())
    }

    /// Phase two: fill a reserved slot, returning the handle value.
    pub fn fill_reservation(&mut self, slot: Reservation, entry: HandleEntry) -> Handle {
        let caps = entry.caps;
        self.entries.insert(slot.0, entry);
        handle_from_parts(slot.0, caps.bits())
    }

    /// Abandon a reservation. The index is simply never used; indices
    /// are not recycled.
    pub fn release_reservation(&mut self, _slot: Reservation) {}

    /// Remove every entry, returning them so the caller can drop the
    /// object references. Used on process destruction.
    pub fn drain(&mut self) -> impl Iterator<Item = HandleEntry> + '_ {
        self.entries.drain().map(|(_, e)| e)
    }

    /// Describe every handle, for `handle_list`.
    pub fn descriptors(&self) -> impl Iterator<Item = HandleDescriptor> + '_ {
        self.entries.iter().map(|(&index, e)| HandleDescriptor {
            handle: handle_from_parts(index, e.caps.bits()),
            caps: e.caps.bits(),
            object_type: e.object_type,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_resolve() {
        let mut table = HandleTable::new();
        let h = table.insert(42, ObjectType::Mailbox, Caps::MAILBOX_CALL | Caps::CLONE);

        let entry = table
            .resolve(h, ObjectType::Mailbox, Caps::MAILBOX_CALL)
            .unwrap();
        assert_eq!(entry.koid, 42);
    }

    #[test]
    fn wrong_type_is_invalid_arg() {
        let mut table = HandleTable::new();
        let h = table.insert(42, ObjectType::Mailbox, Caps::all());
        assert_eq!(
            table.resolve(h, ObjectType::Vma, Caps::VMA_MAP).unwrap_err(),
            Status::InvalidArg
        );
    }

    #[test]
    fn missing_cap_is_denied() {
        let mut table = HandleTable::new();
        let h = table.insert(42, ObjectType::Mailbox, Caps::MAILBOX_CALL);
        assert_eq!(
            table
                .resolve(h, ObjectType::Mailbox, Caps::MAILBOX_RESPOND)
                .unwrap_err(),
            Status::Denied
        );
    }

    #[test]
    fn unknown_index_is_invalid_arg() {
        let table = HandleTable::new();
        assert_eq!(
            table
                .resolve(handle_from_parts(99, 0), ObjectType::Event, Caps::empty())
                .unwrap_err(),
            Status::InvalidArg
        );
    }

    #[test]
    fn handle_echoes_caps_in_high_bits() {
        let mut table = HandleTable::new();
        let caps = Caps::VMA_MAP | Caps::VMA_RESIZE;
        let h = table.insert(7, ObjectType::Vma, caps);
        assert_eq!(j6::handle_caps(h), caps.bits());
    }

    #[test]
    fn two_phase_transfer_between_tables() {
        let mut src = HandleTable::new();
        let mut dst = HandleTable::new();

        let h = src.insert(9, ObjectType::Event, Caps::SIGNAL);

        // Reserve in the destination, then remove from the source
        let slot = dst.reserve();
        let entry = src.remove(h).expect("source entry exists");
        let h2 = dst.fill_reservation(slot, entry);

        assert!(src.get(h).is_none());
        assert_eq!(dst.get(h2).unwrap().koid, 9);
        assert_eq!(dst.get(h2).unwrap().caps, Caps::SIGNAL);
    }

    #[test]
    fn indices_are_not_recycled() {
        let mut table = HandleTable::new();
        let h1 = table.insert(1, ObjectType::Event, Caps::empty());
        table.remove(h1);
        let h2 = table.insert(2, ObjectType::Event, Caps::empty());
        assert_ne!(j6::handle_index(h1), j6::handle_index(h2));
    }
}
