//! Process objects
//!
//! A process owns a handle table, the kernel's record of its page
//! tables, the set of VMAs mapped into it, and its threads. The last
//! thread's exit destroys the process: every handle in the table is
//! closed and every VMA unmapped.

use alloc::vec::Vec;

use j6::{Handle, Koid};

use super::handles::HandleTable;
use crate::arch::PageTables;
use crate::memory::PhysAddr;

/// A process: an address space plus a capability namespace.
pub struct Process {
    /// This process's handle table
    pub handles: HandleTable,

    /// Kernel view of the process's page tables
    pub page_tables: PageTables,

    /// VMAs currently mapped into this process
    vmas: Vec<Koid>,

    /// Threads belonging to this process
    threads: Vec<Koid>,

    /// Set once by exit or kill
    exit_status: Option<u64>,

    /// Bump pointer for "choose an address for me" mappings
    pub next_map_addr: u64,

    /// I/O privilege level, raised through the system object
    pub iopl: u8,

    /// Well-known handles passed at creation
    pub self_handle: Handle,
    pub system_handle: Handle,
}

impl Process {
    pub fn new(table_root: PhysAddr) -> Self {
        Self {
            handles: HandleTable::new(),
            page_tables: PageTables::new(table_root),
            vmas: Vec::new(),
            threads: Vec::new(),
            exit_status: None,
            next_map_addr: crate::config::VMA_AREA_BASE,
            iopl: 0,
            self_handle: j6::HANDLE_INVALID,
            system_handle: j6::HANDLE_INVALID,
        }
    }

    /// Record a VMA as mapped into this process.
    pub fn add_vma(&mut self, vma: Koid) {
        if !self.vmas.contains(&vma) {
            self.vmas.push(vma);
        }
    }

    /// Forget a VMA mapping record.
    pub fn remove_vma(&mut self, vma: Koid) -> bool {
        if let Some(pos) = self.vmas.iter().position(|&v| v == vma) {
            self.vmas.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn vmas(&self) -> &[Koid] {
        &self.vmas
    }

    /// Take the VMA list for teardown.
    pub fn take_vmas(&mut self) -> Vec<Koid> {
        core::mem::take(&mut self.vmas)
    }

    pub fn add_thread(&mut self, thread: Koid) {
        self.threads.push(thread);
    }

    /// Remove an exited thread. Returns true when this was the last
    /// one and the process must be destroyed.
    pub fn remove_thread(&mut self, thread: Koid) -> bool {
        if let Some(pos) = self.threads.iter().position(|&t| t == thread) {
            self.threads.remove(pos);
        }
        self.threads.is_empty()
    }

    pub fn threads(&self) -> &[Koid] {
        &self.threads
    }

    #[inline]
    pub fn exit_status(&self) -> Option<u64> {
        self.exit_status
    }

    /// Record the exit status. The first writer wins; a kill racing an
    /// exit keeps the original status.
    pub fn set_exit_status(&mut self, status: u64) {
        if self.exit_status.is_none() {
            self.exit_status = Some(status);
        }
    }

    #[inline]
    pub fn is_exiting(&self) -> bool {
        self.exit_status.is_some()
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("handles", &self.handles.len())
            .field("vmas", &self.vmas.len())
            .field("threads", &self.threads.len())
            .field("exit_status", &self.exit_status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_thread_removal_reports_empty() {
        let mut p = Process::new(PhysAddr::new(0x1000));
        p.add_thread(10);
        p.add_thread(11);
        assert!(!p.remove_thread(10));
        assert!(p.remove_thread(11));
    }

    #[test]
    fn first_exit_status_wins() {
        let mut p = Process::new(PhysAddr::new(0x1000));
        p.set_exit_status(3);
        p.set_exit_status(7);
        assert_eq!(p.exit_status(), Some(3));
    }
}
