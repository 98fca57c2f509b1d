//! Kernel object model
//!
//! Every addressable kernel resource is an object: a common header
//! (koid, type tag, reference count, signal word, waiters) followed by
//! a tagged variant body. Access from user space is only ever through
//! a handle, and a handle's capability mask gates every operation.
//!
//! ## Ownership
//!
//! The object table holds the authoritative reference to each object.
//! The header's refcount counts handles plus declared internal users
//! (a process's threads, an IRQ's mailbox binding); when it reaches
//! zero the kernel removes the table entry, raises the `closed`
//! signal, and wakes every waiter. Handles count objects; objects
//! never point back at handle-table entries, so there are no cycles to
//! collect.

pub mod channel;
pub mod handles;
pub mod irq;
pub mod mailbox;
pub mod process;
pub mod table;
pub mod thread;
pub mod vma;

pub use channel::ChannelEnd;
pub use handles::{HandleEntry, HandleTable};
pub use irq::IrqBinding;
pub use mailbox::{Delivered, InService, Mailbox, Message, ParkedResponder, PendingCall};
pub use process::Process;
pub use table::ObjectTable;
pub use thread::{BlockReason, MailboxRole, Thread, ThreadState, WaitDescriptor};
pub use vma::{Vma, VmaBacking, VmaFlags};

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use alloc::vec::Vec;
use spin::Mutex;

use j6::{signals, Koid, ObjectType};

/// A thread parked on an object's signal word.
#[derive(Debug, Clone, Copy)]
pub struct Waiter {
    pub thread: Koid,
    pub mask: u64,
}

/// Common header embedded at the start of every object.
pub struct Header {
    koid: Koid,
    otype: ObjectType,

    /// Live references: handles plus internal users
    refs: AtomicU32,

    /// The object's 64-bit signal word
    signals: AtomicU64,

    /// Threads blocked in `object_wait` on this object
    waiters: Mutex<Vec<Waiter>>,
}

impl Header {
    fn new(koid: Koid, otype: ObjectType, initial_refs: u32) -> Self {
        Self {
            koid,
            otype,
            refs: AtomicU32::new(initial_refs),
            signals: AtomicU64::new(0),
            waiters: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn koid(&self) -> Koid {
        self.koid
    }

    #[inline]
    pub fn object_type(&self) -> ObjectType {
        self.otype
    }

    #[inline]
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Add a reference (a new handle or internal user).
    #[inline]
    pub fn retain(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference. Returns true when this was the last one and
    /// the caller must destroy the object.
    #[inline]
    #[must_use]
    pub fn release(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// The current signal word.
    #[inline]
    pub fn signals(&self) -> u64 {
        self.signals.load(Ordering::Acquire)
    }

    /// OR bits into the signal word, removing and returning the
    /// waiters whose masks intersect the updated word. The caller owns
    /// waking them.
    pub fn assert_signals(&self, bits: u64) -> Vec<Waiter> {
        let old = self.signals.fetch_or(bits, Ordering::AcqRel);
        let word = old | bits;

        let mut woken = Vec::new();
        let mut waiters = self.waiters.lock();
        let mut i = 0;
        while i < waiters.len() {
            if waiters[i].mask & word != 0 {
                woken.push(waiters.remove(i));
            } else {
                i += 1;
            }
        }
        woken
    }

    /// AND the complement: clear signal bits.
    #[inline]
    pub fn clear_signals(&self, bits: u64) {
        self.signals.fetch_and(!bits, Ordering::AcqRel);
    }

    /// True once the object has been destroyed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.signals() & signals::CLOSED != 0
    }

    /// Park a waiter. The caller has already checked the current word
    /// under its own logic and chosen to block.
    pub fn add_waiter(&self, thread: Koid, mask: u64) {
        self.waiters.lock().push(Waiter { thread, mask });
    }

    /// Remove a parked waiter (timeout or kill). Returns true if the
    /// thread was found on this queue.
    pub fn remove_waiter(&self, thread: Koid) -> bool {
        let mut waiters = self.waiters.lock();
        if let Some(pos) = waiters.iter().position(|w| w.thread == thread) {
            waiters.remove(pos);
            true
        } else {
            false
        }
    }

    /// Remove and return every waiter; used on destruction.
    pub fn drain_waiters(&self) -> Vec<Waiter> {
        core::mem::take(&mut *self.waiters.lock())
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("koid", &self.koid)
            .field("type", &self.otype)
            .field("refs", &self.refs())
            .field("signals", &format_args!("{:#x}", self.signals()))
            .finish()
    }
}

/// The tagged variant body of an object.
pub enum Body {
    Process(Mutex<Process>),
    Thread(Mutex<Thread>),
    Vma(Mutex<Vma>),
    Mailbox(Mutex<Mailbox>),
    Channel(Mutex<ChannelEnd>),
    /// An event's payload is its signal word; there is no body state
    Event,
    Irq(Mutex<IrqBinding>),
    /// The singleton anchor for privileged operations
    System,
}

impl Body {
    /// The type tag this body implies.
    pub fn object_type(&self) -> ObjectType {
        match self {
            Body::Process(_) => ObjectType::Process,
            Body::Thread(_) => ObjectType::Thread,
            Body::Vma(_) => ObjectType::Vma,
            Body::Mailbox(_) => ObjectType::Mailbox,
            Body::Channel(_) => ObjectType::Channel,
            Body::Event => ObjectType::Event,
            Body::Irq(_) => ObjectType::Irq,
            Body::System => ObjectType::System,
        }
    }
}

/// A kernel object: header plus body.
pub struct Object {
    header: Header,
    body: Body,
}

impl Object {
    pub fn new(koid: Koid, body: Body, initial_refs: u32) -> Self {
        let otype = body.object_type();
        Self {
            header: Header::new(koid, otype, initial_refs),
            body,
        }
    }

    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[inline]
    pub fn koid(&self) -> Koid {
        self.header.koid
    }

    #[inline]
    pub fn object_type(&self) -> ObjectType {
        self.header.otype
    }

    #[inline]
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// The process body, if this is a process.
    pub fn as_process(&self) -> Option<&Mutex<Process>> {
        match &self.body {
            Body::Process(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_thread(&self) -> Option<&Mutex<Thread>> {
        match &self.body {
            Body::Thread(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_vma(&self) -> Option<&Mutex<Vma>> {
        match &self.body {
            Body::Vma(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_mailbox(&self) -> Option<&Mutex<Mailbox>> {
        match &self.body {
            Body::Mailbox(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_channel(&self) -> Option<&Mutex<ChannelEnd>> {
        match &self.body {
            Body::Channel(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_irq(&self) -> Option<&Mutex<IrqBinding>> {
        match &self.body {
            Body::Irq(i) => Some(i),
            _ => None,
        }
    }
}

impl core::fmt::Debug for Object {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Object").field("header", &self.header).finish()
    }
}
