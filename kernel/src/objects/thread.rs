//! Thread objects
//!
//! A thread owns its saved user context, a priority, a scheduling
//! state, and a wait descriptor that wake-ups write results into. The
//! kernel stack and register save area live behind the arch seam; the
//! core tracks the fields every subsystem needs.

use alloc::vec::Vec;

use j6::{Koid, Status};

use super::mailbox::Delivered;
use crate::config::DEFAULT_PRIORITY;
use crate::futex::FutexKey;

/// Saved user-mode context. The full register file is spilled by the
/// syscall entry stub; the core only tracks the slots it writes back.
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    /// Instruction pointer to resume at
    pub rip: u64,
    /// User stack pointer
    pub rsp: u64,
    /// Syscall return register; wake-ups deposit the status here
    pub rax: u64,
}

/// Which side of a mailbox exchange a blocked thread is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxRole {
    Caller,
    Responder,
}

/// Why a thread is blocked, and on what.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// `object_wait`: parked on an object's signal word
    Signal { object: Koid, mask: u64 },
    /// `futex_wait`: parked on a futex bucket
    Futex { key: FutexKey },
    /// `mailbox_call` or blocking `mailbox_respond`
    Mailbox { mailbox: Koid, role: MailboxRole },
    /// `thread_sleep`
    Sleep,
    /// `thread_join`: parked on another thread's exit
    Join { thread: Koid },
}

/// Scheduling states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// In a run queue, ready to execute
    Runnable,
    /// Executing on a CPU
    Running,
    /// Parked on exactly one wait queue
    Blocked(BlockReason),
    /// Finished; waiting only for its object to be destroyed
    Exited,
}

/// Filled in while a thread is blocked; read back on wake-up.
#[derive(Debug, Default)]
pub struct WaitDescriptor {
    /// Status the wake path decided on; `None` while still parked
    pub status: Option<Status>,
    /// Payload word: triggered signal set for `object_wait`, and so on
    pub value: u64,
    /// Message deposited by a mailbox pairing
    pub reply: Option<Delivered>,
    /// Absolute tick deadline; 0 means no timeout
    pub deadline: u64,
}

impl WaitDescriptor {
    fn reset(&mut self) {
        self.status = None;
        self.value = 0;
        self.reply = None;
        self.deadline = 0;
    }
}

/// A thread of execution.
pub struct Thread {
    /// Owning process
    process: Koid,

    /// Scheduling priority, 0 (highest) to 31
    priority: u8,

    state: ThreadState,

    /// Wait bookkeeping while blocked
    pub wait: WaitDescriptor,

    /// Saved user context
    pub context: Context,

    /// The VMA backing this thread's user stack, 0 if none
    user_stack_vma: Koid,

    /// Threads blocked in `thread_join` on this one
    joiners: Vec<Koid>,
}

impl Thread {
    pub fn new(process: Koid, priority: u8, context: Context, user_stack_vma: Koid) -> Self {
        Self {
            process,
            priority,
            state: ThreadState::Runnable,
            wait: WaitDescriptor::default(),
            context,
            user_stack_vma,
            joiners: Vec::new(),
        }
    }

    #[inline]
    pub fn process(&self) -> Koid {
        self.process
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        self.priority
    }

    #[inline]
    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        self.state
    }

    #[inline]
    pub fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    #[inline]
    pub fn user_stack_vma(&self) -> Koid {
        self.user_stack_vma
    }

    /// True if the thread has exited.
    #[inline]
    pub fn is_exited(&self) -> bool {
        self.state == ThreadState::Exited
    }

    /// Enter a blocked state, clearing the wait descriptor for the
    /// wake path to fill.
    pub fn block(&mut self, reason: BlockReason, deadline: u64) {
        debug_assert!(
            !matches!(self.state, ThreadState::Blocked(_)),
            "thread blocked while already blocked"
        );
        self.wait.reset();
        self.wait.deadline = deadline;
        self.state = ThreadState::Blocked(reason);
    }

    /// The block reason, if blocked.
    pub fn block_reason(&self) -> Option<BlockReason> {
        match self.state {
            ThreadState::Blocked(reason) => Some(reason),
            _ => None,
        }
    }

    /// Record a join waiter.
    pub fn add_joiner(&mut self, thread: Koid) {
        self.joiners.push(thread);
    }

    pub fn remove_joiner(&mut self, thread: Koid) -> bool {
        if let Some(pos) = self.joiners.iter().position(|&t| t == thread) {
            self.joiners.remove(pos);
            true
        } else {
            false
        }
    }

    /// Take all join waiters; called when the thread exits.
    pub fn take_joiners(&mut self) -> Vec<Koid> {
        core::mem::take(&mut self.joiners)
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("process", &self.process)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .finish()
    }
}

/// Priority for threads that do not specify one.
pub const fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_resets_wait_descriptor() {
        let mut t = Thread::new(1, default_priority(), Context::default(), 0);
        t.wait.status = Some(Status::Ok);
        t.wait.value = 99;

        t.block(BlockReason::Sleep, 50);
        assert_eq!(t.wait.status, None);
        assert_eq!(t.wait.value, 0);
        assert_eq!(t.wait.deadline, 50);
        assert_eq!(t.block_reason(), Some(BlockReason::Sleep));
    }

    #[test]
    fn joiners_are_tracked() {
        let mut t = Thread::new(1, 0, Context::default(), 0);
        t.add_joiner(5);
        t.add_joiner(6);
        assert!(t.remove_joiner(5));
        assert!(!t.remove_joiner(5));
        assert_eq!(t.take_joiners(), alloc::vec![6]);
    }
}
