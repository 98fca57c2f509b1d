//! Processes, threads, futexes
//!
//! Thread and process lifecycle: creation, exit, kill, join, sleep,
//! and the futex wait/wake pair. Killing pulls a thread off whatever
//! wait queue its block reason names; the last thread out of a process
//! tears the whole process down, closing every handle and unmapping
//! every VMA.

use j6::caps::Caps;
use j6::syslog::{Area, Severity};
use j6::{Handle, Koid, ObjectType, Status};

use crate::futex::FutexKey;
use crate::memory::{PhysAddr, VirtAddr};
use crate::objects::thread::{BlockReason, Context};
use crate::objects::{Body, Process, Thread, ThreadState};

use super::{Invocation, Kernel};

/// Capabilities a process holds on itself.
pub const PROCESS_SELF_CAPS: Caps = Caps::from_bits_truncate(
    Caps::CLONE.bits()
        | Caps::TRANSFER.bits()
        | Caps::WAIT.bits()
        | Caps::PROCESS_CREATE_THREAD.bits(),
);

/// Capabilities a parent gets on a child it creates.
pub const PROCESS_CHILD_CAPS: Caps = Caps::from_bits_truncate(
    Caps::CLONE.bits()
        | Caps::TRANSFER.bits()
        | Caps::WAIT.bits()
        | Caps::PROCESS_KILL.bits()
        | Caps::PROCESS_CREATE_THREAD.bits(),
);

/// Capabilities granted on a thread handle at creation.
pub const THREAD_DEFAULT_CAPS: Caps = Caps::from_bits_truncate(
    Caps::CLONE.bits()
        | Caps::TRANSFER.bits()
        | Caps::WAIT.bits()
        | Caps::THREAD_KILL.bits()
        | Caps::THREAD_JOIN.bits(),
);

/// Capabilities granted on a new event handle.
pub const EVENT_DEFAULT_CAPS: Caps = Caps::from_bits_truncate(
    Caps::CLONE.bits() | Caps::TRANSFER.bits() | Caps::WAIT.bits() | Caps::SIGNAL.bits(),
);

impl Kernel {
    // ------------------------------------------------------------------
    // Processes

    /// Create a process with its self handle installed. Used by boot
    /// for init and by `process_create` for everyone else.
    pub fn create_process(&self, table_root: PhysAddr) -> Koid {
        // Reference 1 is the process's own liveness, dropped when the
        // last thread exits
        let obj = self
            .objects
            .lock()
            .insert(Body::Process(spin::Mutex::new(Process::new(table_root))), 1);

        let koid = obj.koid();
        if let Some(cell) = obj.as_process() {
            let mut proc = cell.lock();
            let self_handle = proc.handles.insert(koid, ObjectType::Process, PROCESS_SELF_CAPS);
            proc.self_handle = self_handle;
        }
        obj.header().retain(); // the self handle

        koid
    }

    /// `process_create`: make an empty child process; the parent gets
    /// a handle with kill rights.
    pub fn process_create(
        &self,
        parent: Koid,
        table_root: PhysAddr,
    ) -> Result<(Koid, Handle), Status> {
        let parent_obj = self.obj_as(parent, ObjectType::Process)?;
        let parent_cell = parent_obj.as_process().ok_or(Status::Unexpected)?;

        let child = self.create_process(table_root);
        self.retain(child);
        let handle = parent_cell
            .lock()
            .handles
            .insert(child, ObjectType::Process, PROCESS_CHILD_CAPS);

        self.log(Area::Objects, Severity::Info, "created process");
        Ok((child, handle))
    }

    /// Install a handle to the system object in `process`, recording
    /// it as the well-known system handle.
    pub fn grant_system_handle(&self, process: Koid, caps: Caps) -> Result<Handle, Status> {
        let proc_obj = self.obj_as(process, ObjectType::Process)?;
        let proc_cell = proc_obj.as_process().ok_or(Status::Unexpected)?;

        let system = self.system_koid();
        self.retain(system);
        let mut proc = proc_cell.lock();
        let handle = proc.handles.insert(system, ObjectType::System, caps);
        proc.system_handle = handle;
        Ok(handle)
    }

    /// `process_exit`: the calling thread asks for its whole process
    /// to die with `status`.
    pub fn process_exit(&self, thread: Koid, status: u64) -> Result<(), Status> {
        let process = self.thread_process(thread)?;
        self.terminate_process(process, status)
    }

    /// `process_kill`: kill through a handle.
    pub fn process_kill(&self, process: Koid, handle: Handle) -> Result<(), Status> {
        let entry =
            self.resolve_handle(process, handle, ObjectType::Process, Caps::PROCESS_KILL)?;
        self.terminate_process(entry.koid, u64::MAX)
    }

    /// Kill every thread of a process; the last kill triggers the
    /// process teardown.
    pub(crate) fn terminate_process(&self, process: Koid, status: u64) -> Result<(), Status> {
        let proc_obj = self.obj_as(process, ObjectType::Process)?;
        let proc_cell = proc_obj.as_process().ok_or(Status::Unexpected)?;

        let threads = {
            let mut proc = proc_cell.lock();
            if proc.is_exiting() {
                return Ok(());
            }
            proc.set_exit_status(status);
            proc.threads().to_vec()
        };

        for thread in threads {
            self.kill_thread(thread);
        }
        Ok(())
    }

    /// Full process teardown, run when the last thread is gone: close
    /// every handle, unmap every VMA, then drop the liveness reference
    /// so the object is destroyed and waiters see `closed`.
    fn teardown_process(&self, process: Koid) {
        let Ok(proc_obj) = self.obj_as(process, ObjectType::Process) else {
            return;
        };
        let Some(proc_cell) = proc_obj.as_process() else {
            return;
        };

        let (entries, vmas) = {
            let mut proc = proc_cell.lock();
            let entries: alloc::vec::Vec<_> = proc.handles.drain().collect();
            let vmas = proc.take_vmas();
            (entries, vmas)
        };

        for entry in &entries {
            self.note_handle_removed(entry);
        }
        for entry in entries {
            self.release(entry.koid);
        }

        // Unmap: drop the mapping records and their references
        for vma in vmas {
            if let Ok(vma_obj) = self.obj(vma) {
                if let Some(vma_cell) = vma_obj.as_vma() {
                    vma_cell.lock().remove_mapping(process);
                }
                self.release(vma);
            }
        }

        // The process is dead now, whatever handles still name it;
        // waiters must not linger until the last handle closes
        let woken = proc_obj.header().assert_signals(j6::signals::CLOSED);
        for waiter in woken {
            self.wake_thread(waiter.thread, Status::Closed, 0, None);
        }

        self.log(Area::Objects, Severity::Info, "process destroyed");
        self.release(process);
    }

    /// The owning process of a thread.
    pub(crate) fn thread_process(&self, thread: Koid) -> Result<Koid, Status> {
        let obj = self.obj_as(thread, ObjectType::Thread)?;
        let cell = obj.as_thread().ok_or(Status::Unexpected)?;
        let process = cell.lock().process();
        Ok(process)
    }

    // ------------------------------------------------------------------
    // Threads

    /// `thread_create`: a new thread in `process`, runnable at once.
    /// Returns the thread's koid and the creator's handle to it.
    pub fn thread_create(
        &self,
        process: Koid,
        entry: u64,
        stack: u64,
        priority: u8,
        user_stack_vma: Koid,
    ) -> Result<(Koid, Handle), Status> {
        if priority as usize >= crate::config::NUM_PRIORITIES {
            return Err(Status::InvalidArg);
        }

        let proc_obj = self.obj_as(process, ObjectType::Process)?;
        let proc_cell = proc_obj.as_process().ok_or(Status::Unexpected)?;
        if proc_cell.lock().is_exiting() {
            return Err(Status::NotReady);
        }

        let context = Context {
            rip: entry,
            rsp: stack,
            rax: 0,
        };

        // Reference 1 is the process's thread-list entry
        let thread_obj = self.objects.lock().insert(
            Body::Thread(spin::Mutex::new(Thread::new(
                process,
                priority,
                context,
                user_stack_vma,
            ))),
            1,
        );
        let thread = thread_obj.koid();

        let handle = {
            let mut proc = proc_cell.lock();
            proc.add_thread(thread);
            proc.handles.insert(thread, ObjectType::Thread, THREAD_DEFAULT_CAPS)
        };
        thread_obj.header().retain(); // the creator's handle

        self.sched.lock().enqueue(0, thread, priority);
        Ok((thread, handle))
    }

    /// `thread_exit`: the calling thread finishes.
    pub fn thread_exit(&self, thread: Koid) {
        self.retire_thread(thread, false);
    }

    /// `thread_kill`: forcibly retire a thread through a handle.
    pub fn thread_kill(&self, process: Koid, handle: Handle) -> Result<(), Status> {
        let entry = self.resolve_handle(process, handle, ObjectType::Thread, Caps::THREAD_KILL)?;
        self.kill_thread(entry.koid);
        Ok(())
    }

    /// Forcibly retire a thread, removing it from whatever queue it
    /// occupies.
    pub(crate) fn kill_thread(&self, thread: Koid) {
        self.retire_thread(thread, true);
    }

    /// The common exit path. `forced` threads are pulled off run and
    /// wait queues first.
    fn retire_thread(&self, thread: Koid, forced: bool) {
        let Ok(obj) = self.obj_as(thread, ObjectType::Thread) else {
            return;
        };
        let Some(cell) = obj.as_thread() else {
            return;
        };

        let (process, prior_state, joiners) = {
            let mut t = cell.lock();
            if t.is_exited() {
                return;
            }
            let state = t.state();
            t.set_state(ThreadState::Exited);
            (t.process(), state, t.take_joiners())
        };

        if forced {
            match prior_state {
                ThreadState::Runnable => {
                    let priority = cell.lock().priority();
                    self.sched.lock().remove_anywhere(thread, priority);
                }
                ThreadState::Blocked(reason) => self.cancel_wait(thread, reason),
                _ => {}
            }
        }
        {
            let mut sched = self.sched.lock();
            sched.cancel_timeout(thread);
            sched.clear_current(thread);
        }

        // Join waiters see a normal completion
        for joiner in joiners {
            self.wake_thread(joiner, Status::Ok, 0, None);
        }

        // Signal watchers see the thread finish even while handles to
        // it remain open
        let woken = obj.header().assert_signals(j6::signals::CLOSED);
        for waiter in woken {
            self.wake_thread(waiter.thread, Status::Closed, 0, None);
        }

        // Leave the process's thread list and drop that reference
        let last = {
            let Ok(proc_obj) = self.obj_as(process, ObjectType::Process) else {
                self.release(thread);
                return;
            };
            let Some(proc_cell) = proc_obj.as_process() else {
                return;
            };
            let removed = proc_cell.lock().remove_thread(thread);
            removed
        };

        self.release(thread);

        if last {
            self.teardown_process(process);
        }
    }

    /// Remove a blocked thread from the wait queue its reason names.
    fn cancel_wait(&self, thread: Koid, reason: BlockReason) {
        match reason {
            BlockReason::Signal { object, .. } => {
                if let Ok(target) = self.obj(object) {
                    target.header().remove_waiter(thread);
                }
            }
            BlockReason::Futex { key } => {
                self.futexes.lock().remove(key, thread);
            }
            BlockReason::Mailbox { mailbox, role } => {
                self.cancel_mailbox_wait(thread, mailbox, role);
            }
            BlockReason::Sleep => {}
            BlockReason::Join { thread: target } => {
                if let Ok(target_obj) = self.obj(target) {
                    if let Some(target_cell) = target_obj.as_thread() {
                        target_cell.lock().remove_joiner(thread);
                    }
                }
            }
        }
    }

    /// `thread_sleep`: park until an absolute tick. Deadline 0 parks
    /// until killed.
    pub fn thread_sleep(&self, thread: Koid, deadline: u64) -> Invocation<()> {
        self.block_thread(thread, BlockReason::Sleep, deadline);
        Invocation::Block
    }

    /// `thread_join`: park until the target thread exits. Completes
    /// immediately if it already has.
    pub fn thread_join(
        &self,
        thread: Koid,
        process: Koid,
        handle: Handle,
        deadline: u64,
    ) -> Result<Invocation<()>, Status> {
        let entry = self.resolve_handle(process, handle, ObjectType::Thread, Caps::THREAD_JOIN)?;
        if entry.koid == thread {
            return Err(Status::InvalidArg);
        }

        let target_obj = match self.obj(entry.koid) {
            Ok(obj) => obj,
            // Already destroyed: the join is trivially done
            Err(_) => return Ok(Invocation::Complete(())),
        };
        let target_cell = target_obj.as_thread().ok_or(Status::Unexpected)?;

        {
            let mut target = target_cell.lock();
            if target.is_exited() {
                return Ok(Invocation::Complete(()));
            }
            target.add_joiner(thread);
        }

        self.block_thread(
            thread,
            BlockReason::Join { thread: entry.koid },
            deadline,
        );
        Ok(Invocation::Block)
    }

    // ------------------------------------------------------------------
    // Events

    /// `event_create`: an object whose signal word is the payload.
    pub fn event_create(&self, process: Koid) -> Result<Handle, Status> {
        self.create_object(process, Body::Event, EVENT_DEFAULT_CAPS)
    }

    // ------------------------------------------------------------------
    // Futexes

    /// `futex_wait`: park on a 32-bit user word unless it no longer
    /// holds `expected`. `observed` is the value the syscall gate read
    /// under the futex lock.
    pub fn futex_wait(
        &self,
        thread: Koid,
        process: Koid,
        addr: VirtAddr,
        expected: u32,
        observed: u32,
        deadline: u64,
    ) -> Result<Invocation<()>, Status> {
        if addr.as_u64() % 4 != 0 {
            return Err(Status::InvalidArg);
        }
        if observed != expected {
            return Err(Status::FutexChanged);
        }

        let key = FutexKey::new(process, addr);
        self.futexes.lock().enqueue(key, thread);
        self.block_thread(thread, BlockReason::Futex { key }, deadline);
        Ok(Invocation::Block)
    }

    /// `futex_wake`: wake up to `count` waiters in FIFO order.
    /// Returns how many were woken.
    pub fn futex_wake(
        &self,
        process: Koid,
        addr: VirtAddr,
        count: usize,
    ) -> Result<usize, Status> {
        if addr.as_u64() % 4 != 0 {
            return Err(Status::InvalidArg);
        }

        let key = FutexKey::new(process, addr);
        let woken = self.futexes.lock().wake(key, count);
        let n = woken.len();
        for thread in woken {
            self.wake_thread(thread, Status::Ok, 0, None);
        }
        Ok(n)
    }
}
