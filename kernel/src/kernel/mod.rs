//! The kernel root
//!
//! One [`Kernel`] record owns every piece of mutable kernel state: the
//! frame allocator, the object table, the system log ring, the futex
//! buckets, and the scheduler. It is built during boot from the boot
//! protocol args and passed by reference everywhere; there are no
//! ambient globals.
//!
//! ## Locking
//!
//! Each subsystem sits behind its own lock. Acquisition order, outermost
//! first: frame allocator, object table, per-object body, scheduler.
//! The object table lock is only ever held long enough to clone an
//! object reference out of the map. Methods that need to wake threads
//! collect the wake-ups while holding body locks, then perform them
//! against the scheduler afterwards.
//!
//! ## Blocking
//!
//! A kernel path that must block parks the calling thread (state,
//! wait-queue entry, timeout) and returns [`Invocation::Block`]; the
//! syscall layer then switches away. The eventual wake-up deposits a
//! status and payload in the thread's wait descriptor, which the
//! syscall exit path writes back to user space.

mod ipc;
mod task;
mod vm;

#[cfg(test)]
mod tests;

use alloc::sync::Arc;

use spin::Mutex;

use hashbrown::HashMap;

use j6::caps::Caps;
use j6::syslog::{Area, Severity};
use j6::{signals, Handle, Koid, ObjectType, Status};

use crate::config::SYSLOG_RING_SIZE;
use crate::futex::FutexTable;
use crate::memory::FrameAllocator;
use crate::objects::{
    Body, Delivered, HandleEntry, Object, ObjectTable, ThreadState, Waiter,
};
use crate::sched::Scheduler;
use crate::syslog::LogRing;

/// How a kernel operation left the calling thread.
#[derive(Debug)]
pub enum Invocation<T> {
    /// Finished; the value goes back to the caller now
    Complete(T),
    /// The calling thread is parked; its wait descriptor will carry
    /// the result
    Block,
}

impl<T> Invocation<T> {
    /// Unwrap a completion, for callers that know the path cannot
    /// block.
    #[cfg(test)]
    pub fn unwrap_complete(self) -> T {
        match self {
            Invocation::Complete(v) => v,
            Invocation::Block => panic!("operation unexpectedly blocked"),
        }
    }
}

/// The kernel root record.
pub struct Kernel {
    /// Physical frame allocator
    pub(crate) frames: Mutex<FrameAllocator>,

    /// All live kernel objects
    pub(crate) objects: Mutex<ObjectTable>,

    /// The system log ring
    pub(crate) syslog: Mutex<LogRing>,

    /// Futex wait buckets
    pub(crate) futexes: Mutex<FutexTable>,

    /// Run queues and the timer heap
    pub(crate) sched: Mutex<Scheduler>,

    /// Hardware vector to IRQ-object bindings
    pub(crate) irqs: Mutex<HashMap<u16, Koid>>,

    /// The system singleton's koid
    system: Koid,
}

impl Kernel {
    /// Build a kernel root. The frame allocator arrives already loaded
    /// from the boot memory map.
    pub fn new(frames: FrameAllocator, num_cpus: usize) -> Self {
        let mut objects = ObjectTable::new();
        // The system object is held alive by the kernel itself
        let system = objects.insert(Body::System, 1).koid();

        Self {
            frames: Mutex::new(frames),
            objects: Mutex::new(objects),
            syslog: Mutex::new(LogRing::new(SYSLOG_RING_SIZE)),
            futexes: Mutex::new(FutexTable::new()),
            sched: Mutex::new(Scheduler::new(num_cpus)),
            irqs: Mutex::new(HashMap::new()),
            system,
        }
    }

    /// The system singleton's koid.
    #[inline]
    pub fn system_koid(&self) -> Koid {
        self.system
    }

    // ------------------------------------------------------------------
    // Object lifecycle

    /// Look up a live object; a missing koid means the object has been
    /// destroyed out from under the caller.
    pub(crate) fn obj(&self, koid: Koid) -> Result<Arc<Object>, Status> {
        self.objects.lock().get(koid).ok_or(Status::Closed)
    }

    /// Look up and type-check in one step.
    pub(crate) fn obj_as(&self, koid: Koid, otype: ObjectType) -> Result<Arc<Object>, Status> {
        let obj = self.obj(koid)?;
        if obj.object_type() != otype {
            return Err(Status::InvalidArg);
        }
        Ok(obj)
    }

    /// Add a reference to an object.
    pub(crate) fn retain(&self, koid: Koid) {
        if let Some(obj) = self.objects.lock().get(koid) {
            obj.header().retain();
        }
    }

    /// Drop a reference; the last one destroys the object.
    pub(crate) fn release(&self, koid: Koid) {
        let Some(obj) = self.objects.lock().get(koid) else {
            return;
        };
        if obj.header().release() {
            self.destroy(obj);
        }
    }

    /// Destroy an object: remove it from the table, run type-specific
    /// teardown, raise `closed`, and wake every waiter.
    fn destroy(&self, obj: Arc<Object>) {
        self.objects.lock().remove(obj.koid());

        // Teardown that needs other subsystems happens before waiters
        // are released, so they can never observe half-dead state.
        match obj.body() {
            Body::Mailbox(_) => self.teardown_mailbox(&obj),
            Body::Channel(_) => self.teardown_channel(&obj),
            Body::Vma(_) => self.teardown_vma(&obj),
            Body::Irq(_) => self.teardown_irq(&obj),
            _ => {}
        }

        let woken = obj.header().assert_signals(signals::CLOSED);
        let stragglers = obj.header().drain_waiters();
        for Waiter { thread, .. } in woken.into_iter().chain(stragglers) {
            self.wake_thread(thread, Status::Closed, obj.header().signals(), None);
        }
    }

    /// Create an object and insert a handle to it in `process`'s
    /// table. The handle is the object's first reference.
    pub(crate) fn create_object(
        &self,
        process: Koid,
        body: Body,
        caps: Caps,
    ) -> Result<Handle, Status> {
        let proc_obj = self.obj_as(process, ObjectType::Process)?;
        let proc_cell = proc_obj.as_process().ok_or(Status::Unexpected)?;

        let obj = self.objects.lock().insert(body, 1);
        let entry_type = obj.object_type();

        let handle = proc_cell.lock().handles.insert(obj.koid(), entry_type, caps);
        self.note_handle_added(obj.koid(), entry_type, caps);
        Ok(handle)
    }

    // ------------------------------------------------------------------
    // Handle operations

    /// Resolve a handle in `process` against a type and required caps.
    pub(crate) fn resolve_handle(
        &self,
        process: Koid,
        handle: Handle,
        otype: ObjectType,
        required: Caps,
    ) -> Result<HandleEntry, Status> {
        let proc_obj = self.obj_as(process, ObjectType::Process)?;
        let proc_cell = proc_obj.as_process().ok_or(Status::Unexpected)?;
        let entry = *proc_cell.lock().handles.resolve(handle, otype, required)?;

        // The entry may outlive its object; surface that as closed
        if self.objects.lock().get(entry.koid).is_none() {
            return Err(Status::Closed);
        }
        Ok(entry)
    }

    /// Close a handle: remove the entry and drop its reference.
    pub fn handle_close(&self, process: Koid, handle: Handle) -> Status {
        let Ok(proc_obj) = self.obj_as(process, ObjectType::Process) else {
            return Status::Closed;
        };
        let Some(proc_cell) = proc_obj.as_process() else {
            return Status::Unexpected;
        };

        let Some(entry) = proc_cell.lock().handles.remove(handle) else {
            return Status::InvalidArg;
        };

        self.note_handle_removed(&entry);
        self.release(entry.koid);
        Status::Ok
    }

    /// Clone a handle with capabilities `mask ∩ original`.
    pub fn handle_clone(&self, process: Koid, handle: Handle, mask: Caps) -> Result<Handle, Status> {
        let proc_obj = self.obj_as(process, ObjectType::Process)?;
        let proc_cell = proc_obj.as_process().ok_or(Status::Unexpected)?;

        let mut proc = proc_cell.lock();
        let entry = *proc.handles.get(handle).ok_or(Status::InvalidArg)?;
        if !entry.caps.grants(Caps::CLONE) {
            return Err(Status::Denied);
        }

        let caps = entry.caps.narrow(mask);
        let new_handle = proc.handles.insert(entry.koid, entry.object_type, caps);
        drop(proc);

        self.retain(entry.koid);
        self.note_handle_added(entry.koid, entry.object_type, caps);
        Ok(new_handle)
    }

    /// Move a handle from one process to another: reserve a slot in
    /// the destination, then remove the source entry, so failure on
    /// either side leaves both tables unchanged. The object's refcount
    /// does not move. Used for parent-given handles at process setup.
    pub fn handle_transfer(
        &self,
        from: Koid,
        handle: Handle,
        to: Koid,
    ) -> Result<Handle, Status> {
        if from == to {
            return Err(Status::InvalidArg);
        }
        let from_obj = self.obj_as(from, ObjectType::Process)?;
        let from_cell = from_obj.as_process().ok_or(Status::Unexpected)?;
        let to_obj = self.obj_as(to, ObjectType::Process)?;
        let to_cell = to_obj.as_process().ok_or(Status::Unexpected)?;

        {
            let from_table = from_cell.lock();
            let entry = from_table.handles.get(handle).ok_or(Status::InvalidArg)?;
            if !entry.caps.grants(Caps::TRANSFER) {
                return Err(Status::Denied);
            }
        }

        // Phase one: reserve in the destination
        let slot = to_cell.lock().handles.reserve();

        // Phase two: remove from the source; a racing close means the
        // reservation is simply abandoned
        let entry = match from_cell.lock().handles.remove(handle) {
            Some(entry) => entry,
            None => {
                to_cell.lock().handles.release_reservation(slot);
                return Err(Status::InvalidArg);
            }
        };

        let handle = to_cell.lock().handles.fill_reservation(slot, entry);
        Ok(handle)
    }

    /// Describe the caller's handles. `buf` receives as many
    /// descriptors as fit; the full count comes back either way, so a
    /// short buffer yields `insufficient` plus the size to retry with.
    pub fn handle_list(
        &self,
        process: Koid,
        buf: &mut [j6::HandleDescriptor],
    ) -> Result<usize, (Status, usize)> {
        let proc_obj = self
            .obj_as(process, ObjectType::Process)
            .map_err(|s| (s, 0))?;
        let proc_cell = proc_obj.as_process().ok_or((Status::Unexpected, 0))?;

        let proc = proc_cell.lock();
        let total = proc.handles.len();
        if buf.len() < total {
            return Err((Status::Insufficient, total));
        }
        for (slot, desc) in buf.iter_mut().zip(proc.handles.descriptors()) {
            *slot = desc;
        }
        Ok(total)
    }

    /// Capability accounting hooks: a mailbox closes when its last
    /// respond-capable handle disappears.
    pub(crate) fn note_handle_added(&self, koid: Koid, otype: ObjectType, caps: Caps) {
        if otype == ObjectType::Mailbox && caps.grants(Caps::MAILBOX_RESPOND) {
            if let Ok(obj) = self.obj(koid) {
                if let Some(mb) = obj.as_mailbox() {
                    mb.lock().add_respond_handle();
                }
            }
        }
    }

    pub(crate) fn note_handle_removed(&self, entry: &HandleEntry) {
        if entry.object_type == ObjectType::Mailbox && entry.caps.grants(Caps::MAILBOX_RESPOND) {
            if let Ok(obj) = self.obj(entry.koid) {
                let must_close = obj
                    .as_mailbox()
                    .map(|mb| mb.lock().remove_respond_handle())
                    .unwrap_or(false);
                if must_close {
                    self.close_mailbox(&obj);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Scheduling glue

    /// Wake a blocked thread with a result. A thread that is no longer
    /// blocked (raced with a kill) is left alone.
    pub(crate) fn wake_thread(
        &self,
        thread: Koid,
        status: Status,
        value: u64,
        reply: Option<Delivered>,
    ) {
        let Some(obj) = self.objects.lock().get(thread) else {
            return;
        };
        let Some(cell) = obj.as_thread() else {
            return;
        };

        let mut t = cell.lock();
        if !matches!(t.state(), ThreadState::Blocked(_)) {
            return;
        }
        t.wait.status = Some(status);
        t.wait.value = value;
        t.wait.reply = reply;
        t.set_state(ThreadState::Runnable);
        let priority = t.priority();
        drop(t);

        let mut sched = self.sched.lock();
        sched.cancel_timeout(thread);
        sched.enqueue(0, thread, priority);
    }

    /// Park the current thread. The caller has already put it on the
    /// wait queue its block reason names.
    pub(crate) fn block_thread(
        &self,
        thread: Koid,
        reason: crate::objects::BlockReason,
        deadline: u64,
    ) {
        let obj = self.objects.lock().get(thread);
        if let Some(obj) = obj {
            self.park_thread(&obj, reason, deadline);
        }
    }

    /// Park a thread whose object is already in hand. Takes only the
    /// thread body and scheduler locks, so callers may hold another
    /// object's body lock across it to shut the wake-up race.
    pub(crate) fn park_thread(
        &self,
        thread_obj: &Arc<Object>,
        reason: crate::objects::BlockReason,
        deadline: u64,
    ) {
        if let Some(cell) = thread_obj.as_thread() {
            cell.lock().block(reason, deadline);
        }
        if deadline != 0 {
            self.sched.lock().arm_timeout(thread_obj.koid(), deadline);
        }
    }

    /// Pick the next thread for `cpu`, marking it running. Queue
    /// entries are removed lazily: a thread that blocked or died while
    /// queued is skipped here.
    pub fn schedule(&self, cpu: usize) -> Option<Koid> {
        loop {
            let next = self.sched.lock().pick_next(cpu)?;
            let Some(obj) = self.objects.lock().get(next) else {
                continue;
            };
            let Some(cell) = obj.as_thread() else {
                continue;
            };
            let mut t = cell.lock();
            if t.state() == ThreadState::Runnable {
                t.set_state(ThreadState::Running);
                return Some(next);
            }
        }
    }

    /// Voluntary yield: the running thread goes to the back of its
    /// priority queue and the next thread is chosen.
    pub fn yield_now(&self, cpu: usize, thread: Koid) -> Option<Koid> {
        self.requeue_running(cpu, thread);
        self.schedule(cpu)
    }

    /// A timer tick: advance the clock, fire due timeouts, and
    /// round-robin the running thread.
    pub fn tick(&self, cpu: usize, thread: Option<Koid>) -> Option<Koid> {
        let now = self.sched.lock().now() + 1;
        self.advance_time(now);
        if let Some(thread) = thread {
            self.requeue_running(cpu, thread);
        }
        self.schedule(cpu)
    }

    /// Advance the clock to an absolute tick, waking every thread
    /// whose deadline has passed.
    pub fn advance_time(&self, now: u64) {
        let due = self.sched.lock().advance(now);
        for entry in due {
            self.handle_timeout(entry.thread);
        }
    }

    /// The current tick.
    pub fn now(&self) -> u64 {
        self.sched.lock().now()
    }

    fn requeue_running(&self, cpu: usize, thread: Koid) {
        let Some(obj) = self.objects.lock().get(thread) else {
            return;
        };
        let Some(cell) = obj.as_thread() else {
            return;
        };
        let mut t = cell.lock();
        if t.state() != ThreadState::Running {
            return;
        }
        t.set_state(ThreadState::Runnable);
        let priority = t.priority();
        drop(t);

        let mut sched = self.sched.lock();
        sched.set_current(cpu, None);
        sched.enqueue(cpu, thread, priority);
    }

    // ------------------------------------------------------------------
    // Logging

    /// Append an entry to the system log ring and raise `has_log` on
    /// the system object.
    pub fn log(&self, area: Area, severity: Severity, message: &str) -> u64 {
        self.log_bytes(area, severity, message.as_bytes())
    }

    /// Byte-slice form of [`log`](Self::log), for user payloads.
    pub fn log_bytes(&self, area: Area, severity: Severity, message: &[u8]) -> u64 {
        let id = self.syslog.lock().append(area, severity, message);

        if let Some(sys) = self.objects.lock().get(self.system) {
            let woken = sys.header().assert_signals(signals::SYSTEM_HAS_LOG);
            for Waiter { thread, .. } in woken {
                self.wake_thread(thread, Status::Ok, sys.header().signals(), None);
            }
        }
        id
    }

    /// Park a thread on the system object until `has_log` rises. Used
    /// by `system_get_log` when the ring is drained.
    pub fn wait_for_log(
        &self,
        thread: Koid,
        process: Koid,
        sys_handle: Handle,
    ) -> Result<Invocation<u64>, Status> {
        self.resolve_handle(process, sys_handle, ObjectType::System, Caps::SYSTEM_GET_LOG)?;

        let sys = self.obj(self.system)?;
        let word = sys.header().signals();
        if word & signals::SYSTEM_HAS_LOG != 0 {
            return Ok(Invocation::Complete(word));
        }

        sys.header().add_waiter(thread, signals::SYSTEM_HAS_LOG);
        self.block_thread(
            thread,
            crate::objects::BlockReason::Signal {
                object: self.system,
                mask: signals::SYSTEM_HAS_LOG,
            },
            0,
        );
        Ok(Invocation::Block)
    }

    /// Take a woken thread's wait result for the syscall exit path.
    pub fn take_wait_result(&self, thread: Koid) -> Option<(Status, u64, Option<Delivered>)> {
        let obj = self.objects.lock().get(thread)?;
        let cell = obj.as_thread()?;
        let mut t = cell.lock();
        let status = t.wait.status.take()?;
        let value = t.wait.value;
        let reply = t.wait.reply.take();
        Some((status, value, reply))
    }

    /// Allocate a page-table root frame for a new process.
    pub fn alloc_table_root(&self) -> Result<crate::memory::PhysAddr, Status> {
        self.frames
            .lock()
            .alloc(1, crate::memory::AllocKind::PageTable)
    }

    /// `system_request_iopl`: let a privileged process drive I/O
    /// ports directly. Only level 3 may be requested; the arch layer
    /// applies it on the next switch-in.
    pub fn system_request_iopl(
        &self,
        process: Koid,
        sys_handle: Handle,
        level: u8,
    ) -> Result<(), Status> {
        self.resolve_handle(process, sys_handle, ObjectType::System, Caps::SYSTEM_IOPL)?;
        if level != 0 && level != 3 {
            return Err(Status::InvalidArg);
        }

        let proc_obj = self.obj_as(process, ObjectType::Process)?;
        let proc_cell = proc_obj.as_process().ok_or(Status::Unexpected)?;
        proc_cell.lock().iopl = level;
        Ok(())
    }

    /// Read the next log entry with id greater than `after_id`. When
    /// the ring drains, `has_log` is lowered so readers can park on it.
    pub fn get_log(
        &self,
        after_id: u64,
        buf: &mut [u8],
    ) -> Result<(j6::syslog::EntryHeader, usize), Status> {
        let mut ring = self.syslog.lock();
        let result = ring.read_next(after_id, buf);

        if !ring.has_entries() {
            if let Some(sys) = self.objects.lock().get(self.system) {
                sys.header().clear_signals(signals::SYSTEM_HAS_LOG);
            }
        }
        result
    }

    /// Diagnostic frame accounting dump.
    pub fn dump_frames(&self, out: &mut dyn core::fmt::Write) {
        self.frames.lock().dump(out);
    }

    /// Free frames right now; tests watch this to see backing pages
    /// come and go.
    pub fn free_frames(&self) -> usize {
        self.frames.lock().free_frames()
    }

    /// Live object count, for leak checks.
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    // ------------------------------------------------------------------
    // Waiting (generic object signals)

    /// `object_wait`: park until any signal in `mask` is set. If one
    /// already is, complete immediately with the current word. Event
    /// objects consume the bits they report.
    pub fn object_wait(
        &self,
        thread: Koid,
        process: Koid,
        handle: Handle,
        mask: u64,
        deadline: u64,
    ) -> Result<Invocation<u64>, Status> {
        if mask == 0 {
            return Err(Status::InvalidArg);
        }

        let proc_obj = self.obj_as(process, ObjectType::Process)?;
        let proc_cell = proc_obj.as_process().ok_or(Status::Unexpected)?;
        let entry = {
            let proc = proc_cell.lock();
            let entry = proc.handles.get(handle).ok_or(Status::InvalidArg)?;
            if !entry.caps.grants(Caps::WAIT) {
                return Err(Status::Denied);
            }
            *entry
        };

        let obj = self.obj(entry.koid)?;

        let word = obj.header().signals();
        if word & mask != 0 {
            if obj.object_type() == ObjectType::Event {
                obj.header().clear_signals(word & mask);
            }
            return Ok(Invocation::Complete(word));
        }

        // A dead object can never raise new signals; unless the caller
        // was watching for exactly that, fail rather than park forever
        if obj.header().is_closed() {
            return Err(Status::Closed);
        }

        obj.header().add_waiter(thread, mask);
        self.block_thread(
            thread,
            crate::objects::BlockReason::Signal {
                object: entry.koid,
                mask,
            },
            deadline,
        );
        Ok(Invocation::Block)
    }

    /// Assert signal bits on an object; the caller's handle gates
    /// which bits. Only the event lines and user bits may be touched
    /// from user space.
    pub fn object_signal(
        &self,
        process: Koid,
        handle: Handle,
        bits: u64,
    ) -> Result<(), Status> {
        const SETTABLE: u64 = !(signals::COMMON_MASK | 0xff00);

        if bits & !SETTABLE != 0 {
            return Err(Status::InvalidArg);
        }

        let proc_obj = self.obj_as(process, ObjectType::Process)?;
        let proc_cell = proc_obj.as_process().ok_or(Status::Unexpected)?;
        let entry = {
            let proc = proc_cell.lock();
            let entry = proc.handles.get(handle).ok_or(Status::InvalidArg)?;
            if !entry.caps.grants(Caps::SIGNAL) {
                return Err(Status::Denied);
            }
            *entry
        };

        let obj = self.obj(entry.koid)?;
        let woken = obj.header().assert_signals(bits);
        let word = obj.header().signals();
        for Waiter { thread, mask } in woken {
            if obj.object_type() == ObjectType::Event {
                obj.header().clear_signals(word & mask);
            }
            self.wake_thread(thread, Status::Ok, word, None);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timeouts

    /// A deadline fired. If the thread is still blocked, pull it off
    /// its wait queue and wake it with `timed_out` (sleep wakes `ok`;
    /// arriving at the deadline is what it asked for).
    fn handle_timeout(&self, thread: Koid) {
        use crate::objects::BlockReason;

        let Some(obj) = self.objects.lock().get(thread) else {
            return;
        };
        let Some(cell) = obj.as_thread() else {
            return;
        };

        let reason = {
            let t = cell.lock();
            match t.state() {
                ThreadState::Blocked(reason) => reason,
                _ => return, // woke normally before the deadline fired
            }
        };

        match reason {
            BlockReason::Signal { object, .. } => {
                if let Some(target) = self.objects.lock().get(object) {
                    target.header().remove_waiter(thread);
                }
                self.wake_thread(thread, Status::TimedOut, 0, None);
            }
            BlockReason::Futex { key } => {
                self.futexes.lock().remove(key, thread);
                self.wake_thread(thread, Status::TimedOut, 0, None);
            }
            BlockReason::Mailbox { mailbox, role } => {
                self.cancel_mailbox_wait(thread, mailbox, role);
                self.wake_thread(thread, Status::TimedOut, 0, None);
            }
            BlockReason::Sleep => {
                self.wake_thread(thread, Status::Ok, 0, None);
            }
            BlockReason::Join { thread: target } => {
                if let Some(target_obj) = self.objects.lock().get(target) {
                    if let Some(target_cell) = target_obj.as_thread() {
                        target_cell.lock().remove_joiner(thread);
                    }
                }
                self.wake_thread(thread, Status::TimedOut, 0, None);
            }
        }
    }
}
