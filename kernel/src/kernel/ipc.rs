//! Mailbox, channel, and IRQ plumbing
//!
//! The mailbox exchange discipline lives here: staging handles out of
//! a sender's table, pairing callers with responders in strict FIFO
//! order, delivering with truncation against the receiver's declared
//! capacities, and unwinding half-done exchanges with `closed` when a
//! mailbox or a participant dies.

use alloc::sync::Arc;
use alloc::vec::Vec;

use j6::caps::Caps;
use j6::syslog::{Area, Severity};
use j6::{Handle, Koid, ObjectType, Status};

use crate::config::{MAILBOX_MAX_DATA, MAILBOX_MAX_HANDLES};
use crate::objects::{
    Body, ChannelEnd, Delivered, HandleEntry, InService, IrqBinding, Mailbox, MailboxRole,
    Message, Object, ParkedResponder, PendingCall, Waiter,
};
use crate::objects::channel::ChannelRing;
use crate::objects::thread::BlockReason;

use super::{Invocation, Kernel};

/// Capabilities granted on a freshly created mailbox handle.
pub const MAILBOX_DEFAULT_CAPS: Caps = Caps::from_bits_truncate(
    Caps::CLONE.bits()
        | Caps::TRANSFER.bits()
        | Caps::WAIT.bits()
        | Caps::MAILBOX_CALL.bits()
        | Caps::MAILBOX_RESPOND.bits(),
);

/// Capabilities granted on channel endpoint handles.
pub const CHANNEL_DEFAULT_CAPS: Caps = Caps::from_bits_truncate(
    Caps::CLONE.bits()
        | Caps::TRANSFER.bits()
        | Caps::WAIT.bits()
        | Caps::CHANNEL_SEND.bits()
        | Caps::CHANNEL_RECV.bits(),
);

/// Capabilities granted on an IRQ object handle.
pub const IRQ_DEFAULT_CAPS: Caps =
    Caps::from_bits_truncate(Caps::CLONE.bits() | Caps::TRANSFER.bits() | Caps::WAIT.bits());

impl Kernel {
    // ------------------------------------------------------------------
    // Mailboxes

    /// `mailbox_create`: a new mailbox with full capabilities.
    pub fn mailbox_create(&self, process: Koid) -> Result<Handle, Status> {
        self.create_object(
            process,
            Body::Mailbox(spin::Mutex::new(Mailbox::new())),
            MAILBOX_DEFAULT_CAPS,
        )
    }

    /// `mailbox_call`: send a request and block until the responder's
    /// reply arrives. `reply_data_cap` and `reply_handle_cap` are the
    /// caller's buffer capacities, used to truncate the reply.
    pub fn mailbox_call(
        &self,
        thread: Koid,
        process: Koid,
        handle: Handle,
        tag: u64,
        data: Vec<u8>,
        handles: &[Handle],
        reply_data_cap: usize,
        reply_handle_cap: usize,
    ) -> Result<Invocation<()>, Status> {
        if data.len() > MAILBOX_MAX_DATA || handles.len() > MAILBOX_MAX_HANDLES {
            return Err(Status::InvalidArg);
        }

        let entry = self.resolve_handle(process, handle, ObjectType::Mailbox, Caps::MAILBOX_CALL)?;
        let mb_obj = self.obj(entry.koid)?;
        let mb_cell = mb_obj.as_mailbox().ok_or(Status::Unexpected)?;
        let thread_obj = self.obj(thread)?;

        let staged = self.stage_handles(process, handles)?;

        let mut mb = mb_cell.lock();
        if mb.is_closed() {
            drop(mb);
            self.restore_staged(process, staged);
            return Err(Status::Closed);
        }

        let call = PendingCall {
            caller: Some(thread),
            caller_process: process,
            msg: Message::new(tag, data, staged),
            data_cap: reply_data_cap,
            handle_cap: reply_handle_cap,
        };

        // Park while holding the mailbox lock, so a responder on
        // another CPU cannot observe the queued call before the caller
        // is wakeable.
        self.park_thread(
            &thread_obj,
            BlockReason::Mailbox {
                mailbox: entry.koid,
                role: MailboxRole::Caller,
            },
            0,
        );

        if let Some(responder) = mb.take_responder() {
            // Immediate pairing: hand the request to the parked server
            mb.begin_service(InService {
                caller: call.caller,
                caller_process: call.caller_process,
                data_cap: call.data_cap,
                handle_cap: call.handle_cap,
            });
            drop(mb);

            self.deliver_to_thread(
                responder.thread,
                call.msg,
                responder.data_cap,
                responder.handle_cap,
            );
        } else {
            mb.queue_call(call);
        }

        Ok(Invocation::Block)
    }

    /// `mailbox_respond`: deliver a reply to the caller being served
    /// (if any), then pick up the next caller. With `block` set the
    /// server parks when no caller is pending; otherwise that case is
    /// `would_block`.
    pub fn mailbox_respond(
        &self,
        thread: Koid,
        process: Koid,
        handle: Handle,
        reply: Option<(u64, Vec<u8>, Vec<Handle>)>,
        data_cap: usize,
        handle_cap: usize,
        block: bool,
    ) -> Result<Invocation<Option<Delivered>>, Status> {
        let entry =
            self.resolve_handle(process, handle, ObjectType::Mailbox, Caps::MAILBOX_RESPOND)?;
        let mb_obj = self.obj(entry.koid)?;
        let mb_cell = mb_obj.as_mailbox().ok_or(Status::Unexpected)?;
        let thread_obj = self.obj(thread)?;

        if mb_cell.lock().is_closed() {
            return Err(Status::Closed);
        }

        // Phase one: deliver the pending reply
        if let Some((tag, data, reply_handles)) = reply {
            if data.len() > MAILBOX_MAX_DATA || reply_handles.len() > MAILBOX_MAX_HANDLES {
                return Err(Status::InvalidArg);
            }

            // Stage before ending service, so a bad reply handle
            // leaves the exchange intact for a retry
            let staged = self.stage_handles(process, &reply_handles)?;
            let serving = match mb_cell.lock().end_service() {
                Some(serving) => serving,
                None => {
                    self.restore_staged(process, staged);
                    return Err(Status::NotReady);
                }
            };
            let msg = Message::new(tag, data, staged);

            match serving.caller {
                Some(caller)
                    if self.thread_waits_on_mailbox(caller, entry.koid, MailboxRole::Caller) =>
                {
                    self.deliver_to_thread(caller, msg, serving.data_cap, serving.handle_cap);
                }
                _ => {
                    // IRQ message or a caller that died mid-exchange:
                    // the reply has nowhere to go
                    self.discard_message(msg);
                }
            }
        }

        // Phase two: pick up the next caller
        let mut mb = mb_cell.lock();
        if let Some(call) = mb.take_next_call() {
            mb.begin_service(InService {
                caller: call.caller,
                caller_process: call.caller_process,
                data_cap: call.data_cap,
                handle_cap: call.handle_cap,
            });
            drop(mb);

            let delivered = self.deliver_to_process(process, call.msg, data_cap, handle_cap);
            return Ok(Invocation::Complete(Some(delivered)));
        }

        if !block {
            return Err(Status::WouldBlock);
        }

        if !mb.set_responder(ParkedResponder {
            thread,
            data_cap,
            handle_cap,
        }) {
            // Another server thread already waits here
            return Err(Status::NotReady);
        }

        // Park under the mailbox lock; see mailbox_call
        self.park_thread(
            &thread_obj,
            BlockReason::Mailbox {
                mailbox: entry.koid,
                role: MailboxRole::Responder,
            },
            0,
        );
        drop(mb);
        Ok(Invocation::Block)
    }

    /// Remove `handles` from `process`'s table for transport. All-or-
    /// nothing: a bad or non-transferable handle restores everything.
    fn stage_handles(&self, process: Koid, handles: &[Handle]) -> Result<Vec<HandleEntry>, Status> {
        if handles.is_empty() {
            return Ok(Vec::new());
        }

        let proc_obj = self.obj_as(process, ObjectType::Process)?;
        let proc_cell = proc_obj.as_process().ok_or(Status::Unexpected)?;
        let mut proc = proc_cell.lock();

        let mut staged: Vec<HandleEntry> = Vec::with_capacity(handles.len());
        for &handle in handles {
            let ok = proc
                .handles
                .get(handle)
                .map(|e| e.caps.grants(Caps::TRANSFER))
                .unwrap_or(false);

            if !ok {
                let status = if proc.handles.get(handle).is_some() {
                    Status::Denied
                } else {
                    Status::InvalidArg
                };
                // Unwind: put the already staged entries back
                for entry in staged {
                    proc.handles.insert(entry.koid, entry.object_type, entry.caps);
                }
                return Err(status);
            }

            staged.push(proc.handles.remove(handle).unwrap());
        }
        Ok(staged)
    }

    /// Restore staged entries to their sender after a dead exchange.
    pub(crate) fn restore_staged(&self, process: Koid, entries: Vec<HandleEntry>) {
        if entries.is_empty() {
            return;
        }
        let Ok(proc_obj) = self.obj_as(process, ObjectType::Process) else {
            // The sender died too; the entries' references just drop
            for entry in entries {
                self.release(entry.koid);
            }
            return;
        };
        let Some(proc_cell) = proc_obj.as_process() else {
            return;
        };
        let mut proc = proc_cell.lock();
        for entry in entries {
            proc.handles.insert(entry.koid, entry.object_type, entry.caps);
        }
    }

    /// Drop an undeliverable message, closing its staged handles.
    fn discard_message(&self, msg: Message) {
        for entry in msg.handles {
            self.note_handle_removed(&entry);
            self.release(entry.koid);
        }
    }

    /// Deliver a message into a blocked thread: install its handles in
    /// the thread's process and wake it with the truncation-aware
    /// status.
    fn deliver_to_thread(&self, thread: Koid, msg: Message, data_cap: usize, handle_cap: usize) {
        let process = match self.obj(thread).ok().and_then(|o| {
            o.as_thread().map(|c| c.lock().process())
        }) {
            Some(p) => p,
            None => {
                self.discard_message(msg);
                return;
            }
        };

        let delivered = self.deliver_to_process(process, msg, data_cap, handle_cap);
        let status = if delivered.truncated {
            Status::Insufficient
        } else {
            Status::Ok
        };
        self.wake_thread(thread, status, 0, Some(delivered));
    }

    /// Install a message's staged handles into `process` and truncate
    /// the payload to the receiver's capacities.
    fn deliver_to_process(
        &self,
        process: Koid,
        mut msg: Message,
        data_cap: usize,
        handle_cap: usize,
    ) -> Delivered {
        let mut truncated = false;

        if msg.data.len() > data_cap {
            msg.data.truncate(data_cap);
            truncated = true;
        }

        let mut entries = msg.handles;
        if entries.len() > handle_cap {
            // Excess handles cannot be delivered; their references
            // close rather than leak
            for entry in entries.drain(handle_cap..) {
                self.note_handle_removed(&entry);
                self.release(entry.koid);
            }
            truncated = true;
        }

        let mut handles = Vec::with_capacity(entries.len());
        if let Ok(proc_obj) = self.obj_as(process, ObjectType::Process) {
            if let Some(proc_cell) = proc_obj.as_process() {
                let mut proc = proc_cell.lock();
                for entry in entries {
                    handles.push(proc.handles.insert(entry.koid, entry.object_type, entry.caps));
                }
            }
        }

        Delivered {
            tag: msg.tag,
            data: msg.data,
            handles,
            truncated,
        }
    }

    /// True if `thread` is still parked on `mailbox` in `role`.
    fn thread_waits_on_mailbox(&self, thread: Koid, mailbox: Koid, role: MailboxRole) -> bool {
        let Ok(obj) = self.obj(thread) else {
            return false;
        };
        let Some(cell) = obj.as_thread() else {
            return false;
        };
        let result = matches!(
            cell.lock().block_reason(),
            Some(BlockReason::Mailbox { mailbox: mb, role: r }) if mb == mailbox && r == role
        );
        result
    }

    /// Pull a killed or cancelled thread out of a mailbox's queues,
    /// returning any staged handles to its process.
    pub(crate) fn cancel_mailbox_wait(&self, thread: Koid, mailbox: Koid, role: MailboxRole) {
        let Ok(mb_obj) = self.obj(mailbox) else {
            return;
        };
        let Some(mb_cell) = mb_obj.as_mailbox() else {
            return;
        };

        match role {
            MailboxRole::Caller => {
                let removed = {
                    let mut mb = mb_cell.lock();
                    let removed = mb.remove_caller(thread);
                    if removed.is_none() {
                        // Not queued: the thread may be mid-service
                        mb.orphan_served_caller(thread);
                    }
                    removed
                };
                if let Some(call) = removed {
                    self.restore_staged(call.caller_process, call.msg.handles);
                }
            }
            MailboxRole::Responder => {
                mb_cell.lock().remove_responder(thread);
            }
        }
    }

    /// Close a mailbox: wake everything it holds with `closed`.
    /// Queued callers get their staged handles back; S-parked state
    /// unwinds completely.
    pub(crate) fn close_mailbox(&self, mb_obj: &Arc<Object>) {
        let Some(mb_cell) = mb_obj.as_mailbox() else {
            return;
        };

        let (calls, responder, serving) = mb_cell.lock().close();

        for call in calls {
            self.restore_staged(call.caller_process, call.msg.handles);
            if let Some(caller) = call.caller {
                self.wake_thread(caller, Status::Closed, 0, None);
            }
        }

        if let Some(parked) = responder {
            self.wake_thread(parked.thread, Status::Closed, 0, None);
        }

        if let Some(serving) = serving {
            if let Some(caller) = serving.caller {
                self.wake_thread(caller, Status::Closed, 0, None);
            }
        }

        self.log(Area::Ipc, Severity::Verbose, "mailbox closed");
    }

    /// Destruction teardown for mailboxes.
    pub(crate) fn teardown_mailbox(&self, obj: &Arc<Object>) {
        self.close_mailbox(obj);
    }

    // ------------------------------------------------------------------
    // Channels

    /// `channel_create`: two endpoints over two ring VMAs. Each
    /// endpoint handle covers one direction; transfer one to the peer
    /// process to establish the link.
    pub fn channel_create(&self, process: Koid, size: usize) -> Result<(Handle, Handle), Status> {
        let ring_a = ChannelRing::new(size)?;
        let ring_b = ChannelRing::new(size)?;

        // Each endpoint's ring VMA; user space maps these to drive the
        // rings directly
        let vma_a = self.ring_vma(size);
        let vma_b = self.ring_vma(size);

        let (end_a, end_b) = {
            let mut objects = self.objects.lock();
            let a = objects.insert(
                Body::Channel(spin::Mutex::new(ChannelEnd::new(vma_a, ring_a))),
                1,
            );
            let b = objects.insert(
                Body::Channel(spin::Mutex::new(ChannelEnd::new(vma_b, ring_b))),
                1,
            );
            (a, b)
        };

        end_a.as_channel().unwrap().lock().set_peer(end_b.koid());
        end_b.as_channel().unwrap().lock().set_peer(end_a.koid());

        // Empty rings can always accept writes
        end_a.header().assert_signals(j6::signals::CHANNEL_CAN_SEND);
        end_b.header().assert_signals(j6::signals::CHANNEL_CAN_SEND);

        let proc_obj = self.obj_as(process, ObjectType::Process)?;
        let proc_cell = proc_obj.as_process().ok_or(Status::Unexpected)?;
        let mut proc = proc_cell.lock();
        let h_a = proc
            .handles
            .insert(end_a.koid(), ObjectType::Channel, CHANNEL_DEFAULT_CAPS);
        let h_b = proc
            .handles
            .insert(end_b.koid(), ObjectType::Channel, CHANNEL_DEFAULT_CAPS);

        Ok((h_a, h_b))
    }

    fn ring_vma(&self, size: usize) -> Koid {
        use crate::objects::{Vma, VmaFlags};
        let pages = crate::memory::page_count(size);
        self.objects
            .lock()
            .insert(
                Body::Vma(spin::Mutex::new(Vma::anonymous(
                    pages,
                    VmaFlags::WRITE | VmaFlags::RING,
                ))),
                1,
            )
            .koid()
    }

    /// Write into an endpoint's send ring. `WouldBlock` when the ring
    /// is too full; `Closed` when the peer is gone.
    pub fn channel_send(&self, process: Koid, handle: Handle, bytes: &[u8]) -> Result<(), Status> {
        let entry =
            self.resolve_handle(process, handle, ObjectType::Channel, Caps::CHANNEL_SEND)?;
        let end_obj = self.obj(entry.koid)?;
        let end_cell = end_obj.as_channel().ok_or(Status::Unexpected)?;

        let (peer, result, full) = {
            let mut end = end_cell.lock();
            if end.peer() == 0 {
                return Err(Status::Closed);
            }
            let result = end.ring.write(bytes);
            (end.peer(), result, end.ring.write_available() == 0)
        };
        result?;

        if full {
            end_obj.header().clear_signals(j6::signals::CHANNEL_CAN_SEND);
        }

        // Data is now readable on the peer's receive side
        if let Ok(peer_obj) = self.obj(peer) {
            let woken = peer_obj.header().assert_signals(j6::signals::CHANNEL_CAN_RECV);
            let word = peer_obj.header().signals();
            for Waiter { thread, .. } in woken {
                self.wake_thread(thread, Status::Ok, word, None);
            }
        }
        Ok(())
    }

    /// Read from an endpoint's receive side (the peer's ring).
    /// Returns the bytes read; 0 with `WouldBlock` when nothing is
    /// pending.
    pub fn channel_recv(
        &self,
        process: Koid,
        handle: Handle,
        buf: &mut [u8],
    ) -> Result<usize, Status> {
        let entry =
            self.resolve_handle(process, handle, ObjectType::Channel, Caps::CHANNEL_RECV)?;
        let end_obj = self.obj(entry.koid)?;
        let end_cell = end_obj.as_channel().ok_or(Status::Unexpected)?;

        let peer = {
            let end = end_cell.lock();
            if end.peer() == 0 {
                return Err(Status::Closed);
            }
            end.peer()
        };

        let peer_obj = self.obj(peer)?;
        let peer_cell = peer_obj.as_channel().ok_or(Status::Unexpected)?;

        let (n, drained) = {
            let mut peer_end = peer_cell.lock();
            if peer_end.ring.is_empty() {
                return Err(Status::WouldBlock);
            }
            let n = peer_end.ring.read(buf);
            (n, peer_end.ring.is_empty())
        };

        if drained {
            end_obj.header().clear_signals(j6::signals::CHANNEL_CAN_RECV);
        }

        // Space opened up on the peer's send side
        let woken = peer_obj.header().assert_signals(j6::signals::CHANNEL_CAN_SEND);
        let word = peer_obj.header().signals();
        for Waiter { thread, .. } in woken {
            self.wake_thread(thread, Status::Ok, word, None);
        }

        Ok(n)
    }

    /// Destruction teardown: sever the peer link and drop the ring
    /// VMA reference.
    pub(crate) fn teardown_channel(&self, obj: &Arc<Object>) {
        let Some(cell) = obj.as_channel() else {
            return;
        };
        let (peer, vma) = {
            let end = cell.lock();
            (end.peer(), end.vma())
        };

        if peer != 0 {
            if let Ok(peer_obj) = self.obj(peer) {
                if let Some(peer_cell) = peer_obj.as_channel() {
                    peer_cell.lock().clear_peer();
                }
            }
        }

        self.release(vma);
    }

    // ------------------------------------------------------------------
    // IRQ delivery

    /// `system_bind_irq`: bind a hardware vector to a mailbox. The
    /// resulting IRQ object owns an internal reference to the mailbox;
    /// a vector can be bound only once.
    pub fn system_bind_irq(
        &self,
        process: Koid,
        sys_handle: Handle,
        vector: u16,
        mailbox_handle: Handle,
    ) -> Result<Handle, Status> {
        self.resolve_handle(process, sys_handle, ObjectType::System, Caps::SYSTEM_BIND_IRQ)?;
        let mb_entry = self.resolve_handle(
            process,
            mailbox_handle,
            ObjectType::Mailbox,
            Caps::MAILBOX_RESPOND,
        )?;

        let mut irqs = self.irqs.lock();
        if irqs.contains_key(&vector) {
            return Err(Status::Collision);
        }

        // The binding holds the mailbox alive
        self.retain(mb_entry.koid);

        let handle = match self.create_object(
            process,
            Body::Irq(spin::Mutex::new(IrqBinding::new(vector, mb_entry.koid))),
            IRQ_DEFAULT_CAPS,
        ) {
            Ok(handle) => handle,
            Err(status) => {
                self.release(mb_entry.koid);
                return Err(status);
            }
        };

        let irq_koid = {
            let proc_obj = self.obj_as(process, ObjectType::Process)?;
            let proc_cell = proc_obj.as_process().ok_or(Status::Unexpected)?;
            let proc = proc_cell.lock();
            proc.handles.get(handle).ok_or(Status::Unexpected)?.koid
        };
        irqs.insert(vector, irq_koid);

        self.log(Area::Ipc, Severity::Info, "bound irq vector to mailbox");
        Ok(handle)
    }

    /// A hardware vector fired: deliver its message to the bound
    /// mailbox. Called from the interrupt path with the vector already
    /// acknowledged.
    pub fn irq_fire(&self, vector: u16) -> Result<(), Status> {
        let irq_koid = *self.irqs.lock().get(&vector).ok_or(Status::NotReady)?;
        let irq_obj = self.obj(irq_koid)?;
        let mailbox = irq_obj
            .as_irq()
            .map(|cell| cell.lock().mailbox())
            .ok_or(Status::Unexpected)?;

        let mb_obj = self.obj(mailbox)?;
        let mb_cell = mb_obj.as_mailbox().ok_or(Status::Unexpected)?;

        let msg = Message::from_irq(vector);
        let mut mb = mb_cell.lock();
        if mb.is_closed() {
            return Err(Status::Closed);
        }

        if let Some(responder) = mb.take_responder() {
            mb.begin_service(InService {
                caller: None,
                caller_process: 0,
                data_cap: 0,
                handle_cap: 0,
            });
            drop(mb);
            self.deliver_to_thread(responder.thread, msg, responder.data_cap, responder.handle_cap);
        } else {
            mb.queue_call(PendingCall {
                caller: None,
                caller_process: 0,
                msg,
                data_cap: 0,
                handle_cap: 0,
            });
        }
        Ok(())
    }

    /// Destruction teardown: unbind the vector and drop the mailbox
    /// reference.
    pub(crate) fn teardown_irq(&self, obj: &Arc<Object>) {
        let Some(cell) = obj.as_irq() else {
            return;
        };
        let (vector, mailbox) = {
            let irq = cell.lock();
            (irq.vector(), irq.mailbox())
        };
        self.irqs.lock().remove(&vector);
        self.release(mailbox);
    }
}
