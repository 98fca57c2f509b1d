//! Mailbox objects
//!
//! A mailbox is a single-slot synchronous rendezvous point. Callers
//! queue in FIFO order, each carrying a tag, a data buffer, and staged
//! handles; a responder picks up the front caller, serves it, and its
//! next respond delivers the reply to that same caller. Either both
//! sides observe an exchange or neither does: handles staged into a
//! message return to their sender if the exchange dies.
//!
//! This type is the mailbox's state machine only. Blocking, wake-ups,
//! and handle-table edits are driven by the kernel root, which holds
//! the pairing discipline together with the scheduler.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use j6::{Handle, Koid};

use super::handles::HandleEntry;

/// A message in flight: tag, bytes, and staged handle entries.
///
/// Staged entries have already been removed from the sender's handle
/// table; the object references they carry stay owned by the message
/// until delivery or abort.
#[derive(Debug, Default)]
pub struct Message {
    pub tag: u64,
    pub data: Vec<u8>,
    pub handles: Vec<HandleEntry>,
}

impl Message {
    pub fn new(tag: u64, data: Vec<u8>, handles: Vec<HandleEntry>) -> Self {
        Self { tag, data, handles }
    }

    /// An IRQ delivery: tag only, no payload.
    pub fn from_irq(vector: u16) -> Self {
        Self {
            tag: j6::tags::from_irq(vector),
            data: Vec::new(),
            handles: Vec::new(),
        }
    }
}

/// A message as it lands in a receiver: handles have become handle
/// values in the receiver's table, and truncation against the
/// receiver's capacities has been applied.
#[derive(Debug, Default)]
pub struct Delivered {
    pub tag: u64,
    pub data: Vec<u8>,
    pub handles: Vec<Handle>,
    /// True when data or handles were cut to fit the receiver's
    /// capacities; surfaces as `insufficient`
    pub truncated: bool,
}

/// A queued call waiting for a responder.
#[derive(Debug)]
pub struct PendingCall {
    /// The blocked calling thread; `None` for kernel-injected IRQ
    /// messages, which expect no reply
    pub caller: Option<Koid>,

    /// The calling thread's process, for returning staged handles if
    /// the exchange dies
    pub caller_process: Koid,

    pub msg: Message,

    /// The caller's reply buffer capacities, for truncation
    pub data_cap: usize,
    pub handle_cap: usize,
}

/// Mailbox state.
pub struct Mailbox {
    /// Callers in arrival order, not yet picked up
    callers: VecDeque<PendingCall>,

    /// The caller whose request a responder has picked up and not yet
    /// answered, with the reply capacities it registered
    in_service: Option<InService>,

    /// A responder blocked waiting for a caller to arrive
    responder: Option<ParkedResponder>,

    /// Live handles granting `MAILBOX_RESPOND`; the mailbox closes
    /// when the last one goes away
    respond_handles: u32,

    closed: bool,
}

/// The caller currently being served.
#[derive(Debug, Clone, Copy)]
pub struct InService {
    /// `None` for an IRQ message: the reply is discarded
    pub caller: Option<Koid>,
    pub caller_process: Koid,
    pub data_cap: usize,
    pub handle_cap: usize,
}

/// A responder parked waiting for a caller, with the receive
/// capacities its buffers can take.
#[derive(Debug, Clone, Copy)]
pub struct ParkedResponder {
    pub thread: Koid,
    pub data_cap: usize,
    pub handle_cap: usize,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            callers: VecDeque::new(),
            in_service: None,
            responder: None,
            respond_handles: 0,
            closed: false,
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Account a new handle granting `MAILBOX_RESPOND`.
    pub fn add_respond_handle(&mut self) {
        self.respond_handles += 1;
    }

    /// Drop a respond-capable handle. Returns true when it was the
    /// last one and the mailbox must close.
    #[must_use]
    pub fn remove_respond_handle(&mut self) -> bool {
        self.respond_handles = self.respond_handles.saturating_sub(1);
        self.respond_handles == 0 && !self.closed
    }

    /// Queue a call at the back of the FIFO.
    pub fn queue_call(&mut self, call: PendingCall) {
        self.callers.push_back(call);
    }

    /// Take the front caller for service.
    pub fn take_next_call(&mut self) -> Option<PendingCall> {
        self.callers.pop_front()
    }

    #[inline]
    pub fn has_callers(&self) -> bool {
        !self.callers.is_empty()
    }

    #[inline]
    pub fn caller_count(&self) -> usize {
        self.callers.len()
    }

    /// Remove a specific queued caller (kill or cancellation).
    pub fn remove_caller(&mut self, thread: Koid) -> Option<PendingCall> {
        let pos = self
            .callers
            .iter()
            .position(|c| c.caller == Some(thread))?;
        self.callers.remove(pos)
    }

    /// Record the caller a responder just picked up.
    pub fn begin_service(&mut self, serving: InService) {
        debug_assert!(self.in_service.is_none(), "mailbox already serving a call");
        self.in_service = Some(serving);
    }

    /// Complete service, returning the caller owed the reply.
    pub fn end_service(&mut self) -> Option<InService> {
        self.in_service.take()
    }

    #[inline]
    pub fn serving(&self) -> Option<InService> {
        self.in_service
    }

    /// True if a reply currently has a destination.
    #[inline]
    pub fn is_serving(&self) -> bool {
        self.in_service.is_some()
    }

    /// Park a responder. At most one responder may wait.
    pub fn set_responder(&mut self, responder: ParkedResponder) -> bool {
        if self.responder.is_some() {
            return false;
        }
        self.responder = Some(responder);
        true
    }

    /// Take a parked responder for wake-up.
    pub fn take_responder(&mut self) -> Option<ParkedResponder> {
        self.responder.take()
    }

    /// Remove a specific parked responder (kill path).
    pub fn remove_responder(&mut self, thread: Koid) -> bool {
        if self.responder.map(|r| r.thread) == Some(thread) {
            self.responder = None;
            true
        } else {
            false
        }
    }

    /// Break the link to a caller that died while being served; the
    /// eventual reply is discarded.
    pub fn orphan_served_caller(&mut self, thread: Koid) -> bool {
        if let Some(serving) = &mut self.in_service {
            if serving.caller == Some(thread) {
                serving.caller = None;
                return true;
            }
        }
        false
    }

    /// Close the mailbox: no further exchanges. Returns everything
    /// that was parked so the caller can unwind it: the queued calls,
    /// the parked responder, and the caller mid-service.
    pub fn close(&mut self) -> (VecDeque<PendingCall>, Option<ParkedResponder>, Option<InService>) {
        self.closed = true;
        (
            core::mem::take(&mut self.callers),
            self.responder.take(),
            self.in_service.take(),
        )
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mailbox")
            .field("callers", &self.callers.len())
            .field("in_service", &self.in_service)
            .field("responder", &self.responder)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn call_from(thread: Koid, tag: u64) -> PendingCall {
        PendingCall {
            caller: Some(thread),
            caller_process: 1,
            msg: Message::new(tag, vec![0xaa], Vec::new()),
            data_cap: 64,
            handle_cap: 4,
        }
    }

    #[test]
    fn callers_are_fifo() {
        let mut mb = Mailbox::new();
        mb.queue_call(call_from(1, 100));
        mb.queue_call(call_from(2, 200));
        mb.queue_call(call_from(3, 300));

        assert_eq!(mb.take_next_call().unwrap().caller, Some(1));
        assert_eq!(mb.take_next_call().unwrap().caller, Some(2));
        assert_eq!(mb.take_next_call().unwrap().caller, Some(3));
        assert!(mb.take_next_call().is_none());
    }

    #[test]
    fn service_cycle() {
        let mut mb = Mailbox::new();
        mb.queue_call(call_from(7, 42));

        let call = mb.take_next_call().unwrap();
        mb.begin_service(InService {
            caller: call.caller,
            caller_process: call.caller_process,
            data_cap: call.data_cap,
            handle_cap: call.handle_cap,
        });
        assert!(mb.is_serving());
        assert_eq!(mb.end_service().unwrap().caller, Some(7));
        assert!(!mb.is_serving());
    }

    fn parked(thread: Koid) -> ParkedResponder {
        ParkedResponder {
            thread,
            data_cap: 64,
            handle_cap: 4,
        }
    }

    #[test]
    fn only_one_responder_may_park() {
        let mut mb = Mailbox::new();
        assert!(mb.set_responder(parked(5)));
        assert!(!mb.set_responder(parked(6)));
        assert_eq!(mb.take_responder().unwrap().thread, 5);
        assert!(mb.set_responder(parked(6)));
    }

    #[test]
    fn close_returns_all_parked_state() {
        let mut mb = Mailbox::new();
        mb.queue_call(call_from(1, 1));
        mb.queue_call(call_from(2, 2));
        mb.set_responder(parked(9));
        mb.begin_service(InService {
            caller: Some(3),
            caller_process: 1,
            data_cap: 0,
            handle_cap: 0,
        });

        let (calls, responder, serving) = mb.close();
        assert_eq!(calls.len(), 2);
        assert_eq!(responder.unwrap().thread, 9);
        assert_eq!(serving.unwrap().caller, Some(3));
        assert!(mb.is_closed());
    }

    #[test]
    fn last_respond_handle_triggers_close() {
        let mut mb = Mailbox::new();
        mb.add_respond_handle();
        mb.add_respond_handle();
        assert!(!mb.remove_respond_handle());
        assert!(mb.remove_respond_handle());
    }

    #[test]
    fn irq_messages_have_no_caller() {
        let msg = Message::from_irq(0x30);
        assert_eq!(msg.tag, 0xffff_ffff_ffff_0030);
        assert!(msg.data.is_empty());
        assert!(msg.handles.is_empty());
    }
}
