use std::any::Any;

use bitflags::bitflags;

bitflags! {
    /// Pending-event mask. The socket flags are read per socket through
    /// `socket_events`; the actor flags arrive in the mask handed to
    /// `execute`. Delivery is one-shot: flags are consumed at dispatch.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EventFlags: u32 {
        /// A pending receive (or accept retry) completed.
        const IN_DONE = 1;
        /// A pending send (or connect) completed.
        const OUT_DONE = 1 << 1;
        /// The armed receive-side deadline expired.
        const TIMEOUT_RECV = 1 << 2;
        /// The armed send-side deadline expired.
        const TIMEOUT_SEND = 1 << 3;
        /// The socket failed; the actor decides whether to close.
        const ERR_DONE = 1 << 4;

        /// The actor-level timer expired.
        const TIMER = 1 << 5;
        /// Posted events await in the mailbox.
        const RAISE = 1 << 6;
        /// Orderly-teardown request; finish up and return `Close`.
        const KILL = 1 << 7;
        /// Configuration changed upstream.
        const UPDATE = 1 << 8;
        /// First dispatch after registration.
        const START = 1 << 9;
    }
}

/// A message posted to an actor's mailbox, delivered on its reactor in
/// posting order.
pub struct Event {
    pub id: u32,
    pub data: Option<Box<dyn Any + Send>>,
}

impl Event {
    pub fn new(id: u32) -> Self {
        Self { id, data: None }
    }

    pub fn with(id: u32, data: impl Any + Send) -> Self {
        Self { id, data: Some(Box::new(data)) }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("id", &self.id).field("data", &self.data.is_some()).finish()
    }
}
