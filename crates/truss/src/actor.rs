use std::net::SocketAddr;

use crate::reactor::ExecContext;

/// What the reactor should do with the actor after a dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Run again next tick without waiting for events.
    Reschedule,
    /// Park until a socket completion, timer or posted event arrives. The
    /// actor must have at least one of those pending.
    Wait,
    /// Tear the actor down and drop its registration.
    Close,
}

/// Result of a per-socket operation. `Wait` means the reactor resumes the
/// operation when the socket becomes ready and reports completion through
/// the socket's event mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoStep {
    Done,
    Wait,
    Error,
}

/// Result of an accept attempt.
pub enum AcceptStep {
    Accepted(mio::net::TcpStream, SocketAddr),
    /// Backlog empty; an `IN_DONE` on the listener signals the next try.
    Wait,
    Error,
}

/// A single-threaded unit of work owning sockets and user state.
///
/// All actor code runs on the reactor hosting it; other parties interact
/// only by posting events. Within `execute` the actor drives its sockets
/// through the context, suspends by returning [`Action::Wait`] and ends
/// its life with [`Action::Close`].
pub trait Actor: Send {
    fn execute(&mut self, ctx: &mut ExecContext<'_>) -> Action;
}
