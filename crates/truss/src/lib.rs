mod actor;
mod directory;
mod error;
mod event;
mod reactor;
mod scheduler;
mod secure;
pub mod sockopt;

pub use actor::{AcceptStep, Action, Actor, IoStep};
pub use directory::{ActorId, Directory};
pub use error::{PostError, SchedulerError};
pub use event::{Event, EventFlags};
pub use mio;
pub use reactor::{ExecContext, MAX_ACCEPT_BATCH, SockId};
pub use scheduler::Scheduler;
pub use secure::{HandshakeStep, SecureSession};
