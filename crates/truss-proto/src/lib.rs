mod logger;
mod reader;
mod writer;

pub use logger::Transcript;
pub use reader::Reader;
pub use writer::{ManageOp, Writer};

/// Outcome of one state-machine step, and of a full [`Writer::run`] /
/// [`Reader::run`] pass.
///
/// - `Success`: frame done, pop and continue; from `run`: the stack is
///   empty and every buffered byte was handed over.
/// - `Wait`: blocked on the channel; re-run when it is ready again.
/// - `Continue`: the frame transformed itself into a different next step;
///   re-invoke immediately (never escapes `run`).
/// - `Yield`: give other work a turn; the frame stays.
/// - `Failure`: malformed exchange, the connection is doomed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Wait,
    Continue,
    Yield,
    Failure,
}
