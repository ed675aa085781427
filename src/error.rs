//! Error taxonomy and lifecycle states shared by the whole crate.
//!
//! Every fallible public call returns [`Result`]. Back-pressure outcomes
//! ([`PipelineError::PortFullDiscarded`], [`PipelineError::PortFullTimeout`])
//! are returned to the producer, which decides whether to retry or drop;
//! topology errors abort [`Pipeline::prepare`](crate::Pipeline::prepare) and
//! leave the pipeline idle.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Lifecycle state of a port, a node or the pipeline itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Idle = 0,
    Initialized = 1,
    Running = 2,
    Paused = 3,
    Stop = 4,
}

impl State {
    pub(crate) fn from_u8(value: u8) -> State {
        match value {
            1 => State::Initialized,
            2 => State::Running,
            3 => State::Paused,
            4 => State::Stop,
            _ => State::Idle,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Generic failure, returned by blocking calls that observe a stop.
    #[error("operation failed")]
    Failure,

    /// The blob was dropped because the target queue was full and the port
    /// uses [`PortPolicy::DiscardIfFull`](crate::port::PortPolicy).
    #[error("blob discarded on full port queue")]
    PortFullDiscarded,

    /// The push timed out waiting for space on a full queue.
    #[error("timed out waiting for space on a full port queue")]
    PortFullTimeout,

    /// The out-port has no bound successor.
    #[error("out-port is not linked to any in-port")]
    PortNotLinked,

    #[error("port index {0} out of range")]
    PortOutOfRange(usize),

    #[error("a node named `{0}` already exists in the pipeline")]
    DuplicateNode(String),

    #[error("no node named `{0}` in the pipeline")]
    NodeNotFound(String),

    #[error("in-port {port} of node `{node}` has no upstream link")]
    UnboundInPort { node: String, port: usize },

    #[error("in-port {port} of node `{node}` has more than one upstream link")]
    AmbiguousInPort { node: String, port: usize },

    /// The worker pool of a stream-batched node does not match
    /// `stream_num * thread_num_per_batch`.
    #[error("node `{node}` spawns {actual} workers but its batching config requires {expected}")]
    WorkerPoolMismatch {
        node: String,
        expected: usize,
        actual: usize,
    },

    #[error("event {0:#x} is not registered")]
    EventNotFound(u64),

    #[error("failed to register event {0:#x}")]
    EventRegisterFailed(u64),

    /// One or more event callbacks returned an error. The remaining
    /// callbacks still ran and waiters were still released.
    #[error("{failed} of {total} callbacks failed")]
    CallbackFail { failed: usize, total: usize },

    /// `Blob::get` with a (payload, meta) pair different from the stored one.
    #[error("buffer {index} holds `{stored}`, requested `{requested}`")]
    TypeMismatch {
        index: usize,
        stored: String,
        requested: &'static str,
    },

    #[error("blob has no buffer at index {0}")]
    NoSuchBuffer(usize),

    #[error("no conversion registered from `{from}` to `{to}`")]
    NoConversion { from: String, to: String },

    /// A blocking call observed the stop signal.
    #[error("operation interrupted by pipeline stop")]
    Stopped,

    #[error("invalid pipeline state: {0}")]
    InvalidState(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        for state in [
            State::Idle,
            State::Initialized,
            State::Running,
            State::Paused,
            State::Stop,
        ] {
            assert_eq!(State::from_u8(state as u8), state);
        }
    }
}
