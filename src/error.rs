//! Error types for the run engine and the document relay.
//!
//! Errors are split by concern, each built with `thiserror`:
//!
//! - **`EngineError`**: state-machine misuse (running a busy engine, double
//!   installation of a suspender) and the distinguished
//!   [`RunEngineInterrupted`] control-flow error surfaced when a caller asks
//!   for strict interruption reporting.
//! - **`TransportError`**: socket setup and teardown for the Publisher, Proxy
//!   and RemoteDispatcher. Setup failures are fatal and propagate immediately.
//! - **`WireError`**: a broadcast record that cannot be parsed. Receivers log
//!   and discard these; they never stop a receive loop.
//!
//! Suspender trips and settle waits are control flow, not errors.

use crate::experiment::run_engine::EngineState;
use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Raised when a run halts before completing and the caller demanded
/// completion-or-error semantics.
///
/// When `state` is [`EngineState::Paused`] the engine still holds the
/// remainder of the plan and `RunEngine::resume` continues it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("RunEngine interrupted while {state}: {reason}")]
pub struct RunEngineInterrupted {
    /// Engine state at the moment the run call returned.
    pub state: EngineState,
    /// Human-readable cause (pause request, stop during suspension, ...).
    pub reason: String,
}

impl RunEngineInterrupted {
    /// Whether the interrupted run can be continued with `resume()`.
    pub fn is_resumable(&self) -> bool {
        self.state == EngineState::Paused
    }
}

/// Run engine errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The operation is not allowed in the current state.
    #[error("RunEngine is {current}; {operation} requires {expected}")]
    InvalidState {
        /// Rejected operation.
        operation: &'static str,
        /// State the engine was in.
        current: EngineState,
        /// State the operation needs.
        expected: &'static str,
    },

    /// The run halted early under strict options.
    #[error(transparent)]
    Interrupted(#[from] RunEngineInterrupted),

    /// A suspender can be installed on one engine at a time.
    #[error("Suspender '{name}' is already installed on engine {owner}")]
    AlreadyInstalled {
        /// Suspender id.
        name: String,
        /// Engine that holds it.
        owner: String,
    },

    /// The handle does not belong to this engine or was already removed.
    #[error("Suspender is not installed on this engine")]
    NotInstalled,

    /// Band suspenders need `lower < upper`.
    #[error("Invalid band: lower bound {lower} must be below upper bound {upper}")]
    InvalidBand {
        /// Requested lower bound.
        lower: f64,
        /// Requested upper bound.
        upper: f64,
    },

    /// `read` without a target signal.
    #[error("Instruction '{0}' requires a target signal")]
    MissingTarget(&'static str),

    /// An instruction out of order, such as a second `open_run`.
    #[error("Illegal instruction sequence: '{command}' {reason}")]
    IllegalSequence {
        /// Offending instruction.
        command: &'static str,
        /// What made it illegal.
        reason: &'static str,
    },

    /// Called outside a Tokio runtime.
    #[error("No Tokio runtime available to spawn {0}")]
    NoRuntime(&'static str),
}

/// Socket errors from the relay components.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Not a `host:port` string.
    #[error("Invalid relay address '{0}': expected \"host:port\"")]
    Address(String),

    /// A listener could not be bound.
    #[error("Failed to bind {role} socket on port {port}: {source}")]
    Bind {
        /// `collection` or `broadcast`.
        role: &'static str,
        /// Requested port, 0 for any.
        port: u16,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The relay endpoint refused the connection.
    #[error("Failed to connect to relay at {address}: {source}")]
    Connect {
        /// Endpoint that was dialled.
        address: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Other socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The proxy already ran once.
    #[error("{0} has already been started and interrupted; create a fresh instance")]
    ProxyClosed(String),

    /// Called outside a Tokio runtime.
    #[error("No Tokio runtime available to spawn {0}")]
    NoRuntime(&'static str),
}

/// Broadcast record parse errors.
#[derive(Error, Debug)]
pub enum WireError {
    /// Fewer than five fields.
    #[error("Wire record is missing the {0} field")]
    MissingField(&'static str),

    /// The kind field is not a known document kind.
    #[error("Unknown document kind '{0}'")]
    UnknownKind(String),

    /// The pid field is not a number.
    #[error("Invalid process id '{0}'")]
    BadPid(String),

    /// The payload is not a valid document.
    #[error("Invalid document payload: {0}")]
    Payload(#[from] serde_json::Error),
}
