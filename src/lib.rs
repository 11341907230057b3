//! Suspendable plan execution and best-effort document distribution.
//!
//! A [`RunEngine`] executes a plan (a lazy stream of [`Msg`] instructions)
//! while installed [`Suspender`]s watch [`Signal`]s and hold the plan whenever
//! a monitored condition goes bad. Every document the engine emits is fanned
//! out to local subscribers through a [`Dispatcher`] and, optionally, to other
//! processes through a [`Publisher`] → [`Proxy`] → [`RemoteDispatcher`] relay.

pub mod config;
pub mod distribution;
pub mod error;
pub mod experiment;
pub mod logging;
pub mod signal;

pub use config::RelayConfig;
pub use distribution::{Dispatcher, OriginFilter, Proxy, Publisher, RemoteDispatcher};
pub use error::{EngineError, RunEngineInterrupted, TransportError, WireError};
pub use experiment::{
    Awaitable, Command, Document, DocumentKind, EngineHandle, EngineState, Msg, RunEngine,
    RunOptions, RunOutcome, Suspender,
};
pub use signal::{Signal, SoftSignal};
