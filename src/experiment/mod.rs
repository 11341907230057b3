//! Plan execution with suspenders.
//!
//! - **Plans** ([`plan`]): lazy instruction streams, with a stack for injected
//!   sub-sequences.
//! - **RunEngine** ([`run_engine`]): state machine that executes plans, honours
//!   checkpoints and rewindable sections, and reacts to pause, suspend and
//!   stop requests.
//! - **Suspenders** ([`suspenders`]): monitored conditions that hold the plan
//!   until a signal returns to its good region and settles.
//! - **Documents** ([`document`]): start/descriptor/event/stop records emitted
//!   as side effects of `open_run`, `create`/`read`/`save` and `close_run`.
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_relay::experiment::{Msg, RunEngine, Suspender};
//!
//! let mut engine = RunEngine::new();
//! let beam = SoftSignal::new("ring_current", 400.0);
//! engine.install_suspender(&Arc::new(Suspender::floor(beam.shared(), 300.0)))?;
//!
//! let outcome = engine
//!     .run(vec![Msg::open_run(), Msg::checkpoint(), Msg::sleep(dwell), Msg::close_run()])
//!     .await?;
//! ```

pub mod document;
pub mod msg;
pub mod plan;
pub mod run_engine;
pub mod suspenders;

pub use document::{
    DataKey, DescriptorDoc, Document, DocumentKind, EventDoc, ExitStatus, StartDoc, StopDoc,
};
pub use msg::{Awaitable, Command, Msg};
pub use plan::{plan, Plan, PlanStack};
pub use run_engine::{
    EngineHandle, EngineId, EngineState, MsgHook, RunEngine, RunOptions, RunOutcome,
    SuspenderHandle,
};
pub use suspenders::{SuspendRule, Suspender, SuspenderId};
