//! RunEngine: suspendable plan execution.
//!
//! The engine draws instructions from a [`PlanStack`] one at a time and
//! executes them on the calling task. After every instruction it drains
//! pending control requests and polls every installed [`Suspender`].
//! Long-running instructions (`sleep`, `wait_for`) race against the control
//! channel, so a trip, pause or stop takes effect without waiting for them.
//!
//! # States
//!
//! ```text
//! idle ──run──▶ running ──trip──▶ suspending ──clear──▶ running ──end──▶ idle
//!                  │  ▲                 │
//!           pause  │  │ resume          │ queued pause
//!                  ▼  │                 ▼
//!                 paused ◀──────────────┘
//! ```
//!
//! `pausing` marks a pause that waits for a checkpoint (deferred) or for a
//! suspension to clear. `aborting` is the transient state while a stopped run
//! is torn down.
//!
//! # Resume point
//!
//! An interrupted `sleep`/`wait_for` is dispatched again when the plan
//! continues. Inside a `rewindable(false)` section the engine instead replays
//! everything since the last checkpoint. Between `clear_checkpoint` and the
//! next `checkpoint` the engine cannot suspend: suspender trips wait for the
//! next checkpoint and direct suspend requests become a pause.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut engine = RunEngine::new();
//! let handle = engine.handle();
//! engine.install_suspender(&Arc::new(Suspender::bool_high(interlock.shared())))?;
//!
//! tokio::spawn(async move {
//!     tokio::time::sleep(Duration::from_secs(5)).await;
//!     handle.request_pause(false);
//! });
//!
//! if engine.run(plan).await? == RunOutcome::Paused {
//!     engine.resume().await?;
//! }
//! ```

use super::document::{
    now_ns, DataKey, DescriptorDoc, Document, DocumentKind, EventDoc, ExitStatus, StartDoc,
    StopDoc,
};
use super::msg::{Awaitable, Command, Msg};
use super::plan::{plan, PlanStack};
use super::suspenders::{suspension_block, Suspender, SuspenderId, INJECTED_KEY, WAIT_KEY};
use crate::distribution::dispatcher::{CallbackFailure, Dispatcher, Subscription, Token};
use crate::error::{EngineError, EngineResult, RunEngineInterrupted};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Identity of one engine, stamped on every published document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineId(Uuid);

impl EngineId {
    /// Random identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EngineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EngineId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a [`RunEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No plan loaded.
    Idle,
    /// Executing instructions.
    Running,
    /// A deferred pause is waiting for the next checkpoint.
    Pausing,
    /// Halted with the rest of the plan held for `resume`.
    Paused,
    /// Holding the plan until every tripped condition clears.
    Suspending,
    /// Closing out a stopped or aborted plan.
    Aborting,
}

impl EngineState {
    /// Lowercase name used in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Running => "running",
            EngineState::Pausing => "pausing",
            EngineState::Paused => "paused",
            EngineState::Suspending => "suspending",
            EngineState::Aborting => "aborting",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a `run`/`resume` call returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The plan was exhausted.
    Completed {
        /// Runs opened by the plan.
        run_uids: Vec<String>,
    },
    /// The engine is paused and holds the rest of the plan.
    Paused,
    /// A stop request ended the plan; any open run closed with `success`.
    Stopped {
        /// Runs opened by the plan.
        run_uids: Vec<String>,
    },
    /// An abort request ended the plan; any open run closed with `abort`.
    Aborted {
        /// Reason given with the request.
        reason: String,
        /// Runs opened by the plan.
        run_uids: Vec<String>,
    },
}

impl RunOutcome {
    /// Uids of the runs opened by the plan, in order.
    pub fn run_uids(&self) -> &[String] {
        match self {
            RunOutcome::Completed { run_uids }
            | RunOutcome::Stopped { run_uids }
            | RunOutcome::Aborted { run_uids, .. } => run_uids,
            RunOutcome::Paused => &[],
        }
    }
}

/// Options for [`RunEngine::run_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Return [`EngineError::Interrupted`] instead of `RunOutcome::Paused`,
    /// and when a run is stopped while suspended or paused.
    pub raise_if_interrupted: bool,
}

impl RunOptions {
    /// Options that report every early halt as [`EngineError::Interrupted`].
    pub fn strict() -> Self {
        Self {
            raise_if_interrupted: true,
        }
    }
}

/// Observer called with every instruction just before it executes.
pub type MsgHook = Arc<dyn Fn(&Msg) + Send + Sync>;

/// Registration returned by [`EngineHandle::install_suspender`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SuspenderHandle {
    engine: EngineId,
    suspender: SuspenderId,
}

impl SuspenderHandle {
    /// Suspender this handle refers to.
    pub fn suspender_id(&self) -> SuspenderId {
        self.suspender
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StopMode {
    Stop,
    Abort(String),
}

impl fmt::Display for StopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopMode::Stop => f.write_str("stopped"),
            StopMode::Abort(reason) => write!(f, "aborted ({reason})"),
        }
    }
}

enum Control {
    Pause {
        defer: bool,
    },
    Suspend {
        wait: Awaitable,
        pre_plan: Option<Vec<Msg>>,
        post_plan: Option<Vec<Msg>>,
        justification: String,
    },
    Tripped(SuspenderId),
    Stop(StopMode),
}

struct Installed {
    suspender: Arc<Suspender>,
    watcher: JoinHandle<()>,
}

struct Shared {
    id: EngineId,
    state: watch::Sender<EngineState>,
    control: mpsc::UnboundedSender<Control>,
    suspenders: Mutex<Vec<Installed>>,
    msg_hook: Mutex<Option<MsgHook>>,
    dispatcher: Dispatcher,
}

/// Cloneable control surface for a [`RunEngine`], usable from other tasks
/// while a run is in progress.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    /// Identity of the engine.
    pub fn id(&self) -> EngineId {
        self.shared.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.shared.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.shared.state.subscribe()
    }

    /// Ask the engine to pause. A hard pause (`defer = false`) halts right
    /// away, or as soon as an in-progress suspension clears. A deferred pause
    /// halts at the next checkpoint.
    pub fn request_pause(&self, defer: bool) {
        if self.ignored_when_halted("pause") {
            return;
        }
        self.send(Control::Pause { defer });
    }

    /// Suspend until `wait` resolves, running the optional lead-in and
    /// lead-out plans around the wait.
    pub fn request_suspend(
        &self,
        wait: Awaitable,
        pre_plan: Option<Vec<Msg>>,
        post_plan: Option<Vec<Msg>>,
        justification: impl Into<String>,
    ) {
        if self.ignored_when_halted("suspend") {
            return;
        }
        self.send(Control::Suspend {
            wait,
            pre_plan,
            post_plan,
            justification: justification.into(),
        });
    }

    /// Stop the current plan; an open run is closed with `success`.
    pub fn stop(&self) {
        if self.ignored_when_halted("stop") {
            return;
        }
        self.send(Control::Stop(StopMode::Stop));
    }

    /// Abort the current plan; an open run is closed with `abort`.
    pub fn abort(&self, reason: impl Into<String>) {
        if self.ignored_when_halted("abort") {
            return;
        }
        self.send(Control::Stop(StopMode::Abort(reason.into())));
    }

    /// Attach a suspender. Must be called from within a Tokio runtime.
    pub fn install_suspender(&self, suspender: &Arc<Suspender>) -> EngineResult<SuspenderHandle> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| EngineError::NoRuntime("suspender watcher"))?;
        suspender.claim(self.shared.id)?;

        let id = suspender.id();
        {
            // Listed before the watcher can report a trip for it.
            let mut installed = self.shared.suspenders.lock();
            let control = self.shared.control.clone();
            let watcher = runtime
                .spawn(suspender.watch_trips(move || control.send(Control::Tripped(id)).is_ok()));
            installed.push(Installed {
                suspender: Arc::clone(suspender),
                watcher,
            });
        }
        if suspender.is_tripped() {
            self.send(Control::Tripped(id));
        }
        info!(
            engine = %self.shared.id,
            suspender = %id,
            signal = suspender.signal().name(),
            "Suspender installed"
        );
        Ok(SuspenderHandle {
            engine: self.shared.id,
            suspender: id,
        })
    }

    /// Detach a suspender and clear its owner.
    pub fn remove_suspender(&self, handle: SuspenderHandle) -> EngineResult<Arc<Suspender>> {
        if handle.engine != self.shared.id {
            return Err(EngineError::NotInstalled);
        }
        let entry = {
            let mut installed = self.shared.suspenders.lock();
            let index = installed
                .iter()
                .position(|i| i.suspender.id() == handle.suspender)
                .ok_or(EngineError::NotInstalled)?;
            installed.remove(index)
        };
        entry.watcher.abort();
        entry.suspender.release();
        info!(engine = %self.shared.id, suspender = %handle.suspender, "Suspender removed");
        Ok(entry.suspender)
    }

    /// Remove every suspender, leaving none with an owner.
    pub fn clear_suspenders(&self) {
        let drained: Vec<Installed> = self.shared.suspenders.lock().drain(..).collect();
        for entry in &drained {
            entry.watcher.abort();
            entry.suspender.release();
        }
        if !drained.is_empty() {
            info!(engine = %self.shared.id, count = drained.len(), "Suspenders cleared");
        }
    }

    /// Installed suspenders, in installation order.
    pub fn suspenders(&self) -> Vec<Arc<Suspender>> {
        self.shared
            .suspenders
            .lock()
            .iter()
            .map(|i| Arc::clone(&i.suspender))
            .collect()
    }

    /// Observe every instruction before it executes. Replaces any earlier hook.
    pub fn set_msg_hook<F>(&self, hook: F)
    where
        F: Fn(&Msg) + Send + Sync + 'static,
    {
        *self.shared.msg_hook.lock() = Some(Arc::new(hook));
    }

    /// Remove the instruction hook.
    pub fn clear_msg_hook(&self) {
        *self.shared.msg_hook.lock() = None;
    }

    /// Register a document callback.
    pub fn subscribe<S, F>(&self, subscription: S, callback: F) -> Token
    where
        S: Into<Subscription>,
        F: Fn(DocumentKind, &Document) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.dispatcher.subscribe(subscription, callback)
    }

    /// Remove a document callback.
    pub fn unsubscribe(&self, token: Token) -> bool {
        self.shared.dispatcher.unsubscribe(token)
    }

    /// Dispatcher receiving this engine's documents.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    /// Subscriber callbacks that failed while documents were being emitted.
    pub fn callback_failures(&self) -> broadcast::Receiver<CallbackFailure> {
        self.shared.dispatcher.failures()
    }

    fn send(&self, control: Control) {
        // The engine owns the receiver for as long as any handle exists.
        let _ = self.shared.control.send(control);
    }

    fn ignored_when_halted(&self, request: &str) -> bool {
        let state = self.state();
        let ignored = matches!(
            state,
            EngineState::Idle | EngineState::Paused | EngineState::Aborting
        );
        if ignored {
            debug!(engine = %self.shared.id, %state, request, "Ignoring request");
        }
        ignored
    }

    fn find_suspender(&self, id: SuspenderId) -> Option<Arc<Suspender>> {
        self.shared
            .suspenders
            .lock()
            .iter()
            .find(|i| i.suspender.id() == id)
            .map(|i| Arc::clone(&i.suspender))
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PauseKind {
    Deferred,
    Immediate,
}

struct Suspension {
    key: String,
    wait: Awaitable,
    block: Vec<Msg>,
    justification: String,
}

enum Interrupt {
    Suspend(Suspension),
    Pause(String),
    Stop(StopMode),
}

enum Flight {
    Done,
    Interrupted,
    Exit(EngineResult<RunOutcome>),
}

struct Reading {
    value: f64,
    timestamp_ns: u64,
    units: Option<String>,
}

struct StreamDescriptor {
    uid: String,
    keys: Vec<String>,
    seq_num: u32,
}

struct OpenRun {
    run_uid: String,
    num_events: u32,
    streams: HashMap<String, StreamDescriptor>,
    bundle: Option<(String, BTreeMap<String, Reading>)>,
}

/// Executes plans, applying installed suspenders and control requests.
pub struct RunEngine {
    handle: EngineHandle,
    control_rx: mpsc::UnboundedReceiver<Control>,
    stack: PlanStack,
    /// Instructions since the last checkpoint; `None` after `clear_checkpoint`.
    cache: Option<Vec<Msg>>,
    rewindable: bool,
    checkpoint_rewindable: bool,
    in_flight_cached: bool,
    /// Suspensions whose `wait_for` has not completed yet, by key.
    active: BTreeMap<String, Awaitable>,
    pending_pause: Option<PauseKind>,
    options: RunOptions,
    run: Option<OpenRun>,
    run_uids: Vec<String>,
    next_request: u64,
}

impl Default for RunEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RunEngine {
    /// Idle engine with a fresh identity and no suspenders.
    pub fn new() -> Self {
        let (control, control_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(EngineState::Idle);
        let shared = Arc::new(Shared {
            id: EngineId::new(),
            state,
            control,
            suspenders: Mutex::new(Vec::new()),
            msg_hook: Mutex::new(None),
            dispatcher: Dispatcher::new(),
        });
        Self {
            handle: EngineHandle { shared },
            control_rx,
            stack: PlanStack::default(),
            cache: Some(Vec::new()),
            rewindable: true,
            checkpoint_rewindable: true,
            in_flight_cached: false,
            active: BTreeMap::new(),
            pending_pause: None,
            options: RunOptions::default(),
            run: None,
            run_uids: Vec::new(),
            next_request: 0,
        }
    }

    /// Cloneable control handle.
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// See [`EngineHandle::id`].
    pub fn id(&self) -> EngineId {
        self.handle.id()
    }

    /// See [`EngineHandle::state`].
    pub fn state(&self) -> EngineState {
        self.handle.state()
    }

    /// See [`EngineHandle::install_suspender`].
    pub fn install_suspender(&self, suspender: &Arc<Suspender>) -> EngineResult<SuspenderHandle> {
        self.handle.install_suspender(suspender)
    }

    /// See [`EngineHandle::remove_suspender`].
    pub fn remove_suspender(&self, handle: SuspenderHandle) -> EngineResult<Arc<Suspender>> {
        self.handle.remove_suspender(handle)
    }

    /// See [`EngineHandle::clear_suspenders`].
    pub fn clear_suspenders(&self) {
        self.handle.clear_suspenders();
    }

    /// See [`EngineHandle::suspenders`].
    pub fn suspenders(&self) -> Vec<Arc<Suspender>> {
        self.handle.suspenders()
    }

    /// See [`EngineHandle::set_msg_hook`].
    pub fn set_msg_hook<F>(&self, hook: F)
    where
        F: Fn(&Msg) + Send + Sync + 'static,
    {
        self.handle.set_msg_hook(hook);
    }

    /// See [`EngineHandle::subscribe`].
    pub fn subscribe<S, F>(&self, subscription: S, callback: F) -> Token
    where
        S: Into<Subscription>,
        F: Fn(DocumentKind, &Document) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handle.subscribe(subscription, callback)
    }

    /// See [`EngineHandle::unsubscribe`].
    pub fn unsubscribe(&self, token: Token) -> bool {
        self.handle.unsubscribe(token)
    }

    /// Run a plan with default options: a pause returns `RunOutcome::Paused`.
    pub async fn run<I>(&mut self, msgs: I) -> EngineResult<RunOutcome>
    where
        I: IntoIterator<Item = Msg>,
        I::IntoIter: Send + 'static,
    {
        self.run_with(msgs, RunOptions::default()).await
    }

    /// Run a plan. Only valid while idle.
    pub async fn run_with<I>(&mut self, msgs: I, options: RunOptions) -> EngineResult<RunOutcome>
    where
        I: IntoIterator<Item = Msg>,
        I::IntoIter: Send + 'static,
    {
        self.expect_state("run", EngineState::Idle)?;
        // Requests sent while idle are stale.
        while self.control_rx.try_recv().is_ok() {}

        self.reset_plan();
        self.stack = PlanStack::new(plan(msgs));
        self.options = options;
        self.run_uids.clear();

        info!(engine = %self.id(), "Plan started");
        self.set_state(EngineState::Running);
        self.drive().await
    }

    /// Continue a paused plan.
    pub async fn resume(&mut self) -> EngineResult<RunOutcome> {
        self.expect_state("resume", EngineState::Paused)?;
        info!(engine = %self.id(), "Resuming");
        self.set_state(if self.active.is_empty() {
            EngineState::Running
        } else {
            EngineState::Suspending
        });
        self.drive().await
    }

    /// End a paused plan, closing any open run with `success`.
    pub fn stop(&mut self) -> EngineResult<RunOutcome> {
        self.expect_state("stop", EngineState::Paused)?;
        self.finish(StopMode::Stop)
    }

    /// End a paused plan, closing any open run with `abort`.
    pub fn abort(&mut self, reason: impl Into<String>) -> EngineResult<RunOutcome> {
        self.expect_state("abort", EngineState::Paused)?;
        self.finish(StopMode::Abort(reason.into()))
    }

    async fn drive(&mut self) -> EngineResult<RunOutcome> {
        loop {
            while let Ok(control) = self.control_rx.try_recv() {
                if let Some(interrupt) = self.on_control(control) {
                    if let Some(exit) = self.apply(interrupt, None) {
                        return exit;
                    }
                }
            }

            self.check_suspenders();

            if self.pending_pause == Some(PauseKind::Immediate) && self.active.is_empty() {
                return self.pause("pause requested".to_string(), None);
            }

            let Some(msg) = self.stack.next_msg() else {
                return self.complete();
            };
            if let Some(exit) = self.dispatch(msg).await {
                return exit;
            }
        }
    }

    async fn dispatch(&mut self, msg: Msg) -> Option<EngineResult<RunOutcome>> {
        let hook = self.handle.shared.msg_hook.lock().clone();
        if let Some(hook) = hook {
            hook(&msg);
        }

        let injected = msg.metadata.contains_key(INJECTED_KEY);
        self.in_flight_cached = false;
        if !injected && !matches!(msg.command, Command::Checkpoint | Command::ClearCheckpoint) {
            if let Some(cache) = self.cache.as_mut() {
                cache.push(msg.clone());
                self.in_flight_cached = true;
            }
        }
        trace!(engine = %self.id(), command = %msg.command, injected, "Dispatching");

        let long_running: Option<BoxFuture<'static, ()>> = match &msg.command {
            Command::Sleep(duration) => Some(Box::pin(tokio::time::sleep(*duration))),
            Command::WaitFor(awaitable) => Some(Box::pin(awaitable.wait())),
            _ => None,
        };
        if let Some(fut) = long_running {
            let wait_key = msg
                .metadata
                .get(WAIT_KEY)
                .and_then(Value::as_str)
                .map(str::to_string);
            return match self.race(msg, fut).await {
                Flight::Done => {
                    if let Some(key) = wait_key {
                        self.end_suspension(&key);
                    }
                    None
                }
                Flight::Interrupted => None,
                Flight::Exit(exit) => Some(exit),
            };
        }

        let result = match &msg.command {
            Command::Checkpoint => {
                self.cache = Some(Vec::new());
                self.checkpoint_rewindable = self.rewindable;
                if self.pending_pause == Some(PauseKind::Deferred) {
                    return Some(self.pause("deferred pause reached a checkpoint".to_string(), None));
                }
                Ok(())
            }
            Command::ClearCheckpoint => {
                self.cache = None;
                Ok(())
            }
            Command::Rewindable(flag) => {
                // Suspension brackets are observable but leave the plan's flag alone.
                if !injected {
                    self.rewindable = *flag;
                }
                Ok(())
            }
            Command::OpenRun => self.open_run(&msg),
            Command::CloseRun => self.close_run(ExitStatus::Success, ""),
            Command::Create(stream) => self.create(stream),
            Command::Read => self.read(&msg),
            Command::Save => self.save(),
            Command::Null | Command::Sleep(_) | Command::WaitFor(_) => Ok(()),
        };

        match result {
            Ok(()) => None,
            Err(err) => Some(self.fail(err)),
        }
    }

    /// Race a long-running instruction against control requests.
    async fn race(&mut self, msg: Msg, mut fut: BoxFuture<'static, ()>) -> Flight {
        loop {
            let control = tokio::select! {
                () = &mut fut => return Flight::Done,
                control = self.control_rx.recv() => control,
            };
            let Some(control) = control else {
                fut.await;
                return Flight::Done;
            };
            if let Some(interrupt) = self.on_control(control) {
                return match self.apply(interrupt, Some(msg)) {
                    None => Flight::Interrupted,
                    Some(exit) => Flight::Exit(exit),
                };
            }
        }
    }

    fn on_control(&mut self, control: Control) -> Option<Interrupt> {
        match control {
            Control::Pause { defer: true } => {
                if self.pending_pause.is_none() {
                    info!(engine = %self.id(), "Deferred pause requested; pausing at next checkpoint");
                    self.pending_pause = Some(PauseKind::Deferred);
                    if self.state() == EngineState::Running {
                        self.set_state(EngineState::Pausing);
                    }
                }
                None
            }
            Control::Pause { defer: false } => {
                if self.active.is_empty() {
                    return Some(Interrupt::Pause("pause requested".to_string()));
                }
                info!(engine = %self.id(), "Pause requested while suspended; pausing once the suspension clears");
                self.pending_pause = Some(PauseKind::Immediate);
                None
            }
            Control::Suspend {
                wait,
                pre_plan,
                post_plan,
                justification,
            } => {
                if self.cache.is_none() {
                    warn!(
                        engine = %self.id(),
                        %justification,
                        "Suspend requested with no checkpoint to return to; pausing instead"
                    );
                    wait.cancel();
                    return Some(Interrupt::Pause(format!(
                        "cannot suspend without a checkpoint: {justification}"
                    )));
                }
                self.next_request += 1;
                let key = format!("request-{}", self.next_request);
                let block = suspension_block(
                    &key,
                    wait.clone(),
                    pre_plan.as_deref(),
                    post_plan.as_deref(),
                    self.rewindable,
                );
                Some(Interrupt::Suspend(Suspension {
                    key,
                    wait,
                    block,
                    justification,
                }))
            }
            Control::Tripped(id) => {
                let suspender = self.handle.find_suspender(id)?;
                self.trip(&suspender).map(Interrupt::Suspend)
            }
            Control::Stop(mode) => Some(Interrupt::Stop(mode)),
        }
    }

    /// Suspension for a tripped suspender, unless it is already being handled
    /// or the engine is past a `clear_checkpoint`.
    fn trip(&self, suspender: &Suspender) -> Option<Suspension> {
        let key = suspender.id().to_string();
        if self.cache.is_none() || self.active.contains_key(&key) || !suspender.is_tripped() {
            return None;
        }
        let wait = Awaitable::new(suspender.cleared());
        Some(Suspension {
            block: suspender.suspension_block(wait.clone(), self.rewindable),
            wait,
            justification: suspender.justification(),
            key,
        })
    }

    fn check_suspenders(&mut self) {
        if self.cache.is_none() {
            return;
        }
        for suspender in self.handle.suspenders() {
            if let Some(suspension) = self.trip(&suspender) {
                self.suspend(suspension, None);
            }
        }
    }

    fn apply(
        &mut self,
        interrupt: Interrupt,
        in_flight: Option<Msg>,
    ) -> Option<EngineResult<RunOutcome>> {
        match interrupt {
            Interrupt::Suspend(suspension) => {
                self.suspend(suspension, in_flight);
                None
            }
            Interrupt::Pause(reason) => Some(self.pause(reason, in_flight)),
            Interrupt::Stop(mode) => Some(self.finish(mode)),
        }
    }

    fn suspend(&mut self, suspension: Suspension, in_flight: Option<Msg>) {
        info!(
            engine = %self.id(),
            key = %suspension.key,
            justification = %suspension.justification,
            "Suspending"
        );
        self.reschedule(in_flight);
        self.active.insert(suspension.key, suspension.wait);
        self.stack.insert(suspension.block);
        self.set_state(EngineState::Suspending);
    }

    fn end_suspension(&mut self, key: &str) {
        self.active.remove(key);
        if self.active.is_empty() {
            info!(engine = %self.id(), %key, "Suspension cleared; resuming plan");
            self.set_state(if self.pending_pause.is_some() {
                EngineState::Pausing
            } else {
                EngineState::Running
            });
        }
    }

    /// Queue the interrupted instruction, or everything since the last
    /// checkpoint when inside a non-rewindable section.
    fn reschedule(&mut self, in_flight: Option<Msg>) {
        let injected = in_flight
            .as_ref()
            .is_some_and(|m| m.metadata.contains_key(INJECTED_KEY));
        if !self.rewindable && !injected && self.cache.is_some() {
            self.rewind();
            return;
        }
        if let Some(msg) = in_flight {
            if self.in_flight_cached {
                if let Some(cache) = self.cache.as_mut() {
                    cache.pop();
                }
            }
            self.stack.insert(std::iter::once(msg));
        }
    }

    fn rewind(&mut self) {
        let Some(cache) = self.cache.as_mut() else {
            return;
        };
        let replay = std::mem::take(cache);
        if !replay.is_empty() {
            debug!(engine = %self.id(), count = replay.len(), "Rewinding to last checkpoint");
            self.stack.insert(replay);
        }
        self.rewindable = self.checkpoint_rewindable;
    }

    fn pause(&mut self, reason: String, in_flight: Option<Msg>) -> EngineResult<RunOutcome> {
        self.reschedule(in_flight);
        self.pending_pause = None;
        self.set_state(EngineState::Paused);
        info!(engine = %self.id(), %reason, "RunEngine paused");
        if self.options.raise_if_interrupted {
            return Err(RunEngineInterrupted {
                state: EngineState::Paused,
                reason,
            }
            .into());
        }
        Ok(RunOutcome::Paused)
    }

    fn finish(&mut self, mode: StopMode) -> EngineResult<RunOutcome> {
        let was = self.state();
        let interrupted = matches!(was, EngineState::Suspending | EngineState::Paused)
            || !self.active.is_empty();
        self.set_state(EngineState::Aborting);

        if let Some(run) = self.run.take() {
            match &mode {
                StopMode::Stop => self.emit_stop(run, ExitStatus::Success, ""),
                StopMode::Abort(reason) => self.emit_stop(run, ExitStatus::Abort, reason),
            }
        }
        self.reset_plan();
        self.set_state(EngineState::Idle);
        info!(engine = %self.id(), %mode, was = %was, "Plan ended early");

        let run_uids = std::mem::take(&mut self.run_uids);
        if interrupted && self.options.raise_if_interrupted {
            return Err(RunEngineInterrupted {
                state: EngineState::Idle,
                reason: format!("plan {mode} while {was}"),
            }
            .into());
        }
        Ok(match mode {
            StopMode::Stop => RunOutcome::Stopped { run_uids },
            StopMode::Abort(reason) => RunOutcome::Aborted { reason, run_uids },
        })
    }

    fn complete(&mut self) -> EngineResult<RunOutcome> {
        if let Some(run) = self.run.take() {
            warn!(engine = %self.id(), run_uid = %run.run_uid, "Plan ended with an open run; closing it");
            self.emit_stop(run, ExitStatus::Success, "");
        }
        self.reset_plan();
        self.set_state(EngineState::Idle);
        info!(engine = %self.id(), runs = self.run_uids.len(), "Plan completed");
        Ok(RunOutcome::Completed {
            run_uids: std::mem::take(&mut self.run_uids),
        })
    }

    fn fail(&mut self, err: EngineError) -> EngineResult<RunOutcome> {
        warn!(engine = %self.id(), error = %err, "Plan failed");
        if let Some(run) = self.run.take() {
            self.emit_stop(run, ExitStatus::Fail, &err.to_string());
        }
        self.reset_plan();
        self.set_state(EngineState::Idle);
        Err(err)
    }

    fn reset_plan(&mut self) {
        self.stack.clear();
        self.cache = Some(Vec::new());
        self.rewindable = true;
        self.checkpoint_rewindable = true;
        self.in_flight_cached = false;
        for (key, wait) in std::mem::take(&mut self.active) {
            if wait.cancel() {
                debug!(engine = %self.id(), %key, "Cancelled open suspension");
            }
        }
        self.pending_pause = None;
    }

    fn open_run(&mut self, msg: &Msg) -> EngineResult<()> {
        if self.run.is_some() {
            return Err(EngineError::IllegalSequence {
                command: "open_run",
                reason: "while a run is already open",
            });
        }
        let mut start = StartDoc::new().with_metadata("engine_id", self.id().to_string());
        start
            .metadata
            .extend(msg.kwargs.iter().map(|(k, v)| (k.clone(), v.clone())));

        let run_uid = start.uid.clone();
        info!(engine = %self.id(), %run_uid, "Run opened");
        self.run_uids.push(run_uid.clone());
        self.run = Some(OpenRun {
            run_uid,
            num_events: 0,
            streams: HashMap::new(),
            bundle: None,
        });
        self.emit(Document::Start(start));
        Ok(())
    }

    fn close_run(&mut self, status: ExitStatus, reason: &str) -> EngineResult<()> {
        let run = self.run.take().ok_or(EngineError::IllegalSequence {
            command: "close_run",
            reason: "without an open run",
        })?;
        self.emit_stop(run, status, reason);
        Ok(())
    }

    fn create(&mut self, stream: &str) -> EngineResult<()> {
        let run = self.run.as_mut().ok_or(EngineError::IllegalSequence {
            command: "create",
            reason: "outside of an open run",
        })?;
        if run.bundle.is_some() {
            return Err(EngineError::IllegalSequence {
                command: "create",
                reason: "while an event bundle is already open",
            });
        }
        run.bundle = Some((stream.to_string(), BTreeMap::new()));
        Ok(())
    }

    fn read(&mut self, msg: &Msg) -> EngineResult<()> {
        let target = msg.target.as_ref().ok_or(EngineError::MissingTarget("read"))?;
        let reading = Reading {
            value: target.read(),
            timestamp_ns: now_ns(),
            units: target.units().map(str::to_string),
        };
        // Reads outside a bundle are taken but not recorded.
        if let Some((_, readings)) = self.run.as_mut().and_then(|r| r.bundle.as_mut()) {
            readings.insert(target.name().to_string(), reading);
        }
        Ok(())
    }

    fn save(&mut self) -> EngineResult<()> {
        let run = self.run.as_mut().ok_or(EngineError::IllegalSequence {
            command: "save",
            reason: "outside of an open run",
        })?;
        let (stream, readings) = run.bundle.take().ok_or(EngineError::IllegalSequence {
            command: "save",
            reason: "without a preceding create",
        })?;

        let keys: Vec<String> = readings.keys().cloned().collect();
        let mut documents = Vec::with_capacity(2);
        let needs_descriptor = run.streams.get(&stream).map_or(true, |d| d.keys != keys);
        if needs_descriptor {
            let descriptor = readings.iter().fold(
                DescriptorDoc::new(&run.run_uid, &stream),
                |doc, (field, reading)| {
                    doc.with_data_key(field, DataKey::scalar(field, reading.units.as_deref()))
                },
            );
            run.streams.insert(
                stream.clone(),
                StreamDescriptor {
                    uid: descriptor.uid.clone(),
                    keys,
                    seq_num: 0,
                },
            );
            documents.push(Document::Descriptor(descriptor));
        }

        if let Some(descriptor) = run.streams.get_mut(&stream) {
            descriptor.seq_num += 1;
            let event = readings.iter().fold(
                EventDoc::new(&run.run_uid, &descriptor.uid, descriptor.seq_num),
                |doc, (field, reading)| doc.with_datum(field, reading.value, reading.timestamp_ns),
            );
            run.num_events += 1;
            documents.push(Document::Event(event));
        }

        for document in documents {
            self.emit(document);
        }
        Ok(())
    }

    fn emit_stop(&self, run: OpenRun, status: ExitStatus, reason: &str) {
        if let Some((stream, _)) = &run.bundle {
            warn!(engine = %self.id(), %stream, "Discarding unsaved event bundle");
        }
        info!(engine = %self.id(), run_uid = %run.run_uid, ?status, "Run closed");
        self.emit(Document::Stop(StopDoc::new(
            &run.run_uid,
            status,
            reason,
            run.num_events,
        )));
    }

    fn emit(&self, document: Document) {
        let kind = document.kind();
        trace!(engine = %self.id(), %kind, uid = document.uid(), "Emitting document");
        self.handle.shared.dispatcher.process(kind, &document);
    }

    fn expect_state(&self, operation: &'static str, expected: EngineState) -> EngineResult<()> {
        let current = self.state();
        if current == expected {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                operation,
                current,
                expected: expected.as_str(),
            })
        }
    }

    fn set_state(&self, state: EngineState) {
        let previous = self.handle.shared.state.send_replace(state);
        if previous != state {
            debug!(engine = %self.id(), from = %previous, to = %state, "State transition");
        }
    }
}

impl Drop for RunEngine {
    fn drop(&mut self) {
        self.handle.clear_suspenders();
    }
}

impl fmt::Debug for RunEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunEngine")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("stack", &self.stack)
            .field("active_suspensions", &self.active.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SoftSignal;
    use std::time::Duration;
    use tokio::time::Instant;

    fn record_names(engine: &RunEngine) -> Arc<Mutex<Vec<&'static str>>> {
        let names = Arc::new(Mutex::new(Vec::new()));
        let sink = names.clone();
        engine.set_msg_hook(move |msg| sink.lock().push(msg.name()));
        names
    }

    fn record_kinds(engine: &RunEngine) -> Arc<Mutex<Vec<DocumentKind>>> {
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let sink = kinds.clone();
        engine.subscribe(Subscription::All, move |kind, _| {
            sink.lock().push(kind);
            Ok(())
        });
        kinds
    }

    #[test]
    fn test_engine_id_round_trips_through_display() {
        let id = EngineId::new();
        let parsed: EngineId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<EngineId>().is_err());
    }

    #[test]
    fn test_install_requires_runtime() {
        let engine = RunEngine::new();
        let sig = SoftSignal::new("x", 0.0);
        let susp = Arc::new(Suspender::bool_high(sig.shared()));
        assert!(matches!(
            engine.install_suspender(&susp),
            Err(EngineError::NoRuntime(_))
        ));
        assert!(susp.owner().is_none());
    }

    #[tokio::test]
    async fn test_simple_plan_completes() {
        let mut engine = RunEngine::new();
        let names = record_names(&engine);

        let outcome = engine
            .run(vec![
                Msg::checkpoint(),
                Msg::null(),
                Msg::sleep(Duration::from_millis(1)),
            ])
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Completed { run_uids: vec![] });
        assert_eq!(*names.lock(), vec!["checkpoint", "null", "sleep"]);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_resume_requires_paused() {
        let mut engine = RunEngine::new();
        let err = engine.resume().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidState {
                operation: "resume",
                current: EngineState::Idle,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_documents_follow_instructions() {
        let mut engine = RunEngine::new();
        let kinds = record_kinds(&engine);
        let det = SoftSignal::new("det", 1.5).with_units("V");

        let outcome = engine
            .run(vec![
                Msg::open_run().with_kwarg("sample", "Si"),
                Msg::create("primary"),
                Msg::read(det.shared()),
                Msg::save(),
                Msg::create("primary"),
                Msg::read(det.shared()),
                Msg::save(),
                Msg::close_run(),
            ])
            .await
            .unwrap();

        assert_eq!(outcome.run_uids().len(), 1);
        assert_eq!(
            *kinds.lock(),
            vec![
                DocumentKind::Start,
                DocumentKind::Descriptor,
                DocumentKind::Event,
                DocumentKind::Event,
                DocumentKind::Stop,
            ]
        );
    }

    #[tokio::test]
    async fn test_event_contents_and_stop_count() {
        let mut engine = RunEngine::new();
        let docs = Arc::new(Mutex::new(Vec::new()));
        let sink = docs.clone();
        engine.subscribe(Subscription::All, move |_, doc| {
            sink.lock().push(doc.clone());
            Ok(())
        });
        let det = SoftSignal::new("det", 2.0);

        engine
            .run(vec![
                Msg::open_run(),
                Msg::create("primary"),
                Msg::read(det.shared()),
                Msg::save(),
                Msg::close_run(),
            ])
            .await
            .unwrap();

        let docs = docs.lock();
        let Document::Event(event) = &docs[2] else {
            panic!("expected event, got {:?}", docs[2]);
        };
        assert_eq!(event.seq_num, 1);
        assert_eq!(event.data["det"], 2.0);
        let Document::Stop(stop) = &docs[3] else {
            panic!("expected stop, got {:?}", docs[3]);
        };
        assert_eq!(stop.num_events, 1);
        assert_eq!(stop.exit_status, ExitStatus::Success);
    }

    #[tokio::test]
    async fn test_illegal_sequence_fails_the_run() {
        let mut engine = RunEngine::new();
        let docs = Arc::new(Mutex::new(Vec::new()));
        let sink = docs.clone();
        engine.subscribe(DocumentKind::Stop, move |_, doc| {
            sink.lock().push(doc.clone());
            Ok(())
        });

        let err = engine
            .run(vec![Msg::open_run(), Msg::save()])
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::IllegalSequence { command: "save", .. }
        ));
        assert_eq!(engine.state(), EngineState::Idle);
        let docs = docs.lock();
        let Document::Stop(stop) = &docs[0] else {
            panic!("expected stop");
        };
        assert_eq!(stop.exit_status, ExitStatus::Fail);
    }

    #[tokio::test]
    async fn test_read_without_target_is_an_error() {
        let mut engine = RunEngine::new();
        let err = engine.run(vec![Msg::new(Command::Read)]).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingTarget("read")));
    }

    #[tokio::test]
    async fn test_open_run_closed_when_plan_ends() {
        let mut engine = RunEngine::new();
        let kinds = record_kinds(&engine);
        engine.run(vec![Msg::open_run()]).await.unwrap();
        assert_eq!(*kinds.lock(), vec![DocumentKind::Start, DocumentKind::Stop]);
    }

    #[tokio::test]
    async fn test_install_remove_and_clear() {
        let engine = RunEngine::new();
        let sig = SoftSignal::new("x", 0.0);
        let a = Arc::new(Suspender::bool_high(sig.shared()));
        let b = Arc::new(Suspender::bool_low(sig.shared()));

        let handle = engine.install_suspender(&a).unwrap();
        engine.install_suspender(&b).unwrap();
        assert_eq!(a.owner(), Some(engine.id()));
        assert!(matches!(
            engine.install_suspender(&a),
            Err(EngineError::AlreadyInstalled { .. })
        ));

        let removed = engine.remove_suspender(handle).unwrap();
        assert_eq!(removed.id(), a.id());
        assert!(a.owner().is_none());
        assert!(matches!(
            engine.remove_suspender(handle),
            Err(EngineError::NotInstalled)
        ));

        engine.clear_suspenders();
        assert!(engine.suspenders().is_empty());
        assert!(b.owner().is_none());
    }

    #[tokio::test]
    async fn test_suspender_moves_between_engines() {
        let first = RunEngine::new();
        let second = RunEngine::new();
        let sig = SoftSignal::new("x", 0.0);
        let susp = Arc::new(Suspender::bool_high(sig.shared()));

        first.install_suspender(&susp).unwrap();
        assert!(second.install_suspender(&susp).is_err());
        drop(first);
        second.install_suspender(&susp).unwrap();
        assert_eq!(susp.owner(), Some(second.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_tripped_suspender_waits_before_first_instruction() {
        let mut engine = RunEngine::new();
        let names = record_names(&engine);
        let sig = SoftSignal::new("interlock", 1.0);
        engine
            .install_suspender(&Arc::new(Suspender::bool_high(sig.shared())))
            .unwrap();

        let setter = sig.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            setter.put(0.0);
        });

        let start = Instant::now();
        engine.run(vec![Msg::checkpoint()]).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(*names.lock(), vec!["wait_for", "checkpoint"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_suspender_installed_mid_plan_trips_immediately() {
        let mut engine = RunEngine::new();
        let handle = engine.handle();
        let mut state = handle.watch_state();
        let sig = SoftSignal::new("interlock", 1.0);
        let running = tokio::spawn(async move {
            let outcome = engine
                .run(vec![Msg::checkpoint(), Msg::sleep(Duration::from_secs(30))])
                .await;
            (engine, outcome)
        });
        state.wait_for(|s| *s == EngineState::Running).await.unwrap();

        handle
            .install_suspender(&Arc::new(Suspender::bool_high(sig.shared())))
            .unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == EngineState::Suspending),
        )
        .await
        .expect("tripped suspender ignored")
        .unwrap();

        handle.abort("done");
        let (_engine, outcome) = running.await.unwrap();
        assert!(matches!(outcome.unwrap(), RunOutcome::Aborted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ending_a_plan_cancels_open_suspensions() {
        let mut engine = RunEngine::new();
        let wait = Awaitable::new(std::future::pending());
        let (handle, request) = (engine.handle(), wait.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.request_suspend(request, None, None, "operator hold");
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.stop();
        });

        let outcome = engine
            .run(vec![Msg::checkpoint(), Msg::sleep(Duration::from_secs(1))])
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Stopped { .. }));
        assert!(wait.is_cancelled());
        assert!(format!("{engine:?}").contains("active_suspensions: []"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_suspension_is_not_cancelled() {
        let mut engine = RunEngine::new();
        let wait = Awaitable::new(tokio::time::sleep(Duration::from_millis(300)));
        let (handle, request) = (engine.handle(), wait.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.request_suspend(request, None, None, "operator hold");
        });

        engine
            .run(vec![Msg::checkpoint(), Msg::sleep(Duration::from_secs(1))])
            .await
            .unwrap();
        assert!(wait.is_resolved());
        assert!(!wait.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_pause_interrupts_sleep_and_resume_reissues_it() {
        let mut engine = RunEngine::new();
        let names = record_names(&engine);
        let handle = engine.handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.request_pause(false);
        });

        let outcome = engine
            .run(vec![Msg::checkpoint(), Msg::sleep(Duration::from_secs(10))])
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Paused);
        assert_eq!(engine.state(), EngineState::Paused);

        let outcome = engine.resume().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(*names.lock(), vec!["checkpoint", "sleep", "sleep"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_rewindable_section_replays_from_checkpoint() {
        let mut engine = RunEngine::new();
        let names = record_names(&engine);
        let handle = engine.handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.request_pause(false);
        });

        engine
            .run(vec![
                Msg::checkpoint(),
                Msg::rewindable(false),
                Msg::null(),
                Msg::sleep(Duration::from_secs(1)),
            ])
            .await
            .unwrap();
        engine.resume().await.unwrap();

        assert_eq!(
            *names.lock(),
            vec![
                "checkpoint",
                "rewindable",
                "null",
                "sleep",
                "rewindable",
                "null",
                "sleep"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_paused_closes_run() {
        let mut engine = RunEngine::new();
        let kinds = record_kinds(&engine);
        let handle = engine.handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.request_pause(false);
        });

        engine
            .run(vec![Msg::open_run(), Msg::sleep(Duration::from_secs(1))])
            .await
            .unwrap();
        let outcome = engine.stop().unwrap();

        assert!(matches!(outcome, RunOutcome::Stopped { ref run_uids } if run_uids.len() == 1));
        assert_eq!(*kinds.lock(), vec![DocumentKind::Start, DocumentKind::Stop]);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_while_idle_are_ignored() {
        let mut engine = RunEngine::new();
        let handle = engine.handle();
        handle.request_pause(false);
        handle.stop();

        let outcome = engine.run(vec![Msg::checkpoint()]).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
    }
}
