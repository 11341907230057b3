//! Instructions executed by the run engine.
//!
//! A [`Msg`] is one atomic operation: a [`Command`] plus an optional target
//! signal, keyword arguments and free-form metadata. Messages are cloned freely
//! (the engine keeps copies for rewinding), so everything they carry is either
//! plain data or reference counted.

use crate::signal::Signal;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A future the engine can block on with `wait_for`.
///
/// Clones share one underlying future, so a `wait_for` that is interrupted and
/// dispatched again keeps whatever progress the first attempt made. An
/// awaitable is in one of three states: pending, resolved or cancelled. The
/// engine cancels the wait of every suspension still open when a plan is
/// stopped, aborted or fails; a cancelled awaitable resolves immediately for
/// any later waiter.
#[derive(Clone)]
pub struct Awaitable {
    future: Shared<BoxFuture<'static, ()>>,
    cancelled: Arc<watch::Sender<bool>>,
}

impl Awaitable {
    /// Wrap a future. It is not polled until something waits on it.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            future: future.boxed().shared(),
            cancelled: Arc::new(watch::Sender::new(false)),
        }
    }

    /// An awaitable that is already complete.
    pub fn ready() -> Self {
        Self::new(std::future::ready(()))
    }

    /// Whether the underlying future has already resolved.
    pub fn is_resolved(&self) -> bool {
        self.future.peek().is_some()
    }

    /// Abandon the wait. Returns `false` if it had already resolved or been
    /// cancelled.
    pub fn cancel(&self) -> bool {
        if self.is_resolved() {
            return false;
        }
        self.cancelled.send_if_modified(|cancelled| !std::mem::replace(cancelled, true))
    }

    /// Whether [`Awaitable::cancel`] took effect.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    pub(crate) fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let future = self.future.clone();
        let mut cancelled = self.cancelled.subscribe();
        async move {
            tokio::select! {
                () = future => {}
                () = until_cancelled(&mut cancelled) => {}
            }
        }
    }
}

async fn until_cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl fmt::Debug for Awaitable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_resolved() {
            "resolved"
        } else if self.is_cancelled() {
            "cancelled"
        } else {
            "pending"
        };
        f.debug_tuple("Awaitable").field(&state).finish()
    }
}

/// Instruction vocabulary understood by the engine.
#[derive(Debug, Clone)]
pub enum Command {
    /// Do nothing.
    Null,
    /// Mark a position that is safe to rewind to.
    Checkpoint,
    /// Forget the last checkpoint; the engine cannot rewind until the next one.
    ClearCheckpoint,
    /// Mark whether the following instructions may be replayed.
    Rewindable(bool),
    /// Cooperative delay.
    Sleep(Duration),
    /// Block until the awaitable resolves.
    WaitFor(Awaitable),
    /// Begin a run; emits a start document.
    OpenRun,
    /// End the open run; emits a stop document.
    CloseRun,
    /// Begin an event bundle for the named stream.
    Create(String),
    /// Read the target signal into the open bundle.
    Read,
    /// Close the bundle; emits descriptor (first time) and event documents.
    Save,
}

impl Command {
    /// Instruction name as used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Null => "null",
            Command::Checkpoint => "checkpoint",
            Command::ClearCheckpoint => "clear_checkpoint",
            Command::Rewindable(_) => "rewindable",
            Command::Sleep(_) => "sleep",
            Command::WaitFor(_) => "wait_for",
            Command::OpenRun => "open_run",
            Command::CloseRun => "close_run",
            Command::Create(_) => "create",
            Command::Read => "read",
            Command::Save => "save",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One instruction.
#[derive(Clone)]
pub struct Msg {
    /// Operation to perform.
    pub command: Command,
    /// Signal the operation applies to.
    pub target: Option<Arc<dyn Signal>>,
    /// Operation arguments; `open_run` copies these into the start document.
    pub kwargs: BTreeMap<String, Value>,
    /// Free-form annotations, not interpreted by the engine.
    pub metadata: BTreeMap<String, Value>,
}

impl Msg {
    /// Instruction with no target and no arguments.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            target: None,
            kwargs: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// `null`
    pub fn null() -> Self {
        Self::new(Command::Null)
    }

    /// `checkpoint`
    pub fn checkpoint() -> Self {
        Self::new(Command::Checkpoint)
    }

    /// `clear_checkpoint`
    pub fn clear_checkpoint() -> Self {
        Self::new(Command::ClearCheckpoint)
    }

    /// `rewindable(flag)`
    pub fn rewindable(flag: bool) -> Self {
        Self::new(Command::Rewindable(flag))
    }

    /// `sleep(duration)`
    pub fn sleep(duration: Duration) -> Self {
        Self::new(Command::Sleep(duration))
    }

    /// `wait_for(awaitable)`
    pub fn wait_for(awaitable: Awaitable) -> Self {
        Self::new(Command::WaitFor(awaitable))
    }

    /// `open_run`
    pub fn open_run() -> Self {
        Self::new(Command::OpenRun)
    }

    /// `close_run`
    pub fn close_run() -> Self {
        Self::new(Command::CloseRun)
    }

    /// `create(stream)`
    pub fn create(stream: impl Into<String>) -> Self {
        Self::new(Command::Create(stream.into()))
    }

    /// `read(target)`
    pub fn read(target: Arc<dyn Signal>) -> Self {
        Self::new(Command::Read).with_target(target)
    }

    /// `save`
    pub fn save() -> Self {
        Self::new(Command::Save)
    }

    /// Set the target signal.
    pub fn with_target(mut self, target: Arc<dyn Signal>) -> Self {
        self.target = Some(target);
        self
    }

    /// Add a keyword argument.
    pub fn with_kwarg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.to_string(), value.into());
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Instruction name, e.g. `"wait_for"`.
    pub fn name(&self) -> &'static str {
        self.command.name()
    }
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Msg")
            .field("command", &self.command)
            .field("target", &self.target.as_ref().map(|t| t.name().to_string()))
            .field("kwargs", &self.kwargs)
            .field("metadata", &self.metadata)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SoftSignal;

    #[test]
    fn test_command_names() {
        assert_eq!(Msg::checkpoint().name(), "checkpoint");
        assert_eq!(Msg::clear_checkpoint().name(), "clear_checkpoint");
        assert_eq!(Msg::rewindable(false).name(), "rewindable");
        assert_eq!(Msg::wait_for(Awaitable::ready()).name(), "wait_for");
        assert_eq!(Msg::sleep(Duration::from_millis(5)).name(), "sleep");
        assert_eq!(Msg::null().name(), "null");
    }

    #[test]
    fn test_builder_fields() {
        let sig = SoftSignal::new("det", 1.0);
        let msg = Msg::read(sig.shared())
            .with_kwarg("stream", "primary")
            .with_metadata("note", 3);

        assert_eq!(msg.target.as_ref().map(|t| t.name()), Some("det"));
        assert_eq!(msg.kwargs["stream"], Value::from("primary"));
        assert_eq!(msg.metadata["note"], Value::from(3));
    }

    #[tokio::test]
    async fn test_awaitable_clones_share_completion() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let awaitable = Awaitable::new(async move {
            let _ = rx.await;
        });
        let other = awaitable.clone();
        assert!(!awaitable.is_resolved());

        tx.send(()).unwrap();
        awaitable.wait().await;
        assert!(other.is_resolved());
        assert!(!other.cancel());
        assert!(!other.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_releases_waiters() {
        let awaitable = Awaitable::new(std::future::pending());
        let waiter = tokio::spawn(awaitable.wait());
        tokio::task::yield_now().await;

        assert!(awaitable.clone().cancel());
        assert!(!awaitable.cancel());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(awaitable.is_cancelled());
        assert!(!awaitable.is_resolved());
        assert_eq!(format!("{awaitable:?}"), "Awaitable(\"cancelled\")");
    }
}
