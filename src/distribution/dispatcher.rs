//! In-process document fan-out.
//!
//! Subscribers register for one [`DocumentKind`] or for every kind. A
//! [`Dispatcher::process`] call invokes each matching callback in subscription
//! order. A callback that fails (returns `Err` or panics) does not stop the
//! callbacks after it; the failure is logged and broadcast as a
//! [`CallbackFailure`].

use crate::experiment::document::{Document, DocumentKind};
use parking_lot::RwLock;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

const FAILURE_CHANNEL_CAPACITY: usize = 256;

/// Subscriber callback.
pub type Callback = Arc<dyn Fn(DocumentKind, &Document) -> anyhow::Result<()> + Send + Sync>;

/// Which documents a subscriber receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    /// Every document kind.
    All,
    /// One document kind.
    Kind(DocumentKind),
}

impl Subscription {
    fn matches(&self, kind: DocumentKind) -> bool {
        match self {
            Subscription::All => true,
            Subscription::Kind(k) => *k == kind,
        }
    }
}

impl From<DocumentKind> for Subscription {
    fn from(kind: DocumentKind) -> Self {
        Subscription::Kind(kind)
    }
}

/// Identifies one subscription for `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber_{}", self.0)
    }
}

/// A subscriber callback that returned an error or panicked.
#[derive(Debug, Clone)]
pub struct CallbackFailure {
    /// Subscription whose callback failed.
    pub token: Token,
    /// Kind of the document being delivered.
    pub kind: DocumentKind,
    /// Uid of the document being delivered.
    pub document_uid: String,
    /// Error text or panic message.
    pub message: String,
}

struct Entry {
    token: Token,
    subscription: Subscription,
    callback: Callback,
}

struct Inner {
    entries: RwLock<Vec<Entry>>,
    next_token: AtomicU64,
    failures: broadcast::Sender<CallbackFailure>,
}

/// Cloneable handle to one subscriber registry.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Empty registry.
    pub fn new() -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(Vec::new()),
                next_token: AtomicU64::new(0),
                failures,
            }),
        }
    }

    /// Register `callback` for a kind (or [`Subscription::All`]).
    pub fn subscribe<S, F>(&self, subscription: S, callback: F) -> Token
    where
        S: Into<Subscription>,
        F: Fn(DocumentKind, &Document) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let token = Token(self.inner.next_token.fetch_add(1, Ordering::Relaxed));
        let subscription = subscription.into();
        self.inner.entries.write().push(Entry {
            token,
            subscription,
            callback: Arc::new(callback),
        });
        tracing::debug!(%token, ?subscription, "Subscriber registered");
        token
    }

    /// Remove a subscription. Returns `false` if the token was unknown.
    pub fn unsubscribe(&self, token: Token) -> bool {
        let mut entries = self.inner.entries.write();
        let before = entries.len();
        entries.retain(|e| e.token != token);
        let removed = entries.len() != before;
        if removed {
            tracing::debug!(%token, "Subscriber unregistered");
        }
        removed
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.entries.read().len()
    }

    /// Receiver for callback failures raised by [`Dispatcher::process`].
    pub fn failures(&self) -> broadcast::Receiver<CallbackFailure> {
        self.inner.failures.subscribe()
    }

    /// Deliver one document to every matching subscriber, in subscription
    /// order. Returns the number of callbacks that failed.
    pub fn process(&self, kind: DocumentKind, document: &Document) -> usize {
        // Snapshot so callbacks may subscribe/unsubscribe re-entrantly.
        let targets: Vec<(Token, Callback)> = self
            .inner
            .entries
            .read()
            .iter()
            .filter(|e| e.subscription.matches(kind))
            .map(|e| (e.token, Arc::clone(&e.callback)))
            .collect();

        let mut failed = 0;
        for (token, callback) in targets {
            let message = match catch_unwind(AssertUnwindSafe(|| callback(kind, document))) {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{err:#}"),
                Err(panic) => panic_message(panic.as_ref()),
            };
            failed += 1;
            tracing::error!(
                %token,
                %kind,
                uid = document.uid(),
                error = %message,
                "Subscriber callback failed"
            );
            // No receivers is fine: the failure has been logged.
            let _ = self.inner.failures.send(CallbackFailure {
                token,
                kind,
                document_uid: document.uid().to_string(),
                message,
            });
        }
        failed
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::document::{StartDoc, StopDoc};
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    fn start() -> Document {
        Document::Start(StartDoc::new())
    }

    fn stop() -> Document {
        Document::Stop(StopDoc::success("run", 0))
    }

    #[test]
    fn test_kind_and_wildcard_in_subscription_order() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        dispatcher.subscribe(Subscription::All, move |kind, _| {
            s.lock().push(format!("all:{kind}"));
            Ok(())
        });
        let s = seen.clone();
        dispatcher.subscribe(DocumentKind::Stop, move |kind, _| {
            s.lock().push(format!("stop:{kind}"));
            Ok(())
        });
        let s = seen.clone();
        dispatcher.subscribe(Subscription::All, move |kind, _| {
            s.lock().push(format!("all2:{kind}"));
            Ok(())
        });

        dispatcher.process(DocumentKind::Start, &start());
        dispatcher.process(DocumentKind::Stop, &stop());

        assert_eq!(
            *seen.lock(),
            vec![
                "all:start",
                "all2:start",
                "all:stop",
                "stop:stop",
                "all2:stop"
            ]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let token = dispatcher.subscribe(Subscription::All, move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher.process(DocumentKind::Start, &start());
        assert!(dispatcher.unsubscribe(token));
        assert!(!dispatcher.unsubscribe(token));
        dispatcher.process(DocumentKind::Start, &start());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.subscriber_count(), 0);
    }

    #[traced_test]
    #[test]
    fn test_failing_callback_does_not_block_later_ones() {
        let dispatcher = Dispatcher::new();
        let mut failures = dispatcher.failures();
        let reached = Arc::new(AtomicU64::new(0));

        let bad = dispatcher.subscribe(Subscription::All, |_, _| {
            Err(anyhow::anyhow!("disk full"))
        });
        dispatcher.subscribe(Subscription::All, |_, _| panic!("boom"));
        let r = reached.clone();
        dispatcher.subscribe(Subscription::All, move |_, _| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let failed = dispatcher.process(DocumentKind::Start, &start());

        assert_eq!(failed, 2);
        assert_eq!(reached.load(Ordering::SeqCst), 1);

        let first = failures.try_recv().unwrap();
        assert_eq!(first.token, bad);
        assert_eq!(first.message, "disk full");
        let second = failures.try_recv().unwrap();
        assert!(second.message.contains("boom"));
        assert!(logs_contain("Subscriber callback failed"));
    }

    #[test]
    fn test_reentrant_unsubscribe() {
        let dispatcher = Dispatcher::new();
        let d = dispatcher.clone();
        let token = Arc::new(Mutex::new(None));
        let t = token.clone();
        let registered = dispatcher.subscribe(Subscription::All, move |_, _| {
            if let Some(tok) = *t.lock() {
                d.unsubscribe(tok);
            }
            Ok(())
        });
        *token.lock() = Some(registered);

        dispatcher.process(DocumentKind::Start, &start());
        assert_eq!(dispatcher.subscriber_count(), 0);
    }
}
