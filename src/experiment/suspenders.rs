//! Suspenders: pause plan progress while a monitored condition is bad.
//!
//! A [`Suspender`] watches one [`Signal`] and applies a [`SuspendRule`] to its
//! value. When the rule trips, the owning engine reaches a safe point, runs the
//! optional pre-plan, waits until the value is back in the good region *and has
//! stayed there* for the settle duration, runs the optional post-plan, then
//! continues the plan.
//!
//! ```rust,ignore
//! let beam = SoftSignal::new("ring_current", 400.0);
//! let low_beam = Arc::new(
//!     Suspender::floor(beam.shared(), 300.0)
//!         .with_settle(Duration::from_secs(5))
//!         .with_pre_plan(vec![Msg::new(Command::Null)]),
//! );
//! let handle = engine.install_suspender(&low_beam)?;
//! ```

use super::msg::{Awaitable, Msg};
use crate::error::{EngineError, EngineResult};
use crate::experiment::run_engine::EngineId;
use crate::signal::{is_truthy, Signal};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Metadata key carried by every instruction injected for a suspension.
pub const INJECTED_KEY: &str = "suspension";
/// Metadata key carried only by the `wait_for` that ends a suspension.
pub const WAIT_KEY: &str = "suspension_wait";

static NEXT_SUSPENDER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique suspender identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SuspenderId(u64);

impl fmt::Display for SuspenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "suspender-{}", self.0)
    }
}

/// Comparison applied to the signal value. `true` from
/// [`SuspendRule::should_suspend`] means "tripped".
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SuspendRule {
    /// Trip while the value is truthy.
    BoolHigh,
    /// Trip while the value is falsy.
    BoolLow,
    /// Trip while the value is below the floor.
    Floor(f64),
    /// Trip while the value is above the ceiling.
    Ceil(f64),
    /// Keep the value inside `[lower, upper]`; trip outside it.
    InBand {
        /// Lowest good value.
        lower: f64,
        /// Highest good value.
        upper: f64,
    },
    /// Keep the value outside `[lower, upper]`; trip inside it.
    OutBand {
        /// Bottom of the bad band.
        lower: f64,
        /// Top of the bad band.
        upper: f64,
    },
}

impl SuspendRule {
    /// Whether `value` is in the bad region.
    pub fn should_suspend(&self, value: f64) -> bool {
        match *self {
            SuspendRule::BoolHigh => is_truthy(value),
            SuspendRule::BoolLow => !is_truthy(value),
            SuspendRule::Floor(floor) => value < floor,
            SuspendRule::Ceil(ceil) => value > ceil,
            SuspendRule::InBand { lower, upper } => !(lower..=upper).contains(&value),
            SuspendRule::OutBand { lower, upper } => (lower..=upper).contains(&value),
        }
    }

    fn describe(&self, signal: &str, value: f64) -> String {
        match *self {
            SuspendRule::BoolHigh => format!("Signal {signal} is high ({value})"),
            SuspendRule::BoolLow => format!("Signal {signal} is low ({value})"),
            SuspendRule::Floor(floor) => {
                format!("Signal {signal} = {value} is below {floor}")
            }
            SuspendRule::Ceil(ceil) => format!("Signal {signal} = {value} is above {ceil}"),
            SuspendRule::InBand { lower, upper } => {
                format!("Signal {signal} = {value} is outside of the band [{lower}, {upper}]")
            }
            SuspendRule::OutBand { lower, upper } => {
                format!("Signal {signal} = {value} is inside of the band [{lower}, {upper}]")
            }
        }
    }
}

/// Policy object binding a signal, a trip rule and optional lead-in/lead-out
/// plans.
pub struct Suspender {
    id: SuspenderId,
    signal: Arc<dyn Signal>,
    rule: SuspendRule,
    settle: Duration,
    pre_plan: Option<Vec<Msg>>,
    post_plan: Option<Vec<Msg>>,
    owner: Mutex<Option<EngineId>>,
}

impl Suspender {
    /// Suspender with no settle time and no plans.
    pub fn new(signal: Arc<dyn Signal>, rule: SuspendRule) -> Self {
        Self {
            id: SuspenderId(NEXT_SUSPENDER_ID.fetch_add(1, Ordering::Relaxed)),
            signal,
            rule,
            settle: Duration::ZERO,
            pre_plan: None,
            post_plan: None,
            owner: Mutex::new(None),
        }
    }

    /// Suspend while the signal is truthy.
    pub fn bool_high(signal: Arc<dyn Signal>) -> Self {
        Self::new(signal, SuspendRule::BoolHigh)
    }

    /// Suspend while the signal is falsy.
    pub fn bool_low(signal: Arc<dyn Signal>) -> Self {
        Self::new(signal, SuspendRule::BoolLow)
    }

    /// Suspend while the signal is below `floor`.
    pub fn floor(signal: Arc<dyn Signal>, floor: f64) -> Self {
        Self::new(signal, SuspendRule::Floor(floor))
    }

    /// Suspend while the signal is above `ceil`.
    pub fn ceil(signal: Arc<dyn Signal>, ceil: f64) -> Self {
        Self::new(signal, SuspendRule::Ceil(ceil))
    }

    /// Suspend while the signal leaves `[lower, upper]`. Fails unless `lower < upper`.
    pub fn in_band(signal: Arc<dyn Signal>, lower: f64, upper: f64) -> EngineResult<Self> {
        check_band(lower, upper)?;
        Ok(Self::new(signal, SuspendRule::InBand { lower, upper }))
    }

    /// Suspend while the signal is inside `[lower, upper]`. Fails unless `lower < upper`.
    pub fn out_band(signal: Arc<dyn Signal>, lower: f64, upper: f64) -> EngineResult<Self> {
        check_band(lower, upper)?;
        Ok(Self::new(signal, SuspendRule::OutBand { lower, upper }))
    }

    /// How long the value must stay clear before the engine resumes.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Instructions run before waiting, inside a non-rewindable bracket.
    pub fn with_pre_plan(mut self, plan: Vec<Msg>) -> Self {
        self.pre_plan = Some(plan);
        self
    }

    /// Instructions run after the condition clears, before the bracket closes.
    pub fn with_post_plan(mut self, plan: Vec<Msg>) -> Self {
        self.post_plan = Some(plan);
        self
    }

    /// Process-unique id.
    pub fn id(&self) -> SuspenderId {
        self.id
    }

    /// Trip rule.
    pub fn rule(&self) -> SuspendRule {
        self.rule
    }

    /// Settle time.
    pub fn settle(&self) -> Duration {
        self.settle
    }

    /// Monitored signal.
    pub fn signal(&self) -> &Arc<dyn Signal> {
        &self.signal
    }

    /// Engine this suspender is installed on, if any.
    pub fn owner(&self) -> Option<EngineId> {
        *self.owner.lock()
    }

    /// Whether the current value is in the bad region.
    pub fn is_tripped(&self) -> bool {
        self.rule.should_suspend(self.signal.read())
    }

    /// Why the engine is (or would be) suspended.
    pub fn justification(&self) -> String {
        self.rule
            .describe(self.signal.name(), self.signal.read())
    }

    /// Claim this suspender for `engine`. Fails if another engine owns it.
    pub(crate) fn claim(&self, engine: EngineId) -> EngineResult<()> {
        let mut owner = self.owner.lock();
        match *owner {
            Some(current) => Err(EngineError::AlreadyInstalled {
                name: self.signal.name().to_string(),
                owner: current.to_string(),
            }),
            None => {
                *owner = Some(engine);
                Ok(())
            }
        }
    }

    pub(crate) fn release(&self) {
        *self.owner.lock() = None;
    }

    /// Future that resolves once the value is clear and has stayed clear for
    /// the settle duration. A re-trip during settling restarts the wait.
    pub fn cleared(&self) -> impl Future<Output = ()> + Send + 'static {
        wait_until_settled(self.signal.subscribe(), self.rule, self.settle)
    }

    /// Edge detector forwarding every armed→tripped transition to `on_trip`.
    pub(crate) fn watch_trips<F>(&self, mut on_trip: F) -> impl Future<Output = ()> + Send + 'static
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let mut rx = self.signal.subscribe();
        let rule = self.rule;
        async move {
            let mut tripped = rule.should_suspend(*rx.borrow_and_update());
            while rx.changed().await.is_ok() {
                let now = rule.should_suspend(*rx.borrow_and_update());
                if now && !tripped && !on_trip() {
                    break;
                }
                tripped = now;
            }
        }
    }

    /// Instructions executed for one trip of this suspender.
    pub(crate) fn suspension_block(&self, wait: Awaitable, restore_rewindable: bool) -> Vec<Msg> {
        suspension_block(
            &self.id.to_string(),
            wait,
            self.pre_plan.as_deref(),
            self.post_plan.as_deref(),
            restore_rewindable,
        )
    }
}

impl fmt::Debug for Suspender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspender")
            .field("id", &self.id)
            .field("signal", &self.signal.name())
            .field("rule", &self.rule)
            .field("settle", &self.settle)
            .field("owner", &self.owner())
            .finish()
    }
}

fn check_band(lower: f64, upper: f64) -> EngineResult<()> {
    if lower < upper {
        Ok(())
    } else {
        Err(EngineError::InvalidBand { lower, upper })
    }
}

async fn wait_until_settled(mut rx: watch::Receiver<f64>, rule: SuspendRule, settle: Duration) {
    'clear: loop {
        while rule.should_suspend(*rx.borrow_and_update()) {
            if rx.changed().await.is_err() {
                // Source gone while tripped: it can never clear.
                std::future::pending::<()>().await;
            }
        }
        let deadline = Instant::now() + settle;
        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep_until(deadline).await;
                        return;
                    }
                    if rule.should_suspend(*rx.borrow_and_update()) {
                        continue 'clear;
                    }
                }
            }
        }
    }
}

/// Build `[rewindable(false), pre.., wait_for, post.., rewindable(restore)]`.
///
/// The rewindable bracket is only emitted when there is a pre- or post-plan.
/// Every instruction is tagged with [`INJECTED_KEY`]; the `wait_for` also
/// carries [`WAIT_KEY`] so the engine knows when the condition cleared.
pub(crate) fn suspension_block(
    key: &str,
    wait: Awaitable,
    pre_plan: Option<&[Msg]>,
    post_plan: Option<&[Msg]>,
    restore_rewindable: bool,
) -> Vec<Msg> {
    let bracketed = pre_plan.is_some() || post_plan.is_some();
    let mut block = Vec::new();
    if bracketed {
        block.push(Msg::rewindable(false));
    }
    block.extend(pre_plan.unwrap_or_default().iter().cloned());
    block.push(Msg::wait_for(wait).with_metadata(WAIT_KEY, key));
    block.extend(post_plan.unwrap_or_default().iter().cloned());
    if bracketed {
        block.push(Msg::rewindable(restore_rewindable));
    }
    block
        .into_iter()
        .map(|msg| msg.with_metadata(INJECTED_KEY, key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SoftSignal;

    #[test]
    fn test_rules() {
        assert!(SuspendRule::BoolHigh.should_suspend(1.0));
        assert!(!SuspendRule::BoolHigh.should_suspend(0.0));
        assert!(SuspendRule::BoolLow.should_suspend(0.0));
        assert!(SuspendRule::Floor(0.5).should_suspend(0.0));
        assert!(!SuspendRule::Floor(0.5).should_suspend(0.5));
        assert!(SuspendRule::Ceil(0.5).should_suspend(1.0));
        assert!(!SuspendRule::Ceil(0.5).should_suspend(0.5));

        let in_band = SuspendRule::InBand { lower: 0.5, upper: 1.5 };
        assert!(!in_band.should_suspend(1.0));
        assert!(!in_band.should_suspend(1.5));
        assert!(in_band.should_suspend(0.0));

        let out_band = SuspendRule::OutBand { lower: 0.5, upper: 1.5 };
        assert!(out_band.should_suspend(1.0));
        assert!(!out_band.should_suspend(2.0));
    }

    #[test]
    fn test_band_validation() {
        let sig = SoftSignal::new("x", 0.0);
        assert!(Suspender::in_band(sig.shared(), 1.5, 0.5).is_err());
        assert!(Suspender::out_band(sig.shared(), 1.0, 1.0).is_err());
        assert!(Suspender::in_band(sig.shared(), 0.5, 1.5).is_ok());
    }

    #[test]
    fn test_justification_names_signal() {
        let sig = SoftSignal::new("ring_current", 10.0);
        let susp = Suspender::floor(sig.shared(), 100.0);
        assert!(susp.is_tripped());
        assert_eq!(
            susp.justification(),
            "Signal ring_current = 10 is below 100"
        );
    }

    #[test]
    fn test_claim_is_exclusive() {
        let sig = SoftSignal::new("x", 0.0);
        let susp = Suspender::bool_high(sig.shared());
        let a = EngineId::new();
        let b = EngineId::new();

        susp.claim(a).unwrap();
        assert!(matches!(
            susp.claim(b),
            Err(EngineError::AlreadyInstalled { .. })
        ));
        susp.release();
        assert!(susp.owner().is_none());
        susp.claim(b).unwrap();
        assert_eq!(susp.owner(), Some(b));
    }

    #[test]
    fn test_block_without_plans_is_bare_wait() {
        let block = suspension_block("k", Awaitable::ready(), None, None, true);
        let names: Vec<_> = block.iter().map(Msg::name).collect();
        assert_eq!(names, vec!["wait_for"]);
        assert!(block[0].metadata.contains_key(WAIT_KEY));
    }

    #[test]
    fn test_block_brackets_pre_and_post() {
        let pre = vec![Msg::null()];
        let post = vec![Msg::null()];
        let block = suspension_block("k", Awaitable::ready(), Some(&pre), Some(&post), true);
        let names: Vec<_> = block.iter().map(Msg::name).collect();
        assert_eq!(
            names,
            vec!["rewindable", "null", "wait_for", "null", "rewindable"]
        );
        assert!(block.iter().all(|m| m.metadata.contains_key(INJECTED_KEY)));
        assert_eq!(
            block.iter().filter(|m| m.metadata.contains_key(WAIT_KEY)).count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_waits_for_settle() {
        let sig = SoftSignal::new("x", 1.0);
        let susp = Suspender::bool_high(sig.shared()).with_settle(Duration::from_secs(2));

        let setter = sig.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            setter.put(0.0);
        });

        let start = Instant::now();
        susp.cleared().await;
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrip_during_settle_restarts_wait() {
        let sig = SoftSignal::new("x", 0.0);
        let susp = Suspender::bool_high(sig.shared()).with_settle(Duration::from_secs(2));

        let setter = sig.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            setter.put(1.0);
            tokio::time::sleep(Duration::from_secs(1)).await;
            setter.put(0.0);
        });

        let start = Instant::now();
        susp.cleared().await;
        // clear at 2s, then settle for 2s
        assert!(start.elapsed() >= Duration::from_secs(4));
    }
}
