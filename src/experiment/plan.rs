//! Plans and the instruction insertion stack.
//!
//! A plan is a lazy, possibly infinite, non-restartable sequence of [`Msg`]s:
//! anything that iterates messages and can move between tasks. The engine
//! draws from a [`PlanStack`], where sub-sequences (suspension blocks, replayed
//! instructions, pre/post plans) are pushed on top and consumed before the
//! outer sequence continues.

use super::msg::Msg;

/// A boxed lazy instruction stream.
pub type Plan = Box<dyn Iterator<Item = Msg> + Send>;

/// Box any iterable of messages as a [`Plan`].
pub fn plan<I>(msgs: I) -> Plan
where
    I: IntoIterator<Item = Msg>,
    I::IntoIter: Send + 'static,
{
    Box::new(msgs.into_iter())
}

/// Stack of instruction streams; the topmost non-exhausted stream is drawn
/// from first.
#[derive(Default)]
pub struct PlanStack {
    frames: Vec<Plan>,
}

impl PlanStack {
    /// Stack holding only `root`.
    pub fn new(root: Plan) -> Self {
        Self { frames: vec![root] }
    }

    /// Push a sub-sequence to run before whatever is currently pending.
    pub fn insert<I>(&mut self, msgs: I)
    where
        I: IntoIterator<Item = Msg>,
        I::IntoIter: Send + 'static,
    {
        self.frames.push(plan(msgs));
    }

    /// Draw the next instruction, discarding exhausted frames.
    pub fn next_msg(&mut self) -> Option<Msg> {
        while let Some(top) = self.frames.last_mut() {
            if let Some(msg) = top.next() {
                return Some(msg);
            }
            self.frames.pop();
        }
        None
    }

    /// Number of live frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Drop every pending instruction.
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

impl std::fmt::Debug for PlanStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanStack")
            .field("depth", &self.frames.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn names(stack: &mut PlanStack) -> Vec<&'static str> {
        std::iter::from_fn(|| stack.next_msg())
            .map(|m| m.name())
            .collect()
    }

    #[test]
    fn test_inserted_frames_run_first() {
        let mut stack = PlanStack::new(plan(vec![
            Msg::checkpoint(),
            Msg::sleep(Duration::from_millis(1)),
        ]));
        assert_eq!(stack.next_msg().map(|m| m.name()), Some("checkpoint"));

        stack.insert(vec![Msg::null()]);
        stack.insert(vec![Msg::rewindable(false)]);

        assert_eq!(names(&mut stack), vec!["rewindable", "null", "sleep"]);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_lazy_infinite_plan() {
        let mut stack = PlanStack::new(plan(std::iter::repeat_with(Msg::null)));
        for _ in 0..1000 {
            assert_eq!(stack.next_msg().map(|m| m.name()), Some("null"));
        }
        stack.clear();
        assert!(stack.next_msg().is_none());
    }
}
