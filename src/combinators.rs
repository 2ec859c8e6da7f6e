//! Journal-aware promise combinators.
//!
//! A combinator is not a journal entry: it's a predicate over the completion
//! state of its children, re-evaluated through
//! [`crate::VM::sys_try_complete_combinator`] whenever a child resolves. The
//! children are always inspected in the order they were registered, so the
//! reported result is deterministic given the same set of ready results.

use crate::{AsyncResultAccessTracker, AsyncResultCombinator, AsyncResultHandle, AsyncResultState};

fn states(
    tracker: &mut AsyncResultAccessTracker,
    handles: &[AsyncResultHandle],
) -> Vec<AsyncResultState> {
    handles.iter().map(|h| tracker.get_state(*h)).collect()
}

/// Completes when every child succeeded, or as soon as one child failed.
/// The result is the failed handle, or all handles in registration order.
#[derive(Debug, Clone)]
pub struct All(pub Vec<AsyncResultHandle>);

impl AsyncResultCombinator for All {
    fn try_complete(
        &self,
        tracker: &mut AsyncResultAccessTracker,
    ) -> Option<Vec<AsyncResultHandle>> {
        let states = states(tracker, &self.0);

        if let Some(failed) = self
            .0
            .iter()
            .zip(&states)
            .find(|(_, s)| **s == AsyncResultState::Failure)
        {
            return Some(vec![*failed.0]);
        }

        states
            .iter()
            .all(|s| *s == AsyncResultState::Success)
            .then(|| self.0.clone())
    }
}

/// Completes as soon as any child settled, with that child's handle.
#[derive(Debug, Clone)]
pub struct Race(pub Vec<AsyncResultHandle>);

impl AsyncResultCombinator for Race {
    fn try_complete(
        &self,
        tracker: &mut AsyncResultAccessTracker,
    ) -> Option<Vec<AsyncResultHandle>> {
        let states = states(tracker, &self.0);

        self.0
            .iter()
            .zip(&states)
            .find(|(_, s)| **s != AsyncResultState::NotReady)
            .map(|(h, _)| vec![*h])
    }
}

/// Completes with the first successful child, or with all handles once every
/// child failed.
#[derive(Debug, Clone)]
pub struct Any(pub Vec<AsyncResultHandle>);

impl AsyncResultCombinator for Any {
    fn try_complete(
        &self,
        tracker: &mut AsyncResultAccessTracker,
    ) -> Option<Vec<AsyncResultHandle>> {
        let states = states(tracker, &self.0);

        if let Some(succeeded) = self
            .0
            .iter()
            .zip(&states)
            .find(|(_, s)| **s == AsyncResultState::Success)
        {
            return Some(vec![*succeeded.0]);
        }

        states
            .iter()
            .all(|s| *s == AsyncResultState::Failure)
            .then(|| self.0.clone())
    }
}

/// Completes once every child settled, success or failure alike.
#[derive(Debug, Clone)]
pub struct AllSettled(pub Vec<AsyncResultHandle>);

impl AsyncResultCombinator for AllSettled {
    fn try_complete(
        &self,
        tracker: &mut AsyncResultAccessTracker,
    ) -> Option<Vec<AsyncResultHandle>> {
        states(tracker, &self.0)
            .iter()
            .all(|s| *s != AsyncResultState::NotReady)
            .then(|| self.0.clone())
    }
}
