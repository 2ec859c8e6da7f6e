use crate::vm::context::Context;
use crate::vm::transitions::{HitSuspensionPoint, Transition, TransitionAndReturn};
use crate::vm::State;
use crate::{
    AsyncResultAccessTracker, AsyncResultCombinator, AsyncResultHandle, AsyncResultState, Error,
};
use std::collections::HashMap;

pub(crate) struct AsyncResultAccessTrackerInner {
    known_results: HashMap<AsyncResultHandle, AsyncResultState>,
    tracked_access_to_uncompleted_results: Vec<AsyncResultHandle>,
}

impl AsyncResultAccessTrackerInner {
    pub(crate) fn new(known_results: HashMap<AsyncResultHandle, AsyncResultState>) -> Self {
        Self {
            known_results,
            tracked_access_to_uncompleted_results: vec![],
        }
    }

    pub fn get_state(&mut self, handle: AsyncResultHandle) -> AsyncResultState {
        if let Some(res) = self.known_results.get(&handle) {
            *res
        } else {
            if !self
                .tracked_access_to_uncompleted_results
                .contains(&handle)
            {
                self.tracked_access_to_uncompleted_results.push(handle);
            }
            AsyncResultState::NotReady
        }
    }

    /// Handles observed as not ready, in access order. These are the entries
    /// a suspension has to list.
    fn into_uncompleted_accesses(self) -> Vec<AsyncResultHandle> {
        self.tracked_access_to_uncompleted_results
    }
}

pub(crate) struct SysTryCompleteCombinator<C>(pub(crate) C);

impl<C> TransitionAndReturn<Context, SysTryCompleteCombinator<C>> for State
where
    C: AsyncResultCombinator,
{
    type Output = Option<Vec<AsyncResultHandle>>;

    fn transition_and_return(
        self,
        context: &mut Context,
        SysTryCompleteCombinator(combinator): SysTryCompleteCombinator<C>,
    ) -> Result<(Self, Self::Output), Error> {
        match self {
            State::Replaying {
                ref async_results, ..
            }
            | State::Processing {
                ref async_results, ..
            } => {
                // The combinator is not a journal entry: its completion rule
                // is re-evaluated over the known results whenever a child
                // resolves. Children are inspected in registration order, so
                // the outcome is deterministic given the same results.
                let mut tracker = AsyncResultAccessTracker(AsyncResultAccessTrackerInner::new(
                    async_results.get_ready_results_state(),
                ));

                if let Some(combinator_result) = combinator.try_complete(&mut tracker) {
                    Ok((self, Some(combinator_result)))
                } else if context.input_is_closed {
                    // No completion can unblock any of the children anymore.
                    let uncompleted = tracker.0.into_uncompleted_accesses();
                    let s = self.transition(
                        context,
                        HitSuspensionPoint(uncompleted.into_iter().map(u32::from).collect()),
                    )?;
                    Ok((s, None))
                } else {
                    // More input may still complete a child.
                    Ok((self, None))
                }
            }
            s => Err(s.as_unexpected_state("SysTryCompleteCombinator")),
        }
    }
}
