use crate::vm::context::Context;
use crate::vm::transitions::{HitSuspensionPoint, Transition, TransitionAndReturn};
use crate::vm::State;
use crate::{Error, SuspendedError, Value};

pub(crate) struct NotifyAwaitPoint(pub(crate) u32);

impl Transition<Context, NotifyAwaitPoint> for State {
    fn transition(
        mut self,
        _: &mut Context,
        NotifyAwaitPoint(await_point): NotifyAwaitPoint,
    ) -> Result<Self, Error> {
        match &mut self {
            State::Replaying {
                current_await_point,
                ..
            }
            | State::Processing {
                current_await_point,
                ..
            } => {
                *current_await_point = Some(await_point);
            }
            s => return Err(s.as_unexpected_state("NotifyAwaitPoint")),
        };

        Ok(self)
    }
}

pub(crate) struct TakeAsyncResult(pub(crate) u32);

impl TransitionAndReturn<Context, TakeAsyncResult> for State {
    type Output = Result<Option<Value>, SuspendedError>;

    fn transition_and_return(
        mut self,
        context: &mut Context,
        TakeAsyncResult(index): TakeAsyncResult,
    ) -> Result<(Self, Self::Output), Error> {
        match self {
            State::Replaying {
                ref mut current_await_point,
                ref mut async_results,
                ..
            }
            | State::Processing {
                ref mut current_await_point,
                ref mut async_results,
                ..
            } => {
                if let Some(value) = async_results.take_ready_result(index) {
                    if *current_await_point == Some(index) {
                        *current_await_point = None;
                    }
                    return Ok((self, Ok(Some(value))));
                }

                if context.input_is_closed {
                    // No more completions will come for this entry, release
                    // the execution slot.
                    let s = self.transition(context, HitSuspensionPoint(vec![index]))?;
                    return Ok((s, Err(SuspendedError)));
                }

                Ok((self, Ok(None)))
            }
            s => Err(s.as_unexpected_state("TakeAsyncResult")),
        }
    }
}
