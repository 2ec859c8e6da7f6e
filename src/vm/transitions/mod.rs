mod async_results;
mod combinators;
mod input;
mod journal;
mod side_effect;
mod terminal;

use crate::service_protocol::messages::{
    output_entry_message, EndMessage, Failure, OutputEntryMessage,
};
use crate::vm::context::Context;
use crate::vm::State;
use crate::{CoreVM, Error};
pub(crate) use async_results::*;
pub(crate) use combinators::*;
pub(crate) use input::*;
pub(crate) use journal::*;
pub(crate) use side_effect::*;
use std::mem;
pub(crate) use terminal::*;

trait Transition<CTX, E>
where
    Self: Sized,
{
    fn transition(self, context: &mut CTX, event: E) -> Result<Self, Error>;
}

pub(crate) trait TransitionAndReturn<CTX, E>
where
    Self: Sized,
{
    type Output;
    fn transition_and_return(
        self,
        context: &mut CTX,
        event: E,
    ) -> Result<(Self, Self::Output), Error>;
}

impl<STATE, CTX, E> TransitionAndReturn<CTX, E> for STATE
where
    Self: Transition<CTX, E>,
{
    type Output = ();

    fn transition_and_return(
        self,
        context: &mut CTX,
        event: E,
    ) -> Result<(Self, Self::Output), Error> {
        Transition::transition(self, context, event).map(|s| (s, ()))
    }
}

impl CoreVM {
    pub(super) fn do_transition<E, O>(&mut self, event: E) -> Result<O, Error>
    where
        State: TransitionAndReturn<Context, E, Output = O>,
    {
        match mem::replace(&mut self.last_transition, Ok(State::WaitingStart)) {
            Err(e) => {
                // The state machine is in error mode, we just propagate back the error
                self.last_transition = Err(e.clone());
                Err(e)
            }
            Ok(s) => {
                let was_closed = matches!(s, State::Closed);
                match TransitionAndReturn::transition_and_return(s, &mut self.context, event) {
                    Ok((new_state, output)) => {
                        self.last_transition = Ok(new_state);
                        Ok(output)
                    }
                    Err(e) => {
                        self.last_transition = Err(e.clone());
                        tracing::debug!("Failed with error {e}");

                        // This protocol has no dedicated error message: a
                        // fatal error ends the invocation with a terminal
                        // output failure.
                        if !was_closed {
                            self.context.output.send(&e.as_output_failure());
                            self.context.output.send(&EndMessage::default());
                            self.context.output.send_eof();
                        }

                        Err(e)
                    }
                }
            }
        }
    }
}

impl Error {
    fn as_output_failure(&self) -> OutputEntryMessage {
        OutputEntryMessage {
            result: Some(output_entry_message::Result::Failure(Failure {
                code: self.code() as u32,
                message: self.message().to_owned(),
            })),
        }
    }
}
