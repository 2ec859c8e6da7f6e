use crate::service_protocol::messages::{EndMessage, SuspensionMessage};
use crate::vm::context::Context;
use crate::vm::transitions::Transition;
use crate::vm::State;
use crate::Error;

pub(crate) struct HitError(pub(crate) Error);

impl Transition<Context, HitError> for State {
    fn transition(self, _: &mut Context, HitError(error): HitError) -> Result<Self, Error> {
        // We let CoreVM::do_transition handle this
        Err(error)
    }
}

pub(crate) struct HitSuspensionPoint(pub(crate) Vec<u32>);

impl Transition<Context, HitSuspensionPoint> for State {
    fn transition(
        self,
        context: &mut Context,
        HitSuspensionPoint(entry_indexes): HitSuspensionPoint,
    ) -> Result<Self, Error> {
        if matches!(self, State::Suspended | State::Closed) {
            // Nothing to do
            return Ok(self);
        }
        debug_assert!(
            !entry_indexes.is_empty(),
            "A suspension must list at least one entry index"
        );
        tracing::debug!("Suspending");

        context.output.send(&SuspensionMessage { entry_indexes });
        context.output.send_eof();

        Ok(State::Suspended)
    }
}

pub(crate) struct SysEnd;

impl Transition<Context, SysEnd> for State {
    fn transition(self, context: &mut Context, _: SysEnd) -> Result<Self, Error> {
        match self {
            State::Processing { .. } => {
                context.output.send(&EndMessage {});
                context.output.send_eof();
                Ok(State::Closed)
            }
            s @ State::Closed | s @ State::Suspended => {
                // Tolerate the case where the state machine is already closed/suspended
                Ok(s)
            }
            s => Err(s.as_unexpected_state("SysEnd")),
        }
    }
}
