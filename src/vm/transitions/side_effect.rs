use crate::retries::NextRetry;
use crate::service_protocol::messages::{
    side_effect_entry_message, CompletionParsingHint, Failure, SideEffectEntryMessage,
};
use crate::service_protocol::MessageType;
use crate::vm::context::Context;
use crate::vm::errors::{
    forbidden_in_side_effect, EmptySideEffectResult, SIDE_EFFECT_EXIT_WITHOUT_ENTER,
};
use crate::vm::transitions::{PopJournalEntry, PopOrWriteJournalEntry, Transition, TransitionAndReturn};
use crate::vm::State;
use crate::{
    AsyncResultHandle, Error, NonEmptyValue, ProtocolMode, RetryPolicy, SideEffectEnterResult,
    SideEffectExitOutcome, SideEffectExitResult, Value,
};

pub(crate) struct SysSideEffectEnter;

impl TransitionAndReturn<Context, SysSideEffectEnter> for State {
    type Output = SideEffectEnterResult;

    fn transition_and_return(
        self,
        context: &mut Context,
        _: SysSideEffectEnter,
    ) -> Result<(Self, Self::Output), Error> {
        match self {
            State::Replaying { ref entries, .. }
                if entries.front().map(|e| e.ty()) == Some(MessageType::SideEffectEntry) =>
            {
                // The recorded execution committed this side effect, the
                // closure must not run again.
                context
                    .journal
                    .transition(&SideEffectEntryMessage::default());
                let (s, actual) = TransitionAndReturn::transition_and_return(
                    self,
                    context,
                    PopJournalEntry("SysSideEffectEnter", SideEffectEntryMessage::default()),
                )?;
                let result = actual.result.ok_or(EmptySideEffectResult)?;
                context.side_effect.reset();
                Ok((s, SideEffectEnterResult::Executed(result.into())))
            }
            s @ State::Replaying { .. } | s @ State::Processing { .. } => {
                // Either live execution, or replay of a retry backoff: the
                // next recorded entry (if any) is the backoff sleep, not a
                // committed result.
                context.side_effect.start_attempt();
                Ok((s, SideEffectEnterResult::NotExecuted))
            }
            s => Err(s.as_unexpected_state("SysSideEffectEnter")),
        }
    }
}

pub(crate) struct SysSideEffectExit<'a>(
    pub(crate) SideEffectExitResult,
    pub(crate) &'a RetryPolicy,
);

impl TransitionAndReturn<Context, SysSideEffectExit<'_>> for State {
    type Output = SideEffectExitOutcome;

    fn transition_and_return(
        self,
        context: &mut Context,
        SysSideEffectExit(value, retry_policy): SysSideEffectExit<'_>,
    ) -> Result<(Self, Self::Output), Error> {
        if !context.side_effect.is_running() {
            return Err(SIDE_EFFECT_EXIT_WITHOUT_ENTER);
        }
        context.side_effect.finish_attempt();

        let result = match value {
            SideEffectExitResult::Success(b) => side_effect_entry_message::Result::Value(b),
            SideEffectExitResult::TerminalFailure(f) => {
                side_effect_entry_message::Result::Failure(f.into())
            }
            SideEffectExitResult::RetryableFailure(error) => {
                match retry_policy.next_retry(context.side_effect.attempts()) {
                    NextRetry::Retry(delay) => {
                        // Nothing is journaled for a failed attempt: the
                        // runner schedules the backoff as an ordinary sleep
                        // entry and re-enters afterwards.
                        return Ok((self, SideEffectExitOutcome::ScheduleRetry(delay)));
                    }
                    NextRetry::DoNotRetry => {
                        // Attempts exhausted, the failure becomes terminal
                        // and is journaled as the side effect result.
                        side_effect_entry_message::Result::Failure(Failure {
                            code: error.code() as u32,
                            message: error.message().to_owned(),
                        })
                    }
                }
            }
        };

        let expected = SideEffectEntryMessage {
            result: Some(result),
        };
        context.journal.transition(&expected);
        let (mut s, actual) = TransitionAndReturn::transition_and_return(
            self,
            context,
            PopOrWriteJournalEntry("SysSideEffectExit", expected),
        )?;

        let index = context.journal.expect_index();
        let value: Value = NonEmptyValue::from(actual.result.ok_or(EmptySideEffectResult)?).into();
        match s {
            State::Replaying {
                ref mut async_results,
                ..
            }
            | State::Processing {
                ref mut async_results,
                ..
            } => {
                if context.mode == ProtocolMode::RequestResponse {
                    // No acks will come back on this transport.
                    async_results.insert_ready_result(index, value);
                } else {
                    // The committed result is released by the entry ack, or
                    // by an explicit completion, whichever comes first.
                    async_results.insert_completion_parsing_hint(
                        index,
                        CompletionParsingHint::EmptyOrSuccessOrValue,
                    )?;
                    async_results.insert_waiting_ack_result(index, value);
                }
                context.side_effect.reset();
                Ok((
                    s,
                    SideEffectExitOutcome::Committed(AsyncResultHandle::from(index)),
                ))
            }
            s => Err(s.as_unexpected_state("SysSideEffectExit")),
        }
    }
}

/// A forbidden context operation was attempted while a side effect closure
/// was running. The fixed terminal failure is recorded as the side effect
/// result, and the invocation dies with it.
pub(crate) struct SysSideEffectViolation(pub(crate) &'static str);

impl Transition<Context, SysSideEffectViolation> for State {
    fn transition(
        self,
        context: &mut Context,
        SysSideEffectViolation(op): SysSideEffectViolation,
    ) -> Result<Self, Error> {
        let error = forbidden_in_side_effect(op);

        let entry = SideEffectEntryMessage {
            result: Some(side_effect_entry_message::Result::Failure(Failure {
                code: error.code() as u32,
                message: error.message().to_owned(),
            })),
        };
        context.journal.transition(&entry);
        context.output.send(&entry);
        context.side_effect.finish_attempt();

        Err(error)
    }
}
