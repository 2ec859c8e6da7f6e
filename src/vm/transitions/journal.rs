use crate::rand::compute_random_seed;
use crate::service_protocol::messages::{
    CompletableEntry, EntryHeaderEq, InputEntryMessage, ProtocolMessage, WriteableMessage,
};
use crate::vm::context::Context;
use crate::vm::errors::{EntryMismatchError, UnavailableEntryError};
use crate::vm::transitions::{Transition, TransitionAndReturn};
use crate::vm::State;
use crate::{AsyncResultHandle, Error, Header, Input};
use std::fmt;

pub(crate) struct SysInput;

impl TransitionAndReturn<Context, SysInput> for State {
    type Output = Input;

    fn transition_and_return(
        self,
        context: &mut Context,
        _: SysInput,
    ) -> Result<(Self, Self::Output), Error> {
        context.journal.transition(&InputEntryMessage::default());
        let (s, msg) = TransitionAndReturn::transition_and_return(
            self,
            context,
            PopJournalEntry("SysInput", InputEntryMessage::default()),
        )?;
        let start_info = context.expect_start_info();

        Ok((
            s,
            Input {
                invocation_id: start_info.debug_id.clone(),
                random_seed: compute_random_seed(&start_info.id),
                key: start_info.key.clone(),
                headers: msg.headers.into_iter().map(Header::from).collect(),
                input: msg.value,
            },
        ))
    }
}

/// An entry that is completed on append: journal it and move on, there is
/// nothing to await.
pub(crate) struct SysNonCompletableEntry<M>(pub(crate) &'static str, pub(crate) M);

impl<M: WriteableMessage + EntryHeaderEq + Clone + fmt::Debug>
    Transition<Context, SysNonCompletableEntry<M>> for State
{
    fn transition(
        self,
        context: &mut Context,
        SysNonCompletableEntry(sys_name, expected): SysNonCompletableEntry<M>,
    ) -> Result<Self, Error> {
        context.journal.transition(&expected);
        let (s, _) = self.transition_and_return(context, PopOrWriteJournalEntry(sys_name, expected))?;
        Ok(s)
    }
}

/// An entry awaiting a result: journal it, register how to parse the
/// completion, hand back the handle to await.
pub(crate) struct SysCompletableEntry<M>(pub(crate) &'static str, pub(crate) M);

impl<M: CompletableEntry + WriteableMessage + Clone + fmt::Debug>
    TransitionAndReturn<Context, SysCompletableEntry<M>> for State
{
    type Output = AsyncResultHandle;

    fn transition_and_return(
        self,
        context: &mut Context,
        SysCompletableEntry(sys_name, expected): SysCompletableEntry<M>,
    ) -> Result<(Self, Self::Output), Error> {
        context.journal.transition(&expected);
        let (mut s, actual) =
            TransitionAndReturn::transition_and_return(
                self,
                context,
                PopOrWriteJournalEntry(sys_name, expected),
            )?;

        let index = context.journal.expect_index();
        match s {
            State::Replaying {
                ref mut async_results,
                ..
            }
            | State::Processing {
                ref mut async_results,
                ..
            } => {
                if actual.is_completed() {
                    let value = actual
                        .into_result()?
                        .expect("completed entries carry a result");
                    async_results.insert_ready_result(index, value);
                } else {
                    async_results
                        .insert_completion_parsing_hint(index, M::completion_parsing_hint())?;
                }
                Ok((s, AsyncResultHandle::from(index)))
            }
            s => Err(s.as_unexpected_state(sys_name)),
        }
    }
}

// --- Few reusable transitions

pub(crate) struct PopJournalEntry<M>(pub(crate) &'static str, pub(crate) M);

impl<M: ProtocolMessage + EntryHeaderEq + Clone + fmt::Debug>
    TransitionAndReturn<Context, PopJournalEntry<M>> for State
{
    type Output = M;

    fn transition_and_return(
        self,
        context: &mut Context,
        PopJournalEntry(sys_name, expected): PopJournalEntry<M>,
    ) -> Result<(Self, Self::Output), Error> {
        match self {
            State::Replaying {
                current_await_point,
                mut entries,
                async_results,
            } => {
                let actual = entries
                    .pop_front()
                    .ok_or(UnavailableEntryError::new(M::ty()))?
                    .decode_to::<M>()?;
                let new_state = if entries.is_empty() {
                    // Replay prefix exhausted, the next entry is a live one.
                    State::Processing {
                        current_await_point,
                        async_results,
                    }
                } else {
                    State::Replaying {
                        current_await_point,
                        entries,
                        async_results,
                    }
                };

                check_entry_header_match(context.journal.expect_index(), &actual, &expected)?;

                Ok((new_state, actual))
            }
            s => Err(s.as_unexpected_state(sys_name)),
        }
    }
}

pub(crate) struct PopOrWriteJournalEntry<M>(pub(crate) &'static str, pub(crate) M);

impl<M: WriteableMessage + EntryHeaderEq + Clone + fmt::Debug>
    TransitionAndReturn<Context, PopOrWriteJournalEntry<M>> for State
{
    type Output = M;

    fn transition_and_return(
        self,
        context: &mut Context,
        PopOrWriteJournalEntry(sys_name, expected): PopOrWriteJournalEntry<M>,
    ) -> Result<(Self, Self::Output), Error> {
        match self {
            State::Processing { .. } => {
                context.output.send(&expected);
                Ok((self, expected))
            }
            s => s.transition_and_return(context, PopJournalEntry(sys_name, expected)),
        }
    }
}

fn check_entry_header_match<M: EntryHeaderEq + Clone + fmt::Debug>(
    entry_index: u32,
    actual: &M,
    expected: &M,
) -> Result<(), Error> {
    if !actual.header_eq(expected) {
        return Err(
            EntryMismatchError::new(entry_index, actual.clone(), expected.clone()).into(),
        );
    }

    Ok(())
}
