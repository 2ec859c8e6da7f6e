use crate::headers::HeaderMap;
use crate::service_protocol::messages::get_state_keys_entry_message::StateKeys;
use crate::service_protocol::messages::{
    get_state_entry_message, get_state_keys_entry_message, output_entry_message,
    AwakeableEntryMessage, BackgroundInvokeEntryMessage, ClearAllStateEntryMessage,
    ClearStateEntryMessage, Empty, GetStateEntryMessage, GetStateKeysEntryMessage,
    InvokeEntryMessage, OutputEntryMessage, RejectAwakeableEntryMessage,
    ResolveAwakeableEntryMessage, SetStateEntryMessage, SleepEntryMessage,
};
use crate::service_protocol::{Decoder, RawMessage, Version};
use crate::vm::context::{Context, EagerGetState, EagerGetStateKeys};
use crate::vm::errors::UnexpectedStateError;
use crate::vm::transitions::*;
use crate::{
    AsyncResultCombinator, AsyncResultHandle, Error, Header, Input, NonEmptyValue, ResponseHead,
    RetryPolicy, SideEffectEnterResult, SideEffectExitOutcome, SideEffectExitResult,
    SuspendedOrVMError, TakeOutputResult, Target, TerminalFailure, VMOptions, VMResult, Value,
};
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::{alphabet, Engine};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use context::{AsyncResultsState, Output};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;
use std::mem::size_of;
use std::time::Duration;
use strum::IntoStaticStr;
use tracing::instrument;

mod context;
pub(crate) mod errors;
mod transitions;

pub(crate) use transitions::AsyncResultAccessTrackerInner;

const CONTENT_TYPE: &str = "content-type";
const X_RESTATE_SERVER: &str = "x-restate-server";
const X_RESTATE_SERVER_VALUE: &str =
    concat!("restate-invocation-core/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, IntoStaticStr)]
pub(crate) enum State {
    WaitingStart,
    WaitingReplayEntries {
        entries: VecDeque<RawMessage>,
        async_results: AsyncResultsState,
    },
    Replaying {
        current_await_point: Option<u32>,
        entries: VecDeque<RawMessage>,
        async_results: AsyncResultsState,
    },
    Processing {
        current_await_point: Option<u32>,
        async_results: AsyncResultsState,
    },
    Suspended,
    Closed,
}

impl State {
    fn as_unexpected_state(&self, event: &'static str) -> Error {
        UnexpectedStateError::new(self.into(), event).into()
    }
}

pub struct CoreVM {
    version: Version,

    // Input decoder
    decoder: Decoder,

    // State machine
    context: Context,
    last_transition: Result<State, Error>,
}

impl CoreVM {
    // Returns empty string if the invocation id is not present
    fn debug_invocation_id(&self) -> &str {
        if let Some(start_info) = self.context.start_info() {
            &start_info.debug_id
        } else {
            ""
        }
    }

    /// Context operations are forbidden while a side effect closure runs.
    /// Each forbidden operation dies with its own fixed terminal message.
    fn verify_not_inside_side_effect(&mut self, op: &'static str) -> VMResult<()> {
        if self.context.side_effect.is_running() {
            return self.do_transition(SysSideEffectViolation(op));
        }
        Ok(())
    }
}

impl fmt::Debug for CoreVM {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("CoreVM");
        s.field("version", &self.version);

        if let Some(start_info) = self.context.start_info() {
            s.field("invocation_id", &start_info.debug_id);
        }

        match &self.last_transition {
            Ok(state) => s.field("last_transition", &<&'static str>::from(state)),
            Err(_) => s.field("last_transition", &"Errored"),
        };

        s.field("journal_index", &self.context.journal.index())
            .field("current_entry_ty", &self.context.journal.current_entry_ty)
            .finish()
    }
}

// --- Bound checks
#[allow(unused)]
const fn is_send<T: Send>() {}
const _: () = is_send::<CoreVM>();

// Macro used for informative debug logs. Logs emitted while replaying would
// repeat what the previous attempt already logged, so they're suppressed.
macro_rules! invocation_debug_logs {
    ($this:expr, $($arg:tt)*) => {
        if ($this.is_processing()) {
            tracing::debug!($($arg)*)
        }
    };
}

impl super::VM for CoreVM {
    #[instrument(level = "trace", skip_all, ret)]
    fn new(request_headers: impl HeaderMap, options: VMOptions) -> Result<Self, Error> {
        let version = request_headers
            .extract(CONTENT_TYPE)
            .map_err(|e| {
                Error::new(
                    errors::codes::BAD_REQUEST,
                    format!("cannot read '{CONTENT_TYPE}' header: {e:?}"),
                )
            })?
            .ok_or(errors::MISSING_CONTENT_TYPE)?
            .parse::<Version>()?;

        Ok(Self {
            version,
            decoder: Decoder::new(version),
            context: Context {
                input_is_closed: false,
                output: Output::new(version, options.mode),
                start_info: None,
                journal: Default::default(),
                eager_state: Default::default(),
                side_effect: Default::default(),
                mode: options.mode,
            },
            last_transition: Ok(State::WaitingStart),
        })
    }

    #[instrument(
        level = "trace",
        skip(self),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.protocol.version = %self.version),
        ret
    )]
    fn get_response_head(&self) -> ResponseHead {
        ResponseHead {
            status_code: 200,
            headers: vec![
                Header {
                    key: Cow::Borrowed(CONTENT_TYPE),
                    value: Cow::Borrowed(self.version.content_type()),
                },
                Header {
                    key: Cow::Borrowed(X_RESTATE_SERVER),
                    value: Cow::Borrowed(X_RESTATE_SERVER_VALUE),
                },
            ],
            version: self.version,
        }
    }

    #[instrument(
        level = "trace",
        skip(self, buffer),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn notify_input(&mut self, buffer: Bytes) {
        self.decoder.push(buffer);
        loop {
            match self.decoder.consume_next() {
                Ok(Some(msg)) => {
                    if self.do_transition(NewMessage(msg)).is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    return;
                }
                Err(e) => {
                    if self.do_transition(HitError(e.into())).is_err() {
                        return;
                    }
                }
            }
        }
    }

    #[instrument(
        level = "trace",
        skip(self),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn notify_input_closed(&mut self) {
        self.context.input_is_closed = true;
        let _ = self.do_transition(NotifyInputClosed);
    }

    #[instrument(
        level = "trace",
        skip(self),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn notify_error(&mut self, error: Error) {
        let _ = self.do_transition(HitError(error));
    }

    #[instrument(
        level = "trace",
        skip(self),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn take_output(&mut self) -> TakeOutputResult {
        if self.context.output.buffer.has_remaining() {
            TakeOutputResult::Buffer(
                self.context
                    .output
                    .buffer
                    .copy_to_bytes(self.context.output.buffer.remaining()),
            )
        } else if !self.context.output.is_closed() {
            TakeOutputResult::Buffer(Bytes::default())
        } else {
            TakeOutputResult::EOF
        }
    }

    #[instrument(
        level = "trace",
        skip(self),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.protocol.version = %self.version),
        ret
    )]
    fn is_ready_to_execute(&self) -> Result<bool, Error> {
        match &self.last_transition {
            Ok(State::WaitingStart) | Ok(State::WaitingReplayEntries { .. }) => Ok(false),
            Ok(State::Processing { .. }) | Ok(State::Replaying { .. }) => Ok(true),
            Ok(s) => Err(UnexpectedStateError::new(s.into(), "IsReadyToExecute").into()),
            Err(e) => Err(e.clone()),
        }
    }

    #[instrument(
        level = "trace",
        skip(self),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn notify_await_point(&mut self, AsyncResultHandle(await_point): AsyncResultHandle) {
        let _ = self.do_transition(NotifyAwaitPoint(await_point));
    }

    #[instrument(
        level = "trace",
        skip(self),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn take_async_result(
        &mut self,
        handle: AsyncResultHandle,
    ) -> Result<Option<Value>, SuspendedOrVMError> {
        match self.do_transition(TakeAsyncResult(handle.0)) {
            Ok(Ok(opt_value)) => Ok(opt_value),
            Ok(Err(suspended)) => Err(SuspendedOrVMError::Suspended(suspended)),
            Err(e) => Err(SuspendedOrVMError::VM(e)),
        }
    }

    #[instrument(
        level = "trace",
        skip(self),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn sys_input(&mut self) -> Result<Input, Error> {
        self.do_transition(SysInput)
    }

    #[instrument(
        level = "trace",
        skip(self),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn sys_state_get(&mut self, key: String) -> Result<AsyncResultHandle, Error> {
        invocation_debug_logs!(self, "Executing 'Get state {key}'");
        self.verify_not_inside_side_effect("get state")?;
        let result = if self.is_processing() {
            match self.context.eager_state.get(&key) {
                EagerGetState::Unknown => None,
                EagerGetState::Empty => {
                    Some(get_state_entry_message::Result::Empty(Empty::default()))
                }
                EagerGetState::Value(v) => Some(get_state_entry_message::Result::Value(v)),
            }
        } else {
            None
        };
        self.do_transition(SysCompletableEntry(
            "SysStateGet",
            GetStateEntryMessage {
                key: Bytes::from(key),
                result,
            },
        ))
    }

    #[instrument(
        level = "trace",
        skip(self),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn sys_state_get_keys(&mut self) -> VMResult<AsyncResultHandle> {
        invocation_debug_logs!(self, "Executing 'Get state keys'");
        self.verify_not_inside_side_effect("get state keys")?;
        let result = if self.is_processing() {
            match self.context.eager_state.get_keys() {
                EagerGetStateKeys::Unknown => None,
                EagerGetStateKeys::Keys(mut keys) => {
                    keys.sort();
                    Some(get_state_keys_entry_message::Result::Value(StateKeys {
                        keys: keys.into_iter().map(Bytes::from).collect(),
                    }))
                }
            }
        } else {
            None
        };
        self.do_transition(SysCompletableEntry(
            "SysStateGetKeys",
            GetStateKeysEntryMessage { result },
        ))
    }

    #[instrument(
        level = "trace",
        skip(self, value),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn sys_state_set(&mut self, key: String, value: Bytes) -> Result<(), Error> {
        invocation_debug_logs!(self, "Executing 'Set state {key}'");
        self.verify_not_inside_side_effect("set state")?;
        self.context.eager_state.set(key.clone(), value.clone());
        self.do_transition(SysNonCompletableEntry(
            "SysStateSet",
            SetStateEntryMessage {
                key: Bytes::from(key.into_bytes()),
                value,
            },
        ))
    }

    #[instrument(
        level = "trace",
        skip(self),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn sys_state_clear(&mut self, key: String) -> Result<(), Error> {
        invocation_debug_logs!(self, "Executing 'Clear state {key}'");
        self.verify_not_inside_side_effect("clear state")?;
        self.context.eager_state.clear(key.clone());
        self.do_transition(SysNonCompletableEntry(
            "SysStateClear",
            ClearStateEntryMessage {
                key: Bytes::from(key.into_bytes()),
            },
        ))
    }

    #[instrument(
        level = "trace",
        skip(self),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn sys_state_clear_all(&mut self) -> Result<(), Error> {
        invocation_debug_logs!(self, "Executing 'Clear all state keys'");
        self.verify_not_inside_side_effect("clear all state")?;
        self.context.eager_state.clear_all();
        self.do_transition(SysNonCompletableEntry(
            "SysStateClearAll",
            ClearAllStateEntryMessage::default(),
        ))
    }

    #[instrument(
        level = "trace",
        skip(self),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn sys_sleep(&mut self, wake_up_time: Duration) -> VMResult<AsyncResultHandle> {
        invocation_debug_logs!(self, "Executing 'Sleep until {wake_up_time:?}'");
        self.verify_not_inside_side_effect("sleep")?;
        self.do_transition(SysCompletableEntry(
            "SysSleep",
            SleepEntryMessage {
                wake_up_time: u64::try_from(wake_up_time.as_millis())
                    .map_err(|_| Error::internal("millis since Unix epoch should fit in u64"))?,
                ..Default::default()
            },
        ))
    }

    #[instrument(
        level = "trace",
        skip(self, input),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn sys_invoke(&mut self, target: Target, input: Bytes) -> VMResult<AsyncResultHandle> {
        invocation_debug_logs!(
            self,
            "Executing 'Call {}/{}'",
            target.service,
            target.handler
        );
        self.verify_not_inside_side_effect("invoke")?;
        self.do_transition(SysCompletableEntry(
            "SysInvoke",
            InvokeEntryMessage {
                service_name: target.service,
                handler_name: target.handler,
                key: target.key.unwrap_or_default(),
                parameter: input,
                ..Default::default()
            },
        ))
    }

    #[instrument(
        level = "trace",
        skip(self, input),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn sys_background_invoke(
        &mut self,
        target: Target,
        input: Bytes,
        invoke_time: Option<Duration>,
    ) -> VMResult<()> {
        invocation_debug_logs!(
            self,
            "Executing 'One way call {}/{}'",
            target.service,
            target.handler
        );
        self.verify_not_inside_side_effect("background invoke")?;
        self.do_transition(SysNonCompletableEntry(
            "SysBackgroundInvoke",
            BackgroundInvokeEntryMessage {
                service_name: target.service,
                handler_name: target.handler,
                key: target.key.unwrap_or_default(),
                parameter: input,
                invoke_time: invoke_time
                    .map(|d| {
                        u64::try_from(d.as_millis())
                            .map_err(|_| Error::internal("millis since Unix epoch should fit in u64"))
                    })
                    .transpose()?
                    .unwrap_or_default(),
            },
        ))
    }

    #[instrument(
        level = "trace",
        skip(self),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn sys_awakeable(&mut self) -> VMResult<(String, AsyncResultHandle)> {
        invocation_debug_logs!(self, "Executing 'Awakeable'");
        self.verify_not_inside_side_effect("awakeable")?;
        self.do_transition(SysCompletableEntry(
            "SysAwakeable",
            AwakeableEntryMessage::default(),
        ))
        .map(|h| {
            (
                awakeable_id(
                    &self.context.expect_start_info().id,
                    self.context.journal.expect_index(),
                ),
                h,
            )
        })
    }

    #[instrument(
        level = "trace",
        skip(self, payload),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn sys_resolve_awakeable(&mut self, id: String, payload: Bytes) -> VMResult<()> {
        invocation_debug_logs!(self, "Executing 'Resolve awakeable {id}'");
        self.verify_not_inside_side_effect("resolve awakeable")?;
        self.do_transition(SysNonCompletableEntry(
            "SysResolveAwakeable",
            ResolveAwakeableEntryMessage { id, payload },
        ))
    }

    #[instrument(
        level = "trace",
        skip(self, reason),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn sys_reject_awakeable(&mut self, id: String, reason: TerminalFailure) -> VMResult<()> {
        invocation_debug_logs!(self, "Executing 'Reject awakeable {id}'");
        self.verify_not_inside_side_effect("reject awakeable")?;
        self.do_transition(SysNonCompletableEntry(
            "SysRejectAwakeable",
            RejectAwakeableEntryMessage {
                id,
                failure: Some(reason.into()),
            },
        ))
    }

    #[instrument(
        level = "trace",
        skip(self),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn sys_side_effect_enter(&mut self) -> Result<SideEffectEnterResult, Error> {
        self.verify_not_inside_side_effect("sideEffect state")?;
        self.do_transition(SysSideEffectEnter)
    }

    #[instrument(
        level = "trace",
        skip(self, value, retry_policy),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn sys_side_effect_exit(
        &mut self,
        value: SideEffectExitResult,
        retry_policy: &RetryPolicy,
    ) -> Result<SideEffectExitOutcome, Error> {
        match &value {
            SideEffectExitResult::Success(_) => {
                invocation_debug_logs!(self, "Storing side effect completed with success");
            }
            SideEffectExitResult::TerminalFailure(_) => {
                invocation_debug_logs!(self, "Storing side effect completed with terminal failure");
            }
            SideEffectExitResult::RetryableFailure { .. } => {
                invocation_debug_logs!(self, "Side effect failed, consulting the retry policy");
            }
        }
        self.do_transition(SysSideEffectExit(value, retry_policy))
    }

    #[instrument(
        level = "trace",
        skip(self, value),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn sys_write_output(&mut self, value: NonEmptyValue) -> Result<(), Error> {
        match &value {
            NonEmptyValue::Success(_) => {
                invocation_debug_logs!(self, "Writing invocation result success value");
            }
            NonEmptyValue::Failure(_) => {
                invocation_debug_logs!(self, "Writing invocation result failure value");
            }
        }
        self.do_transition(SysNonCompletableEntry(
            "SysWriteOutput",
            OutputEntryMessage {
                result: Some(match value {
                    NonEmptyValue::Success(b) => output_entry_message::Result::Value(b),
                    NonEmptyValue::Failure(f) => output_entry_message::Result::Failure(f.into()),
                }),
            },
        ))
    }

    #[instrument(
        level = "trace",
        skip(self),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn sys_end(&mut self) -> Result<(), Error> {
        invocation_debug_logs!(self, "End of the invocation");
        self.do_transition(SysEnd)
    }

    fn is_processing(&self) -> bool {
        matches!(&self.last_transition, Ok(State::Processing { .. }))
    }

    fn is_inside_side_effect(&self) -> bool {
        self.context.side_effect.is_running()
    }

    #[instrument(
        level = "trace",
        skip(self),
        fields(restate.invocation.id = self.debug_invocation_id(), restate.journal.index = self.context.journal.index(), restate.protocol.version = %self.version),
        ret
    )]
    fn sys_try_complete_combinator(
        &mut self,
        combinator: impl AsyncResultCombinator + fmt::Debug,
    ) -> VMResult<Option<Vec<AsyncResultHandle>>> {
        self.verify_not_inside_side_effect("promise combinator")?;
        self.do_transition(SysTryCompleteCombinator(combinator))
    }
}

const INDIFFERENT_PAD: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_decode_padding_mode(DecodePaddingMode::Indifferent)
    .with_encode_padding(false);
const URL_SAFE: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, INDIFFERENT_PAD);

/// Awakeable ids address an entry from outside the invocation: they're the
/// invocation id and the entry index, base64-encoded behind a stable prefix.
fn awakeable_id(id: &[u8], entry_index: u32) -> String {
    let mut input_buf = BytesMut::with_capacity(id.len() + size_of::<u32>());
    input_buf.put_slice(id);
    input_buf.put_u32(entry_index);
    format!("prom_1{}", URL_SAFE.encode(input_buf.freeze()))
}
