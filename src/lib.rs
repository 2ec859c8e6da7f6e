mod combinators;
mod headers;
mod rand;
mod retries;
mod service_protocol;
mod vm;

use bytes::Bytes;
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

pub use crate::rand::Random;
pub use crate::retries::RetryPolicy;
pub use combinators::{All, AllSettled, Any, Race};
pub use headers::HeaderMap;
pub use service_protocol::Version;
pub use vm::CoreVM;

// Re-export only some stuff from vm::errors
pub mod error {
    pub use crate::vm::errors::codes;
    pub use crate::vm::errors::InvocationErrorCode;
}

use crate::vm::AsyncResultAccessTrackerInner;

#[derive(Debug, Eq, PartialEq)]
pub struct Header {
    pub key: Cow<'static, str>,
    pub value: Cow<'static, str>,
}

#[derive(Debug)]
pub struct ResponseHead {
    pub status_code: u16,
    pub headers: Vec<Header>,
    pub version: Version,
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("Suspended execution")]
pub struct SuspendedError;

#[derive(Debug, Clone, thiserror::Error)]
#[error("VM Error [{code}]: {message}. Description: {description}")]
pub struct Error {
    code: u16,
    message: Cow<'static, str>,
    description: Cow<'static, str>,
}

impl Error {
    pub fn new(code: impl Into<u16>, message: impl Into<Cow<'static, str>>) -> Self {
        Error {
            code: code.into(),
            message: message.into(),
            description: Default::default(),
        }
    }

    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(error::codes::INTERNAL, message)
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn with_description(mut self, description: impl Into<Cow<'static, str>>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SuspendedOrVMError {
    #[error(transparent)]
    Suspended(SuspendedError),
    #[error(transparent)]
    VM(Error),
}

#[derive(Debug, Eq, PartialEq)]
pub struct Input {
    pub invocation_id: String,
    pub random_seed: u64,
    pub key: String,
    pub headers: Vec<Header>,
    pub input: Bytes,
}

#[derive(Debug, Eq, PartialEq)]
pub struct Target {
    pub service: String,
    pub handler: String,
    pub key: Option<String>,
}

/// The journal-aware handle to an in-flight result: it carries the journal
/// index of the entry it resolves, and is what promise combinators operate
/// on.
#[derive(Debug, Hash, Clone, Copy, Eq, PartialEq)]
pub struct AsyncResultHandle(u32);

impl From<u32> for AsyncResultHandle {
    fn from(value: u32) -> Self {
        AsyncResultHandle(value)
    }
}

impl From<AsyncResultHandle> for u32 {
    fn from(value: AsyncResultHandle) -> Self {
        value.0
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum Value {
    /// a void/None/undefined success
    Void,
    Success(Bytes),
    Failure(TerminalFailure),
    /// Only returned for get_state_keys
    StateKeys(Vec<String>),
}

/// Terminal failure
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TerminalFailure {
    pub code: u16,
    pub message: String,
}

impl TerminalFailure {
    /// The failure produced when a timeout sleep wins a race against the
    /// promise it guards.
    pub fn timeout() -> Self {
        Self {
            code: error::codes::TIMED_OUT.code(),
            message: "Timeout occurred".to_owned(),
        }
    }
}

#[derive(Debug)]
pub enum SideEffectEnterResult {
    /// The side effect result was found in the replayed journal, the closure
    /// must not run again.
    Executed(NonEmptyValue),
    /// The closure must be executed, and its outcome proposed through
    /// [`VM::sys_side_effect_exit`].
    NotExecuted,
}

#[derive(Debug, Clone)]
pub enum SideEffectExitResult {
    Success(Bytes),
    TerminalFailure(TerminalFailure),
    /// A failure eligible for retry. It never crosses the Context boundary:
    /// either a retry is scheduled, or it's converted to a terminal failure
    /// once attempts are exhausted.
    RetryableFailure(Error),
}

#[derive(Debug, Eq, PartialEq)]
pub enum SideEffectExitOutcome {
    /// The result was journaled. Await the handle for the committed value.
    Committed(AsyncResultHandle),
    /// Nothing was journaled. Perform a `sys_sleep` for the given delay,
    /// await it, then re-enter the side effect.
    ScheduleRetry(Duration),
}

#[derive(Debug, Clone)]
pub enum NonEmptyValue {
    Success(Bytes),
    Failure(TerminalFailure),
}

impl From<NonEmptyValue> for Value {
    fn from(value: NonEmptyValue) -> Self {
        match value {
            NonEmptyValue::Success(s) => Value::Success(s),
            NonEmptyValue::Failure(f) => Value::Failure(f),
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum TakeOutputResult {
    Buffer(Bytes),
    EOF,
}

pub type VMResult<T> = Result<T, Error>;

/// How the transport feeding this invocation behaves.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum ProtocolMode {
    /// Duplex byte stream. Entry acks and completions may arrive at any time.
    #[default]
    BidiStream,
    /// Single request buffer in, single response buffer out. No acks will
    /// ever come back, so ack-resolved entries complete on append.
    RequestResponse,
}

#[derive(Debug, Default)]
pub struct VMOptions {
    pub mode: ProtocolMode,
}

pub trait VM: Sized {
    fn new(request_headers: impl HeaderMap, options: VMOptions) -> VMResult<Self>;

    fn get_response_head(&self) -> ResponseHead;

    // --- Input stream

    fn notify_input(&mut self, buffer: Bytes);

    fn notify_input_closed(&mut self);

    // --- Errors

    fn notify_error(&mut self, error: Error);

    // --- Output stream

    fn take_output(&mut self) -> TakeOutputResult;

    // --- Execution start waiting point

    fn is_ready_to_execute(&self) -> VMResult<bool>;

    // --- Async results

    fn notify_await_point(&mut self, handle: AsyncResultHandle);

    /// Ok(None) means the result is not ready.
    fn take_async_result(
        &mut self,
        handle: AsyncResultHandle,
    ) -> Result<Option<Value>, SuspendedOrVMError>;

    // --- Syscall(s)

    fn sys_input(&mut self) -> VMResult<Input>;

    fn sys_state_get(&mut self, key: String) -> VMResult<AsyncResultHandle>;

    fn sys_state_get_keys(&mut self) -> VMResult<AsyncResultHandle>;

    fn sys_state_set(&mut self, key: String, value: Bytes) -> VMResult<()>;

    fn sys_state_clear(&mut self, key: String) -> VMResult<()>;

    fn sys_state_clear_all(&mut self) -> VMResult<()>;

    fn sys_sleep(&mut self, wake_up_time_since_unix_epoch: Duration)
        -> VMResult<AsyncResultHandle>;

    fn sys_invoke(&mut self, target: Target, input: Bytes) -> VMResult<AsyncResultHandle>;

    fn sys_background_invoke(
        &mut self,
        target: Target,
        input: Bytes,
        invoke_time_since_unix_epoch: Option<Duration>,
    ) -> VMResult<()>;

    fn sys_awakeable(&mut self) -> VMResult<(String, AsyncResultHandle)>;

    fn sys_resolve_awakeable(&mut self, id: String, payload: Bytes) -> VMResult<()>;

    fn sys_reject_awakeable(&mut self, id: String, reason: TerminalFailure) -> VMResult<()>;

    fn sys_side_effect_enter(&mut self) -> VMResult<SideEffectEnterResult>;

    fn sys_side_effect_exit(
        &mut self,
        value: SideEffectExitResult,
        retry_policy: &RetryPolicy,
    ) -> VMResult<SideEffectExitOutcome>;

    fn sys_write_output(&mut self, value: NonEmptyValue) -> VMResult<()>;

    fn sys_end(&mut self) -> VMResult<()>;

    /// Returns true if the state machine is in processing state
    fn is_processing(&self) -> bool;

    /// Returns true if the state machine is between a side effect enter and
    /// exit. Deterministic accessors seeded from the journal (rand, uuid)
    /// must not be used while this returns true.
    fn is_inside_side_effect(&self) -> bool;

    /// Returns None if the combinator can't be completed yet.
    fn sys_try_complete_combinator(
        &mut self,
        combinator: impl AsyncResultCombinator + fmt::Debug,
    ) -> VMResult<Option<Vec<AsyncResultHandle>>>;
}

// HOW TO USE THIS API
//
// pre_user_code:
//     while !vm.is_ready_to_execute() {
//         match io.read_input() {
//             buffer => vm.notify_input(buffer),
//             EOF => vm.notify_input_closed()
//         }
//     }
//
// sys_[something]:
//     try {
//         vm.sys_[something]()
//         io.write_out(vm.take_output())
//     } catch (e) {
//         log(e)
//         io.write_out(vm.take_output())
//         throw e
//     }
//
// await_handle:
//     vm.notify_await_point(handle);
//     loop {
//         // Result here can be value, not_ready, suspended, vm error
//         let result = vm.take_async_result(handle);
//         if result.is_not_ready() {
//             match await io.read_input() {
//                buffer => vm.notify_input(buffer),
//                EOF => vm.notify_input_closed()
//             }
//         }
//         return result
//     }
//
// side_effect(closure, retry_policy):
//     loop {
//         match vm.sys_side_effect_enter() {
//             Executed(result) => return result,
//             NotExecuted => {}
//         }
//         let exit_result = run closure
//         match vm.sys_side_effect_exit(exit_result, retry_policy) {
//             Committed(handle) => return await_handle(handle),
//             ScheduleRetry(delay) => await_handle(vm.sys_sleep(now + delay))
//         }
//     }
//
// post_user_code:
//     // Consume vm.take_output() until EOF
//     while buffer = vm.take_output() {
//         io.write_out(buffer)
//     }
//     io.close()

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncResultState {
    Success,
    Failure,
    NotReady,
}

pub struct AsyncResultAccessTracker(pub(crate) AsyncResultAccessTrackerInner);

impl AsyncResultAccessTracker {
    pub fn get_state(&mut self, handle: AsyncResultHandle) -> AsyncResultState {
        self.0.get_state(handle)
    }
}

pub trait AsyncResultCombinator {
    /// Returns `Some` with the handles making up the combinator result when
    /// the completion predicate holds over the children, `None` otherwise.
    fn try_complete(
        &self,
        tracker: &mut AsyncResultAccessTracker,
    ) -> Option<Vec<AsyncResultHandle>>;
}

#[cfg(test)]
mod tests;
