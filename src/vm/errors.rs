use crate::service_protocol::{ContentTypeError, DecodingError, MessageType};
use crate::Error;
use std::borrow::Cow;
use std::fmt;

// Error codes

#[derive(Copy, Clone, PartialEq, Eq)]
pub struct InvocationErrorCode(u16);

impl InvocationErrorCode {
    pub const fn new(code: u16) -> Self {
        InvocationErrorCode(code)
    }

    pub const fn code(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for InvocationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InvocationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<u16> for InvocationErrorCode {
    fn from(value: u16) -> Self {
        InvocationErrorCode(value)
    }
}

impl From<u32> for InvocationErrorCode {
    fn from(value: u32) -> Self {
        value
            .try_into()
            .map(InvocationErrorCode)
            .unwrap_or(codes::INTERNAL)
    }
}

impl From<InvocationErrorCode> for u16 {
    fn from(value: InvocationErrorCode) -> Self {
        value.0
    }
}

impl From<InvocationErrorCode> for u32 {
    fn from(value: InvocationErrorCode) -> Self {
        value.0 as u32
    }
}

pub mod codes {
    use super::InvocationErrorCode;

    pub const BAD_REQUEST: InvocationErrorCode = InvocationErrorCode(400);
    pub const TIMED_OUT: InvocationErrorCode = InvocationErrorCode(408);
    pub const INTERNAL: InvocationErrorCode = InvocationErrorCode(500);
    pub const UNSUPPORTED_MEDIA_TYPE: InvocationErrorCode = InvocationErrorCode(415);
    pub const JOURNAL_MISMATCH: InvocationErrorCode = InvocationErrorCode(570);
    pub const PROTOCOL_VIOLATION: InvocationErrorCode = InvocationErrorCode(571);
    pub const SIDE_EFFECT_VIOLATION: InvocationErrorCode = InvocationErrorCode(572);
    pub const CLOSED: InvocationErrorCode = InvocationErrorCode(598);
    pub const SUSPENDED: InvocationErrorCode = InvocationErrorCode(599);
}

// Const errors

impl Error {
    const fn new_const(code: InvocationErrorCode, message: &'static str) -> Self {
        Error {
            code: code.0,
            message: Cow::Borrowed(message),
            description: Cow::Borrowed(""),
        }
    }
}

pub const MISSING_CONTENT_TYPE: Error = Error::new_const(
    codes::UNSUPPORTED_MEDIA_TYPE,
    "Missing content type when invoking the service deployment",
);

pub const UNEXPECTED_INPUT_MESSAGE: Error = Error::new_const(
    codes::PROTOCOL_VIOLATION,
    "Expected incoming message to be an entry",
);

pub const KNOWN_ENTRIES_IS_ZERO: Error =
    Error::new_const(codes::INTERNAL, "Known entries is zero, expected >= 1");

pub const UNEXPECTED_ENTRY_MESSAGE: Error = Error::new_const(
    codes::PROTOCOL_VIOLATION,
    "Expected entry messages only when waiting replay entries",
);

pub const INPUT_CLOSED_WHILE_WAITING_ENTRIES: Error = Error::new_const(
    codes::PROTOCOL_VIOLATION,
    "The input was closed while still waiting to receive all journal to replay",
);

pub const EMPTY_COMPLETION_RESULT: Error = Error::new_const(
    codes::PROTOCOL_VIOLATION,
    "Expected completion message to carry a result",
);

pub const SIDE_EFFECT_EXIT_WITHOUT_ENTER: Error = Error::new_const(
    codes::INTERNAL,
    "Received a side effect exit without a matching enter",
);

/// Fixed terminal failure for a context operation attempted while a side
/// effect closure is running. Op names must stay stable, handlers and tests
/// match on them.
pub(crate) fn forbidden_in_side_effect(op: &'static str) -> Error {
    Error::new(
        codes::SIDE_EFFECT_VIOLATION,
        format!("You cannot do {op} calls from within a side effect."),
    )
}

// Other errors

#[derive(Debug, Clone, thiserror::Error)]
#[error("The execution replay ended unexpectedly. Expecting to read '{expected}' from the recorded journal, but the buffered entries were already drained.")]
pub struct UnavailableEntryError {
    expected: MessageType,
}

impl UnavailableEntryError {
    pub fn new(expected: MessageType) -> Self {
        Self { expected }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unexpected state '{state:?}' when invoking '{event:?}'")]
pub struct UnexpectedStateError {
    state: &'static str,
    event: &'static str,
}

impl UnexpectedStateError {
    pub fn new(state: &'static str, event: &'static str) -> Self {
        Self { state, event }
    }
}

#[derive(Debug)]
pub struct EntryTypeMismatchError {
    actual: MessageType,
    expected: MessageType,
}

impl EntryTypeMismatchError {
    pub fn new(actual: MessageType, expected: MessageType) -> EntryTypeMismatchError {
        Self { actual, expected }
    }
}

impl fmt::Display for EntryTypeMismatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f,
               "Found a mismatch between the code paths taken during the previous execution and the paths taken during this execution.
This typically happens when some parts of the code are non-deterministic.
 - The previous execution ran and recorded the following: '{}'
 - The current execution attempts to perform the following: '{}'",
               self.actual,
               self.expected,
        )
    }
}

impl std::error::Error for EntryTypeMismatchError {}

#[derive(Debug)]
pub struct EntryMismatchError<M> {
    entry_index: u32,
    actual: M,
    expected: M,
}

impl<M> EntryMismatchError<M> {
    pub fn new(entry_index: u32, actual: M, expected: M) -> EntryMismatchError<M> {
        Self {
            entry_index,
            actual,
            expected,
        }
    }
}

impl<M: fmt::Debug> fmt::Display for EntryMismatchError<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f,
"Found a mismatch between the code paths taken during the previous execution and the paths taken during this execution.
This typically happens when some parts of the code are non-deterministic.
 - The mismatch happened at journal index '{}'
 - The previous execution ran and recorded the following: {:?}
 - The current execution attempts to perform the following: {:?}",
            self.entry_index,
            self.actual,
            self.expected,
        )
    }
}

impl<M: fmt::Debug> std::error::Error for EntryMismatchError<M> {}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Cannot convert a eager state key into UTF-8 String: {0:?}")]
pub struct BadEagerStateKeyError(#[from] pub(crate) std::string::FromUtf8Error);

#[derive(Debug, Clone, thiserror::Error)]
#[error("Cannot decode state keys message: {0}")]
pub struct DecodeStateKeysProst(#[from] pub(crate) prost::DecodeError);

#[derive(Debug, Clone, thiserror::Error)]
#[error("Cannot decode state keys message: {0}")]
pub struct DecodeStateKeysUtf8(#[from] pub(crate) std::string::FromUtf8Error);

#[derive(Debug, Clone, thiserror::Error)]
#[error("Unexpected empty result variant for state keys")]
pub struct EmptyStateKeys;

#[derive(Debug, Clone, thiserror::Error)]
#[error("Unexpected empty result variant in a replayed side effect entry")]
pub struct EmptySideEffectResult;

#[derive(Debug, Clone, thiserror::Error)]
#[error("Received a second completion for entry '{entry_index}'. A journal entry can be completed only once.")]
pub struct DoubleCompletionError {
    pub(crate) entry_index: u32,
}

// Conversions to Error

trait WithInvocationErrorCode {
    fn code(&self) -> InvocationErrorCode;
}

impl<T: WithInvocationErrorCode + fmt::Display> From<T> for Error {
    fn from(value: T) -> Self {
        Error::new(value.code().0, value.to_string())
    }
}

macro_rules! impl_error_code {
    ($error_type:ident, $code:ident) => {
        impl WithInvocationErrorCode for $error_type {
            fn code(&self) -> InvocationErrorCode {
                codes::$code
            }
        }
    };
}

impl_error_code!(ContentTypeError, UNSUPPORTED_MEDIA_TYPE);
impl WithInvocationErrorCode for DecodingError {
    fn code(&self) -> InvocationErrorCode {
        match self {
            DecodingError::UnexpectedMessageType { .. } => codes::JOURNAL_MISMATCH,
            _ => codes::INTERNAL,
        }
    }
}
impl_error_code!(UnavailableEntryError, PROTOCOL_VIOLATION);
impl_error_code!(UnexpectedStateError, PROTOCOL_VIOLATION);
impl_error_code!(EntryTypeMismatchError, JOURNAL_MISMATCH);
impl<M: fmt::Debug> WithInvocationErrorCode for EntryMismatchError<M> {
    fn code(&self) -> InvocationErrorCode {
        codes::JOURNAL_MISMATCH
    }
}
impl_error_code!(BadEagerStateKeyError, INTERNAL);
impl_error_code!(DecodeStateKeysProst, PROTOCOL_VIOLATION);
impl_error_code!(DecodeStateKeysUtf8, PROTOCOL_VIOLATION);
impl_error_code!(EmptyStateKeys, PROTOCOL_VIOLATION);
impl_error_code!(EmptySideEffectResult, PROTOCOL_VIOLATION);
impl_error_code!(DoubleCompletionError, PROTOCOL_VIOLATION);
