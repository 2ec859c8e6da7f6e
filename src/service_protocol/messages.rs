// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use crate::service_protocol::{MessageHeader, MessageType};
use crate::vm::errors::{DecodeStateKeysProst, DecodeStateKeysUtf8, EmptyStateKeys};
use crate::{Error, NonEmptyValue, Value};
use pastey::paste;
use prost::Message;

pub trait ProtocolMessage: prost::Message + Default {
    fn ty() -> MessageType;
}

pub trait WriteableMessage: ProtocolMessage {
    fn generate_header(&self, _never_ack: bool) -> MessageHeader {
        MessageHeader::new(Self::ty(), self.encoded_len() as u32)
    }
}

/// Equality over the deterministic portion of an entry, used to verify that a
/// replayed entry matches the operation the handler performed. Entries with a
/// non-deterministic body (sleep wake-up times, side effect results) only
/// match on kind.
pub trait EntryHeaderEq {
    fn header_eq(&self, other: &Self) -> bool;
}

pub trait CompletableEntry: ProtocolMessage + EntryHeaderEq {
    /// Returns true if the entry is completed in-body (replayed or eager state).
    fn is_completed(&self) -> bool;
    fn into_result(self) -> Result<Option<Value>, Error>;
    fn completion_parsing_hint() -> CompletionParsingHint;
}

impl<M: CompletableEntry> WriteableMessage for M {
    fn generate_header(&self, _never_ack: bool) -> MessageHeader {
        MessageHeader::new_entry_header(
            Self::ty(),
            Some(self.is_completed()),
            self.encoded_len() as u32,
        )
    }
}

// --- Wire messages.
//
// These mirror the published protocol schema one to one; they're maintained by
// hand so the crate builds without a protoc toolchain.

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Failure {
    /// Any HTTP status code applies, plus the protocol-specific codes in
    /// [`crate::error::codes`].
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Header {
    #[prost(string, tag = "1")]
    pub key: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub value: ::prost::alloc::string::String,
}

/// Type: 0x0000 + 0
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartMessage {
    /// Unique id of the invocation. Stable across suspensions and retries.
    #[prost(bytes = "bytes", tag = "1")]
    pub id: ::prost::bytes::Bytes,
    /// Invocation id rendered for logging and introspection apis.
    #[prost(string, tag = "2")]
    pub debug_id: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub known_entries: u32,
    #[prost(message, repeated, tag = "4")]
    pub state_map: ::prost::alloc::vec::Vec<start_message::StateEntry>,
    #[prost(bool, tag = "5")]
    pub partial_state: bool,
    /// Filled for keyed handlers, empty otherwise.
    #[prost(string, tag = "6")]
    pub key: ::prost::alloc::string::String,
}

pub mod start_message {
    #[derive(Clone, PartialEq, Eq, ::prost::Message)]
    pub struct StateEntry {
        #[prost(bytes = "bytes", tag = "1")]
        pub key: ::prost::bytes::Bytes,
        /// An empty byte array is an empty value, not a missing one.
        #[prost(bytes = "bytes", tag = "2")]
        pub value: ::prost::bytes::Bytes,
    }
}

/// Type: 0x0000 + 1
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompletionMessage {
    #[prost(uint32, tag = "1")]
    pub entry_index: u32,
    #[prost(oneof = "completion_message::Result", tags = "13, 14, 15")]
    pub result: ::core::option::Option<completion_message::Result>,
}

pub mod completion_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "13")]
        Empty(super::Empty),
        #[prost(bytes, tag = "14")]
        Value(::prost::bytes::Bytes),
        #[prost(message, tag = "15")]
        Failure(super::Failure),
    }
}

/// Type: 0x0000 + 2
/// Sent when the invocation releases its execution slot awaiting completions.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct SuspensionMessage {
    /// Entry indexes the invocation is blocked on. The runtime resumes the
    /// invocation as soon as any of them completes. MUST not be empty.
    #[prost(uint32, repeated, tag = "1")]
    pub entry_indexes: ::prost::alloc::vec::Vec<u32>,
}

/// Type: 0x0000 + 3
/// Sent when the invocation lifecycle ends.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct EndMessage {}

/// Type: 0x0000 + 4
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct EntryAckMessage {
    #[prost(uint32, tag = "1")]
    pub entry_index: u32,
}

/// Completable: No
/// Type: 0x0400 + 0
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct InputEntryMessage {
    #[prost(message, repeated, tag = "1")]
    pub headers: ::prost::alloc::vec::Vec<Header>,
    #[prost(bytes = "bytes", tag = "14")]
    pub value: ::prost::bytes::Bytes,
}

/// Completable: No
/// Type: 0x0400 + 1
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OutputEntryMessage {
    #[prost(oneof = "output_entry_message::Result", tags = "14, 15")]
    pub result: ::core::option::Option<output_entry_message::Result>,
}

pub mod output_entry_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(bytes, tag = "14")]
        Value(::prost::bytes::Bytes),
        #[prost(message, tag = "15")]
        Failure(super::Failure),
    }
}

/// Completable: Yes
/// Type: 0x0800 + 0
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStateEntryMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: ::prost::bytes::Bytes,
    #[prost(oneof = "get_state_entry_message::Result", tags = "13, 14, 15")]
    pub result: ::core::option::Option<get_state_entry_message::Result>,
}

pub mod get_state_entry_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "13")]
        Empty(super::Empty),
        #[prost(bytes, tag = "14")]
        Value(::prost::bytes::Bytes),
        #[prost(message, tag = "15")]
        Failure(super::Failure),
    }
}

/// Completable: No
/// Type: 0x0800 + 1
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct SetStateEntryMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: ::prost::bytes::Bytes,
    #[prost(bytes = "bytes", tag = "3")]
    pub value: ::prost::bytes::Bytes,
}

/// Completable: No
/// Type: 0x0800 + 2
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ClearStateEntryMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: ::prost::bytes::Bytes,
}

/// Completable: No
/// Type: 0x0800 + 3
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct ClearAllStateEntryMessage {}

/// Completable: Yes
/// Type: 0x0800 + 4
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStateKeysEntryMessage {
    #[prost(oneof = "get_state_keys_entry_message::Result", tags = "14, 15")]
    pub result: ::core::option::Option<get_state_keys_entry_message::Result>,
}

pub mod get_state_keys_entry_message {
    #[derive(Clone, PartialEq, Eq, ::prost::Message)]
    pub struct StateKeys {
        #[prost(bytes = "bytes", repeated, tag = "1")]
        pub keys: ::prost::alloc::vec::Vec<::prost::bytes::Bytes>,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "14")]
        Value(StateKeys),
        #[prost(message, tag = "15")]
        Failure(super::Failure),
    }
}

/// Completable: Yes
/// Type: 0x0C00 + 0
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SleepEntryMessage {
    /// Wake-up time, in milliseconds since the unix epoch.
    #[prost(uint64, tag = "1")]
    pub wake_up_time: u64,
    #[prost(oneof = "sleep_entry_message::Result", tags = "13, 15")]
    pub result: ::core::option::Option<sleep_entry_message::Result>,
}

pub mod sleep_entry_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "13")]
        Empty(super::Empty),
        #[prost(message, tag = "15")]
        Failure(super::Failure),
    }
}

/// Completable: Yes
/// Type: 0x0C00 + 1
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InvokeEntryMessage {
    #[prost(string, tag = "1")]
    pub service_name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub handler_name: ::prost::alloc::string::String,
    #[prost(bytes = "bytes", tag = "3")]
    pub parameter: ::prost::bytes::Bytes,
    /// Filled for keyed targets, empty otherwise.
    #[prost(string, tag = "4")]
    pub key: ::prost::alloc::string::String,
    #[prost(oneof = "invoke_entry_message::Result", tags = "14, 15")]
    pub result: ::core::option::Option<invoke_entry_message::Result>,
}

pub mod invoke_entry_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(bytes, tag = "14")]
        Value(::prost::bytes::Bytes),
        #[prost(message, tag = "15")]
        Failure(super::Failure),
    }
}

/// Completable: No
/// Type: 0x0C00 + 2
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct BackgroundInvokeEntryMessage {
    #[prost(string, tag = "1")]
    pub service_name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub handler_name: ::prost::alloc::string::String,
    #[prost(bytes = "bytes", tag = "3")]
    pub parameter: ::prost::bytes::Bytes,
    #[prost(string, tag = "4")]
    pub key: ::prost::alloc::string::String,
    /// Time to execute the call, in milliseconds since the unix epoch.
    /// Zero means immediately.
    #[prost(uint64, tag = "5")]
    pub invoke_time: u64,
}

/// Completable: Yes
/// Type: 0x0C00 + 3
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AwakeableEntryMessage {
    #[prost(oneof = "awakeable_entry_message::Result", tags = "14, 15")]
    pub result: ::core::option::Option<awakeable_entry_message::Result>,
}

pub mod awakeable_entry_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(bytes, tag = "14")]
        Value(::prost::bytes::Bytes),
        #[prost(message, tag = "15")]
        Failure(super::Failure),
    }
}

/// Completable: No
/// Type: 0x0C00 + 4
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ResolveAwakeableEntryMessage {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: ::prost::bytes::Bytes,
}

/// Completable: No
/// Type: 0x0C00 + 5
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct RejectAwakeableEntryMessage {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub failure: ::core::option::Option<Failure>,
}

/// Completable: Yes, via [`EntryAckMessage`] or [`CompletionMessage`]
/// Type: 0x0C00 + 6
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SideEffectEntryMessage {
    #[prost(oneof = "side_effect_entry_message::Result", tags = "14, 15")]
    pub result: ::core::option::Option<side_effect_entry_message::Result>,
}

pub mod side_effect_entry_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(bytes, tag = "14")]
        Value(::prost::bytes::Bytes),
        #[prost(message, tag = "15")]
        Failure(super::Failure),
    }
}

// --- Trait implementations

macro_rules! impl_message_traits {
    ($name:ident: core) => {
        impl_message_traits!($name: message);
        impl_message_traits!($name: writeable);
    };
    ($name:ident: non_completable_entry) => {
        impl_message_traits!($name: message);
        impl_message_traits!($name: writeable);
        impl_message_traits!($name: entry_header_eq);
    };
    ($name:ident: completable_entry) => {
        impl_message_traits!($name: message);
        impl_message_traits!($name: completable);
    };
    ($name:ident: message) => {
         impl ProtocolMessage for paste! { [<$name Message>] } {
            fn ty() -> MessageType {
                MessageType::$name
            }
        }
    };
    ($name:ident: writeable) => {
        impl WriteableMessage for paste! { [<$name Message>] } {}
    };
    ($name:ident: completable) => {
        impl CompletableEntry for paste! { [<$name Message>] } {
            fn is_completed(&self) -> bool {
                self.result.is_some()
            }

            fn into_result(self) -> Result<Option<Value>, Error> {
                self.result.map(TryInto::try_into).transpose()
            }

            fn completion_parsing_hint() -> CompletionParsingHint {
                CompletionParsingHint::EmptyOrSuccessOrValue
            }
        }
    };
    ($name:ident: entry_header_eq) => {
        impl EntryHeaderEq for paste! { [<$name Message>] } {
            fn header_eq(&self, other: &Self) -> bool {
                self.eq(other)
            }
        }
    };
}

// --- Control messages
impl_message_traits!(Start: core);
impl_message_traits!(Completion: core);
impl_message_traits!(Suspension: core);
impl_message_traits!(End: core);
impl_message_traits!(EntryAck: core);

// --- Entries
impl_message_traits!(InputEntry: message);
impl_message_traits!(InputEntry: writeable);
impl EntryHeaderEq for InputEntryMessage {
    fn header_eq(&self, _: &Self) -> bool {
        true
    }
}

impl_message_traits!(OutputEntry: non_completable_entry);

impl_message_traits!(GetStateEntry: completable_entry);
impl EntryHeaderEq for GetStateEntryMessage {
    fn header_eq(&self, other: &Self) -> bool {
        self.key.eq(&other.key)
    }
}

impl_message_traits!(SetStateEntry: non_completable_entry);

impl_message_traits!(ClearStateEntry: non_completable_entry);

impl_message_traits!(ClearAllStateEntry: non_completable_entry);

impl_message_traits!(GetStateKeysEntry: message);
impl CompletableEntry for GetStateKeysEntryMessage {
    fn is_completed(&self) -> bool {
        self.result.is_some()
    }

    fn into_result(self) -> Result<Option<Value>, Error> {
        self.result.map(TryInto::try_into).transpose()
    }

    fn completion_parsing_hint() -> CompletionParsingHint {
        CompletionParsingHint::StateKeys
    }
}
impl EntryHeaderEq for GetStateKeysEntryMessage {
    fn header_eq(&self, _: &Self) -> bool {
        true
    }
}

impl_message_traits!(SleepEntry: completable_entry);
impl EntryHeaderEq for SleepEntryMessage {
    // The wake-up time is computed from the local clock, the recorded one wins.
    fn header_eq(&self, _: &Self) -> bool {
        true
    }
}

impl_message_traits!(InvokeEntry: completable_entry);
impl EntryHeaderEq for InvokeEntryMessage {
    fn header_eq(&self, other: &Self) -> bool {
        self.service_name == other.service_name
            && self.handler_name == other.handler_name
            && self.key == other.key
            && self.parameter == other.parameter
    }
}

impl_message_traits!(BackgroundInvokeEntry: message);
impl_message_traits!(BackgroundInvokeEntry: writeable);
impl EntryHeaderEq for BackgroundInvokeEntryMessage {
    // invoke_time is derived from the local clock for delayed invokes, the
    // recorded one wins.
    fn header_eq(&self, other: &Self) -> bool {
        self.service_name == other.service_name
            && self.handler_name == other.handler_name
            && self.key == other.key
            && self.parameter == other.parameter
    }
}

impl_message_traits!(AwakeableEntry: completable_entry);
impl EntryHeaderEq for AwakeableEntryMessage {
    fn header_eq(&self, _: &Self) -> bool {
        true
    }
}

impl_message_traits!(ResolveAwakeableEntry: non_completable_entry);

impl_message_traits!(RejectAwakeableEntry: non_completable_entry);

impl_message_traits!(SideEffectEntry: message);
impl WriteableMessage for SideEffectEntryMessage {
    fn generate_header(&self, never_ack: bool) -> MessageHeader {
        MessageHeader::new_ackable_entry_header(
            MessageType::SideEffectEntry,
            None,
            if never_ack { Some(false) } else { Some(true) },
            self.encoded_len() as u32,
        )
    }
}
impl EntryHeaderEq for SideEffectEntryMessage {
    // The recorded result is non-deterministic by definition.
    fn header_eq(&self, _: &Self) -> bool {
        true
    }
}

// --- Entry result extraction

impl TryFrom<get_state_entry_message::Result> for Value {
    type Error = Error;

    fn try_from(value: get_state_entry_message::Result) -> Result<Self, Self::Error> {
        Ok(match value {
            get_state_entry_message::Result::Empty(_) => Value::Void,
            get_state_entry_message::Result::Value(b) => Value::Success(b),
            get_state_entry_message::Result::Failure(f) => Value::Failure(f.into()),
        })
    }
}

impl TryFrom<get_state_keys_entry_message::Result> for Value {
    type Error = Error;

    fn try_from(value: get_state_keys_entry_message::Result) -> Result<Self, Self::Error> {
        match value {
            get_state_keys_entry_message::Result::Value(state_keys) => {
                let mut state_keys = state_keys
                    .keys
                    .into_iter()
                    .map(|b| String::from_utf8(b.to_vec()).map_err(DecodeStateKeysUtf8))
                    .collect::<Result<Vec<_>, _>>()?;
                state_keys.sort();
                Ok(Value::StateKeys(state_keys))
            }
            get_state_keys_entry_message::Result::Failure(f) => Ok(Value::Failure(f.into())),
        }
    }
}

impl TryFrom<sleep_entry_message::Result> for Value {
    type Error = Error;

    fn try_from(value: sleep_entry_message::Result) -> Result<Self, Self::Error> {
        Ok(match value {
            sleep_entry_message::Result::Empty(_) => Value::Void,
            sleep_entry_message::Result::Failure(f) => Value::Failure(f.into()),
        })
    }
}

impl TryFrom<invoke_entry_message::Result> for Value {
    type Error = Error;

    fn try_from(value: invoke_entry_message::Result) -> Result<Self, Self::Error> {
        Ok(match value {
            invoke_entry_message::Result::Value(b) => Value::Success(b),
            invoke_entry_message::Result::Failure(f) => Value::Failure(f.into()),
        })
    }
}

impl TryFrom<awakeable_entry_message::Result> for Value {
    type Error = Error;

    fn try_from(value: awakeable_entry_message::Result) -> Result<Self, Self::Error> {
        Ok(match value {
            awakeable_entry_message::Result::Value(b) => Value::Success(b),
            awakeable_entry_message::Result::Failure(f) => Value::Failure(f.into()),
        })
    }
}

impl From<side_effect_entry_message::Result> for NonEmptyValue {
    fn from(value: side_effect_entry_message::Result) -> Self {
        match value {
            side_effect_entry_message::Result::Value(b) => NonEmptyValue::Success(b),
            side_effect_entry_message::Result::Failure(f) => NonEmptyValue::Failure(f.into()),
        }
    }
}

impl From<NonEmptyValue> for side_effect_entry_message::Result {
    fn from(value: NonEmptyValue) -> Self {
        match value {
            NonEmptyValue::Success(b) => side_effect_entry_message::Result::Value(b),
            NonEmptyValue::Failure(f) => side_effect_entry_message::Result::Failure(f.into()),
        }
    }
}

// --- Other conversions

impl From<crate::TerminalFailure> for Failure {
    fn from(value: crate::TerminalFailure) -> Self {
        Self {
            code: value.code as u32,
            message: value.message,
        }
    }
}

impl From<Failure> for crate::TerminalFailure {
    fn from(value: Failure) -> Self {
        Self {
            code: value.code as u16,
            message: value.message,
        }
    }
}

impl From<Header> for crate::Header {
    fn from(value: Header) -> Self {
        Self {
            key: value.key.into(),
            value: value.value.into(),
        }
    }
}

// --- Completion parsing
//
// A CompletionMessage body is untyped on the wire, the entry it completes
// determines how to interpret it. Every completable entry registers a hint
// when it's appended, so completions buffered before the entry exists can be
// parsed once the entry shows up.

#[derive(Debug)]
pub(crate) enum CompletionParsingHint {
    StateKeys,
    /// The normal case
    EmptyOrSuccessOrValue,
}

impl CompletionParsingHint {
    pub(crate) fn parse(self, result: completion_message::Result) -> Result<Value, Error> {
        match self {
            CompletionParsingHint::StateKeys => match result {
                completion_message::Result::Empty(_) => Err(EmptyStateKeys.into()),
                completion_message::Result::Value(b) => {
                    let mut state_keys = get_state_keys_entry_message::StateKeys::decode(b)
                        .map_err(DecodeStateKeysProst)?
                        .keys
                        .into_iter()
                        .map(|b| String::from_utf8(b.to_vec()).map_err(DecodeStateKeysUtf8))
                        .collect::<Result<Vec<_>, _>>()?;
                    state_keys.sort();

                    Ok(Value::StateKeys(state_keys))
                }
                completion_message::Result::Failure(f) => Ok(Value::Failure(f.into())),
            },
            CompletionParsingHint::EmptyOrSuccessOrValue => Ok(match result {
                completion_message::Result::Empty(_) => Value::Void,
                completion_message::Result::Value(b) => Value::Success(b),
                completion_message::Result::Failure(f) => Value::Failure(f.into()),
            }),
        }
    }
}
