use crate::service_protocol::messages::{
    completion_message, CompletionParsingHint, ProtocolMessage, WriteableMessage,
};
use crate::service_protocol::{Encoder, MessageType, Version};
use crate::vm::errors::DoubleCompletionError;
use crate::{AsyncResultHandle, AsyncResultState, Error, ProtocolMode, Value};
use bytes::Bytes;
use bytes_utils::SegmentedBuf;
use std::collections::{HashMap, VecDeque};

#[derive(Clone, Debug)]
pub(crate) struct StartInfo {
    pub(crate) id: Bytes,
    pub(crate) debug_id: String,
    pub(crate) key: String,
    pub(crate) entries_to_replay: u32,
}

pub(crate) struct Journal {
    index: Option<u32>,
    pub(crate) current_entry_ty: MessageType,
}

impl Journal {
    pub(crate) fn transition<M: ProtocolMessage>(&mut self, _expected: &M) {
        self.index = Some(self.index.take().map(|i| i + 1).unwrap_or(0));
        self.current_entry_ty = M::ty();
    }

    pub(crate) fn index(&self) -> i64 {
        self.index.map(|u| u as i64).unwrap_or(-1)
    }

    pub(crate) fn expect_index(&self) -> u32 {
        self.index.expect("index was initialized")
    }
}

impl Default for Journal {
    fn default() -> Self {
        Journal {
            index: None,
            current_entry_ty: MessageType::Start,
        }
    }
}

pub struct Output {
    encoder: Encoder,
    pub(crate) buffer: SegmentedBuf<Bytes>,
    is_closed: bool,
}

impl Output {
    pub(crate) fn new(version: Version, mode: ProtocolMode) -> Self {
        Self {
            encoder: Encoder::with_ack_mode(version, mode == ProtocolMode::RequestResponse),
            buffer: Default::default(),
            is_closed: false,
        }
    }

    pub(crate) fn send<M: WriteableMessage>(&mut self, msg: &M) {
        if !self.is_closed {
            self.buffer.push(self.encoder.encode(msg))
        }
    }

    pub(crate) fn send_eof(&mut self) {
        self.is_closed = true;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.is_closed
    }
}

#[derive(Debug)]
enum UnparsedCompletionOrParsingHint {
    UnparsedCompletion(completion_message::Result),
    ParsingHint(CompletionParsingHint),
}

/// Bookkeeping to correlate incoming completions and acks with the journal
/// entry awaiting them. Completions may arrive before the entry they complete
/// is appended (already-known completions re-sent after a suspension), in
/// which case they're buffered unparsed until the entry registers its parsing
/// hint.
#[derive(Debug, Default)]
pub(crate) struct AsyncResultsState {
    unparsed_completions_or_parsing_hints: HashMap<u32, UnparsedCompletionOrParsingHint>,
    ready_results: HashMap<u32, Value>,
    last_acked_entry: u32,
    waiting_ack_results: VecDeque<(u32, Value)>,
}

impl AsyncResultsState {
    pub(crate) fn take_ready_result(&mut self, index: u32) -> Option<Value> {
        self.ready_results.remove(&index)
    }

    pub(crate) fn insert_completion_parsing_hint(
        &mut self,
        index: u32,
        completion_parsing_hint: CompletionParsingHint,
    ) -> Result<(), Error> {
        if let Some(unparsed_completion_or_parsing_hint) =
            self.unparsed_completions_or_parsing_hints.remove(&index)
        {
            match unparsed_completion_or_parsing_hint {
                UnparsedCompletionOrParsingHint::UnparsedCompletion(result) => {
                    self.ready_results
                        .insert(index, completion_parsing_hint.parse(result)?);
                }
                UnparsedCompletionOrParsingHint::ParsingHint(_) => {
                    panic!("Unexpected double call to insert_completion_parsing_hint for entry {index}")
                }
            }
        } else {
            self.unparsed_completions_or_parsing_hints.insert(
                index,
                UnparsedCompletionOrParsingHint::ParsingHint(completion_parsing_hint),
            );
        }
        Ok(())
    }

    pub(crate) fn insert_unparsed_completion(
        &mut self,
        index: u32,
        result: completion_message::Result,
    ) -> Result<(), Error> {
        if self.ready_results.contains_key(&index) {
            return Err(DoubleCompletionError { entry_index: index }.into());
        }
        if let Some(unparsed_completion_or_parsing_hint) =
            self.unparsed_completions_or_parsing_hints.remove(&index)
        {
            match unparsed_completion_or_parsing_hint {
                UnparsedCompletionOrParsingHint::UnparsedCompletion(_) => {
                    return Err(DoubleCompletionError { entry_index: index }.into());
                }
                UnparsedCompletionOrParsingHint::ParsingHint(completion_parsing_hint) => {
                    self.ready_results
                        .insert(index, completion_parsing_hint.parse(result)?);
                }
            }
        } else {
            self.unparsed_completions_or_parsing_hints.insert(
                index,
                UnparsedCompletionOrParsingHint::UnparsedCompletion(result),
            );
        }
        Ok(())
    }

    pub(crate) fn insert_ready_result(&mut self, index: u32, value: Value) {
        self.ready_results.insert(index, value);
    }

    /// Results of ack-resolved entries are held back until the runtime acked
    /// the entry, or until a completion beats the ack to it.
    pub(crate) fn insert_waiting_ack_result(&mut self, index: u32, value: Value) {
        if index <= self.last_acked_entry {
            self.ready_results.insert(index, value);
        } else {
            self.waiting_ack_results.push_back((index, value));
        }
    }

    pub(crate) fn notify_ack(&mut self, ack: u32) {
        if ack <= self.last_acked_entry {
            return;
        }
        self.last_acked_entry = ack;

        while let Some((idx, _)) = self.waiting_ack_results.front() {
            if *idx > self.last_acked_entry {
                return;
            }
            let (idx, value) = self
                .waiting_ack_results
                .pop_front()
                .expect("front was just checked");
            // A completion for the same entry may have won the race.
            self.ready_results.entry(idx).or_insert(value);
        }
    }

    pub(crate) fn get_ready_results_state(&self) -> HashMap<AsyncResultHandle, AsyncResultState> {
        self.ready_results
            .iter()
            .map(|(idx, val)| {
                (
                    AsyncResultHandle::from(*idx),
                    match val {
                        Value::Failure(_) => AsyncResultState::Failure,
                        Value::Void | Value::Success(_) | Value::StateKeys(_) => {
                            AsyncResultState::Success
                        }
                    },
                )
            })
            .collect()
    }
}

/// Tracks the reentrancy guard and the retry loop of the side effect being
/// driven, if any. Side effects cannot nest, so one tracker per invocation is
/// enough.
#[derive(Debug, Default)]
pub(crate) struct SideEffectState {
    running: bool,
    attempts: u32,
}

impl SideEffectState {
    pub(crate) fn is_running(&self) -> bool {
        self.running
    }

    pub(crate) fn start_attempt(&mut self) {
        self.running = true;
        self.attempts += 1;
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn finish_attempt(&mut self) {
        self.running = false;
    }

    pub(crate) fn reset(&mut self) {
        self.running = false;
        self.attempts = 0;
    }
}

pub(crate) enum EagerGetState {
    /// There is not enough local information to establish whether state is
    /// there or not, the runtime has to answer.
    Unknown,
    Empty,
    Value(Bytes),
}

pub(crate) enum EagerGetStateKeys {
    Unknown,
    Keys(Vec<String>),
}

pub(crate) struct EagerState {
    is_partial: bool,
    // None means Void, Value means value
    values: HashMap<String, Option<Bytes>>,
}

impl Default for EagerState {
    fn default() -> Self {
        Self {
            is_partial: true,
            values: Default::default(),
        }
    }
}

impl EagerState {
    pub(crate) fn new(is_partial: bool, values: Vec<(String, Bytes)>) -> Self {
        Self {
            is_partial,
            values: values
                .into_iter()
                .map(|(key, val)| (key, Some(val)))
                .collect(),
        }
    }

    pub(crate) fn get(&self, k: &str) -> EagerGetState {
        self.values
            .get(k)
            .map(|opt| match opt {
                None => EagerGetState::Empty,
                Some(s) => EagerGetState::Value(s.clone()),
            })
            .unwrap_or(if self.is_partial {
                EagerGetState::Unknown
            } else {
                EagerGetState::Empty
            })
    }

    pub(crate) fn get_keys(&self) -> EagerGetStateKeys {
        if self.is_partial {
            EagerGetStateKeys::Unknown
        } else {
            EagerGetStateKeys::Keys(
                self.values
                    .iter()
                    .filter(|(_, v)| v.is_some())
                    .map(|(k, _)| k.clone())
                    .collect(),
            )
        }
    }

    pub(crate) fn set(&mut self, k: String, v: Bytes) {
        self.values.insert(k, Some(v));
    }

    pub(crate) fn clear(&mut self, k: String) {
        self.values.insert(k, None);
    }

    pub(crate) fn clear_all(&mut self) {
        self.values.clear();
        self.is_partial = false;
    }
}

/// Context of the current invocation. Holds state across all the FSM
/// transitions, in particular to keep it available for logging after
/// transitioning to a failure state.
pub(crate) struct Context {
    pub(crate) start_info: Option<StartInfo>,
    pub(crate) journal: Journal,

    pub(crate) input_is_closed: bool,
    pub(crate) output: Output,
    pub(crate) eager_state: EagerState,
    pub(crate) side_effect: SideEffectState,
    pub(crate) mode: ProtocolMode,
}

impl Context {
    pub(crate) fn start_info(&self) -> Option<&StartInfo> {
        self.start_info.as_ref()
    }

    pub(crate) fn expect_start_info(&self) -> &StartInfo {
        self.start_info().expect("state is not WaitingStart")
    }
}
