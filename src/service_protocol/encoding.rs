// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use super::header::UnknownMessageType;
use super::messages::{ProtocolMessage, WriteableMessage};
use super::*;

use std::mem;

use crate::vm::errors::EntryTypeMismatchError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_utils::SegmentedBuf;
use prost::Message;

#[derive(Debug, thiserror::Error)]
pub enum DecodingError {
    #[error("cannot decode protocol message type {0:?}. Reason: {1:?}")]
    DecodeMessage(MessageType, #[source] prost::DecodeError),
    #[error(transparent)]
    UnexpectedMessageType(EntryTypeMismatchError),
    #[error(transparent)]
    UnknownMessageType(#[from] UnknownMessageType),
}

// --- Message encoder

pub struct Encoder {
    never_ack: bool,
}

impl Encoder {
    pub fn new(service_protocol_version: Version) -> Self {
        Self::with_ack_mode(service_protocol_version, false)
    }

    /// Encoder for request-response transports, where entry acks never come
    /// back, so the requires-ack flag is never raised.
    pub fn with_ack_mode(service_protocol_version: Version, never_ack: bool) -> Self {
        assert!(
            service_protocol_version >= Version::minimum_supported_version(),
            "Encoder only supports service protocol version {:?} <= x <= {:?}",
            Version::minimum_supported_version(),
            Version::maximum_supported_version()
        );
        Self { never_ack }
    }

    /// Encodes a protocol message to bytes
    pub fn encode<M: WriteableMessage>(&self, msg: &M) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len(msg));
        self.encode_to_buf_mut(&mut buf, msg).expect(
            "Encoding messages should be infallible, \
            this error indicates a bug in the invoker code. \
            Please contact the Restate developers.",
        );
        buf.freeze()
    }

    /// Includes header len
    pub fn encoded_len<M: WriteableMessage>(&self, msg: &M) -> usize {
        8 + msg.encoded_len()
    }

    pub fn encode_to_buf_mut<M: WriteableMessage>(
        &self,
        mut buf: impl BufMut,
        msg: &M,
    ) -> Result<(), prost::EncodeError> {
        let header = msg.generate_header(self.never_ack);
        buf.put_u64(header.into());
        // prost::EncodeError can only trigger on a buffer smaller than
        // required, and the buffer is sized with prost's own computation.
        msg.encode(&mut buf)
    }
}

// --- Message decoder

#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage(MessageHeader, Bytes);

impl RawMessage {
    pub fn ty(&self) -> MessageType {
        self.0.message_type()
    }

    pub fn header(&self) -> MessageHeader {
        self.0
    }

    pub fn decode_to<M: ProtocolMessage>(self) -> Result<M, DecodingError> {
        if self.0.message_type() != M::ty() {
            return Err(DecodingError::UnexpectedMessageType(
                EntryTypeMismatchError::new(self.0.message_type(), M::ty()),
            ));
        }
        M::decode(self.1).map_err(|e| DecodingError::DecodeMessage(self.0.message_type(), e))
    }
}

/// Stateful decoder over the length-prefixed message stream.
pub struct Decoder {
    buf: SegmentedBuf<Bytes>,
    state: DecoderState,
}

impl Decoder {
    pub fn new(service_protocol_version: Version) -> Self {
        assert!(
            service_protocol_version >= Version::minimum_supported_version(),
            "Decoder only supports service protocol version {:?} <= x <= {:?}",
            Version::minimum_supported_version(),
            Version::maximum_supported_version()
        );
        Self {
            buf: SegmentedBuf::new(),
            state: DecoderState::WaitingHeader,
        }
    }

    /// Concatenate a new chunk in the internal buffer.
    pub fn push(&mut self, buf: Bytes) {
        self.buf.push(buf)
    }

    /// Try to consume the next message in the internal buffer.
    pub fn consume_next(&mut self) -> Result<Option<RawMessage>, DecodingError> {
        loop {
            let remaining = self.buf.remaining();

            if remaining < self.state.needs_bytes() {
                return Ok(None);
            }

            if let Some(res) = self.state.decode(&mut self.buf)? {
                return Ok(Some(res));
            }
        }
    }
}

#[derive(Default)]
enum DecoderState {
    #[default]
    WaitingHeader,
    WaitingPayload(MessageHeader),
}

impl DecoderState {
    fn needs_bytes(&self) -> usize {
        match self {
            DecoderState::WaitingHeader => 8,
            DecoderState::WaitingPayload(h) => h.message_length() as usize,
        }
    }

    fn decode(&mut self, mut buf: impl Buf) -> Result<Option<RawMessage>, DecodingError> {
        let mut res = None;

        *self = match mem::take(self) {
            DecoderState::WaitingHeader => {
                let header: MessageHeader = buf.get_u64().try_into()?;
                DecoderState::WaitingPayload(header)
            }
            DecoderState::WaitingPayload(h) => {
                let msg = RawMessage(h, buf.copy_to_bytes(h.message_length() as usize));
                res = Some(msg);
                DecoderState::WaitingHeader
            }
        };

        Ok(res)
    }
}
