/********************************************************************************
 * Copyright (c) 2024 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! Logical frame contract exchanged over a session stream.
//!
//! Frames are schema-level records; how they are laid out on the wire is the
//! business of [`crate::data_plane::frame_codec::FrameCodec`].

use crate::error::Result;
use crate::message::MessageId;
use crate::session::SessionId;
use bytes::{Buf, BufMut, Bytes};
use prost::encoding::{self, DecodeContext, WireType};
use prost::DecodeError;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame on every stream.
    Handshake {
        role: String,
        pipe_address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    HandshakeAck {
        session_id: SessionId,
    },
    HandshakeRejected {
        reason: String,
    },
    /// Producer→server on submission (empty id asks the server to assign one),
    /// server→consumer on delivery.
    MessageEnvelope {
        #[serde(default)]
        message_id: MessageId,
        pipe_address: String,
        body: Bytes,
        #[serde(default)]
        attempt_count: u32,
    },
    SubmitAccepted {
        message_id: MessageId,
    },
    SubmitRejected {
        #[serde(default)]
        message_id: MessageId,
        reason: String,
    },
    Ack {
        message_id: MessageId,
    },
    DeliveryFailed {
        message_id: MessageId,
        reason: String,
        attempt_count: u32,
    },
    /// Health/echo query answered outside the streaming path.
    Ping {
        #[serde(default)]
        body: String,
    },
    /// Carries an encoded [`MessageResponse`].
    Pong {
        response: Bytes,
    },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Handshake { .. } => "handshake",
            Frame::HandshakeAck { .. } => "handshake_ack",
            Frame::HandshakeRejected { .. } => "handshake_rejected",
            Frame::MessageEnvelope { .. } => "message_envelope",
            Frame::SubmitAccepted { .. } => "submit_accepted",
            Frame::SubmitRejected { .. } => "submit_rejected",
            Frame::Ack { .. } => "ack",
            Frame::DeliveryFailed { .. } => "delivery_failed",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
        }
    }
}

/// Minimal response envelope: one opaque UTF-8 `body`, field number 1.
///
/// An absent field decodes to the empty string, and decoding into an existing
/// value never replaces its body with an empty one.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct MessageResponse {
    body: String,
}

impl MessageResponse {
    pub const BODY_FIELD_NUMBER: u32 = 1;

    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn encode(&self) -> Bytes {
        Bytes::from(prost::Message::encode_to_vec(self))
    }

    pub fn decode(buf: impl Buf) -> Result<Self> {
        Ok(<Self as prost::Message>::decode(buf)?)
    }

    /// Decodes `buf` on top of `self`, keeping fields the input leaves empty.
    pub fn merge_encoded(&mut self, buf: impl Buf) -> Result<()> {
        prost::Message::merge(self, buf)?;
        Ok(())
    }

    pub fn merge_from(&mut self, other: &MessageResponse) {
        if !other.body.is_empty() {
            self.body = other.body.clone();
        }
    }
}

impl std::fmt::Debug for MessageResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageResponse")
            .field("body", &self.body)
            .finish()
    }
}

impl prost::Message for MessageResponse {
    fn encode_raw<B>(&self, buf: &mut B)
    where
        B: BufMut,
        Self: Sized,
    {
        if !self.body.is_empty() {
            encoding::string::encode(Self::BODY_FIELD_NUMBER, &self.body, buf);
        }
    }

    fn merge_field<B>(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut B,
        ctx: DecodeContext,
    ) -> std::result::Result<(), DecodeError>
    where
        B: Buf,
        Self: Sized,
    {
        match tag {
            Self::BODY_FIELD_NUMBER => {
                let mut body = String::new();
                encoding::string::merge(wire_type, &mut body, buf, ctx)?;
                if !body.is_empty() {
                    self.body = body;
                }
                Ok(())
            }
            _ => encoding::skip_field(wire_type, tag, buf, ctx),
        }
    }

    fn encoded_len(&self) -> usize {
        if self.body.is_empty() {
            0
        } else {
            encoding::string::encoded_len(Self::BODY_FIELD_NUMBER, &self.body)
        }
    }

    fn clear(&mut self) {
        self.body.clear();
    }
}
