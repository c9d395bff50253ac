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

//! Wire codec for [`Frame`]: a 4-byte big-endian length prefix followed by a
//! JSON body.

use crate::error::PipeError;
use crate::frame::Frame;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest accepted frame body.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        let inner = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .max_frame_length(max_frame_length)
            .new_codec();
        Self { inner }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = PipeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, PipeError> {
        match self.inner.decode(src)? {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = PipeError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), PipeError> {
        let body = serde_json::to_vec(&frame)?;
        self.inner.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::FrameCodec;
    use crate::error::PipeError;
    use crate::frame::Frame;
    use crate::message::MessageId;
    use bytes::{BufMut, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn frame_is_length_prefixed_json() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::Ack {
                    message_id: MessageId::from("m-1"),
                },
                &mut buf,
            )
            .unwrap();

        let expected = br#"{"type":"ack","message_id":"m-1"}"#;
        assert_eq!(&buf[..4], &(expected.len() as u32).to_be_bytes());
        assert_eq!(&buf[4..], expected);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = FrameCodec::new();
        let body = br#"{"type":"ping","body":"hi"}"#;
        let mut buf = BytesMut::new();
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body[..5]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.put_slice(&body[5..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Ping {
                body: "hi".to_string()
            })
        );
    }

    #[test]
    fn malformed_body_is_a_codec_error() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_slice(b"{no");

        assert!(matches!(codec.decode(&mut buf), Err(PipeError::Codec(_))));
    }

    #[test]
    fn oversized_frame_is_refused() {
        let mut codec = FrameCodec::with_max_frame_length(16);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        buf.put_slice(&[0u8; 32]);

        assert!(matches!(codec.decode(&mut buf), Err(PipeError::Io(_))));
    }
}
