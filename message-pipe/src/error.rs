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

//! Error taxonomy shared by every layer of the pipe server.

use crate::control_plane::lifecycle::ServerLifecycleState;
use crate::message::MessageId;
use crate::session::SessionId;
use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipeError>;

#[derive(Debug, Error)]
pub enum PipeError {
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("session {session_id} is already registered")]
    DuplicateSession { session_id: SessionId },

    #[error("invalid role {role:?}, expected \"producer\" or \"consumer\"")]
    InvalidRole { role: String },

    #[error("no consumer session registered for pipe address {pipe_address:?}")]
    UnknownAddress { pipe_address: String },

    #[error("message {message_id} was already submitted")]
    DuplicateMessage { message_id: MessageId },

    #[error("delivery of message {message_id} timed out on attempt {attempt}")]
    DeliveryTimeout { message_id: MessageId, attempt: u32 },

    #[error("delivery of message {message_id} failed: {reason}")]
    DeliveryFailed { message_id: MessageId, reason: String },

    #[error("lifecycle is {actual}, operation requires {expected}")]
    InvalidState {
        expected: ServerLifecycleState,
        actual: ServerLifecycleState,
    },

    #[error("unable to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("response envelope decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

impl PipeError {
    pub(crate) fn invalid_configuration(reason: impl Into<String>) -> Self {
        PipeError::InvalidConfiguration {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PipeError;
    use crate::message::MessageId;

    #[test]
    fn unknown_address_names_the_address() {
        let err = PipeError::UnknownAddress {
            pipe_address: "orders".to_string(),
        };
        assert!(err.to_string().contains("\"orders\""));
    }

    #[test]
    fn delivery_timeout_carries_attempt() {
        let err = PipeError::DeliveryTimeout {
            message_id: MessageId::from("m-1"),
            attempt: 2,
        };
        assert_eq!(
            err.to_string(),
            "delivery of message m-1 timed out on attempt 2"
        );
    }
}
