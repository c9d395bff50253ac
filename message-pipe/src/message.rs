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

//! In-flight message data model and its state machine.

use crate::session::SessionId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::Instant;
use uuid::Uuid;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageState {
    Pending,
    Dispatched,
    Acked,
    Failed,
}

impl MessageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageState::Acked | MessageState::Failed)
    }

    /// Edges of the delivery state machine. Terminal states have no way out.
    pub fn can_transition_to(self, next: MessageState) -> bool {
        use MessageState::*;
        matches!(
            (self, next),
            (Pending, Dispatched)
                | (Pending, Failed)
                | (Dispatched, Acked)
                | (Dispatched, Pending)
                | (Dispatched, Failed)
        )
    }
}

impl Display for MessageState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageState::Pending => "pending",
            MessageState::Dispatched => "dispatched",
            MessageState::Acked => "acked",
            MessageState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct Message {
    pub message_id: MessageId,
    pub pipe_address: String,
    pub body: Bytes,
    pub state: MessageState,
    pub attempt_count: u32,
    pub enqueued_at: Instant,
    pub last_attempt_at: Option<Instant>,
    pub target_session_id: Option<SessionId>,
    /// Producer that submitted the message; failure notices go back here.
    pub producer_session_id: SessionId,
}

impl Message {
    pub fn new(
        message_id: MessageId,
        pipe_address: &str,
        body: Bytes,
        producer_session_id: SessionId,
    ) -> Self {
        Self {
            message_id,
            pipe_address: pipe_address.to_string(),
            body,
            state: MessageState::Pending,
            attempt_count: 0,
            enqueued_at: Instant::now(),
            last_attempt_at: None,
            target_session_id: None,
            producer_session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MessageState::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for next in [Pending, Dispatched, Acked, Failed] {
            assert!(!Acked.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn pending_cannot_be_acked_directly() {
        assert!(!Pending.can_transition_to(Acked));
        assert!(Pending.can_transition_to(Dispatched));
    }

    #[test]
    fn dispatched_can_retry_ack_or_fail() {
        assert!(Dispatched.can_transition_to(Pending));
        assert!(Dispatched.can_transition_to(Acked));
        assert!(Dispatched.can_transition_to(Failed));
        assert!(!Dispatched.can_transition_to(Dispatched));
    }
}
