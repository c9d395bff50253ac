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

//! In-flight message store with per-message transition guard.

use crate::error::{PipeError, Result};
use crate::message::{Message, MessageId, MessageState};
use crate::observability::events;
use crate::runtime::retry_timer::RetryTimer;
use crate::session::SessionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

const MESSAGE_STORE_TAG: &str = "MessageStore:";
const MESSAGE_STORE_FN_EVICT_TAG: &str = "evict_expired():";

struct MessageRecord {
    message: Message,
    retry_timer: Option<RetryTimer>,
    terminal_at: Option<Instant>,
}

/// Result of a successful compare-and-transition.
#[derive(Debug, Clone)]
pub(crate) struct Transitioned {
    pub(crate) message: Message,
    pub(crate) previous: MessageState,
    pub(crate) previous_target: Option<SessionId>,
}

pub(crate) struct MessageStore {
    records: DashMap<MessageId, MessageRecord>,
}

impl MessageStore {
    pub(crate) fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Adds a new message. Ids still known to the store, terminal ones inside the
    /// retention window included, are refused.
    pub(crate) fn insert(&self, message: Message) -> Result<()> {
        match self.records.entry(message.message_id.clone()) {
            Entry::Occupied(_) => Err(PipeError::DuplicateMessage {
                message_id: message.message_id,
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(MessageRecord {
                    message,
                    retry_timer: None,
                    terminal_at: None,
                });
                Ok(())
            }
        }
    }

    pub(crate) fn get(&self, message_id: &MessageId) -> Option<Message> {
        self.records
            .get(message_id)
            .map(|record| record.message.clone())
    }

    pub(crate) fn state(&self, message_id: &MessageId) -> Option<MessageState> {
        self.records
            .get(message_id)
            .map(|record| record.message.state)
    }

    /// Moves the message to `to` if the edge is legal and `guard` accepts the
    /// current value. `update` runs under the same entry lock before the state
    /// changes. Leaving `Dispatched` cancels the retry timer, exactly once.
    pub(crate) fn transition<G, U>(
        &self,
        message_id: &MessageId,
        to: MessageState,
        guard: G,
        update: U,
    ) -> Option<Transitioned>
    where
        G: FnOnce(&Message) -> bool,
        U: FnOnce(&mut Message),
    {
        let mut record = self.records.get_mut(message_id)?;
        let previous = record.message.state;
        if !previous.can_transition_to(to) || !guard(&record.message) {
            return None;
        }

        let previous_target = record.message.target_session_id.clone();
        update(&mut record.message);
        record.message.state = to;

        if previous == MessageState::Dispatched {
            if let Some(timer) = record.retry_timer.take() {
                timer.cancel();
            }
        }
        if to.is_terminal() {
            record.terminal_at = Some(Instant::now());
        }

        Some(Transitioned {
            message: record.message.clone(),
            previous,
            previous_target,
        })
    }

    /// Attaches the retry timer for `timer.attempt()`. A timer that arrives after
    /// the message already moved on is cancelled instead.
    pub(crate) fn arm_timer(&self, message_id: &MessageId, timer: RetryTimer) -> bool {
        let Some(mut record) = self.records.get_mut(message_id) else {
            timer.cancel();
            return false;
        };
        if record.message.state == MessageState::Dispatched
            && record.message.attempt_count == timer.attempt()
            && record.retry_timer.is_none()
        {
            record.retry_timer = Some(timer);
            true
        } else {
            timer.cancel();
            false
        }
    }

    /// Ids of messages not yet acked or failed.
    pub(crate) fn in_flight_ids(&self) -> Vec<MessageId> {
        self.records
            .iter()
            .filter(|record| !record.message.state.is_terminal())
            .map(|record| record.key().clone())
            .collect()
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.records
            .iter()
            .filter(|record| !record.message.state.is_terminal())
            .count()
    }

    /// Drops terminal messages older than `window`.
    pub(crate) fn evict_expired(&self, window: Duration) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| match record.terminal_at {
            Some(terminal_at) => terminal_at.elapsed() < window,
            None => true,
        });
        let evicted = before.saturating_sub(self.records.len());
        if evicted > 0 {
            debug!(
                event = events::RETENTION_EVICT,
                evicted,
                "{MESSAGE_STORE_TAG}:{MESSAGE_STORE_FN_EVICT_TAG} evicted terminal messages"
            );
        }
        evicted
    }
}
