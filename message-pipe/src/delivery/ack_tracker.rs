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

//! Acknowledgement, retry timeout and failure bookkeeping for dispatched messages.
//!
//! The tracker never picks a consumer. It only decides where a message goes
//! next in its state machine and tells the caller whether a redispatch is due.

use crate::control_plane::session_registry::SessionRegistry;
use crate::delivery::message_store::MessageStore;
use crate::error::PipeError;
use crate::frame::Frame;
use crate::message::{Message, MessageId, MessageState};
use crate::observability::{events, fields};
use crate::runtime::retry_timer::RetryTimer;
use crate::session::SessionId;
use std::sync::Arc;
use tracing::{debug, info, warn};

const ACK_TRACKER_TAG: &str = "AckTracker:";
const ACK_TRACKER_FN_ACK_TAG: &str = "ack():";
const ACK_TRACKER_FN_TIMEOUT_TAG: &str = "on_timeout():";
const ACK_TRACKER_FN_REQUEUE_TAG: &str = "requeue_for_closed_session():";
const ACK_TRACKER_FN_FAIL_TAG: &str = "fail():";

#[derive(Debug)]
pub(crate) enum TimeoutOutcome {
    /// Back to `Pending`; the caller should dispatch again.
    Requeue(Message),
    Failed(Message),
    /// The attempt already finished by other means.
    Stale,
}

pub(crate) struct AckTracker {
    store: Arc<MessageStore>,
    registry: Arc<SessionRegistry>,
    max_attempts: u32,
}

impl AckTracker {
    pub(crate) fn new(
        store: Arc<MessageStore>,
        registry: Arc<SessionRegistry>,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            registry,
            max_attempts,
        }
    }

    pub(crate) fn arm(&self, message_id: &MessageId, timer: RetryTimer) -> bool {
        self.store.arm_timer(message_id, timer)
    }

    /// Applies a consumer ack. Only the session the current attempt went to may
    /// ack it; anything else is logged and dropped.
    pub(crate) fn ack(&self, consumer: &SessionId, message_id: &MessageId) -> Option<Message> {
        let acked = self.store.transition(
            message_id,
            MessageState::Acked,
            |message| {
                message.state == MessageState::Dispatched
                    && message.target_session_id.as_ref() == Some(consumer)
            },
            |_| {},
        );

        match acked {
            Some(acked) => {
                self.registry.release(consumer, message_id);
                info!(
                    event = events::ACK_RECEIVED,
                    message_id = %message_id,
                    session_id = %consumer,
                    attempt = acked.message.attempt_count,
                    "{ACK_TRACKER_TAG}:{ACK_TRACKER_FN_ACK_TAG} acked"
                );
                Some(acked.message)
            }
            None => {
                let state = self
                    .store
                    .state(message_id)
                    .map(|state| state.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                debug!(
                    event = events::ACK_IGNORED,
                    message_id = %message_id,
                    session_id = %consumer,
                    state = %state,
                    "{ACK_TRACKER_TAG}:{ACK_TRACKER_FN_ACK_TAG} ack does not match current attempt"
                );
                None
            }
        }
    }

    /// Handles expiry of the retry timer armed for `attempt` on `target`.
    ///
    /// Attempts handed back after a session close are numbered again, so the
    /// target is part of what identifies the attempt a timer belongs to.
    pub(crate) fn on_timeout(
        &self,
        message_id: &MessageId,
        attempt: u32,
        target: &SessionId,
    ) -> TimeoutOutcome {
        let same_attempt = |message: &Message| {
            message.state == MessageState::Dispatched
                && message.attempt_count == attempt
                && message.target_session_id.as_ref() == Some(target)
        };
        let Some(snapshot) = self.store.get(message_id) else {
            return TimeoutOutcome::Stale;
        };
        if !same_attempt(&snapshot) {
            debug!(
                event = events::RETRY_STALE,
                message_id = %message_id,
                attempt,
                state = %snapshot.state,
                "{ACK_TRACKER_TAG}:{ACK_TRACKER_FN_TIMEOUT_TAG} timer outlived its attempt"
            );
            return TimeoutOutcome::Stale;
        }

        let timeout = PipeError::DeliveryTimeout {
            message_id: message_id.clone(),
            attempt,
        };

        if attempt < self.max_attempts {
            let Some(requeued) = self.store.transition(
                message_id,
                MessageState::Pending,
                same_attempt,
                |message| message.target_session_id = None,
            ) else {
                return TimeoutOutcome::Stale;
            };
            self.release_previous_target(&requeued.previous_target, message_id);
            warn!(
                event = events::RETRY_TIMEOUT,
                message_id = %message_id,
                attempt,
                max_attempts = self.max_attempts,
                target_session_id = %fields::format_target(requeued.previous_target.as_ref()),
                "{ACK_TRACKER_TAG}:{ACK_TRACKER_FN_TIMEOUT_TAG} {timeout}, requeueing"
            );
            TimeoutOutcome::Requeue(requeued.message)
        } else {
            let Some(failed) =
                self.store
                    .transition(message_id, MessageState::Failed, same_attempt, |_| {})
            else {
                return TimeoutOutcome::Stale;
            };
            self.release_previous_target(&failed.previous_target, message_id);
            warn!(
                event = events::RETRY_TIMEOUT,
                message_id = %message_id,
                attempt,
                max_attempts = self.max_attempts,
                "{ACK_TRACKER_TAG}:{ACK_TRACKER_FN_TIMEOUT_TAG} {timeout}, attempts exhausted"
            );
            let reason = format!("no ack after {attempt} delivery attempts");
            self.report_failure(&failed.message, &reason);
            TimeoutOutcome::Failed(failed.message)
        }
    }

    /// Pulls back every unacked message the closed session held and returns
    /// the ids now `Pending`. The attempt lost with the session is handed back,
    /// so whether the message fails is left to the redispatch finding no
    /// remaining consumer.
    pub(crate) fn requeue_for_closed_session(
        &self,
        closed: &SessionId,
        message_ids: Vec<MessageId>,
    ) -> Vec<MessageId> {
        let held_by_closed = |message: &Message| {
            message.state == MessageState::Dispatched
                && message.target_session_id.as_ref() == Some(closed)
        };

        let mut requeued = Vec::with_capacity(message_ids.len());
        for message_id in message_ids {
            let Some(pulled_back) = self.store.transition(
                &message_id,
                MessageState::Pending,
                held_by_closed,
                |message| {
                    message.attempt_count = message.attempt_count.saturating_sub(1);
                    message.target_session_id = None;
                },
            ) else {
                continue;
            };
            info!(
                event = events::REQUEUE_SESSION_CLOSED,
                message_id = %message_id,
                session_id = %closed,
                attempt_count = pulled_back.message.attempt_count,
                "{ACK_TRACKER_TAG}:{ACK_TRACKER_FN_REQUEUE_TAG} requeued"
            );
            requeued.push(message_id);
        }
        requeued
    }

    /// Fails a message that is still in flight and tells its producer.
    pub(crate) fn fail(&self, message_id: &MessageId, reason: &str) -> Option<Message> {
        let failed = self.store.transition(
            message_id,
            MessageState::Failed,
            |message| !message.state.is_terminal(),
            |_| {},
        )?;
        self.release_previous_target(&failed.previous_target, message_id);
        debug!(
            message_id = %message_id,
            previous = %failed.previous,
            "{ACK_TRACKER_TAG}:{ACK_TRACKER_FN_FAIL_TAG} failed"
        );
        self.report_failure(&failed.message, reason);
        Some(failed.message)
    }

    fn report_failure(&self, message: &Message, reason: &str) {
        let frame = Frame::DeliveryFailed {
            message_id: message.message_id.clone(),
            reason: reason.to_string(),
            attempt_count: message.attempt_count,
        };
        let failure = PipeError::DeliveryFailed {
            message_id: message.message_id.clone(),
            reason: reason.to_string(),
        };
        match self.registry.notify(&message.producer_session_id, frame) {
            Ok(()) => warn!(
                event = events::DELIVERY_FAILED,
                producer_session_id = %message.producer_session_id,
                attempt_count = message.attempt_count,
                "{failure}"
            ),
            Err(err) => warn!(
                event = events::DELIVERY_FAILED_UNREPORTED,
                producer_session_id = %message.producer_session_id,
                attempt_count = message.attempt_count,
                "{failure}, producer not reachable: {err}"
            ),
        }
    }

    fn release_previous_target(&self, target: &Option<SessionId>, message_id: &MessageId) {
        if let Some(target) = target {
            self.registry.release(target, message_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AckTracker, TimeoutOutcome};
    use crate::control_plane::session_registry::SessionRegistry;
    use crate::delivery::message_store::MessageStore;
    use crate::frame::Frame;
    use crate::message::{Message, MessageId, MessageState};
    use crate::session::{ClientSession, Role, SessionId};
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Barrier};
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        store: Arc<MessageStore>,
        registry: Arc<SessionRegistry>,
        tracker: AckTracker,
        producer_rx: mpsc::Receiver<Frame>,
        _consumer_rx: mpsc::Receiver<Frame>,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let store = Arc::new(MessageStore::new());
        let registry = Arc::new(SessionRegistry::new());

        let (producer_tx, producer_rx) = mpsc::channel(8);
        registry
            .register(
                ClientSession::new(SessionId::from("producer"), Role::Producer, "orders"),
                producer_tx,
                CancellationToken::new(),
            )
            .unwrap();
        let (consumer_tx, consumer_rx) = mpsc::channel(8);
        registry
            .register(
                ClientSession::new(SessionId::from("consumer"), Role::Consumer, "orders"),
                consumer_tx,
                CancellationToken::new(),
            )
            .unwrap();

        let tracker = AckTracker::new(Arc::clone(&store), Arc::clone(&registry), max_attempts);
        Fixture {
            store,
            registry,
            tracker,
            producer_rx,
            _consumer_rx: consumer_rx,
        }
    }

    fn dispatched(fx: &Fixture, id: &str) -> MessageId {
        let message_id = MessageId::from(id);
        fx.store
            .insert(Message::new(
                message_id.clone(),
                "orders",
                Bytes::from_static(b"body"),
                SessionId::from("producer"),
            ))
            .unwrap();
        fx.store
            .transition(
                &message_id,
                MessageState::Dispatched,
                |_| true,
                |m| {
                    m.attempt_count += 1;
                    m.target_session_id = Some(SessionId::from("consumer"));
                },
            )
            .unwrap();
        fx.registry
            .deliver(
                &SessionId::from("consumer"),
                &message_id,
                Frame::Ack {
                    message_id: message_id.clone(),
                },
            )
            .unwrap();
        message_id
    }

    #[test]
    fn ack_from_the_target_acks_and_releases() {
        let fx = fixture(3);
        let id = dispatched(&fx, "m-1");

        assert!(fx.tracker.ack(&SessionId::from("consumer"), &id).is_some());
        assert_eq!(fx.store.state(&id), Some(MessageState::Acked));
        assert_eq!(fx.registry.pending_total(), 0);
    }

    #[test]
    fn ack_from_another_session_is_ignored() {
        let fx = fixture(3);
        let id = dispatched(&fx, "m-1");

        assert!(fx.tracker.ack(&SessionId::from("producer"), &id).is_none());
        assert_eq!(fx.store.state(&id), Some(MessageState::Dispatched));
    }

    #[test]
    fn late_timeout_after_ack_is_stale() {
        let fx = fixture(3);
        let id = dispatched(&fx, "m-1");
        fx.tracker.ack(&SessionId::from("consumer"), &id).unwrap();

        assert!(matches!(fx.tracker.on_timeout(&id, 1, &SessionId::from("consumer")), TimeoutOutcome::Stale));
        assert_eq!(fx.store.state(&id), Some(MessageState::Acked));
    }

    #[test]
    fn ack_after_timeout_requeue_does_not_apply() {
        let fx = fixture(3);
        let id = dispatched(&fx, "m-1");

        assert!(matches!(
            fx.tracker.on_timeout(&id, 1, &SessionId::from("consumer")),
            TimeoutOutcome::Requeue(_)
        ));
        assert!(fx.tracker.ack(&SessionId::from("consumer"), &id).is_none());
        assert_eq!(fx.store.state(&id), Some(MessageState::Pending));
        assert_eq!(fx.registry.pending_total(), 0);
    }

    #[test]
    fn timeout_for_another_target_is_stale() {
        let fx = fixture(3);
        let id = dispatched(&fx, "m-1");

        assert!(matches!(
            fx.tracker.on_timeout(&id, 1, &SessionId::from("departed")),
            TimeoutOutcome::Stale
        ));
        assert_eq!(fx.store.state(&id), Some(MessageState::Dispatched));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_ack_and_timeout_apply_exactly_one_transition() {
        for round in 0..200 {
            let fx = fixture(3);
            let id = dispatched(&fx, &format!("m-{round}"));
            let Fixture {
                store,
                registry,
                tracker,
                producer_rx: _producer_rx,
                _consumer_rx,
            } = fx;
            let tracker = Arc::new(tracker);
            let start = Arc::new(Barrier::new(2));

            let ack = {
                let (tracker, start, id) = (Arc::clone(&tracker), Arc::clone(&start), id.clone());
                tokio::spawn(async move {
                    start.wait().await;
                    tracker.ack(&SessionId::from("consumer"), &id).is_some()
                })
            };
            let timeout = {
                let (tracker, start, id) = (Arc::clone(&tracker), Arc::clone(&start), id.clone());
                tokio::spawn(async move {
                    start.wait().await;
                    matches!(
                        tracker.on_timeout(&id, 1, &SessionId::from("consumer")),
                        TimeoutOutcome::Requeue(_)
                    )
                })
            };
            let acked = ack.await.unwrap();
            let requeued = timeout.await.unwrap();

            assert!(acked != requeued, "round {round}: acked={acked} requeued={requeued}");
            let expected = if acked {
                MessageState::Acked
            } else {
                MessageState::Pending
            };
            assert_eq!(store.state(&id), Some(expected));
            assert_eq!(registry.pending_total(), 0);
        }
    }

    #[test]
    fn last_attempt_timeout_fails_and_notifies_producer() {
        let mut fx = fixture(1);
        let id = dispatched(&fx, "m-1");

        assert!(matches!(
            fx.tracker.on_timeout(&id, 1, &SessionId::from("consumer")),
            TimeoutOutcome::Failed(_)
        ));
        match fx.producer_rx.try_recv().unwrap() {
            Frame::DeliveryFailed {
                message_id,
                attempt_count,
                ..
            } => {
                assert_eq!(message_id, id);
                assert_eq!(attempt_count, 1);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn closed_session_requeue_hands_back_the_lost_attempt() {
        let fx = fixture(1);
        let consumer = SessionId::from("consumer");
        let id = dispatched(&fx, "m-1");

        let requeued = fx
            .tracker
            .requeue_for_closed_session(&consumer, vec![id.clone()]);
        assert_eq!(requeued, vec![id.clone()]);

        let message = fx.store.get(&id).unwrap();
        assert_eq!(message.state, MessageState::Pending);
        assert_eq!(message.attempt_count, 0);
        assert_eq!(message.target_session_id, None);
    }

    #[test]
    fn closed_session_skips_messages_it_no_longer_holds() {
        let fx = fixture(3);
        let consumer = SessionId::from("consumer");
        let id = dispatched(&fx, "m-1");
        fx.tracker.ack(&consumer, &id).unwrap();

        assert!(fx
            .tracker
            .requeue_for_closed_session(&consumer, vec![id.clone()])
            .is_empty());
        assert_eq!(fx.store.state(&id), Some(MessageState::Acked));
    }

    #[test]
    fn fail_is_a_no_op_on_terminal_messages() {
        let fx = fixture(3);
        let id = dispatched(&fx, "m-1");
        fx.tracker.ack(&SessionId::from("consumer"), &id).unwrap();

        assert!(fx.tracker.fail(&id, "shutting down").is_none());
        assert_eq!(fx.store.state(&id), Some(MessageState::Acked));
    }
}
