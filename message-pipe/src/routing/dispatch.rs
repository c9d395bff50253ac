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

//! Dispatch router: accepts submissions and drives each message to a consumer.

use crate::config::ServerConfiguration;
use crate::control_plane::session_registry::SessionRegistry;
use crate::delivery::ack_tracker::{AckTracker, TimeoutOutcome};
use crate::delivery::message_store::MessageStore;
use crate::error::{PipeError, Result};
use crate::frame::Frame;
use crate::message::{Message, MessageId, MessageState};
use crate::observability::events;
use crate::routing::round_robin::{failover_order, RoundRobinCursors};
use crate::runtime::retry_timer::RetryTimer;
use crate::session::{Role, SessionId};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const COMPONENT: &str = "dispatch_router";

pub(crate) struct DispatchRouter {
    registry: Arc<SessionRegistry>,
    store: Arc<MessageStore>,
    tracker: AckTracker,
    cursors: RoundRobinCursors,
    retry_timeout: Duration,
    deduplicate: bool,
}

impl DispatchRouter {
    pub(crate) fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<MessageStore>,
        config: &ServerConfiguration,
    ) -> Self {
        let tracker = AckTracker::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.retry.max_attempts,
        );
        Self {
            registry,
            store,
            tracker,
            cursors: RoundRobinCursors::new(),
            retry_timeout: config.retry_timeout(),
            deduplicate: config.retention.deduplicate,
        }
    }

    /// Accepts a producer submission. On success the producer is sent a
    /// `SubmitAccepted` receipt before the first dispatch attempt, so a
    /// `DeliveryFailed` for the same id never overtakes it.
    pub(crate) fn submit(
        self: &Arc<Self>,
        producer: &SessionId,
        pipe_address: &str,
        body: Bytes,
        requested_id: MessageId,
    ) -> Result<MessageId> {
        if self
            .registry
            .list_by_address(pipe_address, Role::Consumer)
            .is_empty()
        {
            warn!(
                event = events::SUBMIT_REJECTED,
                component = COMPONENT,
                producer_session_id = %producer,
                pipe_address,
                reason = "no_consumer",
                "rejecting submission"
            );
            return Err(PipeError::UnknownAddress {
                pipe_address: pipe_address.to_string(),
            });
        }

        let message_id = if requested_id.is_empty() {
            MessageId::generate()
        } else {
            requested_id
        };
        let message = Message::new(message_id.clone(), pipe_address, body, producer.clone());

        if let Err(err) = self.store.insert(message) {
            if !self.deduplicate {
                warn!(
                    event = events::SUBMIT_REJECTED,
                    component = COMPONENT,
                    producer_session_id = %producer,
                    message_id = %message_id,
                    err = %err,
                    "rejecting submission"
                );
                return Err(err);
            }
            info!(
                event = events::SUBMIT_DUPLICATE,
                component = COMPONENT,
                producer_session_id = %producer,
                message_id = %message_id,
                "resubmission of a known message id, keeping the existing message"
            );
            self.send_receipt(producer, &message_id);
            return Ok(message_id);
        }

        debug!(
            event = events::SUBMIT_ACCEPTED,
            component = COMPONENT,
            producer_session_id = %producer,
            message_id = %message_id,
            pipe_address,
            "accepted submission"
        );
        self.send_receipt(producer, &message_id);
        self.dispatch(&message_id, None);
        Ok(message_id)
    }

    fn send_receipt(&self, producer: &SessionId, message_id: &MessageId) {
        let receipt = Frame::SubmitAccepted {
            message_id: message_id.clone(),
        };
        if let Err(err) = self.registry.notify(producer, receipt) {
            warn!(
                component = COMPONENT,
                producer_session_id = %producer,
                message_id = %message_id,
                err = %err,
                "unable to queue submit receipt"
            );
        }
    }

    /// Sends a `Pending` message to the next consumer in rotation, failing over
    /// across the remaining candidates if the picked one refuses the frame.
    pub(crate) fn dispatch(self: &Arc<Self>, message_id: &MessageId, exclude: Option<&SessionId>) {
        let Some(message) = self.store.get(message_id) else {
            return;
        };
        if message.state != MessageState::Pending {
            return;
        }

        let candidates: Vec<SessionId> = self
            .registry
            .list_by_address(&message.pipe_address, Role::Consumer)
            .into_iter()
            .map(|session| session.session_id)
            .filter(|session_id| Some(session_id) != exclude)
            .collect();

        if candidates.is_empty() {
            warn!(
                event = events::DISPATCH_NO_CONSUMER,
                component = COMPONENT,
                message_id = %message_id,
                pipe_address = %message.pipe_address,
                "no consumer session available"
            );
            self.tracker.fail(
                message_id,
                &format!(
                    "no consumer session available for pipe address {}",
                    message.pipe_address
                ),
            );
            return;
        }

        let start = self
            .cursors
            .next_start(&message.pipe_address, candidates.len());

        for index in failover_order(start, candidates.len()) {
            let target = &candidates[index];
            let Some(dispatched) = self.store.transition(
                message_id,
                MessageState::Dispatched,
                |current| current.state == MessageState::Pending,
                |current| {
                    current.attempt_count += 1;
                    current.target_session_id = Some(target.clone());
                    current.last_attempt_at = Some(Instant::now());
                },
            ) else {
                debug!(
                    component = COMPONENT,
                    message_id = %message_id,
                    "message left pending before it could be dispatched"
                );
                return;
            };

            let attempt = dispatched.message.attempt_count;
            let envelope = Frame::MessageEnvelope {
                message_id: message_id.clone(),
                pipe_address: dispatched.message.pipe_address.clone(),
                body: dispatched.message.body.clone(),
                attempt_count: attempt,
            };

            match self.registry.deliver(target, message_id, envelope) {
                Ok(()) => {
                    debug!(
                        event = events::DISPATCH_SEND_OK,
                        component = COMPONENT,
                        message_id = %message_id,
                        session_id = %target,
                        attempt,
                        "queued message for consumer"
                    );
                    self.arm_retry_timer(message_id, attempt, target);
                    return;
                }
                Err(err) => {
                    warn!(
                        event = events::DISPATCH_SEND_FAILED,
                        component = COMPONENT,
                        message_id = %message_id,
                        session_id = %target,
                        attempt,
                        err = %err,
                        "consumer refused message, trying next candidate"
                    );
                    // the send never happened, so the attempt is handed back
                    self.store.transition(
                        message_id,
                        MessageState::Pending,
                        |current| {
                            current.attempt_count == attempt
                                && current.target_session_id.as_ref() == Some(target)
                        },
                        |current| {
                            current.attempt_count -= 1;
                            current.target_session_id = None;
                        },
                    );
                }
            }
        }

        self.tracker
            .fail(message_id, "every consumer session refused the message");
    }

    fn arm_retry_timer(
        self: &Arc<Self>,
        message_id: &MessageId,
        attempt: u32,
        target: &SessionId,
    ) {
        let router = Arc::clone(self);
        let fired_id = message_id.clone();
        let fired_target = target.clone();
        let timer = RetryTimer::schedule(
            message_id.clone(),
            attempt,
            self.retry_timeout,
            async move { router.on_retry_timeout(&fired_id, attempt, &fired_target) },
        );
        self.tracker.arm(message_id, timer);
    }

    fn on_retry_timeout(
        self: &Arc<Self>,
        message_id: &MessageId,
        attempt: u32,
        target: &SessionId,
    ) {
        if let TimeoutOutcome::Requeue(_) = self.tracker.on_timeout(message_id, attempt, target) {
            self.dispatch(message_id, None);
        }
    }

    pub(crate) fn ack(&self, consumer: &SessionId, message_id: &MessageId) -> bool {
        self.tracker.ack(consumer, message_id).is_some()
    }

    /// Requeues what a departed consumer still held and redispatches it to the
    /// remaining consumers on the address. A message fails only when no other
    /// consumer is left.
    pub(crate) fn handle_session_closed(
        self: &Arc<Self>,
        session_id: &SessionId,
        in_flight: Vec<MessageId>,
    ) {
        if in_flight.is_empty() {
            return;
        }
        for message_id in self.tracker.requeue_for_closed_session(session_id, in_flight) {
            self.dispatch(&message_id, Some(session_id));
        }
    }

    /// Fails everything still in flight on `session_id`.
    pub(crate) fn fail_session_messages(&self, session_id: &SessionId, reason: &str) -> usize {
        self.registry
            .in_flight(session_id)
            .iter()
            .filter(|message_id| self.tracker.fail(message_id, reason).is_some())
            .count()
    }

    /// Fails every message that is not terminal yet, whether or not a session
    /// holds it.
    pub(crate) fn fail_unfinished(&self, reason: &str) -> usize {
        self.store
            .in_flight_ids()
            .iter()
            .filter(|message_id| self.tracker.fail(message_id, reason).is_some())
            .count()
    }

    pub(crate) fn sweep_retention(&self, window: Duration) -> usize {
        self.store.evict_expired(window)
    }
}

#[cfg(test)]
mod tests {
    use super::DispatchRouter;
    use crate::config::ServerConfiguration;
    use crate::control_plane::session_registry::SessionRegistry;
    use crate::delivery::message_store::MessageStore;
    use crate::error::PipeError;
    use crate::frame::Frame;
    use crate::message::{MessageId, MessageState};
    use crate::session::{ClientSession, Role, SessionId};
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        router: Arc<DispatchRouter>,
        registry: Arc<SessionRegistry>,
        store: Arc<MessageStore>,
    }

    fn harness(configure: impl FnOnce(&mut ServerConfiguration)) -> Harness {
        let mut config = ServerConfiguration::new(9000);
        configure(&mut config);
        let registry = Arc::new(SessionRegistry::new());
        let store = Arc::new(MessageStore::new());
        let router = Arc::new(DispatchRouter::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            &config,
        ));
        Harness {
            router,
            registry,
            store,
        }
    }

    fn join(h: &Harness, id: &str, role: Role, capacity: usize) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(capacity);
        h.registry
            .register(
                ClientSession::new(SessionId::from(id), role, "orders"),
                tx,
                CancellationToken::new(),
            )
            .unwrap();
        rx
    }

    fn submit(h: &Harness, id: &str) -> Result<MessageId, PipeError> {
        h.router.submit(
            &SessionId::from("producer"),
            "orders",
            Bytes::from_static(b"body"),
            MessageId::from(id),
        )
    }

    fn envelope_id(frame: Frame) -> MessageId {
        match frame {
            Frame::MessageEnvelope { message_id, .. } => message_id,
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn submissions_alternate_between_consumers() {
        let h = harness(|_| {});
        let _producer = join(&h, "producer", Role::Producer, 8);
        let mut a = join(&h, "consumer-a", Role::Consumer, 8);
        let mut b = join(&h, "consumer-b", Role::Consumer, 8);

        for id in ["m1", "m2", "m3"] {
            submit(&h, id).unwrap();
        }

        assert_eq!(envelope_id(a.try_recv().unwrap()), MessageId::from("m1"));
        assert_eq!(envelope_id(b.try_recv().unwrap()), MessageId::from("m2"));
        assert_eq!(envelope_id(a.try_recv().unwrap()), MessageId::from("m3"));
    }

    #[tokio::test]
    async fn submission_without_consumer_is_rejected() {
        let h = harness(|_| {});
        let _producer = join(&h, "producer", Role::Producer, 8);

        assert!(matches!(
            submit(&h, "m1"),
            Err(PipeError::UnknownAddress { .. })
        ));
        assert_eq!(h.store.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn full_consumer_queue_fails_over_without_consuming_an_attempt() {
        let h = harness(|_| {});
        let _producer = join(&h, "producer", Role::Producer, 8);
        let mut a = join(&h, "consumer-a", Role::Consumer, 1);
        let mut b = join(&h, "consumer-b", Role::Consumer, 8);

        submit(&h, "m1").unwrap();
        submit(&h, "m2").unwrap();
        // cursor points at consumer-a again, whose queue is full
        submit(&h, "m3").unwrap();

        assert_eq!(envelope_id(a.try_recv().unwrap()), MessageId::from("m1"));
        assert!(a.try_recv().is_err());
        assert_eq!(envelope_id(b.try_recv().unwrap()), MessageId::from("m2"));
        assert_eq!(envelope_id(b.try_recv().unwrap()), MessageId::from("m3"));

        let m3 = h.store.get(&MessageId::from("m3")).unwrap();
        assert_eq!(m3.attempt_count, 1);
        assert_eq!(m3.target_session_id, Some(SessionId::from("consumer-b")));
    }

    #[tokio::test]
    async fn duplicate_id_is_kept_when_deduplicating() {
        let h = harness(|_| {});
        let _producer = join(&h, "producer", Role::Producer, 8);
        let mut a = join(&h, "consumer-a", Role::Consumer, 8);

        assert_eq!(submit(&h, "m1").unwrap(), MessageId::from("m1"));
        assert_eq!(submit(&h, "m1").unwrap(), MessageId::from("m1"));

        envelope_id(a.try_recv().unwrap());
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected_without_deduplication() {
        let h = harness(|config| config.retention.deduplicate = false);
        let _producer = join(&h, "producer", Role::Producer, 8);
        let _a = join(&h, "consumer-a", Role::Consumer, 8);

        submit(&h, "m1").unwrap();
        assert!(matches!(
            submit(&h, "m1"),
            Err(PipeError::DuplicateMessage { .. })
        ));
    }

    #[tokio::test]
    async fn closed_consumer_messages_move_to_the_remaining_consumer() {
        let h = harness(|_| {});
        let _producer = join(&h, "producer", Role::Producer, 8);
        let _a = join(&h, "consumer-a", Role::Consumer, 8);
        let mut b = join(&h, "consumer-b", Role::Consumer, 8);

        submit(&h, "m1").unwrap();
        let a_id = SessionId::from("consumer-a");
        let (_, in_flight) = h.registry.unregister(&a_id).unwrap();
        h.router.handle_session_closed(&a_id, in_flight);

        assert_eq!(envelope_id(b.try_recv().unwrap()), MessageId::from("m1"));
        let m1 = h.store.get(&MessageId::from("m1")).unwrap();
        assert_eq!(m1.attempt_count, 1);
        assert_eq!(m1.state, MessageState::Dispatched);
    }

    #[tokio::test]
    async fn closed_consumer_on_last_attempt_still_requeues_to_an_alternate() {
        let h = harness(|config| config.retry.max_attempts = 1);
        let mut producer = join(&h, "producer", Role::Producer, 8);
        let _a = join(&h, "consumer-a", Role::Consumer, 8);
        let mut b = join(&h, "consumer-b", Role::Consumer, 8);

        submit(&h, "m1").unwrap();
        let a_id = SessionId::from("consumer-a");
        let (_, in_flight) = h.registry.unregister(&a_id).unwrap();
        h.router.handle_session_closed(&a_id, in_flight);

        assert_eq!(envelope_id(b.try_recv().unwrap()), MessageId::from("m1"));
        let m1 = h.store.get(&MessageId::from("m1")).unwrap();
        assert_eq!(m1.state, MessageState::Dispatched);
        assert_eq!(m1.target_session_id, Some(SessionId::from("consumer-b")));
        assert!(matches!(
            producer.try_recv().unwrap(),
            Frame::SubmitAccepted { .. }
        ));
        assert!(producer.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_sole_consumer_fails_the_message() {
        let h = harness(|_| {});
        let mut producer = join(&h, "producer", Role::Producer, 8);
        let _a = join(&h, "consumer-a", Role::Consumer, 8);

        submit(&h, "m1").unwrap();
        let a_id = SessionId::from("consumer-a");
        let (_, in_flight) = h.registry.unregister(&a_id).unwrap();
        h.router.handle_session_closed(&a_id, in_flight);

        assert_eq!(
            h.store.state(&MessageId::from("m1")),
            Some(MessageState::Failed)
        );
        producer.try_recv().unwrap();
        assert!(matches!(
            producer.try_recv().unwrap(),
            Frame::DeliveryFailed { .. }
        ));
    }

    #[tokio::test]
    async fn shutdown_failure_reaches_the_producer() {
        let h = harness(|_| {});
        let mut producer = join(&h, "producer", Role::Producer, 8);
        let _a = join(&h, "consumer-a", Role::Consumer, 8);

        submit(&h, "m1").unwrap();
        assert_eq!(
            h.router
                .fail_session_messages(&SessionId::from("consumer-a"), "server shutting down"),
            1
        );

        assert!(matches!(
            producer.try_recv().unwrap(),
            Frame::SubmitAccepted { .. }
        ));
        match producer.try_recv().unwrap() {
            Frame::DeliveryFailed { reason, .. } => assert_eq!(reason, "server shutting down"),
            other => panic!("unexpected frame {other:?}"),
        }
        assert_eq!(h.registry.pending_total(), 0);
    }
}
