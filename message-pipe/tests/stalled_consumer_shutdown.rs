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

// Kept in its own test binary: it counts the process's open sockets, which
// other tests running in parallel would disturb.

#![cfg(target_os = "linux")]

use bytes::Bytes;
use integration_test_utils::{start_server, PipeTestClient};
use message_pipe::{Frame, MessageId, Role, ShutdownOutcome};
use std::time::Duration;

const BODY_SIZE: usize = 256 * 1024;
const SUBMISSIONS: usize = 40;

fn open_sockets() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| {
                    std::fs::read_link(entry.path())
                        .map(|target| target.to_string_lossy().starts_with("socket:"))
                        .unwrap_or(false)
                })
                .count()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn shutdown_closes_the_socket_of_a_consumer_that_stopped_reading() {
    let (server, address) = start_server("stalled-consumer", |config| {
        config.retry.timeout_ms = 10_000;
        config.drain.max_wait_ms = 200;
        config.session.close_grace_ms = 100;
    })
    .await
    .unwrap();
    // never reads, so the server's writes to it back up
    let _consumer = PipeTestClient::connect(address, Role::Consumer, "orders").await.unwrap();
    let mut producer = PipeTestClient::connect(address, Role::Producer, "orders").await.unwrap();
    // listener, two client sockets and their two server-side peers
    let before = open_sockets();

    for index in 0..SUBMISSIONS {
        producer
            .send(Frame::MessageEnvelope {
                message_id: MessageId::from(format!("m{index}")),
                pipe_address: "orders".to_string(),
                body: Bytes::from(vec![b'x'; BODY_SIZE]),
                attempt_count: 0,
            })
            .await
            .unwrap();
        assert!(matches!(
            producer.recv().await.unwrap(),
            Frame::SubmitAccepted { .. }
        ));
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let outcome = tokio::time::timeout(Duration::from_secs(3), server.shutdown())
        .await
        .expect("shutdown finishes despite the stalled consumer");
    assert!(
        matches!(outcome, ShutdownOutcome::TimedOut { forced_sessions: 1, .. }),
        "{outcome:?}"
    );
    assert_eq!(server.session_count(), 0);

    // only the two client sockets are left
    assert_eq!(open_sockets(), before - 3);
}
