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

//! Listener loop that turns accepted connections into session workers.

use crate::data_plane::session_worker::{run_session, SessionContext};
use crate::observability::events;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

const COMPONENT: &str = "accept_loop";

/// Pause after a failed accept, e.g. when the process is out of descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Accepts until `stop` fires. The listener is dropped on return, so the port
/// refuses new connections from then on.
pub(crate) async fn run_accept_loop(
    listener: TcpListener,
    ctx: SessionContext,
    sessions: TaskTracker,
    stop: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(component = COMPONENT, %peer, err = %err, "unable to set TCP_NODELAY");
                }
                debug!(component = COMPONENT, %peer, "accepted connection");
                let abort = ctx.abort.clone();
                let session = run_session(stream, peer, ctx.clone());
                sessions.spawn(async move {
                    tokio::select! {
                        _ = session => {}
                        _ = abort.cancelled() => {
                            warn!(
                                event = events::SESSION_ABORTED,
                                component = COMPONENT,
                                %peer,
                                "session worker aborted"
                            );
                        }
                    }
                });
            }
            Err(err) => {
                warn!(
                    event = events::SESSION_IO_ERROR,
                    component = COMPONENT,
                    err = %err,
                    "accept failed"
                );
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                }
            }
        }
    }
    debug!(component = COMPONENT, "accept loop stopped");
}
