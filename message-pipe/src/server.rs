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

use crate::config::ServerConfiguration;
use crate::control_plane::lifecycle::{LifecycleCell, ServerLifecycleState};
use crate::control_plane::session_registry::SessionRegistry;
use crate::data_plane::accept_loop::run_accept_loop;
use crate::data_plane::session_worker::SessionContext;
use crate::delivery::message_store::MessageStore;
use crate::error::{PipeError, Result};
use crate::observability::{events, fields};
use crate::routing::dispatch::DispatchRouter;
use crate::runtime::worker_runtime::BackgroundTask;
use crate::session::{ClientSession, SessionId};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const MESSAGE_PIPE_SERVER_TAG: &str = "MessagePipeServer:";
const MESSAGE_PIPE_SERVER_FN_START_TAG: &str = "start():";
const MESSAGE_PIPE_SERVER_FN_SHUTDOWN_TAG: &str = "shutdown():";

/// Extra time given to session workers beyond their own close grace before
/// they are aborted.
const SESSION_EXIT_MARGIN: Duration = Duration::from_millis(100);

/// Reason reported to producers whose messages are cut off by shutdown.
pub const SHUTDOWN_FAILURE_REASON: &str = "server shutting down";

/// How a call to [`MessagePipeServer::shutdown`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight message was acked or failed before the drain deadline.
    Drained { elapsed: Duration },
    /// The drain deadline passed; messages still in flight were failed and
    /// `forced_sessions` sessions holding them were closed.
    TimedOut {
        elapsed: Duration,
        forced_sessions: usize,
    },
    /// Shutdown before `start`; the server went straight to `Stopped`.
    NeverStarted,
    /// Another caller was already stopping the server; this call waited for it.
    Coalesced,
    AlreadyStopped,
}

struct ServerWorkers {
    accept: BackgroundTask,
    sweeper: BackgroundTask,
    sessions: TaskTracker,
    session_stop: CancellationToken,
    session_abort: CancellationToken,
}

/// TCP message relay between producer and consumer sessions.
///
/// `start` and `shutdown` may be called from different tasks; the lifecycle
/// only moves forward and each transition is taken by exactly one caller.
pub struct MessagePipeServer {
    name: String,
    config: ServerConfiguration,
    lifecycle: LifecycleCell,
    registry: Arc<SessionRegistry>,
    store: Arc<MessageStore>,
    router: Arc<DispatchRouter>,
    workers: Mutex<Option<ServerWorkers>>,
    local_addr: OnceLock<SocketAddr>,
}

impl MessagePipeServer {
    pub fn new(name: &str, config: ServerConfiguration) -> Self {
        let name = format!("{MESSAGE_PIPE_SERVER_TAG}:{name}:");
        debug!("{name}: creating with {config:?}");

        let registry = Arc::new(SessionRegistry::new());
        let store = Arc::new(MessageStore::new());
        let router = Arc::new(DispatchRouter::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            &config,
        ));

        Self {
            name,
            config,
            lifecycle: LifecycleCell::new(),
            registry,
            store,
            router,
            workers: Mutex::new(None),
            local_addr: OnceLock::new(),
        }
    }

    /// Validates the configuration, binds the listener and starts accepting.
    ///
    /// Only valid from `New`. A configuration or bind failure leaves the server
    /// `Stopped`. Returns the address the listener is bound to.
    pub async fn start(&self) -> Result<SocketAddr> {
        if let Err(actual) = self
            .lifecycle
            .advance(ServerLifecycleState::New, ServerLifecycleState::Starting)
        {
            return Err(PipeError::InvalidState {
                expected: ServerLifecycleState::New,
                actual,
            });
        }

        let address = match self
            .config
            .validate()
            .and_then(|_| self.config.socket_addr())
        {
            Ok(address) => address,
            Err(err) => return Err(self.abort_start(err)),
        };

        let listener = match TcpListener::bind(address).await {
            Ok(listener) => listener,
            Err(source) => return Err(self.abort_start(PipeError::Bind { address, source })),
        };
        let local_addr = match listener.local_addr() {
            Ok(local_addr) => local_addr,
            Err(err) => return Err(self.abort_start(err.into())),
        };

        let sessions = TaskTracker::new();
        let session_stop = CancellationToken::new();
        let session_abort = CancellationToken::new();
        let ctx = SessionContext {
            registry: Arc::clone(&self.registry),
            router: Arc::clone(&self.router),
            queue_size: self.config.session.queue_size,
            close_grace: self.config.session_close_grace(),
            stop: session_stop.clone(),
            abort: session_abort.clone(),
        };
        let accept = {
            let sessions = sessions.clone();
            BackgroundTask::spawn("accept_loop", move |stop| {
                run_accept_loop(listener, ctx, sessions, stop)
            })
        };
        let sweeper = {
            let router = Arc::clone(&self.router);
            let window = self.config.retention_window();
            BackgroundTask::spawn_periodic(
                "retention_sweeper",
                self.config.retention_sweep_interval(),
                move || {
                    router.sweep_retention(window);
                },
            )
        };

        *self.workers.lock().await = Some(ServerWorkers {
            accept,
            sweeper,
            sessions,
            session_stop,
            session_abort,
        });
        let _ = self.local_addr.set(local_addr);

        if let Err(actual) = self
            .lifecycle
            .advance(ServerLifecycleState::Starting, ServerLifecycleState::Running)
        {
            return Err(PipeError::InvalidState {
                expected: ServerLifecycleState::Starting,
                actual,
            });
        }

        info!(
            event = events::LIFECYCLE_STARTED,
            address = %local_addr,
            "{}:{MESSAGE_PIPE_SERVER_FN_START_TAG} bind port {}, startup successfully",
            self.name,
            local_addr.port()
        );
        Ok(local_addr)
    }

    fn abort_start(&self, err: PipeError) -> PipeError {
        self.lifecycle.advance_to(ServerLifecycleState::Stopped);
        error!(
            event = events::LIFECYCLE_START_FAILED,
            err = %err,
            "{}:{MESSAGE_PIPE_SERVER_FN_START_TAG} startup failed",
            self.name
        );
        err
    }

    /// Stops accepting, drains in-flight deliveries up to the configured
    /// deadline, then closes every session.
    ///
    /// Safe to call concurrently and repeatedly: one caller performs the drain,
    /// the others wait for it and get [`ShutdownOutcome::Coalesced`].
    pub async fn shutdown(&self) -> ShutdownOutcome {
        loop {
            match self.lifecycle.current() {
                ServerLifecycleState::New => {
                    if self
                        .lifecycle
                        .advance(ServerLifecycleState::New, ServerLifecycleState::Stopped)
                        .is_ok()
                    {
                        info!(
                            event = events::LIFECYCLE_STOPPED,
                            "{}:{MESSAGE_PIPE_SERVER_FN_SHUTDOWN_TAG} stopped before start",
                            self.name
                        );
                        return ShutdownOutcome::NeverStarted;
                    }
                }
                ServerLifecycleState::Starting => {
                    self.lifecycle.reached(ServerLifecycleState::Running).await;
                }
                ServerLifecycleState::Running => {
                    if self
                        .lifecycle
                        .advance(ServerLifecycleState::Running, ServerLifecycleState::Stopping)
                        .is_ok()
                    {
                        return self.drain().await;
                    }
                }
                ServerLifecycleState::Stopping => {
                    self.lifecycle.reached(ServerLifecycleState::Stopped).await;
                    return ShutdownOutcome::Coalesced;
                }
                ServerLifecycleState::Stopped => return ShutdownOutcome::AlreadyStopped,
            }
        }
    }

    async fn drain(&self) -> ShutdownOutcome {
        let started = Instant::now();
        let workers = self.workers.lock().await.take();
        let Some(ServerWorkers {
            accept,
            sweeper,
            sessions,
            session_stop,
            session_abort,
        }) = workers
        else {
            self.lifecycle.advance_to(ServerLifecycleState::Stopped);
            return ShutdownOutcome::Drained {
                elapsed: started.elapsed(),
            };
        };

        accept.stop().await;

        let poll_interval = self.config.drain_poll_interval();
        // validate() caps max_wait at one day
        let deadline = started + self.config.drain_max_wait();
        let timed_out = loop {
            // registered before the count is read so a release in between is not lost
            let released = self.registry.idle_notified();
            let pending = self.registry.pending_total();
            // a timed-out message sits in no session between release and redispatch
            if pending == 0 && self.store.in_flight_count() == 0 {
                break false;
            }
            let now = Instant::now();
            if now >= deadline {
                break true;
            }
            let busy_sessions = self
                .registry
                .pending_counts()
                .iter()
                .filter(|(_, count)| *count > 0)
                .count();
            info!(
                event = events::DRAIN_TICK,
                pending,
                busy_sessions,
                elapsed_ms = fields::format_elapsed_ms(started.elapsed()),
                "{}:{MESSAGE_PIPE_SERVER_FN_SHUTDOWN_TAG} waiting for in-flight messages",
                self.name
            );
            let _ = tokio::time::timeout(poll_interval.min(deadline - now), released).await;
        };

        let forced_sessions = if timed_out {
            self.fail_in_flight()
        } else {
            0
        };

        let closing = self.registry.close_all();
        session_stop.cancel();
        sessions.close();
        let grace = self.config.session_close_grace() + SESSION_EXIT_MARGIN;
        if tokio::time::timeout(grace, sessions.wait()).await.is_err() {
            warn!(
                event = events::SESSION_ABORTED,
                running = sessions.len(),
                "{}:{MESSAGE_PIPE_SERVER_FN_SHUTDOWN_TAG} session workers still running after close grace, aborting",
                self.name
            );
            session_abort.cancel();
            sessions.wait().await;
            self.discard_aborted_sessions();
        }
        sweeper.stop().await;
        self.lifecycle.advance_to(ServerLifecycleState::Stopped);

        let elapsed = started.elapsed();
        if timed_out {
            warn!(
                event = events::DRAIN_TIMEOUT,
                elapsed_ms = fields::format_elapsed_ms(elapsed),
                forced_sessions,
                closing,
                "{}:{MESSAGE_PIPE_SERVER_FN_SHUTDOWN_TAG} drain deadline passed",
                self.name
            );
            ShutdownOutcome::TimedOut {
                elapsed,
                forced_sessions,
            }
        } else {
            info!(
                event = events::DRAIN_COMPLETE,
                elapsed_ms = fields::format_elapsed_ms(elapsed),
                closing,
                "{}:{MESSAGE_PIPE_SERVER_FN_SHUTDOWN_TAG} drained",
                self.name
            );
            ShutdownOutcome::Drained { elapsed }
        }
    }

    /// Fails whatever is still in flight and returns how many sessions held some.
    fn fail_in_flight(&self) -> usize {
        let mut forced_sessions = 0;
        for session_id in self.registry.session_ids() {
            let failed = self
                .router
                .fail_session_messages(&session_id, SHUTDOWN_FAILURE_REASON);
            if failed > 0 {
                forced_sessions += 1;
                warn!(
                    event = events::SESSION_FORCE_CLOSED,
                    session_id = %session_id,
                    failed,
                    "{}:{MESSAGE_PIPE_SERVER_FN_SHUTDOWN_TAG} closing session with unacked messages",
                    self.name
                );
            }
        }
        // messages waiting for their next attempt belong to no session
        let between_attempts = self.router.fail_unfinished(SHUTDOWN_FAILURE_REASON);
        if between_attempts > 0 {
            warn!(
                failed = between_attempts,
                "{}:{MESSAGE_PIPE_SERVER_FN_SHUTDOWN_TAG} failed messages between delivery attempts",
                self.name
            );
        }
        forced_sessions
    }

    /// Aborted workers never unregister themselves.
    fn discard_aborted_sessions(&self) {
        for session_id in self.registry.session_ids() {
            self.router
                .fail_session_messages(&session_id, SHUTDOWN_FAILURE_REASON);
            self.registry.unregister(&session_id);
        }
    }

    pub fn state(&self) -> ServerLifecycleState {
        self.lifecycle.current()
    }

    /// Resolves once the server is `Stopped`, whoever stopped it.
    pub async fn wait_stopped(&self) {
        self.lifecycle.reached(ServerLifecycleState::Stopped).await;
    }

    /// Bound address once `start` succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn config(&self) -> &ServerConfiguration {
        &self.config
    }

    /// Snapshot of a registered session.
    pub fn session(&self, session_id: &SessionId) -> Option<ClientSession> {
        self.registry.get(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Messages not yet acked or failed.
    pub fn in_flight_count(&self) -> usize {
        self.store.in_flight_count()
    }
}

impl std::fmt::Debug for MessagePipeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePipeServer")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{MessagePipeServer, ShutdownOutcome};
    use crate::config::ServerConfiguration;
    use crate::control_plane::lifecycle::ServerLifecycleState;
    use crate::error::PipeError;
    use crate::message::{Message, MessageId, MessageState};
    use crate::session::SessionId;
    use bytes::Bytes;

    fn local_config() -> ServerConfiguration {
        let mut config = ServerConfiguration::new(1);
        config.bind_address = "127.0.0.1".to_string();
        config
    }

    #[tokio::test]
    async fn shutdown_before_start_never_starts() {
        let server = MessagePipeServer::new("unit", local_config());
        assert_eq!(server.shutdown().await, ShutdownOutcome::NeverStarted);
        assert_eq!(server.state(), ServerLifecycleState::Stopped);
        assert!(matches!(
            server.start().await,
            Err(PipeError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_configuration_stops_the_server() {
        let mut config = local_config();
        config.port = 0;
        let server = MessagePipeServer::new("unit", config);

        assert!(matches!(
            server.start().await,
            Err(PipeError::InvalidConfiguration { .. })
        ));
        assert_eq!(server.state(), ServerLifecycleState::Stopped);
        assert_eq!(server.shutdown().await, ShutdownOutcome::AlreadyStopped);
    }

    #[tokio::test]
    async fn drain_waits_for_a_message_between_attempts() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut config = local_config();
        config.port = i64::from(port);
        config.drain.poll_interval_ms = 20;
        config.drain.max_wait_ms = 300;
        let server = MessagePipeServer::new("unit", config);
        server.start().await.unwrap();

        // requeued after a timeout and not yet handed to a session
        let id = MessageId::from("between-attempts");
        server
            .store
            .insert(Message::new(
                id.clone(),
                "orders",
                Bytes::from_static(b"body"),
                SessionId::from("producer"),
            ))
            .unwrap();

        let outcome = server.shutdown().await;
        assert!(
            matches!(
                outcome,
                ShutdownOutcome::TimedOut {
                    forced_sessions: 0,
                    ..
                }
            ),
            "{outcome:?}"
        );
        assert_eq!(server.store.state(&id), Some(MessageState::Failed));
        assert_eq!(server.in_flight_count(), 0);
    }
}
