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

//! Helpers for driving a live `message-pipe` server over loopback TCP.

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use message_pipe::{
    Frame, FrameCodec, MessageId, MessagePipeServer, MessageResponse, Role, ServerConfiguration,
    SessionId,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const PIPE_TEST_CLIENT_TAG: &str = "PipeTestClient:";

/// How long helpers wait for a frame that is expected to arrive.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Installs a test-friendly subscriber once per process; later calls are no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Reserves a loopback port by binding and releasing it.
pub fn free_port() -> Result<i64> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(i64::from(listener.local_addr()?.port()))
}

/// Loopback configuration with timings short enough for tests.
pub fn test_config(port: i64) -> ServerConfiguration {
    let mut config = ServerConfiguration::new(port);
    config.bind_address = "127.0.0.1".to_string();
    config.retry.timeout_ms = 200;
    config.drain.poll_interval_ms = 20;
    config.drain.max_wait_ms = 1000;
    config.session.close_grace_ms = 200;
    config.retention.window_ms = 5000;
    config
}

/// Starts a server on a free loopback port, letting `configure` adjust the
/// test configuration first.
pub async fn start_server(
    name: &str,
    configure: impl FnOnce(&mut ServerConfiguration),
) -> Result<(MessagePipeServer, SocketAddr)> {
    init_logging();
    let mut config = test_config(free_port()?);
    configure(&mut config);
    let server = MessagePipeServer::new(name, config);
    let address = server.start().await?;
    Ok((server, address))
}

pub struct PipeTestClient {
    framed: Framed<TcpStream, FrameCodec>,
    session_id: SessionId,
    pipe_address: String,
}

impl PipeTestClient {
    pub async fn connect(address: SocketAddr, role: Role, pipe_address: &str) -> Result<Self> {
        Self::connect_with_id(address, role, pipe_address, None).await
    }

    pub async fn connect_with_id(
        address: SocketAddr,
        role: Role,
        pipe_address: &str,
        session_id: Option<&str>,
    ) -> Result<Self> {
        let handshake = Frame::Handshake {
            role: role.to_string(),
            pipe_address: pipe_address.to_string(),
            session_id: session_id.map(SessionId::from),
        };
        let (framed, reply) = Self::handshake_raw(address, handshake).await?;
        match reply {
            Frame::HandshakeAck { session_id } => {
                debug!("{PIPE_TEST_CLIENT_TAG} connected as {role} {session_id}");
                Ok(Self {
                    framed,
                    session_id,
                    pipe_address: pipe_address.to_string(),
                })
            }
            other => bail!("handshake refused: {other:?}"),
        }
    }

    /// Sends `handshake` on a fresh connection and returns the first reply.
    pub async fn handshake_raw(
        address: SocketAddr,
        handshake: Frame,
    ) -> Result<(Framed<TcpStream, FrameCodec>, Frame)> {
        let stream = TcpStream::connect(address)
            .await
            .with_context(|| format!("unable to connect to {address}"))?;
        let mut framed = Framed::new(stream, FrameCodec::new());
        framed.send(handshake).await?;
        let reply = tokio::time::timeout(RECV_TIMEOUT, framed.next())
            .await
            .context("no handshake reply")?
            .ok_or_else(|| anyhow!("connection closed during handshake"))??;
        Ok((framed, reply))
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub async fn send(&mut self, frame: Frame) -> Result<()> {
        self.framed.send(frame).await?;
        Ok(())
    }

    /// Next frame, or `None` if nothing arrives within `wait`.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Result<Option<Frame>> {
        match tokio::time::timeout(wait, self.framed.next()).await {
            Err(_) => Ok(None),
            Ok(None) => bail!("connection closed"),
            Ok(Some(frame)) => Ok(Some(frame?)),
        }
    }

    pub async fn recv(&mut self) -> Result<Frame> {
        self.recv_timeout(RECV_TIMEOUT)
            .await?
            .ok_or_else(|| anyhow!("no frame within {RECV_TIMEOUT:?}"))
    }

    /// Submits a message to this client's pipe address and returns the reply.
    pub async fn submit(&mut self, message_id: &str, body: &'static [u8]) -> Result<Frame> {
        self.send(Frame::MessageEnvelope {
            message_id: MessageId::from(message_id),
            pipe_address: self.pipe_address.clone(),
            body: Bytes::from_static(body),
            attempt_count: 0,
        })
        .await?;
        self.recv().await
    }

    /// Waits for the next delivery and returns its id and attempt number.
    pub async fn expect_envelope(&mut self) -> Result<(MessageId, u32)> {
        match self.recv().await? {
            Frame::MessageEnvelope {
                message_id,
                attempt_count,
                ..
            } => Ok((message_id, attempt_count)),
            other => bail!("expected message envelope, got {other:?}"),
        }
    }

    pub async fn ack(&mut self, message_id: &MessageId) -> Result<()> {
        self.send(Frame::Ack {
            message_id: message_id.clone(),
        })
        .await
    }

    /// Round-trips a ping and returns the decoded response body.
    pub async fn ping(&mut self, body: &str) -> Result<String> {
        self.send(Frame::Ping {
            body: body.to_string(),
        })
        .await?;
        match self.recv().await? {
            Frame::Pong { response } => Ok(MessageResponse::decode(response)?.body().to_string()),
            other => bail!("expected pong, got {other:?}"),
        }
    }

    /// True once the server has closed the connection.
    pub async fn closed_within(&mut self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.framed.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }
}
