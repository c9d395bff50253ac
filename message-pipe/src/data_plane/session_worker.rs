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

//! Per-connection worker: handshake, inbound frame handling and the writer task.

use crate::control_plane::session_registry::SessionRegistry;
use crate::data_plane::frame_codec::FrameCodec;
use crate::error::Result;
use crate::frame::{Frame, MessageResponse};
use crate::observability::events;
use crate::routing::dispatch::DispatchRouter;
use crate::session::{ClientSession, Role, SessionId};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COMPONENT: &str = "session_worker";

/// Shared handles every session worker needs.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) router: Arc<DispatchRouter>,
    pub(crate) queue_size: usize,
    /// How long a closing session may spend flushing its outbound queue.
    pub(crate) close_grace: Duration,
    /// Parent of every session's close token.
    pub(crate) stop: CancellationToken,
    /// Drops session workers that outlived the close grace.
    pub(crate) abort: CancellationToken,
}

type FrameSink<T> = SplitSink<Framed<T, FrameCodec>, Frame>;
type FrameStream<T> = SplitStream<Framed<T, FrameCodec>>;

pub(crate) async fn run_session<T>(io: T, peer: SocketAddr, ctx: SessionContext)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut framed = Framed::new(io, FrameCodec::new());
    let close = ctx.stop.child_token();

    let first = tokio::select! {
        _ = close.cancelled() => return,
        first = framed.next() => first,
    };

    let (role, pipe_address, requested_id) = match first {
        Some(Ok(Frame::Handshake {
            role,
            pipe_address,
            session_id,
        })) => (role, pipe_address, session_id),
        Some(Ok(other)) => {
            reject(
                &mut framed,
                peer,
                format!("expected handshake, got {}", other.kind()),
            )
            .await;
            return;
        }
        Some(Err(err)) => {
            warn!(
                event = events::SESSION_IO_ERROR,
                component = COMPONENT,
                %peer,
                err = %err,
                "unable to read handshake"
            );
            return;
        }
        None => return,
    };

    let role = match role.parse::<Role>() {
        Ok(role) => role,
        Err(err) => {
            reject(&mut framed, peer, err.to_string()).await;
            return;
        }
    };
    if pipe_address.trim().is_empty() {
        reject(&mut framed, peer, "pipe address must not be empty".to_string()).await;
        return;
    }

    let session_id = requested_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(SessionId::generate);
    let (outbound_tx, outbound_rx) = mpsc::channel(ctx.queue_size);
    let session = ClientSession::new(session_id.clone(), role, &pipe_address);

    if let Err(err) = ctx
        .registry
        .register(session, outbound_tx.clone(), close.clone())
    {
        reject(&mut framed, peer, err.to_string()).await;
        return;
    }

    let ack = Frame::HandshakeAck {
        session_id: session_id.clone(),
    };
    if let Err(err) = framed.send(ack).await {
        warn!(
            event = events::SESSION_IO_ERROR,
            component = COMPONENT,
            %peer,
            session_id = %session_id,
            err = %err,
            "unable to acknowledge handshake"
        );
        finish(&ctx, &session_id, &close);
        return;
    }

    let (sink, stream) = framed.split();
    // reader and writer share this task, so dropping it releases the socket
    let reading = async {
        read_loop(stream, &ctx, &session_id, role, &pipe_address, outbound_tx, &close).await;
        finish(&ctx, &session_id, &close);
    };
    let writing = write_loop(sink, outbound_rx, &close, &session_id, ctx.close_grace);
    tokio::join!(reading, writing);
}

async fn reject<T>(framed: &mut Framed<T, FrameCodec>, peer: SocketAddr, reason: String)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    info!(
        event = events::SESSION_REJECTED,
        component = COMPONENT,
        %peer,
        reason = %reason,
        "rejecting handshake"
    );
    if let Err(err) = framed.send(Frame::HandshakeRejected { reason }).await {
        debug!(component = COMPONENT, %peer, err = %err, "unable to send handshake rejection");
    }
}

async fn read_loop<T>(
    mut stream: FrameStream<T>,
    ctx: &SessionContext,
    session_id: &SessionId,
    role: Role,
    pipe_address: &str,
    responses: mpsc::Sender<Frame>,
    close: &CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let next = tokio::select! {
            _ = close.cancelled() => break,
            next = stream.next() => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                warn!(
                    event = events::SESSION_IO_ERROR,
                    component = COMPONENT,
                    session_id = %session_id,
                    err = %err,
                    "session stream failed"
                );
                break;
            }
            None => break,
        };

        ctx.registry.touch(session_id);
        let Some(reply) = handle_frame(ctx, session_id, role, pipe_address, frame) else {
            continue;
        };
        tokio::select! {
            _ = close.cancelled() => break,
            sent = responses.send(reply) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

/// Applies one inbound frame and returns the direct reply, if any.
fn handle_frame(
    ctx: &SessionContext,
    session_id: &SessionId,
    role: Role,
    pipe_address: &str,
    frame: Frame,
) -> Option<Frame> {
    match (role, frame) {
        (
            Role::Producer,
            Frame::MessageEnvelope {
                message_id,
                pipe_address: target,
                body,
                ..
            },
        ) => {
            let target = if target.is_empty() {
                pipe_address
            } else {
                target.as_str()
            };
            // the router queues the receipt itself on success
            match ctx
                .router
                .submit(session_id, target, body, message_id.clone())
            {
                Ok(_) => None,
                Err(err) => Some(Frame::SubmitRejected {
                    message_id,
                    reason: err.to_string(),
                }),
            }
        }
        (Role::Consumer, Frame::MessageEnvelope { message_id, .. }) => {
            Some(Frame::SubmitRejected {
                message_id,
                reason: "consumer sessions cannot submit messages".to_string(),
            })
        }
        (Role::Consumer, Frame::Ack { message_id }) => {
            ctx.router.ack(session_id, &message_id);
            None
        }
        (_, Frame::Ping { body }) => Some(Frame::Pong {
            response: MessageResponse::new(body).encode(),
        }),
        (role, other) => {
            debug!(
                component = COMPONENT,
                session_id = %session_id,
                %role,
                frame = other.kind(),
                "ignoring frame not valid for session role"
            );
            None
        }
    }
}

/// Writes queued frames until the session closes, then flushes what is left
/// for at most `close_grace`. A peer that stops reading cannot hold the writer
/// past that deadline.
async fn write_loop<T>(
    mut sink: FrameSink<T>,
    mut outbound: mpsc::Receiver<Frame>,
    close: &CancellationToken,
    session_id: &SessionId,
    close_grace: Duration,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let deadline = loop {
        // once closed, what is still queued goes through the bounded flush below
        let frame = tokio::select! {
            biased;
            _ = close.cancelled() => break close_deadline(close_grace),
            frame = outbound.recv() => frame,
        };
        let Some(frame) = frame else {
            break close_deadline(close_grace);
        };

        let send = sink.send(frame);
        tokio::pin!(send);
        let sent = tokio::select! {
            biased;
            sent = &mut send => sent,
            _ = close.cancelled() => {
                let deadline = close_deadline(close_grace);
                match tokio::time::timeout_at(deadline, &mut send).await {
                    Ok(Ok(())) => break deadline,
                    Ok(Err(err)) => Err(err),
                    Err(_) => {
                        warn!(
                            event = events::SESSION_WRITE_STALLED,
                            component = COMPONENT,
                            session_id = %session_id,
                            "peer stopped reading, dropping the connection"
                        );
                        return;
                    }
                }
            }
        };
        if let Err(err) = sent {
            warn!(
                event = events::SESSION_IO_ERROR,
                component = COMPONENT,
                session_id = %session_id,
                err = %err,
                "unable to write frame"
            );
            close.cancel();
            return;
        }
    };

    // flush what was queued before the close
    let flushed =
        tokio::time::timeout_at(deadline, flush_and_close(&mut sink, &mut outbound)).await;
    match flushed {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            debug!(component = COMPONENT, session_id = %session_id, err = %err, "close failed");
        }
        Err(_) => warn!(
            event = events::SESSION_WRITE_STALLED,
            component = COMPONENT,
            session_id = %session_id,
            "close grace elapsed with frames still queued"
        ),
    }
}

async fn flush_and_close<T>(
    sink: &mut FrameSink<T>,
    outbound: &mut mpsc::Receiver<Frame>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    while let Ok(frame) = outbound.try_recv() {
        sink.send(frame).await?;
    }
    sink.close().await
}

fn close_deadline(close_grace: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(close_grace).unwrap_or(now)
}

/// Takes the session out of the registry and hands its unacked messages back
/// to the router.
fn finish(ctx: &SessionContext, session_id: &SessionId, close: &CancellationToken) {
    ctx.registry.mark_closing(session_id);
    close.cancel();
    if let Some((_, in_flight)) = ctx.registry.unregister(session_id) {
        ctx.router.handle_session_closed(session_id, in_flight);
    }
}
