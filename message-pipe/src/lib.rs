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

//! # message-pipe
//!
//! `message-pipe` is a message relay server. Producers and consumers open
//! long-lived TCP sessions bound to a logical pipe address; the server hands
//! every submitted message to one consumer on that address, waits for the
//! consumer's ack and retries on timeout.
//!
//! ```no_run
//! use message_pipe::{MessagePipeServer, ServerConfiguration, ShutdownOutcome};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let config = ServerConfiguration::from_json5_str(
//!     "{ port: 5200, retry: { max_attempts: 5, timeout_ms: 2000 } }",
//! )
//! .unwrap();
//! let server = MessagePipeServer::new("quick-start", config);
//! let address = server.start().await.unwrap();
//! println!("listening on {address}");
//!
//! match server.shutdown().await {
//!     ShutdownOutcome::Drained { elapsed } => println!("drained in {elapsed:?}"),
//!     other => println!("stopped: {other:?}"),
//! }
//! # });
//! ```
//!
//! ## Delivery contract
//!
//! - A message is dispatched to exactly one open consumer at a time, chosen
//!   round-robin per pipe address.
//! - A message ends `Acked` or `Failed`, never both. An ack racing its retry
//!   timer is decided by whichever moves the message out of `Dispatched` first.
//! - The producer is told about every failure with a `DeliveryFailed` frame.
//!
//! ## Internal architecture map
//!
//! - Control plane: session registry and lifecycle state cell
//! - Routing: round-robin consumer selection and the dispatch path
//! - Delivery: message store and the ack/retry tracker
//! - Data plane: accept loop, per-session workers and the frame codec
//! - Runtime: background tasks and retry timers
//!
//! ## Observability model
//!
//! The crate uses `tracing` for logs/events, each tagged with an `event` field
//! from [`observability::events`]. Library code never installs a global
//! subscriber; binaries and tests initialize `tracing_subscriber` themselves.

mod config;
pub use config::{
    DrainConfig, RetentionConfig, RetryConfig, ServerConfiguration, SessionConfig,
};

mod control_plane;
pub use control_plane::lifecycle::ServerLifecycleState;

mod data_plane;
pub use data_plane::frame_codec::{FrameCodec, MAX_FRAME_LENGTH};

mod delivery;

mod error;
pub use error::{PipeError, Result};

mod frame;
pub use frame::{Frame, MessageResponse};

mod message;
pub use message::{Message, MessageId, MessageState};

#[doc(hidden)]
pub mod observability;
mod routing;
mod runtime;

mod server;
pub use server::{MessagePipeServer, ShutdownOutcome, SHUTDOWN_FAILURE_REASON};

mod session;
pub use session::{ClientSession, ConnectionState, Role, SessionId};
