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

//! Control-plane layer.
//!
//! Owns who is connected (the session registry) and what phase the server is in
//! (the lifecycle state cell). Registration is rejected up front for duplicate
//! session ids so the data plane never has to reconcile two streams claiming
//! the same identity.
//!
//! ```no_run
//! use message_pipe::{MessagePipeServer, ServerConfiguration, ServerLifecycleState};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let server = MessagePipeServer::new("control-plane-doc", ServerConfiguration::new(5200));
//! assert_eq!(server.state(), ServerLifecycleState::New);
//!
//! server.start().await.unwrap();
//! assert_eq!(server.state(), ServerLifecycleState::Running);
//!
//! server.shutdown().await;
//! assert_eq!(server.state(), ServerLifecycleState::Stopped);
//! # });
//! ```

pub(crate) mod lifecycle;
pub(crate) mod session_registry;
