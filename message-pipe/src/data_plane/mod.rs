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

//! Data-plane layer: the TCP transport adapter.
//!
//! One accept loop hands every connection to its own session worker. A worker
//! owns the read half of its stream and a writer task owns the write half; the
//! rest of the crate reaches a session only through its outbound queue in the
//! session registry.

pub(crate) mod accept_loop;
pub mod frame_codec;
pub(crate) mod session_worker;
