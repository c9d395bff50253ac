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

//! Runtime integration layer.
//!
//! Every background task the server needs (accept loop, retention sweeper,
//! retry timers) is spawned through here and owned by whoever spawned it. There
//! is no process-wide executor: the server starts its tasks during `Starting`
//! and joins them during `Stopping`.

pub(crate) mod retry_timer;
pub(crate) mod worker_runtime;
