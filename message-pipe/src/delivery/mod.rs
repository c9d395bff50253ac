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

//! Delivery layer.
//!
//! Holds in-flight messages and decides their state transitions. Every
//! transition goes through one compare-and-transition step on the message's own
//! store entry, which is what keeps a late timer from undoing an ack and an ack
//! from resurrecting a failed message.

pub(crate) mod ack_tracker;
pub(crate) mod message_store;
