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

//! Per-address round-robin cursors.

use dashmap::DashMap;

/// One cursor per pipe address. A cursor only moves once per dispatch decision,
/// so failing over to the next candidate inside a decision does not skew the
/// rotation.
pub(crate) struct RoundRobinCursors {
    cursors: DashMap<String, usize>,
}

impl RoundRobinCursors {
    pub(crate) fn new() -> Self {
        Self {
            cursors: DashMap::new(),
        }
    }

    /// Returns the index to start from among `len` candidates and advances the
    /// cursor for `pipe_address`.
    pub(crate) fn next_start(&self, pipe_address: &str, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let mut cursor = self.cursors.entry(pipe_address.to_string()).or_insert(0);
        let start = *cursor % len;
        *cursor = cursor.wrapping_add(1);
        start
    }
}

/// Candidate indices in failover order for a decision starting at `start`.
pub(crate) fn failover_order(start: usize, len: usize) -> impl Iterator<Item = usize> {
    (0..len).map(move |offset| (start + offset) % len)
}
