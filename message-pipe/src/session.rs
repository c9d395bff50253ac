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

//! Client session data model.

use crate::error::PipeError;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Instant;
use uuid::Uuid;

/// Identifier of one registered client stream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Producer,
    Consumer,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Producer => f.write_str("producer"),
            Role::Consumer => f.write_str("consumer"),
        }
    }
}

impl FromStr for Role {
    type Err = PipeError;

    fn from_str(role: &str) -> Result<Self, Self::Err> {
        match role.trim().to_ascii_lowercase().as_str() {
            "producer" => Ok(Role::Producer),
            "consumer" => Ok(Role::Consumer),
            _ => Err(PipeError::InvalidRole {
                role: role.to_string(),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One connected client, owned by the session registry.
#[derive(Clone, Debug)]
pub struct ClientSession {
    pub session_id: SessionId,
    pub role: Role,
    pub pipe_address: String,
    pub connection_state: ConnectionState,
    pub last_activity: Instant,
}

impl ClientSession {
    pub fn new(session_id: SessionId, role: Role, pipe_address: &str) -> Self {
        Self {
            session_id,
            role,
            pipe_address: pipe_address.to_string(),
            connection_state: ConnectionState::Connecting,
            last_activity: Instant::now(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.connection_state == ConnectionState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::{ClientSession, ConnectionState, Role, SessionId};
    use crate::error::PipeError;

    #[test]
    fn role_parsing_is_case_insensitive() {
        assert_eq!("Producer".parse::<Role>().unwrap(), Role::Producer);
        assert_eq!(" CONSUMER ".parse::<Role>().unwrap(), Role::Consumer);
    }

    #[test]
    fn unknown_role_is_rejected() {
        let err = "observer".parse::<Role>().unwrap_err();
        assert!(matches!(err, PipeError::InvalidRole { role } if role == "observer"));
    }

    #[test]
    fn new_session_starts_connecting() {
        let session = ClientSession::new(SessionId::from("s-1"), Role::Consumer, "orders");
        assert_eq!(session.connection_state, ConnectionState::Connecting);
        assert!(!session.is_open());
    }

    #[test]
    fn generated_session_ids_are_distinct() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }
}
