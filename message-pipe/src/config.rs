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

//! Server configuration surface consumed by the lifecycle controller.
//!
//! Configuration is read from a JSON5 document. Everything except `port` has a
//! default, so the smallest valid file is:
//!
//! ```
//! use message_pipe::ServerConfiguration;
//!
//! let config = ServerConfiguration::from_json5_str("{ port: 5200 }").unwrap();
//! assert_eq!(config.port, 5200);
//! assert!(config.validate().is_ok());
//! ```

use crate::error::{PipeError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
const MIN_PORT: i64 = 1;
const MAX_PORT: i64 = 65535;
/// Upper bound for every `*_ms` setting, one day.
const MAX_DURATION_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfiguration {
    /// Listening port, 1..=65535. Kept wide so out-of-range input reaches `validate()`.
    pub port: i64,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub drain: DrainConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DrainConfig {
    pub poll_interval_ms: u64,
    pub max_wait_ms: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            max_wait_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Capacity of each session's outbound frame queue.
    pub queue_size: usize,
    pub close_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_size: 64,
            close_grace_ms: 250,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    /// How long Acked/Failed message ids stay known after reaching a terminal state.
    pub window_ms: u64,
    /// Answer a resubmitted known id with the original id instead of rejecting it.
    pub deduplicate: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            window_ms: 30_000,
            deduplicate: true,
        }
    }
}

fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.to_string()
}

impl ServerConfiguration {
    pub fn new(port: i64) -> Self {
        Self {
            port,
            bind_address: default_bind_address(),
            retry: RetryConfig::default(),
            drain: DrainConfig::default(),
            session: SessionConfig::default(),
            retention: RetentionConfig::default(),
        }
    }

    pub fn from_json5_str(document: &str) -> Result<Self> {
        json5::from_str(document).map_err(|err| {
            PipeError::invalid_configuration(format!("unable to parse configuration: {err}"))
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("loading configuration from {path:?}");
        let document = fs::read_to_string(path).map_err(|err| {
            PipeError::invalid_configuration(format!("unable to read {path:?}: {err}"))
        })?;
        Self::from_json5_str(&document)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port < MIN_PORT || self.port > MAX_PORT {
            return Err(PipeError::invalid_configuration(format!(
                "MessageServer port must be greater than 0 and less than 65536, got {}",
                self.port
            )));
        }
        if self.bind_address.parse::<IpAddr>().is_err() {
            return Err(PipeError::invalid_configuration(format!(
                "bind_address {:?} is not an IP address",
                self.bind_address
            )));
        }
        if self.retry.max_attempts < 1 {
            return Err(PipeError::invalid_configuration(
                "retry.max_attempts must be at least 1",
            ));
        }
        if self.retry.timeout_ms == 0 {
            return Err(PipeError::invalid_configuration(
                "retry.timeout_ms must be greater than 0",
            ));
        }
        if self.drain.poll_interval_ms == 0 {
            return Err(PipeError::invalid_configuration(
                "drain.poll_interval_ms must be greater than 0",
            ));
        }
        if self.session.queue_size == 0 {
            return Err(PipeError::invalid_configuration(
                "session.queue_size must be greater than 0",
            ));
        }
        for (name, value) in [
            ("retry.timeout_ms", self.retry.timeout_ms),
            ("drain.poll_interval_ms", self.drain.poll_interval_ms),
            ("drain.max_wait_ms", self.drain.max_wait_ms),
            ("session.close_grace_ms", self.session.close_grace_ms),
            ("retention.window_ms", self.retention.window_ms),
        ] {
            if value > MAX_DURATION_MS {
                return Err(PipeError::invalid_configuration(format!(
                    "{name} must be at most {MAX_DURATION_MS}, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Socket address to bind. Only meaningful after `validate()` succeeded.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.validate()?;
        let ip: IpAddr = self.bind_address.parse().map_err(|_| {
            PipeError::invalid_configuration(format!(
                "bind_address {:?} is not an IP address",
                self.bind_address
            ))
        })?;
        let port = u16::try_from(self.port)
            .map_err(|_| PipeError::invalid_configuration("port out of range"))?;
        Ok(SocketAddr::new(ip, port))
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry.timeout_ms)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain.poll_interval_ms)
    }

    pub fn drain_max_wait(&self) -> Duration {
        Duration::from_millis(self.drain.max_wait_ms)
    }

    pub fn session_close_grace(&self) -> Duration {
        Duration::from_millis(self.session.close_grace_ms)
    }

    pub fn retention_window(&self) -> Duration {
        Duration::from_millis(self.retention.window_ms)
    }

    /// Period of the retention sweeper, derived from the window.
    pub(crate) fn retention_sweep_interval(&self) -> Duration {
        (self.retention_window() / 2).clamp(Duration::from_millis(50), Duration::from_secs(5))
    }
}
