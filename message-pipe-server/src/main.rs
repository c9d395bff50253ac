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

use anyhow::{Context, Result};
use clap::Parser;
use message_pipe::{MessagePipeServer, ServerConfiguration, ShutdownOutcome};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MESSAGE_PIPE_SERVER_MAIN_TAG: &str = "message-pipe-server:";

#[derive(Debug, Parser)]
#[command(version, about = "Relay messages between producer and consumer sessions")]
struct Args {
    /// JSON5 configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Overrides the configured listen port
    #[arg(short, long)]
    port: Option<i64>,
    /// Overrides the configured bind address
    #[arg(long)]
    bind_address: Option<String>,
    /// Name used in log lines
    #[arg(long, default_value = "message-pipe")]
    name: String,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_configuration(args: &Args) -> Result<ServerConfiguration> {
    let mut config = match &args.config {
        Some(path) => ServerConfiguration::load(path)
            .with_context(|| format!("unable to load configuration from {}", path.display()))?,
        None => {
            let port = args
                .port
                .context("either --config or --port must be given")?;
            ServerConfiguration::new(port)
        }
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind_address) = &args.bind_address {
        config.bind_address = bind_address.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = load_configuration(&args)?;

    let server = MessagePipeServer::new(&args.name, config);
    let address = server.start().await.context("server failed to start")?;
    info!("{MESSAGE_PIPE_SERVER_MAIN_TAG} listening on {address}");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("unable to listen for ctrl-c")?;
            info!("{MESSAGE_PIPE_SERVER_MAIN_TAG} ctrl-c received, shutting down");
        }
        _ = server.wait_stopped() => {}
    }

    match server.shutdown().await {
        ShutdownOutcome::TimedOut {
            elapsed,
            forced_sessions,
        } => warn!(
            "{MESSAGE_PIPE_SERVER_MAIN_TAG} drain timed out after {elapsed:?}, force-closed {forced_sessions} sessions"
        ),
        outcome => info!("{MESSAGE_PIPE_SERVER_MAIN_TAG} stopped: {outcome:?}"),
    }
    Ok(())
}
