// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! The gateway daemon.
//!
//! Wires the core to stand-in collaborators: a static user table and a PDU
//! engine that only answers ECHO requests. The surrounding suite replaces
//! both when the gateway is embedded.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::metadata::LevelFilter;
use tracing_subscriber::prelude::*;

use rpch_gate::auth::StaticAuth;
use rpch_gate::pdu::{ChannelGate, Pdu, PduDisposition, PduEngine, PduProcessor};
use rpch_gate::{GatewayBuilder, GatewayConfig};

#[derive(clap::Parser, Debug)]
enum Command {
    /// Runs the gateway.
    Serve {
        /// JSON configuration file; flags override it.
        #[clap(short = 'c', long)]
        config: Option<PathBuf>,
        #[clap(long)]
        listen: Option<SocketAddr>,
        /// Demo credentials, `user:password:maildir`. Repeatable.
        #[clap(long = "user")]
        users: Vec<String>,
    },
    /// Prints the effective configuration and exits.
    CheckConfig {
        #[clap(short = 'c', long)]
        config: Option<PathBuf>,
    },
}

type Error = Box<dyn std::error::Error + Send + Sync>;

/// Stand-in engine: no RTS codec, so tunnels terminate on their first PDU,
/// but ECHO requests round-trip.
struct EchoOnlyEngine;

impl PduEngine for EchoOnlyEngine {
    fn create_processor(&self, _host: &str, _port: u16) -> Option<Box<dyn PduProcessor>> {
        None
    }

    fn rts_input(&self, _gate: &mut dyn ChannelGate, _pdu: &[u8]) -> PduDisposition {
        tracing::debug!("no PDU engine wired, terminating tunnel");
        PduDisposition::Terminate
    }

    fn flow_control_ack(&self, _b: u32, _w: u32, _cookie: &str) -> Option<Pdu> {
        None
    }

    fn echo_body(&self) -> Vec<u8> {
        vec![0u8; 20]
    }
}

fn load_config(path: Option<PathBuf>) -> Result<GatewayConfig, Error> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&text)?)
        }
        None => Ok(GatewayConfig::default()),
    }
}

fn do_serve(
    config: Option<PathBuf>,
    listen: Option<SocketAddr>,
    users: Vec<String>,
) -> Result<(), Error> {
    let mut config = load_config(config)?;
    if let Some(listen) = listen {
        config.listen = listen;
    }

    let mut auth = StaticAuth::new();
    for spec in &users {
        let mut it = spec.splitn(3, ':');
        match (it.next(), it.next(), it.next()) {
            (Some(user), Some(pass), Some(maildir)) => {
                auth = auth.user(user, pass, maildir);
            }
            _ => return Err(format!("bad --user spec {spec:?}").into()),
        }
    }
    if users.is_empty() {
        tracing::warn!("no --user given; every login will fail");
    }

    let svc = GatewayBuilder::new(config)
        .engine(Arc::new(EchoOnlyEngine))
        .auth(Arc::new(auth))
        .build()?;
    let running = svc.run()?;
    running.join();
    Ok(())
}

fn do_check_config(config: Option<PathBuf>) -> Result<(), Error> {
    let config = load_config(config)?;
    println!("{config:#?}");
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::Layer::new().without_time())
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    match Command::parse() {
        Command::Serve {
            config,
            listen,
            users,
        } => do_serve(config, listen, users)?,
        Command::CheckConfig { config } => do_check_config(config)?,
    }
    Ok(())
}
