//! miio-client command-line tool: entry point.
//!
//! Talks to one miio device on the LAN: performs the handshake, sends a
//! single method call, or keeps a session alive and logs its state.
//!
//! # Usage
//!
//! ```text
//! miio-client [OPTIONS] <COMMAND>
//!
//! Commands:
//!   hello                   Handshake and print the device serial and clock offset
//!   call <METHOD> [PARAMS]  Call METHOD with PARAMS given as a JSON literal
//!   watch                   Keep the session alive and log state changes until Ctrl+C
//!
//! Options:
//!   --config <FILE>       TOML config file [default: miio-client.toml]
//!   --ip <IP>             Device IP address
//!   --port <PORT>         Device UDP port
//!   --local-port <PORT>   Local UDP port (0 picks any free port)
//!   --token <HEX>         Device token, raw or wrapped hex
//!   --handshake-timeout <SECS>  Seconds to wait for the hello [default: 5]
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable           | Description              |
//! |--------------------|--------------------------|
//! | `MIIO_CONFIG`      | Config file path         |
//! | `MIIO_IP`          | Device IP address        |
//! | `MIIO_PORT`        | Device UDP port          |
//! | `MIIO_LOCAL_PORT`  | Local UDP port           |
//! | `MIIO_TOKEN`       | Device token             |
//!
//! CLI args take precedence over environment variables, which take
//! precedence over the config file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use miio_client::infrastructure::config::{load_config, FileConfig};
use miio_client::MiioClient;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Command-line client for miio smart-home devices.
#[derive(Debug, Parser)]
#[command(
    name = "miio-client",
    about = "Handshake with and send commands to a miio device over UDP",
    version
)]
struct Cli {
    /// TOML config file.  A missing file is treated as empty.
    #[arg(long, default_value = "miio-client.toml", env = "MIIO_CONFIG")]
    config: PathBuf,

    /// Device IP address.
    #[arg(long, env = "MIIO_IP")]
    ip: Option<String>,

    /// Device UDP port.
    #[arg(long, env = "MIIO_PORT")]
    port: Option<u16>,

    /// Local UDP port to bind.
    #[arg(long, env = "MIIO_LOCAL_PORT")]
    local_port: Option<u16>,

    /// Device token as hex (32 characters, or the 96-character wrapped form).
    #[arg(long, env = "MIIO_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Seconds to wait for the device to answer the handshake.
    #[arg(long, default_value_t = 5)]
    handshake_timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Handshake and print the device serial and clock offset.
    Hello,
    /// Call a method and print the reply.
    Call {
        /// Method name, e.g. `get_prop`.
        method: String,
        /// Params as a JSON literal, e.g. `'["power"]'`.
        params: Option<String>,
    },
    /// Keep the session alive and log state changes until Ctrl+C.
    Watch,
}

impl Cli {
    /// Applies command-line overrides on top of the file config.
    fn apply_overrides(&self, config: &mut FileConfig) {
        if let Some(ip) = &self.ip {
            config.device.ip = Some(ip.clone());
        }
        if let Some(port) = self.port {
            config.device.port = port;
        }
        if let Some(local_port) = self.local_port {
            config.client.local_port = local_port;
        }
        if let Some(token) = &self.token {
            config.device.token = Some(token.clone());
        }
    }
}

/// Waits for the first hello, giving up after `secs` seconds.
async fn await_handshake(client: &MiioClient, secs: u64) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(secs), client.wait_connected())
        .await
        .with_context(|| format!("device did not answer the handshake within {secs}s"))?
        .context("session ended during the handshake")?;
    Ok(())
}

/// Parses the optional params argument; absent params are sent as `null`.
fn parse_params(params: Option<&str>) -> anyhow::Result<Value> {
    match params {
        None => Ok(Value::Null),
        Some(text) => serde_json::from_str(text)
            .with_context(|| format!("params are not valid JSON: '{text}'")),
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut file_config = load_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    cli.apply_overrides(&mut file_config);

    // ── Logging setup ─────────────────────────────────────────────────────────
    //
    // `RUST_LOG` wins; otherwise the configured level applies.
    let log_level = file_config.client.log_level.clone();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    let config = file_config
        .into_session_config()
        .context("invalid configuration")?;
    let client = MiioClient::connect(config)
        .await
        .context("failed to open UDP socket")?;

    match cli.command {
        Command::Hello => {
            await_handshake(&client, cli.handshake_timeout).await?;
            let session = client.session();
            println!("serial:       {:#010x}", session.serial);
            println!("clock offset: {}s", session.clock_offset);
        }
        Command::Call { method, params } => {
            let params = parse_params(params.as_deref())?;
            await_handshake(&client, cli.handshake_timeout).await?;
            let reply = client
                .call(&method, params)
                .await
                .with_context(|| format!("call '{method}' failed"))?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        Command::Watch => {
            let mut changes = client.state_changes();
            loop {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = changes.borrow_and_update().clone();
                        info!("session state: {state:?}");
                        if state.is_terminal() {
                            warn!("session ended");
                            break;
                        }
                    }
                    signal = tokio::signal::ctrl_c() => {
                        if let Err(e) = signal {
                            warn!("failed to listen for Ctrl+C: {e}");
                        }
                        info!("received Ctrl+C, shutting down");
                        break;
                    }
                }
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
