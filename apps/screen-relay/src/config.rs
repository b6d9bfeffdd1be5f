use std::{fmt, net::SocketAddr, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::connection::Backpressure;

const DEFAULT_OUTBOX_DEPTH: usize = 64;
const DEFAULT_POINTER_OUTBOX_DEPTH: usize = 8;

#[derive(Debug, Parser)]
#[command(
    name = "screen-relay",
    author,
    version,
    about = "Pairs screen hosts with viewers and relays their traffic"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "SCREEN_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:3001")]
    pub listen_addr: String,

    /// Seconds without traffic or heartbeat before a main-channel slot is reclaimed.
    #[arg(long, env = "SCREEN_RELAY_SESSION_TIMEOUT_SECS", default_value_t = 30)]
    pub session_timeout_secs: u64,

    /// How often the main channel's liveness sweep runs.
    #[arg(long, env = "SCREEN_RELAY_SWEEP_INTERVAL_SECS", default_value_t = 5)]
    pub sweep_interval_secs: u64,

    /// Outbound events buffered per main-channel connection.
    #[arg(long, env = "SCREEN_RELAY_OUTBOX_DEPTH", default_value_t = DEFAULT_OUTBOX_DEPTH)]
    pub outbox_depth: usize,

    /// Liveness threshold for the pointer side channel, in milliseconds.
    #[arg(long, env = "SCREEN_RELAY_POINTER_TIMEOUT_MS", default_value_t = 5_000)]
    pub pointer_timeout_ms: u64,

    /// Sweep cadence for the pointer side channel, in milliseconds.
    #[arg(long, env = "SCREEN_RELAY_POINTER_SWEEP_INTERVAL_MS", default_value_t = 1_000)]
    pub pointer_sweep_interval_ms: u64,

    /// Outbound events retained per pointer connection; older ones are discarded.
    #[arg(
        long,
        env = "SCREEN_RELAY_POINTER_OUTBOX_DEPTH",
        default_value_t = DEFAULT_POINTER_OUTBOX_DEPTH
    )]
    pub pointer_outbox_depth: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "SCREEN_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub main: ChannelProfile,
    pub pointer: ChannelProfile,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        let main = ChannelProfile {
            idle_timeout: Duration::from_secs(cli.session_timeout_secs),
            sweep_interval: Duration::from_secs(cli.sweep_interval_secs),
            outbox_depth: cli.outbox_depth,
            ..ChannelProfile::main()
        };
        let pointer = ChannelProfile {
            idle_timeout: Duration::from_millis(cli.pointer_timeout_ms),
            sweep_interval: Duration::from_millis(cli.pointer_sweep_interval_ms),
            outbox_depth: cli.pointer_outbox_depth,
            ..ChannelProfile::pointer()
        };
        main.validate().context("invalid main channel settings")?;
        pointer
            .validate()
            .context("invalid pointer channel settings")?;

        Ok(ServerConfig {
            listen_addr,
            main,
            pointer,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

/// The two independent pairing universes served by one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Main,
    Pointer,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Main => "main",
            ChannelKind::Pointer => "pointer",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ChannelProfile {
    pub kind: ChannelKind,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub outbox_depth: usize,
    pub backpressure: Backpressure,
}

impl ChannelProfile {
    pub fn main() -> Self {
        Self {
            kind: ChannelKind::Main,
            idle_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            outbox_depth: DEFAULT_OUTBOX_DEPTH,
            backpressure: Backpressure::DropNewest,
        }
    }

    pub fn pointer() -> Self {
        Self {
            kind: ChannelKind::Pointer,
            idle_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            outbox_depth: DEFAULT_POINTER_OUTBOX_DEPTH,
            backpressure: Backpressure::DropOldest,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.idle_timeout.is_zero() {
            bail!("liveness timeout must be greater than zero");
        }
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must be greater than zero");
        }
        if self.outbox_depth == 0 {
            bail!("outbox depth must be greater than zero");
        }
        Ok(())
    }
}
