use std::{net::SocketAddr, path::PathBuf};

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a store server that replicas connect to over TCP.
    Serve(ServeArgs),
    /// Set one element, wait until it is persisted, then exit.
    Set(SetArgs),
    /// Load a set and print its members with their timestamps.
    List(SetTarget),
    /// Keep a replica running and report the member count as it changes.
    Watch(WatchArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the store server should bind to. Use 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:6380")]
    pub listen: SocketAddr,

    /// Journal file that keeps the sets across restarts. Without it the
    /// store lives in memory only.
    #[arg(long)]
    pub data: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct SetTarget {
    /// Address of the store server.
    #[arg(long, default_value = "127.0.0.1:6380")]
    pub server: SocketAddr,

    /// Set key, also the replication channel name.
    #[arg(long)]
    pub key: String,
}

#[derive(Args, Debug, Clone)]
pub struct SetArgs {
    #[command(flatten)]
    pub target: SetTarget,

    /// Element to set.
    pub element: String,

    /// RFC 3339 timestamp for the write. Defaults to now.
    #[arg(long)]
    pub at: Option<DateTime<Utc>>,
}

#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    #[command(flatten)]
    pub target: SetTarget,

    /// How often to check the member count, in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub interval_ms: u64,
}
