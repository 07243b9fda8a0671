use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the voting API backed by an in-process store.
    Serve(ServeArgs),
    /// Fire a burst of concurrent votes at a running server.
    Simulate(SimulateArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, env = "LIVE_VOTE_LISTEN", default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,

    /// Compare-and-swap attempts per vote before reporting contention.
    #[arg(
        long,
        env = "LIVE_VOTE_MAX_ATTEMPTS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_attempts: u32,

    /// Base backoff between vote retries, in milliseconds. 0 retries immediately.
    #[arg(long, env = "LIVE_VOTE_BACKOFF_MS", default_value_t = 0)]
    pub backoff_ms: u64,

    /// Prefix prepended to every store key, e.g. "/votes/".
    #[arg(long, env = "LIVE_VOTE_KEY_ROOT", default_value = "")]
    pub key_root: String,

    /// Interval between keep-alive comments on idle result streams.
    #[arg(long, env = "LIVE_VOTE_KEEP_ALIVE_SECS", default_value_t = 15)]
    pub keep_alive_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Base URL of a running server.
    #[arg(long, default_value = "http://127.0.0.1:5000")]
    pub server: String,

    /// Session to vote in.
    #[arg(long)]
    pub session: String,

    /// Option to vote for.
    #[arg(long, default_value = "1")]
    pub option: String,

    /// Number of simultaneous voters.
    #[arg(long, default_value_t = 10)]
    pub voters: usize,
}
