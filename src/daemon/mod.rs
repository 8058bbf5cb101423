//! applauncherd daemon
//!
//! - `config`: launcher rc file and per-type runtime profiles
//! - `mode`: boot/normal mode state machine
//! - `protocol`: message framing shared by invoker, boosters and daemon
//! - `booster_pool`: one slot per booster type, crash-loop backoff
//! - `server`: the control loop (spawn, reap, relay, restart)
//! - `client`: invoker side of the booster sockets

pub mod booster_pool;
pub mod client;
pub mod config;
pub mod mode;
pub mod protocol;
pub mod server;

pub use booster_pool::BoosterPool;
pub use client::{InvocationOutcome, InvokerClient, InvokerCommand, InvokerOptions};
pub use config::LauncherConfig;
pub use mode::DaemonMode;
pub use protocol::{
    decode_message, encode_message, read_message, write_message, InvocationRequest, Message,
};
pub use server::{Daemon, DaemonOptions};
