//! Control server daemon: accepts IPC clients on a local UNIX socket,
//! mirrors the printer's object model and routes codes to the firmware.
//!
//! The library surface exists so integration tests (and embedders) can run
//! the daemon in-process via [`server::run`].

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod endpoints;
pub mod files;
pub mod handshake;
pub mod machine;
pub mod plugins;
pub mod processors;
pub mod server;
pub mod sessions;

pub use config::Settings;
pub use server::{run, Daemon};
