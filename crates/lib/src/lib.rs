//! Backhaul core library: wire protocol, relay gateway, and the client that exposes a
//! private HTTP server through it. Used by the `backhaul` CLI.

pub mod client;
pub mod config;
pub mod gateway;
pub mod init;
pub mod protocol;
pub mod routing;
