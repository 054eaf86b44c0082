#![forbid(unsafe_code)]

//! `mcp-mux` multiplexes JSON-RPC subprocess workers speaking the Model
//! Context Protocol over their standard I/O.
//!
//! The two building blocks are [`Connection`] (one spawned child: handshake,
//! MCP verbs, lifecycle) and [`Manager`] (registry of server specifications
//! and live connections, fan-out, health). An HTTP adapter sits in front of
//! the [`Manager`]; nothing in this crate knows about HTTP.

use std::time::Duration;

mod config;
mod connection;
mod defaults;
mod error;
mod manager;
mod server_name;
mod spec;

pub use config::LogSettings;
pub use connection::{Connection, ConnectionStatus};
pub use error::{Error, Result};
pub use manager::{
    ConnectOutcome, HealthReport, HealthStatus, Manager, ServerHealth, ServerStatus,
};
pub use server_name::{ServerName, ServerNameError};
pub use spec::{ServerSpec, SpecOverrides};

/// MCP protocol version sent during `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Client identity reported to every child during the handshake.
pub const CLIENT_NAME: &str = "mcp-railway-service";
pub const CLIENT_VERSION: &str = "1.0.0";

/// Deadline applied to every request, measured from enqueue.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between SIGTERM and SIGKILL during teardown.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);
