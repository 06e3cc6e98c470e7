//! Home Assistant command channel exposed as MCP tools.
//!
//! The heart of the crate is a single authenticated WebSocket [`Connection`]
//! multiplexing correlated service calls. [`CommandExecutor`] runs one call,
//! [`BulkAggregator`] runs many with per-command accounting, and
//! [`HomeAssistantClient`] ties them to the REST API for the tool layer in
//! [`service`].

pub mod bulk;
pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod frame;
pub mod service;

pub use bulk::{BulkAggregator, BulkResult, EXECUTION_FAILED};
pub use client::{HomeAssistantClient, Registry};
pub use command::{Command, CommandExecutor, CommandResult, RemoteError, Target};
pub use config::HomeAssistantConfig;
pub use connection::{Connection, ConnectionState, ConnectionStatus};
pub use correlator::Correlator;
pub use error::ClientError;
pub use service::HomeAssistantService;
