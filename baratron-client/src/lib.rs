mod config;
pub use config::*;
mod error;
pub use error::*;
mod connection;
pub use connection::*;
mod dispatcher;
pub use dispatcher::*;
mod client;
pub use client::*;
/// ToolWeb device simulator for tests and load runs.
pub mod sim;

pub use baratron_core::protocol::{Command, Operation};
pub use baratron_core::{Field, LedColor, PressureUnit, Snapshot, SystemStatus, Value};
pub use tokio_util::sync::CancellationToken;
