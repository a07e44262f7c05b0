//! WHAIS session and wire layer: framed protocol over TCP, per-session
//! operand stacks, stack commands and server configuration.

pub mod commands;
pub mod config;
pub mod connection;
pub mod errors;
pub mod frame;
pub mod server;

pub use config::{ConfigError, DatabaseConfig, ServerConfig};
pub use errors::ConnectionError;
pub use frame::{Command, Frame, FrameCipher, PlainCipher, Status};
pub use server::{Server, ServerState};
