//! opskit-sshd: Minimal SSH server for exercising the transport
//!
//! Password-only, with a fixed command table. Intended for tests and local
//! experiments, never for production use.

pub mod commands;
pub mod config;
pub mod error;
mod handler;
pub mod server;

pub use config::ServerConfig;
pub use error::ServerError;
pub use server::{ServerState, TestServer};
