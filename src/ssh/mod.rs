//! SSH backend module
//!
//! This module provides persistent SSH connection handling with automatic
//! reconnection, key authentication, SFTP file access and staged command
//! execution.

pub mod backend;
pub mod command;
pub mod config;
pub mod connection;
pub mod handler;
pub mod sftp;

// Re-exports
pub use backend::SshHandler;
pub use config::SshConfig;
pub use connection::{ConnectionState, SshConnectionManager};
pub use handler::ClientHandler;
