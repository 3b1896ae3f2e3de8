//! Execution gateway - a Model Context Protocol server for running commands
//! and managing files on a fleet of hosts
//!
//! Every configured host is served by a [`ServerHandler`] backend:
//!
//! - `local` runs commands as child processes of the gateway
//! - `ssh` keeps one authenticated session per host, stages commands as
//!   scripts over SFTP and multiplexes concurrent requests as channels
//! - `ssm` sends commands through AWS Systems Manager and polls for results
//!
//! Handlers are created on first use by the [`HandlerRegistry`] and keep a
//! per-host working directory for the life of the process.
//!
//! # MCP Tools
//!
//! - `execute_command` - run a command, optionally paging its output
//! - `execute_code` - run bash, PowerShell or Python source as a script
//! - `list_files` - paged, sorted directory listing
//! - `create_file`, `update_file`, `amend_file` - file management
//! - `read_file` - bounded reads, optionally of a line range
//! - `get_system_info` - OS, memory, uptime and interpreter facts
//! - `change_directory`, `present_working_directory` - working directory
//! - `list_servers` - the configured inventory
//!
//! # Example Usage (CLI)
//!
//! ```bash
//! exec-gateway --config=servers.json --default-host=web-1 --timeout=30000
//! ```
//!
//! # Example Usage (MCP Inspector)
//!
//! ```bash
//! npx @modelcontextprotocol/inspector ./target/release/exec-gateway -- \
//!   --config=servers.json
//! ```

pub mod config;
pub mod error;
pub mod files;
pub mod handler;
pub mod listing;
pub mod local;
pub mod retry;
pub mod server;
pub mod shell;
pub mod ssh;
pub mod ssm;
pub mod sysinfo;
pub mod tools;

// Re-exports for convenience
pub use config::{Args, Config, HandlerSettings, PollPolicy, Protocol, RetryPolicy, ServerConfig};
pub use error::{GatewayError, Result};
pub use files::{FileContent, ReadOptions};
pub use handler::{CommandResult, ExecOptions, HandlerRegistry, Operation, ServerHandler};
pub use listing::{FileEntry, FileListing, ListRequest, OrderBy};
pub use local::LocalHandler;
pub use server::GatewayServer;
pub use shell::Interpreter;
pub use ssh::SshHandler;
pub use ssm::{SsmApi, SsmHandler};
pub use sysinfo::SystemInfo;
