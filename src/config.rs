//! Configuration and CLI argument parsing for the execution gateway
//!
//! Process-level settings come from CLI flags (with `GATEWAY_*` environment
//! fallbacks). The list of reachable servers comes from a JSON inventory file:
//!
//! ```json
//! {
//!   "defaultHost": "localhost",
//!   "servers": [
//!     { "host": "localhost", "protocol": "local" },
//!     { "host": "web-1", "protocol": "ssh", "username": "deploy", "port": 2222 },
//!     { "host": "batch", "protocol": "ssm", "region": "eu-west-1", "instanceId": "i-0abc" }
//!   ]
//! }
//! ```

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Default timeout for command execution in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000; // 60 seconds

/// Default max characters for a command (None = unlimited)
pub const DEFAULT_MAX_CHARS: Option<usize> = Some(1000);

/// Connection timeout in seconds
pub const CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Retries after the first failed attempt of a transport operation
pub const DEFAULT_RETRIES: u32 = 3;

/// Fixed delay between transport retries in milliseconds
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;

/// Interval between SSM invocation polls in milliseconds
pub const DEFAULT_SSM_POLL_INTERVAL_MS: u64 = 2_000;

/// Number of SSM invocation polls before giving up
pub const DEFAULT_SSM_POLL_ATTEMPTS: u32 = 10;

/// Page size used by `list_files` when the caller gives none
pub const DEFAULT_LIST_LIMIT: usize = 42;

/// Byte budget of `read_file` when the caller gives none (1 MiB)
pub const DEFAULT_READ_MAX_BYTES: u64 = 1024 * 1024;

/// Host that always resolves to the local backend
pub const LOCALHOST: &str = "localhost";

/// Execution gateway CLI Arguments
#[derive(Parser, Debug, Clone)]
#[command(name = "exec-gateway")]
#[command(version)]
#[command(about = "Execute commands and manage files on local, SSH and SSM hosts via Model Context Protocol")]
pub struct Args {
    /// Path to the JSON server inventory
    #[arg(long, env = "GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Host used when a request does not name one
    #[arg(long, env = "GATEWAY_DEFAULT_HOST")]
    pub default_host: Option<String>,

    /// Command execution timeout in milliseconds
    #[arg(long, default_value = "60000", env = "GATEWAY_TIMEOUT")]
    pub timeout: u64,

    /// Maximum characters for command length.
    /// Use "none", "0", or negative value to disable limit.
    /// Default: 1000
    #[arg(long = "maxChars", env = "GATEWAY_MAX_CHARS")]
    pub max_chars: Option<String>,

    /// Transport retries after the first failed attempt
    #[arg(long, default_value = "3", env = "GATEWAY_RETRIES")]
    pub retries: u32,

    /// Delay between transport retries in milliseconds
    #[arg(long, default_value = "5000", env = "GATEWAY_RETRY_DELAY")]
    pub retry_delay: u64,

    /// Interval between SSM status polls in milliseconds
    #[arg(long, default_value = "2000", env = "GATEWAY_SSM_POLL_INTERVAL")]
    pub ssm_poll_interval: u64,

    /// Number of SSM status polls before the command is considered timed out
    #[arg(long, default_value = "10", env = "GATEWAY_SSM_POLL_ATTEMPTS")]
    pub ssm_poll_attempts: u32,
}

/// Transport protocol of a configured server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Local,
    Ssh,
    Ssm,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Local => "local",
            Protocol::Ssh => "ssh",
            Protocol::Ssm => "ssm",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shell dialect commands are written in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    Bash,
    Powershell,
}

/// Introspection script flavour used by `get_system_info`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfoScript {
    Bash,
    Powershell,
    Python,
}

/// One entry of the server inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Resolution key; also the network address for SSH
    pub host: String,

    #[serde(default = "default_protocol")]
    pub protocol: Protocol,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    /// SSH private key location (defaults to `~/.ssh/id_rsa`)
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub instance_id: Option<String>,

    #[serde(default)]
    pub shell: Option<ShellKind>,

    /// POSIX (true) or Windows (false) command dialect
    #[serde(default)]
    pub posix: Option<bool>,

    /// Writable folder for staged scripts; discovered when absent
    #[serde(default)]
    pub script_folder: Option<String>,

    #[serde(default)]
    pub system_info: Option<InfoScript>,

    /// Treat a missing file as empty when amending
    #[serde(default)]
    pub create_if_missing: bool,
}

fn default_protocol() -> Protocol {
    Protocol::Local
}

impl ServerConfig {
    /// Create a new server entry with minimal required fields
    pub fn new(host: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            host: host.into(),
            protocol,
            username: None,
            port: None,
            private_key_path: None,
            region: None,
            instance_id: None,
            shell: None,
            posix: None,
            script_folder: None,
            system_info: None,
            create_if_missing: false,
        }
    }

    /// Entry used for `localhost` when the inventory has none
    pub fn localhost() -> Self {
        Self::new(LOCALHOST, Protocol::Local)
    }

    /// Set the SSH username
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the private key path
    pub fn with_private_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_path = Some(path.into());
        self
    }

    /// Set the SSM target
    pub fn with_instance(mut self, region: impl Into<String>, instance_id: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Set the shell dialect
    pub fn with_shell(mut self, shell: ShellKind) -> Self {
        self.shell = Some(shell);
        self
    }

    /// Set the amend policy for missing files
    pub fn with_create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SSH_PORT)
    }

    /// Whether the target speaks the POSIX dialect.
    ///
    /// Remote targets default to POSIX; the local backend follows the host OS.
    pub fn is_posix(&self) -> bool {
        match self.posix {
            Some(posix) => posix,
            None if self.shell == Some(ShellKind::Powershell) => false,
            None if self.protocol == Protocol::Local => cfg!(unix),
            None => true,
        }
    }

    /// Shell used to run commands, derived from `shell` and `posix`
    pub fn effective_shell(&self) -> ShellKind {
        match self.shell {
            Some(shell) => shell,
            None if self.is_posix() => ShellKind::Bash,
            None => ShellKind::Powershell,
        }
    }

    /// Introspection script used by `get_system_info`
    pub fn info_script(&self) -> InfoScript {
        match self.system_info {
            Some(script) => script,
            None => match self.effective_shell() {
                ShellKind::Bash => InfoScript::Bash,
                ShellKind::Powershell => InfoScript::Powershell,
            },
        }
    }

    /// Private key location with `~` expanded
    pub fn private_key_path_or_default(&self) -> PathBuf {
        match &self.private_key_path {
            Some(path) => expand_home(path),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".ssh")
                .join("id_rsa"),
        }
    }

    /// Check that the protocol-specific required fields are present
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.host.trim().is_empty() {
            errors.push("Missing required host".to_string());
        }

        match self.protocol {
            Protocol::Local => {}
            Protocol::Ssh => {
                if self.username.as_deref().map_or(true, |u| u.trim().is_empty()) {
                    errors.push(format!("SSH server '{}' requires a username", self.host));
                }
            }
            Protocol::Ssm => {
                if self.instance_id.as_deref().map_or(true, |i| i.trim().is_empty()) {
                    errors.push(format!("SSM server '{}' requires an instanceId", self.host));
                }
                if self.region.as_deref().map_or(true, |r| r.trim().is_empty()) {
                    errors.push(format!("SSM server '{}' requires a region", self.host));
                }
            }
        }

        if !errors.is_empty() {
            return Err(GatewayError::Config(errors.join("\n")));
        }

        Ok(())
    }
}

/// Expand a leading `~` to the user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Server inventory file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    #[serde(default)]
    pub default_host: Option<String>,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl Inventory {
    /// Parse an inventory from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        let inventory: Inventory = serde_json::from_str(text)
            .map_err(|e| GatewayError::config(format!("Invalid server inventory: {}", e)))?;

        let mut seen = std::collections::HashSet::new();
        for server in &inventory.servers {
            if !seen.insert(server.host.as_str()) {
                return Err(GatewayError::config(format!(
                    "Duplicate host '{}' in server inventory",
                    server.host
                )));
            }
        }

        Ok(inventory)
    }

    /// Read an inventory file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!(
                "Cannot read server inventory {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&text)
    }
}

/// Retry policy for transport operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub retries: u32,
    /// Fixed wait between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

/// Polling budget for SSM invocations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    /// Total time a command may take before it is reported as timed out
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_SSM_POLL_INTERVAL_MS),
            max_attempts: DEFAULT_SSM_POLL_ATTEMPTS,
        }
    }
}

/// Settings shared by every handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerSettings {
    /// Timeout applied when a request gives none
    pub default_timeout: Duration,
    pub retry: RetryPolicy,
    pub poll: PollPolicy,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
        }
    }
}

/// Parsed and validated configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Configured servers
    pub servers: Vec<ServerConfig>,

    /// Host used when a request names none
    pub default_host: String,

    /// Maximum command length (None = unlimited)
    pub max_chars: Option<usize>,

    pub settings: HandlerSettings,
}

impl Config {
    /// Create Config from CLI Args
    pub fn from_args(args: Args) -> Result<Self> {
        validate_args(&args)?;

        let inventory = match args.config.as_deref() {
            Some(path) => Inventory::load(path)?,
            None => Inventory::default(),
        };

        let default_host = args
            .default_host
            .or(inventory.default_host)
            .unwrap_or_else(|| LOCALHOST.to_string());

        let config = Config {
            servers: inventory.servers,
            default_host,
            max_chars: parse_max_chars(args.max_chars.as_deref()),
            settings: HandlerSettings {
                default_timeout: Duration::from_millis(args.timeout),
                retry: RetryPolicy {
                    retries: args.retries,
                    delay: Duration::from_millis(args.retry_delay),
                },
                poll: PollPolicy {
                    interval: Duration::from_millis(args.ssm_poll_interval),
                    max_attempts: args.ssm_poll_attempts,
                },
            },
        };

        if config.default_host != LOCALHOST
            && !config.servers.iter().any(|s| s.host == config.default_host)
        {
            return Err(GatewayError::config(format!(
                "Default host '{}' is not in the server inventory",
                config.default_host
            )));
        }

        Ok(config)
    }
}

/// Validate CLI arguments
fn validate_args(args: &Args) -> Result<()> {
    let mut errors = Vec::new();

    if args.timeout == 0 {
        errors.push("--timeout must be greater than zero".to_string());
    }

    if args.ssm_poll_attempts == 0 {
        errors.push("--ssm-poll-attempts must be greater than zero".to_string());
    }

    if let Some(ref path) = args.config {
        if !path.exists() {
            errors.push(format!("Server inventory not found: {}", path.display()));
        }
    }

    if !errors.is_empty() {
        return Err(GatewayError::Config(format!(
            "Configuration error:\n{}",
            errors.join("\n")
        )));
    }

    Ok(())
}

/// Parse max_chars argument
///
/// - "none" (case-insensitive) → None (unlimited)
/// - "0" or negative → None (unlimited)
/// - positive integer → Some(value)
/// - None (not provided) → DEFAULT_MAX_CHARS
pub fn parse_max_chars(value: Option<&str>) -> Option<usize> {
    match value {
        None => DEFAULT_MAX_CHARS,
        Some(s) => {
            let lowered = s.to_lowercase();
            if lowered == "none" {
                return None;
            }

            match s.parse::<i64>() {
                Ok(n) if n <= 0 => None,
                Ok(n) => Some(n as usize),
                Err(_) => DEFAULT_MAX_CHARS,
            }
        }
    }
}
