//! The server handler contract shared by every backend
//!
//! A handler owns the connection state and the working directory for one
//! configured host. Callers get handlers from the [`HandlerRegistry`] and
//! never construct backends directly.

pub mod registry;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::config::Protocol;
use crate::error::Result;
use crate::files::{literal_pattern, FileContent, ReadOptions};
use crate::listing::{FileListing, ListRequest};
use crate::shell::Interpreter;
use crate::sysinfo::SystemInfo;

pub use registry::HandlerRegistry;

/// Operations a handler may or may not support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ExecuteCommand,
    ExecuteCode,
    ListFiles,
    CreateFile,
    UpdateFile,
    AmendFile,
    ReadFile,
    SystemInfo,
    ChangeDirectory,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ExecuteCommand => "execute_command",
            Operation::ExecuteCode => "execute_code",
            Operation::ListFiles => "list_files",
            Operation::CreateFile => "create_file",
            Operation::UpdateFile => "update_file",
            Operation::AmendFile => "amend_file",
            Operation::ReadFile => "read_file",
            Operation::SystemInfo => "get_system_info",
            Operation::ChangeDirectory => "change_directory",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call options of `execute_command` and `execute_code`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Overrides the handler's default timeout
    pub timeout: Option<Duration>,
    /// Working directory; the handler's current directory when absent
    pub directory: Option<String>,
    /// Split stdout into pages of this many lines
    pub lines_per_page: Option<usize>,
}

impl ExecOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn in_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn paged(mut self, lines_per_page: usize) -> Self {
        self.lines_per_page = Some(lines_per_page);
        self
    }
}

/// Output from a command execution
///
/// A non-zero exit code is a normal result, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    /// Standard output from the command
    pub stdout: String,

    /// Standard error from the command
    pub stderr: String,

    /// Exit code of the command (if available)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
}

impl CommandResult {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            ..Self::default()
        }
    }

    /// Check if the command succeeded (exit code 0 or no exit code available)
    pub fn success(&self) -> bool {
        self.exit_code.is_none_or(|code| code == 0)
    }

    /// Split stdout into pages of `lines_per_page` lines when requested
    pub fn paginated(mut self, lines_per_page: Option<usize>) -> Self {
        let Some(per_page) = lines_per_page else {
            return self;
        };
        let per_page = per_page.max(1);

        let pages: Vec<String> = if self.stdout.is_empty() {
            Vec::new()
        } else {
            let lines: Vec<&str> = self.stdout.split('\n').collect();
            lines.chunks(per_page).map(|chunk| chunk.join("\n")).collect()
        };

        self.total_pages = Some(pages.len());
        self.pages = Some(pages);
        self.response_id = Some(Uuid::new_v4().to_string());
        self
    }
}

/// Working directory owned by one handler instance
#[derive(Debug, Default)]
pub struct SessionState {
    current_dir: RwLock<Option<String>>,
}

impl SessionState {
    pub fn new(initial: Option<String>) -> Self {
        Self {
            current_dir: RwLock::new(initial),
        }
    }

    pub async fn current_dir(&self) -> Option<String> {
        self.current_dir.read().await.clone()
    }

    pub async fn set_current_dir(&self, dir: impl Into<String>) {
        *self.current_dir.write().await = Some(dir.into());
    }
}

/// Log a failed file operation and collapse the outcome to a flag
pub(crate) fn report(operation: Operation, target: &str, result: Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!("{} failed for {}: {}", operation, target, e);
            false
        }
    }
}

/// Command execution and file management on one configured host
#[async_trait]
pub trait ServerHandler: Send + Sync + std::fmt::Debug {
    /// Inventory key this handler serves
    fn host(&self) -> &str;

    fn protocol(&self) -> Protocol;

    /// Whether `operation` is fully supported by this backend
    fn supports(&self, _operation: Operation) -> bool {
        true
    }

    /// Run a command and capture its output.
    ///
    /// Errors only on infrastructure failure; the command's own exit status
    /// is reported in the result.
    async fn execute_command(&self, command: &str, options: ExecOptions) -> Result<CommandResult>;

    /// Stage `code` as a script file and run it with `language`'s
    /// interpreter. The script is removed afterwards where the backend
    /// stages files.
    async fn execute_code(&self, code: &str, language: Interpreter, options: ExecOptions)
        -> Result<CommandResult>;

    /// List regular files in a directory, sorted and paged
    async fn list_files(&self, request: ListRequest) -> Result<FileListing>;

    /// Write `content` to `directory/filename`, backing up an existing file
    /// first when `backup` is set
    async fn create_file(&self, directory: &str, filename: &str, content: &str, backup: bool)
        -> bool;

    /// Replace every match of the regular expression `pattern`
    async fn update_file(&self, file_path: &str, pattern: &str, replacement: &str, backup: bool)
        -> bool;

    /// Replace every occurrence of the literal text `needle`
    async fn update_file_literal(
        &self,
        file_path: &str,
        needle: &str,
        replacement: &str,
        backup: bool,
    ) -> bool {
        let (pattern, replacement) = literal_pattern(needle, replacement);
        self.update_file(file_path, &pattern, &replacement, backup)
            .await
    }

    /// Append `content` to a file
    async fn amend_file(&self, file_path: &str, content: &str) -> bool;

    /// Read a file, or a line range of it, up to `options.max_bytes`
    async fn read_file(&self, file_path: &str, options: ReadOptions) -> Result<FileContent>;

    /// Host facts; the default value when introspection fails
    async fn get_system_info(&self) -> SystemInfo;

    async fn current_directory(&self) -> Result<String>;

    /// Change the working directory used by later calls
    async fn set_current_directory(&self, directory: &str) -> bool;

    /// Release transports held by the handler
    async fn close(&self) {}
}
