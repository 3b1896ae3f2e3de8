//! AWS Systems Manager backend
//!
//! Commands are sent as `AWS-RunShellScript` or `AWS-RunPowerShellScript`
//! documents and their invocation polled until it settles. There is no file
//! transfer channel, so file operations are expressed as shell commands and
//! regex updates and appends are not offered.

pub mod api;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{HandlerSettings, Protocol, ServerConfig};
use crate::error::{GatewayError, Result};
use crate::files::{self, FileContent, ReadOptions};
use crate::handler::{report, CommandResult, ExecOptions, Operation, ServerHandler, SessionState};
use crate::listing::{paginate, FileEntry, FileListing, ListRequest};
use crate::retry::with_retry;
use crate::shell::{in_directory, quote, Interpreter, Separator};
use crate::sysinfo::{script_body, SystemInfo};

pub use api::{AwsSsmApi, Invocation, InvocationStatus, SsmApi};

const SHELL_DOCUMENT: &str = "AWS-RunShellScript";
const POWERSHELL_DOCUMENT: &str = "AWS-RunPowerShellScript";

/// Handler for an instance managed by Systems Manager
#[derive(Debug)]
pub struct SsmHandler {
    server: ServerConfig,
    settings: HandlerSettings,
    instance_id: String,
    api: Arc<dyn SsmApi>,
    session: SessionState,
}

impl SsmHandler {
    /// Build a handler using ambient AWS credentials for the configured region
    pub async fn connect(server: ServerConfig, settings: HandlerSettings) -> Result<Self> {
        server.validate()?;
        let region = server.region.clone().unwrap_or_default();
        let api = AwsSsmApi::from_region(&region).await;
        Self::with_api(server, settings, Arc::new(api))
    }

    /// Build a handler on top of any [`SsmApi`] implementation
    pub fn with_api(server: ServerConfig, settings: HandlerSettings, api: Arc<dyn SsmApi>) -> Result<Self> {
        server.validate()?;
        let instance_id = server
            .instance_id
            .clone()
            .ok_or_else(|| GatewayError::config(format!("SSM server '{}' requires an instanceId", server.host)))?;
        Ok(Self {
            server,
            settings,
            instance_id,
            api,
            session: SessionState::new(None),
        })
    }

    fn posix(&self) -> bool {
        self.server.is_posix()
    }

    fn document(&self) -> &'static str {
        if self.posix() {
            SHELL_DOCUMENT
        } else {
            POWERSHELL_DOCUMENT
        }
    }

    async fn resolve(&self, path: &str) -> Result<String> {
        if files::is_absolute(path, self.posix()) {
            return Ok(path.to_string());
        }
        let base = self.current_directory().await?;
        Ok(files::resolve(&base, path, self.posix()))
    }

    /// Send a command and poll its invocation until it settles.
    ///
    /// Terminal statuses return normally with the instance's output; running
    /// out of polls is a timeout.
    async fn run(&self, command: &str, directory: Option<&str>, timeout: Duration) -> Result<CommandResult> {
        let command = in_directory(command, directory, self.posix(), Separator::Sequence);
        let document = self.document();

        let command_id = with_retry(self.settings.retry, "ssm send_command", || {
            self.api
                .send_command(&self.instance_id, document, vec![command.clone()], timeout.as_secs())
        })
        .await?;
        debug!("Sent command {} to {}", command_id, self.instance_id);

        let poll = self.settings.poll;
        for attempt in 1..=poll.max_attempts {
            tokio::time::sleep(poll.interval).await;

            match self.api.get_invocation(&command_id, &self.instance_id).await {
                Ok(Some(invocation)) if invocation.status.is_terminal() => {
                    debug!(
                        "Command {} finished with {:?} after {} polls",
                        command_id, invocation.status, attempt
                    );
                    return Ok(CommandResult::new(
                        invocation.stdout,
                        invocation.stderr,
                        invocation.response_code,
                    ));
                }
                Ok(Some(invocation)) => {
                    debug!("Command {} is {:?}", command_id, invocation.status);
                }
                Ok(None) => {
                    debug!("Command {} not visible yet", command_id);
                }
                Err(e) if e.is_transient() => {
                    warn!("Polling command {} failed: {}", command_id, e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(GatewayError::CommandTimedOut(poll.budget().as_millis() as u64))
    }

    /// Run a helper command and fail unless it exits cleanly
    async fn run_checked(&self, command: &str) -> Result<String> {
        let output = self.run(command, None, self.settings.default_timeout).await?;
        if output.exit_code == Some(0) {
            Ok(output.stdout)
        } else {
            Err(GatewayError::Exec(format!(
                "Command exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            )))
        }
    }

    fn list_command(&self, directory: &str) -> String {
        if self.posix() {
            format!(
                "find -L {} -mindepth 1 -maxdepth 1 -type f -printf '%T@ %f\\n'",
                quote(directory, true)
            )
        } else {
            format!(
                "Get-ChildItem -LiteralPath {} -File | ForEach-Object {{ \"$(([DateTimeOffset]$_.LastWriteTimeUtc).ToUnixTimeMilliseconds()) $($_.Name)\" }}",
                quote(directory, false)
            )
        }
    }

    /// Command feeding `body` to `interpreter` on standard input.
    ///
    /// There is nowhere to stage a file, so scripts for anything but the
    /// document's own shell travel as a here-document (POSIX) or a
    /// here-string (PowerShell).
    fn script_command(&self, body: &str, interpreter: Interpreter) -> String {
        let native = if self.posix() {
            Interpreter::Bash
        } else {
            Interpreter::Powershell
        };
        if interpreter == native {
            return body.to_string();
        }

        if self.posix() {
            let program = match interpreter {
                Interpreter::Bash => "bash -s",
                Interpreter::Python => "python3 -",
                Interpreter::Powershell => "pwsh -NoProfile -Command -",
            };
            let marker = format!("GATEWAY_{}", Uuid::new_v4().simple());
            format!("{} <<'{}'\n{}\n{}", program, marker, body, marker)
        } else {
            let program = match interpreter {
                Interpreter::Bash => "bash -s",
                Interpreter::Python => "python -",
                Interpreter::Powershell => "powershell -NoProfile -Command -",
            };
            format!("@'\n{}\n'@ | {}", body, program)
        }
    }

    fn info_command(&self) -> String {
        let script = self.server.info_script();
        self.script_command(script_body(script), Interpreter::for_info_script(script))
    }

    /// Command printing the selected lines of `path`, at most one byte past
    /// `max_bytes` so truncation can be detected
    fn read_command(&self, path: &str, options: &ReadOptions) -> String {
        if self.posix() {
            let file = quote(path, true);
            let reader = match (options.start_line, options.end_line) {
                (None, None) => format!("cat {}", file),
                (start, Some(end)) => format!("sed -n '{},{}p;{}q' {}", start.unwrap_or(1), end, end, file),
                (Some(start), None) => format!("sed -n '{},$p' {}", start, file),
            };
            format!(
                "if [ -r {file} ]; then {reader} | head -c {limit}; else echo 'Cannot read' {file} >&2; exit 1; fi",
                file = file,
                reader = reader,
                limit = options.max_bytes + 1,
            )
        } else {
            let file = quote(path, false);
            if !options.has_line_range() {
                return format!("Get-Content -Raw -LiteralPath {}", file);
            }
            let skip = options.start_line.unwrap_or(1) - 1;
            let first = match options.end_line {
                Some(end) => format!(" -First {}", end - skip),
                None => String::new(),
            };
            format!(
                "(Get-Content -LiteralPath {} | Select-Object -Skip {}{}) -join \"`n\"",
                file, skip, first
            )
        }
    }
}

/// Parse `<mtime> <name>` lines.
///
/// POSIX hosts report fractional seconds, Windows hosts whole milliseconds.
fn parse_listing(output: &str, posix: bool) -> Vec<FileEntry> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            let (stamp, name) = line.split_once(' ')?;
            if name.is_empty() {
                return None;
            }
            let modified_ms = if posix {
                (stamp.parse::<f64>().ok()? * 1000.0) as i64
            } else {
                stamp.parse::<i64>().ok()?
            };
            Some(FileEntry::new(name, modified_ms))
        })
        .collect()
}

#[async_trait]
impl ServerHandler for SsmHandler {
    fn host(&self) -> &str {
        &self.server.host
    }

    fn protocol(&self) -> Protocol {
        Protocol::Ssm
    }

    fn supports(&self, operation: Operation) -> bool {
        !matches!(operation, Operation::UpdateFile | Operation::AmendFile)
    }

    async fn execute_command(&self, command: &str, options: ExecOptions) -> Result<CommandResult> {
        let timeout = options.timeout.unwrap_or(self.settings.default_timeout);
        let directory = match options.directory {
            Some(dir) => Some(self.resolve(&dir).await?),
            None => self.session.current_dir().await,
        };

        let result = self.run(command, directory.as_deref(), timeout).await?;
        Ok(result.paginated(options.lines_per_page))
    }

    async fn execute_code(&self, code: &str, language: Interpreter, options: ExecOptions) -> Result<CommandResult> {
        let command = self.script_command(code, language);
        self.execute_command(&command, options).await
    }

    async fn list_files(&self, request: ListRequest) -> Result<FileListing> {
        request.validate()?;
        let directory = self.resolve(&request.directory).await?;
        let output = self.run_checked(&self.list_command(&directory)).await?;
        Ok(paginate(parse_listing(&output, self.posix()), &request))
    }

    async fn create_file(&self, directory: &str, filename: &str, content: &str, backup: bool) -> bool {
        if backup {
            warn!("SSM handler for {} cannot back up files; writing without backup", self.server.host);
        }

        let result = async {
            let dir = self.resolve(directory).await?;
            let path = files::join_path(&dir, filename, self.posix());
            let command = if self.posix() {
                format!("echo {} > {}", quote(content, true), quote(&path, true))
            } else {
                format!(
                    "Set-Content -LiteralPath {} -Value {}",
                    quote(&path, false),
                    quote(content, false)
                )
            };
            self.run_checked(&command).await.map(|_| ())
        }
        .await;

        report(Operation::CreateFile, filename, result)
    }

    async fn update_file(&self, file_path: &str, _pattern: &str, _replacement: &str, _backup: bool) -> bool {
        warn!(
            "update_file is not supported by the SSM handler for {} ({})",
            self.server.host, file_path
        );
        false
    }

    async fn amend_file(&self, file_path: &str, _content: &str) -> bool {
        warn!(
            "amend_file is not supported by the SSM handler for {} ({})",
            self.server.host, file_path
        );
        false
    }

    async fn read_file(&self, file_path: &str, options: ReadOptions) -> Result<FileContent> {
        options.validate()?;
        let path = self.resolve(file_path).await?;
        let stdout = self.run_checked(&self.read_command(&path, &options)).await?;

        // The range was selected remotely; only the byte budget is left
        let budget = ReadOptions::default().with_max_bytes(options.max_bytes);
        files::read_bounded(stdout.as_bytes(), &budget).await
    }

    async fn get_system_info(&self) -> SystemInfo {
        match self.run_checked(&self.info_command()).await {
            Ok(stdout) => SystemInfo::parse_or_default(&stdout),
            Err(e) => {
                warn!("System info unavailable for {}: {}", self.server.host, e);
                SystemInfo::default()
            }
        }
    }

    async fn current_directory(&self) -> Result<String> {
        if let Some(dir) = self.session.current_dir().await {
            return Ok(dir);
        }
        let pwd = if self.posix() { "pwd" } else { "(Get-Location).Path" };
        let stdout = self.run_checked(pwd).await?;
        let dir = stdout.trim();
        if dir.is_empty() {
            return Err(GatewayError::ssm("Working directory lookup returned nothing"));
        }
        self.session.set_current_dir(dir).await;
        Ok(dir.to_string())
    }

    async fn set_current_directory(&self, directory: &str) -> bool {
        let target = match self.resolve(directory).await {
            Ok(target) => target,
            Err(e) => return report(Operation::ChangeDirectory, directory, Err(e)),
        };
        let check = if self.posix() {
            format!("test -d {}", quote(&target, true))
        } else {
            format!(
                "if (Test-Path -LiteralPath {} -PathType Container) {{ exit 0 }} else {{ exit 1 }}",
                quote(&target, false)
            )
        };
        match self.run_checked(&check).await {
            Ok(_) => {
                self.session.set_current_dir(target).await;
                true
            }
            Err(e) => report(Operation::ChangeDirectory, &target, Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_posix_listing() {
        let out = "1700000000.5000000000 b.log\n1600000000.0 a file.txt\n\ngarbage\n";
        let entries = parse_listing(out, true);
        assert_eq!(
            entries,
            vec![
                FileEntry::new("b.log", 1_700_000_000_500),
                FileEntry::new("a file.txt", 1_600_000_000_000),
            ]
        );
    }

    #[test]
    fn test_parse_windows_listing() {
        let entries = parse_listing("1700000000123 report.csv\r\n", false);
        assert_eq!(entries, vec![FileEntry::new("report.csv", 1_700_000_000_123)]);
    }
}
