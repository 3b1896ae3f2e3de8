//! SSH backend
//!
//! Commands are staged as script files in the target's script folder,
//! executed with the configured interpreter and removed afterwards. File
//! operations go through SFTP.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::SshConfig;
use super::connection::SshConnectionManager;
use super::sftp;
use crate::config::{HandlerSettings, Protocol, ServerConfig};
use crate::error::{GatewayError, Result};
use crate::files::{self, FileContent, ReadOptions};
use crate::handler::{report, CommandResult, ExecOptions, Operation, ServerHandler, SessionState};
use crate::listing::{paginate, FileListing, ListRequest};
use crate::retry::with_retry;
use crate::shell::{quote, Interpreter};
use crate::sysinfo::{script_body, SystemInfo};

/// Prints `$TMPDIR` when it is a writable directory, `/tmp` otherwise
const POSIX_TEMP_QUERY: &str =
    r#"d="${TMPDIR:-/tmp}"; if [ -d "$d" ] && [ -w "$d" ]; then printf '%s' "$d"; else printf '/tmp'; fi"#;

const WINDOWS_TEMP_QUERY: &str = "Write-Output $env:TEMP";

const POSIX_TEMP_FALLBACK: &str = "/tmp";
const WINDOWS_TEMP_FALLBACK: &str = "C:\\Windows\\Temp";

/// Timeout for the short helper commands (temp folder, `pwd`, `test -d`)
const HELPER_TIMEOUT: Duration = Duration::from_secs(15);

/// Handler for a host reached over SSH
#[derive(Debug)]
pub struct SshHandler {
    server: ServerConfig,
    settings: HandlerSettings,
    connection: SshConnectionManager,
    session: SessionState,
    script_folder: OnceCell<String>,
}

impl SshHandler {
    /// Build a handler; reads and parses the private key but does not connect
    pub fn new(server: ServerConfig, settings: HandlerSettings) -> Result<Self> {
        let config = SshConfig::from_server(&server)?;
        let connection = SshConnectionManager::new(config)?;
        Ok(Self {
            server,
            settings,
            connection,
            session: SessionState::new(None),
            script_folder: OnceCell::new(),
        })
    }

    pub fn connection(&self) -> &SshConnectionManager {
        &self.connection
    }

    fn posix(&self) -> bool {
        self.server.is_posix()
    }

    /// Writable folder for staged scripts, discovered once per handler
    async fn script_folder(&self) -> Result<&str> {
        let folder = self
            .script_folder
            .get_or_try_init(|| async {
                if let Some(folder) = &self.server.script_folder {
                    return Ok::<_, GatewayError>(folder.clone());
                }
                let (query, fallback) = if self.posix() {
                    (POSIX_TEMP_QUERY, POSIX_TEMP_FALLBACK)
                } else {
                    (WINDOWS_TEMP_QUERY, WINDOWS_TEMP_FALLBACK)
                };
                let output = self.connection.exec_command(query, HELPER_TIMEOUT).await?;
                let folder = output.stdout.trim();
                let folder = if folder.is_empty() { fallback } else { folder };
                info!("Using script folder {} on {}", folder, self.server.host);
                Ok(folder.to_string())
            })
            .await?;
        Ok(folder.as_str())
    }

    /// Resolve a possibly relative path against the current directory
    async fn resolve(&self, path: &str) -> Result<String> {
        if files::is_absolute(path, self.posix()) {
            return Ok(path.to_string());
        }
        let base = self.current_directory().await?;
        Ok(files::resolve(&base, path, self.posix()))
    }

    /// Upload `body` as a script, run it, delete it.
    ///
    /// The script is removed on every path once it has been written.
    async fn run_staged(
        &self,
        body: &str,
        interpreter: Interpreter,
        directory: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandResult> {
        let folder = self.script_folder().await?;
        let script_path = files::join_path(
            folder,
            &format!("exec_{}.{}", Uuid::new_v4().simple(), interpreter.extension()),
            self.posix(),
        );

        let session = self.connection.open_sftp().await?;
        let uploaded = sftp::write_file(&session, &script_path, body.as_bytes()).await;
        sftp::finish(session).await;
        uploaded?;
        debug!("Staged script {}", script_path);

        let invocation = interpreter.invocation(&script_path, directory, self.posix());
        let result = self.connection.exec_command(&invocation, timeout).await;

        self.remove_staged(&script_path).await;
        result
    }

    /// Staged run with the handler's retry policy, paged as requested
    async fn run_with_retry(
        &self,
        operation: &'static str,
        body: &str,
        interpreter: Interpreter,
        options: ExecOptions,
    ) -> Result<CommandResult> {
        let timeout = options.timeout.unwrap_or(self.settings.default_timeout);
        let directory = match options.directory {
            Some(dir) => Some(self.resolve(&dir).await?),
            None => self.session.current_dir().await,
        };

        let result = with_retry(self.settings.retry, operation, || {
            self.run_staged(body, interpreter, directory.as_deref(), timeout)
        })
        .await?;

        Ok(result.paginated(options.lines_per_page))
    }

    async fn remove_staged(&self, script_path: &str) {
        let removed = match self.connection.open_sftp().await {
            Ok(session) => {
                let removed = sftp::remove(&session, script_path).await;
                sftp::finish(session).await;
                removed
            }
            Err(e) => Err(e),
        };
        if let Err(e) = removed {
            warn!("Failed to remove temp script {}: {}", script_path, e);
        }
    }

    /// Move an existing file aside before it is overwritten
    async fn backup_existing(&self, session: &russh_sftp::client::SftpSession, path: &str) -> Result<()> {
        if sftp::exists(session, path).await? {
            let backup = files::backup_path(path);
            sftp::rename(session, path, &backup).await?;
            debug!("Backed up {} to {}", path, backup);
        }
        Ok(())
    }

    async fn try_create(&self, path: &str, content: &str, backup: bool) -> Result<()> {
        let session = self.connection.open_sftp().await?;
        let result = async {
            if backup {
                self.backup_existing(&session, path).await?;
            }
            sftp::write_file(&session, path, content.as_bytes()).await
        }
        .await;
        sftp::finish(session).await;
        result
    }

    async fn try_update(&self, path: &str, pattern: &str, replacement: &str, backup: bool) -> Result<()> {
        let session = self.connection.open_sftp().await?;
        let result = async {
            let content = sftp::read_file(&session, path).await?;
            let updated = files::replace_regex(&content, pattern, replacement)?;
            if backup {
                self.backup_existing(&session, path).await?;
            }
            sftp::write_file(&session, path, updated.as_bytes()).await
        }
        .await;
        sftp::finish(session).await;
        result
    }

    async fn try_amend(&self, path: &str, content: &str) -> Result<()> {
        let session = self.connection.open_sftp().await?;
        let result = async {
            let existing = if sftp::exists(&session, path).await? {
                sftp::read_file(&session, path).await?
            } else if self.server.create_if_missing {
                String::new()
            } else {
                return Err(GatewayError::sftp(format!("No such file: {}", path)));
            };
            let amended = files::amend(&existing, content);
            sftp::write_file(&session, path, amended.as_bytes()).await
        }
        .await;
        sftp::finish(session).await;
        result
    }
}

#[async_trait]
impl ServerHandler for SshHandler {
    fn host(&self) -> &str {
        &self.server.host
    }

    fn protocol(&self) -> Protocol {
        Protocol::Ssh
    }

    async fn execute_command(&self, command: &str, options: ExecOptions) -> Result<CommandResult> {
        let interpreter = Interpreter::for_shell(self.server.effective_shell());
        self.run_with_retry("ssh execute_command", command, interpreter, options)
            .await
    }

    async fn execute_code(&self, code: &str, language: Interpreter, options: ExecOptions) -> Result<CommandResult> {
        self.run_with_retry("ssh execute_code", code, language, options)
            .await
    }

    async fn list_files(&self, request: ListRequest) -> Result<FileListing> {
        request.validate()?;
        let directory = self.resolve(&request.directory).await?;
        let session = self.connection.open_sftp().await?;
        let entries = sftp::list_files(&session, &directory, self.posix()).await;
        sftp::finish(session).await;
        Ok(paginate(entries?, &request))
    }

    async fn create_file(&self, directory: &str, filename: &str, content: &str, backup: bool) -> bool {
        let result = match self.resolve(directory).await {
            Ok(dir) => {
                let path = files::join_path(&dir, filename, self.posix());
                self.try_create(&path, content, backup).await
            }
            Err(e) => Err(e),
        };
        report(Operation::CreateFile, filename, result)
    }

    async fn update_file(&self, file_path: &str, pattern: &str, replacement: &str, backup: bool) -> bool {
        let result = match self.resolve(file_path).await {
            Ok(path) => self.try_update(&path, pattern, replacement, backup).await,
            Err(e) => Err(e),
        };
        report(Operation::UpdateFile, file_path, result)
    }

    async fn amend_file(&self, file_path: &str, content: &str) -> bool {
        let result = match self.resolve(file_path).await {
            Ok(path) => self.try_amend(&path, content).await,
            Err(e) => Err(e),
        };
        report(Operation::AmendFile, file_path, result)
    }

    async fn read_file(&self, file_path: &str, options: ReadOptions) -> Result<FileContent> {
        options.validate()?;
        let path = self.resolve(file_path).await?;
        let session = self.connection.open_sftp().await?;
        let content = sftp::read_range(&session, &path, &options).await;
        sftp::finish(session).await;
        content
    }

    async fn get_system_info(&self) -> SystemInfo {
        let script = self.server.info_script();
        let result = self
            .run_staged(
                script_body(script),
                Interpreter::for_info_script(script),
                None,
                HELPER_TIMEOUT * 2,
            )
            .await;

        match result {
            Ok(output) if output.success() => SystemInfo::parse_or_default(&output.stdout),
            Ok(output) => {
                warn!(
                    "System info script exited with {:?}: {}",
                    output.exit_code,
                    output.stderr.trim()
                );
                SystemInfo::default()
            }
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
        let output = self.connection.exec_command(pwd, HELPER_TIMEOUT).await?;
        let dir = output.stdout.trim();
        if !output.success() || dir.is_empty() {
            return Err(GatewayError::Exec(format!(
                "Cannot determine working directory on {}: {}",
                self.server.host,
                output.stderr.trim()
            )));
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

        match self.connection.exec_command(&check, HELPER_TIMEOUT).await {
            Ok(output) if output.exit_code == Some(0) => {
                self.session.set_current_dir(target).await;
                true
            }
            Ok(_) => {
                warn!("Not a directory on {}: {}", self.server.host, target);
                false
            }
            Err(e) => report(Operation::ChangeDirectory, &target, Err(e)),
        }
    }

    async fn close(&self) {
        self.connection.close().await;
    }
}
