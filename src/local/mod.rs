//! Local backend: commands run as child processes, files are touched directly

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{HandlerSettings, Protocol, ServerConfig, ShellKind};
use crate::error::{GatewayError, Result};
use crate::files::{self, FileContent, ReadOptions};
use crate::handler::{report, CommandResult, ExecOptions, Operation, ServerHandler, SessionState};
use crate::listing::{paginate, FileEntry, FileListing, ListRequest};
use crate::shell::Interpreter;
use crate::sysinfo::{script_body, SystemInfo};

/// Time a timed out process group gets between SIGTERM and SIGKILL
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Handler for the machine the gateway runs on
#[derive(Debug)]
pub struct LocalHandler {
    server: ServerConfig,
    settings: HandlerSettings,
    session: SessionState,
}

impl LocalHandler {
    pub fn new(server: ServerConfig, settings: HandlerSettings) -> Self {
        let initial = std::env::current_dir()
            .ok()
            .map(|dir| dir.to_string_lossy().into_owned());
        Self {
            server,
            settings,
            session: SessionState::new(initial),
        }
    }

    fn posix(&self) -> bool {
        self.server.is_posix()
    }

    /// Resolve a possibly relative path against the current directory
    async fn resolve(&self, path: &str) -> Result<String> {
        if files::is_absolute(path, self.posix()) {
            return Ok(path.to_string());
        }
        let base = self.current_directory().await?;
        Ok(files::resolve(&base, path, self.posix()))
    }

    fn shell_command(&self, command: &str) -> Command {
        match self.server.effective_shell() {
            ShellKind::Bash => {
                let mut cmd = Command::new("bash");
                cmd.arg("-c").arg(command);
                cmd
            }
            ShellKind::Powershell => {
                let mut cmd = Command::new("powershell");
                cmd.args(["-NoProfile", "-NonInteractive", "-Command", command]);
                cmd
            }
        }
    }

    /// Write `body` to a temp file, run it with `interpreter`, delete it
    async fn run_script(&self, body: &str, interpreter: Interpreter, options: ExecOptions) -> Result<CommandResult> {
        let path = std::env::temp_dir().join(format!(
            "exec_{}.{}",
            Uuid::new_v4().simple(),
            interpreter.extension()
        ));
        tokio::fs::write(&path, body).await?;
        debug!("Staged script {}", path.display());

        let invocation = interpreter.invocation(&path.to_string_lossy(), None, self.posix());
        let result = self.execute_command(&invocation, options).await;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("Failed to remove temp script {}: {}", path.display(), e);
        }
        result
    }

    async fn write_file(&self, path: &str, content: &str, backup: bool) -> Result<()> {
        if backup && tokio::fs::try_exists(path).await? {
            let backup_path = files::backup_path(path);
            tokio::fs::copy(path, &backup_path).await?;
            debug!("Backed up {} to {}", path, backup_path);
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    async fn try_update(&self, path: &str, pattern: &str, replacement: &str, backup: bool) -> Result<()> {
        let content = tokio::fs::read_to_string(path).await?;
        let updated = files::replace_regex(&content, pattern, replacement)?;
        self.write_file(path, &updated, backup).await
    }

    async fn try_amend(&self, path: &str, content: &str) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(self.server.create_if_missing)
            .open(path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn collect_entries(&self, directory: &str) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(directory).await?;

        while let Some(entry) = dir.next_entry().await? {
            // Follows symlinks so linked files are listed like regular ones
            let metadata = match tokio::fs::metadata(entry.path()).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    debug!("Skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            let modified_ms = metadata
                .modified()
                .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
                .unwrap_or(0);
            entries.push(FileEntry::new(
                entry.file_name().to_string_lossy().into_owned(),
                modified_ms,
            ));
        }

        Ok(entries)
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Stop a timed out command and everything it started.
///
/// The shell leads its own process group, so signalling the group reaches
/// background jobs and grandchildren as well.
#[cfg(unix)]
async fn terminate_process_group(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let pgid = -(pid as libc::pid_t);

    // SAFETY: kill(2) has no memory effects; a stale group id yields ESRCH
    if unsafe { libc::kill(pgid, libc::SIGTERM) } == -1 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::ESRCH) {
            warn!("SIGTERM to process group {} failed: {}", pid, errno);
        }
    }

    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        debug!("Process group {} ignored SIGTERM", pid);
    }

    // Stragglers that outlived the shell still get killed
    // SAFETY: as above
    if unsafe { libc::kill(pgid, libc::SIGKILL) } == -1 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::ESRCH) {
            warn!("SIGKILL to process group {} failed: {}", pid, errno);
        }
    }
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("Failed to kill timed out command: {}", e);
    }
    let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
}

fn spawn_error(program: &str, e: std::io::Error) -> GatewayError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            GatewayError::PermissionDenied(format!("{}: {}", program, e))
        }
        _ => GatewayError::Exec(format!("{}: {}", program, e)),
    }
}

#[async_trait]
impl ServerHandler for LocalHandler {
    fn host(&self) -> &str {
        &self.server.host
    }

    fn protocol(&self) -> Protocol {
        Protocol::Local
    }

    async fn execute_command(&self, command: &str, options: ExecOptions) -> Result<CommandResult> {
        let timeout_duration = options.timeout.unwrap_or(self.settings.default_timeout);
        let directory = match options.directory {
            Some(dir) => Some(self.resolve(&dir).await?),
            None => self.session.current_dir().await,
        };

        let mut cmd = self.shell_command(command);
        if let Some(ref dir) = directory {
            cmd.current_dir(dir);
        }
        cmd.kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        debug!("Executing locally in {:?}: {}", directory, command);
        let mut child = cmd.spawn().map_err(|e| spawn_error(command, e))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let collected = tokio::time::timeout(timeout_duration, async {
            let (status, stdout, stderr) = tokio::join!(child.wait(), drain(stdout), drain(stderr));
            Ok::<_, std::io::Error>((status?, stdout?, stderr?))
        })
        .await;

        let (status, stdout, stderr) = match collected {
            Ok(output) => output.map_err(|e| GatewayError::Exec(format!("{}: {}", command, e)))?,
            Err(_) => {
                warn!(
                    "Local command timed out after {}ms, terminating its process group",
                    timeout_duration.as_millis()
                );
                terminate_process_group(&mut child).await;
                return Err(GatewayError::CommandTimedOut(timeout_duration.as_millis() as u64));
            }
        };

        let result = CommandResult::new(
            String::from_utf8_lossy(&stdout),
            String::from_utf8_lossy(&stderr),
            status.code(),
        );
        debug!(
            "Command completed: exit_code={:?}, stdout_len={}, stderr_len={}",
            result.exit_code,
            result.stdout.len(),
            result.stderr.len()
        );

        Ok(result.paginated(options.lines_per_page))
    }

    async fn execute_code(&self, code: &str, language: Interpreter, options: ExecOptions) -> Result<CommandResult> {
        self.run_script(code, language, options).await
    }

    async fn list_files(&self, request: ListRequest) -> Result<FileListing> {
        request.validate()?;
        let directory = self.resolve(&request.directory).await?;
        let entries = self.collect_entries(&directory).await?;
        Ok(paginate(entries, &request))
    }

    async fn create_file(&self, directory: &str, filename: &str, content: &str, backup: bool) -> bool {
        let target = match self.resolve(directory).await {
            Ok(dir) => files::join_path(&dir, filename, self.posix()),
            Err(e) => return report(Operation::CreateFile, filename, Err(e)),
        };
        let result = self.write_file(&target, content, backup).await;
        report(Operation::CreateFile, &target, result)
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
        let file = tokio::fs::File::open(&path).await?;
        files::read_bounded(file, &options).await
    }

    async fn get_system_info(&self) -> SystemInfo {
        let script = self.server.info_script();
        let result = self
            .run_script(
                script_body(script),
                Interpreter::for_info_script(script),
                ExecOptions::default().with_timeout(Duration::from_secs(30)),
            )
            .await;

        match result {
            Ok(output) => SystemInfo::parse_or_default(&output.stdout),
            Err(e) => {
                warn!("System info script failed: {}", e);
                SystemInfo::default()
            }
        }
    }

    async fn current_directory(&self) -> Result<String> {
        if let Some(dir) = self.session.current_dir().await {
            return Ok(dir);
        }
        Ok(std::env::current_dir()?.to_string_lossy().into_owned())
    }

    async fn set_current_directory(&self, directory: &str) -> bool {
        let target = match self.resolve(directory).await {
            Ok(target) => target,
            Err(e) => return report(Operation::ChangeDirectory, directory, Err(e)),
        };
        match tokio::fs::metadata(&target).await {
            Ok(metadata) if metadata.is_dir() => {
                self.session.set_current_dir(target).await;
                true
            }
            Ok(_) => {
                warn!("Not a directory: {}", target);
                false
            }
            Err(e) => report(Operation::ChangeDirectory, &target, Err(e.into())),
        }
    }
}
