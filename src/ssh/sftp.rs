//! File transfer over the SFTP subsystem
//!
//! Each file operation opens its own SFTP session on the shared transport
//! and closes it when done.

use russh_sftp::client::SftpSession;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::connection::SshConnectionManager;
use crate::error::{GatewayError, Result};
use crate::files::{join_path, read_bounded, FileContent, ReadOptions};
use crate::listing::FileEntry;

fn sftp_error<E: std::fmt::Display>(action: &'static str, path: &str) -> impl FnOnce(E) -> GatewayError {
    let path = path.to_string();
    move |e| GatewayError::sftp(format!("{} {}: {}", action, path, e))
}

impl SshConnectionManager {
    /// Start an SFTP session on a new channel
    pub async fn open_sftp(&self) -> Result<SftpSession> {
        let channel = self.open_channel().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| GatewayError::sftp(format!("Failed to request subsystem: {}", e)))?;

        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| GatewayError::sftp(format!("Failed to start session: {}", e)))
    }
}

/// End a session, logging instead of failing
pub async fn finish(sftp: SftpSession) {
    if let Err(e) = sftp.close().await {
        debug!("Failed to close SFTP session: {}", e);
    }
}

/// Write `content` to `path`, truncating any existing file
pub async fn write_file(sftp: &SftpSession, path: &str, content: &[u8]) -> Result<()> {
    let mut file = sftp
        .create(path)
        .await
        .map_err(sftp_error("Cannot create", path))?;
    file.write_all(content)
        .await
        .map_err(sftp_error("Cannot write", path))?;
    file.shutdown()
        .await
        .map_err(sftp_error("Cannot flush", path))?;
    Ok(())
}

pub async fn read_file(sftp: &SftpSession, path: &str) -> Result<String> {
    let mut file = sftp
        .open(path)
        .await
        .map_err(sftp_error("Cannot open", path))?;
    let mut content = Vec::new();
    file.read_to_end(&mut content)
        .await
        .map_err(sftp_error("Cannot read", path))?;
    Ok(String::from_utf8_lossy(&content).into_owned())
}

/// Read the selected part of `path` without buffering the whole file
pub async fn read_range(sftp: &SftpSession, path: &str, options: &ReadOptions) -> Result<FileContent> {
    let file = sftp
        .open(path)
        .await
        .map_err(sftp_error("Cannot open", path))?;
    read_bounded(file, options).await
}

pub async fn exists(sftp: &SftpSession, path: &str) -> Result<bool> {
    sftp.try_exists(path)
        .await
        .map_err(sftp_error("Cannot stat", path))
}

pub async fn rename(sftp: &SftpSession, from: &str, to: &str) -> Result<()> {
    sftp.rename(from, to)
        .await
        .map_err(sftp_error("Cannot rename", from))
}

pub async fn remove(sftp: &SftpSession, path: &str) -> Result<()> {
    sftp.remove_file(path)
        .await
        .map_err(sftp_error("Cannot remove", path))
}

/// Regular files in `directory`, symlinks resolved
pub async fn list_files(sftp: &SftpSession, directory: &str, posix: bool) -> Result<Vec<FileEntry>> {
    let entries = sftp
        .read_dir(directory)
        .await
        .map_err(sftp_error("Cannot list", directory))?;

    let mut files = Vec::new();
    for entry in entries {
        let name = entry.file_name();
        if name == "." || name == ".." {
            continue;
        }

        let metadata = if entry.file_type().is_symlink() {
            match sftp.metadata(join_path(directory, &name, posix)).await {
                Ok(target) => target,
                Err(e) => {
                    debug!("Skipping dangling link {}: {}", name, e);
                    continue;
                }
            }
        } else {
            entry.metadata()
        };

        if !metadata.file_type().is_file() {
            continue;
        }

        let modified_ms = metadata.mtime.map(|secs| i64::from(secs) * 1000).unwrap_or(0);
        files.push(FileEntry::new(name, modified_ms));
    }

    Ok(files)
}
