//! Command sanitization, quoting and interpreter selection
//!
//! Shared by every backend: commands are validated the same way everywhere,
//! and remote command lines are assembled from quoted paths only.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::{InfoScript, ShellKind};
use crate::error::{GatewayError, Result};

/// Sanitize a command before execution
///
/// This function:
/// - Validates that the command is not empty
/// - Trims whitespace
/// - Checks length against max_chars limit
///
/// # Examples
/// ```
/// use exec_gateway::shell::sanitize_command;
///
/// let cmd = sanitize_command("  ls -la  ", Some(1000)).unwrap();
/// assert_eq!(cmd, "ls -la");
///
/// let result = sanitize_command("a".repeat(100).as_str(), Some(50));
/// assert!(result.is_err());
/// ```
pub fn sanitize_command(command: &str, max_chars: Option<usize>) -> Result<String> {
    let trimmed = command.trim();

    if trimmed.is_empty() {
        return Err(GatewayError::invalid_params("Command cannot be empty"));
    }

    if let Some(max) = max_chars {
        if trimmed.len() > max {
            return Err(GatewayError::invalid_params(format!(
                "Command is too long (max {} characters, got {})",
                max,
                trimmed.len()
            )));
        }
    }

    Ok(trimmed.to_string())
}

/// Escapes a string for use inside a single-quoted POSIX shell string.
///
/// ```
/// use exec_gateway::shell::escape_for_shell;
///
/// assert_eq!(escape_for_shell("it's"), "it'\"'\"'s");
/// ```
pub fn escape_for_shell(s: &str) -> String {
    s.replace('\'', "'\"'\"'")
}

/// Single-quote a word for a POSIX shell
pub fn quote_posix(s: &str) -> String {
    format!("'{}'", escape_for_shell(s))
}

/// Single-quote a word for PowerShell (quotes are doubled)
pub fn quote_powershell(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Quote a word for the given dialect
pub fn quote(s: &str, posix: bool) -> String {
    if posix {
        quote_posix(s)
    } else {
        quote_powershell(s)
    }
}

/// How a directory change is joined to the command that follows it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    /// `&&`: the command only runs when the change succeeded
    AndThen,
    /// `;`: the command runs regardless
    Sequence,
}

/// Prefix a command with a change of directory in the given dialect.
///
/// PowerShell 5 has no `&&`, so Windows lines always use `;`.
pub fn in_directory(command: &str, directory: Option<&str>, posix: bool, separator: Separator) -> String {
    match directory {
        Some(dir) if posix => match separator {
            Separator::AndThen => format!("cd {} && {}", quote_posix(dir), command),
            Separator::Sequence => format!("cd {}; {}", quote_posix(dir), command),
        },
        Some(dir) => format!("Set-Location -Path {}; {}", quote_powershell(dir), command),
        None => command.to_string(),
    }
}

/// Program that runs a staged script file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Interpreter {
    #[serde(alias = "sh", alias = "shell")]
    Bash,
    #[serde(alias = "pwsh", alias = "ps1")]
    Powershell,
    #[serde(alias = "python3", alias = "py")]
    Python,
}

impl Interpreter {
    pub fn for_shell(shell: ShellKind) -> Self {
        match shell {
            ShellKind::Bash => Interpreter::Bash,
            ShellKind::Powershell => Interpreter::Powershell,
        }
    }

    pub fn for_info_script(script: InfoScript) -> Self {
        match script {
            InfoScript::Bash => Interpreter::Bash,
            InfoScript::Powershell => Interpreter::Powershell,
            InfoScript::Python => Interpreter::Python,
        }
    }

    /// File extension for staged scripts
    pub fn extension(&self) -> &'static str {
        match self {
            Interpreter::Bash => "sh",
            Interpreter::Powershell => "ps1",
            Interpreter::Python => "py",
        }
    }

    /// Command line that runs `script_path`, optionally from `directory`.
    ///
    /// `posix` is the dialect of the login shell that receives the line, which
    /// decides how paths are quoted and how the directory change is spelled.
    pub fn invocation(&self, script_path: &str, directory: Option<&str>, posix: bool) -> String {
        let script = quote(script_path, posix);
        let run = match self {
            Interpreter::Bash => format!("bash {}", script),
            Interpreter::Python if posix => format!("python3 {}", script),
            Interpreter::Python => format!("python {}", script),
            Interpreter::Powershell if posix => format!("pwsh -NoProfile -File {}", script),
            Interpreter::Powershell => {
                format!("powershell -NoProfile -ExecutionPolicy Bypass -File {}", script)
            }
        };
        in_directory(&run, directory, posix, Separator::AndThen)
    }
}
