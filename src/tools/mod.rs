//! MCP tool parameters
//!
//! Each tool deserializes its arguments into one of these structs; the
//! input schemas advertised by `list_tools` are derived from them.
//!
//! Every tool except `list_servers` takes an optional `host`; when absent the
//! configured default host is used.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::listing::OrderBy;
use crate::shell::Interpreter;

/// Parameters for the execute_command tool
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCommandParams {
    /// Configured host to run on (defaults to the default host)
    #[serde(default)]
    pub host: Option<String>,
    /// Shell command to execute
    pub command: String,
    /// Timeout in milliseconds
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Working directory for the command
    #[serde(default)]
    pub directory: Option<String>,
    /// Split stdout into pages of this many lines
    #[serde(default)]
    pub lines_per_page: Option<usize>,
}

/// Parameters for the execute_code tool
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCodeParams {
    #[serde(default)]
    pub host: Option<String>,
    /// Source code, written to a script file as is
    pub code: String,
    /// `bash`, `powershell` or `python`
    pub language: Interpreter,
    /// Timeout in milliseconds
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub lines_per_page: Option<usize>,
}

/// Parameters for the list_files tool
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListFilesParams {
    #[serde(default)]
    pub host: Option<String>,
    /// Directory to list (defaults to the current directory)
    #[serde(default)]
    pub directory: String,
    /// Page size (default 42)
    #[serde(default)]
    pub limit: Option<usize>,
    /// Number of entries to skip
    #[serde(default)]
    pub offset: Option<usize>,
    /// `filename` (ascending) or `datetime` (newest first)
    #[serde(default)]
    pub order_by: Option<OrderBy>,
}

/// Parameters for the create_file tool
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateFileParams {
    #[serde(default)]
    pub host: Option<String>,
    pub directory: String,
    pub filename: String,
    pub content: String,
    /// Keep a timestamped copy of an existing file
    #[serde(default)]
    pub backup: bool,
}

/// Parameters for the update_file tool
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFileParams {
    #[serde(default)]
    pub host: Option<String>,
    pub file_path: String,
    /// Regular expression, or plain text when `literal` is set
    pub pattern: String,
    pub replacement: String,
    #[serde(default)]
    pub backup: bool,
    #[serde(default)]
    pub literal: bool,
}

/// Parameters for the amend_file tool
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AmendFileParams {
    #[serde(default)]
    pub host: Option<String>,
    pub file_path: String,
    /// Text appended to the end of the file
    pub content: String,
}

/// Parameters for the read_file tool
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReadFileParams {
    #[serde(default)]
    pub host: Option<String>,
    pub file_path: String,
    /// First line to return, 1-based
    #[serde(default)]
    pub start_line: Option<usize>,
    /// Last line to return, inclusive
    #[serde(default)]
    pub end_line: Option<usize>,
    /// Stop reading after this many bytes (default 1 MiB)
    #[serde(default)]
    pub max_bytes: Option<u64>,
}

/// Parameters for the change_directory tool
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDirectoryParams {
    #[serde(default)]
    pub host: Option<String>,
    pub directory: String,
}

/// Parameters for tools that only need a host
#[derive(Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HostParams {
    #[serde(default)]
    pub host: Option<String>,
}

/// Parameters for the list_servers tool
#[derive(Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ListServersParams {}

/// JSON schema object for a parameter struct
pub fn input_schema<T: JsonSchema>() -> Map<String, Value> {
    let schema = schemars::schema_for!(T);
    match serde_json::to_value(schema) {
        Ok(Value::Object(mut object)) => {
            object.remove("$schema");
            object
        }
        _ => Map::new(),
    }
}
