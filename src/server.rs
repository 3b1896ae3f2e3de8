//! MCP Server implementation
//!
//! Exposes the handler operations as MCP tools. Each call resolves its host
//! through the shared [`HandlerRegistry`] and reports results as JSON text.

use std::sync::Arc;
use std::time::Duration;

use rmcp::{
    handler::server::ServerHandler as McpServerHandler,
    model::*,
    service::{RequestContext, RoleServer},
    ErrorData as McpError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::files::ReadOptions;
use crate::handler::{ExecOptions, HandlerRegistry, Operation, ServerHandler};
use crate::listing::ListRequest;
use crate::shell::sanitize_command;
use crate::tools::*;

type ToolResult = std::result::Result<CallToolResult, McpError>;

/// Execution gateway MCP Server
///
/// Cheap to clone; clones share the handler registry.
#[derive(Clone)]
pub struct GatewayServer {
    /// Server configuration
    config: Arc<Config>,

    /// Handlers for every configured host
    registry: Arc<HandlerRegistry>,
}

impl GatewayServer {
    /// Create a new server
    ///
    /// No handler is built and no connection opened until a tool needs it.
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(HandlerRegistry::from_config(&config));
        Self {
            config: Arc::new(config),
            registry,
        }
    }

    /// Close the server and cleanup resources
    pub async fn shutdown(&self) {
        info!("Shutting down execution gateway...");
        self.registry.close_all().await;
    }

    /// Handler for `host`, or the default host, that supports `operation`
    async fn handler(&self, host: Option<&str>, operation: Operation) -> Result<Arc<dyn ServerHandler>> {
        let host = host.unwrap_or(&self.config.default_host);
        let handler = self.registry.get(host).await?;
        if !handler.supports(operation) {
            return Err(GatewayError::Unsupported {
                backend: handler.protocol().as_str(),
                operation: operation.to_string(),
            });
        }
        Ok(handler)
    }

    async fn execute_command(&self, params: ExecuteCommandParams) -> Result<CallToolResult> {
        let command = sanitize_command(&params.command, self.config.max_chars)?;
        let handler = self
            .handler(params.host.as_deref(), Operation::ExecuteCommand)
            .await?;

        let options = exec_options(params.timeout, params.directory, params.lines_per_page);
        let output = handler.execute_command(&command, options).await?;
        json_result(&output)
    }

    async fn execute_code(&self, params: ExecuteCodeParams) -> Result<CallToolResult> {
        if params.code.trim().is_empty() {
            return Err(GatewayError::invalid_params("Code cannot be empty"));
        }
        let handler = self
            .handler(params.host.as_deref(), Operation::ExecuteCode)
            .await?;

        let options = exec_options(params.timeout, params.directory, params.lines_per_page);
        let output = handler
            .execute_code(&params.code, params.language, options)
            .await?;
        json_result(&output)
    }

    async fn list_files(&self, params: ListFilesParams) -> Result<CallToolResult> {
        let mut request = ListRequest::new(params.directory)
            .ordered_by(params.order_by.unwrap_or_default());
        request.limit = params.limit.unwrap_or(request.limit);
        request.offset = params.offset.unwrap_or(request.offset);
        request.validate()?;

        let handler = self
            .handler(params.host.as_deref(), Operation::ListFiles)
            .await?;
        let listing = handler.list_files(request).await?;
        json_result(&listing)
    }

    async fn create_file(&self, params: CreateFileParams) -> Result<CallToolResult> {
        let handler = self
            .handler(params.host.as_deref(), Operation::CreateFile)
            .await?;
        let success = handler
            .create_file(&params.directory, &params.filename, &params.content, params.backup)
            .await;
        flag_result(success)
    }

    async fn update_file(&self, params: UpdateFileParams) -> Result<CallToolResult> {
        let handler = self
            .handler(params.host.as_deref(), Operation::UpdateFile)
            .await?;
        let success = if params.literal {
            handler
                .update_file_literal(&params.file_path, &params.pattern, &params.replacement, params.backup)
                .await
        } else {
            handler
                .update_file(&params.file_path, &params.pattern, &params.replacement, params.backup)
                .await
        };
        flag_result(success)
    }

    async fn amend_file(&self, params: AmendFileParams) -> Result<CallToolResult> {
        let handler = self
            .handler(params.host.as_deref(), Operation::AmendFile)
            .await?;
        flag_result(handler.amend_file(&params.file_path, &params.content).await)
    }

    async fn read_file(&self, params: ReadFileParams) -> Result<CallToolResult> {
        let mut options = ReadOptions::default().lines(params.start_line, params.end_line);
        if let Some(max_bytes) = params.max_bytes {
            options = options.with_max_bytes(max_bytes);
        }
        options.validate()?;

        let handler = self
            .handler(params.host.as_deref(), Operation::ReadFile)
            .await?;
        json_result(&handler.read_file(&params.file_path, options).await?)
    }

    async fn get_system_info(&self, params: HostParams) -> Result<CallToolResult> {
        let handler = self
            .handler(params.host.as_deref(), Operation::SystemInfo)
            .await?;
        json_result(&handler.get_system_info().await)
    }

    async fn change_directory(&self, params: ChangeDirectoryParams) -> Result<CallToolResult> {
        let handler = self
            .handler(params.host.as_deref(), Operation::ChangeDirectory)
            .await?;
        flag_result(handler.set_current_directory(&params.directory).await)
    }

    async fn present_working_directory(&self, params: HostParams) -> Result<CallToolResult> {
        let handler = self
            .handler(params.host.as_deref(), Operation::ChangeDirectory)
            .await?;
        let dir = handler.current_directory().await?;
        Ok(CallToolResult::success(vec![Content::text(dir)]))
    }

    fn list_servers(&self) -> Result<CallToolResult> {
        let servers: Vec<serde_json::Value> = self
            .registry
            .servers()
            .into_iter()
            .map(|server| {
                serde_json::json!({
                    "host": server.host,
                    "protocol": server.protocol,
                    "default": server.host == self.config.default_host,
                })
            })
            .collect();
        json_result(&servers)
    }

    /// Tool definitions advertised by `list_tools`
    fn tools() -> Vec<Tool> {
        vec![
            tool::<ExecuteCommandParams>(
                "execute_command",
                "Execute a shell command on a configured host and return stdout, stderr and the exit code. A non-zero exit code is reported, not treated as a failure.",
            ),
            tool::<ExecuteCodeParams>(
                "execute_code",
                "Write code to a temporary script on a configured host, run it with the bash, powershell or python interpreter and return stdout, stderr and the exit code.",
            ),
            tool::<ListFilesParams>(
                "list_files",
                "List regular files in a directory, sorted by filename or modification time, one page at a time.",
            ),
            tool::<CreateFileParams>(
                "create_file",
                "Create or overwrite a file, optionally keeping a timestamped backup of the previous version.",
            ),
            tool::<UpdateFileParams>(
                "update_file",
                "Replace every match of a regular expression (or literal text when literal is set) in a file.",
            ),
            tool::<AmendFileParams>("amend_file", "Append content to the end of a file."),
            tool::<ReadFileParams>(
                "read_file",
                "Read a file, optionally only lines startLine..endLine, up to maxBytes (default 1 MiB). The result says whether it was truncated.",
            ),
            tool::<HostParams>(
                "get_system_info",
                "Report OS, architecture, memory, uptime and interpreter versions of a host.",
            ),
            tool::<ChangeDirectoryParams>(
                "change_directory",
                "Change the working directory used by later commands and relative paths on a host.",
            ),
            tool::<HostParams>(
                "present_working_directory",
                "Return the current working directory of a host.",
            ),
            tool::<ListServersParams>("list_servers", "List the configured hosts and their protocols."),
        ]
    }
}

fn exec_options(timeout_ms: Option<u64>, directory: Option<String>, lines_per_page: Option<usize>) -> ExecOptions {
    let mut options = ExecOptions::default();
    if let Some(ms) = timeout_ms {
        options = options.with_timeout(Duration::from_millis(ms));
    }
    if let Some(dir) = directory {
        options = options.in_directory(dir);
    }
    if let Some(lines) = lines_per_page {
        options = options.paged(lines);
    }
    options
}

fn tool<T: schemars::JsonSchema>(name: &'static str, description: &'static str) -> Tool {
    Tool::new(name, description, Arc::new(input_schema::<T>()))
}

fn parse<T: DeserializeOwned>(args: JsonObject) -> std::result::Result<T, McpError> {
    serde_json::from_value(serde_json::Value::Object(args))
        .map_err(|e| McpError::invalid_params(format!("Invalid arguments: {}", e), None))
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| GatewayError::Exec(format!("Cannot encode result: {}", e)))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

fn flag_result(success: bool) -> Result<CallToolResult> {
    json_result(&serde_json::json!({ "success": success }))
}

/// Turn handler failures into tool errors the client can read
fn into_tool_result(tool_name: &str, result: Result<CallToolResult>) -> ToolResult {
    match result {
        Ok(result) => Ok(result),
        Err(e) => {
            error!("{} failed: {}", tool_name, e);
            Ok(CallToolResult::error(vec![Content::text(format!("Error: {}", e))]))
        }
    }
}

impl McpServerHandler for GatewayServer {
    /// Return server information
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(format!(
                "Execution gateway v{} - run commands and manage files on {} configured host(s); default host '{}'",
                env!("CARGO_PKG_VERSION"),
                self.registry.servers().len(),
                self.config.default_host,
            )),
        }
    }

    /// List available tools
    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListToolsResult, McpError> {
        debug!("list_tools called");

        Ok(ListToolsResult {
            tools: Self::tools(),
            next_cursor: None,
            meta: Default::default(),
        })
    }

    /// Call a tool
    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> ToolResult {
        let tool_name: &str = request.name.as_ref();
        debug!("call_tool called: {:?}", tool_name);

        let args = request.arguments.unwrap_or_default();

        let result = match tool_name {
            "execute_command" => self.execute_command(parse(args)?).await,
            "execute_code" => self.execute_code(parse(args)?).await,
            "list_files" => self.list_files(parse(args)?).await,
            "create_file" => self.create_file(parse(args)?).await,
            "update_file" => self.update_file(parse(args)?).await,
            "amend_file" => self.amend_file(parse(args)?).await,
            "read_file" => self.read_file(parse(args)?).await,
            "get_system_info" => self.get_system_info(parse(args)?).await,
            "change_directory" => self.change_directory(parse(args)?).await,
            "present_working_directory" => self.present_working_directory(parse(args)?).await,
            "list_servers" => self.list_servers(),
            _ => {
                return Err(McpError::invalid_params(
                    format!("Unknown tool: {}", tool_name),
                    None,
                ))
            }
        };

        into_tool_result(tool_name, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HandlerSettings, LOCALHOST};
    use crate::shell::Interpreter;

    fn local_server() -> GatewayServer {
        GatewayServer::new(Config {
            servers: Vec::new(),
            default_host: LOCALHOST.to_string(),
            max_chars: Some(1000),
            settings: HandlerSettings::default(),
        })
    }

    fn text(result: &CallToolResult) -> String {
        result
            .content
            .iter()
            .filter_map(|c| c.as_text().map(|t| t.text.clone()))
            .collect()
    }

    #[test]
    fn test_tool_definitions() {
        let tools = GatewayServer::tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
        assert!(names.contains(&"execute_command"));
        assert!(names.contains(&"execute_code"));
        assert_eq!(names.len(), 11);
        assert!(names.contains(&"list_servers"));
        assert!(tools.iter().all(|t| t.input_schema.get("type").is_some()));
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        let args = serde_json::json!({ "host": "localhost" });
        let parsed = parse::<ExecuteCommandParams>(args.as_object().cloned().unwrap());
        assert!(parsed.is_err());
    }

    #[test]
    fn test_list_servers_marks_default() {
        let result = local_server().list_servers().unwrap();
        let servers: serde_json::Value = serde_json::from_str(&text(&result)).unwrap();
        assert_eq!(servers[0]["host"], "localhost");
        assert_eq!(servers[0]["default"], true);
    }

    #[tokio::test]
    async fn test_unknown_host_is_tool_error() {
        let server = local_server();
        let result = server
            .execute_command(ExecuteCommandParams {
                host: Some("nowhere".into()),
                command: "true".into(),
                timeout: None,
                directory: None,
                lines_per_page: None,
            })
            .await;
        let result = into_tool_result("execute_command", result).unwrap();
        assert_eq!(result.is_error, Some(true));
        assert!(text(&result).contains("Unknown host"));
    }

    #[tokio::test]
    async fn test_overlong_command_is_rejected() {
        let server = local_server();
        let result = server
            .execute_command(ExecuteCommandParams {
                host: None,
                command: "a".repeat(2000),
                timeout: None,
                directory: None,
                lines_per_page: None,
            })
            .await;
        assert!(matches!(result, Err(GatewayError::InvalidParams(_))));
    }

    fn code_params(code: &str, language: Interpreter) -> ExecuteCodeParams {
        ExecuteCodeParams {
            host: None,
            code: code.into(),
            language,
            timeout: None,
            directory: None,
            lines_per_page: None,
        }
    }

    #[tokio::test]
    async fn test_blank_code_is_rejected() {
        let result = local_server()
            .execute_code(code_params("  \n", Interpreter::Bash))
            .await;
        assert!(matches!(result, Err(GatewayError::InvalidParams(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_code_reports_json() {
        let result = local_server()
            .execute_code(code_params("echo from-script\nexit 5", Interpreter::Bash))
            .await
            .unwrap();
        let output: serde_json::Value = serde_json::from_str(&text(&result)).unwrap();
        assert_eq!(output["stdout"], "from-script\n");
        assert_eq!(output["exitCode"], 5);
    }

    #[tokio::test]
    async fn test_read_file_reports_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "alpha\nbeta\ngamma\n").unwrap();

        let result = local_server()
            .read_file(ReadFileParams {
                host: None,
                file_path: path.to_string_lossy().into_owned(),
                start_line: Some(2),
                end_line: None,
                max_bytes: Some(7),
            })
            .await
            .unwrap();
        let read: serde_json::Value = serde_json::from_str(&text(&result)).unwrap();
        assert_eq!(read["content"], "beta\nga");
        assert_eq!(read["truncated"], true);
    }

    #[tokio::test]
    async fn test_read_file_rejects_reversed_range() {
        let result = local_server()
            .read_file(ReadFileParams {
                host: None,
                file_path: "/etc/hosts".into(),
                start_line: Some(3),
                end_line: Some(1),
                max_bytes: None,
            })
            .await;
        assert!(matches!(result, Err(GatewayError::InvalidParams(_))));
    }

    #[tokio::test]
    async fn test_zero_page_size_is_rejected() {
        let result = local_server()
            .list_files(ListFilesParams {
                host: None,
                directory: "/tmp".into(),
                limit: Some(0),
                offset: None,
                order_by: None,
            })
            .await;
        assert!(matches!(result, Err(GatewayError::InvalidParams(_))));
    }
}
