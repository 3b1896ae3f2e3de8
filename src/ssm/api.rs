//! The slice of the Systems Manager API the SSM backend needs

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ssm::error::DisplayErrorContext;
use tracing::debug;

use crate::error::{GatewayError, Result};

/// Status of a command invocation on one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationStatus {
    Pending,
    InProgress,
    Delayed,
    Cancelling,
    Success,
    Failed,
    Cancelled,
    TimedOut,
    Other(String),
}

impl InvocationStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "Pending" => InvocationStatus::Pending,
            "InProgress" => InvocationStatus::InProgress,
            "Delayed" => InvocationStatus::Delayed,
            "Cancelling" => InvocationStatus::Cancelling,
            "Success" => InvocationStatus::Success,
            "Failed" => InvocationStatus::Failed,
            "Cancelled" => InvocationStatus::Cancelled,
            "TimedOut" => InvocationStatus::TimedOut,
            other => InvocationStatus::Other(other.to_string()),
        }
    }

    /// Whether the invocation has finished and its output is final
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvocationStatus::Success
                | InvocationStatus::Failed
                | InvocationStatus::Cancelled
                | InvocationStatus::TimedOut
        )
    }
}

/// Snapshot of a command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub status: InvocationStatus,
    pub stdout: String,
    pub stderr: String,
    pub response_code: Option<i32>,
}

/// Systems Manager operations used by the SSM backend
#[async_trait]
pub trait SsmApi: Send + Sync + std::fmt::Debug {
    /// Send `commands` through `document` and return the command id
    async fn send_command(
        &self,
        instance_id: &str,
        document: &str,
        commands: Vec<String>,
        timeout_secs: u64,
    ) -> Result<String>;

    /// Fetch the invocation; `None` while the service does not know it yet
    async fn get_invocation(&self, command_id: &str, instance_id: &str) -> Result<Option<Invocation>>;
}

/// [`SsmApi`] backed by the AWS SDK and ambient credentials
#[derive(Debug, Clone)]
pub struct AwsSsmApi {
    client: aws_sdk_ssm::Client,
}

impl AwsSsmApi {
    /// Load credentials from the environment for `region`
    pub async fn from_region(region: &str) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self {
            client: aws_sdk_ssm::Client::new(&sdk_config),
        }
    }
}

/// SSM rejects delivery timeouts below 30 seconds
const MIN_DELIVERY_TIMEOUT_SECS: u64 = 30;

#[async_trait]
impl SsmApi for AwsSsmApi {
    async fn send_command(
        &self,
        instance_id: &str,
        document: &str,
        commands: Vec<String>,
        timeout_secs: u64,
    ) -> Result<String> {
        let timeout_secs = timeout_secs.max(MIN_DELIVERY_TIMEOUT_SECS);
        let output = self
            .client
            .send_command()
            .instance_ids(instance_id)
            .document_name(document)
            .parameters("commands", commands)
            .timeout_seconds(i32::try_from(timeout_secs).unwrap_or(i32::MAX))
            .send()
            .await
            .map_err(|e| GatewayError::ssm(format!("SendCommand failed: {}", DisplayErrorContext(&e))))?;

        output
            .command()
            .and_then(|command| command.command_id())
            .map(str::to_string)
            .ok_or_else(|| GatewayError::ssm("SendCommand returned no command id"))
    }

    async fn get_invocation(&self, command_id: &str, instance_id: &str) -> Result<Option<Invocation>> {
        let result = self
            .client
            .get_command_invocation()
            .command_id(command_id)
            .instance_id(instance_id)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e)
                if e.as_service_error()
                    .is_some_and(|service| service.is_invocation_does_not_exist()) =>
            {
                debug!("Invocation {} not registered yet", command_id);
                return Ok(None);
            }
            Err(e) => {
                return Err(GatewayError::ssm(format!(
                    "GetCommandInvocation failed: {}",
                    DisplayErrorContext(&e)
                )))
            }
        };

        Ok(Some(Invocation {
            status: output
                .status()
                .map(|status| InvocationStatus::parse(status.as_str()))
                .unwrap_or(InvocationStatus::Pending),
            stdout: output.standard_output_content().unwrap_or_default().to_string(),
            stderr: output.standard_error_content().unwrap_or_default().to_string(),
            response_code: Some(output.response_code()),
        }))
    }
}
