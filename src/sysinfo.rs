//! Host introspection results and the scripts that produce them

use serde::{Deserialize, Deserializer, Serialize};

use crate::config::InfoScript;

const BASH_SCRIPT: &str = include_str!("../scripts/system_info.sh");
const POWERSHELL_SCRIPT: &str = include_str!("../scripts/system_info.ps1");
const PYTHON_SCRIPT: &str = include_str!("../scripts/system_info.py");

/// Facts about a host, as printed by the introspection scripts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub home_folder: String,
    #[serde(rename = "type")]
    pub os_type: String,
    pub release: String,
    pub platform: String,
    pub architecture: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub total_memory: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub free_memory: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub uptime: u64,
    pub current_folder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub powershell_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_model: Option<String>,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            home_folder: "/".to_string(),
            os_type: "Unknown".to_string(),
            release: "N/A".to_string(),
            platform: "N/A".to_string(),
            architecture: "N/A".to_string(),
            total_memory: 0,
            free_memory: 0,
            uptime: 0,
            current_folder: "/".to_string(),
            python_version: None,
            powershell_version: None,
            cpu_model: None,
        }
    }
}

impl SystemInfo {
    /// Parse script output, falling back to the default on any problem
    pub fn parse_or_default(stdout: &str) -> Self {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            tracing::warn!("System info script produced no output");
            return Self::default();
        }
        match serde_json::from_str(trimmed) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("Cannot parse system info output: {}", e);
                Self::default()
            }
        }
    }
}

/// Numbers sometimes arrive as strings (e.g. from shell printf or PowerShell)
fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Unsigned(u64),
        Float(f64),
        Text(String),
    }

    Ok(match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Unsigned(n) => n,
        NumberOrString::Float(f) if f.is_finite() && f >= 0.0 => f as u64,
        NumberOrString::Float(_) => 0,
        NumberOrString::Text(s) => s.trim().parse::<f64>().map(|f| f.max(0.0) as u64).unwrap_or(0),
    })
}

/// Body of the introspection script for the given flavour
pub fn script_body(script: InfoScript) -> &'static str {
    match script {
        InfoScript::Bash => BASH_SCRIPT,
        InfoScript::Powershell => POWERSHELL_SCRIPT,
        InfoScript::Python => PYTHON_SCRIPT,
    }
}
