//! SSH client handler implementation
//!
//! Implements the `russh::client::Handler` trait to handle SSH connection events.

/// SSH client handler for russh
///
/// Processes transport events such as server key verification. All server
/// keys are accepted; targets come from an operator-maintained inventory.
#[derive(Debug, Clone, Default)]
pub struct ClientHandler {
    host: String,
}

impl ClientHandler {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "Accepting {} host key for {}",
            server_public_key.algorithm(),
            self.host
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_creation() {
        let handler = ClientHandler::new("web-1");
        assert!(format!("{:?}", handler).contains("web-1"));
    }
}
