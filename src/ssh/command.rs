//! Command execution over SSH
//!
//! Runs a command line on its own exec channel and collects stdout, stderr
//! and the exit status until the channel closes or the deadline passes.

use std::time::Duration;

use russh::ChannelMsg;
use tracing::{debug, warn};

use super::connection::SshConnectionManager;
use crate::error::{GatewayError, Result};
use crate::handler::CommandResult;

impl SshConnectionManager {
    /// Execute a command line over a fresh exec channel
    ///
    /// # Returns
    /// * `Ok(CommandResult)` - Output and exit code, whatever the exit code is
    /// * `Err(GatewayError::CommandTimedOut)` - The deadline passed first
    /// * `Err(GatewayError::Connection)` - The channel could not be opened
    pub async fn exec_command(
        &self,
        command: &str,
        timeout_duration: Duration,
    ) -> Result<CommandResult> {
        let channel = self.open_channel().await?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| GatewayError::connection(format!("Failed to exec command: {}", e)))?;

        collect_channel_output(channel, timeout_duration).await
    }
}

/// Collect output from a channel until it closes
///
/// The exit status may arrive after EOF, so collection continues until the
/// channel is closed. On timeout the channel is closed and the partial
/// output discarded.
async fn collect_channel_output(
    mut channel: russh::Channel<russh::client::Msg>,
    timeout_duration: Duration,
) -> Result<CommandResult> {
    let mut output = ChannelOutput::default();
    let deadline = tokio::time::sleep(timeout_duration);
    tokio::pin!(deadline);

    let timed_out = loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(msg) => {
                    if !output.push(msg) {
                        break false;
                    }
                }
                None => break false,
            },
            _ = &mut deadline => break true,
        }
    };

    if timed_out {
        warn!(
            "Command timed out after {}ms, closing channel",
            timeout_duration.as_millis()
        );
        if let Err(e) = channel.close().await {
            debug!("Failed to close timed out channel: {}", e);
        }
        return Err(GatewayError::CommandTimedOut(
            timeout_duration.as_millis() as u64,
        ));
    }

    let output = output.finish();
    debug!(
        "Command completed: exit_code={:?}, stdout_len={}, stderr_len={}",
        output.exit_code,
        output.stdout.len(),
        output.stderr.len()
    );

    Ok(output)
}

/// Raw channel output; decoded once the channel closes so multi-byte
/// characters split across packets survive
#[derive(Debug, Default)]
struct ChannelOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
}

impl ChannelOutput {
    /// Record one message; false once the channel is closed
    fn push(&mut self, msg: ChannelMsg) -> bool {
        match msg {
            ChannelMsg::Data { data } => self.stdout.extend_from_slice(&data),
            // ext == 1 is stderr
            ChannelMsg::ExtendedData { data, ext: 1 } => self.stderr.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, .. } => self.stdout.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => self.exit_code = Some(exit_status as i32),
            ChannelMsg::ExitSignal { signal_name, .. } => {
                debug!("Remote command terminated by signal {:?}", signal_name);
            }
            ChannelMsg::Close => return false,
            _ => {}
        }
        true
    }

    fn finish(self) -> CommandResult {
        CommandResult::new(
            String::from_utf8_lossy(&self.stdout),
            String::from_utf8_lossy(&self.stderr),
            self.exit_code,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::CryptoVec;

    fn data(bytes: &[u8]) -> ChannelMsg {
        ChannelMsg::Data {
            data: CryptoVec::from_slice(bytes),
        }
    }

    #[test]
    fn test_characters_split_across_packets() {
        let text = "caf\u{e9} \u{2713} \u{1f980}";
        let bytes = text.as_bytes();
        let mut output = ChannelOutput::default();

        // One byte per packet splits every multi-byte character
        for byte in bytes {
            assert!(output.push(data(std::slice::from_ref(byte))));
        }
        assert!(output.push(ChannelMsg::ExitStatus { exit_status: 0 }));
        assert!(!output.push(ChannelMsg::Close));

        let result = output.finish();
        assert_eq!(result.stdout, text);
        assert!(!result.stdout.contains('\u{fffd}'));
        assert_eq!(result.exit_code, Some(0));
    }

    #[test]
    fn test_stderr_is_extended_data_one() {
        let mut output = ChannelOutput::default();
        output.push(ChannelMsg::ExtendedData {
            data: CryptoVec::from_slice(&"\u{e9}".as_bytes()[..1]),
            ext: 1,
        });
        output.push(ChannelMsg::ExtendedData {
            data: CryptoVec::from_slice(&"\u{e9}".as_bytes()[1..]),
            ext: 1,
        });
        output.push(data(b"out"));

        let result = output.finish();
        assert_eq!(result.stderr, "\u{e9}");
        assert_eq!(result.stdout, "out");
        assert_eq!(result.exit_code, None);
    }
}
