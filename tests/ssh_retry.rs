//! SSH backend against an unreachable port

use std::path::PathBuf;
use std::time::{Duration, Instant};

use exec_gateway::config::{HandlerSettings, Protocol, RetryPolicy, ServerConfig};
use exec_gateway::error::GatewayError;
use exec_gateway::handler::{ExecOptions, ServerHandler};
use exec_gateway::ssh::{ConnectionState, SshHandler};

fn key_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/test_ed25519")
}

fn unreachable(delay: Duration) -> SshHandler {
    let server = ServerConfig::new("127.0.0.1", Protocol::Ssh)
        .with_username("deploy")
        .with_port(1)
        .with_private_key_path(key_path());
    let settings = HandlerSettings {
        retry: RetryPolicy { retries: 3, delay },
        ..HandlerSettings::default()
    };
    SshHandler::new(server, settings).unwrap()
}

#[tokio::test]
async fn execute_retries_then_gives_up() {
    let delay = Duration::from_millis(100);
    let handler = unreachable(delay);

    let started = Instant::now();
    let err = handler
        .execute_command("uptime", ExecOptions::default())
        .await
        .unwrap_err();

    match err {
        GatewayError::RetriesExhausted { attempts, source, .. } => {
            assert_eq!(attempts, 4);
            assert!(matches!(*source, GatewayError::Connection(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(started.elapsed() >= delay * 3);
    assert_eq!(handler.connection().state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn failed_directory_lookup_is_not_cached() {
    let handler = unreachable(Duration::from_millis(1));
    assert!(handler.current_directory().await.is_err());
    assert!(handler.current_directory().await.is_err());
    assert!(!handler.set_current_directory("/srv").await);
}

#[tokio::test]
async fn close_before_connect() {
    let handler = unreachable(Duration::from_millis(1));
    handler.close().await;
    assert_eq!(handler.connection().state().await, ConnectionState::Closed);
}
