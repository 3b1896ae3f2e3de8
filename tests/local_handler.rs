//! Local backend behaviour against a scratch directory

#![cfg(unix)]

use std::time::Duration;

use exec_gateway::config::{HandlerSettings, ServerConfig};
use exec_gateway::error::GatewayError;
use exec_gateway::files::ReadOptions;
use exec_gateway::handler::{ExecOptions, ServerHandler};
use exec_gateway::listing::{ListRequest, OrderBy};
use exec_gateway::local::LocalHandler;
use exec_gateway::shell::{quote_posix, Interpreter};
use tempfile::TempDir;

fn handler() -> LocalHandler {
    LocalHandler::new(ServerConfig::localhost(), HandlerSettings::default())
}

fn scratch() -> (TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_string_lossy().into_owned();
    (dir, path)
}

async fn read(handler: &LocalHandler, path: &str) -> String {
    handler.read_file(path, ReadOptions::default()).await.unwrap().content
}

fn touch(dir: &TempDir, name: &str, modified_secs: u64) {
    let path = dir.path().join(name);
    std::fs::write(&path, name).unwrap();
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(std::time::UNIX_EPOCH + Duration::from_secs(modified_secs))
        .unwrap();
}

#[tokio::test]
async fn echo_captures_stdout() {
    let out = handler()
        .execute_command("echo hello", ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(out.stdout, "hello\n");
    assert_eq!(out.stderr, "");
    assert_eq!(out.exit_code, Some(0));
}

#[tokio::test]
async fn non_zero_exit_is_a_result() {
    let out = handler()
        .execute_command("echo oops >&2; exit 3", ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(out.exit_code, Some(3));
    assert_eq!(out.stderr, "oops\n");
    assert!(!out.success());
}

#[tokio::test]
async fn slow_command_times_out() {
    let err = handler()
        .execute_command(
            "sleep 5",
            ExecOptions::default().with_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::CommandTimedOut(200)));
}

#[tokio::test]
async fn timeout_stops_processes_started_by_the_command() {
    let (dir, _path) = scratch();
    let nested = dir.path().join("nested");
    let background = dir.path().join("background");

    let commands = [
        format!("bash -c {}", quote_posix(&format!("sleep 1; touch {}", quote_posix(&nested.to_string_lossy())))),
        format!("(sleep 1; touch {}) & sleep 5", quote_posix(&background.to_string_lossy())),
    ];
    for command in &commands {
        let err = handler()
            .execute_command(
                command,
                ExecOptions::default().with_timeout(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::CommandTimedOut(200)), "{}", command);
    }

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!nested.exists());
    assert!(!background.exists());
}

#[tokio::test]
async fn bash_code_runs_from_a_script_file() {
    let (dir, path) = scratch();
    let code = "name='gateway'\nprintf '%s %s\\n' \"$name\" \"$(basename \"$PWD\")\"\nexit 2\n";

    let out = handler()
        .execute_code(code, Interpreter::Bash, ExecOptions::default().in_directory(path))
        .await
        .unwrap();
    let folder = dir.path().file_name().unwrap().to_string_lossy().into_owned();
    assert_eq!(out.stdout, format!("gateway {}\n", folder));
    assert_eq!(out.exit_code, Some(2));

    let leftovers = std::fs::read_dir(std::env::temp_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.starts_with("exec_") && std::fs::read_to_string(e.path()).is_ok_and(|c| c == code)
        })
        .count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn python_code_runs_when_available() {
    let available = tokio::process::Command::new("python3")
        .arg("--version")
        .output()
        .await
        .is_ok_and(|out| out.status.success());
    if !available {
        return;
    }

    let code = "import sys\nfor i in range(3):\n    print(i * i)\nsys.exit(0)\n";
    let out = handler()
        .execute_code(code, Interpreter::Python, ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(out.stdout, "0\n1\n4\n");
    assert!(out.success());
}

#[tokio::test]
async fn command_runs_in_requested_directory() {
    let (dir, path) = scratch();
    touch(&dir, "marker", 1_000);
    let out = handler()
        .execute_command("ls", ExecOptions::default().in_directory(path))
        .await
        .unwrap();
    assert_eq!(out.stdout, "marker\n");
}

#[tokio::test]
async fn output_is_paged_by_lines() {
    let out = handler()
        .execute_command("printf 'a\\nb\\nc\\nd\\ne'", ExecOptions::default().paged(2))
        .await
        .unwrap();
    assert_eq!(out.total_pages, Some(3));
    assert_eq!(
        out.pages.unwrap(),
        vec!["a\nb".to_string(), "c\nd".to_string(), "e".to_string()]
    );
}

#[tokio::test]
async fn listing_pages_by_filename() {
    let (dir, path) = scratch();
    for name in ["c", "a", "b"] {
        touch(&dir, name, 1_000);
    }
    std::fs::create_dir(dir.path().join("subdir")).unwrap();

    let handler = handler();
    let first = handler
        .list_files(ListRequest::new(path.clone()).with_page(2, 0))
        .await
        .unwrap();
    assert_eq!(first.items, vec!["a", "b"]);
    assert_eq!(first.total, 3);
    assert_eq!(first.total_pages, 2);

    let second = handler
        .list_files(ListRequest::new(path).with_page(2, 2))
        .await
        .unwrap();
    assert_eq!(second.items, vec!["c"]);
    assert_ne!(first.response_id, second.response_id);
}

#[tokio::test]
async fn listing_by_datetime_is_newest_first() {
    let (dir, path) = scratch();
    touch(&dir, "old", 1_000);
    touch(&dir, "new", 3_000);
    touch(&dir, "mid", 2_000);

    let listing = handler()
        .list_files(ListRequest::new(path).ordered_by(OrderBy::Datetime))
        .await
        .unwrap();
    assert_eq!(listing.items, vec!["new", "mid", "old"]);
}

#[tokio::test]
async fn listing_missing_directory_fails() {
    let result = handler()
        .list_files(ListRequest::new("/definitely/not/here"))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn create_with_backup_keeps_previous_content() {
    let (dir, path) = scratch();
    let handler = handler();

    assert!(handler.create_file(&path, "app.conf", "v1", false).await);
    assert!(handler.create_file(&path, "app.conf", "v2", true).await);

    let current = read(&handler, &format!("{}/app.conf", path)).await;
    assert_eq!(current, "v2");

    let backups: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("app.conf.") && name.ends_with(".bak"))
        .collect();
    assert_eq!(backups.len(), 1);
    assert_eq!(
        std::fs::read_to_string(dir.path().join(&backups[0])).unwrap(),
        "v1"
    );
}

#[tokio::test]
async fn update_replaces_every_match() {
    let (dir, path) = scratch();
    let file = format!("{}/hosts", path);
    std::fs::write(dir.path().join("hosts"), "port=80\nadmin_port=8080\n").unwrap();

    let handler = handler();
    assert!(handler.update_file(&file, r"port=(\d+)", "port=[$1]", false).await);
    assert_eq!(
        read(&handler, &file).await,
        "port=[80]\nadmin_port=[8080]\n"
    );
}

#[tokio::test]
async fn literal_update_ignores_regex_syntax() {
    let (dir, path) = scratch();
    let file = format!("{}/price", path);
    std::fs::write(dir.path().join("price"), "cost: 1.5 (USD)").unwrap();

    let handler = handler();
    assert!(handler.update_file_literal(&file, "1.5 (USD)", "$2", false).await);
    assert_eq!(read(&handler, &file).await, "cost: $2");
}

#[tokio::test]
async fn invalid_pattern_leaves_file_untouched() {
    let (dir, path) = scratch();
    let file = format!("{}/data", path);
    std::fs::write(dir.path().join("data"), "keep").unwrap();

    assert!(!handler().update_file(&file, "(unclosed", "x", false).await);
    assert_eq!(std::fs::read_to_string(dir.path().join("data")).unwrap(), "keep");
}

#[tokio::test]
async fn amend_appends_and_requires_existing_file() {
    let (dir, path) = scratch();
    let file = format!("{}/log", path);
    let handler = handler();

    assert!(!handler.amend_file(&file, "first").await);
    assert!(!dir.path().join("log").exists());

    std::fs::write(dir.path().join("log"), "a\n").unwrap();
    assert!(handler.amend_file(&file, "b\n").await);
    assert_eq!(read(&handler, &file).await, "a\nb\n");
}

#[tokio::test]
async fn amend_creates_file_when_configured() {
    let (dir, path) = scratch();
    let handler = LocalHandler::new(
        ServerConfig::localhost().with_create_if_missing(true),
        HandlerSettings::default(),
    );
    assert!(handler.amend_file(&format!("{}/new", path), "x").await);
    assert_eq!(std::fs::read_to_string(dir.path().join("new")).unwrap(), "x");
}

#[tokio::test]
async fn read_missing_file_fails() {
    assert!(handler()
        .read_file("/definitely/not/here.txt", ReadOptions::default())
        .await
        .is_err());
}

#[tokio::test]
async fn read_selects_lines_and_caps_bytes() {
    let (dir, path) = scratch();
    let file = format!("{}/big.log", path);
    let lines: String = (1..=1000).map(|i| format!("line {}\n", i)).collect();
    std::fs::write(dir.path().join("big.log"), &lines).unwrap();
    let handler = handler();

    let range = handler
        .read_file(&file, ReadOptions::default().lines(Some(10), Some(12)))
        .await
        .unwrap();
    assert_eq!(range.content, "line 10\nline 11\nline 12\n");
    assert!(!range.truncated);

    let capped = handler
        .read_file(&file, ReadOptions::default().with_max_bytes(64))
        .await
        .unwrap();
    assert_eq!(capped.content.len(), 64);
    assert!(lines.starts_with(&capped.content));
    assert!(capped.truncated);

    let err = handler
        .read_file(&file, ReadOptions::default().lines(Some(5), Some(4)))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidParams(_)));
}

#[tokio::test]
async fn system_info_reports_linux_facts() {
    let info = handler().get_system_info().await;
    assert!(!info.home_folder.is_empty());
    assert!(!info.architecture.is_empty());
    if cfg!(target_os = "linux") {
        assert_eq!(info.os_type, "Linux");
        assert!(info.total_memory > 0);
    }
}
