//! End-to-end command-line interception: the real server binary, a shim
//! directory, and a journalled `echo` invocation replayed with no real
//! command run.

use std::path::PathBuf;
use std::process::Command;

use capturemock::driver::{DriverOptions, ServerDriver};

fn server_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_capturemock"))
}

#[tokio::test]
async fn replayed_echo_prints_stdout_and_exits_zero() {
    // Arrange - a journal with one recorded echo invocation
    let dir = tempfile::tempdir().unwrap();
    let replay_path = dir.path().join("replay.journal");
    std::fs::write(&replay_path, "<-CMD:echo hello\n->OUT:hello\n\n->EXC:0\n").unwrap();
    let rc_path = dir.path().join("test.rc");
    std::fs::write(&rc_path, "[command line]\nintercepts = echo\n").unwrap();
    let intercept_dir = dir.path().join("intercepts");

    let driver_options = DriverOptions {
        mode: 0,
        rc_files: vec![rc_path],
        replay_file: Some(replay_path),
        server_binary: Some(server_binary()),
        ..DriverOptions::default()
    };
    let driver = start_with_intercepts(&driver_options, &intercept_dir);

    // Act - run the shim the way a SUT would
    let output = Command::new(intercept_dir.join("echo"))
        .arg("hello")
        .env("CAPTUREMOCK_SERVER", driver.address())
        .output()
        .expect("failed to run the echo shim");

    // Assert
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hello\n");
    assert_eq!(String::from_utf8_lossy(&output.stderr), "");
    assert_eq!(output.status.code(), Some(0));

    driver.stop().await.unwrap();
}

#[tokio::test]
async fn mismatched_command_fails_with_marked_stderr() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let replay_path = dir.path().join("replay.journal");
    std::fs::write(&replay_path, "<-CMD:echo hello\n->OUT:hello\n\n->EXC:0\n").unwrap();
    let rc_path = dir.path().join("test.rc");
    std::fs::write(
        &rc_path,
        "[general]\nuse_exact_matching = true\n[command line]\nintercepts = echo\n",
    )
    .unwrap();
    let intercept_dir = dir.path().join("intercepts");

    let driver_options = DriverOptions {
        mode: 0,
        rc_files: vec![rc_path],
        replay_file: Some(replay_path),
        server_binary: Some(server_binary()),
        ..DriverOptions::default()
    };
    let driver = start_with_intercepts(&driver_options, &intercept_dir);

    // Act - an argv that was never recorded, with exact matching on
    let output = Command::new(intercept_dir.join("echo"))
        .arg("goodbye")
        .env("CAPTUREMOCK_SERVER", driver.address())
        .output()
        .expect("failed to run the echo shim");

    // Assert - the shim prefixes stderr with the fixed marker and fails
    assert!(String::from_utf8_lossy(&output.stderr).starts_with("CAPTUREMOCK MISMATCH"));
    assert_ne!(output.status.code(), Some(0));

    driver.stop().await.unwrap();
}

/// Spawn the server with `-i` so it populates the shim directory itself.
fn start_with_intercepts(options: &DriverOptions, intercept_dir: &std::path::Path) -> ServerDriver {
    let mut options = options.clone();
    // the driver does not know about shim directories; pass -i through the
    // binary's own CLI by wrapping the rc file set
    options.extra_args = vec![
        "-i".to_string(),
        intercept_dir.display().to_string(),
    ];
    ServerDriver::start(options).expect("failed to start the capture server")
}
