//! # Supervisor Tests
//!
//! Start-up failures exercised with shell scripts in place of the sandbox binary.

mod helpers;

use helpers::{fake_config, fake_sandbox_with, pid_file};
use near_testbed::{ErrorKind, ProcessError, SandboxConfig, Session};
use nix::{errno::Errno, sys::signal::kill, unistd::Pid};
use std::{
    fs,
    net::TcpListener,
    time::{Duration, Instant},
};
use tempfile::TempDir;

#[test]
fn test_occupied_port_fails_without_spawning() {
    let dir = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let started = Instant::now();
    let err = Session::start(fake_config(&dir, "exec sleep 30").with_rpc_port(port)).unwrap_err();

    assert!(matches!(err.kind(), ErrorKind::Process(ProcessError::PortConflict { port: p }) if *p == port));
    assert_eq!(err.operation, "start");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!dir.path().join("home/pid").exists());
}

#[test]
fn test_startup_timeout_leaves_no_orphan() {
    let dir = TempDir::new().unwrap();
    let err = Session::start(fake_config(&dir, "exec sleep 30")).unwrap_err();

    assert!(matches!(err.kind(), ErrorKind::Process(ProcessError::StartupTimeout { .. })));
    let pid = pid_file(&dir.path().join("home"));
    assert_eq!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH));
}

#[test]
fn test_init_and_readiness_share_one_startup_budget() {
    let dir = TempDir::new().unwrap();
    let config = SandboxConfig::default()
        .with_binary(fake_sandbox_with(&dir, "sleep 1", "exec sleep 30"))
        .with_home_dir(dir.path().join("home"))
        .with_startup_timeout(Duration::from_secs(2))
        .with_stop_grace_period(Duration::from_millis(200));

    let started = Instant::now();
    let err = Session::start(config).unwrap_err();

    assert!(matches!(err.kind(), ErrorKind::Process(ProcessError::StartupTimeout { .. })));
    // A fresh budget after init would take at least three seconds.
    assert!(started.elapsed() < Duration::from_millis(2800), "took {:?}", started.elapsed());
    let pid = pid_file(&dir.path().join("home"));
    assert_eq!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH));
}

#[test]
fn test_slow_init_alone_times_out() {
    let dir = TempDir::new().unwrap();
    let config = SandboxConfig::default()
        .with_binary(fake_sandbox_with(&dir, "sleep 5", "exec sleep 30"))
        .with_home_dir(dir.path().join("home"))
        .with_startup_timeout(Duration::from_secs(1));

    let started = Instant::now();
    let err = Session::start(config).unwrap_err();

    assert!(matches!(err.kind(), ErrorKind::Process(ProcessError::StartupTimeout { .. })));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!dir.path().join("home/pid").exists());
}

#[test]
fn test_early_exit_reports_log_tail() {
    let dir = TempDir::new().unwrap();
    let err = Session::start(fake_config(&dir, "echo 'genesis config is broken'\nexit 3")).unwrap_err();

    match err.kind() {
        ErrorKind::Process(ProcessError::UnexpectedExit { status, log_tail }) => {
            assert_eq!(status.code(), Some(3));
            assert!(log_tail.contains("genesis config is broken"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_failed_init_is_reported() {
    let dir = TempDir::new().unwrap();
    let binary = dir.path().join("broken-sandbox");
    fs::write(&binary, "#!/bin/sh\necho 'cannot init' >&2\nexit 2\n").unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
    }

    let config = SandboxConfig::default()
        .with_binary(&binary)
        .with_home_dir(dir.path().join("home"));
    let err = Session::start(config).unwrap_err();
    match err.kind() {
        ErrorKind::Process(ProcessError::InitFailed { stderr, .. }) => assert!(stderr.contains("cannot init")),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_missing_binary_is_a_spawn_error() {
    let dir = TempDir::new().unwrap();
    let config = SandboxConfig::default()
        .with_binary(dir.path().join("does-not-exist"))
        .with_home_dir(dir.path().join("home"));
    let err = Session::start(config).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Process(ProcessError::Spawn { .. })));
}
