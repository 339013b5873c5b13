use std::{
    fs,
    process::{Command, Output, Stdio},
    time::{Duration, Instant},
};

use pretty_assertions::assert_eq;
use reaper::{
    pidfile::read_pid,
    posix::{Pid, Signal, process},
};

fn reaper(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_reaper"))
        .args(args)
        .env_remove("REAPER_PID_FILE")
        .env_remove("REAPER_LOG_FILE")
        .output()
        .unwrap()
}

#[test_log::test]
fn run_exits_with_program_status() {
    let output = reaper(&["run", "--", "sh", "-c", "exit 3"]);
    assert_eq!(output.status.code(), Some(3));
}

#[test_log::test]
fn run_maps_signal_death_to_128_plus_signo() {
    let output = reaper(&["run", "--", "sh", "-c", "kill -TERM $$"]);
    assert_eq!(output.status.code(), Some(143));
}

#[test_log::test]
fn sigterm_to_reaper_is_forwarded_to_program() {
    let dir = tempfile::tempdir().unwrap();
    let started = dir.path().join("started");
    let script = format!("touch {} && exec sleep 30", started.display());

    let child = Command::new(env!("CARGO_BIN_EXE_reaper"))
        .args(["run", "--", "sh", "-c", &script])
        .env_remove("REAPER_PID_FILE")
        .env_remove("REAPER_LOG_FILE")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while !started.exists() {
        assert!(Instant::now() < deadline, "program never started");
        std::thread::sleep(Duration::from_millis(20));
    }

    let pid = Pid::from_raw(i32::try_from(child.id()).unwrap());
    process::kill(pid, Signal::SIGTERM).unwrap();

    let output = child.wait_with_output().unwrap();
    assert_eq!(output.status.code(), Some(143));
}

#[test_log::test]
fn run_passes_through_program_output() {
    let output = reaper(&["run", "--", "echo", "-n", "hello"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hello");
}

#[test_log::test]
fn run_with_unknown_user_fails_before_starting_program() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("started");

    let output = reaper(&[
        "run",
        "--user",
        "reaper-no-such-user",
        "--",
        "touch",
        marker.to_str().unwrap(),
    ]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown user"));
    assert!(!marker.exists());
}

#[test_log::test]
fn run_writes_and_removes_pid_file() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("reaper.pid");
    let seen = dir.path().join("seen");

    let script = format!(
        "cat {} > {}",
        pid_file.display(),
        seen.display()
    );
    let output = reaper(&[
        "run",
        "--pid-file",
        pid_file.to_str().unwrap(),
        "--",
        "sh",
        "-c",
        &script,
    ]);

    assert!(output.status.success());
    assert!(read_pid(&seen).unwrap().is_some());
    assert!(!pid_file.exists());
}

#[test_log::test]
fn daemonized_run_returns_once_ready() {
    let dir = tempfile::tempdir().unwrap();
    let log_file = dir.path().join("daemon.log");
    let pid_file = dir.path().join("daemon.pid");

    let output = reaper(&[
        "run",
        "--daemonize",
        "--log-file",
        log_file.to_str().unwrap(),
        "--pid-file",
        pid_file.to_str().unwrap(),
        "--",
        "sh",
        "-c",
        "echo from-daemon",
    ]);
    assert!(output.status.success());

    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        let logged = fs::read_to_string(&log_file)
            .is_ok_and(|x| x.contains("from-daemon"));
        if logged && !pid_file.exists() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("daemon did not run the program and clean up");
}

#[test_log::test]
fn lookup_prints_records_as_json() {
    let output = reaper(&["lookup", "user", "root"]);
    assert!(output.status.success());

    let record: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(record["name"], "root");
    assert_eq!(record["uid"], 0);

    let output = reaper(&["lookup", "group", "root"]);
    assert!(output.status.success());
    let record: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(record["gid"], 0);
}

#[test_log::test]
fn lookup_of_unknown_name_fails() {
    let output = reaper(&["lookup", "group", "reaper-no-such-group"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
}

#[test_log::test]
fn ids_reports_the_reaper_process() {
    let output = reaper(&["ids"]);
    assert!(output.status.success());

    let ids: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(ids["ppid"], i64::from(std::process::id()));
    assert!(ids["pid"].as_i64().unwrap() > 0);
    assert!(ids["euid"].is_u64());
}
