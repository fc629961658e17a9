use eventkit::{ExecFlags, ExecState, Process};

use std::time::{Duration, Instant};

#[test]
fn test_sync_exec_captures_output_and_exit_code() {
    let process = Process::new();
    let state = process.exec(
        "/bin/sh",
        &["-c", "echo out; echo err 1>&2; exit 3"],
        Some(Duration::from_secs(5)),
        ExecFlags::empty(),
    );

    assert_eq!(state, ExecState::Done);
    assert!(process.read_all_stdout().starts_with(b"out\n"));
    assert!(process.read_all_stderr().starts_with(b"err\n"));
    assert_eq!(process.return_code(), Some(3));
    assert_eq!(process.pid(), -1);
}

#[test]
fn test_sync_exec_timeout_terminates_the_child() {
    let process = Process::new();
    let start = Instant::now();
    let state = process.exec(
        "/bin/sh",
        &["-c", "sleep 10"],
        Some(Duration::from_millis(100)),
        ExecFlags::empty(),
    );

    assert_eq!(state, ExecState::TimedOut);
    assert!(start.elapsed() < Duration::from_secs(5));

    // SIGTERM was sent on the way out; the reaper observes the exit shortly
    // after.
    let deadline = Instant::now() + Duration::from_secs(5);
    while process.return_code().is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(process.return_code(), Some(-1));
    assert_eq!(process.pid(), -1);
}

#[test]
fn test_stdin_round_trip_through_cat() {
    let data = b"hello stdin\nsecond line\n";
    let process = Process::new();
    process.write(data);

    let state = process.exec("/bin/cat", &[], Some(Duration::from_secs(5)), ExecFlags::empty());

    assert_eq!(state, ExecState::Done);
    assert_eq!(process.read_all_stdout(), data.to_vec());
    assert_eq!(process.return_code(), Some(0));
}

#[test]
fn test_unknown_command_reports_error() {
    let process = Process::new();
    let state = process.exec(
        "definitely-not-a-real-command-eventkit",
        &[],
        Some(Duration::from_secs(5)),
        ExecFlags::empty(),
    );

    assert_eq!(state, ExecState::Error);
    assert!(process.error_string().contains("not found"));
    assert_eq!(process.pid(), -1);
}

#[test]
fn test_cwd_is_applied_to_the_child() {
    let process = Process::new();
    process.set_cwd("/tmp");
    let state = process.exec("/bin/sh", &["-c", "pwd"], Some(Duration::from_secs(5)), ExecFlags::empty());

    assert_eq!(state, ExecState::Done);
    let stdout = process.read_all_stdout();
    let stdout = String::from_utf8_lossy(&stdout);
    assert!(stdout.starts_with("/tmp"), "unexpected cwd: {}", stdout);
}

#[test]
fn test_explicit_environment_reaches_the_child() {
    let process = Process::new();
    let state = process.exec_env(
        "/bin/sh",
        &["-c", "echo $EVENTKIT_TEST_VAR"],
        &["EVENTKIT_TEST_VAR=marker", "PATH=/usr/bin:/bin"],
        Some(Duration::from_secs(5)),
        ExecFlags::empty(),
    );

    assert_eq!(state, ExecState::Done);
    assert!(process.read_all_stdout().starts_with(b"marker\n"));
}

#[test]
fn test_large_output_is_capped_with_data_dropped() {
    const CAP: usize = 16 * 1024 * 1024;

    let process = Process::new();
    let state = process.exec(
        "/bin/sh",
        &["-c", "head -c 20000000 /dev/zero"],
        Some(Duration::from_secs(30)),
        ExecFlags::empty(),
    );

    assert_eq!(state, ExecState::Done);
    let stdout = process.read_all_stdout();
    assert!(
        stdout.len() <= CAP + 1024,
        "buffer exceeded its cap: {} bytes",
        stdout.len()
    );
    assert!(!stdout.is_empty());
}
