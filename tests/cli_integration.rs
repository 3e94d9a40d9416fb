// CLI integration tests for flag validation and error rendering.
use std::process::Command;

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_atomstock");
    Command::new(exe)
}

fn stderr_text(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn missing_save_file_is_rejected() {
    let output = cmd().args(["-T", "5555"]).output().expect("run");
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr_text(&output).contains("--save-file"));
}

#[test]
fn no_endpoint_is_a_usage_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let save = temp.path().join("atoms.bin");
    let output = cmd()
        .args(["-f", save.to_str().unwrap()])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(2));
    let stderr = stderr_text(&output);
    assert!(stderr.contains("atomstock: Usage: no endpoints configured"));
    assert!(stderr.contains("hint: Pass at least one of --tcp-port"));
}

#[test]
fn equal_tcp_and_udp_ports_are_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let save = temp.path().join("atoms.bin");
    let output = cmd()
        .args(["-T", "5555", "-U", "5555", "-f", save.to_str().unwrap()])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr_text(&output).contains("TCP and UDP ports must be different"));
}

#[test]
fn oversized_initial_counters_are_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let save = temp.path().join("atoms.bin");
    let output = cmd()
        .args([
            "-T",
            "5555",
            "-f",
            save.to_str().unwrap(),
            "-c",
            "1000000000000000001",
        ])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(2));
    let stderr = stderr_text(&output);
    assert!(stderr.contains("initial atom counts exceed the storage limit"));
    assert!(stderr.contains("1000000000000000000"));
}

#[test]
fn zero_timeout_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let save = temp.path().join("atoms.bin");
    let output = cmd()
        .args(["-T", "5555", "-f", save.to_str().unwrap(), "-t", "0"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr_text(&output).contains("--timeout must be greater than zero"));
}

#[test]
fn usage_errors_do_not_create_the_save_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let save = temp.path().join("atoms.bin");
    let output = cmd()
        .args(["-f", save.to_str().unwrap()])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(2));
    assert!(!save.exists());
}

#[test]
fn help_lists_every_flag() {
    let output = cmd().arg("--help").output().expect("run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for flag in [
        "--tcp-port",
        "--udp-port",
        "--stream-path",
        "--datagram-path",
        "--save-file",
        "--carbon",
        "--oxygen",
        "--hydrogen",
        "--timeout",
    ] {
        assert!(stdout.contains(flag), "help is missing {flag}");
    }
}

#[test]
fn client_requires_exactly_one_transport() {
    let exe = env!("CARGO_BIN_EXE_atomstock-client");
    let output = Command::new(exe).output().expect("run");
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no transport selected"));
    assert!(stderr.contains("--datagram"));

    let output = Command::new(exe)
        .args(["--tcp", "127.0.0.1:5555", "--udp", "127.0.0.1:5556"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("multiple transports selected"));
}
