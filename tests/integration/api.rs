#[path = "common/mod.rs"]
mod common;

use std::os::unix::fs::PermissionsExt;
use std::thread;
use std::time::Duration;

use assert_cmd::Command as TestCommand;
use finix::api::{self, ApiServer, Command, ConnStatus, Frame};
use predicates::str::contains;
use tempfile::tempdir;

#[test]
fn control_socket_is_mode_0600() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("control.sock");
    let _server = ApiServer::bind(&path).unwrap();

    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn server_answers_one_request_per_connection() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("control.sock");
    let mut server = ApiServer::bind(&path).unwrap();

    let client_path = path.clone();
    let client = thread::spawn(move || {
        api::send_request(&client_path, &Frame::with_text(Command::Start, "ntpd"))
    });

    // Nonblocking server side: poll until the connection and frame arrive.
    let mut token = None;
    for _ in 0..250 {
        if token.is_none() {
            let mut accepted = server.accept(|| 42);
            if let Some((tok, _fd)) = accepted.pop() {
                token = Some(tok);
            }
        }
        if let Some(tok) = token
            && let Ok(Some(frame)) = server.read_request(tok)
        {
            assert_eq!(frame.cmd, Command::Start);
            assert_eq!(frame.text(), "ntpd");
            server.queue(tok, &[Frame::new(Command::Ack)]);
            assert_eq!(server.flush(tok).unwrap(), ConnStatus::Done);
            server.close(tok);
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    let frames = client.join().unwrap().unwrap();
    assert!(frames.is_empty());
}

#[test]
fn stale_socket_is_replaced_on_bind() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("control.sock");
    drop(ApiServer::bind(&path).unwrap());
    // A second bind over the leftover inode must succeed.
    let _server = ApiServer::bind(&path).unwrap();
}

#[test]
fn ctl_reports_transport_failure_as_exit_2() {
    let dir = tempdir().unwrap();
    TestCommand::cargo_bin("finixctl")
        .unwrap()
        .args(["--rundir"])
        .arg(dir.path())
        .arg("reload")
        .assert()
        .code(2)
        .stderr(contains("control socket not available"));
}

#[test]
fn ctl_status_renders_a_header_even_when_empty() {
    // No supervisor: transport failure, but the argument parsing and
    // subcommand wiring still hold.
    let dir = tempdir().unwrap();
    TestCommand::cargo_bin("finixctl")
        .unwrap()
        .args(["--rundir"])
        .arg(dir.path())
        .args(["status", "--json"])
        .assert()
        .code(2);
}
