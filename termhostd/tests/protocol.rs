//! Integration coverage for the handshake, session lifecycle, and startup
//! scenarios. Grounded on the teacher's `tests/attach.rs`/`tests/daemon.rs`
//! style of driving a real daemon subprocess end to end.

mod support;

use std::{os::unix::net::UnixStream, time::Duration};

use ntest::timeout;

use support::{client::Client, daemon::Proc, wait_until};

fn test_config() -> &'static str {
    r#"
    scrollback_lines = 200
    spawn_concurrency = 3
    shell = "/bin/sh"
    "#
}

#[test]
#[timeout(30000)]
fn e1_handshake_then_empty_list() -> anyhow::Result<()> {
    let daemon = Proc::new(test_config())?;
    let mut control = Client::connect(&daemon)?;

    let hello = control.hello(&daemon, "c1", "control")?;
    assert_eq!(hello["ok"], true);
    assert_eq!(hello["payload"]["protocolVersion"], 1);
    assert_eq!(hello["payload"]["daemonVersion"], "1.0.0");

    let resp = control.request("listSessions", serde_json::json!({}))?;
    assert_eq!(resp["ok"], true);
    assert_eq!(resp["payload"]["sessions"], serde_json::json!([]));

    Ok(())
}

#[test]
#[timeout(30000)]
fn e2_create_session() -> anyhow::Result<()> {
    let daemon = Proc::new(test_config())?;
    let mut control = Client::connect(&daemon)?;
    let mut stream = Client::connect(&daemon)?;

    control.hello(&daemon, "c1", "control")?;
    stream.hello(&daemon, "c1", "stream")?;

    let resp = control.request(
        "createOrAttach",
        serde_json::json!({
            "sessionId": "s1",
            "workspaceId": "w",
            "paneId": "p",
            "tabId": "t",
            "cols": 80,
            "rows": 24,
            "cwd": "/tmp",
        }),
    )?;

    assert_eq!(resp["ok"], true);
    assert_eq!(resp["payload"]["isNew"], true);
    assert!(resp["payload"]["pid"].as_i64().unwrap() > 0);
    assert_eq!(resp["payload"]["snapshot"]["cols"], 80);
    assert_eq!(resp["payload"]["snapshot"]["rows"], 24);

    Ok(())
}

#[test]
#[timeout(30000)]
fn e3_reattach_reports_recovered_not_new() -> anyhow::Result<()> {
    let daemon = Proc::new(test_config())?;
    let mut control = Client::connect(&daemon)?;
    let mut stream = Client::connect(&daemon)?;

    control.hello(&daemon, "c1", "control")?;
    stream.hello(&daemon, "c1", "stream")?;

    let create_payload = serde_json::json!({
        "sessionId": "s1",
        "cols": 80,
        "rows": 24,
    });
    control.request("createOrAttach", create_payload.clone())?;

    let reattach = control.request("createOrAttach", create_payload)?;
    assert_eq!(reattach["ok"], true);
    assert_eq!(reattach["payload"]["isNew"], false);
    assert_eq!(reattach["payload"]["wasRecovered"], true);

    Ok(())
}

/// E4: a stream socket that never reads must not stall a control request
/// against a different session on the same connection's dispatcher.
#[test]
#[timeout(30000)]
fn e4_backpressure_isolation() -> anyhow::Result<()> {
    let daemon = Proc::new(test_config())?;
    let mut control = Client::connect(&daemon)?;
    let mut stream = Client::connect(&daemon)?;

    control.hello(&daemon, "c1", "control")?;
    stream.hello(&daemon, "c1", "stream")?;
    // Never read from `stream` again -- its socket buffer will eventually
    // fill, but that must not back up onto unrelated control traffic.

    control.notify_write("does-not-exist", &"x".repeat(64 * 1024))?;

    let start = std::time::Instant::now();
    let resp = control.request(
        "createOrAttach",
        serde_json::json!({ "sessionId": "s2", "cols": 80, "rows": 24 }),
    )?;
    assert!(start.elapsed() < Duration::from_secs(3));
    assert_eq!(resp["ok"], true);

    Ok(())
}

/// E5: once a session has zero attached clients, an exit is broadcast to
/// every stream socket rather than being silently dropped.
#[test]
#[timeout(30000)]
fn e5_kill_broadcasts_exit_when_unattached() -> anyhow::Result<()> {
    let daemon = Proc::new(test_config())?;
    let mut control_a = Client::connect(&daemon)?;
    let mut stream_a = Client::connect(&daemon)?;
    let mut stream_b = Client::connect(&daemon)?;

    control_a.hello(&daemon, "a", "control")?;
    stream_a.hello(&daemon, "a", "stream")?;
    stream_b.hello(&daemon, "b", "stream")?;

    control_a.request(
        "createOrAttach",
        serde_json::json!({ "sessionId": "s1", "cols": 80, "rows": 24 }),
    )?;
    control_a.request("detach", serde_json::json!({ "sessionId": "s1" }))?;

    control_a.request("kill", serde_json::json!({ "sessionId": "s1" }))?;

    // b never attached to s1, but is still a valid stream socket and should
    // receive the unattached-exit broadcast.
    let event = stream_b.recv_raw()?;
    assert_eq!(event["type"], "event");
    assert_eq!(event["event"], "exit");
    assert_eq!(event["sessionId"], "s1");

    Ok(())
}

#[test]
#[timeout(30000)]
fn protocol_mismatch_does_not_authenticate_the_connection() -> anyhow::Result<()> {
    let daemon = Proc::new(test_config())?;
    let mut control = Client::connect(&daemon)?;

    control.send_raw(&serde_json::json!({
        "id": "bad_version",
        "type": "hello",
        "payload": {
            "protocolVersion": 999,
            "token": daemon.token,
            "clientId": "c1",
            "role": "control",
        }
    }))?;
    let resp = control.recv_raw()?;
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "PROTOCOL_MISMATCH");

    // The connection never authenticated, so a subsequent request is
    // rejected rather than dispatched.
    let resp2 = control.request("listSessions", serde_json::json!({}))?;
    assert_eq!(resp2["ok"], false);
    assert_eq!(resp2["error"]["code"], "NOT_AUTHENTICATED");

    Ok(())
}

#[test]
#[timeout(30000)]
fn bad_token_is_rejected() -> anyhow::Result<()> {
    let daemon = Proc::new(test_config())?;
    let mut control = Client::connect(&daemon)?;

    control.send_raw(&serde_json::json!({
        "id": "bad_token",
        "type": "hello",
        "payload": {
            "protocolVersion": 1,
            "token": "not-the-real-token",
            "clientId": "c1",
            "role": "control",
        }
    }))?;
    let resp = control.recv_raw()?;
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "AUTH_FAILED");

    Ok(())
}

#[test]
#[timeout(30000)]
fn kill_is_idempotent() -> anyhow::Result<()> {
    let daemon = Proc::new(test_config())?;
    let mut control = Client::connect(&daemon)?;
    let mut stream = Client::connect(&daemon)?;
    control.hello(&daemon, "c1", "control")?;
    stream.hello(&daemon, "c1", "stream")?;

    control.request("createOrAttach", serde_json::json!({ "sessionId": "s1", "cols": 80, "rows": 24 }))?;

    let first = control.request("kill", serde_json::json!({ "sessionId": "s1" }))?;
    assert_eq!(first["ok"], true);
    let second = control.request("kill", serde_json::json!({ "sessionId": "s1" }))?;
    assert_eq!(second["ok"], true);

    Ok(())
}

#[test]
#[timeout(30000)]
fn resize_then_list_sessions_is_consistent() -> anyhow::Result<()> {
    let daemon = Proc::new(test_config())?;
    let mut control = Client::connect(&daemon)?;
    let mut stream = Client::connect(&daemon)?;
    control.hello(&daemon, "c1", "control")?;
    stream.hello(&daemon, "c1", "stream")?;

    control.request("createOrAttach", serde_json::json!({ "sessionId": "s1", "cols": 80, "rows": 24 }))?;
    let resize = control.request(
        "resize",
        serde_json::json!({ "sessionId": "s1", "cols": 120, "rows": 40 }),
    )?;
    assert_eq!(resize["ok"], true);

    let listed = control.request("listSessions", serde_json::json!({}))?;
    let sessions = listed["payload"]["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["sessionId"], "s1");
    assert_eq!(sessions[0]["attachedClients"], 1);

    Ok(())
}

#[test]
#[timeout(30000)]
fn e6_stale_socket_file_is_reclaimed_on_startup() -> anyhow::Result<()> {
    let mut daemon = Proc::new(test_config())?;
    let sock_path = daemon.socket_path.clone();
    let dir = daemon.dir.clone();

    // A hard kill leaves the socket file behind, simulating an unclean
    // shutdown -- unlike a graceful shutdown, nothing unlinks it.
    daemon.hard_kill();
    wait_until(|| Ok(UnixStream::connect(&sock_path).is_err()))?;
    assert!(sock_path.exists(), "expected the socket file to remain after a hard kill");

    // A fresh daemon pointed at the same runtime dir should reclaim the
    // stale socket rather than refusing to start.
    let daemon2 = Proc::new_in_existing_dir(&dir, test_config())?;
    let mut control = Client::connect(&daemon2)?;
    let resp = control.hello(&daemon2, "c1", "control")?;
    assert_eq!(resp["ok"], true);

    Ok(())
}

#[test]
#[timeout(30000)]
fn unknown_request_type_is_rejected_without_crashing_connection() -> anyhow::Result<()> {
    let daemon = Proc::new(test_config())?;
    let mut control = Client::connect(&daemon)?;
    control.hello(&daemon, "c1", "control")?;

    let resp = control.request("notARealRequest", serde_json::json!({}))?;
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "UNKNOWN_REQUEST");

    // The connection is still usable afterwards.
    let resp2 = control.request("listSessions", serde_json::json!({}))?;
    assert_eq!(resp2["ok"], true);

    Ok(())
}
