//! C2 (Connection & Auth Registry) and C5 (Request Dispatcher). Grounded on
//! the teacher's `daemon::server::Server::serve`/`handle_conn` accept-loop
//! shape, adapted to a two-socket-per-client, NDJSON-framed protocol
//! instead of the teacher's single-socket, length-prefixed one.

use std::{
    collections::HashMap,
    io::{Read, Write},
    os::unix::net::{UnixListener, UnixStream},
    sync::{Arc, Mutex, Weak},
    thread,
};

use termhost_protocol::{
    CreateOrAttachPayload, ErrorBody, ErrorCode, EventKind, EventMessage, ExitPayload,
    HelloPayload, HelloResult, KillAllPayload, ListSessionsResult, ResizePayload, Role,
    SessionIdPayload, SignalPayload, WritePayload, PROTOCOL_VERSION,
};
use tracing::{info, instrument, warn};

use crate::{
    codec,
    consts,
    daemon::exit_notify::ExitStatus,
    daemon::host::{CreateOrAttachArgs, Host, UnattachedExitSink},
    daemon::session::StreamHandle,
};

/// Tracks the one live socket registered for each `(clientId, role)` pair so
/// a reconnect can evict the stale one, per §4.2.
#[derive(Default)]
struct ClientMap {
    control: Mutex<HashMap<String, Arc<Mutex<UnixStream>>>>,
    stream: Mutex<HashMap<String, Arc<StreamHandle>>>,
}

pub struct Server {
    host: Arc<Host>,
    token: String,
    daemon_pid: i32,
    clients: ClientMap,
}

impl UnattachedExitSink for Server {
    fn on_unattached_exit(&self, session_id: &str, status: Option<ExitStatus>) {
        let ExitStatus { code, signal } = status.unwrap_or(ExitStatus { code: None, signal: None });
        let payload = ExitPayload { exit_code: code, signal };
        let event = EventMessage::new(
            EventKind::Exit,
            session_id,
            serde_json::to_value(payload).expect("ExitPayload always serializes"),
        );
        self.broadcast_event(&event);
    }
}

impl Server {
    pub fn new(host: Arc<Host>, token: String) -> Arc<Server> {
        Arc::new(Server {
            host,
            token,
            daemon_pid: std::process::id() as i32,
            clients: ClientMap::default(),
        })
    }

    /// Delivers `event` to every currently registered stream socket. Used
    /// for the unattached-exit broadcast, where by definition the session
    /// has no attached clients to target directly.
    fn broadcast_event(&self, event: &EventMessage) {
        let Ok(line) = codec::encode_line(event) else { return };
        let targets: Vec<Arc<StreamHandle>> = self.clients.stream.lock().unwrap().values().cloned().collect();
        for handle in targets {
            let mut sock = handle.lock().unwrap();
            let _ = sock.write_all(&line);
        }
    }

    #[instrument(skip_all)]
    pub fn serve(server: Arc<Server>, listener: UnixListener) -> anyhow::Result<()> {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = server.clone();
                    thread::spawn(move || {
                        if let Err(e) = server.handle_conn(stream) {
                            warn!(error = %e, "connection handler exited with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accepting connection");
                }
            }
        }
        Ok(())
    }

    fn handle_conn(self: Arc<Self>, mut stream: UnixStream) -> anyhow::Result<()> {
        let mut decoder = codec::LineDecoder::new();
        let mut read_buf = [0u8; 4096];
        let mut client_id: Option<String> = None;
        let mut role: Option<Role> = None;
        let mut stream_handle: Option<Arc<StreamHandle>> = None;

        loop {
            let n = match stream.read(&mut read_buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "read error on connection");
                    break;
                }
            };

            for line in decoder.feed(&read_buf[..n]) {
                let Some(req) = codec::decode_request(&line) else { continue };

                if req.kind == "hello" {
                    match self.handle_hello(&req.id, &req.payload) {
                        Ok((resp_client_id, resp_role, resp_bytes)) => {
                            let _ = stream.write_all(&resp_bytes);
                            client_id = Some(resp_client_id.clone());
                            role = Some(resp_role);
                            if resp_role == Role::Stream {
                                if let Ok(cloned) = stream.try_clone() {
                                    let handle = Arc::new(Mutex::new(cloned));
                                    self.register_stream(&resp_client_id, &handle);
                                    stream_handle = Some(handle);
                                }
                            } else {
                                self.register_control(&resp_client_id, &stream);
                            }
                        }
                        Err(resp_bytes) => {
                            let _ = stream.write_all(&resp_bytes);
                        }
                    }
                    continue;
                }

                let (Some(cid), Some(r)) = (client_id.clone(), role) else {
                    let resp = error_response(&req.id, ErrorCode::NotAuthenticated, "not authenticated");
                    let _ = stream.write_all(&resp);
                    continue;
                };

                if r != Role::Control {
                    let resp = error_response(&req.id, ErrorCode::InvalidRole, "request requires control role");
                    let _ = stream.write_all(&resp);
                    continue;
                }

                if let Some(resp) = self.dispatch(&cid, &req) {
                    if stream.write_all(&resp).is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(cid) = client_id {
            self.on_disconnect(&cid, role, &stream_handle);
        }
        Ok(())
    }

    fn register_control(&self, client_id: &str, stream: &UnixStream) {
        let new_handle = match stream.try_clone() {
            Ok(s) => Arc::new(Mutex::new(s)),
            Err(_) => return,
        };
        let old = self.clients.control.lock().unwrap().insert(client_id.to_string(), new_handle);
        if let Some(old) = old {
            let _ = old.lock().unwrap().shutdown(std::net::Shutdown::Both);
        }
    }

    fn register_stream(&self, client_id: &str, handle: &Arc<StreamHandle>) {
        let old = self.clients.stream.lock().unwrap().insert(client_id.to_string(), handle.clone());
        if let Some(old) = old {
            self.host.detach_from_all_sessions(client_id);
            let _ = old.lock().unwrap().shutdown(std::net::Shutdown::Both);
        }
    }

    fn on_disconnect(&self, client_id: &str, role: Option<Role>, stream_handle: &Option<Arc<StreamHandle>>) {
        self.host.detach_from_all_sessions(client_id);
        match role {
            Some(Role::Control) => {
                self.clients.control.lock().unwrap().remove(client_id);
            }
            Some(Role::Stream) => {
                let mut map = self.clients.stream.lock().unwrap();
                // Only remove if this is still the registered socket -- a
                // newer reconnect may have already replaced it.
                if let (Some(registered), Some(ours)) = (map.get(client_id), stream_handle.as_ref()) {
                    if Arc::ptr_eq(registered, ours) {
                        map.remove(client_id);
                    }
                }
            }
            None => {}
        }
    }

    /// Returns `Ok((clientId, role, responseBytes))` on success or
    /// `Err(responseBytes)` on a rejected handshake. Never mutates the
    /// client map on a version mismatch, per the testable property in §8.
    fn handle_hello(
        &self,
        req_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(String, Role, Vec<u8>), Vec<u8>> {
        let hello: HelloPayload = serde_json::from_value(payload.clone()).unwrap_or_default();

        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(error_response(req_id, ErrorCode::ProtocolMismatch, "protocol version mismatch"));
        }
        if hello.token != self.token {
            return Err(error_response(req_id, ErrorCode::AuthFailed, "bad token"));
        }
        let (Some(role), false) = (hello.role, hello.client_id.is_empty()) else {
            return Err(error_response(req_id, ErrorCode::InvalidHello, "missing clientId or role"));
        };

        let result = HelloResult {
            protocol_version: PROTOCOL_VERSION,
            daemon_version: termhost_protocol::DAEMON_VERSION.to_string(),
            daemon_pid: self.daemon_pid,
        };
        let bytes = ok_response(req_id, &result);
        Ok((hello.client_id, role, bytes))
    }

    fn dispatch(self: &Arc<Self>, client_id: &str, req: &termhost_protocol::IpcRequest) -> Option<Vec<u8>> {
        // The notify-write optimization only applies to `write` requests: a
        // success response is suppressed entirely so a high keystroke rate
        // doesn't saturate the control socket with acks nobody reads.
        let is_notify_write = req.kind == "write" && req.id.starts_with(consts::NOTIFY_ID_PREFIX);
        let result = self.handle_request(client_id, req);
        match result {
            Ok(_) if is_notify_write => None,
            Ok(bytes) => Some(bytes),
            Err(err) if is_notify_write => {
                self.emit_notify_error(client_id, &err);
                None
            }
            Err(err) => Some(error_response(&req.id, err.code, &err.message)),
        }
    }

    fn emit_notify_error(&self, client_id: &str, err: &DispatchError) {
        let Some(handle) = self.clients.stream.lock().unwrap().get(client_id).cloned() else {
            warn!(client_id, "notify write failed with no stream socket to report on");
            return;
        };
        let event = EventMessage::new(
            EventKind::Error,
            err.session_id.clone().unwrap_or_default(),
            serde_json::json!({ "code": err.code.to_string(), "message": err.message }),
        );
        if let Ok(line) = codec::encode_line(&event) {
            let mut sock = handle.lock().unwrap();
            let _ = sock.write_all(&line);
        }
    }

    fn handle_request(
        self: &Arc<Self>,
        client_id: &str,
        req: &termhost_protocol::IpcRequest,
    ) -> Result<Vec<u8>, DispatchError> {
        match req.kind.as_str() {
            "createOrAttach" => {
                let payload: CreateOrAttachPayload =
                    serde_json::from_value(req.payload.clone()).map_err(bad_payload)?;
                let stream = self.clients.stream.lock().unwrap().get(client_id).map(Arc::downgrade);
                let Some(stream) = stream else {
                    return Err(DispatchError::no_session(ErrorCode::StreamNotConnected, "no stream socket registered for client"));
                };
                let args = CreateOrAttachArgs {
                    session_id: payload.session_id.clone(),
                    workspace_id: payload.workspace_id,
                    pane_id: payload.pane_id,
                    cols: payload.cols,
                    rows: payload.rows,
                    cwd: payload.cwd,
                    env: payload.env,
                    initial_commands: payload.initial_commands,
                    shell: None,
                };
                let result = self
                    .host
                    .create_or_attach(client_id, stream, args)
                    .map_err(|e| DispatchError::with_session(ErrorCode::CreateAttachFailed, e.to_string(), payload.session_id))?;
                Ok(ok_response(&req.id, &result))
            }
            "write" => {
                let payload: WritePayload = serde_json::from_value(req.payload.clone()).map_err(bad_payload)?;
                self.host.write(&payload.session_id, &payload.data).map_err(|e| match e {
                    crate::daemon::host::WriteErr::NotFound => {
                        DispatchError::with_session(ErrorCode::SessionNotFound, "session not found".into(), payload.session_id.clone())
                    }
                    crate::daemon::host::WriteErr::NotAttachable => {
                        DispatchError::with_session(ErrorCode::WriteFailed, "session not attachable".into(), payload.session_id.clone())
                    }
                })?;
                Ok(ok_response(&req.id, &serde_json::json!({})))
            }
            "resize" => {
                let payload: ResizePayload = serde_json::from_value(req.payload.clone()).map_err(bad_payload)?;
                self.host.resize(&payload.session_id, payload.cols, payload.rows);
                Ok(ok_response(&req.id, &serde_json::json!({})))
            }
            "detach" => {
                let payload: SessionIdPayload = serde_json::from_value(req.payload.clone()).map_err(bad_payload)?;
                self.host.detach(client_id, &payload.session_id);
                Ok(ok_response(&req.id, &serde_json::json!({})))
            }
            "kill" => {
                let payload: SessionIdPayload = serde_json::from_value(req.payload.clone()).map_err(bad_payload)?;
                self.host.kill(&payload.session_id);
                Ok(ok_response(&req.id, &serde_json::json!({})))
            }
            "signal" => {
                let payload: SignalPayload = serde_json::from_value(req.payload.clone()).map_err(bad_payload)?;
                self.host.signal(&payload.session_id, payload.signal);
                Ok(ok_response(&req.id, &serde_json::json!({})))
            }
            "killAll" => {
                let _payload: KillAllPayload = serde_json::from_value(req.payload.clone()).unwrap_or_default();
                self.host.kill_all();
                Ok(ok_response(&req.id, &serde_json::json!({})))
            }
            "listSessions" => {
                let result: ListSessionsResult = self.host.list_sessions();
                Ok(ok_response(&req.id, &result))
            }
            "clearScrollback" => {
                let payload: SessionIdPayload = serde_json::from_value(req.payload.clone()).map_err(bad_payload)?;
                self.host.clear_scrollback(&payload.session_id);
                Ok(ok_response(&req.id, &serde_json::json!({})))
            }
            "shutdown" => {
                let resp = ok_response(&req.id, &serde_json::json!({}));
                let host = self.host.clone();
                thread::spawn(move || {
                    thread::sleep(consts::SHUTDOWN_GRACE);
                    host.dispose();
                    info!("shutting down after shutdown request");
                    std::process::exit(0);
                });
                Ok(resp)
            }
            other => Err(DispatchError::no_session(
                ErrorCode::UnknownRequest,
                format!("unknown request type {other}"),
            )),
        }
    }
}

struct DispatchError {
    code: ErrorCode,
    message: String,
    session_id: Option<String>,
}

impl DispatchError {
    fn no_session(code: ErrorCode, message: impl Into<String>) -> Self {
        DispatchError { code, message: message.into(), session_id: None }
    }

    fn with_session(code: ErrorCode, message: String, session_id: String) -> Self {
        DispatchError { code, message, session_id: Some(session_id) }
    }
}

fn bad_payload(e: serde_json::Error) -> DispatchError {
    DispatchError::no_session(ErrorCode::InternalError, format!("malformed payload: {e}"))
}

fn ok_response<T: serde::Serialize>(id: &str, payload: &T) -> Vec<u8> {
    let value = serde_json::json!({ "id": id, "ok": true, "payload": payload });
    codec::encode_line(&value).unwrap_or_default()
}

fn error_response(id: &str, code: ErrorCode, message: &str) -> Vec<u8> {
    let body = ErrorBody { code, message: message.to_string() };
    let value = serde_json::json!({ "id": id, "ok": false, "error": body });
    codec::encode_line(&value).unwrap_or_default()
}
