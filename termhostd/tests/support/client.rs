use std::{
    io::{BufRead, BufReader, Write},
    os::unix::net::UnixStream,
};

use anyhow::{anyhow, Context};
use serde_json::Value;

use super::daemon::Proc;

/// A single control- or stream-role connection to a test daemon, speaking
/// raw NDJSON. Deliberately dumb relative to a real client SDK: it exists to
/// drive the protocol from tests, not to be reused as production code.
pub struct Client {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
    next_id: u64,
}

impl Client {
    pub fn connect(daemon: &Proc) -> anyhow::Result<Client> {
        let stream = daemon.connect()?;
        let reader = BufReader::new(stream.try_clone().context("cloning client stream")?);
        Ok(Client { writer: stream, reader, next_id: 0 })
    }

    fn fresh_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }

    pub fn send_raw(&mut self, value: &Value) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        self.writer.write_all(&line).context("writing request line")
    }

    pub fn recv_raw(&mut self) -> anyhow::Result<Value> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).context("reading response line")?;
        if n == 0 {
            return Err(anyhow!("connection closed before a response arrived"));
        }
        serde_json::from_str(&line).context("parsing response json")
    }

    /// Sends `hello` and returns the decoded result payload, or the error
    /// body on rejection.
    pub fn hello(
        &mut self,
        daemon: &Proc,
        client_id: &str,
        role: &str,
    ) -> anyhow::Result<Value> {
        let id = self.fresh_id("req_");
        self.send_raw(&serde_json::json!({
            "id": id,
            "type": "hello",
            "payload": {
                "protocolVersion": 1,
                "token": daemon.token,
                "clientId": client_id,
                "role": role,
            }
        }))?;
        self.recv_raw()
    }

    /// Sends a control request with a normal (non-notify) id and returns the
    /// full response envelope.
    pub fn request(&mut self, kind: &str, payload: Value) -> anyhow::Result<Value> {
        let id = self.fresh_id("req_");
        self.send_raw(&serde_json::json!({ "id": id, "type": kind, "payload": payload }))?;
        self.recv_raw()
    }

    /// Sends a `notify_`-prefixed write, which suppresses the success
    /// response entirely.
    pub fn notify_write(&mut self, session_id: &str, data: &str) -> anyhow::Result<()> {
        let id = self.fresh_id("notify_");
        self.send_raw(&serde_json::json!({
            "id": id,
            "type": "write",
            "payload": { "sessionId": session_id, "data": data },
        }))
    }
}
