//! JSON-RPC client over a subprocess's stdio (C10 half).
//!
//! Messages are newline-delimited JSON objects, matching
//! `original_source/src/jsonrpc/jsonrpc-server.c`'s `jsonrpc_server_send_message`
//! (`outputstream_printf(..., "%s\n", serialized_message)`), rather than the
//! `Content-Length:`-header framing of the full LSP wire protocol — this is a
//! scripting VM's adapter to *a* JSON-RPC peer, not a spec-complete LSP
//! client.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde_json::Value;

use crate::status::VmStatus;

/// A running JSON-RPC peer, launched as a subprocess.
pub struct JsonRpcClient {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: i64,
}

impl JsonRpcClient {
    /// Spawns `command` and wires its stdio into a line-delimited JSON-RPC
    /// session.
    pub fn spawn(command: &str) -> Result<Self, VmStatus> {
        let mut child = Command::new(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|_| VmStatus::CouldNotConnect)?;
        let stdin = child.stdin.take().ok_or(VmStatus::CouldNotConnect)?;
        let stdout = child.stdout.take().ok_or(VmStatus::CouldNotConnect)?;
        Ok(JsonRpcClient { child, stdin, stdout: BufReader::new(stdout), next_id: 1 })
    }

    fn send(&mut self, message: &Value) -> Result<(), VmStatus> {
        let mut line = serde_json::to_string(message).map_err(|_| VmStatus::CouldNotCommunicate)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).map_err(|_| VmStatus::CouldNotCommunicate)
    }

    fn recv(&mut self) -> Result<Value, VmStatus> {
        let mut line = String::new();
        let n = self.stdout.read_line(&mut line).map_err(|_| VmStatus::CouldNotCommunicate)?;
        if n == 0 {
            return Err(VmStatus::CouldNotCommunicate);
        }
        serde_json::from_str(line.trim_end()).map_err(|_| VmStatus::CouldNotCommunicate)
    }

    /// Sends a request and blocks for its matching response, correlating by
    /// the request id (this client never pipelines more than one
    /// outstanding request, so the next line read is always the reply).
    pub fn call(&mut self, method: &str, params: Value) -> Result<Value, VmStatus> {
        let id = self.next_id;
        self.next_id += 1;
        self.send(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))?;
        let reply = self.recv()?;
        if let Some(error) = reply.get("error") {
            tracing::warn!(%method, ?error, "JSON-RPC peer returned an error response");
            return Err(VmStatus::CouldNotCommunicate);
        }
        Ok(reply.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Sends a one-way notification (no reply expected).
    pub fn notify(&mut self, method: &str, params: Value) -> Result<(), VmStatus> {
        self.send(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
    }
}

impl Drop for JsonRpcClient {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawning_a_missing_binary_is_could_not_connect() {
        let result = JsonRpcClient::spawn("/no/such/lstf-test-peer-binary");
        assert!(matches!(result, Err(VmStatus::CouldNotConnect)));
    }

    #[test]
    fn echo_server_round_trips_a_call() {
        // `cat` echoes each request line back verbatim, which is not a valid
        // JSON-RPC reply, so this only exercises the framing (one line in,
        // one line out), not `call`'s error handling.
        let mut client = JsonRpcClient::spawn("cat").unwrap();
        client.send(&serde_json::json!({"hello": "world"})).unwrap();
        let reply = client.recv().unwrap();
        assert_eq!(reply, serde_json::json!({"hello": "world"}));
    }
}
