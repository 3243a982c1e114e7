// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A minimal QEMU Machine Protocol client.

use camino::Utf8Path;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{
    io::{
        AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader,
        Lines,
    },
    net::UnixStream,
};
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum QmpError {
    #[error("QMP I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed QMP message {line:?}: {source}")]
    Malformed { line: String, source: serde_json::Error },

    #[error("QMP connection closed")]
    Closed,

    #[error("QMP command {command} failed: {class}: {desc}")]
    Command { command: String, class: String, desc: String },
}

#[derive(Debug, Deserialize)]
struct QmpErrorBody {
    class: String,
    desc: String,
}

/// The replies QEMU sends on a QMP connection. Events are interleaved with
/// command responses and are skipped.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QmpMessage {
    Return {
        #[serde(rename = "return")]
        value: Value,
    },
    Error {
        error: QmpErrorBody,
    },
    Event {
        event: String,
    },
    Greeting {
        #[serde(rename = "QMP")]
        _qmp: Value,
    },
}

pub(crate) struct QmpClient<S> {
    lines: Lines<BufReader<tokio::io::ReadHalf<S>>>,
    writer: tokio::io::WriteHalf<S>,
}

impl QmpClient<UnixStream> {
    pub(crate) async fn connect(path: &Utf8Path) -> Result<Self, QmpError> {
        let stream = UnixStream::connect(path).await?;
        Self::handshake(stream).await
    }
}

impl<S: AsyncRead + AsyncWrite> QmpClient<S> {
    /// Consumes the server greeting and leaves capabilities negotiation mode.
    pub(crate) async fn handshake(stream: S) -> Result<Self, QmpError> {
        let (reader, writer) = tokio::io::split(stream);
        let mut client =
            Self { lines: BufReader::new(reader).lines(), writer };

        match client.next_message().await? {
            QmpMessage::Greeting { .. } => {}
            other => debug!(?other, "unexpected first QMP message"),
        }
        client.execute("qmp_capabilities", None).await?;
        Ok(client)
    }

    async fn next_message(&mut self) -> Result<QmpMessage, QmpError> {
        let line = self.lines.next_line().await?.ok_or(QmpError::Closed)?;
        trace!(%line, "QMP message");
        serde_json::from_str(&line)
            .map_err(|source| QmpError::Malformed { line, source })
    }

    /// Runs `command` and returns the value of its `return` member.
    pub(crate) async fn execute(
        &mut self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<Value, QmpError> {
        let request = match arguments {
            Some(args) => json!({ "execute": command, "arguments": args }),
            None => json!({ "execute": command }),
        };
        debug!(%request, "sending QMP command");
        let mut bytes = request.to_string().into_bytes();
        bytes.push(b'\n');
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;

        loop {
            match self.next_message().await? {
                QmpMessage::Return { value } => return Ok(value),
                QmpMessage::Error { error } => {
                    return Err(QmpError::Command {
                        command: command.to_owned(),
                        class: error.class,
                        desc: error.desc,
                    })
                }
                QmpMessage::Event { event } => {
                    debug!(event, "QMP event");
                }
                QmpMessage::Greeting { .. } => {}
            }
        }
    }

    /// Returns whether the guest CPUs are running.
    pub(crate) async fn query_running(&mut self) -> Result<bool, QmpError> {
        let status = self.execute("query-status", None).await?;
        Ok(status.get("running").and_then(Value::as_bool).unwrap_or(false))
    }
}

/// Converts a key combination like `meta_l-d` into `send-key` arguments.
pub(crate) fn send_key_arguments(keys: &str) -> Value {
    let keys: Vec<Value> = keys
        .split('-')
        .map(|k| json!({ "type": "qcode", "data": k }))
        .collect();
    json!({ "keys": keys })
}
