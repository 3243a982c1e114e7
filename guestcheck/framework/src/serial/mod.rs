// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interactive consoles: a byte stream to a guest shell (a serial port
//! exported over TCP, an `ssh` child process, or a remote shell socket) plus
//! a buffer that lets callers wait for specific output.

use std::{
    net::SocketAddr,
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    process::{Child, Command},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, info_span, Instrument};

mod buffer;

use buffer::{ConsoleBuffer, OutputWaiter};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A live console connection.
pub(crate) struct Console {
    buffer: Arc<Mutex<ConsoleBuffer>>,
    input_tx: mpsc::Sender<Vec<u8>>,
    io_task: JoinHandle<()>,

    /// The process providing the console, if any. Killed when the console is
    /// dropped.
    _child: Option<Child>,
}

async fn console_io(
    mut reader: BoxedReader,
    mut writer: BoxedWriter,
    buffer: Arc<Mutex<ConsoleBuffer>>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
) {
    let mut bytes = vec![0u8; 4096];
    loop {
        tokio::select! {
            read = reader.read(&mut bytes) => {
                match read {
                    Ok(0) => {
                        info!("console stream closed");
                        break;
                    }
                    Ok(n) => {
                        buffer.lock().unwrap().process_bytes(&bytes[..n]);
                    }
                    Err(e) => {
                        error!(%e, "failed to read from console");
                        break;
                    }
                }
            }
            input = input_rx.recv() => {
                match input {
                    Some(data) => {
                        let res = async {
                            writer.write_all(&data).await?;
                            writer.flush().await
                        }.await;
                        if let Err(e) = res {
                            error!(%e, "failed to write to console");
                            break;
                        }
                    }
                    None => {
                        debug!("console input channel closed");
                        break;
                    }
                }
            }
        }
    }
}

impl Console {
    fn from_streams(
        reader: BoxedReader,
        writer: BoxedWriter,
        child: Option<Child>,
        log_path: Option<&Utf8Path>,
        name: &str,
    ) -> Result<Self> {
        let buffer = Arc::new(Mutex::new(ConsoleBuffer::new(log_path)?));
        let (input_tx, input_rx) = mpsc::channel(16);

        let span = info_span!("console", name);
        span.follows_from(tracing::Span::current());
        let io = console_io(reader, writer, buffer.clone(), input_rx);
        let io_task = tokio::spawn(io.instrument(span));

        Ok(Self { buffer, input_tx, io_task, _child: child })
    }

    /// Connects to a console served over TCP, e.g. a QEMU serial port
    /// configured with `-serial tcp:...,server=on`.
    pub(crate) async fn connect_tcp(
        addr: SocketAddr,
        log_path: Option<&Utf8Path>,
    ) -> Result<Self> {
        info!(%addr, "connecting to TCP console");
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to console at {addr}"))?;
        let (reader, writer) = stream.into_split();
        Self::from_streams(
            Box::new(reader),
            Box::new(writer),
            None,
            log_path,
            &addr.to_string(),
        )
    }

    /// Spawns `program` with `args` and uses its stdin/stdout as the console.
    /// This is how network logins through `ssh -tt` are made.
    pub(crate) fn spawn_process(
        program: &str,
        args: &[String],
        log_path: Option<&Utf8Path>,
    ) -> Result<Self> {
        info!(program, ?args, "spawning console process");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning console process {program}"))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("console process has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("console process has no stdout"))?;

        Self::from_streams(
            Box::new(stdout),
            Box::new(stdin),
            Some(child),
            log_path,
            program,
        )
    }

    /// Builds a console on top of an arbitrary duplex stream.
    #[cfg(test)]
    pub(crate) fn from_duplex(stream: tokio::io::DuplexStream) -> Result<Self> {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_streams(
            Box::new(reader),
            Box::new(writer),
            None,
            None,
            "test",
        )
    }

    pub(crate) async fn send_str(&self, s: &str) -> Result<()> {
        if s.is_empty() {
            return Ok(());
        }
        self.input_tx
            .send(s.as_bytes().to_vec())
            .await
            .map_err(|_| anyhow!("console connection is closed"))
    }

    /// Waits up to `timeout` for `wanted` to appear and returns the output
    /// that preceded it.
    pub(crate) async fn wait_for(
        &self,
        wanted: &str,
        timeout: Duration,
    ) -> Result<String> {
        let (preceding_tx, preceding_rx) = oneshot::channel();
        self.buffer.lock().unwrap().register_wait(OutputWaiter {
            wanted: wanted.to_owned(),
            preceding_tx,
        });

        match tokio::time::timeout(timeout, preceding_rx).await {
            Ok(Ok(out)) => Ok(out),
            Ok(Err(_)) => {
                Err(anyhow!("console closed while waiting for {wanted:?}"))
            }
            Err(_) => {
                self.buffer.lock().unwrap().cancel_wait();
                Err(anyhow!(
                    "timed out after {timeout:?} waiting for {wanted:?}"
                ))
            }
        }
    }

    /// Drops any output received so far that no wait has consumed.
    pub(crate) fn clear(&self) {
        self.buffer.lock().unwrap().clear();
    }

    pub(crate) fn is_connected(&self) -> bool {
        !self.io_task.is_finished()
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.io_task.abort();
    }
}
