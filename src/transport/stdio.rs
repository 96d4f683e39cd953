//! Purpose: Run the singleton local-stream transport over inherited stdin/stdout.
//! Exports: `StdioTransport`.
//! Role: Bridge newline-delimited JSON-RPC lines to the shared dispatch pipeline.
//! Invariants: The writer only emits JSON-RPC messages (one JSON value per line).
//! Invariants: EOF or a read failure closes the transport; queued replies are still flushed.
//! Invariants: Parse errors (including non-UTF-8 lines) become JSON-RPC errors with a null id.
//! Invariants: Handler notifications share the reply queue, so they precede their reply.
//! Notes: No session id exists here; there is exactly one trusted local peer.

use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{CloseHook, CloseSignal, Transport, closed_error, wait_closed};
use crate::core::error::{Error, ErrorKind};
use crate::mcp::{
    DispatchOutcome, JsonRpcId, JsonRpcResponse, McpDispatcher, parse_jsonrpc_message,
};
use crate::registry::Peer;

type LineReader = Box<dyn AsyncBufRead + Send + Unpin>;
type LineWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct StdioTransport {
    io: Mutex<Option<(LineReader, LineWriter)>>,
    outbound: mpsc::UnboundedSender<Value>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    signal: CloseSignal,
}

impl StdioTransport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Self {
            io: Mutex::new(Some((Box::new(BufReader::new(reader)), Box::new(writer)))),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            tasks: Mutex::new(Vec::new()),
            signal: CloseSignal::new(),
        }
    }

    /// The process's inherited input and output.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    pub async fn closed(&self) {
        self.signal.closed().await;
    }

    /// Waits for the reader and writer tasks to finish after `close`.
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "local stream task ended abnormally");
            }
        }
    }
}

impl Transport for StdioTransport {
    fn bind(
        self: Arc<Self>,
        pipeline: Arc<McpDispatcher>,
        on_close: CloseHook,
    ) -> Result<(), Error> {
        let io = self.io.lock().unwrap_or_else(|p| p.into_inner()).take();
        let outbound_rx = self
            .outbound_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let (Some((reader, writer)), Some(outbound_rx)) = (io, outbound_rx) else {
            return Err(Error::new(ErrorKind::Usage).with_message("local stream is already bound"));
        };
        if self.signal.is_closed() {
            return Err(closed_error(None));
        }
        self.signal.set_hook(on_close)?;

        let writer_task = tokio::spawn(write_loop(
            writer,
            outbound_rx,
            self.signal.subscribe(),
            Arc::clone(&self),
        ));
        let reader_task = tokio::spawn(read_loop(reader, pipeline, Arc::clone(&self)));
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.push(reader_task);
        tasks.push(writer_task);
        debug!("local stream connected");
        Ok(())
    }

    fn send(&self, message: Value) -> Result<(), Error> {
        if self.signal.is_closed() {
            return Err(closed_error(None));
        }
        self.outbound
            .send(message)
            .map_err(|_| closed_error(None))
    }

    fn close(&self) {
        if self.signal.close() {
            debug!("local stream closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }
}

async fn read_loop(
    mut reader: LineReader,
    pipeline: Arc<McpDispatcher>,
    transport: Arc<StdioTransport>,
) {
    let mut closed = transport.signal.subscribe();
    let peer = local_peer(Arc::downgrade(&transport));
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = wait_closed(&mut closed) => break,
            read = reader.read_until(b'\n', &mut line) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "failed to read from local stream");
                break;
            }
        }

        let message = line.trim_ascii();
        if message.is_empty() {
            continue;
        }

        let outcome = match parse_jsonrpc_message(message) {
            Ok(value) => {
                let mut dispatch_closed = closed.clone();
                tokio::select! {
                    _ = wait_closed(&mut dispatch_closed) => break,
                    outcome = pipeline.dispatch_value_from(value, &peer) => outcome,
                }
            }
            Err(error) => DispatchOutcome::Response(JsonRpcResponse::error(JsonRpcId::Null, error)),
        };

        if let DispatchOutcome::Response(response) = outcome {
            match serde_json::to_value(response) {
                Ok(payload) => {
                    if let Err(err) = transport.send(payload) {
                        debug!(error = %err, "dropping reply on closed local stream");
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "failed to encode local stream reply"),
            }
        }
    }
    transport.close();
}

fn local_peer(transport: Weak<StdioTransport>) -> Peer {
    Peer::new(None, move |message| match transport.upgrade() {
        Some(transport) => transport.send(message),
        None => Err(closed_error(None)),
    })
}

async fn write_loop(
    mut writer: LineWriter,
    mut outbound: mpsc::UnboundedReceiver<Value>,
    mut closed: tokio::sync::watch::Receiver<bool>,
    transport: Arc<StdioTransport>,
) {
    loop {
        let message = tokio::select! {
            biased;
            message = outbound.recv() => message,
            _ = wait_closed(&mut closed) => None,
        };
        let Some(message) = message else {
            break;
        };
        if let Err(err) = write_json_line(&mut writer, &message).await {
            warn!(error = %err, "failed to write to local stream");
            transport.close();
            return;
        }
    }

    while let Ok(message) = outbound.try_recv() {
        if let Err(err) = write_json_line(&mut writer, &message).await {
            warn!(error = %err, "failed to flush local stream on close");
            return;
        }
    }
    if let Err(err) = writer.shutdown().await {
        debug!(error = %err, "local stream writer shutdown failed");
    }
}

async fn write_json_line(writer: &mut LineWriter, payload: &Value) -> Result<(), Error> {
    let mut bytes = serde_json::to_vec(payload).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode MCP message")
            .with_source(err)
    })?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await.map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to write MCP message")
            .with_source(err)
    })?;
    writer.flush().await.map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to flush MCP message")
            .with_source(err)
    })
}
