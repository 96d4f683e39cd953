//! Purpose: Per-session network-stream transport behind the HTTP endpoint.
//! Exports: `SessionTransport`.
//! Role: Serializes one session's inbound requests and owns its server-push channel.
//! Invariants: Inbound messages of one session are dispatched strictly in arrival order.
//! Invariants: Closing cancels only this session's queued and in-flight work.
//! Invariants: At most one live push subscriber; the push channel ends when the session closes.
//! Invariants: Handlers reach the push channel through the `Peer` the worker hands them.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{CloseHook, CloseSignal, Transport, closed_error, wait_closed};
use crate::core::error::{Error, ErrorKind};
use crate::mcp::{DispatchOutcome, McpDispatcher};
use crate::registry::Peer;

const INBOUND_QUEUE: usize = 64;

struct Inbound {
    message: Value,
    reply: oneshot::Sender<DispatchOutcome>,
}

pub struct SessionTransport {
    session_id: String,
    inbound: mpsc::Sender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Inbound>>>,
    push: Mutex<Option<mpsc::Sender<Value>>>,
    push_buffer: usize,
    signal: CloseSignal,
}

impl SessionTransport {
    pub fn new(session_id: impl Into<String>, push_buffer: usize) -> Self {
        let (inbound, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        Self {
            session_id: session_id.into(),
            inbound,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            push: Mutex::new(None),
            push_buffer: push_buffer.max(1),
            signal: CloseSignal::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Queues one client message and waits for the pipeline's outcome.
    pub async fn handle(&self, message: Value) -> Result<DispatchOutcome, Error> {
        if self.signal.is_closed() {
            return Err(closed_error(Some(&self.session_id)));
        }
        let (reply, outcome) = oneshot::channel();
        self.inbound
            .send(Inbound { message, reply })
            .await
            .map_err(|_| closed_error(Some(&self.session_id)))?;
        outcome.await.map_err(|_| {
            Error::new(ErrorKind::Transport)
                .with_message("session closed before reply")
                .with_session(self.session_id.clone())
        })
    }

    /// Opens the server-push channel. A second live subscriber is refused.
    pub fn subscribe(&self) -> Result<mpsc::Receiver<Value>, Error> {
        if self.signal.is_closed() {
            return Err(closed_error(Some(&self.session_id)));
        }
        let mut push = self.push.lock().unwrap_or_else(|p| p.into_inner());
        if push.as_ref().is_some_and(|existing| !existing.is_closed()) {
            return Err(Error::new(ErrorKind::AlreadyExists)
                .with_message("push stream already open")
                .with_session(self.session_id.clone()));
        }
        let (sender, receiver) = mpsc::channel(self.push_buffer);
        *push = Some(sender);
        Ok(receiver)
    }
}

impl fmt::Debug for SessionTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTransport")
            .field("session_id", &self.session_id)
            .field("closed", &self.signal.is_closed())
            .finish_non_exhaustive()
    }
}

impl Transport for SessionTransport {
    fn bind(
        self: Arc<Self>,
        pipeline: Arc<McpDispatcher>,
        on_close: CloseHook,
    ) -> Result<(), Error> {
        let inbound = self
            .inbound_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message("session transport is already bound")
                    .with_session(self.session_id.clone())
            })?;
        if self.signal.is_closed() {
            return Err(closed_error(Some(&self.session_id)));
        }
        self.signal.set_hook(on_close)?;
        tokio::spawn(serve_session(
            session_peer(&self.session_id, Arc::downgrade(&self)),
            inbound,
            pipeline,
            self.signal.subscribe(),
        ));
        Ok(())
    }

    fn send(&self, message: Value) -> Result<(), Error> {
        if self.signal.is_closed() {
            return Err(closed_error(Some(&self.session_id)));
        }
        let mut push = self.push.lock().unwrap_or_else(|p| p.into_inner());
        let Some(sender) = push.as_ref() else {
            debug!(session = %self.session_id, "no push subscriber; message dropped");
            return Ok(());
        };
        match sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::new(ErrorKind::Transport)
                .with_message("push buffer full")
                .with_session(self.session_id.clone())),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                *push = None;
                debug!(session = %self.session_id, "push subscriber went away; message dropped");
                Ok(())
            }
        }
    }

    fn close(&self) {
        if self.signal.close() {
            self.push.lock().unwrap_or_else(|p| p.into_inner()).take();
            debug!(session = %self.session_id, "session transport closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }
}

fn session_peer(session_id: &str, transport: Weak<SessionTransport>) -> Peer {
    let id = session_id.to_string();
    Peer::new(Some(id.clone()), move |message| match transport.upgrade() {
        Some(transport) => transport.send(message),
        None => Err(closed_error(Some(&id))),
    })
}

async fn serve_session(
    peer: Peer,
    mut inbound: mpsc::Receiver<Inbound>,
    pipeline: Arc<McpDispatcher>,
    mut closed: tokio::sync::watch::Receiver<bool>,
) {
    let session_id = peer.session_id().unwrap_or_default().to_string();
    loop {
        let next = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break,
            next = inbound.recv() => next,
        };
        let Some(Inbound { message, reply }) = next else {
            break;
        };
        let mut dispatch_closed = closed.clone();
        let outcome = tokio::select! {
            _ = wait_closed(&mut dispatch_closed) => break,
            outcome = pipeline.dispatch_value_from(message, &peer) => outcome,
        };
        if reply.send(outcome).is_err() {
            warn!(session = %session_id, "caller went away before reply");
        }
    }
    debug!(session = %session_id, "session worker stopped");
}
