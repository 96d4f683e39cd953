//! Purpose: Define the channel contract between a peer and the dispatch pipeline.
//! Exports: `Transport`, `CloseHook`, `StdioTransport`, `SessionTransport`.
//! Role: Both concrete channels implement `bind/send/close`; the gateway only sees the trait.
//! Invariants: `close` is idempotent and fires the close hook exactly once.
//! Invariants: Teardown never panics or propagates errors; failures are logged.
//! Invariants: A transport that reports closed never accepts new inbound work.

mod stdio;
mod stream;

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;

use crate::core::error::{Error, ErrorKind};
use crate::mcp::McpDispatcher;

pub use stdio::StdioTransport;
pub use stream::SessionTransport;

/// One-shot observer run when the transport closes.
pub type CloseHook = Box<dyn FnOnce() + Send>;

pub trait Transport: Send + Sync {
    /// Attaches the pipeline and close hook, then starts the transport's worker.
    fn bind(self: Arc<Self>, pipeline: Arc<McpDispatcher>, on_close: CloseHook)
    -> Result<(), Error>;

    /// Queues one message toward the peer. Each message is flushed on its own.
    fn send(&self, message: Value) -> Result<(), Error>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Close flag shared by a transport and its tasks, plus the one-shot hook.
pub(crate) struct CloseSignal {
    closed: watch::Sender<bool>,
    hook: Mutex<Option<CloseHook>>,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            closed,
            hook: Mutex::new(None),
        }
    }

    pub(crate) fn set_hook(&self, hook: CloseHook) -> Result<(), Error> {
        let mut slot = self.hook.lock().unwrap_or_else(|poison| poison.into_inner());
        if slot.is_some() {
            return Err(Error::new(ErrorKind::Usage).with_message("transport is already bound"));
        }
        *slot = Some(hook);
        Ok(())
    }

    /// Flips the flag. Returns true only for the call that actually closed.
    pub(crate) fn close(&self) -> bool {
        let first = self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if first {
            let hook = self
                .hook
                .lock()
                .unwrap_or_else(|poison| poison.into_inner())
                .take();
            if let Some(hook) = hook {
                hook();
            }
        }
        first
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub(crate) async fn closed(&self) {
        let mut receiver = self.closed.subscribe();
        let _ = receiver.wait_for(|closed| *closed).await;
    }
}

pub(crate) async fn wait_closed(receiver: &mut watch::Receiver<bool>) {
    let _ = receiver.wait_for(|closed| *closed).await;
}

pub(crate) fn closed_error(session: Option<&str>) -> Error {
    let err = Error::new(ErrorKind::Transport).with_message("transport closed");
    match session {
        Some(session) => err.with_session(session),
        None => err,
    }
}

#[cfg(test)]
mod tests {
    use super::CloseSignal;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn close_runs_hook_exactly_once() {
        let signal = CloseSignal::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        signal
            .set_hook(Box::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("hook");

        assert!(signal.close());
        assert!(!signal.close());
        assert!(!signal.close());
        assert!(signal.is_closed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_hook_is_rejected() {
        let signal = CloseSignal::new();
        signal.set_hook(Box::new(|| {})).expect("first hook");
        assert!(signal.set_hook(Box::new(|| {})).is_err());
    }

    #[tokio::test]
    async fn closed_resolves_for_late_observers() {
        let signal = CloseSignal::new();
        signal.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), signal.closed())
            .await
            .expect("already closed");
    }
}
