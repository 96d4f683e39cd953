//! Purpose: Own the session-id → transport map for the network endpoint.
//! Exports: `SessionManager`, `Session`.
//! Role: Creates, looks up, terminates, and drains sessions for the request router.
//! Invariants: A session is installed in the map before its id is returned to anyone.
//! Invariants: Insert and remove are the only mutators; each runs under one short-lived lock.
//! Invariants: Closed transports are never returned by lookup; removal happens exactly once.
//! Invariants: The lock is never held across an `.await` or while a transport closes.
//! Invariants: After `close_all`, `create` is refused until `reopen`; a drain cannot be outrun.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use getrandom::fill as fill_random;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::core::error::{Error, ErrorKind};
use crate::mcp::McpDispatcher;
use crate::transport::{SessionTransport, Transport};

const SESSION_ID_BYTES: usize = 32;
pub(crate) const SHUTTING_DOWN: &str = "gateway is shutting down";

#[derive(Clone, Debug)]
pub struct Session {
    id: String,
    transport: Arc<SessionTransport>,
    created_at: OffsetDateTime,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport(&self) -> &Arc<SessionTransport> {
        &self.transport
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }
}

type SessionMap = HashMap<String, Session>;

pub struct SessionManager {
    sessions: Arc<Mutex<SessionMap>>,
    // Only read or written while `sessions` is locked.
    draining: AtomicBool,
    pipeline: Arc<McpDispatcher>,
    max_sessions: usize,
    push_buffer: usize,
}

impl SessionManager {
    pub fn new(pipeline: Arc<McpDispatcher>, max_sessions: usize, push_buffer: usize) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            draining: AtomicBool::new(false),
            pipeline,
            max_sessions,
            push_buffer,
        }
    }

    /// Creates a session and binds its transport to the pipeline. The pair is
    /// in the map before this returns, so the id is immediately routable.
    pub fn create(&self) -> Result<Session, Error> {
        let session = {
            let mut sessions = self.lock();
            if self.draining.load(Ordering::SeqCst) {
                return Err(Error::new(ErrorKind::Busy).with_message(SHUTTING_DOWN));
            }
            if sessions.len() >= self.max_sessions {
                return Err(Error::new(ErrorKind::Busy)
                    .with_message("session limit reached")
                    .with_hint("Close idle sessions or raise --max-sessions."));
            }
            let id = loop {
                let candidate = generate_session_id()?;
                if !sessions.contains_key(&candidate) {
                    break candidate;
                }
            };
            let session = Session {
                id: id.clone(),
                transport: Arc::new(SessionTransport::new(id.clone(), self.push_buffer)),
                created_at: OffsetDateTime::now_utc(),
            };
            sessions.insert(id, session.clone());
            session
        };

        let on_close = remove_on_close(Arc::downgrade(&self.sessions), session.id.clone());
        if let Err(err) = Arc::clone(&session.transport).bind(Arc::clone(&self.pipeline), on_close)
        {
            self.lock().remove(&session.id);
            return Err(err);
        }
        info!(session = %session.id, "session created");
        Ok(session)
    }

    pub fn lookup(&self, id: &str) -> Result<Arc<SessionTransport>, Error> {
        self.lock()
            .get(id)
            .filter(|session| !session.transport.is_closed())
            .map(|session| Arc::clone(&session.transport))
            .ok_or_else(invalid_session)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lookup(id).is_ok()
    }

    /// Removes the session and closes its transport.
    pub fn terminate(&self, id: &str) -> Result<(), Error> {
        let session = self.lock().remove(id).ok_or_else(invalid_session)?;
        session.transport.close();
        let age = OffsetDateTime::now_utc() - session.created_at();
        info!(session = %id, age_secs = age.whole_seconds(), "session terminated");
        Ok(())
    }

    /// Closes every live session and refuses new ones until [`reopen`].
    /// Used by gateway shutdown.
    ///
    /// [`reopen`]: SessionManager::reopen
    pub fn close_all(&self) -> usize {
        let drained = {
            let mut sessions = self.lock();
            self.draining.store(true, Ordering::SeqCst);
            sessions.drain().map(|(_, session)| session).collect::<Vec<_>>()
        };
        for session in &drained {
            session.transport.close();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "closed all sessions");
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Accepts new sessions again after a drain.
    pub fn reopen(&self) {
        let _sessions = self.lock();
        self.draining.store(false, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, SessionMap> {
        self.sessions.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

fn remove_on_close(sessions: Weak<Mutex<SessionMap>>, id: String) -> crate::transport::CloseHook {
    Box::new(move || {
        let Some(sessions) = sessions.upgrade() else {
            return;
        };
        let removed = sessions
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .remove(&id);
        if removed.is_some() {
            debug!(session = %id, "session removed after transport close");
        }
    })
}

pub(crate) fn invalid_session() -> Error {
    Error::new(ErrorKind::Protocol).with_message("invalid or missing session id")
}

fn generate_session_id() -> Result<String, Error> {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    fill_random(&mut bytes).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message(format!("failed to generate session id: {err}"))
    })?;
    Ok(hex_encode(&bytes))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(nibble_hex(byte >> 4));
        out.push(nibble_hex(byte & 0x0f));
    }
    out
}

fn nibble_hex(nibble: u8) -> char {
    match nibble {
        0..=9 => char::from(b'0' + nibble),
        _ => char::from(b'a' + (nibble - 10)),
    }
}
