//! Purpose: Start and stop the gateway's transports as one unit.
//! Exports: `Gateway`.
//! Role: Owns the pipeline, the session manager, the HTTP listener task, and the local stream.
//! Invariants: Network state moves NotStarted -> Serving -> Stopped; restart is Stopped -> Serving.
//! Invariants: Local state moves Unconnected -> Connected -> Closed and never reconnects.
//! Invariants: `destroy` stops accepting, closes sessions, closes the local stream, then
//! releases the port. Session creation stays refused from the first drain until `start`.
//! Invariants: `destroy` is idempotent and never fails; teardown problems are logged.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{GatewayConfig, validate_config};
use crate::core::error::{Error, ErrorKind};
use crate::mcp::{Implementation, McpDispatcher};
use crate::registry::Registry;
use crate::router::build_router;
use crate::session::SessionManager;
use crate::transport::{StdioTransport, Transport};

struct Server {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

enum NetworkState {
    NotStarted,
    Serving(Server),
    Stopped { last_addr: SocketAddr },
}

enum LocalState {
    Unconnected,
    Connected(Arc<StdioTransport>),
    Closed,
}

pub struct Gateway {
    config: GatewayConfig,
    pipeline: Arc<McpDispatcher>,
    sessions: Arc<SessionManager>,
    network: tokio::sync::Mutex<NetworkState>,
    local: Mutex<LocalState>,
}

impl Gateway {
    /// Freezes the registry and prepares both transports without binding anything.
    pub fn new(
        config: GatewayConfig,
        implementation: Implementation,
        registry: Registry,
    ) -> Result<Self, Error> {
        validate_config(&config)?;
        let pipeline = Arc::new(McpDispatcher::new(implementation, Arc::new(registry)));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&pipeline),
            config.max_sessions,
            config.push_buffer,
        ));
        Ok(Self {
            config,
            pipeline,
            sessions,
            network: tokio::sync::Mutex::new(NetworkState::NotStarted),
            local: Mutex::new(LocalState::Unconnected),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Binds the listener and starts serving. A restart reuses the previously bound address.
    pub async fn start(&self) -> Result<SocketAddr, Error> {
        if !self.config.http_enabled {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("network endpoint is disabled")
                .with_hint("Drop --no-http to serve the network endpoint."));
        }
        let mut network = self.network.lock().await;
        let bind = match &*network {
            NetworkState::Serving(server) => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("gateway is already serving on {}", server.addr)));
            }
            NetworkState::NotStarted => self.config.bind,
            NetworkState::Stopped { last_addr } if self.config.bind.port() == 0 => *last_addr,
            NetworkState::Stopped { .. } => self.config.bind,
        };

        let router = build_router(&self.config, Arc::clone(&self.sessions))?;
        let listener = tokio::net::TcpListener::bind(bind).await.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message(format!("failed to bind listener on {bind}"))
                .with_source(err)
        })?;
        let addr = listener.local_addr().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read listener address")
                .with_source(err)
        })?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let server = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .into_future();
        let task = tokio::spawn(server);
        self.sessions.reopen();
        info!(addr = %addr, path = %self.config.endpoint_path, "gateway listening");

        *network = NetworkState::Serving(Server {
            addr,
            shutdown,
            task,
        });
        Ok(addr)
    }

    /// Attaches the singleton local stream to the pipeline.
    pub fn connect_local<R, W>(&self, reader: R, writer: W) -> Result<(), Error>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.attach_local(StdioTransport::new(reader, writer))
    }

    pub fn connect_stdio(&self) -> Result<(), Error> {
        self.attach_local(StdioTransport::stdio())
    }

    fn attach_local(&self, transport: StdioTransport) -> Result<(), Error> {
        if !self.config.stdio_enabled {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("local stream is disabled")
                .with_hint("Drop --no-stdio to accept a local peer."));
        }
        let mut local = self.local.lock().unwrap_or_else(|p| p.into_inner());
        if !matches!(*local, LocalState::Unconnected) {
            return Err(Error::new(ErrorKind::Usage).with_message("local stream already connected"));
        }
        let transport = Arc::new(transport);
        Arc::clone(&transport).bind(
            Arc::clone(&self.pipeline),
            Box::new(|| info!("local peer disconnected")),
        )?;
        *local = LocalState::Connected(transport);
        info!("local stream connected");
        Ok(())
    }

    /// Resolves once the local stream has closed, or right away if none is connected.
    pub async fn local_closed(&self) {
        let transport = match &*self.local.lock().unwrap_or_else(|p| p.into_inner()) {
            LocalState::Connected(transport) => Arc::clone(transport),
            LocalState::Unconnected | LocalState::Closed => return,
        };
        transport.closed().await;
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.network.lock().await {
            NetworkState::Serving(server) => Some(server.addr),
            NetworkState::NotStarted | NetworkState::Stopped { .. } => None,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub async fn destroy(&self) {
        let mut network = self.network.lock().await;
        let server = match std::mem::replace(&mut *network, NetworkState::NotStarted) {
            NetworkState::Serving(server) => {
                if server.shutdown.send(()).is_err() {
                    debug!("server task already gone");
                }
                Some((server.addr, server.task))
            }
            other => {
                *network = other;
                None
            }
        };

        let closed = self.sessions.close_all();
        if closed > 0 {
            debug!(count = closed, "sessions closed for shutdown");
        }
        self.close_local().await;

        let Some((addr, mut task)) = server else {
            return;
        };
        match tokio::time::timeout(self.config.shutdown_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => warn!(error = %err, "server exited with error"),
            Ok(Err(err)) => warn!(error = %err, "server task failed"),
            Err(_) => {
                warn!(
                    timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                    "server shutdown timed out; aborting"
                );
                task.abort();
                let _ = task.await;
            }
        }
        // Requests that were mid-body at the first drain have finished by now.
        let late = self.sessions.close_all();
        if late > 0 {
            warn!(count = late, "closed sessions created during shutdown");
        }
        *network = NetworkState::Stopped { last_addr: addr };
        info!(addr = %addr, "gateway stopped");
    }

    async fn close_local(&self) {
        let transport = {
            let mut local = self.local.lock().unwrap_or_else(|p| p.into_inner());
            match std::mem::replace(&mut *local, LocalState::Closed) {
                LocalState::Connected(transport) => transport,
                LocalState::Unconnected => {
                    *local = LocalState::Unconnected;
                    return;
                }
                LocalState::Closed => return,
            }
        };
        transport.close();
        if tokio::time::timeout(self.config.shutdown_timeout, transport.join())
            .await
            .is_err()
        {
            warn!("local stream did not drain before shutdown timeout");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

    fn build_gateway(config: GatewayConfig) -> Gateway {
        let mut registry = Registry::new();
        registry
            .register_tool("noop", "Do nothing", json!({"type":"object"}), |_| async {
                Ok(json!("ok"))
            })
            .expect("register");
        Gateway::new(config, Implementation::new("capgate-test", "0.0.0"), registry)
            .expect("gateway")
    }

    fn ephemeral() -> GatewayConfig {
        GatewayConfig {
            bind: "127.0.0.1:0".parse().expect("bind"),
            shutdown_timeout: Duration::from_secs(2),
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn start_destroy_start_reuses_port() {
        let gateway = build_gateway(ephemeral());
        let addr = gateway.start().await.expect("start");
        assert_eq!(gateway.local_addr().await, Some(addr));
        tokio::net::TcpStream::connect(addr).await.expect("listening");

        gateway.destroy().await;
        assert_eq!(gateway.local_addr().await, None);
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());

        let again = gateway.start().await.expect("restart");
        assert_eq!(again, addr);
        gateway.sessions.create().expect("sessions accepted after restart");
        gateway.destroy().await;
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let gateway = build_gateway(ephemeral());
        gateway.destroy().await;
        gateway.start().await.expect("start");
        gateway.destroy().await;
        gateway.destroy().await;
        assert_eq!(gateway.local_addr().await, None);
    }

    #[tokio::test]
    async fn second_start_while_serving_is_usage_error() {
        let gateway = build_gateway(ephemeral());
        gateway.start().await.expect("start");
        let err = gateway.start().await.expect_err("already serving");
        assert_eq!(err.kind(), ErrorKind::Usage);
        gateway.destroy().await;
    }

    #[tokio::test]
    async fn bind_failure_is_io_error() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let gateway = build_gateway(GatewayConfig {
            bind: taken.local_addr().expect("addr"),
            ..ephemeral()
        });
        let err = gateway.start().await.expect_err("port in use");
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[tokio::test]
    async fn destroy_closes_live_sessions() {
        let gateway = build_gateway(ephemeral());
        gateway.start().await.expect("start");
        let session = gateway.sessions.create().expect("create");
        assert_eq!(gateway.session_count(), 1);

        gateway.destroy().await;
        assert_eq!(gateway.session_count(), 0);
        assert!(session.transport().is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn initialize_finishing_during_destroy_leaves_no_session() {
        let gateway = Arc::new(build_gateway(ephemeral()));
        let addr = gateway.start().await.expect("start");

        let body = br#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#;
        let head = format!(
            "POST /mcp HTTP/1.1\r\nhost: {addr}\r\ncontent-type: application/json\r\n\
             content-length: {}\r\nconnection: close\r\n\r\n",
            body.len()
        );
        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        stream.write_all(head.as_bytes()).await.expect("head");
        stream.write_all(&body[..10]).await.expect("partial body");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let destroying = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.destroy().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        stream.write_all(&body[10..]).await.expect("rest of body");

        let mut response = String::new();
        tokio::time::timeout(Duration::from_secs(2), stream.read_to_string(&mut response))
            .await
            .expect("response in time")
            .expect("read response");
        tokio::time::timeout(Duration::from_secs(5), destroying)
            .await
            .expect("destroy finishes")
            .expect("join");

        assert!(response.starts_with("HTTP/1.1 503"), "{response}");
        assert!(!response.to_ascii_lowercase().contains("mcp-session-id"));
        assert_eq!(gateway.session_count(), 0);
    }

    #[tokio::test]
    async fn local_stream_connects_once_and_closes_on_destroy() {
        let gateway = build_gateway(ephemeral());
        let (client_in, server_in) = tokio::io::duplex(4096);
        let (server_out, client_out) = tokio::io::duplex(4096);
        gateway.connect_local(server_in, server_out).expect("connect");

        let (spare_in, spare_out) = tokio::io::duplex(64);
        let err = gateway
            .connect_local(spare_in, spare_out)
            .expect_err("second connect");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let mut client_in = client_in;
        client_in
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
            .await
            .expect("write");
        let mut reader = BufReader::new(client_out);
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .expect("reply in time")
            .expect("read");
        let reply: Value = serde_json::from_str(&line).expect("json");
        assert_eq!(reply["id"], json!(1));

        gateway.destroy().await;
        tokio::time::timeout(Duration::from_secs(1), gateway.local_closed())
            .await
            .expect("local closed");
    }

    #[tokio::test]
    async fn disabled_transports_refuse_to_start() {
        let gateway = build_gateway(GatewayConfig {
            http_enabled: false,
            ..ephemeral()
        });
        let err = gateway.start().await.expect_err("http disabled");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let gateway = build_gateway(GatewayConfig {
            stdio_enabled: false,
            ..ephemeral()
        });
        let (reader, writer) = tokio::io::duplex(64);
        let err = gateway.connect_local(reader, writer).expect_err("stdio disabled");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
