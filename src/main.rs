//! Purpose: `capgate` CLI entry point.
//! Role: Parses flags, registers the built-in capabilities, runs the gateway until stopped.
//! Invariants: stdout carries only JSON-RPC lines for the local peer; logs and errors go to stderr.
//! Invariants: Process exit code is derived from `to_exit_code`.
use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod builtin;

use capgate::config::{DEFAULT_ENDPOINT_PATH, GatewayConfig};
use capgate::core::error::{Error, ErrorKind, to_exit_code};
use capgate::lifecycle::Gateway;
use capgate::mcp::Implementation;

#[derive(Parser, Debug)]
#[command(
    name = "capgate",
    version,
    about = "Serve one capability registry over stdio and session-multiplexed HTTP",
    long_about = r#"Serve one capability registry over stdio and session-multiplexed HTTP.

The local peer speaks newline-delimited JSON-RPC on stdin/stdout.
Remote peers POST an initialize request to the endpoint, receive an
mcp-session-id header, and send it on every later request."#,
    after_help = r#"EXAMPLES
  $ capgate                              # stdio + http://127.0.0.1:8765/mcp
  $ capgate --no-stdio --bind 127.0.0.1:9000
  $ capgate --no-http                    # local peer only; exits on stdin EOF

NOTES
  - Logs go to stderr; set RUST_LOG=debug for more detail.
  - Non-loopback binds require --allow-non-loopback."#
)]
struct Cli {
    /// Address for the HTTP endpoint.
    #[arg(long, default_value = "127.0.0.1:8765")]
    bind: SocketAddr,
    /// Path of the session endpoint.
    #[arg(long, default_value = DEFAULT_ENDPOINT_PATH)]
    path: String,
    /// Allow binding a non-loopback address.
    #[arg(long)]
    allow_non_loopback: bool,
    /// Maximum request body size in bytes.
    #[arg(long, default_value_t = 1024 * 1024)]
    max_body_bytes: u64,
    /// Maximum number of live HTTP sessions.
    #[arg(long, default_value_t = 1024)]
    max_sessions: usize,
    /// Seconds to wait for in-flight work during shutdown.
    #[arg(long, default_value_t = 10)]
    shutdown_timeout_secs: u64,
    /// Do not serve the local stdio peer.
    #[arg(long)]
    no_stdio: bool,
    /// Do not serve the HTTP endpoint.
    #[arg(long)]
    no_http: bool,
    /// Server name reported during initialize.
    #[arg(long)]
    name: Option<String>,
    /// Server version reported during initialize.
    #[arg(long)]
    server_version: Option<String>,
}

impl Cli {
    fn config(&self) -> GatewayConfig {
        GatewayConfig {
            bind: self.bind,
            endpoint_path: self.path.clone(),
            allow_non_loopback: self.allow_non_loopback,
            max_body_bytes: self.max_body_bytes,
            max_sessions: self.max_sessions,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            http_enabled: !self.no_http,
            stdio_enabled: !self.no_stdio,
            ..GatewayConfig::default()
        }
    }

    fn implementation(&self) -> Implementation {
        let defaults = Implementation::default();
        Implementation::new(
            self.name.clone().unwrap_or(defaults.name),
            self.server_version.clone().unwrap_or(defaults.version),
        )
    }
}

fn main() {
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                return Ok(0);
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(first_line(&err.to_string()))
                    .with_hint("Run `capgate --help` for usage."));
            }
        },
    };

    init_tracing();

    let implementation = cli.implementation();
    let registry = builtin::builtin_registry(&implementation)?;
    let gateway = Gateway::new(cli.config(), implementation, registry)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })?;
    let result = runtime.block_on(serve(&gateway));
    // Blocking stdin reads cannot be cancelled; do not wait on them.
    runtime.shutdown_background();
    result.map(|()| 0)
}

async fn serve(gateway: &Gateway) -> Result<(), Error> {
    let config = gateway.config();
    if config.http_enabled {
        let addr = gateway.start().await?;
        info!(
            url = %format!("http://{addr}{}", config.endpoint_path),
            "accepting sessions"
        );
    }
    if config.stdio_enabled {
        gateway.connect_stdio()?;
    }

    if config.http_enabled {
        shutdown_signal().await;
    } else {
        tokio::select! {
            _ = shutdown_signal() => {}
            _ = gateway.local_closed() => info!("local peer closed stdin"),
        }
    }

    info!("shutting down");
    gateway.destroy().await;
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

fn first_line(text: &str) -> String {
    text.lines()
        .next()
        .unwrap_or("invalid arguments")
        .trim_start_matches("error: ")
        .to_string()
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert(
        "message".to_string(),
        json!(err.message().unwrap_or("error")),
    );
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(session) = err.session() {
        inner.insert("session".to_string(), json!(session));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }
    json!({ "error": Value::Object(inner) })
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut current = std::error::Error::source(err);
    while let Some(source) = current {
        causes.push(source.to_string());
        current = source.source();
    }
    causes
}

fn emit_error(err: &Error) {
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}
