//! Purpose: Gateway settings and their validation.
//! Exports: `GatewayConfig`, `validate_config`.
//! Role: Single source of limits shared by the CLI, the router, and the lifecycle controller.
//! Invariants: Loopback-only unless explicitly allowed; every limit is positive.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_ENDPOINT_PATH: &str = "/mcp";
pub const DEFAULT_PORT: u16 = 8765;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    pub endpoint_path: String,
    pub allow_non_loopback: bool,
    pub max_body_bytes: u64,
    pub max_sessions: usize,
    pub push_buffer: usize,
    pub shutdown_timeout: Duration,
    pub http_enabled: bool,
    pub stdio_enabled: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            endpoint_path: DEFAULT_ENDPOINT_PATH.to_string(),
            allow_non_loopback: false,
            max_body_bytes: 1024 * 1024,
            max_sessions: 1024,
            push_buffer: 64,
            shutdown_timeout: Duration::from_secs(10),
            http_enabled: true,
            stdio_enabled: true,
        }
    }
}

impl GatewayConfig {
    pub(crate) fn body_limit(&self) -> Result<usize, Error> {
        self.max_body_bytes
            .try_into()
            .map_err(|_| Error::new(ErrorKind::Usage).with_message("--max-body-bytes is too large"))
    }
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Error> {
    if !config.http_enabled && !config.stdio_enabled {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("at least one transport must be enabled")
            .with_hint("Drop --no-http or --no-stdio."));
    }

    if config.http_enabled && !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if !config.endpoint_path.starts_with('/') || config.endpoint_path == "/healthz" {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("invalid endpoint path: {}", config.endpoint_path))
            .with_hint("Use an absolute path like /mcp."));
    }

    if config.max_body_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes must be greater than zero")
            .with_hint("Use a positive value like 1048576."));
    }

    if config.max_body_bytes > usize::MAX as u64 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes exceeds platform limits")
            .with_hint("Use a smaller value that fits in memory."));
    }

    if config.max_sessions == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-sessions must be greater than zero")
            .with_hint("Use a positive value like 1024."));
    }

    if config.push_buffer == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("push buffer must be greater than zero"));
    }

    if config.shutdown_timeout.is_zero() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("shutdown timeout must be greater than zero"));
    }

    Ok(())
}
