//! Purpose: Library crate for the `capgate` capability gateway.
//! Exports: `core` (errors), `registry`, `mcp`, `transport`, `session`, `router`, `config`,
//! `lifecycle`.
//! Role: One capability registry served to a local stdio peer and many HTTP sessions at once.
//! Invariants: The registry is frozen before any transport is bound.
//! Invariants: Sessions are isolated; one session's failure never reaches another.
pub mod config;
pub mod core;
pub mod lifecycle;
pub mod mcp;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;
