//! Downstream WebSocket handling.
//!
//! - [`connection`]: connection ids, per-connection state and the registry
//! - [`handler`]: frame dispatch and subscription fan-out
//! - [`session`]: socket lifecycle from upgrade to teardown

pub mod connection;
pub mod handler;
pub mod session;
