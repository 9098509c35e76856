//! Authenticated HTTP proxy over the session transport.
//!
//! This module implements:
//! - HTTP Basic authentication of proxy requests
//! - CONNECT tunneling
//! - absolute-URI request forwarding with keep-alive
//! - the accept loop binding transport sessions to handlers

pub mod auth;
pub mod handler;
pub mod request;
pub mod server;

pub use auth::{AuthError, AuthGate, Credential};
pub use handler::{handle_session, HandlerConfig};
pub use request::{read_request, ProxyRequest, RequestError};
pub use server::{ProxyServer, ServerError};
