//! kproxy - authenticated HTTP proxy over a reliable UDP session transport.
//!
//! This crate provides:
//! - `frame`/`arq`/`session`/`endpoint`: a from-scratch ARQ transport that
//!   multiplexes ordered, reliable byte streams over one UDP socket
//! - `proxy`: HTTP Basic auth, CONNECT tunneling, and absolute-URI request
//!   forwarding on top of those streams
//! - `relay`: the bidirectional copy engine tunnels run on
//! - `config`: YAML server configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use kproxy::config::ServerConfig;
//! use kproxy::proxy::ProxyServer;
//!
//! let cfg: ServerConfig = kproxy::config::load("kproxy.yaml")?;
//! let server = ProxyServer::bind(&cfg).await?;
//! server.serve().await;
//! ```

pub mod arq;
pub mod config;
pub mod endpoint;
pub mod frame;
pub mod proxy;
pub mod relay;
pub mod session;

// Re-export commonly used types at crate root for convenience
pub use arq::{ArqCore, ArqError};
pub use endpoint::{Endpoint, Incoming, TransportConfig, TransportError};
pub use frame::{Frame, FrameError, Kind, HEADER_SIZE, MAX_SEGMENT_SIZE, MTU};
pub use proxy::{AuthGate, Credential, ProxyRequest, ProxyServer};
pub use relay::{relay, RelayOutcome, RelayStats};
pub use session::{Session, SessionConfig};
