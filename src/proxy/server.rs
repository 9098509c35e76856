//! Proxy server: binds the transport endpoint and spawns one handler task
//! per inbound session.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::Notify;

use crate::config::{ConfigError, ServerConfig};
use crate::endpoint::{Endpoint, Incoming, TransportConfig};
use crate::proxy::auth::{AuthGate, Credential};
use crate::proxy::handler::{handle_session, HandlerConfig};

/// Server startup errors. Fatal; nothing is listening when these occur.
#[derive(Debug)]
pub enum ServerError {
    Config(ConfigError),
    Io(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Config(e) => write!(f, "server config error: {}", e),
            ServerError::Io(e) => write!(f, "server bind error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        ServerError::Config(e)
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

/// The proxy server. Accepts transport sessions and drives each through the
/// request handler until shutdown.
pub struct ProxyServer {
    endpoint: Endpoint,
    incoming: Incoming,
    auth: Arc<AuthGate>,
    handler_config: HandlerConfig,
    shutdown: Arc<Notify>,
}

impl ProxyServer {
    /// Validate the config and bind the UDP endpoint.
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let addr = config.listen_addr()?;

        let transport = TransportConfig {
            idle_timeout: config.transport.session_idle(),
        };
        let (endpoint, incoming) = Endpoint::bind(addr, transport).await?;

        let credentials: Vec<Credential> = config
            .credentials
            .iter()
            .cloned()
            .map(Credential::from)
            .collect();

        Ok(ProxyServer {
            endpoint,
            incoming,
            auth: Arc::new(AuthGate::new(credentials)),
            handler_config: HandlerConfig {
                connect_timeout: config.transport.connect_timeout(),
                relay_idle: config.transport.relay_idle(),
            },
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// The bound address, useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    /// Clone the shutdown trigger. Notifying it stops `serve`.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Accept sessions until shutdown. Each session runs in its own task.
    pub async fn serve(mut self) {
        info!("proxy serving on {}", self.local_addr());
        loop {
            tokio::select! {
                maybe = self.incoming.accept() => {
                    match maybe {
                        Some(session) => {
                            debug!(
                                "session {} accepted from {}",
                                session.conv(),
                                session.peer_addr()
                            );
                            let auth = self.auth.clone();
                            let config = self.handler_config.clone();
                            tokio::spawn(handle_session(session, auth, config));
                        }
                        None => break,
                    }
                }
                _ = self.shutdown.notified() => break,
            }
        }
        self.endpoint.close();
        info!("proxy stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialConfig, TransportSettings};
    use crate::endpoint::TransportConfig;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_config() -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:0".into(),
            credentials: vec![CredentialConfig {
                username: "alice".into(),
                password: "s3cret".into(),
            }],
            cert: String::new(),
            key: String::new(),
            verbose: false,
            transport: TransportSettings::default(),
        }
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if let Ok((mut stream, _)) = listener.accept().await {
                    tokio::spawn(async move {
                        let (mut r, mut w) = stream.split();
                        let _ = tokio::io::copy(&mut r, &mut w).await;
                    });
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let mut config = test_config();
        config.credentials.clear();
        assert!(matches!(
            ProxyServer::bind(&config).await,
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_connect_through_server_end_to_end() {
        let echo = echo_server().await;

        let server = ProxyServer::bind(&test_config()).await.unwrap();
        let server_addr = server.local_addr();
        tokio::spawn(server.serve());

        // Dial the proxy over the UDP transport like a real client.
        let (client_ep, _incoming) = Endpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            TransportConfig::default(),
        )
        .await
        .unwrap();
        let mut session = client_ep.open(server_addr).await.unwrap();

        let req = format!(
            "CONNECT {} HTTP/1.1\r\nHost: {}\r\nProxy-Authorization: Basic {}\r\n\r\n",
            echo,
            echo,
            BASE64.encode("alice:s3cret")
        );
        session.write_all(req.as_bytes()).await.unwrap();

        let mut head = Vec::new();
        let mut b = [0u8; 1];
        loop {
            tokio::time::timeout(Duration::from_secs(10), session.read_exact(&mut b))
                .await
                .expect("proxy must answer")
                .unwrap();
            head.push(b[0]);
            if head.ends_with(b"\r\n\r\n") {
                break;
            }
        }
        let head = String::from_utf8_lossy(&head).into_owned();
        assert!(head.contains("200 Connection Established"), "got: {head}");

        session.write_all(b"tunnel payload").await.unwrap();
        let mut buf = vec![0u8; 14];
        tokio::time::timeout(Duration::from_secs(10), session.read_exact(&mut buf))
            .await
            .expect("echo must come back")
            .unwrap();
        assert_eq!(&buf, b"tunnel payload");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unauthenticated_connect_gets_407() {
        let server = ProxyServer::bind(&test_config()).await.unwrap();
        let server_addr = server.local_addr();
        tokio::spawn(server.serve());

        let (client_ep, _incoming) = Endpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            TransportConfig::default(),
        )
        .await
        .unwrap();
        let mut session = client_ep.open(server_addr).await.unwrap();

        session
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 1024];
        let n = tokio::time::timeout(Duration::from_secs(10), session.read(&mut buf))
            .await
            .expect("proxy must answer")
            .unwrap();
        let head = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(head.contains("407"), "got: {head}");
        assert!(head.contains("Proxy-Authenticate: Basic"), "got: {head}");
    }
}
