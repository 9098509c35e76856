//! Per-session proxy state machine.
//!
//! Each client session walks AwaitingRequest -> Authenticating ->
//! Forwarding or Tunneling -> Closed. Failures map to HTTP error responses
//! on the client side; nothing a single session does can affect another.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::proxy::auth::AuthGate;
use crate::proxy::request::{read_request, ProxyRequest, RequestError};
use crate::relay::{relay, RelayOutcome};

/// Failed auth attempts tolerated before the session closes.
const AUTH_RETRY_MAX: u32 = 3;

/// Handler timing knobs, derived from the server configuration.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub connect_timeout: Duration,
    pub relay_idle: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        HandlerConfig {
            connect_timeout: Duration::from_secs(10),
            relay_idle: Duration::from_secs(60),
        }
    }
}

/// Drive one client session to completion. Consumes the stream.
pub async fn handle_session<S>(mut client: S, auth: Arc<AuthGate>, config: HandlerConfig)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut auth_failures = 0u32;

    loop {
        let request = match read_request(&mut client).await {
            Ok(Some(req)) => req,
            Ok(None) => return, // clean close between requests
            Err(RequestError::Io(e)) => {
                debug!("client read failed: {}", e);
                return;
            }
            Err(e) => {
                debug!("rejecting request: {}", e);
                let _ = respond(&mut client, "400 Bad Request", true).await;
                return;
            }
        };

        if auth
            .authenticate(request.proxy_authorization.as_deref())
            .is_err()
        {
            auth_failures += 1;
            let _ = challenge(&mut client).await;
            if auth_failures >= AUTH_RETRY_MAX {
                warn!("closing session after {} failed auth attempts", auth_failures);
                return;
            }
            continue;
        }

        if request.method == "CONNECT" {
            tunnel(client, &request, &config).await;
            return;
        }

        match forward(&mut client, &request, &config).await {
            Ok(()) if !request.wants_close() => continue,
            Ok(()) => return,
            Err(()) => return,
        }
    }
}

/// CONNECT: dial the target and splice both streams together.
async fn tunnel<S>(mut client: S, request: &ProxyRequest, config: &HandlerConfig)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (host, port) = match request.connect_target() {
        Ok(t) => t,
        Err(e) => {
            debug!("bad CONNECT target {:?}: {}", request.target, e);
            let _ = respond(&mut client, "400 Bad Request", true).await;
            return;
        }
    };

    let upstream = match dial(&host, port, config.connect_timeout).await {
        Ok(s) => s,
        Err(DialError::Timeout) => {
            warn!("CONNECT {}:{} timed out", host, port);
            let _ = respond(&mut client, "504 Gateway Timeout", true).await;
            return;
        }
        Err(DialError::Io(e)) => {
            warn!("CONNECT {}:{} failed: {}", host, port, e);
            let _ = respond(&mut client, "502 Bad Gateway", true).await;
            return;
        }
    };

    if client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .is_err()
    {
        return;
    }

    info!("tunnel opened to {}:{}", host, port);
    match relay(client, upstream, config.relay_idle).await {
        RelayOutcome::Complete(stats) => debug!(
            "tunnel {}:{} done, {}B up / {}B down",
            host, port, stats.to_upstream, stats.to_client
        ),
        RelayOutcome::IdleTimeout(_) => debug!("tunnel {}:{} idled out", host, port),
        RelayOutcome::Error(_, e) => debug!("tunnel {}:{} errored: {}", host, port, e),
    }
}

/// Plain forwarding: replay the request upstream in origin form and stream
/// the response back. The upstream connection is per-request and told to
/// close, so the response ends at EOF without response parsing.
async fn forward<S>(
    client: &mut S,
    request: &ProxyRequest,
    config: &HandlerConfig,
) -> Result<(), ()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (host, port, path) = match request.forward_target() {
        Ok(t) => t,
        Err(e) => {
            debug!("bad forward target {:?}: {}", request.target, e);
            let _ = respond(client, "400 Bad Request", true).await;
            return Err(());
        }
    };

    let mut upstream = match dial(&host, port, config.connect_timeout).await {
        Ok(s) => s,
        Err(DialError::Timeout) => {
            warn!("dial {}:{} timed out", host, port);
            let _ = respond(client, "504 Gateway Timeout", true).await;
            return Err(());
        }
        Err(DialError::Io(e)) => {
            warn!("dial {}:{} failed: {}", host, port, e);
            let _ = respond(client, "502 Bad Gateway", true).await;
            return Err(());
        }
    };

    // Rewritten head: origin-form target, hop headers stripped, original
    // order otherwise.
    let mut head = format!("{} {} {}\r\n", request.method, path, request.version);
    let mut had_connection = false;
    for (name, value) in request.strip_hop_headers() {
        if name.eq_ignore_ascii_case("connection") {
            had_connection = true;
            head.push_str("Connection: close\r\n");
            continue;
        }
        head.push_str(&name);
        head.push_str(": ");
        head.push_str(&value);
        head.push_str("\r\n");
    }
    if !had_connection {
        head.push_str("Connection: close\r\n");
    }
    head.push_str("\r\n");

    if upstream.write_all(head.as_bytes()).await.is_err() {
        let _ = respond(client, "502 Bad Gateway", true).await;
        return Err(());
    }

    // Body, if declared.
    if let Some(len) = request.content_length() {
        if copy_exact(client, &mut upstream, len).await.is_err() {
            return Err(());
        }
    }

    // Response streams back verbatim until upstream EOF.
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match upstream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if client.write_all(&buf[..n]).await.is_err() {
                    return Err(());
                }
            }
            Err(e) => {
                debug!("upstream read from {}:{} failed: {}", host, port, e);
                return Err(());
            }
        }
    }
    let _ = client.flush().await;
    debug!("forwarded {} {} to {}:{}", request.method, path, host, port);
    Ok(())
}

enum DialError {
    Timeout,
    Io(std::io::Error),
}

async fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, DialError> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(DialError::Io(e)),
        Err(_) => Err(DialError::Timeout),
    }
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, mut remaining: u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "body truncated",
            ));
        }
        writer.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(())
}

async fn respond<W: AsyncWrite + Unpin>(
    w: &mut W,
    status: &str,
    close: bool,
) -> std::io::Result<()> {
    let connection = if close { "Connection: close\r\n" } else { "" };
    let head = format!("HTTP/1.1 {}\r\n{}Content-Length: 0\r\n\r\n", status, connection);
    w.write_all(head.as_bytes()).await
}

/// 407 challenge. The session stays open for another attempt.
async fn challenge<W: AsyncWrite + Unpin>(w: &mut W) -> std::io::Result<()> {
    w.write_all(
        b"HTTP/1.1 407 Proxy Authentication Required\r\n\
          Proxy-Authenticate: Basic realm=\"kproxy\"\r\n\
          Content-Length: 0\r\n\r\n",
    )
    .await
}
