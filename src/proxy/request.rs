//! Proxy request parsing.
//!
//! Reads one request head (request line + headers) from the client stream.
//! The parse is bounded: 8 KiB for the whole head, 100 headers. Header
//! order is preserved so the forwarding path can replay it verbatim.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on the request head in bytes.
pub const MAX_REQUEST_BYTES: usize = 8192;
/// Upper bound on the number of headers.
pub const MAX_HEADERS: usize = 100;

/// Request parse errors.
#[derive(Debug)]
pub enum RequestError {
    Io(io::Error),
    /// Request head exceeded `MAX_REQUEST_BYTES` or `MAX_HEADERS`.
    TooLarge,
    Malformed(&'static str),
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::Io(e) => write!(f, "request IO error: {}", e),
            RequestError::TooLarge => write!(f, "request head too large"),
            RequestError::Malformed(what) => write!(f, "malformed request: {}", what),
        }
    }
}

impl std::error::Error for RequestError {}

impl From<io::Error> for RequestError {
    fn from(e: io::Error) -> Self {
        RequestError::Io(e)
    }
}

/// One parsed request head.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    /// Headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// Extracted `Proxy-Authorization` value, if present.
    pub proxy_authorization: Option<String>,
}

/// Read one request head. `Ok(None)` means the client closed cleanly before
/// sending anything (normal end of a keep-alive session).
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<ProxyRequest>, RequestError> {
    let mut budget = MAX_REQUEST_BYTES;

    let request_line = match read_line(reader, &mut budget).await? {
        Some(line) => line,
        None => return Ok(None),
    };

    let mut parts = request_line.trim_end().splitn(3, ' ');
    let method = parts
        .next()
        .filter(|m| !m.is_empty())
        .ok_or(RequestError::Malformed("empty request line"))?
        .to_string();
    let target = parts
        .next()
        .ok_or(RequestError::Malformed("missing target"))?
        .to_string();
    let version = parts
        .next()
        .ok_or(RequestError::Malformed("missing version"))?
        .to_string();
    if !version.starts_with("HTTP/") {
        return Err(RequestError::Malformed("bad version"));
    }

    let mut headers = Vec::new();
    let mut proxy_authorization = None;
    loop {
        let line = read_line(reader, &mut budget)
            .await?
            .ok_or(RequestError::Malformed("eof in headers"))?;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADERS {
            return Err(RequestError::TooLarge);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(RequestError::Malformed("header without colon"))?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            return Err(RequestError::Malformed("empty header name"));
        }
        if name.eq_ignore_ascii_case("proxy-authorization") {
            proxy_authorization = Some(value.to_string());
        }
        headers.push((name.to_string(), value.to_string()));
    }

    Ok(Some(ProxyRequest {
        method,
        target,
        version,
        headers,
        proxy_authorization,
    }))
}

/// Read one CRLF-terminated line byte-wise. `None` only on EOF before the
/// first byte.
async fn read_line<R: AsyncRead + Unpin>(
    reader: &mut R,
    budget: &mut usize,
) -> Result<Option<String>, RequestError> {
    let mut line = Vec::with_capacity(128);
    loop {
        let mut b = [0u8; 1];
        match reader.read(&mut b).await {
            Ok(0) => {
                if line.is_empty() {
                    return Ok(None);
                }
                return Err(RequestError::Malformed("eof mid-line"));
            }
            Ok(_) => {}
            Err(e) => return Err(RequestError::Io(e)),
        }
        if *budget == 0 {
            return Err(RequestError::TooLarge);
        }
        *budget -= 1;
        line.push(b[0]);
        if b[0] == b'\n' {
            break;
        }
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| RequestError::Malformed("non-utf8 header data"))
}

impl ProxyRequest {
    /// CONNECT targets must be `host:port`.
    pub fn connect_target(&self) -> Result<(String, u16), RequestError> {
        let last_colon = self
            .target
            .rfind(':')
            .ok_or(RequestError::Malformed("CONNECT target missing port"))?;
        let host = self.target[..last_colon].trim_matches(|c| c == '[' || c == ']');
        let port: u16 = self.target[last_colon + 1..]
            .parse()
            .map_err(|_| RequestError::Malformed("CONNECT target bad port"))?;
        if host.is_empty() {
            return Err(RequestError::Malformed("CONNECT target missing host"));
        }
        Ok((host.to_string(), port))
    }

    /// Forwarded requests carry an absolute URI. Returns the upstream
    /// host/port plus the origin-form path to send upstream.
    pub fn forward_target(&self) -> Result<(String, u16, String), RequestError> {
        let rest = self
            .target
            .strip_prefix("http://")
            .ok_or(RequestError::Malformed("target is not an absolute http URI"))?;
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(RequestError::Malformed("absolute URI missing host"));
        }
        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let close = bracketed
                .find(']')
                .ok_or(RequestError::Malformed("unterminated IPv6 host"))?;
            let host = bracketed[..close].to_string();
            let port = match bracketed[close + 1..].strip_prefix(':') {
                Some(p) => p
                    .parse()
                    .map_err(|_| RequestError::Malformed("absolute URI bad port"))?,
                None => 80,
            };
            (host, port)
        } else if let Some(i) = authority.rfind(':') {
            let port: u16 = authority[i + 1..]
                .parse()
                .map_err(|_| RequestError::Malformed("absolute URI bad port"))?;
            (authority[..i].to_string(), port)
        } else {
            (authority.to_string(), 80)
        };
        if host.is_empty() {
            return Err(RequestError::Malformed("absolute URI missing host"));
        }
        Ok((host, port, path.to_string()))
    }

    /// Headers to forward upstream: everything except the proxy-specific
    /// hop headers, in original order.
    pub fn strip_hop_headers(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter(|(name, _)| {
                !name.eq_ignore_ascii_case("proxy-authorization")
                    && !name.eq_ignore_ascii_case("proxy-connection")
            })
            .cloned()
            .collect()
    }

    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Declared request body length, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }

    /// Whether the client connection must close after this exchange.
    pub fn wants_close(&self) -> bool {
        if let Some(conn) = self.header("connection").or_else(|| self.header("proxy-connection")) {
            if conn.eq_ignore_ascii_case("close") {
                return true;
            }
            if conn.eq_ignore_ascii_case("keep-alive") {
                return false;
            }
        }
        self.version == "HTTP/1.0"
    }
}
