//! HTTP/1.1 framing: head parsing, hop-by-hop handling, body relay.
//!
//! The proxy never re-frames a message beyond what forwarding forces:
//! content-length bodies are streamed byte-for-byte, chunked bodies are
//! relayed chunk-for-chunk including trailers, and unframed responses run
//! until upstream EOF.

use anyhow::anyhow;
use std::collections::{HashMap, VecDeque};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADER_COUNT: usize = 128;

/// Which peer a relay touched when it failed. The engine maps client-side
/// faults to `CLIENT_DISCONNECT` and upstream-side faults to 502s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::Client => Side::Upstream,
            Side::Upstream => Side::Client,
        }
    }

    fn wrap(self, err: io::Error) -> RelayError {
        match self {
            Side::Client => RelayError::Client(err),
            Side::Upstream => RelayError::Upstream(err),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("client stream error: {0}")]
    Client(#[source] io::Error),
    #[error("upstream stream error: {0}")]
    Upstream(#[source] io::Error),
    #[error("framing error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

#[derive(Debug)]
pub enum RequestBodyKind {
    None,
    ContentLength(usize),
    Chunked,
}

/// Parsed request head plus whatever body bytes arrived with it.
#[derive(Debug)]
pub struct ParsedRequest {
    pub method: String,
    pub scheme: Scheme,
    /// Hostname only, no port
    pub host: String,
    pub port: u16,
    /// Path including query string
    pub path: String,
    pub version: String,
    /// Wire order and case, duplicates preserved
    pub headers: Vec<(String, String)>,
    /// Name → value, duplicates collapsed to last-wins
    pub header_map: HashMap<String, String>,
    pub body: RequestBodyKind,
    /// Body bytes read past the head
    pub buffered: Vec<u8>,
}

impl ParsedRequest {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Authority exactly as it appears in the absolute URL: the port is
    /// omitted when it is the scheme default.
    pub fn authority(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme.as_str(), self.authority(), self.path)
    }

    /// HTTP/1.1 defaults to keep-alive unless the client says otherwise.
    pub fn keep_alive(&self) -> bool {
        match header_value(&self.header_map, "connection").as_deref() {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version.contains("1.1"),
        }
    }

    /// Upgrade request (e.g. WebSocket): relayed opaquely after a 101.
    pub fn wants_upgrade(&self) -> bool {
        let upgrade_named = header_value(&self.header_map, "upgrade").is_some();
        let connection_upgrade = header_value(&self.header_map, "connection")
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false);
        upgrade_named && connection_upgrade
    }
}

/// Parsed response head plus any body bytes read past it.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub header_map: HashMap<String, String>,
    pub body_prefix: Vec<u8>,
}

impl ResponseHead {
    pub fn content_length(&self) -> Option<usize> {
        header_value(&self.header_map, "content-length").and_then(|v| v.parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        header_value(&self.header_map, "transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Response `Content-Type`, lowercased, parameters retained.
    pub fn content_type(&self) -> Option<String> {
        header_value(&self.header_map, "content-type").map(|v| v.trim().to_lowercase())
    }
}

/// Headers that never travel past a single hop. `Transfer-Encoding` is
/// handled separately because framing can force keeping it.
fn is_hop_by_hop(name: &str) -> bool {
    const HOP_BY_HOP: [&str; 8] = [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "upgrade",
        "proxy-connection",
    ];
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

pub fn header_value(headers: &HashMap<String, String>, name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

/// Read a request head from `stream`.
///
/// Origin-form targets resolve their authority from the `Host` header,
/// falling back to `fallback` (the CONNECT target inside an intercepted
/// tunnel) when the header is absent.
pub async fn read_request_head<S>(
    stream: &mut S,
    default_scheme: Scheme,
    fallback: Option<(&str, u16)>,
) -> anyhow::Result<ParsedRequest>
where
    S: AsyncRead + Unpin,
{
    let (raw_head, buffered) = read_message_head(stream).await?;

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut req = httparse::Request::new(&mut header_storage);
    let status = req.parse(&raw_head)?;
    if status.is_partial() {
        return Err(anyhow!("partial HTTP request head"));
    }

    let method = req.method.unwrap_or("GET").to_string();
    let path_raw = req.path.unwrap_or("/");
    let version = format!("HTTP/1.{}", req.version.unwrap_or(1));
    let headers = headers_from_httparse(req.headers);
    let header_map: HashMap<String, String> = headers.iter().cloned().collect();

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_host_port(path_raw, 443);
        return Ok(ParsedRequest {
            method,
            scheme: Scheme::Https,
            host,
            port,
            path: "/".to_string(),
            version,
            headers,
            header_map,
            body: RequestBodyKind::None,
            buffered,
        });
    }

    let (scheme, host, port, path) =
        resolve_target(path_raw, &header_map, default_scheme, fallback)?;

    let is_chunked = header_value(&header_map, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    let content_length =
        header_value(&header_map, "content-length").and_then(|v| v.parse::<usize>().ok());
    let body = if is_chunked {
        RequestBodyKind::Chunked
    } else if let Some(len) = content_length {
        RequestBodyKind::ContentLength(len)
    } else {
        RequestBodyKind::None
    };

    Ok(ParsedRequest {
        method,
        scheme,
        host,
        port,
        path,
        version,
        headers,
        header_map,
        body,
        buffered,
    })
}

pub async fn read_response_head<S>(stream: &mut S) -> anyhow::Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let (raw_head, body_prefix) = read_message_head(stream).await?;

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut res = httparse::Response::new(&mut header_storage);
    let status = res.parse(&raw_head)?;
    if status.is_partial() {
        return Err(anyhow!("partial HTTP response head"));
    }

    let headers = headers_from_httparse(res.headers);
    let header_map: HashMap<String, String> = headers.iter().cloned().collect();

    Ok(ResponseHead {
        status: res.code.unwrap_or(502),
        reason: res.reason.unwrap_or("").to_string(),
        version: format!("HTTP/1.{}", res.version.unwrap_or(1)),
        headers,
        header_map,
        body_prefix,
    })
}

async fn read_message_head<S>(stream: &mut S) -> anyhow::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(2048);
    let mut temp = [0u8; 4096];

    loop {
        let n = stream.read(&mut temp).await?;
        if n == 0 {
            return Err(anyhow!("connection closed before head completed"));
        }
        buffer.extend_from_slice(&temp[..n]);

        if let Some(pos) = find_head_end(&buffer) {
            let remainder = buffer.split_off(pos);
            return Ok((buffer, remainder));
        }

        if buffer.len() > MAX_HEAD_BYTES {
            return Err(anyhow!("HTTP head exceeds allowed size"));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn headers_from_httparse(headers: &[httparse::Header]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).to_string(),
            )
        })
        .collect()
}

fn resolve_target(
    raw_path: &str,
    header_map: &HashMap<String, String>,
    default_scheme: Scheme,
    fallback: Option<(&str, u16)>,
) -> anyhow::Result<(Scheme, String, u16, String)> {
    if let Some(rest) = raw_path.strip_prefix("http://") {
        let (host, port, path) = parse_authority_form(rest, 80);
        return Ok((Scheme::Http, host, port, path));
    }
    if let Some(rest) = raw_path.strip_prefix("https://") {
        let (host, port, path) = parse_authority_form(rest, 443);
        return Ok((Scheme::Https, host, port, path));
    }

    let fallback_port = fallback
        .map(|(_, port)| port)
        .unwrap_or_else(|| default_scheme.default_port());
    if let Some(host_header) = header_value(header_map, "host") {
        let (host, port) = split_host_port(&host_header, fallback_port);
        return Ok((default_scheme, host, port, raw_path.to_string()));
    }
    if let Some((host, port)) = fallback {
        return Ok((default_scheme, host.to_string(), port, raw_path.to_string()));
    }
    Err(anyhow!("request target has no resolvable authority"))
}

fn parse_authority_form(rest: &str, default_port: u16) -> (String, u16, String) {
    let (host_port, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = split_host_port(host_port, default_port);
    (host, port, path)
}

pub fn split_host_port(input: &str, default_port: u16) -> (String, u16) {
    if let Some((host, port)) = input.rsplit_once(':') {
        if let Ok(parsed) = port.parse::<u16>() {
            return (host.to_string(), parsed);
        }
    }
    (input.to_string(), default_port)
}

/// Serialize the forwarded request head: hop-by-hop headers dropped,
/// `Transfer-Encoding` kept only when chunked framing forces it, and
/// `Connection: close` appended so the origin connection is single-use.
/// Upgrade requests keep their `Connection`/`Upgrade` headers intact.
pub async fn write_forward_head<W>(
    writer: &mut W,
    parsed: &ParsedRequest,
    upgrade: bool,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("{} {} {}\r\n", parsed.method, parsed.path, parsed.version).as_bytes())
        .await?;

    let chunked = matches!(parsed.body, RequestBodyKind::Chunked);
    for (name, value) in &parsed.headers {
        if name.eq_ignore_ascii_case("transfer-encoding") {
            if chunked {
                writer
                    .write_all(format!("{name}: {value}\r\n").as_bytes())
                    .await?;
            }
            continue;
        }
        if upgrade
            && (name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("upgrade"))
        {
            writer
                .write_all(format!("{name}: {value}\r\n").as_bytes())
                .await?;
            continue;
        }
        if is_hop_by_hop(name) {
            continue;
        }
        writer
            .write_all(format!("{name}: {value}\r\n").as_bytes())
            .await?;
    }
    if !upgrade {
        writer.write_all(b"Connection: close\r\n").await?;
    }
    writer.write_all(b"\r\n").await?;
    Ok(())
}

/// Serialize the relayed response head with the same hop-by-hop policy.
/// A 101 keeps its upgrade headers; otherwise the connection token simply
/// reflects whether the client side stays open.
pub async fn write_response_head<W>(
    writer: &mut W,
    head: &ResponseHead,
    client_keep_alive: bool,
    upgrade: bool,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("{} {} {}\r\n", head.version, head.status, head.reason).as_bytes())
        .await?;

    let chunked = head.is_chunked();
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("transfer-encoding") {
            if chunked {
                writer
                    .write_all(format!("{name}: {value}\r\n").as_bytes())
                    .await?;
            }
            continue;
        }
        if upgrade
            && (name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("upgrade"))
        {
            writer
                .write_all(format!("{name}: {value}\r\n").as_bytes())
                .await?;
            continue;
        }
        if is_hop_by_hop(name) {
            continue;
        }
        writer
            .write_all(format!("{name}: {value}\r\n").as_bytes())
            .await?;
    }
    if !upgrade && !client_keep_alive {
        writer.write_all(b"Connection: close\r\n").await?;
    }
    writer.write_all(b"\r\n").await?;
    Ok(())
}

/// Capped capture of one body direction. Tracks the total wire length so
/// the caller can tell whether the stored bytes were cut off.
pub struct BodyCapture {
    buf: Vec<u8>,
    limit: usize,
    total: u64,
}

impl BodyCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            total: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.total += data.len() as u64;
        if self.buf.len() >= self.limit {
            return;
        }
        let remaining = self.limit - self.buf.len();
        let take = remaining.min(data.len());
        self.buf.extend_from_slice(&data[..take]);
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// `(captured bytes, truncated)`; `None` when the body was empty.
    pub fn into_body(self) -> (Option<Vec<u8>>, bool) {
        let truncated = self.total > self.buf.len() as u64;
        if self.buf.is_empty() && !truncated {
            (None, false)
        } else {
            (Some(self.buf), truncated)
        }
    }
}

/// Relay exactly `len` body bytes from `from` to `to`, consuming any
/// already-buffered prefix first.
pub async fn relay_sized<R, W>(
    from: &mut R,
    to: &mut W,
    buffered: &mut Vec<u8>,
    len: usize,
    capture: &mut BodyCapture,
    from_side: Side,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let to_side = from_side.other();
    let mut remaining = len;

    if remaining == 0 {
        return Ok(0);
    }

    if !buffered.is_empty() {
        let take = remaining.min(buffered.len());
        to.write_all(&buffered[..take])
            .await
            .map_err(|e| to_side.wrap(e))?;
        capture.push(&buffered[..take]);
        remaining -= take;
        buffered.drain(..take);
    }

    let mut buf = vec![0u8; 16 * 1024];
    while remaining > 0 {
        let want = buf.len().min(remaining);
        let n = from
            .read(&mut buf[..want])
            .await
            .map_err(|e| from_side.wrap(e))?;
        if n == 0 {
            return Err(from_side.wrap(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed mid-body",
            )));
        }
        to.write_all(&buf[..n]).await.map_err(|e| to_side.wrap(e))?;
        capture.push(&buf[..n]);
        remaining -= n;
    }
    Ok(len as u64)
}

/// Relay a chunked body including trailers. Only chunk payload bytes are
/// captured; framing is passed through untouched. Returns payload length.
pub async fn relay_chunked<R, W>(
    from: &mut R,
    to: &mut W,
    initial: Vec<u8>,
    capture: &mut BodyCapture,
    from_side: Side,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let to_side = from_side.other();
    let mut buffer: VecDeque<u8> = initial.into();
    let mut payload_total = 0u64;

    loop {
        let line = read_crlf_line(&mut buffer, from, from_side).await?;
        if line.len() < 2 {
            return Err(RelayError::Protocol("chunk header missing CRLF".into()));
        }
        to.write_all(&line).await.map_err(|e| to_side.wrap(e))?;

        let size_token = std::str::from_utf8(&line[..line.len() - 2])
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        let chunk_size = usize::from_str_radix(&size_token, 16)
            .map_err(|_| RelayError::Protocol(format!("invalid chunk size: {size_token}")))?;

        if chunk_size == 0 {
            loop {
                let trailer = read_crlf_line(&mut buffer, from, from_side).await?;
                to.write_all(&trailer).await.map_err(|e| to_side.wrap(e))?;
                if trailer == b"\r\n" {
                    break;
                }
            }
            break;
        }

        let data = read_exact_buffered(&mut buffer, from, chunk_size, from_side).await?;
        to.write_all(&data).await.map_err(|e| to_side.wrap(e))?;
        capture.push(&data);
        payload_total += chunk_size as u64;

        let crlf = read_exact_buffered(&mut buffer, from, 2, from_side).await?;
        if crlf != b"\r\n" {
            return Err(RelayError::Protocol("invalid chunk terminator".into()));
        }
        to.write_all(&crlf).await.map_err(|e| to_side.wrap(e))?;
    }

    Ok(payload_total)
}

/// Relay until `from` reaches EOF (responses framed by connection close).
pub async fn relay_until_close<R, W>(
    from: &mut R,
    to: &mut W,
    initial: Vec<u8>,
    capture: &mut BodyCapture,
    from_side: Side,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let to_side = from_side.other();
    let mut total = 0u64;

    if !initial.is_empty() {
        to.write_all(&initial).await.map_err(|e| to_side.wrap(e))?;
        capture.push(&initial);
        total += initial.len() as u64;
    }

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = from.read(&mut buf).await.map_err(|e| from_side.wrap(e))?;
        if n == 0 {
            return Ok(total);
        }
        to.write_all(&buf[..n]).await.map_err(|e| to_side.wrap(e))?;
        capture.push(&buf[..n]);
        total += n as u64;
    }
}

async fn read_crlf_line<R>(
    buffer: &mut VecDeque<u8>,
    stream: &mut R,
    side: Side,
) -> Result<Vec<u8>, RelayError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = find_crlf(buffer) {
            let mut line = Vec::with_capacity(pos + 2);
            for _ in 0..pos + 2 {
                if let Some(b) = buffer.pop_front() {
                    line.push(b);
                }
            }
            return Ok(line);
        }
        fill_buffer(buffer, stream, side).await?;
    }
}

async fn read_exact_buffered<R>(
    buffer: &mut VecDeque<u8>,
    stream: &mut R,
    len: usize,
    side: Side,
) -> Result<Vec<u8>, RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        while out.len() < len {
            match buffer.pop_front() {
                Some(b) => out.push(b),
                None => break,
            }
        }
        if out.len() < len {
            fill_buffer(buffer, stream, side).await?;
        }
    }
    Ok(out)
}

async fn fill_buffer<R>(
    buffer: &mut VecDeque<u8>,
    stream: &mut R,
    side: Side,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut temp = [0u8; 4096];
    let n = stream.read(&mut temp).await.map_err(|e| side.wrap(e))?;
    if n == 0 {
        return Err(side.wrap(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream closed mid-chunk",
        )));
    }
    buffer.extend(&temp[..n]);
    Ok(())
}

fn find_crlf(buffer: &VecDeque<u8>) -> Option<usize> {
    if buffer.len() < 2 {
        return None;
    }
    (0..buffer.len() - 1).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

/// Minimal synthetic response (502s, parse failures).
pub async fn respond_with_status<W>(
    stream: &mut W,
    code: u16,
    message: &str,
    body: &str,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: text/plain\r\n\r\n{}",
        code,
        message,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn parse_request(raw: &[u8], scheme: Scheme) -> ParsedRequest {
        let (mut reader, mut writer) = duplex(4096);
        writer.write_all(raw).await.unwrap();
        drop(writer);
        read_request_head(&mut reader, scheme, None).await.unwrap()
    }

    #[tokio::test]
    async fn parses_absolute_form_with_query() {
        let parsed = parse_request(
            b"GET http://example.test:8080/a/b?x=1 HTTP/1.1\r\nHost: example.test:8080\r\n\r\n",
            Scheme::Http,
        )
        .await;
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.host, "example.test");
        assert_eq!(parsed.port, 8080);
        assert_eq!(parsed.path, "/a/b?x=1");
        assert_eq!(parsed.authority(), "example.test:8080");
        assert_eq!(parsed.url(), "http://example.test:8080/a/b?x=1");
    }

    #[tokio::test]
    async fn default_port_is_omitted_from_authority() {
        let parsed = parse_request(
            b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\n\r\n",
            Scheme::Http,
        )
        .await;
        assert_eq!(parsed.authority(), "example.test");
        assert_eq!(parsed.url(), "http://example.test/");
    }

    #[tokio::test]
    async fn parses_connect_target() {
        let parsed = parse_request(b"CONNECT example.test:443 HTTP/1.1\r\n\r\n", Scheme::Http).await;
        assert!(parsed.is_connect());
        assert_eq!(parsed.host, "example.test");
        assert_eq!(parsed.port, 443);
    }

    #[tokio::test]
    async fn origin_form_uses_fallback_when_host_header_missing() {
        let (mut reader, mut writer) = duplex(4096);
        writer
            .write_all(b"GET /p?q=2 HTTP/1.1\r\nAccept: */*\r\n\r\n")
            .await
            .unwrap();
        drop(writer);
        let parsed = read_request_head(&mut reader, Scheme::Https, Some(("inner.test", 8443)))
            .await
            .unwrap();
        assert_eq!(parsed.host, "inner.test");
        assert_eq!(parsed.port, 8443);
        assert_eq!(parsed.url(), "https://inner.test:8443/p?q=2");
    }

    #[tokio::test]
    async fn duplicate_headers_collapse_last_wins_in_map() {
        let parsed = parse_request(
            b"GET http://a.test/ HTTP/1.1\r\nHost: a.test\r\nX-Dup: one\r\nX-Dup: two\r\n\r\n",
            Scheme::Http,
        )
        .await;
        assert_eq!(parsed.header_map.get("X-Dup").map(String::as_str), Some("two"));
        // The wire list keeps both.
        assert_eq!(
            parsed.headers.iter().filter(|(k, _)| k == "X-Dup").count(),
            2
        );
    }

    #[tokio::test]
    async fn forward_head_strips_hop_by_hop_and_closes() {
        let parsed = parse_request(
            b"GET http://a.test/ HTTP/1.1\r\nHost: a.test\r\nProxy-Connection: keep-alive\r\nKeep-Alive: 30\r\nUpgrade: h2c\r\nAccept: */*\r\n\r\n",
            Scheme::Http,
        )
        .await;

        let mut out = Vec::new();
        write_forward_head(&mut out, &parsed, false).await.unwrap();
        let head = String::from_utf8(out).unwrap();
        assert!(head.starts_with("GET / HTTP/1.1\r\n"));
        assert!(head.contains("Host: a.test\r\n"));
        assert!(head.contains("Accept: */*\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(!head.contains("Proxy-Connection"));
        assert!(!head.contains("Keep-Alive"));
        assert!(!head.contains("Upgrade"));
    }

    #[tokio::test]
    async fn response_head_strips_connection_but_keeps_chunked_framing() {
        let head = ResponseHead {
            status: 200,
            reason: "OK".into(),
            version: "HTTP/1.1".into(),
            headers: vec![
                ("Transfer-Encoding".into(), "chunked".into()),
                ("Connection".into(), "close".into()),
                ("Content-Type".into(), "text/plain".into()),
            ],
            header_map: [
                ("Transfer-Encoding".to_string(), "chunked".to_string()),
                ("Connection".to_string(), "close".to_string()),
                ("Content-Type".to_string(), "text/plain".to_string()),
            ]
            .into_iter()
            .collect(),
            body_prefix: Vec::new(),
        };
        let mut out = Vec::new();
        write_response_head(&mut out, &head, true, false).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(!text.contains("Connection"));
    }

    #[tokio::test]
    async fn chunked_relay_preserves_framing_and_captures_payload() {
        let (mut from, mut feeder) = duplex(4096);
        tokio::spawn(async move {
            feeder
                .write_all(b"4\r\nWire\r\n3;ext=1\r\ntap\r\n0\r\nX-Trailer: t\r\n\r\n")
                .await
                .unwrap();
        });

        let mut relayed = Vec::new();
        let mut capture = BodyCapture::new(1024);
        let total = relay_chunked(&mut from, &mut relayed, Vec::new(), &mut capture, Side::Upstream)
            .await
            .unwrap();

        assert_eq!(total, 7);
        let (body, truncated) = capture.into_body();
        assert_eq!(body.as_deref(), Some(&b"Wiretap"[..]));
        assert!(!truncated);
        let wire = String::from_utf8(relayed).unwrap();
        assert!(wire.contains("3;ext=1\r\n"));
        assert!(wire.contains("X-Trailer: t\r\n"));
    }

    #[tokio::test]
    async fn capture_truncates_at_cap_but_counts_all_bytes() {
        let mut capture = BodyCapture::new(4);
        capture.push(b"abcdef");
        capture.push(b"gh");
        assert_eq!(capture.total(), 8);
        let (body, truncated) = capture.into_body();
        assert_eq!(body.as_deref(), Some(&b"abcd"[..]));
        assert!(truncated);
    }

    #[tokio::test]
    async fn sized_relay_consumes_buffered_prefix_first() {
        let (mut from, mut feeder) = duplex(64);
        tokio::spawn(async move {
            feeder.write_all(b"DEF").await.unwrap();
        });

        let mut out = Vec::new();
        let mut capture = BodyCapture::new(1024);
        let mut buffered = b"ABC".to_vec();
        relay_sized(&mut from, &mut out, &mut buffered, 6, &mut capture, Side::Client)
            .await
            .unwrap();
        assert_eq!(out, b"ABCDEF");
    }

    #[tokio::test]
    async fn keep_alive_defaults_follow_http_version() {
        let v11 = parse_request(
            b"GET http://a.test/ HTTP/1.1\r\nHost: a.test\r\n\r\n",
            Scheme::Http,
        )
        .await;
        assert!(v11.keep_alive());

        let closed = parse_request(
            b"GET http://a.test/ HTTP/1.1\r\nHost: a.test\r\nConnection: close\r\n\r\n",
            Scheme::Http,
        )
        .await;
        assert!(!closed.keep_alive());
    }
}
