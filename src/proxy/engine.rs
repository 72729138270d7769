//! Proxy engine
//!
//! Accepts client TCP connections, speaks HTTP/1.1, forwards to origins,
//! and records every intercepted request/response pair. `CONNECT` tunnels
//! are either TLS-terminated with a minted leaf certificate or spliced
//! opaquely, depending on configuration.

use crate::config::ProxyConfig;
use crate::events::{ErrorKind, EventBus, ProxyEvent};
use crate::models::{ExchangeCompletion, OpenExchange};
use crate::proxy::cert_minter::CertMinter;
use crate::proxy::http1::{
    self, BodyCapture, ParsedRequest, RelayError, RequestBodyKind, Scheme, Side,
};
use crate::storage::TrafficStore;
use anyhow::{anyhow, bail, Context};
use chrono::Utc;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};
use webpki_roots::TLS_SERVER_ROOTS;

#[cfg(test)]
use std::future::Future;
#[cfg(test)]
use tokio::io::DuplexStream;

/// Bound address and derived metadata returned by [`ProxyEngine::start`].
#[derive(Debug, Clone)]
pub struct StartInfo {
    pub local_addr: SocketAddr,
    /// Where clients can fetch the CA certificate: the local non-loopback
    /// IPv4 address and the sibling port owned by the download helper.
    pub cert_download_url: String,
}

/// The network core. Owns the accept task while running; collaborators
/// are shared, thread-safe components injected at construction.
pub struct ProxyEngine {
    ctx: Arc<ConnCtx>,
    state: Mutex<Option<EngineState>>,
}

struct EngineState {
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    registry: Arc<ConnRegistry>,
}

#[derive(Default)]
struct ConnRegistry {
    active: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Everything a connection task needs, shared behind one `Arc`.
struct ConnCtx {
    config: ProxyConfig,
    minter: Arc<CertMinter>,
    store: Arc<TrafficStore>,
    events: EventBus,
    tls_client: Arc<ClientConfig>,
    #[cfg(test)]
    test_connector: Mutex<Option<Arc<TestConnectorFn>>>,
}

#[cfg(test)]
type TestConnectorFn = dyn Fn(&str, u16) -> Pin<Box<dyn Future<Output = anyhow::Result<UpstreamStream>> + Send>>
    + Send
    + Sync;

impl ProxyEngine {
    pub fn new(
        config: ProxyConfig,
        minter: Arc<CertMinter>,
        store: Arc<TrafficStore>,
        events: EventBus,
    ) -> anyhow::Result<Self> {
        let tls_client = Arc::new(build_tls_client_config()?);
        Ok(Self {
            ctx: Arc::new(ConnCtx {
                config,
                minter,
                store,
                events,
                tls_client,
                #[cfg(test)]
                test_connector: Mutex::new(None),
            }),
            state: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().expect("engine state lock poisoned").is_some()
    }

    /// Bind the listener and begin accepting. Fails if the port is taken.
    pub async fn start(&self) -> anyhow::Result<StartInfo> {
        {
            let state = self.state.lock().expect("engine state lock poisoned");
            if state.is_some() {
                bail!("proxy engine already running");
            }
        }

        let addr = format!("{}:{}", self.ctx.config.host, self.ctx.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding proxy listener on {addr}"))?;
        let local_addr = listener.local_addr()?;
        let cert_download_url = cert_download_url(&self.ctx.config, local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Arc::new(ConnRegistry::default());
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.ctx.clone(),
            shutdown_rx,
            registry.clone(),
        ));

        *self.state.lock().expect("engine state lock poisoned") = Some(EngineState {
            shutdown: shutdown_tx,
            accept_task,
            registry,
        });

        tracing::info!("Proxy listening on {}", local_addr);
        Ok(StartInfo {
            local_addr,
            cert_download_url,
        })
    }

    /// Stop accepting, give in-flight connections a 5 s grace, then drop
    /// whatever is left. Idempotent.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let taken = self
            .state
            .lock()
            .expect("engine state lock poisoned")
            .take();
        let Some(state) = taken else {
            return Ok(());
        };

        let _ = state.shutdown.send(true);
        let _ = state.accept_task.await;

        let deadline = Instant::now() + Duration::from_secs(5);
        while state.registry.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let handles = std::mem::take(
            &mut *state
                .registry
                .handles
                .lock()
                .expect("connection registry lock poisoned"),
        );
        for handle in handles {
            if !handle.is_finished() {
                handle.abort();
            }
        }

        tracing::info!("Proxy stopped");
        Ok(())
    }
}

fn build_tls_client_config() -> anyhow::Result<ClientConfig> {
    let roots = RootCertStore::from_iter(TLS_SERVER_ROOTS.iter().cloned());
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn cert_download_url(config: &ProxyConfig, local_addr: SocketAddr) -> String {
    let ip: IpAddr = if config.host == "0.0.0.0" || config.host == "::" {
        local_nonloopback_ipv4()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    } else {
        config
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    };
    format!("http://{}:{}/", ip, local_addr.port().saturating_add(1))
}

/// The address peers on the LAN can reach us at. A connected UDP socket
/// never sends a packet; it just asks the kernel for the route source.
fn local_nonloopback_ipv4() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
        _ => None,
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ConnCtx>,
    mut shutdown: watch::Receiver<bool>,
    registry: Arc<ConnRegistry>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("Connection from {}", peer);
                    let ctx = ctx.clone();
                    let conn_shutdown = shutdown.clone();
                    let registry_inner = registry.clone();
                    registry.active.fetch_add(1, Ordering::SeqCst);
                    let handle = tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, ctx, conn_shutdown).await {
                            let msg = err.to_string().to_lowercase();
                            if msg.contains("eof")
                                || msg.contains("broken pipe")
                                || msg.contains("connection reset")
                                || msg.contains("connection closed")
                            {
                                tracing::debug!("Connection closed by peer: {:#}", err);
                            } else {
                                tracing::warn!("Connection error: {:#}", err);
                            }
                        }
                        registry_inner.active.fetch_sub(1, Ordering::SeqCst);
                    });
                    let mut handles = registry
                        .handles
                        .lock()
                        .expect("connection registry lock poisoned");
                    handles.retain(|h| !h.is_finished());
                    handles.push(handle);
                }
                Err(err) => tracing::warn!("Accept error: {}", err),
            }
        }
    }
}

/// Did a request/response leave the client connection reusable?
enum Flow {
    KeepAlive,
    Close,
}

/// Per-connection read loop for plain (non-tunneled) clients.
async fn handle_connection<S>(
    mut stream: S,
    ctx: Arc<ConnCtx>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let idle = Duration::from_millis(ctx.config.idle_timeout_ms);
    let mut request_number: u32 = 0;

    loop {
        request_number += 1;
        let parsed = tokio::select! {
            _ = shutdown.changed() => break,
            read = timeout(idle, http1::read_request_head(&mut stream, Scheme::Http, None)) => {
                match read {
                    Err(_) => {
                        tracing::debug!("Idle timeout after {} requests", request_number - 1);
                        break;
                    }
                    Ok(Err(err)) => {
                        if request_number == 1 {
                            tracing::warn!("Failed to parse request: {:#}", err);
                            let _ = http1::respond_with_status(
                                &mut stream,
                                400,
                                "Bad Request",
                                "Unable to parse HTTP request",
                            )
                            .await;
                        } else {
                            tracing::debug!(
                                "Keep-alive connection closed after {} requests",
                                request_number - 1
                            );
                        }
                        break;
                    }
                    Ok(Ok(parsed)) => parsed,
                }
            }
        };
        let req_start = Instant::now();

        if parsed.is_connect() {
            // The connection now belongs to the tunnel.
            handle_connect(stream, parsed, ctx, shutdown).await?;
            return Ok(());
        }

        let keep_alive = parsed.keep_alive();
        let upstream_host = parsed.host.clone();
        let upstream_port = parsed.port;
        let upstream_tls = parsed.scheme == Scheme::Https;

        match process_request(
            &mut stream,
            parsed,
            req_start,
            &upstream_host,
            upstream_port,
            upstream_tls,
            &ctx,
        )
        .await
        {
            Ok(Flow::KeepAlive) if keep_alive => continue,
            Ok(_) => break,
            Err(err) => {
                tracing::debug!("Request processing error: {:#}", err);
                break;
            }
        }
    }

    Ok(())
}

/// `CONNECT` handling: TLS interception when enabled, opaque splice when
/// not. Nothing inside an opaque tunnel is captured.
async fn handle_connect<S>(
    mut stream: S,
    parsed: ParsedRequest,
    ctx: Arc<ConnCtx>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let connect_host = parsed.host.clone();
    let connect_port = parsed.port;

    if !ctx.config.enable_https {
        match connect_upstream(&ctx, &connect_host, connect_port, false).await {
            Ok(mut upstream) => {
                stream
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await?;
                tracing::debug!("Opaque tunnel to {}:{}", connect_host, connect_port);
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
            }
            Err((_, err)) => {
                tracing::warn!(
                    "CONNECT tunnel to {}:{} failed: {:#}",
                    connect_host,
                    connect_port,
                    err
                );
                let _ = stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
            }
        }
        return Ok(());
    }

    intercept_client(stream, connect_host, connect_port, ctx, shutdown).await
}

/// TLS-terminate the client side of a `CONNECT` and loop over plaintext
/// requests inside the tunnel. A handshake failure drops the connection
/// without recording anything.
async fn intercept_client<S>(
    mut stream: S,
    connect_host: String,
    connect_port: u16,
    ctx: Arc<ConnCtx>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let idle = Duration::from_millis(ctx.config.idle_timeout_ms);

    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = match timeout(idle, acceptor).await {
        Err(_) => {
            tracing::debug!("Client never started TLS inside CONNECT to {}", connect_host);
            return Ok(());
        }
        Ok(Err(err)) => {
            tracing::debug!("Client TLS hello failed for {}: {}", connect_host, err);
            return Ok(());
        }
        Ok(Ok(start)) => start,
    };

    // SNI wins over the CONNECT target when the client provides one.
    let hostname = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .unwrap_or_else(|| connect_host.clone());

    let server_config = match ctx.minter.server_config_for(&hostname).await {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("Leaf certificate for {} unavailable: {:#}", hostname, err);
            return Ok(());
        }
    };

    let mut tls_stream = match timeout(idle, start.into_stream(server_config)).await {
        Err(_) => {
            tracing::debug!("Client TLS handshake timed out for {}", hostname);
            return Ok(());
        }
        Ok(Err(err)) => {
            // Usually the client rejecting the intercepted certificate.
            tracing::debug!("Client TLS handshake failed for {}: {}", hostname, err);
            return Ok(());
        }
        Ok(Ok(tls)) => tls,
    };

    let mut request_number: u32 = 0;
    loop {
        request_number += 1;
        let parsed = tokio::select! {
            _ = shutdown.changed() => break,
            read = timeout(
                idle,
                http1::read_request_head(
                    &mut tls_stream,
                    Scheme::Https,
                    Some((hostname.as_str(), connect_port)),
                ),
            ) => {
                match read {
                    Err(_) => {
                        tracing::debug!("Idle timeout inside tunnel to {}", hostname);
                        break;
                    }
                    Ok(Err(err)) => {
                        if request_number == 1 {
                            tracing::warn!("Failed to parse tunneled request: {:#}", err);
                            let _ = http1::respond_with_status(
                                &mut tls_stream,
                                400,
                                "Bad Request",
                                "Unable to parse HTTPS request",
                            )
                            .await;
                        } else {
                            tracing::debug!(
                                "Tunnel to {} closed after {} requests",
                                hostname,
                                request_number - 1
                            );
                        }
                        break;
                    }
                    Ok(Ok(parsed)) => parsed,
                }
            }
        };
        let req_start = Instant::now();
        let keep_alive = parsed.keep_alive();

        match process_request(
            &mut tls_stream,
            parsed,
            req_start,
            &hostname,
            connect_port,
            true,
            &ctx,
        )
        .await
        {
            Ok(Flow::KeepAlive) if keep_alive => continue,
            Ok(_) => break,
            Err(err) => {
                tracing::debug!("Tunneled request processing error: {:#}", err);
                break;
            }
        }
    }

    Ok(())
}

/// Forward one request to its origin and relay the response, recording the
/// exchange and emitting lifecycle events along the way.
async fn process_request<S>(
    client: &mut S,
    mut parsed: ParsedRequest,
    req_start: Instant,
    upstream_host: &str,
    upstream_port: u16,
    upstream_tls: bool,
    ctx: &ConnCtx,
) -> anyhow::Result<Flow>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let open = OpenExchange {
        timestamp_ms: Utc::now().timestamp_millis(),
        method: parsed.method.clone(),
        url: parsed.url(),
        host: parsed.authority(),
        path: parsed.path.clone(),
        request_headers: parsed.header_map.clone(),
        request_body: None,
        request_truncated: false,
    };

    let id = match ctx.store.insert_open(open.clone()).await {
        Ok(id) => Some(id),
        Err(err) => {
            tracing::error!("Failed to open exchange record: {:#}", err);
            ctx.events.emit(ProxyEvent::RequestFailed {
                id: 0,
                error: ErrorKind::StoreWrite,
            });
            None
        }
    };
    if let Some(id) = id {
        ctx.events.emit(ProxyEvent::RequestStarted {
            id,
            exchange: open.clone().into_exchange(id),
        });
    }

    let upgrade_requested = parsed.wants_upgrade();

    let mut upstream =
        match connect_upstream(ctx, upstream_host, upstream_port, upstream_tls).await {
            Ok(upstream) => upstream,
            Err((kind, err)) => {
                tracing::warn!("Upstream unreachable for {}: {:#}", open.url, err);
                let _ = http1::respond_with_status(
                    client,
                    502,
                    "Bad Gateway",
                    "Unable to reach upstream server",
                )
                .await;
                fail_exchange(ctx, id, 502, kind, req_start, None, false).await;
                return Ok(Flow::Close);
            }
        };

    // Stream the request upstream, capturing up to the configured cap.
    let mut request_capture = BodyCapture::new(ctx.config.capture_body_cap_bytes);
    let mut buffered = std::mem::take(&mut parsed.buffered);

    if let Err(err) = http1::write_forward_head(&mut upstream, &parsed, upgrade_requested).await {
        tracing::warn!("Failed to forward request head: {}", err);
        let _ = http1::respond_with_status(client, 502, "Bad Gateway", "Upstream write failed")
            .await;
        let (body, truncated) = request_capture.into_body();
        fail_exchange(ctx, id, 502, ErrorKind::UpstreamProtocol, req_start, body, truncated).await;
        return Ok(Flow::Close);
    }

    let body_result = match &parsed.body {
        RequestBodyKind::None => Ok(0),
        RequestBodyKind::ContentLength(len) => {
            http1::relay_sized(
                client,
                &mut upstream,
                &mut buffered,
                *len,
                &mut request_capture,
                Side::Client,
            )
            .await
        }
        RequestBodyKind::Chunked => {
            http1::relay_chunked(
                client,
                &mut upstream,
                std::mem::take(&mut buffered),
                &mut request_capture,
                Side::Client,
            )
            .await
        }
    };
    if let Err(relay_err) = body_result {
        let (status, kind, respond) = classify_request_relay(&relay_err);
        tracing::debug!("Request body relay failed: {}", relay_err);
        if let Some((code, label, text)) = respond {
            let _ = http1::respond_with_status(client, code, label, text).await;
        }
        let (body, truncated) = request_capture.into_body();
        fail_exchange(ctx, id, status, kind, req_start, body, truncated).await;
        return Ok(Flow::Close);
    }
    let _ = upstream.flush().await;

    // Wait for the origin's response head within the configured budget.
    let header_budget = Duration::from_millis(ctx.config.upstream_header_timeout_ms);
    let mut head = match timeout(header_budget, http1::read_response_head(&mut upstream)).await {
        Err(_) => {
            tracing::warn!("Upstream response headers timed out for {}", open.url);
            let _ = http1::respond_with_status(
                client,
                502,
                "Bad Gateway",
                "Upstream response timed out",
            )
            .await;
            let (body, truncated) = request_capture.into_body();
            fail_exchange(ctx, id, 502, ErrorKind::Timeout, req_start, body, truncated).await;
            return Ok(Flow::Close);
        }
        Ok(Err(err)) => {
            tracing::warn!("Failed to read response head: {:#}", err);
            let _ = http1::respond_with_status(
                client,
                502,
                "Bad Gateway",
                "Failed to read upstream response",
            )
            .await;
            let (body, truncated) = request_capture.into_body();
            fail_exchange(
                ctx,
                id,
                502,
                ErrorKind::UpstreamProtocol,
                req_start,
                body,
                truncated,
            )
            .await;
            return Ok(Flow::Close);
        }
        Ok(Ok(head)) => head,
    };

    let (request_body, request_truncated) = request_capture.into_body();

    // Opaque protocol upgrade: record the 101 and degrade to a splice.
    if head.status == 101 && upgrade_requested {
        if let Err(err) = http1::write_response_head(client, &head, true, true).await {
            tracing::debug!("Client went away during 101 relay: {}", err);
            complete_exchange(
                ctx,
                id,
                &open,
                failure_completion(
                    0,
                    ErrorKind::ClientDisconnect,
                    req_start,
                    request_body,
                    request_truncated,
                ),
                Some(ErrorKind::ClientDisconnect),
            )
            .await;
            return Ok(Flow::Close);
        }
        let relay_prefix = async {
            if !head.body_prefix.is_empty() {
                client.write_all(&head.body_prefix).await?;
            }
            client.flush().await
        }
        .await;
        if let Err(err) = relay_prefix {
            tracing::debug!("Client went away during 101 relay: {}", err);
            complete_exchange(
                ctx,
                id,
                &open,
                failure_completion(
                    0,
                    ErrorKind::ClientDisconnect,
                    req_start,
                    request_body,
                    request_truncated,
                ),
                Some(ErrorKind::ClientDisconnect),
            )
            .await;
            return Ok(Flow::Close);
        }

        let completion = ExchangeCompletion {
            status: 101,
            response_headers: Some(head.header_map.clone()),
            content_type: head.content_type(),
            duration_ms: req_start.elapsed().as_millis() as u64,
            request_body,
            request_truncated: Some(request_truncated),
            ..Default::default()
        };
        complete_exchange(ctx, id, &open, completion, None).await;

        tracing::debug!("Upgraded connection for {}; relaying opaquely", open.url);
        let _ = tokio::io::copy_bidirectional(client, &mut upstream).await;
        return Ok(Flow::Close);
    }

    let keep_alive = parsed.keep_alive();
    if let Err(err) = http1::write_response_head(client, &head, keep_alive, false).await {
        tracing::debug!("Client went away before response head: {}", err);
        complete_exchange(
            ctx,
            id,
            &open,
            failure_completion(
                0,
                ErrorKind::ClientDisconnect,
                req_start,
                request_body,
                request_truncated,
            ),
            Some(ErrorKind::ClientDisconnect),
        )
        .await;
        return Ok(Flow::Close);
    }

    let mut response_capture = BodyCapture::new(ctx.config.capture_body_cap_bytes);
    let body_prefix = std::mem::take(&mut head.body_prefix);
    let relay_result = if head.is_chunked() {
        http1::relay_chunked(
            &mut upstream,
            client,
            body_prefix,
            &mut response_capture,
            Side::Upstream,
        )
        .await
    } else if let Some(len) = head.content_length() {
        let mut prefix = body_prefix;
        if prefix.len() > len {
            prefix.truncate(len);
        }
        http1::relay_sized(
            &mut upstream,
            client,
            &mut prefix,
            len,
            &mut response_capture,
            Side::Upstream,
        )
        .await
    } else {
        // No framing: the origin signals the end by closing.
        http1::relay_until_close(
            &mut upstream,
            client,
            body_prefix,
            &mut response_capture,
            Side::Upstream,
        )
        .await
    };
    let _ = client.flush().await;

    match relay_result {
        Ok(size_bytes) => {
            let (response_body, response_truncated) = response_capture.into_body();
            if response_truncated {
                tracing::debug!(
                    "Response body for {} truncated at capture cap ({})",
                    open.url,
                    ErrorKind::TruncatedBody
                );
            }
            let completion = ExchangeCompletion {
                status: head.status,
                response_headers: Some(head.header_map.clone()),
                response_body,
                content_type: head.content_type(),
                duration_ms: req_start.elapsed().as_millis() as u64,
                size_bytes,
                response_truncated,
                error_kind: None,
                request_body,
                request_truncated: Some(request_truncated),
            };
            complete_exchange(ctx, id, &open, completion, None).await;
            Ok(Flow::KeepAlive)
        }
        Err(relay_err) => {
            tracing::debug!("Response relay failed: {}", relay_err);
            let kind = match &relay_err {
                RelayError::Client(_) => ErrorKind::ClientDisconnect,
                RelayError::Upstream(_) | RelayError::Protocol(_) => ErrorKind::UpstreamProtocol,
            };
            // A client disconnect leaves the exchange unresponded per the
            // capture contract; an upstream fault keeps the wire status.
            let status = match kind {
                ErrorKind::ClientDisconnect => 0,
                _ => head.status,
            };
            let mut completion = failure_completion(
                status,
                kind,
                req_start,
                request_body,
                request_truncated,
            );
            completion.response_headers = Some(head.header_map.clone());
            completion.content_type = head.content_type();
            complete_exchange(ctx, id, &open, completion, Some(kind)).await;
            Ok(Flow::Close)
        }
    }
}

fn classify_request_relay(
    err: &RelayError,
) -> (u16, ErrorKind, Option<(u16, &'static str, &'static str)>) {
    match err {
        RelayError::Client(_) => (0, ErrorKind::ClientDisconnect, None),
        RelayError::Upstream(_) => (
            502,
            ErrorKind::UpstreamProtocol,
            Some((502, "Bad Gateway", "Upstream write failed")),
        ),
        RelayError::Protocol(_) => (
            0,
            ErrorKind::ClientDisconnect,
            Some((400, "Bad Request", "Malformed request body")),
        ),
    }
}

fn failure_completion(
    status: u16,
    kind: ErrorKind,
    req_start: Instant,
    request_body: Option<Vec<u8>>,
    request_truncated: bool,
) -> ExchangeCompletion {
    ExchangeCompletion {
        status,
        duration_ms: req_start.elapsed().as_millis() as u64,
        error_kind: Some(kind.as_str().to_string()),
        request_body,
        request_truncated: Some(request_truncated),
        ..Default::default()
    }
}

/// Close out a failed exchange that never produced a usable response.
async fn fail_exchange(
    ctx: &ConnCtx,
    id: Option<i64>,
    status: u16,
    kind: ErrorKind,
    req_start: Instant,
    request_body: Option<Vec<u8>>,
    request_truncated: bool,
) {
    let Some(id) = id else { return };
    let completion = failure_completion(status, kind, req_start, request_body, request_truncated);
    if let Err(err) = ctx.store.complete(id, completion).await {
        tracing::error!("Failed to close out exchange {}: {:#}", id, err);
    }
    ctx.events.emit(ProxyEvent::RequestFailed { id, error: kind });
}

/// Persist a completion and emit the matching terminal event.
async fn complete_exchange(
    ctx: &ConnCtx,
    id: Option<i64>,
    open: &OpenExchange,
    completion: ExchangeCompletion,
    failure: Option<ErrorKind>,
) {
    let Some(id) = id else { return };
    let mut view = open.clone().into_exchange(id);
    completion.clone().apply(&mut view);

    if let Err(err) = ctx.store.complete(id, completion).await {
        tracing::error!("Failed to persist exchange {}: {:#}", id, err);
        ctx.events.emit(ProxyEvent::RequestFailed {
            id,
            error: ErrorKind::StoreWrite,
        });
        return;
    }
    match failure {
        Some(kind) => ctx.events.emit(ProxyEvent::RequestFailed { id, error: kind }),
        None => ctx
            .events
            .emit(ProxyEvent::RequestCompleted { id, exchange: view }),
    }
}

enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    #[cfg(test)]
    Test(DuplexStream),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            #[cfg(test)]
            UpstreamStream::Test(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_write(cx, data),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, data),
            #[cfg(test)]
            UpstreamStream::Test(stream) => Pin::new(stream).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            #[cfg(test)]
            UpstreamStream::Test(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            #[cfg(test)]
            UpstreamStream::Test(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Open a connection to the origin, TLS-wrapped and validated against the
/// trust bundle when the exchange is HTTPS. Failures come back classified
/// so the caller can record the right error kind.
async fn connect_upstream(
    ctx: &ConnCtx,
    host: &str,
    port: u16,
    tls: bool,
) -> Result<UpstreamStream, (ErrorKind, anyhow::Error)> {
    #[cfg(test)]
    {
        let connector = ctx
            .test_connector
            .lock()
            .expect("test connector lock poisoned")
            .clone();
        if let Some(connector) = connector {
            return connector(host, port)
                .await
                .map_err(|err| (ErrorKind::UpstreamConnect, err));
        }
    }

    let budget = Duration::from_millis(ctx.config.upstream_connect_timeout_ms);
    let started = Instant::now();

    let stream = match timeout(budget, TcpStream::connect((host, port))).await {
        Err(_) => {
            return Err((
                ErrorKind::Timeout,
                anyhow!("connecting to {host}:{port} timed out"),
            ))
        }
        Ok(Err(err)) => {
            let kind = if is_dns_failure(&err) {
                ErrorKind::DnsFailure
            } else {
                ErrorKind::UpstreamConnect
            };
            return Err((
                kind,
                anyhow::Error::new(err).context(format!("connecting to {host}:{port}")),
            ));
        }
        Ok(Ok(stream)) => stream,
    };

    if !tls {
        return Ok(UpstreamStream::Plain(stream));
    }

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| (ErrorKind::UpstreamTls, anyhow!("invalid server name {host}")))?;
    let connector = TlsConnector::from(ctx.tls_client.clone());
    let remaining = budget.saturating_sub(started.elapsed());
    match timeout(remaining, connector.connect(server_name, stream)).await {
        Err(_) => Err((
            ErrorKind::Timeout,
            anyhow!("TLS handshake with {host}:{port} timed out"),
        )),
        Ok(Err(err)) => Err((
            ErrorKind::UpstreamTls,
            anyhow::Error::new(err).context(format!("TLS handshake with {host}:{port}")),
        )),
        Ok(Ok(tls_stream)) => Ok(UpstreamStream::Tls(Box::new(tls_stream))),
    }
}

fn is_dns_failure(err: &io::Error) -> bool {
    err.to_string().to_lowercase().contains("failed to lookup address")
}
