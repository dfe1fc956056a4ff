use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::counters::{ByteCounters, CountedStream, TargetTracker};
use crate::dispatch::dispatch;
use crate::events::{ConnectionClosedEvent, ConnectionStats, EventBus};
use crate::hook::PrepareRequest;

// How long a client gets to take a failure response and hang up before the
// socket is destroyed underneath it.
const POST_ERROR_GRACE: Duration = Duration::from_secs(1);

/// Server construction options.
#[derive(Clone)]
pub struct ServerOptions {
    /// TCP port to listen on.
    pub port: u16,
    /// Bind address; all interfaces when unset.
    pub host: Option<String>,
    /// Realm for the `Proxy-Authenticate` challenge and the `server`
    /// header on synthesized responses.
    pub auth_realm: String,
    /// Lower the log filter so per-request details show up.
    pub verbose: bool,
    /// Destroy connections that sit idle (no request headers arriving)
    /// for this long. Tunnels established via CONNECT are not affected.
    pub idle_timeout_secs: u64,
    /// User hook consulted once per request.
    pub prepare_request: Option<Arc<dyn PrepareRequest>>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: 8000,
            host: None,
            auth_realm: "ProxyChain".to_string(),
            verbose: false,
            idle_timeout_secs: 60,
            prepare_request: None,
        }
    }
}

/// Monotonic request counters, incremented when a request parses.
#[derive(Debug, Default)]
pub(crate) struct ServerCounters {
    http_request_count: AtomicU64,
    connect_request_count: AtomicU64,
}

impl ServerCounters {
    pub(crate) fn record_parsed(&self, is_connect: bool) {
        if is_connect {
            self.connect_request_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.http_request_count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Point-in-time snapshot of the per-server request counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ServerStatistics {
    pub http_request_count: u64,
    pub connect_request_count: u64,
}

/// One accepted client connection, tracked from accept to close.
pub(crate) struct ConnectionHandle {
    pub(crate) id: u64,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) src_counters: Arc<ByteCounters>,
    pub(crate) targets: Arc<TargetTracker>,
    aborts: Mutex<Vec<AbortHandle>>,
    tunnel: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHandle {
    pub(crate) fn stats_snapshot(&self) -> ConnectionStats {
        let (trg_tx_bytes, trg_rx_bytes) = self.targets.totals();
        ConnectionStats {
            src_tx_bytes: self.src_counters.bytes_written(),
            src_rx_bytes: self.src_counters.bytes_read(),
            trg_tx_bytes,
            trg_rx_bytes,
        }
    }

    /// Track a task that outlives HTTP serving (tunnel splice or bypass
    /// hand-off); the registry waits for it before declaring the
    /// connection closed.
    pub(crate) fn register_tunnel_task(&self, task: JoinHandle<()>) {
        self.aborts.lock().unwrap().push(task.abort_handle());
        *self.tunnel.lock().unwrap() = Some(task);
    }

    /// Arm the post-error grace timer: once the failure response is on its
    /// way out, the client gets one second to close; after that the socket
    /// is destroyed. A no-op when the connection already ended.
    pub(crate) fn schedule_grace_close(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(POST_ERROR_GRACE).await;
            conn.destroy();
        });
    }

    fn destroy(&self) {
        for abort in self.aborts.lock().unwrap().iter() {
            abort.abort();
        }
    }
}

pub(crate) struct ServerState {
    pub(crate) auth_realm: String,
    pub(crate) prepare_request: Option<Arc<dyn PrepareRequest>>,
    pub(crate) events: EventBus,
    pub(crate) stats: ServerCounters,
    idle_timeout: Duration,
    next_connection_id: AtomicU64,
    connections: Mutex<HashMap<u64, Arc<ConnectionHandle>>>,
    drained: Notify,
}

impl ServerState {
    fn connection(&self, id: u64) -> Option<Arc<ConnectionHandle>> {
        self.connections.lock().unwrap().get(&id).cloned()
    }

    fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Runs exactly once per connection, after every task tied to it has
    /// finished or been aborted.
    fn finalize_connection(&self, id: u64) {
        let handle = self.connections.lock().unwrap().remove(&id);
        if let Some(handle) = handle {
            let stats = handle.stats_snapshot();
            let age_ms = (Utc::now() - handle.created_at).num_milliseconds();
            debug!(
                connection_id = id,
                src_tx = stats.src_tx_bytes,
                src_rx = stats.src_rx_bytes,
                age_ms,
                "connection closed"
            );
            self.events.emit_connection_closed(&ConnectionClosedEvent {
                connection_id: id,
                stats,
            });
        }
        if self.connection_count() == 0 {
            self.drained.notify_waiters();
        }
    }

    fn spawn_connection(self: &Arc<Self>, socket: TcpStream, remote_addr: SocketAddr) {
        socket.set_nodelay(true).ok();
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1;
        let src_counters = Arc::new(ByteCounters::default());
        let handle = Arc::new(ConnectionHandle {
            id,
            remote_addr,
            created_at: Utc::now(),
            src_counters: Arc::clone(&src_counters),
            targets: Arc::new(TargetTracker::default()),
            aborts: Mutex::new(Vec::new()),
            tunnel: Mutex::new(None),
        });
        self.connections.lock().unwrap().insert(id, Arc::clone(&handle));
        debug!(connection_id = id, "accepted connection from {}", remote_addr);

        let io = TokioIo::new(CountedStream::new(socket, src_counters));
        let state = Arc::clone(self);
        let conn = Arc::clone(&handle);
        let service = service_fn(move |req| {
            let state = Arc::clone(&state);
            let conn = Arc::clone(&conn);
            async move { Ok::<_, std::convert::Infallible>(dispatch(state, conn, req).await) }
        });

        // The header-read timeout doubles as the idle timeout: it runs
        // whenever the connection sits waiting for a request to start, and
        // hyper tears the connection down when it expires.
        let idle_timeout = self.idle_timeout;
        let serve_task = tokio::spawn(async move {
            let result = hyper::server::conn::http1::Builder::new()
                .preserve_header_case(true)
                .half_close(true)
                .timer(TokioTimer::new())
                .header_read_timeout(idle_timeout)
                .serve_connection(io, service)
                .with_upgrades()
                .await;
            if let Err(err) = result {
                debug!(connection_id = id, "client connection errored: {}", err);
            }
        });
        handle.aborts.lock().unwrap().push(serve_task.abort_handle());

        let state = Arc::clone(self);
        tokio::spawn(async move {
            let _ = serve_task.await;
            let tunnel = handle.tunnel.lock().unwrap().take();
            if let Some(task) = tunnel {
                let _ = task.await;
            }
            state.finalize_connection(id);
        });
    }
}

/// The programmable forwarding proxy server.
///
/// Owns the listener and the connection registry; request behavior is
/// driven by the `prepare_request` hook and observed through the typed
/// event surface.
pub struct Server {
    options: ServerOptions,
    state: Arc<ServerState>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        let state = Arc::new(ServerState {
            auth_realm: options.auth_realm.clone(),
            prepare_request: options.prepare_request.clone(),
            events: EventBus::default(),
            stats: ServerCounters::default(),
            idle_timeout: Duration::from_secs(options.idle_timeout_secs),
            next_connection_id: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
            drained: Notify::new(),
        });
        Self {
            options,
            state,
            listener_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Bind and start accepting connections. Resolves to the bound
    /// address, which carries the actual port when 0 was requested.
    pub async fn listen(&self) -> Result<SocketAddr> {
        if self.listener_task.lock().unwrap().is_some() {
            return Err(anyhow!("server is already listening"));
        }
        let host = self.options.host.clone().unwrap_or_else(|| "0.0.0.0".to_string());
        let listener = TcpListener::bind((host.as_str(), self.options.port)).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap() = Some(addr);
        info!("proxy server listening on {}", addr);

        let state = Arc::clone(&self.state);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => {
                        // A socket that lost its peer before we got to it
                        // is dropped without ceremony.
                        let remote_addr = match socket.peer_addr() {
                            Ok(addr) => addr,
                            Err(_) => continue,
                        };
                        state.spawn_connection(socket, remote_addr);
                    }
                    Err(err) => {
                        warn!("accept failed: {}", err);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                }
            }
        });
        *self.listener_task.lock().unwrap() = Some(task);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn port(&self) -> u16 {
        self.local_addr().map(|a| a.port()).unwrap_or(self.options.port)
    }

    /// Subscribe to lifecycle events here.
    pub fn events(&self) -> &EventBus {
        &self.state.events
    }

    pub fn server_statistics(&self) -> ServerStatistics {
        ServerStatistics {
            http_request_count: self.state.stats.http_request_count.load(Ordering::Relaxed),
            connect_request_count: self
                .state
                .stats
                .connect_request_count
                .load(Ordering::Relaxed),
        }
    }

    /// IDs of all live connections, in no particular order.
    pub fn connection_ids(&self) -> Vec<u64> {
        self.state.connections.lock().unwrap().keys().copied().collect()
    }

    pub fn connection_stats(&self, id: u64) -> Option<ConnectionStats> {
        self.state.connection(id).map(|c| c.stats_snapshot())
    }

    /// Forcibly destroy one connection; its `connectionClosed` event still
    /// fires with the final byte counts.
    pub fn close_connection(&self, id: u64) -> bool {
        match self.state.connection(id) {
            Some(handle) => {
                handle.destroy();
                true
            }
            None => false,
        }
    }

    /// Forcibly destroy every live connection.
    pub fn close_connections(&self) {
        let handles: Vec<_> = self
            .state
            .connections
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for handle in handles {
            handle.destroy();
        }
    }

    /// Stop accepting and wait for the registry to drain. With `force`,
    /// live connections are destroyed instead of awaited.
    pub async fn close(&self, force: bool) -> Result<()> {
        if let Some(task) = self.listener_task.lock().unwrap().take() {
            task.abort();
        }
        if force {
            self.close_connections();
        }
        loop {
            let notified = self.state.drained.notified();
            if self.state.connection_count() == 0 {
                break;
            }
            notified.await;
        }
        *self.local_addr.lock().unwrap() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ConnectionClosedEvent;
    use crate::hook::{
        CustomConnectServer, CustomResponse, PrepareRequestParams, RequestOutcome,
    };
    use bytes::Bytes;
    use futures::FutureExt;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn start(options: ServerOptions) -> (Server, SocketAddr) {
        let server = Server::new(options);
        let addr = server.listen().await.unwrap();
        (server, addr)
    }

    fn options_with_hook<F>(hook: F) -> ServerOptions
    where
        F: Fn(PrepareRequestParams<'_>) -> anyhow::Result<RequestOutcome>
            + Send
            + Sync
            + 'static,
    {
        ServerOptions {
            port: 0,
            prepare_request: Some(Arc::new(hook)),
            ..Default::default()
        }
    }

    fn closed_events(server: &Server) -> mpsc::UnboundedReceiver<ConnectionClosedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        server.events().on_connection_closed(move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    async fn send_and_collect(addr: SocketAddr, request: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut response = Vec::new();
        timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    // Reads one response head (through the blank line) off the stream.
    async fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = timeout(Duration::from_secs(5), stream.read(&mut byte))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "connection closed before response head ended");
            head.push(byte[0]);
            if head.ends_with(b"\r\n\r\n") {
                break;
            }
        }
        String::from_utf8_lossy(&head).into_owned()
    }

    /// Minimal one-shot origin: answers any request with the given bytes,
    /// then closes.
    async fn spawn_origin(response: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                let _ = socket.write_all(response).await;
            }
        });
        addr
    }

    /// TCP echo target for tunnel tests.
    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_direct_forward_end_to_end() {
        let origin = spawn_origin(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello").await;
        let (server, addr) = start(ServerOptions {
            port: 0,
            ..Default::default()
        })
        .await;
        let mut closed = closed_events(&server);

        let request = format!(
            "GET http://{origin}/path HTTP/1.1\r\nhost: {origin}\r\nconnection: close\r\n\r\n"
        );
        let response = send_and_collect(addr, request.as_bytes()).await;
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.ends_with("hello"), "{}", response);

        let stats = server.server_statistics();
        assert_eq!(stats.http_request_count, 1);
        assert_eq!(stats.connect_request_count, 0);

        let event = timeout(Duration::from_secs(5), closed.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(event.stats.src_rx_bytes > 0);
        assert!(event.stats.src_tx_bytes > 0);
        assert!(event.stats.trg_rx_bytes.unwrap() >= 5);
        server.close(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_authentication_required() {
        let options = options_with_hook(|_params| {
            Ok(RequestOutcome::authenticate(Some("nope".to_string())))
        });
        let (server, addr) = start(options).await;

        let response = send_and_collect(
            addr,
            b"GET http://example.com/ HTTP/1.1\r\nhost: example.com\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 407"), "{}", response);
        assert!(
            response.contains("proxy-authenticate: Basic realm=\"ProxyChain\""),
            "{}",
            response
        );
        assert!(response.ends_with("nope"), "{}", response);
        server.close(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_hook_receives_parsed_credentials() {
        let options = options_with_hook(|params| {
            assert_eq!(params.username.as_deref(), Some("john"));
            assert_eq!(params.password.as_deref(), Some("secret"));
            assert_eq!(params.hostname, "example.com");
            assert_eq!(params.port, 443);
            assert!(!params.is_http);
            Ok(RequestOutcome::authenticate(None))
        });
        let (server, addr) = start(options).await;

        // base64("john:secret")
        let response = send_and_collect(
            addr,
            b"CONNECT example.com:443 HTTP/1.1\r\nhost: example.com:443\r\n\
              proxy-authorization: Basic am9objpzZWNyZXQ=\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 407"), "{}", response);
        assert!(response.ends_with("Proxy credentials required."), "{}", response);
        server.close(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_proxy_authorization_is_400() {
        let options = options_with_hook(|_params| Ok(RequestOutcome::direct()));
        let (server, addr) = start(options).await;
        let response = send_and_collect(
            addr,
            b"GET http://example.com/ HTTP/1.1\r\nhost: example.com\r\n\
              proxy-authorization: Bearer token\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 400"), "{}", response);
        assert!(
            response.contains("must use the Basic scheme"),
            "{}",
            response
        );
        server.close(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_absolute_url_is_400_and_uncounted() {
        let (server, addr) = start(ServerOptions {
            port: 0,
            ..Default::default()
        })
        .await;
        let response =
            send_and_collect(addr, b"GET /path HTTP/1.1\r\nhost: example.com\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400"), "{}", response);
        assert!(
            response.contains("Only HTTP protocol is supported"),
            "{}",
            response
        );
        let stats = server.server_statistics();
        assert_eq!(stats.http_request_count + stats.connect_request_count, 0);
        server.close(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_custom_response() {
        let options = options_with_hook(|_params| {
            Ok(RequestOutcome {
                custom_response: Some(Arc::new(|| {
                    async {
                        Ok::<_, anyhow::Error>(CustomResponse {
                            status_code: Some(201),
                            headers: vec![("X-Foo".to_string(), "bar".to_string())],
                            body: Some(Bytes::from_static(b"ok")),
                        })
                    }
                    .boxed()
                })),
                ..Default::default()
            })
        });
        let (server, addr) = start(options).await;

        let (bypassed_tx, mut bypassed_rx) = mpsc::unbounded_channel();
        server.events().on_request_bypassed(move |event| {
            let _ = bypassed_tx.send(event.clone());
        });

        let response = send_and_collect(
            addr,
            b"GET http://x/ HTTP/1.1\r\nhost: x\r\nconnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 201"), "{}", response);
        assert!(response.to_lowercase().contains("x-foo: bar"), "{}", response);
        assert!(response.ends_with("ok"), "{}", response);

        let event = timeout(Duration::from_secs(5), bypassed_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.connection_id, 1);
        server.close(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_direct_tunnel() {
        let echo = spawn_echo().await;
        let (server, addr) = start(ServerOptions {
            port: 0,
            ..Default::default()
        })
        .await;
        let mut closed = closed_events(&server);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let connect = format!("CONNECT {echo} HTTP/1.1\r\nhost: {echo}\r\n\r\n");
        stream.write_all(connect.as_bytes()).await.unwrap();
        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"ping");
        drop(stream);

        let event = timeout(Duration::from_secs(5), closed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.stats.trg_tx_bytes.unwrap(), 4);
        assert_eq!(event.stats.trg_rx_bytes.unwrap(), 4);
        assert_eq!(server.server_statistics().connect_request_count, 1);
        server.close(true).await.unwrap();
    }

    /// Upstream that refuses every CONNECT with 502.
    async fn spawn_refusing_upstream() -> SocketAddr {
        spawn_origin(b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\n\r\n").await
    }

    #[tokio::test]
    async fn test_chain_connect_non_200() {
        let upstream = spawn_refusing_upstream().await;
        let upstream_url = format!("http://{upstream}");
        let options = options_with_hook(move |_params| {
            Ok(RequestOutcome::via_upstream(upstream_url.clone()))
        });
        let (server, addr) = start(options).await;
        let mut closed = closed_events(&server);

        let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();
        server.events().on_tunnel_connect_failed(move |event| {
            let _ = failed_tx.send(event.status);
        });

        let response = send_and_collect(
            addr,
            b"CONNECT example.com:443 HTTP/1.1\r\nhost: example.com:443\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 590"), "{}", response);
        assert!(response.ends_with("UPSTREAM502"), "{}", response);

        let status = timeout(Duration::from_secs(5), failed_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, 502);

        let event = timeout(Duration::from_secs(5), closed.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(event.stats.trg_tx_bytes.is_some());
        assert!(event.stats.trg_rx_bytes.unwrap() > 0);
        server.close(true).await.unwrap();
    }

    /// Upstream that accepts the CONNECT, pushes some bytes right behind
    /// its response head, then echoes.
    async fn spawn_accepting_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                socket
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\nearly")
                    .await
                    .unwrap();
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_chain_connect_success_replays_head_bytes() {
        let upstream = spawn_accepting_upstream().await;
        let upstream_url = format!("http://{upstream}");
        let options = options_with_hook(move |_params| {
            Ok(RequestOutcome::via_upstream(upstream_url.clone()))
        });
        let (server, addr) = start(options).await;

        let (responded_tx, mut responded_rx) = mpsc::unbounded_channel();
        server.events().on_tunnel_connect_responded(move |event| {
            let _ = responded_tx.send((event.status, event.head.clone()));
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nhost: example.com:443\r\n\r\n")
            .await
            .unwrap();
        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

        // The bytes the upstream pushed behind its 200 arrive first.
        let mut buf = [0u8; 5];
        timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"early");

        stream.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"pong");

        let (status, event_head) = timeout(Duration::from_secs(5), responded_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, 200);
        assert_eq!(&event_head[..], b"early");
        server.close(true).await.unwrap();
    }

    /// Minimal SOCKS5 server with username/password auth that reports the
    /// handshake it saw, then echoes.
    async fn spawn_socks5(
        handshake_tx: tokio::sync::oneshot::Sender<(String, String, String, u16)>,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            // Method negotiation: require username/password.
            let mut header = [0u8; 2];
            socket.read_exact(&mut header).await.unwrap();
            assert_eq!(header[0], 0x05);
            let mut methods = vec![0u8; header[1] as usize];
            socket.read_exact(&mut methods).await.unwrap();
            assert!(methods.contains(&0x02), "client did not offer password auth");
            socket.write_all(&[0x05, 0x02]).await.unwrap();

            // RFC 1929 credentials.
            let mut header = [0u8; 2];
            socket.read_exact(&mut header).await.unwrap();
            let mut username = vec![0u8; header[1] as usize];
            socket.read_exact(&mut username).await.unwrap();
            let mut plen = [0u8; 1];
            socket.read_exact(&mut plen).await.unwrap();
            let mut password = vec![0u8; plen[0] as usize];
            socket.read_exact(&mut password).await.unwrap();
            socket.write_all(&[0x01, 0x00]).await.unwrap();

            // CONNECT request with a domain target.
            let mut header = [0u8; 4];
            socket.read_exact(&mut header).await.unwrap();
            assert_eq!(&header[..3], &[0x05, 0x01, 0x00]);
            assert_eq!(header[3], 0x03, "expected a domain address");
            let mut len = [0u8; 1];
            socket.read_exact(&mut len).await.unwrap();
            let mut domain = vec![0u8; len[0] as usize];
            socket.read_exact(&mut domain).await.unwrap();
            let mut port = [0u8; 2];
            socket.read_exact(&mut port).await.unwrap();
            socket
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            let _ = handshake_tx.send((
                String::from_utf8(username).unwrap(),
                String::from_utf8(password).unwrap(),
                String::from_utf8(domain).unwrap(),
                u16::from_be_bytes(port),
            ));

            let mut buf = [0u8; 1024];
            while let Ok(n) = socket.read(&mut buf).await {
                if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_socks5_chain_connect() {
        let (handshake_tx, handshake_rx) = tokio::sync::oneshot::channel();
        let socks = spawn_socks5(handshake_tx).await;
        let upstream_url = format!("socks5h://user:pass@{socks}");
        let options = options_with_hook(move |_params| {
            Ok(RequestOutcome::via_upstream(upstream_url.clone()))
        });
        let (server, addr) = start(options).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nhost: example.com:443\r\n\r\n")
            .await
            .unwrap();
        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

        let (username, password, domain, port) =
            timeout(Duration::from_secs(5), handshake_rx).await.unwrap().unwrap();
        assert_eq!(username, "user");
        assert_eq!(password, "pass");
        assert_eq!(domain, "example.com");
        assert_eq!(port, 443);

        // Bytes now splice through the SOCKS echo.
        stream.write_all(b"tunnel").await.unwrap();
        let mut buf = [0u8; 6];
        timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"tunnel");
        server.close(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_connection_times_out() {
        let (server, addr) = start(ServerOptions {
            port: 0,
            idle_timeout_secs: 1,
            ..Default::default()
        })
        .await;
        let mut closed = closed_events(&server);

        // Open a connection and never send a byte.
        let _idle = TcpStream::connect(addr).await.unwrap();
        let event = timeout(Duration::from_secs(10), closed.recv())
            .await
            .expect("idle connection was not destroyed")
            .unwrap();
        assert_eq!(event.stats.trg_tx_bytes, None);
        assert!(server.connection_ids().is_empty());
        server.close(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_request_closes_within_grace_period() {
        let (server, addr) = start(ServerOptions {
            port: 0,
            ..Default::default()
        })
        .await;
        let mut closed = closed_events(&server);

        // Bad request, then hold the socket open without hanging up.
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /not-absolute HTTP/1.1\r\nhost: x\r\n\r\n")
            .await
            .unwrap();
        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 400"), "{}", head);

        // The server hangs up on its own, well inside the idle timeout.
        let event = timeout(Duration::from_secs(5), closed.recv())
            .await
            .expect("failed connection was not closed")
            .unwrap();
        assert!(event.stats.src_tx_bytes > 0);
        drop(stream);
        server.close(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_single_connection() {
        let (server, addr) = start(ServerOptions {
            port: 0,
            ..Default::default()
        })
        .await;
        let mut closed = closed_events(&server);

        let _client = TcpStream::connect(addr).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while server.connection_ids().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let id = server.connection_ids()[0];
        let stats = server.connection_stats(id).unwrap();
        assert_eq!(stats.trg_tx_bytes, None);
        assert_eq!(stats.trg_rx_bytes, None);

        assert!(server.close_connection(id));
        let event = timeout(Duration::from_secs(5), closed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.connection_id, id);
        assert_eq!(event.stats.trg_tx_bytes, None);
        assert!(!server.close_connection(id));
        server.close(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_forceful_shutdown_closes_all_connections() {
        let (server, addr) = start(ServerOptions {
            port: 0,
            ..Default::default()
        })
        .await;
        let mut closed = closed_events(&server);

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while server.connection_ids().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        server.close(true).await.unwrap();
        for _ in 0..2 {
            timeout(Duration::from_secs(5), closed.recv())
                .await
                .unwrap()
                .unwrap();
        }
        assert!(server.connection_ids().is_empty());

        // The listener no longer accepts.
        let late = TcpStream::connect(addr).await;
        if let Ok(mut stream) = late {
            let mut buf = [0u8; 1];
            let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
                .await
                .unwrap()
                .unwrap_or(0);
            assert_eq!(n, 0);
        }
    }

    #[tokio::test]
    async fn test_custom_connect_bypass() {
        let (connect_server, mut connections) = CustomConnectServer::channel();
        let options = options_with_hook(move |_params| {
            Ok(RequestOutcome {
                custom_connect: Some(connect_server.clone()),
                ..Default::default()
            })
        });
        let (server, addr) = start(options).await;

        // The in-process server just echoes whatever arrives.
        tokio::spawn(async move {
            if let Some(mut io) = connections.recv().await {
                let mut buf = [0u8; 1024];
                while let Ok(n) = io.read(&mut buf).await {
                    if n == 0 || io.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nhost: example.com:443\r\n\r\n")
            .await
            .unwrap();
        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

        stream.write_all(b"bypassed").await.unwrap();
        let mut buf = [0u8; 8];
        timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"bypassed");
        server.close(true).await.unwrap();
    }
}
