use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::ext::ReasonPhrase;
use hyper::upgrade::OnUpgrade;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::counters::TargetGuard;
use crate::hook::{CustomConnectServer, CustomResponseFn};
use crate::upstream::{TransportOptions, UpstreamProxy};

mod bypass;
mod chain;
mod chain_socks;
mod custom;
mod forward;
mod tunnel;

pub(crate) use bypass::handle_connect_bypass;
pub(crate) use chain::handle_connect_chain;
pub(crate) use chain_socks::handle_connect_socks;
pub(crate) use custom::handle_custom_response;
pub(crate) use forward::handle_forward;
pub(crate) use tunnel::handle_connect_direct;

/// Unified body type returned to the client.
pub(crate) type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub(crate) fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub(crate) fn empty_body() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

/// Per-request routing decision assembled by the dispatcher from the parsed
/// request and the user-hook outcome.
pub struct HandlerOptions {
    /// Connection ID the request arrived on.
    pub id: u64,
    /// Opaque ID stamped into the `request-id` header.
    pub request_id: String,
    /// True for everything except `CONNECT`.
    pub is_http: bool,
    pub target_host: String,
    pub target_port: u16,
    pub upstream_proxy: Option<UpstreamProxy>,
    pub ignore_upstream_proxy_certificate: bool,
    pub custom_response: Option<CustomResponseFn>,
    pub custom_connect: Option<CustomConnectServer>,
    pub transport: TransportOptions,
    pub custom_tag: Option<Value>,
}

/// The `200 Connection Established` reply to a client CONNECT.
pub(crate) fn connection_established_response() -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::OK;
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}

// After a tunnel error, let the client drain buffered bytes for up to one
// second before the socket is dropped.
pub(crate) async fn grace_close<S: AsyncRead + Unpin>(stream: &mut S) {
    let mut sink = [0u8; 1024];
    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
    })
    .await;
}

/// Wait for the client upgrade, replay any bytes the target delivered ahead
/// of the splice, then pipe both directions until either side closes.
///
/// `copy_bidirectional` gives the half-close semantics the tunnel needs: a
/// shutdown on one side drains and propagates, an error tears down both.
/// The guard finalizes target byte accounting whatever way the tunnel ends,
/// and the registry holds the connection open until the task is done.
pub(crate) fn spawn_tunnel<T>(
    conn: &crate::server::ConnectionHandle,
    on_upgrade: OnUpgrade,
    mut target: T,
    target_head: Bytes,
    guard: TargetGuard,
) where
    T: AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let connection_id = conn.id;
    let task = tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                if !target_head.is_empty() {
                    if let Err(err) = client.write_all(&target_head).await {
                        debug!(connection_id, "tunnel head replay failed: {}", err);
                        guard.finalize();
                        return;
                    }
                }
                match copy_bidirectional(&mut client, &mut target).await {
                    Ok((to_target, to_client)) => {
                        debug!(connection_id, to_target, to_client, "tunnel closed");
                    }
                    Err(err) => {
                        debug!(connection_id, "tunnel errored: {}", err);
                        drop(target);
                        grace_close(&mut client).await;
                    }
                }
            }
            Err(err) => {
                debug!(connection_id, "connect upgrade failed: {}", err);
            }
        }
        guard.finalize();
    });
    conn.register_tunnel_task(task);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_established_reason_phrase() {
        let response = connection_established_response();
        assert_eq!(response.status(), StatusCode::OK);
        let reason = response.extensions().get::<ReasonPhrase>().unwrap();
        assert_eq!(reason.as_bytes(), b"Connection Established");
    }

    #[tokio::test]
    async fn test_grace_close_returns_on_eof() {
        let (mut client, server) = tokio::io::duplex(16);
        drop(server);
        // Must return promptly instead of waiting the full second.
        let start = std::time::Instant::now();
        grace_close(&mut client).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
