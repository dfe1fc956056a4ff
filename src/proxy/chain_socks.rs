use std::sync::Arc;

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::{Request, Response};
use tracing::debug;

use crate::counters::{ByteCounters, CountedStream};
use crate::error::RequestError;
use crate::proxy::{connection_established_response, spawn_tunnel, HandlerOptions, ProxyBody};
use crate::server::ConnectionHandle;
use crate::statuses::status_for_socks_error;
use crate::upstream::{connect_tcp, socks_connect, TransportOptions, UpstreamProxy};

/// CONNECT chained through a SOCKS upstream: run the SOCKS handshake for
/// the target over a fresh connection to the upstream, reply 200, splice.
pub(crate) async fn handle_connect_socks(
    conn: &ConnectionHandle,
    opts: &HandlerOptions,
    upstream: &UpstreamProxy,
    req: &mut Request<Incoming>,
) -> Result<Response<ProxyBody>, RequestError> {
    let socket = connect_tcp(&upstream.host, upstream.port, &TransportOptions::default())
        .await
        .map_err(|err| RequestError::from_io(&err))?;

    let counters = Arc::new(ByteCounters::default());
    let counted = CountedStream::new(socket, Arc::clone(&counters));
    let guard = conn.targets.register(counters);

    let stream = socks_connect(upstream, counted, &opts.target_host, opts.target_port)
        .await
        .map_err(|err| {
            let mut mapped = RequestError::new(status_for_socks_error(&err), err.to_string());
            mapped.unexpected = true;
            mapped
        })?;

    debug!(
        connection_id = opts.id,
        request_id = %opts.request_id,
        "tunneling to {}:{} via socks{} upstream {}",
        opts.target_host,
        opts.target_port,
        upstream.scheme.socks_version(),
        upstream.host
    );

    let on_upgrade = hyper::upgrade::on(req);
    spawn_tunnel(conn, on_upgrade, stream, Bytes::new(), guard);
    Ok(connection_established_response())
}
