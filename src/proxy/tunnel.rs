use std::sync::Arc;

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::{Request, Response};
use tracing::debug;

use crate::counters::{ByteCounters, CountedStream};
use crate::error::RequestError;
use crate::proxy::{connection_established_response, spawn_tunnel, HandlerOptions, ProxyBody};
use crate::server::ConnectionHandle;
use crate::upstream::connect_tcp;

/// Plain CONNECT: open a TCP connection to the target and splice the two
/// sockets. The 200 goes out only once the target connection stands.
pub(crate) async fn handle_connect_direct(
    conn: &ConnectionHandle,
    opts: &HandlerOptions,
    req: &mut Request<Incoming>,
) -> Result<Response<ProxyBody>, RequestError> {
    let stream = connect_tcp(&opts.target_host, opts.target_port, &opts.transport)
        .await
        .map_err(|err| super::forward::map_connect_error(&err, false))?;

    let counters = Arc::new(ByteCounters::default());
    let counted = CountedStream::new(stream, Arc::clone(&counters));
    let guard = conn.targets.register(counters);

    debug!(
        connection_id = opts.id,
        request_id = %opts.request_id,
        "tunneling to {}:{}",
        opts.target_host,
        opts.target_port
    );

    let on_upgrade = hyper::upgrade::on(req);
    spawn_tunnel(conn, on_upgrade, counted, Bytes::new(), guard);
    Ok(connection_established_response())
}
