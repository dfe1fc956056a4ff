use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tracing::debug;

use crate::error::RequestError;
use crate::events::{RequestBypassedEvent, RequestSummary};
use crate::hook::CustomConnectServer;
use crate::proxy::{connection_established_response, HandlerOptions, ProxyBody};
use crate::server::{ConnectionHandle, ServerState};

/// Hand CONNECT traffic to an in-process server supplied by the user hook.
/// The client gets a plain 200 and the upgraded stream (head bytes
/// included) is pushed into the server's connection channel; no target
/// socket is ever opened, and once the stream is handed over the registry
/// considers the connection closed.
pub(crate) async fn handle_connect_bypass(
    state: &ServerState,
    summary: &RequestSummary,
    conn: &ConnectionHandle,
    opts: &HandlerOptions,
    req: &mut Request<Incoming>,
    server: CustomConnectServer,
) -> Result<Response<ProxyBody>, RequestError> {
    let on_upgrade = hyper::upgrade::on(req);
    let connection_id = opts.id;

    let task = tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                if !server.push(Box::new(TokioIo::new(upgraded))) {
                    debug!(connection_id, "custom connect server is gone");
                }
            }
            Err(err) => {
                debug!(connection_id, "connect upgrade failed: {}", err);
            }
        }
    });
    conn.register_tunnel_task(task);

    debug!(
        connection_id,
        request_id = %opts.request_id,
        "CONNECT handed to custom server"
    );
    state.events.emit_request_bypassed(&RequestBypassedEvent {
        id: opts.request_id.clone(),
        request: summary.clone(),
        connection_id,
        custom_tag: opts.custom_tag.clone(),
    });

    Ok(connection_established_response())
}
