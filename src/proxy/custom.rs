use hyper::{Response, StatusCode};
use tracing::debug;

use crate::error::RequestError;
use crate::events::{RequestBypassedEvent, RequestSummary};
use crate::hook::CustomResponseFn;
use crate::proxy::{full_body, HandlerOptions, ProxyBody};
use crate::server::ServerState;

/// Let the user hook synthesize the whole response instead of forwarding.
/// Only reachable for HTTP requests; the dispatcher rejects the combination
/// with CONNECT before routing here.
pub(crate) async fn handle_custom_response(
    state: &ServerState,
    summary: &RequestSummary,
    opts: &HandlerOptions,
    func: &CustomResponseFn,
) -> Result<Response<ProxyBody>, RequestError> {
    if !opts.is_http {
        return Err(RequestError::generic(
            "The custom response option can only be used for HTTP requests.",
        ));
    }

    let custom = func().await.map_err(|err| {
        RequestError::generic(format!("Custom response function failed: {}", err))
    })?;

    let status = custom.status_code.unwrap_or(200);
    let status = StatusCode::from_u16(status)
        .map_err(|_| RequestError::generic(format!("Invalid custom response status {}", status)))?;

    let mut builder = Response::builder().status(status);
    for (name, value) in &custom.headers {
        builder = builder.header(name, value);
    }
    let response = builder
        .body(full_body(custom.body.unwrap_or_default()))
        .map_err(|err| RequestError::generic(format!("Invalid custom response: {}", err)))?;

    debug!(
        connection_id = opts.id,
        request_id = %opts.request_id,
        status = status.as_u16(),
        "request handled by custom response function"
    );
    state.events.emit_request_bypassed(&RequestBypassedEvent {
        id: opts.request_id.clone(),
        request: summary.clone(),
        connection_id: opts.id,
        custom_tag: opts.custom_tag.clone(),
    });

    Ok(response)
}
