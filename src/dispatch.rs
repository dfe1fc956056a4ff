use std::sync::Arc;

use hyper::body::Incoming;
use hyper::header::{HeaderValue, PROXY_AUTHORIZATION};
use hyper::{Method, Request, Response, StatusCode};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RequestError;
use crate::events::{RequestFailedEvent, RequestSummary};
use crate::headers::parse_authorization_header;
use crate::hook::{PrepareRequestParams, RequestOutcome};
use crate::proxy::{
    full_body, handle_connect_bypass, handle_connect_chain, handle_connect_direct,
    handle_connect_socks, handle_custom_response, handle_forward, HandlerOptions, ProxyBody,
};
use crate::server::{ConnectionHandle, ServerState};
use crate::statuses::http_date;
use crate::upstream::{TransportOptions, UpstreamProxy};

/// Entry point for every request on a connection: parse, authenticate,
/// consult the user hook, route to a handler, render failures.
pub(crate) async fn dispatch(
    state: Arc<ServerState>,
    conn: Arc<ConnectionHandle>,
    mut req: Request<Incoming>,
) -> Response<ProxyBody> {
    let request_id = Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert("request-id", value);
    }
    let summary = RequestSummary {
        method: req.method().to_string(),
        uri: req.uri().to_string(),
        request_id,
    };

    match dispatch_inner(&state, &conn, &summary, req).await {
        Ok(response) => response,
        Err(err) => {
            debug!(
                connection_id = conn.id,
                request_id = %summary.request_id,
                status = err.status(),
                "request failed: {}",
                err.message
            );
            if err.unexpected {
                state.events.emit_request_failed(&RequestFailedEvent {
                    request: summary.clone(),
                    error: err.message.clone(),
                    status_code: err.status(),
                });
            }
            // The response forces connection: close; if the client has not
            // hung up within a second the registry destroys the socket.
            conn.schedule_grace_close();
            failure_response(&err, &state.auth_realm)
        }
    }
}

async fn dispatch_inner(
    state: &ServerState,
    conn: &ConnectionHandle,
    summary: &RequestSummary,
    mut req: Request<Incoming>,
) -> Result<Response<ProxyBody>, RequestError> {
    let is_connect = req.method() == Method::CONNECT;
    let (target_host, target_port) = parse_target(&req, is_connect)?;
    state.stats.record_parsed(is_connect);

    let outcome = run_prepare_hook(state, conn, &req, &target_host, target_port, !is_connect)
        .await?;

    if outcome.request_authentication {
        return Err(RequestError::auth_required(outcome.fail_msg));
    }

    let upstream_proxy = match outcome.upstream_proxy_url.as_deref() {
        Some(url) => Some(UpstreamProxy::parse(url).map_err(RequestError::generic_from)?),
        None => None,
    };

    if outcome.custom_response.is_some() && is_connect {
        return Err(RequestError::generic(
            "The custom response option can only be used for HTTP requests.",
        ));
    }

    let opts = HandlerOptions {
        id: conn.id,
        request_id: summary.request_id.clone(),
        is_http: !is_connect,
        target_host,
        target_port,
        upstream_proxy,
        ignore_upstream_proxy_certificate: outcome.ignore_upstream_proxy_certificate,
        custom_response: outcome.custom_response.clone(),
        custom_connect: outcome.custom_connect.clone(),
        transport: TransportOptions {
            local_address: outcome.local_address,
            ip_family: outcome.ip_family,
            dns_lookup: outcome.dns_lookup.clone(),
        },
        custom_tag: outcome.custom_tag.clone(),
    };

    if !is_connect {
        if let Some(func) = opts.custom_response.clone() {
            return handle_custom_response(state, summary, &opts, &func).await;
        }
        return handle_forward(state, conn, &opts, summary, req).await;
    }

    if let Some(server) = opts.custom_connect.clone() {
        return handle_connect_bypass(state, summary, conn, &opts, &mut req, server).await;
    }
    match &opts.upstream_proxy {
        Some(upstream) if upstream.scheme.is_socks() => {
            handle_connect_socks(conn, &opts, upstream, &mut req).await
        }
        Some(upstream) => handle_connect_chain(state, conn, &opts, upstream, &mut req).await,
        None => handle_connect_direct(conn, &opts, &mut req).await,
    }
}

/// Extract target host and port. CONNECT requires an explicit
/// `host:port` authority; everything else must be an absolute-form
/// `http:` URL.
fn parse_target<B>(req: &Request<B>, is_connect: bool) -> Result<(String, u16), RequestError> {
    if is_connect {
        let unparsable =
            || RequestError::bad_request(format!("Target \"{}\" could not be parsed", req.uri()));
        let authority = req.uri().authority().ok_or_else(unparsable)?;
        let host = authority.host();
        let port = authority.port_u16().ok_or_else(unparsable)?;
        if host.is_empty() {
            return Err(unparsable());
        }
        Ok((host.to_string(), port))
    } else {
        if req.uri().scheme_str() != Some("http") {
            return Err(RequestError::bad_request(format!(
                "Only HTTP protocol is supported (request URL: {})",
                req.uri()
            )));
        }
        let host = req
            .uri()
            .host()
            .ok_or_else(|| {
                RequestError::bad_request(format!(
                    "Only HTTP protocol is supported (request URL: {})",
                    req.uri()
                ))
            })?
            .to_string();
        Ok((host, req.uri().port_u16().unwrap_or(80)))
    }
}

/// Parse client credentials and run the user hook. Without a hook every
/// request passes as-is.
async fn run_prepare_hook(
    state: &ServerState,
    conn: &ConnectionHandle,
    req: &Request<Incoming>,
    hostname: &str,
    port: u16,
    is_http: bool,
) -> Result<RequestOutcome, RequestError> {
    let Some(hook) = &state.prepare_request else {
        return Ok(RequestOutcome::default());
    };

    let mut username = None;
    let mut password = None;
    if let Some(value) = req.headers().get(PROXY_AUTHORIZATION) {
        let value = value
            .to_str()
            .map_err(|_| RequestError::bad_request("Invalid Proxy-Authorization header"))?;
        let parsed = parse_authorization_header(value)
            .ok_or_else(|| RequestError::bad_request("Invalid Proxy-Authorization header"))?;
        if !parsed.auth_type.eq_ignore_ascii_case("basic") {
            return Err(RequestError::bad_request(
                "The Proxy-Authorization header must use the Basic scheme",
            ));
        }
        username = Some(parsed.username);
        password = Some(parsed.password);
    }

    let params = PrepareRequestParams {
        connection_id: conn.id,
        request: req,
        username,
        password,
        hostname: hostname.to_string(),
        port,
        is_http,
    };

    match hook.prepare_request(params).await {
        Ok(outcome) => Ok(outcome),
        // Typed errors from the hook reach the client verbatim; anything
        // else is a hook bug reported as a generic 500.
        Err(err) => match err.downcast::<RequestError>() {
            Ok(typed) => Err(typed),
            Err(other) => Err(RequestError::generic_from(other)),
        },
    }
}

/// Render a failure to the client: plain-text body, forced
/// `connection: close`, the server identification headers, and the Basic
/// challenge on 407.
pub(crate) fn failure_response(err: &RequestError, realm: &str) -> Response<ProxyBody> {
    let body = err.message.clone();
    let mut builder = Response::builder()
        .status(err.status_code)
        .header("connection", "close")
        .header("date", http_date())
        .header("content-length", body.len().to_string())
        .header("server", realm)
        .header("content-type", "text/plain; charset=utf-8");
    if err.status() == 407 {
        builder = builder.header("proxy-authenticate", format!("Basic realm=\"{}\"", realm));
    }
    for (name, value) in &err.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    builder.body(full_body(body)).unwrap_or_else(|render_err| {
        warn!("could not render failure response: {}", render_err);
        let mut response = Response::new(full_body("Internal error"));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}
