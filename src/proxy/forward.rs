use std::io;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tracing::debug;

use crate::counters::{ByteCounters, CountedStream};
use crate::error::RequestError;
use crate::events::{RequestFinishedEvent, RequestSummary};
use crate::headers::{basic_auth_header, header_pairs, valid_headers_only};
use crate::hook::ConnectionIo;
use crate::proxy::{HandlerOptions, ProxyBody};
use crate::server::{ConnectionHandle, ServerState};
use crate::statuses::{self, status_for_io_error, status_for_socks_error};
use crate::upstream::{connect_tcp, socks_connect, tls_connect, TransportOptions, UpstreamScheme};

/// Relay a non-CONNECT request to its origin, either directly or through
/// an HTTP(S) or SOCKS upstream. Each request drives its own target
/// connection; there is no pooling.
pub(crate) async fn handle_forward(
    state: &ServerState,
    conn: &ConnectionHandle,
    opts: &HandlerOptions,
    summary: &RequestSummary,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, RequestError> {
    let has_upstream = opts.upstream_proxy.is_some();
    let via_http_upstream = matches!(
        opts.upstream_proxy.as_ref().map(|u| u.scheme),
        Some(UpstreamScheme::Http) | Some(UpstreamScheme::Https)
    );

    let counters = Arc::new(ByteCounters::default());
    let target = open_target(opts, Arc::clone(&counters)).await?;
    let guard = conn.targets.register(counters);

    // Tolerant response parsing: real-world proxies and origins emit
    // slightly non-conformant headers and still expect to be understood.
    let (mut sender, connection) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .allow_obsolete_multiline_headers_in_responses(true)
        .allow_spaces_after_header_name_in_responses(true)
        .ignore_invalid_headers_in_responses(true)
        .handshake(TokioIo::new(target))
        .await
        .map_err(|err| map_upstream_error(&err))?;

    let connection_id = opts.id;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!(connection_id, "target connection ended with error: {}", err);
        }
        guard.finalize();
    });

    let (parts, body) = req.into_parts();

    // Absolute-form toward an HTTP(S) proxy, origin-form otherwise.
    let outgoing_uri: Uri = if via_http_upstream {
        parts.uri.clone()
    } else {
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse()
            .map_err(|_| RequestError::generic("Invalid request path"))?
    };

    let mut builder = Request::builder().method(parts.method.clone()).uri(outgoing_uri);
    for (name, value) in valid_headers_only(&header_pairs(&parts.headers)) {
        builder = builder.header(name, value);
    }
    if let Some(upstream) = &opts.upstream_proxy {
        if via_http_upstream && upstream.has_credentials() {
            let credentials = basic_auth_header(&upstream.url)
                .map_err(|err| RequestError::from_credentials(&err))?;
            builder = builder.header("proxy-authorization", credentials);
        }
    }
    let outgoing = builder
        .body(body)
        .map_err(|err| RequestError::generic(format!("Invalid outgoing request: {}", err)))?;

    let response = sender
        .send_request(outgoing)
        .await
        .map_err(|err| map_upstream_error(&err))?;

    if has_upstream && response.status() == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        return Err(RequestError::new(
            statuses::AUTH_FAILED,
            "Invalid upstream proxy credentials",
        ));
    }

    let (response_parts, response_body) = response.into_parts();
    let status = response_parts.status;

    debug!(
        connection_id,
        request_id = %opts.request_id,
        status = status.as_u16(),
        "forwarded {} {}",
        parts.method,
        summary.uri
    );

    let mut builder = Response::builder().status(status);
    if let Some(reason) = response_parts.extensions.get::<ReasonPhrase>() {
        builder = builder.extension(reason.clone());
    }
    for (name, value) in valid_headers_only(&header_pairs(&response_parts.headers)) {
        builder = builder.header(name, value);
    }
    let client_response = builder
        .body(response_body.boxed())
        .map_err(|err| RequestError::generic(format!("Invalid upstream response: {}", err)))?;

    state.events.emit_request_finished(&RequestFinishedEvent {
        id: opts.request_id.clone(),
        request: summary.clone(),
        connection_id,
        custom_tag: opts.custom_tag.clone(),
        stats: conn.stats_snapshot(),
        response_status: Some(status.as_u16()),
    });

    Ok(client_response)
}

/// Open the socket the request will be sent over, already wrapped for byte
/// counting. For SOCKS upstreams the handshake happens here so the caller
/// always gets a stream that speaks plain HTTP to the origin.
async fn open_target(
    opts: &HandlerOptions,
    counters: Arc<ByteCounters>,
) -> Result<Box<dyn ConnectionIo>, RequestError> {
    match &opts.upstream_proxy {
        None => {
            let stream = connect_tcp(&opts.target_host, opts.target_port, &opts.transport)
                .await
                .map_err(|err| map_connect_error(&err, false))?;
            Ok(Box::new(CountedStream::new(stream, counters)))
        }
        Some(upstream) if upstream.scheme.is_socks() => {
            let socket = connect_tcp(&upstream.host, upstream.port, &TransportOptions::default())
                .await
                .map_err(|err| map_connect_error(&err, true))?;
            let counted = CountedStream::new(socket, counters);
            socks_connect(upstream, counted, &opts.target_host, opts.target_port)
                .await
                .map_err(|err| {
                    let mut mapped =
                        RequestError::new(status_for_socks_error(&err), err.to_string());
                    mapped.unexpected = true;
                    mapped
                })
        }
        Some(upstream) => {
            let socket = connect_tcp(&upstream.host, upstream.port, &TransportOptions::default())
                .await
                .map_err(|err| map_connect_error(&err, true))?;
            let counted = CountedStream::new(socket, counters);
            if upstream.scheme == UpstreamScheme::Https {
                let tls = tls_connect(
                    &upstream.host,
                    counted,
                    opts.ignore_upstream_proxy_certificate,
                )
                .await
                .map_err(|err| map_connect_error(&err, true))?;
                Ok(Box::new(tls))
            } else {
                Ok(Box::new(counted))
            }
        }
    }
}

/// Map a connect-phase error. A direct target whose hostname does not
/// resolve reads as a missing website, not a gateway failure.
pub(crate) fn map_connect_error(err: &io::Error, has_upstream: bool) -> RequestError {
    if !has_upstream && status_for_io_error(err) == statuses::DNS_LOOKUP_FAILED {
        let mut mapped = RequestError::new(404, "Target website does not exist");
        mapped.unexpected = true;
        return mapped;
    }
    RequestError::from_io(err)
}

/// Map a failure reported by the HTTP client machinery. Parse failures on
/// the response mean the upstream spoke something that is not HTTP/1.1
/// (for example a status outside 100-999); transport failures map through
/// the status table.
fn map_upstream_error(err: &hyper::Error) -> RequestError {
    if err.is_parse() {
        let mut mapped = RequestError::new(
            statuses::STATUS_CODE_OUT_OF_RANGE,
            statuses::reason_phrase(statuses::STATUS_CODE_OUT_OF_RANGE),
        );
        mapped.unexpected = true;
        return mapped;
    }
    if let Some(io_err) = find_io_error(err) {
        return RequestError::from_io(io_err);
    }
    RequestError::generic(err.to_string())
}

// Walk the source chain down to the io::Error hyper wrapped, if any.
fn find_io_error<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a io::Error> {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        source = inner.source();
    }
    None
}
