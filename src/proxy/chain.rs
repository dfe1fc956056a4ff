use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use hyper::body::Incoming;
use hyper::{Request, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::counters::{ByteCounters, CountedStream};
use crate::error::RequestError;
use crate::events::TunnelConnectEvent;
use crate::headers::basic_auth_header;
use crate::hook::ConnectionIo;
use crate::proxy::{connection_established_response, spawn_tunnel, HandlerOptions, ProxyBody};
use crate::server::{ConnectionHandle, ServerState};
use crate::statuses;
use crate::upstream::{connect_tcp, tls_connect, TransportOptions, UpstreamProxy, UpstreamScheme};

// Upstreams answering a CONNECT with more than this much header data are
// not worth talking to.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// CONNECT chained through an HTTP(S) upstream proxy: forward the CONNECT,
/// relay the upstream's verdict, splice on 200. Any bytes the upstream
/// sent past its response head are replayed to the client ahead of the
/// splice, never treated as an error.
pub(crate) async fn handle_connect_chain(
    state: &ServerState,
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

    let mut stream: Box<dyn ConnectionIo> = if upstream.scheme == UpstreamScheme::Https {
        let tls = tls_connect(
            &upstream.host,
            counted,
            opts.ignore_upstream_proxy_certificate,
        )
        .await
        .map_err(|err| RequestError::from_io(&err))?;
        Box::new(tls)
    } else {
        Box::new(counted)
    };

    // Forward the CONNECT, with upstream credentials when the URL has them.
    let target = format!("{}:{}", opts.target_host, opts.target_port);
    let mut connect_request = format!("CONNECT {0} HTTP/1.1\r\nhost: {0}\r\n", target);
    if upstream.has_credentials() {
        let credentials = basic_auth_header(&upstream.url)
            .map_err(|err| RequestError::from_credentials(&err))?;
        connect_request.push_str(&format!("proxy-authorization: {}\r\n", credentials));
    }
    connect_request.push_str("\r\n");

    stream
        .write_all(connect_request.as_bytes())
        .await
        .map_err(|err| RequestError::from_io(&err))?;

    let (status, headers, head) = read_connect_response(&mut stream).await?;

    if status != 200 {
        debug!(
            connection_id = opts.id,
            status, "upstream refused CONNECT to {}", target
        );
        state.events.emit_tunnel_connect_failed(&TunnelConnectEvent {
            connection_id: opts.id,
            status,
            headers,
            head,
            custom_tag: opts.custom_tag.clone(),
        });
        return Err(RequestError::upstream_non_200(status));
    }

    state
        .events
        .emit_tunnel_connect_responded(&TunnelConnectEvent {
            connection_id: opts.id,
            status,
            headers,
            head: head.clone(),
            custom_tag: opts.custom_tag.clone(),
        });

    debug!(
        connection_id = opts.id,
        request_id = %opts.request_id,
        "tunneling to {} via upstream {}:{}",
        target,
        upstream.host,
        upstream.port
    );

    let on_upgrade = hyper::upgrade::on(req);
    spawn_tunnel(conn, on_upgrade, stream, head, guard);
    Ok(connection_established_response())
}

/// Read the upstream's CONNECT response head and hand back
/// `(status, headers, leftover bytes)`. Parsing is deliberately tolerant;
/// only a mangled status line is fatal.
async fn read_connect_response(
    stream: &mut Box<dyn ConnectionIo>,
) -> Result<(u16, Vec<(String, String)>, Bytes), RequestError> {
    let mut buf = BytesMut::with_capacity(1024);
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(RequestError::generic(
                "Upstream proxy CONNECT response head too large",
            ));
        }
        let n = stream
            .read_buf(&mut buf)
            .await
            .map_err(|err| RequestError::from_io(&err))?;
        if n == 0 {
            let err = std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "upstream closed during CONNECT",
            );
            return Err(RequestError::from_io(&err));
        }
    };

    let head = buf.split_to(head_end);
    let leftover = buf.freeze();

    let text = String::from_utf8_lossy(&head);
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = parse_status_line(status_line).ok_or_else(|| {
        let mut err = RequestError::new(
            statuses::GENERIC_ERROR,
            format!("Malformed CONNECT response from upstream: {:?}", status_line),
        );
        err.unexpected = true;
        err
    })?;

    let headers = lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    Ok((status, headers, leftover))
}

// Position just past the first CRLFCRLF.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_status_line(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}
