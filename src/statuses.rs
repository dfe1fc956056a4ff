use std::io;

/// Upstream answered the CONNECT with something other than 200.
pub const NON_200_STATUS_CODE: u16 = 590;
/// Upstream returned a status outside 100-999 on a forwarded request.
pub const STATUS_CODE_OUT_OF_RANGE: u16 = 592;
/// DNS lookup of the target or upstream failed.
pub const DNS_LOOKUP_FAILED: u16 = 593;
pub const CONNECTION_REFUSED: u16 = 594;
pub const CONNECTION_RESET: u16 = 595;
pub const BROKEN_PIPE: u16 = 596;
/// Upstream rejected our credentials (401/407).
pub const AUTH_FAILED: u16 = 597;
pub const UPSTREAM_TIMED_OUT: u16 = 504;
pub const GENERIC_ERROR: u16 = 599;

/// Canonical reason phrase for the synthetic bad-gateway codes; falls back
/// to the standard phrase for well-known codes.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        NON_200_STATUS_CODE => "Non Successful",
        STATUS_CODE_OUT_OF_RANGE => "Status Code Out Of Range",
        DNS_LOOKUP_FAILED => "DNS Lookup Failed",
        CONNECTION_REFUSED => "Connection Refused",
        CONNECTION_RESET => "Connection Reset",
        BROKEN_PIPE => "Broken Pipe",
        AUTH_FAILED => "Proxy Authentication Failed",
        GENERIC_ERROR => "Generic Error",
        other => hyper::StatusCode::from_u16(other)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown"),
    }
}

// Resolver failures surface as uncategorized io errors; match on the
// getaddrinfo wording used by glibc and musl.
fn is_dns_failure(err: &io::Error) -> bool {
    let text = err.to_string().to_ascii_lowercase();
    text.contains("failed to lookup address")
        || text.contains("name or service not known")
        || text.contains("no addresses to connect")
        || text.contains("nodename nor servname")
}

/// Map a transport error to the synthetic bad-gateway status it is reported
/// to the client as.
pub fn status_for_io_error(err: &io::Error) -> u16 {
    use io::ErrorKind::*;
    match err.kind() {
        ConnectionRefused => CONNECTION_REFUSED,
        ConnectionReset | ConnectionAborted => CONNECTION_RESET,
        BrokenPipe => BROKEN_PIPE,
        TimedOut => UPSTREAM_TIMED_OUT,
        NotFound => DNS_LOOKUP_FAILED,
        _ if is_dns_failure(err) => DNS_LOOKUP_FAILED,
        _ => GENERIC_ERROR,
    }
}

/// Map a SOCKS handshake failure to a client-facing status.
pub fn status_for_socks_error(err: &tokio_socks::Error) -> u16 {
    use tokio_socks::Error::*;
    match err {
        Io(io_err) => status_for_io_error(io_err),
        ConnectionRefused => CONNECTION_REFUSED,
        HostUnreachable | NetworkUnreachable => DNS_LOOKUP_FAILED,
        PasswordAuthFailure(_) | NoAcceptableAuthMethods => AUTH_FAILED,
        ProxyServerUnreachable => CONNECTION_REFUSED,
        TtlExpired => UPSTREAM_TIMED_OUT,
        _ => GENERIC_ERROR,
    }
}

/// RFC 7231 IMF-fixdate, for the `date` header on synthesized responses.
pub fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}
