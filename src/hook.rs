use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use hyper::body::Incoming;
use hyper::Request;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Everything the proxy knows about a request when it asks the user hook
/// for a routing decision.
pub struct PrepareRequestParams<'a> {
    pub connection_id: u64,
    pub request: &'a Request<Incoming>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub hostname: String,
    pub port: u16,
    pub is_http: bool,
}

/// User hook invoked once per request, after authentication parsing and
/// before dispatch. Return a `RequestError` to surface a verbatim response
/// to the client; any other error is reported as a generic 500.
#[async_trait]
pub trait PrepareRequest: Send + Sync {
    async fn prepare_request(
        &self,
        params: PrepareRequestParams<'_>,
    ) -> anyhow::Result<RequestOutcome>;
}

// Plain closures work as hooks, which keeps tests and simple embedders
// short.
#[async_trait]
impl<F> PrepareRequest for F
where
    F: Fn(PrepareRequestParams<'_>) -> anyhow::Result<RequestOutcome> + Send + Sync,
{
    async fn prepare_request(
        &self,
        params: PrepareRequestParams<'_>,
    ) -> anyhow::Result<RequestOutcome> {
        (self)(params)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn matches(&self, addr: &IpAddr) -> bool {
        match self {
            IpFamily::V4 => addr.is_ipv4(),
            IpFamily::V6 => addr.is_ipv6(),
        }
    }
}

/// Custom DNS resolution for target connections.
pub type DnsLookupFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, std::io::Result<Vec<IpAddr>>> + Send + Sync>;

/// Asynchronous generator of a full client response, bypassing forwarding.
pub type CustomResponseFn =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<CustomResponse>> + Send + Sync>;

/// Response synthesized by a custom-response function. Missing status
/// defaults to 200; the body is raw bytes.
#[derive(Debug, Clone, Default)]
pub struct CustomResponse {
    pub status_code: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

/// Byte stream handed over to a custom-connect server.
pub trait ConnectionIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ConnectionIo for T {}

/// Handle to an in-process server that takes over `CONNECT` traffic.
///
/// The bypass handler pushes the upgraded client stream (head bytes
/// included) into the channel; whatever the user runs on the receiving end
/// owns the connection from then on.
#[derive(Clone)]
pub struct CustomConnectServer {
    connections: mpsc::UnboundedSender<Box<dyn ConnectionIo>>,
}

impl CustomConnectServer {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Box<dyn ConnectionIo>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { connections: tx }, rx)
    }

    pub(crate) fn push(&self, io: Box<dyn ConnectionIo>) -> bool {
        self.connections.send(io).is_ok()
    }
}

/// Routing decision returned by the user hook. All fields are optional;
/// the default routes the request directly to its target. The set of
/// recognized options is closed.
#[derive(Clone, Default)]
pub struct RequestOutcome {
    /// Respond 407 and challenge the client instead of forwarding.
    pub request_authentication: bool,
    pub fail_msg: Option<String>,
    /// Chain through this proxy; `None` means connect directly.
    pub upstream_proxy_url: Option<String>,
    pub ignore_upstream_proxy_certificate: bool,
    /// Synthesize the response instead of forwarding (HTTP requests only).
    pub custom_response: Option<CustomResponseFn>,
    /// Hand CONNECT traffic to an in-process server instead of tunneling.
    pub custom_connect: Option<CustomConnectServer>,
    pub local_address: Option<IpAddr>,
    pub ip_family: Option<IpFamily>,
    pub dns_lookup: Option<DnsLookupFn>,
    /// Opaque value echoed back in lifecycle events.
    pub custom_tag: Option<Value>,
}

impl RequestOutcome {
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn via_upstream(url: impl Into<String>) -> Self {
        Self {
            upstream_proxy_url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn authenticate(fail_msg: Option<String>) -> Self {
        Self {
            request_authentication: true,
            fail_msg,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_family_matching() {
        let v4: IpAddr = "127.0.0.1".parse().unwrap();
        let v6: IpAddr = "::1".parse().unwrap();
        assert!(IpFamily::V4.matches(&v4));
        assert!(!IpFamily::V4.matches(&v6));
        assert!(IpFamily::V6.matches(&v6));
    }

    #[test]
    fn test_outcome_builders() {
        let outcome = RequestOutcome::via_upstream("socks5://sox:1080");
        assert_eq!(
            outcome.upstream_proxy_url.as_deref(),
            Some("socks5://sox:1080")
        );
        assert!(!outcome.request_authentication);

        let outcome = RequestOutcome::authenticate(Some("nope".into()));
        assert!(outcome.request_authentication);
        assert_eq!(outcome.fail_msg.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn test_custom_connect_channel_delivers_streams() {
        let (server, mut rx) = CustomConnectServer::channel();
        let (a, _b) = tokio::io::duplex(16);
        assert!(server.push(Box::new(a)));
        assert!(rx.recv().await.is_some());
    }
}
