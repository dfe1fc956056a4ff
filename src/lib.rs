//! Programmable HTTP/HTTPS forwarding proxy with upstream chaining.
//!
//! Clients speak plain HTTP/1.1 (absolute-form requests and `CONNECT`) to
//! the proxy; a per-request hook decides whether traffic goes directly to
//! the origin, through an HTTP(S) or SOCKS4/4a/5/5h upstream proxy, to a
//! synthesized response, or to an in-process bypass server. Every
//! connection gets byte accounting on both legs and a typed lifecycle
//! event on close.
//!
//! ```no_run
//! use std::sync::Arc;
//! use chainhttp::{PrepareRequestParams, RequestOutcome, Server, ServerOptions};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let server = Server::new(ServerOptions {
//!     port: 8000,
//!     prepare_request: Some(Arc::new(
//!         |params: PrepareRequestParams<'_>| -> anyhow::Result<RequestOutcome> {
//!             if params.username.as_deref() != Some("john") {
//!                 return Ok(RequestOutcome::authenticate(None));
//!             }
//!             Ok(RequestOutcome::via_upstream("socks5://10.0.0.2:1080"))
//!         },
//!     )),
//!     ..Default::default()
//! });
//! server.listen().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod counters;
pub mod error;
pub mod events;
pub mod headers;
pub mod hook;
pub mod statuses;
pub mod upstream;

mod dispatch;
mod proxy;
mod server;

pub use error::RequestError;
pub use events::{
    ConnectionClosedEvent, ConnectionStats, EventBus, RequestBypassedEvent, RequestFailedEvent,
    RequestFinishedEvent, RequestSummary, TunnelConnectEvent,
};
pub use hook::{
    CustomConnectServer, CustomResponse, CustomResponseFn, DnsLookupFn, IpFamily, PrepareRequest,
    PrepareRequestParams, RequestOutcome,
};
pub use server::{Server, ServerOptions, ServerStatistics};
pub use upstream::{UpstreamProxy, UpstreamScheme};
