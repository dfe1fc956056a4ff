use std::sync::Mutex;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

/// Final byte accounting for one connection. Source counters come straight
/// off the client socket; target counters stay `None` when the connection
/// never opened a socket toward origin or upstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub src_tx_bytes: u64,
    pub src_rx_bytes: u64,
    pub trg_tx_bytes: Option<u64>,
    pub trg_rx_bytes: Option<u64>,
}

/// Plain-data view of a request, carried in lifecycle events.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub method: String,
    pub uri: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionClosedEvent {
    pub connection_id: u64,
    pub stats: ConnectionStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestFailedEvent {
    pub request: RequestSummary,
    pub error: String,
    pub status_code: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestBypassedEvent {
    pub id: String,
    pub request: RequestSummary,
    pub connection_id: u64,
    pub custom_tag: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestFinishedEvent {
    pub id: String,
    pub request: RequestSummary,
    pub connection_id: u64,
    pub custom_tag: Option<Value>,
    pub stats: ConnectionStats,
    pub response_status: Option<u16>,
}

/// Outcome of an upstream CONNECT, shared by the responded/failed events.
/// Head bytes are whatever the upstream delivered past its status line.
#[derive(Debug, Clone)]
pub struct TunnelConnectEvent {
    pub connection_id: u64,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub head: Bytes,
    pub custom_tag: Option<Value>,
}

type Listener<T> = Box<dyn Fn(&T) + Send + Sync>;

struct Listeners<T> {
    subscribers: Mutex<Vec<Listener<T>>>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Listeners<T> {
    fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) {
        self.subscribers.lock().unwrap().push(Box::new(listener));
    }

    // Synchronous fan-out in registration order.
    fn emit(&self, event: &T) {
        for listener in self.subscribers.lock().unwrap().iter() {
            listener(event);
        }
    }
}

/// Typed publish/subscribe surface for the six lifecycle events. Listeners
/// are registered per event and invoked synchronously in registration
/// order.
#[derive(Default)]
pub struct EventBus {
    connection_closed: Listeners<ConnectionClosedEvent>,
    request_failed: Listeners<RequestFailedEvent>,
    request_bypassed: Listeners<RequestBypassedEvent>,
    request_finished: Listeners<RequestFinishedEvent>,
    tunnel_connect_responded: Listeners<TunnelConnectEvent>,
    tunnel_connect_failed: Listeners<TunnelConnectEvent>,
}

impl EventBus {
    pub fn on_connection_closed(&self, f: impl Fn(&ConnectionClosedEvent) + Send + Sync + 'static) {
        self.connection_closed.subscribe(f);
    }

    pub fn on_request_failed(&self, f: impl Fn(&RequestFailedEvent) + Send + Sync + 'static) {
        self.request_failed.subscribe(f);
    }

    pub fn on_request_bypassed(&self, f: impl Fn(&RequestBypassedEvent) + Send + Sync + 'static) {
        self.request_bypassed.subscribe(f);
    }

    pub fn on_request_finished(&self, f: impl Fn(&RequestFinishedEvent) + Send + Sync + 'static) {
        self.request_finished.subscribe(f);
    }

    pub fn on_tunnel_connect_responded(
        &self,
        f: impl Fn(&TunnelConnectEvent) + Send + Sync + 'static,
    ) {
        self.tunnel_connect_responded.subscribe(f);
    }

    pub fn on_tunnel_connect_failed(
        &self,
        f: impl Fn(&TunnelConnectEvent) + Send + Sync + 'static,
    ) {
        self.tunnel_connect_failed.subscribe(f);
    }

    pub(crate) fn emit_connection_closed(&self, event: &ConnectionClosedEvent) {
        self.connection_closed.emit(event);
    }

    pub(crate) fn emit_request_failed(&self, event: &RequestFailedEvent) {
        self.request_failed.emit(event);
    }

    pub(crate) fn emit_request_bypassed(&self, event: &RequestBypassedEvent) {
        self.request_bypassed.emit(event);
    }

    pub(crate) fn emit_request_finished(&self, event: &RequestFinishedEvent) {
        self.request_finished.emit(event);
    }

    pub(crate) fn emit_tunnel_connect_responded(&self, event: &TunnelConnectEvent) {
        self.tunnel_connect_responded.emit(event);
    }

    pub(crate) fn emit_tunnel_connect_failed(&self, event: &TunnelConnectEvent) {
        self.tunnel_connect_failed.emit(event);
    }
}
