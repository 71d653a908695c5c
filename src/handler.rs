//! embedder facing callback surface
//!
//! The engine owns all sockets; embedders see opaque connection ids.
//! HTTPS dispatch hands over ownership of the parsed message. Websocket
//! payloads reach per URI callbacks, either frame by frame or assembled
//! into one logical message. The JSON event layer sits on top of text
//! frames and hands each handler a send capability for replies.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;

use crate::frame::WsFrame;
use crate::http::HttpMessage;

/// opaque connection identity, stable for the life of one connection
pub type ConnId = u64;

pub type AcceptCallback = Arc<dyn Fn(ConnId, SocketAddr) -> bool + Send + Sync>;
pub type HttpsCallback = Arc<dyn Fn(ConnId, HttpMessage) -> bool + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(ConnId) + Send + Sync>;

/// server wide callbacks
///
/// `accept` may veto a fresh connection. `https` receives every parsed
/// non upgrade message and takes ownership of it; returning `false`
/// closes the connection. `close` is the teardown notice.
#[derive(Clone, Default)]
pub struct ServerCallbacks {
    pub accept: Option<AcceptCallback>,
    pub https: Option<HttpsCallback>,
    pub close: Option<CloseCallback>,
}

impl fmt::Debug for ServerCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCallbacks")
            .field("accept", &self.accept.is_some())
            .field("https", &self.https.is_some())
            .field("close", &self.close.is_some())
            .finish()
    }
}

/// assembled delivery: (socket, domain, uri, content, is_text)
pub type AssembledCallback = Arc<dyn Fn(ConnId, &[u8], &str, &[u8], bool) -> bool + Send + Sync>;

/// per frame delivery: (socket, domain, uri, frame), frames arrive unmasked
pub type FragmentedCallback = Arc<dyn Fn(ConnId, &[u8], &str, &WsFrame) -> bool + Send + Sync>;

/// websocket handling for one URI (or a whole domain as fallback)
///
/// When `fragmented` is set every frame is delivered individually and
/// reassembly is the callback's business. Otherwise frames are collected
/// until FIN and `assembled` receives one concatenated payload.
#[derive(Clone, Default)]
pub struct WebsocketConfig {
    /// bound on buffered fragments, zero means unbounded
    pub max_frames: u64,
    pub assembled: Option<AssembledCallback>,
    pub fragmented: Option<FragmentedCallback>,
}

impl WebsocketConfig {
    pub(crate) fn enabled(&self) -> bool {
        self.assembled.is_some() || self.fragmented.is_some()
    }
}

impl fmt::Debug for WebsocketConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebsocketConfig")
            .field("max_frames", &self.max_frames)
            .field("assembled", &self.assembled.is_some())
            .field("fragmented", &self.fragmented.is_some())
            .finish()
    }
}

pub type JsonSend = Arc<dyn Fn(ConnId, &Value) -> bool + Send + Sync>;

/// context handed to an event handler, carrying the reply capability
pub struct EventParameter {
    domain: String,
    uri: String,
    send: JsonSend,
}

impl EventParameter {
    pub(crate) fn new(domain: String, uri: String, send: JsonSend) -> Self {
        Self { domain, uri, send }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// emit a JSON reply as websocket text frame(s) on some connection
    pub fn send(&self, socket: ConnId, value: &Value) -> bool {
        (self.send)(socket, value)
    }
}

impl fmt::Debug for EventParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventParameter")
            .field("domain", &self.domain)
            .field("uri", &self.uri)
            .finish()
    }
}

/// JSON event io registered per URI
///
/// `process` receives every decoded text frame payload of its URI.
/// Returning `false` closes the connection. `close` is invoked with the
/// socket of every connection of the owning domain that goes away.
pub trait EventHandler: Send + Sync {
    fn process(&self, socket: ConnId, parameter: &EventParameter, value: Value) -> bool;

    fn close(&self, _socket: ConnId) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Recorder {
        seen: AtomicU64,
    }

    impl EventHandler for Recorder {
        fn process(&self, socket: ConnId, parameter: &EventParameter, value: Value) -> bool {
            self.seen.store(socket, Ordering::SeqCst);
            parameter.send(socket, &value)
        }
    }

    #[test]
    fn parameter_send_reaches_the_capability() {
        let sent = Arc::new(AtomicU64::new(0));
        let captured = sent.clone();
        let parameter = EventParameter::new(
            "a.test".into(),
            "/chat".into(),
            Arc::new(move |socket, _value| {
                captured.store(socket, Ordering::SeqCst);
                true
            }),
        );
        let handler = Recorder {
            seen: AtomicU64::new(0),
        };
        assert!(handler.process(7, &parameter, Value::Null));
        assert_eq!(handler.seen.load(Ordering::SeqCst), 7);
        assert_eq!(sent.load(Ordering::SeqCst), 7);
        assert_eq!(parameter.domain(), "a.test");
        assert_eq!(parameter.uri(), "/chat");
    }

    #[test]
    fn websocket_config_enablement() {
        let mut config = WebsocketConfig::default();
        assert!(!config.enabled());
        config.assembled = Some(Arc::new(|_, _, _, _, _| true));
        assert!(config.enabled());
    }
}
