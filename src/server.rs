//! the io engine
//!
//! One accept loop per listener, one task per connection, one reaper.
//! A connection starts as HTTP/1.1 over TLS, may upgrade to websocket in
//! place, and is driven by a single loop multiplexing inbound bytes,
//! the outbound queue and cancellation. Run under a current thread
//! runtime this is a single threaded cooperative event loop; handlers
//! must not block.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_rustls::rustls;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{FrameConfig, HttpMessageConfig, ServerConfig};
use crate::connection::{
    CloseState, ConnShared, ConnectionType, Defrag, Reassembly, CLOSE_RESPONSE_DELAY,
};
use crate::domain::{Domain, DomainTable, SniResolver};
use crate::errors::{HttpError, ProtocolError, ServerError};
use crate::frame::{OpCode, WsFrame};
use crate::handler::{ConnId, EventHandler, EventParameter, ServerCallbacks, WebsocketConfig};
use crate::handshake::{self, Upgrade};
use crate::http::HttpMessage;
use crate::send::{write_outbound, Outbound};
use crate::Parsing;

/// a running edge server; cheap to clone, all clones share one instance
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    config: ServerConfig,
    callbacks: ServerCallbacks,
    domains: Arc<DomainTable>,
    registry: Mutex<HashMap<ConnId, ConnEntry>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    https_addr: SocketAddr,
    redirect_addr: Option<SocketAddr>,
}

struct ConnEntry {
    shared: Arc<ConnShared>,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ServerInner {
    fn entry(&self, id: ConnId) -> Option<(Arc<ConnShared>, mpsc::UnboundedSender<Outbound>)> {
        let registry = self.registry.lock().expect("connection registry lock");
        registry.get(&id).map(|e| (e.shared.clone(), e.tx.clone()))
    }

    fn open_connections(&self) -> usize {
        self.registry.lock().expect("connection registry lock").len()
    }
}

impl Server {
    /// load the domain table, bind the listeners and start serving
    pub async fn create(
        config: ServerConfig,
        callbacks: ServerCallbacks,
    ) -> Result<Server, ServerError> {
        let config = config.init();
        let domains = Arc::new(DomainTable::load(&config.domains)?);

        let tls = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SniResolver::new(domains.clone())));
        let acceptor = TlsAcceptor::from(Arc::new(tls));

        let https = TcpListener::bind((
            config.sockets.https.bind_host(config.ip4_only),
            config.sockets.https.port,
        ))
        .await?;
        let https_addr = https.local_addr()?;

        let redirect = match &config.sockets.http {
            Some(spec) => Some(TcpListener::bind((spec.bind_host(config.ip4_only), spec.port)).await?),
            None => None,
        };
        let redirect_addr = match &redirect {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };

        if !config.sockets.stun.is_empty() {
            debug!(
                count = config.sockets.stun.len(),
                "stun sockets configured, not served by this instance"
            );
        }

        let inner = Arc::new(ServerInner {
            config,
            callbacks,
            domains,
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            https_addr,
            redirect_addr,
        });

        info!(
            name = %inner.config.name,
            %https_addr,
            domains = inner.domains.len(),
            "https listener up"
        );

        tokio::spawn(accept_loop(inner.clone(), https, acceptor));
        if let Some(listener) = redirect {
            tokio::spawn(redirect_loop(inner.clone(), listener));
        }
        tokio::spawn(reaper(inner.clone()));

        Ok(Server { inner })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn https_addr(&self) -> SocketAddr {
        self.inner.https_addr
    }

    pub fn redirect_addr(&self) -> Option<SocketAddr> {
        self.inner.redirect_addr
    }

    pub fn open_connections(&self) -> usize {
        self.inner.open_connections()
    }

    pub fn find_domain(&self, hostname: &[u8]) -> Option<Arc<Domain>> {
        self.inner.domains.find(hostname)
    }

    /// register websocket handling for `uri` of a domain, or as the
    /// domain wide fallback when `uri` is `None`
    pub fn configure_websocket_callback(
        &self,
        hostname: &[u8],
        uri: Option<&str>,
        config: WebsocketConfig,
    ) -> Result<(), ServerError> {
        let domain = self.inner.domains.find(hostname).ok_or_else(|| {
            ServerError::UnknownDomain(String::from_utf8_lossy(hostname).into_owned())
        })?;
        domain.set_websocket_config(uri, config)
    }

    /// register a JSON event handler under `uri` of a domain
    pub fn configure_uri_event_io(
        &self,
        hostname: &[u8],
        uri: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), ServerError> {
        let domain = self.inner.domains.find(hostname).ok_or_else(|| {
            ServerError::UnknownDomain(String::from_utf8_lossy(hostname).into_owned())
        })?;
        domain.set_event_handler(uri, handler)
    }

    /// queue raw bytes on a handshaked secure connection; bytes are
    /// either transmitted completely or the connection dies
    pub fn send_secure(&self, socket: ConnId, data: BytesMut) -> bool {
        let Some((shared, tx)) = self.inner.entry(socket) else {
            return false;
        };
        if !shared.handshaked.load(Ordering::Acquire) {
            return false;
        }
        tx.send(Outbound::Raw(data)).is_ok()
    }

    /// send a JSON value as websocket text frame(s)
    pub fn send_json(&self, socket: ConnId, value: &Value) -> bool {
        send_json_inner(&self.inner, socket, value)
    }

    /// trigger the close procedure of one connection
    pub fn close(&self, socket: ConnId) -> bool {
        let Some((shared, _)) = self.inner.entry(socket) else {
            return false;
        };
        shared.cancel.cancel();
        true
    }

    /// stop accepting and close every connection
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let registry = self.inner.registry.lock().expect("connection registry lock");
        for entry in registry.values() {
            entry.shared.cancel.cancel();
        }
    }

    pub(crate) fn connection_domain(&self, socket: ConnId) -> Option<Arc<Domain>> {
        let (shared, _) = self.inner.entry(socket)?;
        shared.domain.get().cloned()
    }
}

fn send_json_inner(inner: &Arc<ServerInner>, socket: ConnId, value: &Value) -> bool {
    let Some((shared, tx)) = inner.entry(socket) else {
        warn!(socket, "connection gone, dropping json send");
        return false;
    };
    if !shared.handshaked.load(Ordering::Acquire) {
        return false;
    }

    let text = value.to_string();
    let bytes = text.as_bytes();
    let chunk = inner.config.limits.websocket;
    let frame_config = inner.config.websocket;

    if chunk == 0 || bytes.len() < chunk {
        let frame = WsFrame::data(frame_config, OpCode::Text, true, bytes);
        return tx.send(Outbound::Frame(frame)).is_ok();
    }

    // fragmented text sequence: start, continuations, last
    let start = WsFrame::data(frame_config, OpCode::Text, false, &bytes[..chunk]);
    if tx.send(Outbound::Frame(start)).is_err() {
        return false;
    }
    let mut offset = chunk;
    while bytes.len() - offset > chunk {
        let mid = WsFrame::data(
            frame_config,
            OpCode::Continuation,
            false,
            &bytes[offset..offset + chunk],
        );
        if tx.send(Outbound::Frame(mid)).is_err() {
            return false;
        }
        offset += chunk;
    }
    let last = WsFrame::data(frame_config, OpCode::Continuation, true, &bytes[offset..]);
    tx.send(Outbound::Frame(last)).is_ok()
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener, acceptor: TlsAcceptor) {
    loop {
        let accepted = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!(%e, "accept failed");
                continue;
            }
        };
        if inner.open_connections() >= inner.config.limits.sockets {
            warn!(%peer, limit = inner.config.limits.sockets, "max sockets reached, dropping");
            continue;
        }
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        if let Some(accept) = &inner.callbacks.accept {
            if !accept(id, peer) {
                debug!(id, %peer, "accept vetoed");
                continue;
            }
        }
        if inner.config.debug {
            debug!(id, %peer, "accepted secure connection");
        }
        tokio::spawn(connection_task(inner.clone(), acceptor.clone(), stream, id, peer));
    }
}

/// why a connection left its io loop
#[derive(Debug)]
enum Disconnect {
    PeerClosed,
    CloseFrameReceived,
    Cancelled,
    QueueClosed,
    HandshakeRejected,
    HandlerRefused,
    SniHostMismatch,
    WebsocketNotEnabled,
    ResidueAfterUpgrade,
    Tls(std::io::Error),
    Io(std::io::Error),
    Http(HttpError),
    Protocol(ProtocolError),
}

struct ConnState {
    ctype: ConnectionType,
    http_config: HttpMessageConfig,
    frame_config: FrameConfig,
    domain: Arc<Domain>,
    /// inbound parse object while classified HTTP
    msg: Option<HttpMessage>,
    /// inbound parse object while classified websocket
    frame: Option<WsFrame>,
    ws: WebsocketConfig,
    uri: String,
    defrag: Defrag,
    close: CloseState,
    client_shutdown: bool,
}

impl ConnState {
    fn new(config: &ServerConfig, domain: Arc<Domain>) -> Self {
        Self {
            ctype: ConnectionType::Http,
            http_config: config.http_message,
            frame_config: config.websocket,
            domain,
            msg: Some(HttpMessage::new(config.http_message)),
            frame: None,
            ws: WebsocketConfig::default(),
            uri: String::new(),
            defrag: Defrag::new(),
            close: CloseState::default(),
            client_shutdown: false,
        }
    }

    fn inbound_buf(&mut self) -> &mut BytesMut {
        match self.ctype {
            ConnectionType::Http => {
                let config = self.http_config;
                self.msg
                    .get_or_insert_with(|| HttpMessage::new(config))
                    .buf_mut()
            }
            ConnectionType::Websocket => {
                let config = self.frame_config;
                self.frame
                    .get_or_insert_with(|| WsFrame::new(config))
                    .buf_mut()
            }
        }
    }
}

async fn connection_task(
    inner: Arc<ServerInner>,
    acceptor: TlsAcceptor,
    stream: TcpStream,
    id: ConnId,
    peer: SocketAddr,
) {
    let shared = ConnShared::new(id, peer);
    let (tx, rx) = mpsc::unbounded_channel();
    inner
        .registry
        .lock()
        .expect("connection registry lock")
        .insert(
            id,
            ConnEntry {
                shared: shared.clone(),
                tx,
            },
        );

    let reason = drive_connection(&inner, &shared, acceptor, stream, rx).await;
    debug!(
        id,
        reason = ?reason,
        in_bytes = shared.in_bytes.load(Ordering::Relaxed),
        out_bytes = shared.out_bytes.load(Ordering::Relaxed),
        "connection closed"
    );

    inner
        .registry
        .lock()
        .expect("connection registry lock")
        .remove(&id);

    if let Some(domain) = shared.domain.get() {
        for handler in domain.event_handlers() {
            handler.close(id);
        }
    }
    if let Some(close) = &inner.callbacks.close {
        close(id);
    }
}

async fn drive_connection(
    inner: &Arc<ServerInner>,
    shared: &Arc<ConnShared>,
    acceptor: TlsAcceptor,
    stream: TcpStream,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> Disconnect {
    let mut tls = tokio::select! {
        _ = shared.cancel.cancelled() => return Disconnect::Cancelled,
        accepted = acceptor.accept(stream) => match accepted {
            Ok(tls) => tls,
            Err(e) => return Disconnect::Tls(e),
        },
    };

    let domain = match tls.get_ref().1.server_name() {
        Some(name) => inner.domains.find(name.as_bytes()),
        None => Some(inner.domains.default_domain()),
    };
    let Some(domain) = domain else {
        // the resolver already failed the handshake for unknown names
        return Disconnect::HandshakeRejected;
    };
    let _ = shared.domain.set(domain.clone());
    shared.handshaked.store(true, Ordering::Release);
    if inner.config.debug {
        debug!(
            id = shared.id,
            domain = domain.name(),
            peer = %shared.peer,
            "tls established"
        );
    }

    let mut st = ConnState::new(&inner.config, domain);
    let reason = conn_loop(inner, shared, &mut tls, &mut st, &mut rx).await;
    finish_close(shared, &mut tls, &mut st).await;
    reason
}

async fn conn_loop(
    inner: &Arc<ServerInner>,
    shared: &Arc<ConnShared>,
    tls: &mut TlsStream<TcpStream>,
    st: &mut ConnState,
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
) -> Disconnect {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return Disconnect::Cancelled,
            item = rx.recv() => {
                let Some(item) = item else { return Disconnect::QueueClosed };
                if let Err(e) = write_outbound(tls, shared, item).await {
                    st.client_shutdown = true;
                    return Disconnect::Io(e);
                }
            }
            read = tls.read_buf(st.inbound_buf()) => {
                match read {
                    Ok(0) => {
                        st.client_shutdown = true;
                        return Disconnect::PeerClosed;
                    }
                    Ok(n) => {
                        shared.stamp_in(n);
                        if let Err(reason) = process_input(inner, shared, tls, st).await {
                            return reason;
                        }
                    }
                    Err(e) => {
                        st.client_shutdown = true;
                        return Disconnect::Io(e);
                    }
                }
            }
        }
    }
}

async fn process_input(
    inner: &Arc<ServerInner>,
    shared: &Arc<ConnShared>,
    tls: &mut TlsStream<TcpStream>,
    st: &mut ConnState,
) -> Result<(), Disconnect> {
    match st.ctype {
        ConnectionType::Http => process_https(inner, shared, tls, st).await,
        ConnectionType::Websocket => process_wss(inner, shared, tls, st).await,
    }
}

async fn process_https(
    inner: &Arc<ServerInner>,
    shared: &Arc<ConnShared>,
    tls: &mut TlsStream<TcpStream>,
    st: &mut ConnState,
) -> Result<(), Disconnect> {
    loop {
        let outcome = match st.msg.as_mut() {
            None => return Ok(()),
            Some(msg) if msg.as_bytes().is_empty() => return Ok(()),
            Some(msg) => msg.parse(),
        };
        match outcome {
            Err(e) => return Err(Disconnect::Http(e)),
            Ok(Parsing::Progress) => return Ok(()),
            Ok(Parsing::Complete { next }) => {
                let Some(mut msg) = st.msg.take() else {
                    return Ok(());
                };
                let rest = msg.shift_trailing(next);
                st.msg = Some(rest);

                dispatch_https(inner, shared, tls, st, msg).await?;

                if st.ctype == ConnectionType::Websocket {
                    // pipelined bytes behind an upgrade request are bogus
                    let residue = st
                        .msg
                        .take()
                        .map(HttpMessage::into_buffer)
                        .unwrap_or_default();
                    if !residue.is_empty() {
                        st.close.set(1002, "websocket protocol error");
                        return Err(Disconnect::ResidueAfterUpgrade);
                    }
                    st.frame = Some(WsFrame::new(st.frame_config));
                    return Ok(());
                }
            }
        }
    }
}

async fn dispatch_https(
    inner: &Arc<ServerInner>,
    shared: &Arc<ConnShared>,
    tls: &mut TlsStream<TcpStream>,
    st: &mut ConnState,
    msg: HttpMessage,
) -> Result<(), Disconnect> {
    let Some(host) = msg.header_unique("Host") else {
        return Err(Disconnect::Http(HttpError::MissingHeader("Host")));
    };
    let hostname = match host.iter().position(|b| *b == b':') {
        Some(colon) => &host[..colon],
        None => host,
    };

    if inner.config.debug {
        debug!(
            id = shared.id,
            peer = %shared.peer,
            raw = %String::from_utf8_lossy(msg.as_bytes()),
            "https io"
        );
    }

    // SNI name and Host header are both under client control, a
    // mismatch is treated as hostile
    if hostname != st.domain.name_bytes() {
        warn!(
            id = shared.id,
            domain = st.domain.name(),
            host = %String::from_utf8_lossy(hostname),
            "sni and host header mismatch"
        );
        return Err(Disconnect::SniHostMismatch);
    }

    match handshake::process_request(&msg) {
        Upgrade::NotUpgrade => {
            if let Some(https) = &inner.callbacks.https {
                if https(shared.id, msg) {
                    Ok(())
                } else {
                    Err(Disconnect::HandlerRefused)
                }
            } else {
                if inner.config.debug {
                    debug!(id = shared.id, "no https callback set, ignoring input");
                }
                Ok(())
            }
        }
        Upgrade::Accepted(response) => {
            let uri = msg
                .request_uri()
                .and_then(|u| std::str::from_utf8(u).ok())
                .map(str::to_owned);
            let Some(uri) = uri else {
                return Err(Disconnect::HandshakeRejected);
            };

            let config = st.domain.websocket_lookup(&uri);
            let has_event = st.domain.has_event_handler(&uri);
            let Some(config) = config else {
                debug!(id = shared.id, %uri, "websocket not enabled");
                return Err(Disconnect::WebsocketNotEnabled);
            };
            if !config.enabled() && !has_event {
                debug!(id = shared.id, %uri, "websocket not enabled");
                return Err(Disconnect::WebsocketNotEnabled);
            }

            write_outbound(tls, shared, Outbound::Http(response))
                .await
                .map_err(Disconnect::Io)?;
            st.ws = config;
            st.uri = uri;
            st.ctype = ConnectionType::Websocket;
            debug!(id = shared.id, uri = %st.uri, domain = st.domain.name(), "wss upgrade");
            Ok(())
        }
        Upgrade::VersionMismatch(response) => {
            write_outbound(tls, shared, Outbound::Http(response))
                .await
                .map_err(Disconnect::Io)?;
            Err(Disconnect::HandshakeRejected)
        }
        Upgrade::Failed => {
            error!(id = shared.id, "websocket upgrade identified, processing failed");
            Err(Disconnect::HandshakeRejected)
        }
    }
}

async fn process_wss(
    inner: &Arc<ServerInner>,
    shared: &Arc<ConnShared>,
    tls: &mut TlsStream<TcpStream>,
    st: &mut ConnState,
) -> Result<(), Disconnect> {
    loop {
        let outcome = match st.frame.as_mut() {
            None => return Ok(()),
            Some(frame) if frame.as_bytes().is_empty() => return Ok(()),
            Some(frame) => frame.parse(),
        };
        match outcome {
            Err(e) => {
                st.close.set(e.close_code(), e.close_phrase());
                return Err(Disconnect::Protocol(e));
            }
            Ok(Parsing::Progress) => return Ok(()),
            Ok(Parsing::Complete { next }) => {
                let Some(mut frame) = st.frame.take() else {
                    return Ok(());
                };
                let rest = frame.shift_trailing(next);
                st.frame = Some(rest);
                process_wss_frame(inner, shared, tls, st, frame).await?;
            }
        }
    }
}

async fn process_wss_frame(
    inner: &Arc<ServerInner>,
    shared: &Arc<ConnShared>,
    tls: &mut TlsStream<TcpStream>,
    st: &mut ConnState,
    mut frame: WsFrame,
) -> Result<(), Disconnect> {
    if frame.opcode().is_control() {
        frame.unmask();
        return match frame.opcode() {
            OpCode::Pong => Ok(()),
            OpCode::Ping => {
                // pong mirrors the ping application data
                let pong = WsFrame::pong(st.frame_config, frame.content());
                write_outbound(tls, shared, Outbound::Frame(pong))
                    .await
                    .map_err(Disconnect::Io)
            }
            _ => {
                st.close.recv = true;
                if let Some((code, reason)) = frame.close_payload() {
                    debug!(
                        id = shared.id,
                        code,
                        reason = %String::from_utf8_lossy(reason),
                        "close frame received"
                    );
                }
                Err(Disconnect::CloseFrameReceived)
            }
        };
    }

    frame.unmask();

    if let Some(fragmented) = st.ws.fragmented.clone() {
        // per frame delivery, reassembly is the handler's business
        return if fragmented(shared.id, st.domain.name_bytes(), &st.uri, &frame) {
            Ok(())
        } else {
            st.close.set(1002, "content not accepted");
            Err(Disconnect::HandlerRefused)
        };
    }

    match st.defrag.accept(frame, st.ws.max_frames) {
        Err(e) => {
            st.close.set(e.close_code(), e.close_phrase());
            Err(Disconnect::Protocol(e))
        }
        Ok(Reassembly::Buffered) => Ok(()),
        Ok(Reassembly::Message { payload, text }) => {
            deliver_message(inner, shared, st, payload, text)
        }
    }
}

fn deliver_message(
    inner: &Arc<ServerInner>,
    shared: &Arc<ConnShared>,
    st: &mut ConnState,
    payload: BytesMut,
    text: bool,
) -> Result<(), Disconnect> {
    if let Some(handler) = st.domain.event_handler(&st.uri) {
        if !text {
            st.close.set(1003, "non JSON input");
            return Err(Disconnect::Protocol(ProtocolError::NotJson));
        }
        let value: Value = match serde_json::from_slice(&payload) {
            Ok(value) => value,
            Err(_) => {
                debug!(id = shared.id, uri = %st.uri, "wss io not JSON, closing");
                st.close.set(1003, "non JSON input");
                return Err(Disconnect::Protocol(ProtocolError::NotJson));
            }
        };
        let sender = inner.clone();
        let parameter = EventParameter::new(
            st.domain.name().to_owned(),
            st.uri.clone(),
            Arc::new(move |socket, value| send_json_inner(&sender, socket, value)),
        );
        return if handler.process(shared.id, &parameter, value) {
            Ok(())
        } else {
            Err(Disconnect::HandlerRefused)
        };
    }

    if let Some(assembled) = st.ws.assembled.clone() {
        return if assembled(shared.id, st.domain.name_bytes(), &st.uri, &payload, text) {
            Ok(())
        } else {
            st.close.set(1002, "content not accepted");
            Err(Disconnect::HandlerRefused)
        };
    }

    Err(Disconnect::WebsocketNotEnabled)
}

/// protocol conform teardown: close frame, wait briefly for the peer's
/// close, TLS shutdown unless the peer already went away
async fn finish_close(
    shared: &Arc<ConnShared>,
    tls: &mut TlsStream<TcpStream>,
    st: &mut ConnState,
) {
    if st.ctype == ConnectionType::Websocket && !st.close.sent && !st.client_shutdown {
        if st.close.code == 0 {
            st.close.set(1000, "normal close");
        }
        let frame = WsFrame::close(st.frame_config, st.close.code, &st.close.phrase);
        if write_outbound(tls, shared, Outbound::Frame(frame)).await.is_ok() {
            st.close.sent = true;
            if !st.close.recv {
                shared.set_close_deadline(CLOSE_RESPONSE_DELAY);
                let _ = timeout(CLOSE_RESPONSE_DELAY, await_peer_close(tls, st)).await;
            }
        }
    }
    if !st.client_shutdown {
        let _ = tls.shutdown().await;
    }
}

async fn await_peer_close(tls: &mut TlsStream<TcpStream>, st: &mut ConnState) {
    loop {
        match tls.read_buf(st.inbound_buf()).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        loop {
            let outcome = match st.frame.as_mut() {
                None => break,
                Some(frame) if frame.as_bytes().is_empty() => break,
                Some(frame) => frame.parse(),
            };
            match outcome {
                Err(_) => return,
                Ok(Parsing::Progress) => break,
                Ok(Parsing::Complete { next }) => {
                    let Some(mut frame) = st.frame.take() else {
                        break;
                    };
                    let rest = frame.shift_trailing(next);
                    st.frame = Some(rest);
                    if frame.opcode() == OpCode::Close {
                        st.close.recv = true;
                        return;
                    }
                }
            }
        }
    }
}

/// periodically closes connections idle past the configured thresholds
async fn reaper(inner: Arc<ServerInner>) {
    let period = Duration::from_micros(inner.config.timer.accept.max(1));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let connections: Vec<Arc<ConnShared>> = {
            let registry = inner.registry.lock().expect("connection registry lock");
            registry.values().map(|e| e.shared.clone()).collect()
        };
        let accept_timeout = Duration::from_micros(inner.config.timer.accept);
        let io_timeout = inner.config.timer.io;

        for conn in connections {
            let age = conn.created.elapsed();
            if age < accept_timeout {
                continue;
            }
            if conn.close_deadline_elapsed() {
                debug!(id = conn.id, "close response deadline elapsed, closing");
                conn.cancel.cancel();
                continue;
            }
            let last_in = conn.last_in.load(Ordering::Relaxed);
            if last_in == 0 {
                warn!(
                    id = conn.id,
                    peer = %conn.peer,
                    timeout_usec = inner.config.timer.accept,
                    "accepted but no io during timeout, closing"
                );
                conn.cancel.cancel();
                continue;
            }
            if io_timeout != 0 {
                let now_us = age.as_micros().min(u64::MAX as u128) as u64;
                if now_us.saturating_sub(last_in) >= io_timeout {
                    warn!(id = conn.id, peer = %conn.peer, "io timeout, closing");
                    conn.cancel.cancel();
                }
            }
        }
    }
}

/// build the `301 Moved Permanently` answer of the redirect listener
fn redirect_reply(msg: &HttpMessage, secure_port: u16) -> Result<HttpMessage, HttpError> {
    if msg.status_code().is_some() {
        return Err(HttpError::NotARequest);
    }
    let host = msg
        .header_unique("Host")
        .ok_or(HttpError::MissingHeader("Host"))?;
    let host = match host.iter().position(|b| *b == b':') {
        Some(colon) => &host[..colon],
        None => host,
    };
    let host = std::str::from_utf8(host).map_err(|_| HttpError::HeaderLine)?;

    let location = format!("https://{host}:{secure_port}");
    location
        .parse::<::http::Uri>()
        .map_err(|_| HttpError::HeaderLine)?;

    let mut response = HttpMessage::response(*msg.config(), msg.version(), 301, "Moved Permanently");
    response.add_header("Location", &location);
    response.close_header();
    Ok(response)
}

async fn redirect_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    if let Some(addr) = inner.redirect_addr {
        info!(name = %inner.config.name, %addr, "redirect listener up");
    }
    loop {
        let accepted = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tokio::spawn(redirect_task(inner.clone(), stream, peer));
            }
            Err(e) => error!(%e, "redirect accept failed"),
        }
    }
}

async fn redirect_task(inner: Arc<ServerInner>, mut stream: TcpStream, peer: SocketAddr) {
    let limit = Duration::from_micros(inner.config.timer.accept);
    let served = timeout(limit, async {
        let mut msg = HttpMessage::new(inner.config.http_message);
        loop {
            match stream.read_buf(msg.buf_mut()).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            match msg.parse() {
                Err(_) => return,
                Ok(Parsing::Progress) => continue,
                Ok(Parsing::Complete { .. }) => {
                    match redirect_reply(&msg, inner.config.sockets.https.port) {
                        Ok(response) => {
                            let _ = stream.write_all(response.as_bytes()).await;
                            let _ = stream.flush().await;
                            if inner.config.debug {
                                debug!(%peer, "redirect sent");
                            }
                        }
                        Err(e) => debug!(%peer, %e, "redirect request rejected"),
                    }
                    return;
                }
            }
        }
    })
    .await;
    if served.is_err() {
        debug!(%peer, "redirect connection timed out");
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn parsed(raw: &[u8]) -> HttpMessage {
        let mut msg = HttpMessage::with_buffer(
            HttpMessageConfig::default().init(),
            BytesMut::from(raw),
        );
        assert!(matches!(msg.parse(), Ok(Parsing::Complete { .. })));
        msg
    }

    #[test]
    fn redirect_reply_format() {
        let msg = parsed(b"GET / HTTP/1.1\r\nHost:x\r\n\r\n");
        let reply = redirect_reply(&msg, 8443).unwrap();
        assert_eq!(
            reply.as_bytes(),
            b"HTTP/1.1 301 Moved Permanently\r\nLocation:https://x:8443\r\n\r\n"
        );
    }

    #[test]
    fn redirect_reply_strips_the_host_port() {
        let msg = parsed(b"GET / HTTP/1.1\r\nHost: a.test:8080\r\n\r\n");
        let reply = redirect_reply(&msg, 443).unwrap();
        let raw = String::from_utf8(reply.into_buffer().to_vec()).unwrap();
        assert!(raw.contains("Location:https://a.test:443\r\n"));
    }

    #[test]
    fn redirect_reply_needs_a_unique_host() {
        let msg = parsed(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(
            redirect_reply(&msg, 443).unwrap_err(),
            HttpError::MissingHeader("Host")
        );
        let msg = parsed(b"GET / HTTP/1.1\r\nHost: a\r\nHost: b\r\n\r\n");
        assert_eq!(
            redirect_reply(&msg, 443).unwrap_err(),
            HttpError::MissingHeader("Host")
        );
    }

    #[test]
    fn redirect_reply_refuses_status_lines() {
        let msg = parsed(b"HTTP/1.1 200 OK\r\nHost: x\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(redirect_reply(&msg, 443).unwrap_err(), HttpError::NotARequest);
    }
}
