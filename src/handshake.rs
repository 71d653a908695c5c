//! websocket upgrade handshake
//!
//! Validates upgrade requests and builds the `101 Switching Protocols`
//! response. The request URI is not examined here, URI based
//! authorization happens at dispatch.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::http::{find_in_comma_list, HttpMessage};

/// fixed GUID a websocket accept key is derived with
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// the only websocket version served
pub const VERSION: &str = "13";

/// base64 encoded length of the 16 byte client nonce
pub const SECURE_KEY_SIZE: usize = 24;

/// random base64 key as a client sends it in `Sec-WebSocket-Key`
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// accept key for a request key: base64 of SHA-1 over key and GUID
pub fn accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(GUID.as_bytes());
    BASE64.encode(sha1.finalize())
}

/// outcome of inspecting a request for the upgrade handshake
#[derive(Debug)]
pub enum Upgrade {
    /// not an upgrade request, dispatch over the HTTPS callback
    NotUpgrade,
    /// valid handshake, send the 101 response and switch to frames
    Accepted(HttpMessage),
    /// upgrade with an unsupported version, send the 426 and close
    VersionMismatch(HttpMessage),
    /// upgrade identified but structurally broken, close without response
    Failed,
}

fn is_upgrade_request(msg: &HttpMessage) -> bool {
    let Some(upgrade) = msg.header_unique("Upgrade") else {
        return false;
    };
    let Some(connection) = msg.header_unique("Connection") else {
        return false;
    };
    if !upgrade.eq_ignore_ascii_case(b"websocket") {
        return false;
    }
    // browsers send e.g. "Connection: keep-alive, Upgrade"
    find_in_comma_list(connection, b"upgrade", true).is_some()
}

/// process a parsed request as potential upgrade handshake
pub fn process_request(msg: &HttpMessage) -> Upgrade {
    if !msg.is_request("GET") || !is_upgrade_request(msg) {
        return Upgrade::NotUpgrade;
    }

    let host = msg.header_unique("Host");
    let key = msg.header_unique("Sec-WebSocket-Key");
    let version = msg.header_unique("Sec-WebSocket-Version");
    let (Some(_), Some(key), Some(version)) = (host, key, version) else {
        return Upgrade::Failed;
    };

    if version != VERSION.as_bytes() {
        let mut out = HttpMessage::response(
            *msg.config(),
            msg.version(),
            426,
            "Upgrade Required",
        );
        out.add_header("Sec-WebSocket-Version", VERSION);
        out.close_header();
        return Upgrade::VersionMismatch(out);
    }

    if msg.header("Sec-WebSocket-Extensions").is_some() {
        tracing::warn!("websocket request with extensions set, ignoring extensions");
    }
    if msg.header("Sec-WebSocket-Protocol").is_some() {
        tracing::warn!("websocket request with subprotocols set, ignoring subprotocols");
    }

    // the key must be a base64 encoded 16 byte value
    if key.len() != SECURE_KEY_SIZE {
        return Upgrade::Failed;
    }

    let accept = accept_key(key);
    let mut out = HttpMessage::response(
        *msg.config(),
        msg.version(),
        101,
        "Switching Protocols",
    );
    out.add_header("Upgrade", "websocket");
    out.add_header("Connection", "upgrade");
    out.add_header("Sec-WebSocket-Accept", &accept);
    out.close_header();
    Upgrade::Accepted(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpMessageConfig;
    use crate::Parsing;
    use bytes::BytesMut;

    fn message(raw: &str) -> HttpMessage {
        let mut msg = HttpMessage::with_buffer(
            HttpMessageConfig::default().init(),
            BytesMut::from(raw.as_bytes()),
        );
        assert!(matches!(msg.parse(), Ok(Parsing::Complete { .. })));
        msg
    }

    fn sample_request() -> String {
        [
            "GET /chat HTTP/1.1",
            "Host: server.example.com",
            "Upgrade: websocket",
            "Connection: keep-alive, Upgrade",
            "Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==",
            "Sec-WebSocket-Version: 13",
            "",
            "",
        ]
        .join("\r\n")
    }

    #[test]
    fn accept_key_matches_rfc_sample() {
        assert_eq!(
            accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn generated_keys_are_24_bytes_of_base64() {
        let key = generate_key();
        assert_eq!(key.len(), SECURE_KEY_SIZE);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn valid_handshake_builds_101() {
        let msg = message(&sample_request());
        let Upgrade::Accepted(out) = process_request(&msg) else {
            panic!("expected accepted handshake");
        };
        let mut parsed = HttpMessage::with_buffer(*msg.config(), out.into_buffer());
        assert!(matches!(parsed.parse(), Ok(Parsing::Complete { .. })));
        assert_eq!(parsed.status_code(), Some(101));
        assert_eq!(parsed.header("Upgrade"), Some(b"websocket".as_ref()));
        assert_eq!(parsed.header("Connection"), Some(b"upgrade".as_ref()));
        assert_eq!(
            parsed.header("Sec-WebSocket-Accept"),
            Some(b"s3pPLMBiTxaQ9kYGzzhZRbK+xOo=".as_ref())
        );
    }

    #[test]
    fn plain_get_is_not_an_upgrade() {
        let msg = message("GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(matches!(process_request(&msg), Upgrade::NotUpgrade));
    }

    #[test]
    fn post_is_not_an_upgrade() {
        let raw = sample_request().replace("GET", "POST");
        let msg = message(&raw);
        assert!(matches!(process_request(&msg), Upgrade::NotUpgrade));
    }

    #[test]
    fn connection_without_upgrade_item_is_not_an_upgrade() {
        let raw = sample_request().replace("keep-alive, Upgrade", "keep-alive");
        let msg = message(&raw);
        assert!(matches!(process_request(&msg), Upgrade::NotUpgrade));
    }

    #[test]
    fn version_mismatch_yields_426() {
        let raw = sample_request().replace("Version: 13", "Version: 8");
        let msg = message(&raw);
        let Upgrade::VersionMismatch(out) = process_request(&msg) else {
            panic!("expected version mismatch");
        };
        let mut parsed = HttpMessage::with_buffer(*msg.config(), out.into_buffer());
        assert!(matches!(parsed.parse(), Ok(Parsing::Complete { .. })));
        assert_eq!(parsed.status_code(), Some(426));
        assert_eq!(parsed.header("Sec-WebSocket-Version"), Some(b"13".as_ref()));
    }

    #[test]
    fn missing_key_fails_without_response() {
        let raw = sample_request().replace("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n", "");
        let msg = message(&raw);
        assert!(matches!(process_request(&msg), Upgrade::Failed));
    }

    #[test]
    fn short_key_fails_without_response() {
        let raw = sample_request().replace("dGhlIHNhbXBsZSBub25jZQ==", "c2hvcnQ=");
        let msg = message(&raw);
        assert!(matches!(process_request(&msg), Upgrade::Failed));
    }

    #[test]
    fn duplicated_host_fails() {
        let raw = sample_request().replace("Host: server.example.com", "Host: a\r\nHost: b");
        let msg = message(&raw);
        assert!(matches!(process_request(&msg), Upgrade::Failed));
    }
}
