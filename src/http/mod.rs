//! HTTP/1.1 message parse object
//!
//! An [`HttpMessage`] owns its byte buffer and carries semantic spans
//! into it after a successful parse. The buffer is filled by socket
//! reads and parsed in place, nothing is copied. Spans are byte offsets,
//! so buffer growth never invalidates them; a span is only trusted for
//! the message it was parsed from.

mod parse;

pub use parse::{comma_items, find_in_comma_list, MAX_URI_BYTES};

use std::ops::Range;

use bytes::{BufMut, BytesMut};

use crate::config::HttpMessageConfig;
use crate::errors::HttpError;
use crate::Parsing;

/// HTTP version of a start line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Default for Version {
    fn default() -> Self {
        Self { major: 1, minor: 1 }
    }
}

/// one header line as (name, value) spans into the owning buffer
#[derive(Debug, Clone, Default)]
pub struct HeaderSpan {
    pub name: Range<usize>,
    pub value: Range<usize>,
}

#[derive(Debug)]
pub struct HttpMessage {
    config: HttpMessageConfig,
    buf: BytesMut,
    version: Version,
    request: Option<(Range<usize>, Range<usize>)>,
    status: Option<(u16, Range<usize>)>,
    headers: Vec<HeaderSpan>,
    body: Range<usize>,
    chunk: Option<Range<usize>>,
}

impl HttpMessage {
    pub fn new(config: HttpMessageConfig) -> Self {
        Self::with_buffer(config, BytesMut::new())
    }

    /// wrap an existing buffer, e.g. the residue of a previous message
    pub fn with_buffer(config: HttpMessageConfig, mut buf: BytesMut) -> Self {
        if buf.capacity() < config.buffer.size {
            buf.reserve(config.buffer.size - buf.capacity());
        }
        Self {
            config,
            buf,
            version: Version::default(),
            request: None,
            status: None,
            headers: Vec::new(),
            body: 0..0,
            chunk: None,
        }
    }

    pub fn config(&self) -> &HttpMessageConfig {
        &self.config
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn into_buffer(self) -> BytesMut {
        self.buf
    }

    /// parse the buffer content; on [`Parsing::Complete`] all span
    /// accessors are valid and `next` points past the message end
    pub fn parse(&mut self) -> Result<Parsing, HttpError> {
        if self.buf.is_empty() {
            return Ok(Parsing::Progress);
        }
        let Some(parsed) = parse::parse_message(&self.buf, &self.config)? else {
            return Ok(Parsing::Progress);
        };
        self.version = parsed.head.version;
        self.request = parsed.head.request;
        self.status = parsed.head.status;
        self.headers = parsed.head.headers;
        self.body = parsed.body;
        self.chunk = parsed.chunk;
        Ok(Parsing::Complete { next: parsed.next })
    }

    /// move every byte past `next` into a fresh message, leaving exactly
    /// one complete message behind; this separates pipelined requests
    pub fn shift_trailing(&mut self, next: usize) -> HttpMessage {
        let rest = self.buf.split_off(next);
        HttpMessage::with_buffer(self.config, rest)
    }

    /// hand the buffer back for reuse; buffers grown beyond the recache
    /// bound are dropped instead
    pub fn recycle(mut self) -> Option<BytesMut> {
        let max = self.config.buffer.max_cache;
        if max != 0 && self.buf.capacity() > max {
            return None;
        }
        self.buf.clear();
        Some(self.buf)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn method(&self) -> Option<&[u8]> {
        self.request.as_ref().map(|(m, _)| &self.buf[m.clone()])
    }

    pub fn request_uri(&self) -> Option<&[u8]> {
        self.request.as_ref().map(|(_, u)| &self.buf[u.clone()])
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status.as_ref().map(|(code, _)| *code)
    }

    pub fn status_phrase(&self) -> Option<&[u8]> {
        self.status.as_ref().map(|(_, p)| &self.buf[p.clone()])
    }

    pub fn is_request(&self, method: &str) -> bool {
        self.method() == Some(method.as_bytes())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.headers
            .iter()
            .map(|h| (&self.buf[h.name.clone()], &self.buf[h.value.clone()]))
    }

    /// header spans in order of reception
    pub fn header_spans(&self) -> &[HeaderSpan] {
        &self.headers
    }

    /// first header with this name, matched case insensitively
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| self.buf[h.name.clone()].eq_ignore_ascii_case(name.as_bytes()))
            .map(|h| &self.buf[h.value.clone()])
    }

    /// header that must occur exactly once; absent or duplicated is `None`
    pub fn header_unique(&self, name: &str) -> Option<&[u8]> {
        let mut it = self
            .headers
            .iter()
            .filter(|h| self.buf[h.name.clone()].eq_ignore_ascii_case(name.as_bytes()));
        let first = it.next()?;
        if it.next().is_some() {
            return None;
        }
        Some(&self.buf[first.value.clone()])
    }

    pub fn body(&self) -> &[u8] {
        &self.buf[self.body.clone()]
    }

    /// last chunk data when chunked transfer was used
    pub fn chunk(&self) -> Option<&[u8]> {
        self.chunk.as_ref().map(|c| &self.buf[c.clone()])
    }

    /// start a response message with the given status line
    pub fn response(config: HttpMessageConfig, version: Version, code: u16, phrase: &str) -> Self {
        let mut msg = Self::new(config);
        msg.buf.put_slice(b"HTTP/");
        msg.buf.put_u8(b'0' + version.major);
        msg.buf.put_u8(b'.');
        msg.buf.put_u8(b'0' + version.minor);
        msg.buf.put_u8(b' ');
        msg.buf.put_slice(format!("{code}").as_bytes());
        msg.buf.put_u8(b' ');
        msg.buf.put_slice(phrase.as_bytes());
        msg.buf.put_slice(b"\r\n");
        msg
    }

    /// start a request message with the given request line
    pub fn request(
        config: HttpMessageConfig,
        method: &str,
        uri: &str,
    ) -> Result<Self, HttpError> {
        if method.len() > config.header.method {
            return Err(HttpError::MethodTooLong(config.header.method));
        }
        if uri.len() > MAX_URI_BYTES {
            return Err(HttpError::UriTooLong(MAX_URI_BYTES));
        }
        let mut msg = Self::new(config);
        msg.buf.put_slice(method.as_bytes());
        msg.buf.put_u8(b' ');
        msg.buf.put_slice(uri.as_bytes());
        msg.buf.put_slice(b" HTTP/1.1\r\n");
        Ok(msg)
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.add_header_bytes(name, value.as_bytes());
    }

    pub fn add_header_bytes(&mut self, name: &str, value: &[u8]) {
        self.buf.put_slice(name.as_bytes());
        self.buf.put_u8(b':');
        self.buf.put_slice(value);
        self.buf.put_slice(b"\r\n");
    }

    pub fn set_content_length(&mut self, length: usize) {
        self.add_header("Content-Length", &length.to_string());
    }

    /// terminate the header section with the empty line
    pub fn close_header(&mut self) {
        self.buf.put_slice(b"\r\n");
    }

    /// append body bytes, only valid once the header is closed
    pub fn add_body(&mut self, body: &[u8]) -> Result<(), HttpError> {
        if !self.buf.ends_with(b"\r\n\r\n") {
            return Err(HttpError::HeaderNotClosed);
        }
        self.buf.put_slice(body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HttpMessageConfig {
        HttpMessageConfig::default().init()
    }

    fn complete(msg: &mut HttpMessage) -> usize {
        match msg.parse().unwrap() {
            Parsing::Complete { next } => next,
            Parsing::Progress => panic!("expected complete message"),
        }
    }

    #[test]
    fn parse_and_lookup() {
        let mut msg = HttpMessage::with_buffer(
            config(),
            BytesMut::from(&b"GET /chat HTTP/1.1\r\nHost: a.test\r\nConnection: keep-alive, Upgrade\r\n\r\n"[..]),
        );
        let next = complete(&mut msg);
        assert_eq!(next, msg.as_bytes().len());
        assert!(msg.is_request("GET"));
        assert_eq!(msg.request_uri(), Some(b"/chat".as_ref()));
        assert_eq!(msg.header("host"), Some(b"a.test".as_ref()));
        assert_eq!(msg.header_unique("Host"), Some(b"a.test".as_ref()));
        assert!(msg.status_code().is_none());
    }

    #[test]
    fn header_unique_rejects_duplicates() {
        let mut msg = HttpMessage::with_buffer(
            config(),
            BytesMut::from(&b"GET / HTTP/1.1\r\nHost: a\r\nHost: b\r\n\r\n"[..]),
        );
        complete(&mut msg);
        assert_eq!(msg.header("Host"), Some(b"a".as_ref()));
        assert!(msg.header_unique("Host").is_none());
    }

    #[test]
    fn every_span_lies_within_the_buffer() {
        let mut msg = HttpMessage::with_buffer(
            config(),
            BytesMut::from(
                &b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\n\r\nabc"[..],
            ),
        );
        complete(&mut msg);
        let len = msg.as_bytes().len();
        for span in msg.header_spans() {
            assert!(span.name.end <= len && span.name.start <= span.name.end);
            assert!(span.value.end <= len && span.value.start <= span.value.end);
        }
        assert_eq!(msg.body(), b"abc");
    }

    #[test]
    fn shift_trailing_separates_pipelined_requests() {
        let first = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n";
        let second = b"GET /b HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut both = BytesMut::from(&first[..]);
        both.extend_from_slice(second);
        let mut msg = HttpMessage::with_buffer(config(), both);
        let next = complete(&mut msg);
        assert_eq!(next, first.len());
        let mut rest = msg.shift_trailing(next);
        assert_eq!(msg.as_bytes(), first.as_ref());
        assert_eq!(rest.as_bytes(), second.as_ref());
        complete(&mut rest);
        assert_eq!(rest.request_uri(), Some(b"/b".as_ref()));
    }

    #[test]
    fn shift_trailing_with_no_residue_is_empty() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut msg = HttpMessage::with_buffer(config(), BytesMut::from(&raw[..]));
        let next = complete(&mut msg);
        let rest = msg.shift_trailing(next);
        assert!(rest.as_bytes().is_empty());
    }

    #[test]
    fn build_a_response() {
        let mut msg = HttpMessage::response(config(), Version::default(), 301, "Moved Permanently");
        msg.add_header("Location", "https://x:443");
        msg.close_header();
        assert_eq!(
            msg.as_bytes(),
            b"HTTP/1.1 301 Moved Permanently\r\nLocation:https://x:443\r\n\r\n"
        );
    }

    #[test]
    fn build_with_body_round_trips() {
        let mut msg = HttpMessage::response(config(), Version::default(), 200, "OK");
        msg.set_content_length(5);
        msg.close_header();
        msg.add_body(b"hello").unwrap();
        let mut parsed = HttpMessage::with_buffer(config(), msg.into_buffer());
        complete(&mut parsed);
        assert_eq!(parsed.status_code(), Some(200));
        assert_eq!(parsed.body(), b"hello");
    }

    #[test]
    fn add_body_requires_closed_header() {
        let mut msg = HttpMessage::response(config(), Version::default(), 200, "OK");
        assert_eq!(msg.add_body(b"x").unwrap_err(), HttpError::HeaderNotClosed);
    }

    #[test]
    fn recycle_respects_the_recache_bound() {
        let mut config = config();
        config.buffer.max_cache = 8;
        config.buffer.size = 4;
        let msg = HttpMessage::with_buffer(config, BytesMut::with_capacity(4));
        assert!(msg.recycle().is_some());
        let msg = HttpMessage::with_buffer(config, BytesMut::with_capacity(1024));
        assert!(msg.recycle().is_none());
    }
}
