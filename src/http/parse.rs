//! pointer parsing of HTTP/1.1 message heads and chunked bodies
//!
//! All functions scan a caller owned byte buffer and report spans
//! (`Range<usize>`) into it, copying nothing. A `None` result means the
//! grammar is consistent so far but more bytes are needed.

use std::ops::Range;

use crate::config::HttpMessageConfig;
use crate::errors::HttpError;

use super::{HeaderSpan, Version};

/// upper bound of a request target
pub const MAX_URI_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub(super) struct Head {
    pub version: Version,
    pub request: Option<(Range<usize>, Range<usize>)>,
    pub status: Option<(u16, Range<usize>)>,
    pub headers: Vec<HeaderSpan>,
    /// first byte after the `CRLF CRLF` head terminator
    pub end: usize,
}

#[derive(Debug, Clone)]
pub(super) struct Parsed {
    pub head: Head,
    pub body: Range<usize>,
    pub chunk: Option<Range<usize>>,
    /// first byte after the complete message
    pub next: usize,
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn is_token_byte(b: u8) -> bool {
    b > 32 && b < 127
}

fn parse_version(bytes: &[u8]) -> Result<Version, HttpError> {
    if bytes.len() != 8 || !bytes.starts_with(b"HTTP/") {
        return Err(HttpError::Version);
    }
    if !bytes[5].is_ascii_digit() || bytes[6] != b'.' || !bytes[7].is_ascii_digit() {
        return Err(HttpError::Version);
    }
    Ok(Version {
        major: bytes[5] - b'0',
        minor: bytes[7] - b'0',
    })
}

fn parse_request_line(
    line: &[u8],
    config: &HttpMessageConfig,
) -> Result<(Range<usize>, Range<usize>, Version), HttpError> {
    let sp1 = line
        .iter()
        .position(|b| *b == b' ')
        .ok_or(HttpError::StartLine)?;
    if sp1 == 0 {
        return Err(HttpError::StartLine);
    }
    if sp1 > config.header.method {
        return Err(HttpError::MethodTooLong(config.header.method));
    }
    if !line[..sp1].iter().all(|b| is_token_byte(*b)) {
        return Err(HttpError::StartLine);
    }
    let rest = &line[sp1 + 1..];
    let sp2 = rest
        .iter()
        .position(|b| *b == b' ')
        .ok_or(HttpError::StartLine)?;
    if sp2 == 0 {
        return Err(HttpError::StartLine);
    }
    if sp2 > MAX_URI_BYTES {
        return Err(HttpError::UriTooLong(MAX_URI_BYTES));
    }
    let version = parse_version(&rest[sp2 + 1..])?;
    let uri_start = sp1 + 1;
    Ok((0..sp1, uri_start..uri_start + sp2, version))
}

fn parse_status_line(line: &[u8]) -> Result<(u16, Range<usize>, Version), HttpError> {
    if line.len() < 12 {
        return Err(HttpError::StartLine);
    }
    let version = parse_version(&line[..8])?;
    if line[8] != b' ' {
        return Err(HttpError::StartLine);
    }
    let digits = &line[9..12];
    if !digits.iter().all(|b| b.is_ascii_digit()) {
        return Err(HttpError::StartLine);
    }
    let code = digits.iter().fold(0u16, |acc, b| acc * 10 + (b - b'0') as u16);
    let phrase = if line.len() == 12 {
        12..12
    } else {
        if line[12] != b' ' {
            return Err(HttpError::StartLine);
        }
        13..line.len()
    };
    Ok((code, phrase, version))
}

fn parse_header_line(
    buf: &[u8],
    line: Range<usize>,
) -> Result<HeaderSpan, HttpError> {
    let bytes = &buf[line.clone()];
    let colon = bytes
        .iter()
        .position(|b| *b == b':')
        .ok_or(HttpError::HeaderLine)?;
    if colon == 0 || !bytes[..colon].iter().all(|b| is_token_byte(*b)) {
        return Err(HttpError::HeaderLine);
    }
    let mut value_start = colon + 1;
    let mut value_end = bytes.len();
    while value_start < value_end && (bytes[value_start] == b' ' || bytes[value_start] == b'\t') {
        value_start += 1;
    }
    while value_end > value_start && (bytes[value_end - 1] == b' ' || bytes[value_end - 1] == b'\t')
    {
        value_end -= 1;
    }
    Ok(HeaderSpan {
        name: line.start..line.start + colon,
        value: line.start + value_start..line.start + value_end,
    })
}

/// parse a message head, `Ok(None)` when more bytes are needed
pub(super) fn parse_head(
    buf: &[u8],
    config: &HttpMessageConfig,
) -> Result<Option<Head>, HttpError> {
    let start_line_max = config.header.method + MAX_URI_BYTES + 12;
    let Some(line_end) = find_crlf(buf, 0) else {
        if buf.len() > start_line_max {
            return Err(HttpError::StartLine);
        }
        return Ok(None);
    };
    if line_end > start_line_max {
        return Err(HttpError::StartLine);
    }

    let line = &buf[..line_end];
    let (version, request, status) = if line.starts_with(b"HTTP/") {
        let (code, phrase, version) = parse_status_line(line)?;
        (version, None, Some((code, phrase)))
    } else {
        let (method, uri, version) = parse_request_line(line, config)?;
        (version, Some((method, uri)), None)
    };

    let mut headers = Vec::new();
    let mut pos = line_end + 2;
    let end = loop {
        match find_crlf(buf, pos) {
            None => {
                if buf.len() - pos > config.header.lines {
                    return Err(HttpError::HeaderLineTooLong(config.header.lines));
                }
                return Ok(None);
            }
            Some(e) if e == pos => break pos + 2,
            Some(e) => {
                if e - pos > config.header.lines {
                    return Err(HttpError::HeaderLineTooLong(config.header.lines));
                }
                if headers.len() == config.header.capacity {
                    return Err(HttpError::TooManyHeaders(config.header.capacity));
                }
                headers.push(parse_header_line(buf, pos..e)?);
                pos = e + 2;
            }
        }
    };

    Ok(Some(Head {
        version,
        request,
        status,
        headers,
        end,
    }))
}

fn content_length(buf: &[u8], head: &Head) -> Result<Option<usize>, HttpError> {
    let mut found: Option<usize> = None;
    for h in &head.headers {
        if !buf[h.name.clone()].eq_ignore_ascii_case(b"Content-Length") {
            continue;
        }
        if found.is_some() {
            return Err(HttpError::ContentLength);
        }
        let value = &buf[h.value.clone()];
        if value.is_empty() || !value.iter().all(|b| b.is_ascii_digit()) {
            return Err(HttpError::ContentLength);
        }
        let mut n: usize = 0;
        for b in value {
            n = n
                .checked_mul(10)
                .and_then(|n| n.checked_add((b - b'0') as usize))
                .ok_or(HttpError::ContentLength)?;
        }
        found = Some(n);
    }
    Ok(found)
}

/// true when the message uses chunked transfer as its final coding
fn uses_chunked(buf: &[u8], head: &Head, config: &HttpMessageConfig) -> Result<bool, HttpError> {
    let mut count = 0usize;
    let mut last_chunked = false;
    for h in &head.headers {
        if !buf[h.name.clone()].eq_ignore_ascii_case(b"Transfer-Encoding") {
            continue;
        }
        for item in comma_items(&buf[h.value.clone()]) {
            count += 1;
            if count > config.transfer.max {
                return Err(HttpError::TooManyTransferCodings(config.transfer.max));
            }
            last_chunked = item.eq_ignore_ascii_case(b"chunked");
        }
    }
    if count == 0 {
        return Ok(false);
    }
    if !last_chunked {
        return Err(HttpError::ChunkedNotLast);
    }
    Ok(true)
}

/// walk the chunk grammar `hex CRLF octet* CRLF` up to the zero chunk,
/// `Ok(None)` when more bytes are needed
fn parse_chunks(
    buf: &[u8],
    from: usize,
    max_chunk: usize,
) -> Result<Option<(usize, Range<usize>)>, HttpError> {
    let mut pos = from;
    let mut last = from..from;
    loop {
        let Some(size_end) = find_crlf(buf, pos) else {
            if buf.len() - pos > 18 {
                return Err(HttpError::Chunk);
            }
            return Ok(None);
        };
        let digits = &buf[pos..size_end];
        if digits.is_empty() || digits.len() > 16 || !digits.iter().all(|b| b.is_ascii_hexdigit())
        {
            return Err(HttpError::Chunk);
        }
        let mut size: usize = 0;
        for b in digits {
            let d = match b {
                b'0'..=b'9' => b - b'0',
                b'a'..=b'f' => b - b'a' + 10,
                _ => b - b'A' + 10,
            };
            size = size
                .checked_mul(16)
                .and_then(|s| s.checked_add(d as usize))
                .ok_or(HttpError::Chunk)?;
        }
        if size > max_chunk {
            return Err(HttpError::ChunkTooLarge(max_chunk));
        }
        let data_start = size_end + 2;
        let need = data_start + size + 2;
        if buf.len() < need {
            return Ok(None);
        }
        if &buf[data_start + size..need] != b"\r\n" {
            return Err(HttpError::Chunk);
        }
        if size == 0 {
            return Ok(Some((need, last)));
        }
        last = data_start..data_start + size;
        pos = need;
    }
}

/// parse one complete message with its body framing
pub(super) fn parse_message(
    buf: &[u8],
    config: &HttpMessageConfig,
) -> Result<Option<Parsed>, HttpError> {
    let Some(head) = parse_head(buf, config)? else {
        return Ok(None);
    };

    if let Some(length) = content_length(buf, &head)? {
        let next = head.end + length;
        if buf.len() < next {
            return Ok(None);
        }
        return Ok(Some(Parsed {
            body: head.end..next,
            chunk: None,
            next,
            head,
        }));
    }

    if uses_chunked(buf, &head, config)? {
        let Some((next, last)) = parse_chunks(buf, head.end, config.chunk.max)? else {
            return Ok(None);
        };
        return Ok(Some(Parsed {
            body: head.end..next,
            chunk: Some(last),
            next,
            head,
        }));
    }

    let next = head.end;
    Ok(Some(Parsed {
        body: next..next,
        chunk: None,
        next,
        head,
    }))
}

fn trim(bytes: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = bytes.len();
    while start < end && (bytes[start] == b' ' || bytes[start] == b'\t') {
        start += 1;
    }
    while end > start && (bytes[end - 1] == b' ' || bytes[end - 1] == b'\t') {
        end -= 1;
    }
    &bytes[start..end]
}

/// iterate trimmed, non empty items of a comma separated header value
pub fn comma_items(value: &[u8]) -> impl Iterator<Item = &[u8]> {
    value
        .split(|b| *b == b',')
        .map(trim)
        .filter(|item| !item.is_empty())
}

/// find an item in a comma list, returns the matched item slice
pub fn find_in_comma_list<'a>(
    value: &'a [u8],
    needle: &[u8],
    ignore_case: bool,
) -> Option<&'a [u8]> {
    comma_items(value).find(|item| {
        if ignore_case {
            item.eq_ignore_ascii_case(needle)
        } else {
            *item == needle
        }
    })
}
