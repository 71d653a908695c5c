//! websocket frame parse object
//!
//! A [`WsFrame`] owns its byte buffer; parsing records the mask offset
//! and content span in place without copying. A frame is complete only
//! when the buffer holds the full payload length.

use bytes::{BufMut, BytesMut};

use crate::config::FrameConfig;
use crate::errors::ProtocolError;
use crate::Parsing;

/// frame opcodes of RFC 6455, anything else fails the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(OpCode::Continuation),
            1 => Ok(OpCode::Text),
            2 => Ok(OpCode::Binary),
            8 => Ok(OpCode::Close),
            9 => Ok(OpCode::Ping),
            10 => Ok(OpCode::Pong),
            other => Err(ProtocolError::InvalidOpcode(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
        }
    }

    /// close, ping and pong are handled by the engine itself
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    pub fn is_data(self) -> bool {
        matches!(self, OpCode::Continuation | OpCode::Text | OpCode::Binary)
    }
}

/// role of a frame within a fragmented message,
/// derived from FIN and a zero or non zero opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fragmentation {
    /// standalone frame
    #[default]
    None,
    Start,
    Continue,
    /// terminates a fragmented sequence
    Last,
}

fn fragmentation_state(byte0: u8) -> Fragmentation {
    let fin = byte0 & 0x80 != 0;
    let opcode = byte0 & 0x0F != 0;
    match (fin, opcode) {
        (true, true) => Fragmentation::None,
        (true, false) => Fragmentation::Last,
        (false, true) => Fragmentation::Start,
        (false, false) => Fragmentation::Continue,
    }
}

/// in place XOR with `mask[i mod 4]`, applying twice restores the input
pub(crate) fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= mask[i % 4];
    }
}

#[derive(Debug)]
pub struct WsFrame {
    config: FrameConfig,
    buf: BytesMut,
    opcode: OpCode,
    state: Fragmentation,
    /// offset of the 4 byte masking key when MASK is set
    mask: Option<usize>,
    content: std::ops::Range<usize>,
}

impl WsFrame {
    pub fn new(config: FrameConfig) -> Self {
        Self::with_buffer(config, BytesMut::new())
    }

    /// wrap an existing buffer, e.g. the residue of a previous frame
    pub fn with_buffer(config: FrameConfig, mut buf: BytesMut) -> Self {
        if buf.capacity() < config.buffer.size {
            buf.reserve(config.buffer.size - buf.capacity());
        }
        Self {
            config,
            buf,
            opcode: OpCode::Text,
            state: Fragmentation::None,
            mask: None,
            content: 0..0,
        }
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

    /// parse the buffer content as one frame
    pub fn parse(&mut self) -> Result<Parsing, ProtocolError> {
        self.mask = None;
        self.content = 0..0;

        if self.buf.len() < 2 {
            return Ok(Parsing::Progress);
        }
        let b0 = self.buf[0];
        let b1 = self.buf[1];

        if b0 & 0x70 != 0 {
            return Err(ProtocolError::ReservedBits(b0 & 0x70));
        }
        let opcode = OpCode::from_u8(b0 & 0x0F)?;

        let code = u64::from(b1 & 0x7F);
        let (header_len, length) = match code {
            0..=125 => (2usize, code),
            126 => {
                if self.buf.len() < 4 {
                    return Ok(Parsing::Progress);
                }
                let length = u64::from(u16::from_be_bytes([self.buf[2], self.buf[3]]));
                if length <= 125 {
                    return Err(ProtocolError::NonMinimalLength);
                }
                (4, length)
            }
            _ => {
                if self.buf.len() < 10 {
                    return Ok(Parsing::Progress);
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&self.buf[2..10]);
                let length = u64::from_be_bytes(bytes);
                if length & (1 << 63) != 0 {
                    return Err(ProtocolError::LengthOutOfRange);
                }
                if length <= 0xFFFF {
                    return Err(ProtocolError::NonMinimalLength);
                }
                (10, length)
            }
        };

        let fin = b0 & 0x80 != 0;
        if opcode.is_control() {
            if !fin {
                return Err(ProtocolError::FragmentedControlFrame);
            }
            if length > 125 {
                return Err(ProtocolError::ControlFrameTooBig(length as usize));
            }
        }

        let masked = b1 & 0x80 != 0;
        let content_start = header_len + if masked { 4 } else { 0 };
        let total = (content_start as u64)
            .checked_add(length)
            .filter(|t| *t <= usize::MAX as u64)
            .ok_or(ProtocolError::LengthOutOfRange)?;
        if (self.buf.len() as u64) < total {
            return Ok(Parsing::Progress);
        }
        let total = total as usize;

        self.opcode = opcode;
        self.state = fragmentation_state(b0);
        self.mask = masked.then_some(header_len);
        self.content = content_start..total;
        Ok(Parsing::Complete { next: total })
    }

    /// move every byte past `next` into a fresh frame, leaving exactly
    /// one frame behind
    pub fn shift_trailing(&mut self, next: usize) -> WsFrame {
        let rest = self.buf.split_off(next);
        WsFrame::with_buffer(self.config, rest)
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

    pub fn fin(&self) -> bool {
        !self.buf.is_empty() && self.buf[0] & 0x80 != 0
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn state(&self) -> Fragmentation {
        self.state
    }

    pub fn content(&self) -> &[u8] {
        &self.buf[self.content.clone()]
    }

    pub fn masking_key(&self) -> Option<[u8; 4]> {
        self.mask
            .map(|off| [self.buf[off], self.buf[off + 1], self.buf[off + 2], self.buf[off + 3]])
    }

    /// unmask the content in place, a no op on unmasked frames
    pub fn unmask(&mut self) {
        if let Some(key) = self.masking_key() {
            self.mask = None;
            let range = self.content.clone();
            apply_mask(&mut self.buf[range], key);
        }
    }

    /// code and reason of a parsed close frame, `None` when the payload
    /// carries no code
    pub fn close_payload(&self) -> Option<(u16, &[u8])> {
        let content = self.content();
        if content.len() < 2 {
            return None;
        }
        let code = u16::from_be_bytes([content[0], content[1]]);
        Some((code, &content[2..]))
    }

    fn build(
        config: FrameConfig,
        opcode: OpCode,
        fin: bool,
        payload: &[u8],
        key: Option<[u8; 4]>,
    ) -> Self {
        let mut buf = BytesMut::with_capacity(payload.len() + 14);
        let b0 = ((fin as u8) << 7) | opcode.as_u8();
        buf.put_u8(b0);
        let mask_bit = if key.is_some() { 0x80 } else { 0 };
        match payload.len() {
            0..=125 => buf.put_u8(mask_bit | payload.len() as u8),
            126..=65535 => {
                buf.put_u8(mask_bit | 126);
                buf.put_u16(payload.len() as u16);
            }
            _ => {
                buf.put_u8(mask_bit | 127);
                buf.put_u64(payload.len() as u64);
            }
        }
        let mask = key.map(|k| {
            let off = buf.len();
            buf.put_slice(&k);
            off
        });
        let content_start = buf.len();
        buf.put_slice(payload);
        if let Some(k) = key {
            apply_mask(&mut buf[content_start..], k);
        }
        Self {
            config,
            buf,
            opcode,
            state: fragmentation_state(b0),
            mask,
            content: content_start..content_start + payload.len(),
        }
    }

    /// construct a data frame as sent by the server (unmasked)
    pub fn data(config: FrameConfig, opcode: OpCode, fin: bool, payload: &[u8]) -> Self {
        Self::build(config, opcode, fin, payload, None)
    }

    /// construct a masked data frame as a client would send it
    pub fn masked_data(
        config: FrameConfig,
        opcode: OpCode,
        fin: bool,
        payload: &[u8],
        key: [u8; 4],
    ) -> Self {
        Self::build(config, opcode, fin, payload, Some(key))
    }

    pub fn ping(config: FrameConfig, payload: &[u8]) -> Self {
        assert!(payload.len() <= 125);
        Self::build(config, OpCode::Ping, true, payload, None)
    }

    pub fn pong(config: FrameConfig, payload: &[u8]) -> Self {
        assert!(payload.len() <= 125);
        Self::build(config, OpCode::Pong, true, payload, None)
    }

    /// construct a close frame, the reason is truncated to the 123 bytes
    /// a control frame can carry next to the code
    pub fn close(config: FrameConfig, code: u16, reason: &str) -> Self {
        let reason = reason.as_bytes();
        let reason = &reason[..reason.len().min(123)];
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason);
        Self::build(config, OpCode::Close, true, &payload, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FrameConfig {
        FrameConfig::default().init()
    }

    fn parse_bytes(bytes: &[u8]) -> (WsFrame, Result<Parsing, ProtocolError>) {
        let mut frame = WsFrame::with_buffer(config(), BytesMut::from(bytes));
        let outcome = frame.parse();
        (frame, outcome)
    }

    #[test]
    fn unmasked_text_frame() {
        let (frame, outcome) = parse_bytes(b"\x81\x05hello");
        assert_eq!(outcome, Ok(Parsing::Complete { next: 7 }));
        assert_eq!(frame.opcode(), OpCode::Text);
        assert_eq!(frame.state(), Fragmentation::None);
        assert!(frame.fin());
        assert_eq!(frame.content(), b"hello");
        assert!(frame.masking_key().is_none());
    }

    #[test]
    fn masked_frame_unmasks_in_place() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let built = WsFrame::masked_data(config(), OpCode::Text, true, b"Hello", key);
        let (mut frame, outcome) = parse_bytes(built.as_bytes());
        assert_eq!(outcome, Ok(Parsing::Complete { next: 11 }));
        assert_eq!(frame.masking_key(), Some(key));
        assert_ne!(frame.content(), b"Hello");
        frame.unmask();
        assert_eq!(frame.content(), b"Hello");
    }

    #[test]
    fn masking_twice_restores_the_input() {
        let key = [1, 2, 3, 4];
        let mut data = b"some longer payload, more than four bytes".to_vec();
        let original = data.clone();
        apply_mask(&mut data, key);
        assert_ne!(data, original);
        apply_mask(&mut data, key);
        assert_eq!(data, original);
    }

    #[test]
    fn sixteen_bit_length() {
        let payload = vec![b'x'; 300];
        let built = WsFrame::data(config(), OpCode::Binary, true, &payload);
        assert_eq!(built.as_bytes()[1], 126);
        let (frame, outcome) = parse_bytes(built.as_bytes());
        assert_eq!(outcome, Ok(Parsing::Complete { next: 304 }));
        assert_eq!(frame.content().len(), 300);
    }

    #[test]
    fn sixteen_bit_length_must_exceed_125() {
        let mut raw = vec![0x82, 126, 0, 100];
        raw.extend_from_slice(&[0u8; 100]);
        let (_, outcome) = parse_bytes(&raw);
        assert_eq!(outcome, Err(ProtocolError::NonMinimalLength));
    }

    #[test]
    fn sixty_four_bit_length_must_exceed_u16() {
        let mut raw = vec![0x82, 127];
        raw.extend_from_slice(&0xFFFFu64.to_be_bytes());
        let (_, outcome) = parse_bytes(&raw);
        assert_eq!(outcome, Err(ProtocolError::NonMinimalLength));
    }

    #[test]
    fn sixty_four_bit_length_msb_must_be_zero() {
        let mut raw = vec![0x82, 127];
        raw.extend_from_slice(&(1u64 << 63 | 0x20000).to_be_bytes());
        let (_, outcome) = parse_bytes(&raw);
        assert_eq!(outcome, Err(ProtocolError::LengthOutOfRange));
    }

    #[test]
    fn reserved_bits_rejected() {
        let (_, outcome) = parse_bytes(b"\xC1\x00");
        assert_eq!(outcome, Err(ProtocolError::ReservedBits(0x40)));
    }

    #[test]
    fn unknown_opcode_rejected() {
        let (_, outcome) = parse_bytes(b"\x83\x00");
        assert_eq!(outcome, Err(ProtocolError::InvalidOpcode(3)));
    }

    #[test]
    fn fragmentation_states_from_first_byte() {
        assert_eq!(fragmentation_state(0x81), Fragmentation::None);
        assert_eq!(fragmentation_state(0x01), Fragmentation::Start);
        assert_eq!(fragmentation_state(0x00), Fragmentation::Continue);
        assert_eq!(fragmentation_state(0x80), Fragmentation::Last);
    }

    #[test]
    fn fragmented_control_frame_rejected() {
        let (_, outcome) = parse_bytes(b"\x09\x00");
        assert_eq!(outcome, Err(ProtocolError::FragmentedControlFrame));
    }

    #[test]
    fn oversized_control_frame_rejected() {
        let mut raw = vec![0x89, 126, 0, 128];
        raw.extend_from_slice(&[0u8; 128]);
        let (_, outcome) = parse_bytes(&raw);
        assert_eq!(outcome, Err(ProtocolError::ControlFrameTooBig(128)));
    }

    #[test]
    fn incomplete_payload_is_progress() {
        let (_, outcome) = parse_bytes(b"\x81\x05hel");
        assert_eq!(outcome, Ok(Parsing::Progress));
        let (_, outcome) = parse_bytes(b"\x81");
        assert_eq!(outcome, Ok(Parsing::Progress));
    }

    #[test]
    fn shift_trailing_separates_back_to_back_frames() {
        let mut raw = BytesMut::new();
        raw.extend_from_slice(WsFrame::data(config(), OpCode::Text, true, b"one").as_bytes());
        raw.extend_from_slice(WsFrame::data(config(), OpCode::Text, true, b"two").as_bytes());
        let mut frame = WsFrame::with_buffer(config(), raw);
        let Ok(Parsing::Complete { next }) = frame.parse() else {
            panic!("expected complete frame");
        };
        let mut rest = frame.shift_trailing(next);
        assert_eq!(frame.content(), b"one");
        assert_eq!(rest.parse(), Ok(Parsing::Complete { next: 5 }));
        assert_eq!(rest.content(), b"two");
    }

    #[test]
    fn close_frame_layout() {
        let frame = WsFrame::close(config(), 1000, "normal close");
        let raw = frame.as_bytes();
        assert_eq!(raw[0], 0x88);
        assert_eq!(raw[1] as usize, 2 + "normal close".len());
        assert_eq!(&raw[2..4], &[0x03, 0xE8]);
        assert_eq!(frame.close_payload(), Some((1000, b"normal close".as_ref())));
    }

    #[test]
    fn close_reason_is_truncated_to_control_limits() {
        let long = "x".repeat(500);
        let frame = WsFrame::close(config(), 1002, &long);
        assert_eq!(frame.content().len(), 125);
    }
}
