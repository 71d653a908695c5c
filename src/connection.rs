//! per connection state
//!
//! [`ConnShared`] is the registry facing half of a connection: byte
//! counters, io timestamps and the cancellation token the reaper and
//! `Server::close` use. The rest of the connection state lives inside
//! its task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio_util::sync::CancellationToken;

use crate::domain::Domain;
use crate::errors::ProtocolError;
use crate::frame::{Fragmentation, OpCode, WsFrame};
use crate::handler::ConnId;

/// how long a locally initiated close waits for the peer's close frame
pub(crate) const CLOSE_RESPONSE_DELAY: Duration = Duration::from_secs(1);

/// classification after the TLS handshake; every connection starts as
/// HTTP and may switch to websocket on a successful upgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionType {
    Http,
    Websocket,
}

#[derive(Debug)]
pub(crate) struct ConnShared {
    pub id: ConnId,
    pub peer: SocketAddr,
    pub created: Instant,
    pub handshaked: AtomicBool,
    pub in_bytes: AtomicU64,
    pub out_bytes: AtomicU64,
    /// microseconds since `created`, zero while no inbound io was seen
    pub last_in: AtomicU64,
    pub last_out: AtomicU64,
    /// close response deadline in microseconds since `created`, zero unset
    pub close_deadline: AtomicU64,
    pub cancel: CancellationToken,
    pub domain: OnceLock<Arc<Domain>>,
}

impl ConnShared {
    pub fn new(id: ConnId, peer: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer,
            created: Instant::now(),
            handshaked: AtomicBool::new(false),
            in_bytes: AtomicU64::new(0),
            out_bytes: AtomicU64::new(0),
            last_in: AtomicU64::new(0),
            last_out: AtomicU64::new(0),
            close_deadline: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            domain: OnceLock::new(),
        })
    }

    fn now_us(&self) -> u64 {
        self.created.elapsed().as_micros().min(u64::MAX as u128) as u64
    }

    pub fn stamp_in(&self, bytes: usize) {
        self.in_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_in.store(self.now_us().max(1), Ordering::Relaxed);
    }

    pub fn stamp_out(&self, bytes: usize) {
        self.out_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_out.store(self.now_us().max(1), Ordering::Relaxed);
    }

    pub fn set_close_deadline(&self, delay: Duration) {
        let deadline = self.now_us() + delay.as_micros() as u64;
        self.close_deadline.store(deadline.max(1), Ordering::Relaxed);
    }

    pub fn close_deadline_elapsed(&self) -> bool {
        let deadline = self.close_deadline.load(Ordering::Relaxed);
        deadline != 0 && self.now_us() >= deadline
    }
}

/// websocket close metadata; the first recorded code wins
#[derive(Debug, Default)]
pub(crate) struct CloseState {
    pub code: u16,
    pub phrase: String,
    pub sent: bool,
    pub recv: bool,
}

impl CloseState {
    pub fn set(&mut self, code: u16, phrase: &str) {
        if self.code == 0 {
            self.code = code;
            self.phrase = phrase.into();
        }
    }
}

/// outcome of feeding one data frame into reassembly
#[derive(Debug)]
pub(crate) enum Reassembly {
    /// a complete logical message, content of all fragments concatenated
    Message { payload: BytesMut, text: bool },
    /// buffered, awaiting the FIN frame
    Buffered,
}

/// reassembles fragmented messages and validates the sequence
///
/// Valid sequences are a standalone frame, or start, any number of
/// continues, last. Anything else is a protocol violation. Frames must
/// be unmasked before they come in here.
pub(crate) struct Defrag {
    frames: Vec<WsFrame>,
    last: Fragmentation,
    text: bool,
}

impl Defrag {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            last: Fragmentation::None,
            text: false,
        }
    }

    pub fn accept(
        &mut self,
        frame: WsFrame,
        max_frames: u64,
    ) -> Result<Reassembly, ProtocolError> {
        match frame.state() {
            Fragmentation::None => {
                if !matches!(self.last, Fragmentation::None | Fragmentation::Last) {
                    return Err(ProtocolError::FragmentationMismatch);
                }
                self.last = Fragmentation::None;
                Ok(Reassembly::Message {
                    payload: BytesMut::from(frame.content()),
                    text: frame.opcode() == OpCode::Text,
                })
            }
            Fragmentation::Start => {
                if !matches!(self.last, Fragmentation::None | Fragmentation::Last)
                    || !self.frames.is_empty()
                {
                    return Err(ProtocolError::FragmentationMismatch);
                }
                self.text = frame.opcode() == OpCode::Text;
                self.buffer(frame, max_frames)
            }
            Fragmentation::Continue => {
                if !matches!(self.last, Fragmentation::Start | Fragmentation::Continue) {
                    return Err(ProtocolError::FragmentationMismatch);
                }
                self.buffer(frame, max_frames)
            }
            Fragmentation::Last => {
                if !matches!(self.last, Fragmentation::Start | Fragmentation::Continue) {
                    return Err(ProtocolError::FragmentationMismatch);
                }
                self.last = Fragmentation::Last;
                self.frames.push(frame);
                let mut payload = BytesMut::new();
                for frame in self.frames.drain(..) {
                    payload.extend_from_slice(frame.content());
                }
                Ok(Reassembly::Message {
                    payload,
                    text: self.text,
                })
            }
        }
    }

    fn buffer(&mut self, frame: WsFrame, max_frames: u64) -> Result<Reassembly, ProtocolError> {
        self.last = frame.state();
        self.frames.push(frame);
        if max_frames != 0 && self.frames.len() as u64 >= max_frames {
            return Err(ProtocolError::MaxFramesReached);
        }
        Ok(Reassembly::Buffered)
    }
}
