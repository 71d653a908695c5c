use thiserror::Error;

/// errors during server setup, domain loading and runtime io
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error {0:?}")]
    Io(#[from] std::io::Error),
    #[error("tls error {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
    #[error("invalid config `{0}`")]
    Config(String),
    #[error("no domain descriptors found in `{0}`")]
    NoDomains(String),
    #[error("more than one default domain (`{0}` and `{1}`)")]
    DuplicateDefaultDomain(String, String),
    #[error("no domain configured for hostname `{0}`")]
    UnknownDomain(String),
    #[error("cert material `{0}` unusable")]
    BadCertificate(String),
    #[error("handler already registered for uri `{0}`")]
    HandlerExists(String),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// errors of the HTTP/1.1 grammar and its configured bounds
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HttpError {
    #[error("malformed start line")]
    StartLine,
    #[error("malformed http version")]
    Version,
    #[error("method exceeds {0} bytes")]
    MethodTooLong(usize),
    #[error("uri exceeds {0} bytes")]
    UriTooLong(usize),
    #[error("malformed header line")]
    HeaderLine,
    #[error("header line exceeds {0} bytes")]
    HeaderLineTooLong(usize),
    #[error("more than {0} header lines")]
    TooManyHeaders(usize),
    #[error("missing or duplicated header `{0}`")]
    MissingHeader(&'static str),
    #[error("malformed content-length")]
    ContentLength,
    #[error("more than {0} transfer codings")]
    TooManyTransferCodings(usize),
    #[error("chunked is not the final transfer coding")]
    ChunkedNotLast,
    #[error("malformed chunk")]
    Chunk,
    #[error("chunk exceeds {0} bytes")]
    ChunkTooLarge(usize),
    #[error("header not closed")]
    HeaderNotClosed,
    #[error("message is not a request")]
    NotARequest,
}

/// errors decoding websocket frames or driving the websocket layer,
/// each mapping to the close code sent before the connection drops
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("reserved bits set {0:#04x}")]
    ReservedBits(u8),
    #[error("invalid opcode {0}")]
    InvalidOpcode(u8),
    #[error("non minimal payload length encoding")]
    NonMinimalLength,
    #[error("payload length out of range")]
    LengthOutOfRange,
    #[error("fragmented control frame")]
    FragmentedControlFrame,
    #[error("control frame payload of {0} bytes")]
    ControlFrameTooBig(usize),
    #[error("fragmentation sequence mismatch")]
    FragmentationMismatch,
    #[error("max frames reached")]
    MaxFramesReached,
    #[error("invalid utf-8 text")]
    InvalidUtf8,
    #[error("non JSON input")]
    NotJson,
    #[error("content not accepted")]
    ContentNotAccepted,
}

impl ProtocolError {
    /// RFC 6455 close code carried by the close frame for this error
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::InvalidUtf8 | ProtocolError::NotJson => 1003,
            _ => 1002,
        }
    }

    /// reason phrase carried by the close frame for this error
    pub fn close_phrase(&self) -> &'static str {
        match self {
            ProtocolError::ReservedBits(_)
            | ProtocolError::InvalidOpcode(_)
            | ProtocolError::NonMinimalLength
            | ProtocolError::LengthOutOfRange
            | ProtocolError::FragmentedControlFrame
            | ProtocolError::ControlFrameTooBig(_) => "not a websocket frame",
            ProtocolError::FragmentationMismatch => "websocket protocol error",
            ProtocolError::MaxFramesReached => "max frames reached",
            ProtocolError::InvalidUtf8 => "invalid utf-8 text",
            ProtocolError::NotJson => "non JSON input",
            ProtocolError::ContentNotAccepted => "content not accepted",
        }
    }
}
