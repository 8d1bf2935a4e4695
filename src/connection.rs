use std::time::Instant;

use crate::transport::ByteStream;

/// Lifecycle of one part's network attempt.
///
/// `Failed` and `TimedOut` are not terminal for the owning part: the engine
/// discards the connection and opens a fresh one at the chunk's current
/// offset, up to the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    NotStarted,
    Connecting,
    RequestSent,
    Receiving,
    Finished,
    Failed,
    TimedOut,
}

/// Transient per-part network and protocol state.
///
/// Owned by exactly one receive task and destroyed on retry; nothing here
/// outlives a single attempt at a chunk.
pub struct Connection {
    pub index: usize,
    pub state: ConnState,
    /// File offset the request asked the peer to start at.
    pub offset: u64,
    /// Request/control channel. Also carries payload for HTTP(S).
    pub control: ByteStream,
    /// FTP payload channel; payload arrives exclusively here when present.
    pub data: Option<ByteStream>,
    /// HTTP: response preamble already skipped on this connection.
    pub header_done: bool,
    /// Accumulates preamble bytes until the header boundary is found.
    pub header_buf: Vec<u8>,
    pub last_activity: Instant,
}

impl Connection {
    pub fn new(index: usize, control: ByteStream) -> Self {
        Self {
            index,
            state: ConnState::Connecting,
            offset: 0,
            control,
            data: None,
            header_done: false,
            header_buf: Vec::new(),
            last_activity: Instant::now(),
        }
    }

    /// The channel payload bytes arrive on.
    pub fn payload_mut(&mut self) -> &mut ByteStream {
        self.data.as_mut().unwrap_or(&mut self.control)
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
