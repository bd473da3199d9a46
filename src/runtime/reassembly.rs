//! Message reassembly over a fixed-size receive chunk.
//!
//! Reads land in `chunk[next_receive..]`. Complete frames are cut out of the
//! region `chunk[data_start..next_receive]` and handed on as payloads. A frame
//! header that arrives split across reads stays in the chunk until it is
//! whole; body bytes are moved into an accumulator as they arrive, so a frame
//! may be larger than the chunk itself.
//!
//! ```text
//! 0        data_start          next_receive        chunk.len()
//! |  done  |  unconsumed bytes |  receive window   |
//! ```
//!
//! When the window shrinks to nothing the unconsumed tail is copied to the
//! front of the chunk (compaction) and reading continues behind it.

use crate::error::{NetError, NetResult};
use crate::packet::PacketCodec;
use bytes::{Bytes, BytesMut};

/// Where the state machine is inside the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for a complete header.
    AwaitingHeader,
    /// Header decoded; `remaining` payload bytes still to come.
    AwaitingBody { remaining: usize },
}

/// Per-connection reassembly state.
#[derive(Debug)]
pub struct ReassemblyState {
    phase: Phase,
    data_start: usize,
    next_receive: usize,
    body: BytesMut,
}

impl Default for ReassemblyState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReassemblyState {
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitingHeader,
            data_start: 0,
            next_receive: 0,
            body: BytesMut::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The part of `chunk` the next read should fill.
    pub fn receive_window<'a>(&self, chunk: &'a mut [u8]) -> &'a mut [u8] {
        &mut chunk[self.next_receive..]
    }

    /// Process `received` new bytes written into the receive window.
    ///
    /// Every payload completed by these bytes is passed to `emit`, in order.
    /// Returns the number of payloads emitted. A header the codec rejects is a
    /// framing error; the caller is expected to drop the connection.
    pub fn on_received<F>(
        &mut self,
        chunk: &mut [u8],
        received: usize,
        codec: &dyn PacketCodec,
        mut emit: F,
    ) -> NetResult<usize>
    where
        F: FnMut(Bytes),
    {
        debug_assert!(self.next_receive + received <= chunk.len());
        self.next_receive += received;

        let header_size = codec.header_size();
        let mut emitted = 0;

        loop {
            let available = self.next_receive - self.data_start;

            match self.phase {
                Phase::AwaitingHeader => {
                    if available < header_size {
                        break;
                    }
                    let header = &chunk[self.data_start..self.data_start + header_size];
                    let length = codec.length_of(header)?;
                    let remaining = length.checked_sub(header_size).ok_or_else(|| {
                        NetError::framing(format!(
                            "frame length {length} is smaller than the {header_size} byte header"
                        ))
                    })?;

                    self.data_start += header_size;
                    self.body.reserve(remaining);
                    self.phase = Phase::AwaitingBody { remaining };
                }
                Phase::AwaitingBody { remaining } => {
                    let take = remaining.min(available);
                    self.body
                        .extend_from_slice(&chunk[self.data_start..self.data_start + take]);
                    self.data_start += take;

                    if take < remaining {
                        self.phase = Phase::AwaitingBody {
                            remaining: remaining - take,
                        };
                        break;
                    }

                    self.phase = Phase::AwaitingHeader;
                    emitted += 1;
                    emit(self.body.split().freeze());
                }
            }
        }

        self.compact(chunk);
        Ok(emitted)
    }

    /// Whether no part of a frame is being held.
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::AwaitingHeader && self.data_start == self.next_receive
    }

    /// Bytes of the current, incomplete frame received so far (header included).
    pub fn buffered(&self, header_size: usize) -> usize {
        match self.phase {
            Phase::AwaitingHeader => self.next_receive - self.data_start,
            Phase::AwaitingBody { .. } => header_size + self.body.len(),
        }
    }

    /// Total length of the current frame, once its header has been decoded.
    pub fn expected(&self, header_size: usize) -> Option<usize> {
        match self.phase {
            Phase::AwaitingHeader => None,
            Phase::AwaitingBody { remaining } => Some(header_size + self.body.len() + remaining),
        }
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.phase = Phase::AwaitingHeader;
        self.data_start = 0;
        self.next_receive = 0;
        self.body = BytesMut::new();
    }

    fn compact(&mut self, chunk: &mut [u8]) {
        if self.data_start == self.next_receive {
            self.data_start = 0;
            self.next_receive = 0;
        } else if self.next_receive == chunk.len() {
            let pending = self.next_receive - self.data_start;
            chunk.copy_within(self.data_start..self.next_receive, 0);
            self.data_start = 0;
            self.next_receive = pending;
        }
    }
}
