//! Chunk-heuristic message framing.
//!
//! Neither clients nor the upstream send a length field, so a message is
//! assembled from fixed-size receives:
//!
//! - every receive asks for up to [`CHUNK_SIZE`] bytes
//! - a full chunk means more data follows
//! - a short chunk (including an empty one) ends the message
//!
//! An empty message is the sentinel for "peer closed the connection".
//!
//! ## Boundary policy
//!
//! A message whose length is an exact multiple of [`CHUNK_SIZE`] ends with a
//! full chunk, so the framer keeps waiting for another receive:
//!
//! - If the peer closes, the empty receive completes the message with every
//!   byte already received.
//! - If the socket has a read timeout, a receive that times out after at
//!   least one byte has been accumulated completes the message. A timeout
//!   with nothing accumulated keeps waiting, since an idle peer has not
//!   sent anything yet.
//! - Otherwise the framer blocks. This is a limitation of the wire protocol,
//!   which is kept as-is rather than extended with a length prefix.

use bytes::BytesMut;
use std::io::{self, ErrorKind, Read};
use tracing::trace;

/// Maximum bytes requested per receive call.
pub const CHUNK_SIZE: usize = 64;

/// Framer progress for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Still receiving; `received` bytes accumulated so far.
    Receiving { received: usize },
    /// Message complete; the buffer holds `len` bytes.
    Complete { len: usize },
    /// A receive failed; the connection is unusable.
    Failed,
}

/// Assembles one message from a byte stream.
pub struct Framer<'a, R: Read> {
    stream: &'a mut R,
    buffer: BytesMut,
    state: FrameState,
}

impl<'a, R: Read> Framer<'a, R> {
    pub fn new(stream: &'a mut R) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(2 * CHUNK_SIZE),
            state: FrameState::Receiving { received: 0 },
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Perform one receive and advance the state machine.
    ///
    /// Calling this after the message is complete or failed is a no-op.
    pub fn step(&mut self) -> io::Result<FrameState> {
        let FrameState::Receiving { received } = self.state else {
            return Ok(self.state);
        };

        let mut chunk = [0u8; CHUNK_SIZE];
        match self.stream.read(&mut chunk) {
            Ok(n) => {
                self.buffer.extend_from_slice(&chunk[..n]);
                trace!(chunk = n, total = received + n, "Received chunk");
                self.state = if n < CHUNK_SIZE {
                    FrameState::Complete { len: received + n }
                } else {
                    FrameState::Receiving { received: received + n }
                };
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if is_timeout(&e) => {
                if received > 0 {
                    trace!(total = received, "Read timed out, completing message");
                    self.state = FrameState::Complete { len: received };
                }
            }
            Err(e) => {
                self.state = FrameState::Failed;
                return Err(e);
            }
        }

        Ok(self.state)
    }

    /// Drive the state machine until the message is complete.
    pub fn finish(mut self) -> io::Result<BytesMut> {
        loop {
            if let FrameState::Complete { len } = self.step()? {
                debug_assert_eq!(len, self.buffer.len());
                return Ok(self.buffer);
            }
        }
    }
}

/// Read one complete message from `stream`.
///
/// Returns an empty buffer when the peer has closed the connection.
pub fn receive_message<R: Read>(stream: &mut R) -> io::Result<BytesMut> {
    Framer::new(stream).finish()
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
