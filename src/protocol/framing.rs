//! Length-delimited frame reassembly.
//!
//! Incoming socket reads arrive in arbitrary chunks: a frame may be split across many
//! reads and one read may carry several frames. [`FrameAssembler`] accumulates chunks in
//! an owned arena with a separate read cursor and hands out each complete frame body as
//! an independent [`MessageReader`] whose cursor starts at the first byte after the
//! length field.
//!
//! ```text
//!  arena:  | consumed ... | len | body ........ | len | bo…
//!                         ^ cursor              ^ next frame
//! ```
use bytes::{Buf, Bytes, BytesMut};
use log::trace;

use crate::{
    buffer::MessageReader,
    error::{ClientError, Result},
};

const LENGTH_FIELD_SIZE: usize = size_of::<i32>();

#[derive(Debug, Default)]
pub struct FrameAssembler {
    arena: Option<BytesMut>,
    cursor: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk read from the socket.
    pub fn push(&mut self, chunk: &[u8]) {
        match self.arena.as_mut() {
            Some(arena) => {
                // Bytes in front of the cursor belong to frames already handed out.
                arena.advance(self.cursor);
                self.cursor = 0;
                arena.extend_from_slice(chunk);
            }
            None => {
                if !chunk.is_empty() {
                    self.arena = Some(BytesMut::from(chunk));
                    self.cursor = 0;
                }
            }
        }
    }

    /// Extracts the next complete frame body, or `None` while the frame at the cursor is
    /// still incomplete.
    pub fn next_frame(&mut self) -> Result<Option<MessageReader>> {
        let Some(arena) = self.arena.as_ref() else {
            return Ok(None);
        };

        let available = arena.len() - self.cursor;
        if available < LENGTH_FIELD_SIZE {
            return Ok(None);
        }

        let mut length = [0u8; LENGTH_FIELD_SIZE];
        length.copy_from_slice(&arena[self.cursor..self.cursor + LENGTH_FIELD_SIZE]);
        let length = i32::from_le_bytes(length);
        let length = usize::try_from(length).map_err(|_| {
            ClientError::InternalProtocol(format!("negative frame length {length}"))
        })?;

        let body_start = self.cursor + LENGTH_FIELD_SIZE;
        let frame_end = body_start + length;
        if arena.len() < frame_end {
            trace!(
                "partial frame: have {} of {} bytes",
                arena.len() - self.cursor,
                frame_end - self.cursor
            );
            return Ok(None);
        }

        let body = Bytes::copy_from_slice(&arena[body_start..frame_end]);
        if frame_end == arena.len() {
            self.arena = None;
            self.cursor = 0;
        } else {
            self.cursor = frame_end;
        }

        trace!("extracted frame of {length} bytes");
        Ok(Some(MessageReader::new(body)))
    }

    /// Bytes held for a frame that has not fully arrived yet.
    pub fn buffered(&self) -> usize {
        self.arena
            .as_ref()
            .map(|arena| arena.len() - self.cursor)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_none()
    }

    pub fn clear(&mut self) {
        self.arena = None;
        self.cursor = 0;
    }
}
