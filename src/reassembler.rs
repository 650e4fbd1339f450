//! Reassembly of BLE notification fragments into protocol frames.
//!
//! The Bluetooth module forwards the UART stream of the BMS in notifications
//! of at most one MTU. A frame may be split over several notifications and
//! several frames may arrive in a single one, so the bytes are collected in
//! an owned buffer and cut at the length announced in each frame header.

use crate::protocol::{self, Frame, HEADER_LENGTH, MAX_FRAME_LENGTH, START_BYTE};

const MAX_BUFFER_LENGTH: usize = 16 * MAX_FRAME_LENGTH;

#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
    discarded: usize,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a received chunk. The oldest bytes are dropped when the
    /// buffer would exceed its bound.
    pub fn feed(&mut self, chunk: &[u8]) {
        log::trace!("feed {} bytes: {chunk:02X?}", chunk.len());
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > MAX_BUFFER_LENGTH {
            let overflow = self.buffer.len() - MAX_BUFFER_LENGTH;
            log::warn!("Reassembly buffer overflow, dropping {overflow} bytes");
            self.discard(overflow);
        }
    }

    /// Cuts the next valid frame out of the buffer.
    ///
    /// Returns `None` when more bytes are needed. Bytes that cannot start a
    /// valid frame are skipped one at a time until the next start byte.
    pub fn try_extract(&mut self) -> Option<Frame> {
        loop {
            match self.buffer.iter().position(|b| *b == START_BYTE) {
                Some(0) => {}
                Some(garbage) => self.discard(garbage),
                None => {
                    let garbage = self.buffer.len();
                    self.discard(garbage);
                    return None;
                }
            }
            if self.buffer.len() < HEADER_LENGTH {
                return None;
            }
            let Some(length) = protocol::frame_length(&self.buffer) else {
                log::debug!("Implausible frame header {:02X?}", &self.buffer[..HEADER_LENGTH]);
                self.discard(1);
                continue;
            };
            if self.buffer.len() < length {
                return None;
            }
            match protocol::decode(&self.buffer[..length]) {
                Ok(frame) => {
                    self.buffer.drain(..length);
                    log::trace!("extracted {frame:?}");
                    return Some(frame);
                }
                Err(err) => {
                    log::debug!("Resynchronizing after {err}");
                    self.discard(1);
                }
            }
        }
    }

    /// Number of bytes thrown away since creation.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Bytes waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn discard(&mut self, count: usize) {
        self.buffer.drain(..count);
        self.discarded += count;
    }
}
