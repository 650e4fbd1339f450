//! Framing of the Daly BMS wire protocol.
//!
//! Every message, in both directions, has the same layout:
//!
//! ```text
//! +------+---------+---------+--------+----------------+----------+
//! | 0xA5 | address | command | length | data (length)  | checksum |
//! +------+---------+---------+--------+----------------+----------+
//! ```
//!
//! The checksum is the wrapping sum of all preceding bytes. The BMS always
//! uses a length of 8, which gives the well known 13 byte frames.

use crate::error::{Error, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Address {
    /// Host address used on the RS485 port
    Rs485Host = 0x40,
    /// Host address used on the UART port and the Bluetooth module
    UartHost = 0x80,
    /// Source address of replies sent by the BMS
    Bms = 0x01,
}

pub const START_BYTE: u8 = 0xa5;
pub const DATA_LENGTH: u8 = 0x08;
pub const HEADER_LENGTH: usize = 4;
pub const MIN_FRAME_LENGTH: usize = HEADER_LENGTH + 1;
pub const FRAME_LENGTH: usize = HEADER_LENGTH + DATA_LENGTH as usize + 1;
/// No Daly command carries more than [`DATA_LENGTH`] data bytes.
pub const MAX_FRAME_LENGTH: usize = FRAME_LENGTH;

/// One validated protocol message.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: u8,
    pub command: u8,
    pub data: Vec<u8>,
    pub checksum: u8,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame {{ address: {:02X}, command: {:02X}, data: {:02X?}, checksum: {:02X} }}",
            self.address, self.command, self.data, self.checksum
        )
    }
}

pub fn calc_crc(buffer: &[u8]) -> u8 {
    let mut checksum: u8 = 0;
    for b in buffer {
        checksum = checksum.wrapping_add(*b);
    }
    checksum
}

/// Builds a request frame: header, `payload` and the trailing checksum.
pub fn encode(address: Address, command: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > DATA_LENGTH as usize {
        return Err(Error::InvalidPayload {
            command,
            length: payload.len(),
        });
    }
    let mut tx_buffer = Vec::with_capacity(HEADER_LENGTH + payload.len() + 1);
    tx_buffer.push(START_BYTE);
    tx_buffer.push(address as u8);
    tx_buffer.push(command);
    tx_buffer.push(payload.len() as u8);
    tx_buffer.extend_from_slice(payload);
    tx_buffer.push(calc_crc(&tx_buffer));
    Ok(tx_buffer)
}

fn validate_len(buffer: &[u8]) -> Result<()> {
    if buffer.len() < MIN_FRAME_LENGTH {
        log::warn!(
            "Invalid buffer size - required={} received={}",
            MIN_FRAME_LENGTH,
            buffer.len()
        );
        return Err(Error::MalformedFrame(format!(
            "{} bytes is shorter than the minimum frame",
            buffer.len()
        )));
    }
    Ok(())
}

fn validate_checksum(buffer: &[u8]) -> Result<()> {
    let (content, received) = buffer.split_at(buffer.len() - 1);
    let calculated = calc_crc(content);
    if received[0] != calculated {
        log::warn!(
            "Invalid checksum - calculated={:02X?} received={:02X?} buffer={:02X?}",
            calculated,
            received[0],
            buffer
        );
        return Err(Error::ChecksumMismatch {
            calculated,
            received: received[0],
        });
    }
    Ok(())
}

/// Total length of the frame announced by `header`, if the header is
/// plausible. Needs at least [`HEADER_LENGTH`] bytes.
pub fn frame_length(header: &[u8]) -> Option<usize> {
    if header.len() < HEADER_LENGTH || header[0] != START_BYTE || header[3] > DATA_LENGTH {
        return None;
    }
    Some(HEADER_LENGTH + header[3] as usize + 1)
}

/// Validates and splits exactly one frame.
///
/// The checksum is checked before the structure so that any single corrupted
/// byte of a good frame is reported as [`Error::ChecksumMismatch`].
pub fn decode(rx_buffer: &[u8]) -> Result<Frame> {
    validate_len(rx_buffer)?;
    validate_checksum(rx_buffer)?;
    if rx_buffer[0] != START_BYTE {
        return Err(Error::MalformedFrame(format!(
            "start byte {:02X} instead of {:02X}",
            rx_buffer[0], START_BYTE
        )));
    }
    match frame_length(rx_buffer) {
        Some(length) if length == rx_buffer.len() => {}
        _ => {
            return Err(Error::MalformedFrame(format!(
                "declared length {} does not match {} received bytes",
                rx_buffer[3],
                rx_buffer.len()
            )))
        }
    }
    let last = rx_buffer.len() - 1;
    Ok(Frame {
        address: rx_buffer[1],
        command: rx_buffer[2],
        data: rx_buffer[HEADER_LENGTH..last].to_vec(),
        checksum: rx_buffer[last],
    })
}
