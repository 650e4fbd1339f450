//! The link abstraction the session drives.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

/// Bluetooth device address (`AA:BB:CC:DD:EE:FF`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for DeviceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidAddress(s.to_string());
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// A BLE-like transport: connect, write requests, receive notification
/// chunks, disconnect.
///
/// Implementations do not retry or time out on their own; the session
/// bounds every call.
#[async_trait]
pub trait Transport: Send {
    /// An open link to one device, exclusively owned by one session.
    type Link: Send;

    /// Connects and subscribes to the notifications of the device.
    async fn connect(&mut self, address: &DeviceAddress) -> Result<Self::Link>;

    async fn write(&mut self, link: &mut Self::Link, bytes: &[u8]) -> Result<()>;

    /// Waits for the next notification chunk. `None` means the link is gone.
    async fn notification(&mut self, link: &mut Self::Link) -> Option<Vec<u8>>;

    async fn disconnect(&mut self, link: Self::Link) -> Result<()>;
}
