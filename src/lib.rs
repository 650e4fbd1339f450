#![cfg_attr(docsrs, feature(doc_cfg))]
//! # dalybms_ble
//!
//! This crate talks to Daly BMS (Battery Management System) devices over
//! Bluetooth LE and keeps an up to date picture of their telemetry.
//!
//! The pieces, bottom up:
//! - [`protocol`]: the fixed 13 byte frame, checksum, encode and decode.
//! - [`reassembler`]: turns BLE notification chunks back into frames.
//! - [`registry`]: the read commands and their typed payload decoders.
//! - [`session`]: connection state machine with timeouts, reconnect backoff
//!   and a single outstanding request.
//! - [`telemetry`]: merges decoded updates into per device snapshots.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `dalybms-ble` command-line tool.
//!
//! ### Transport Features
//! - `bluetooth`: Enables the [`Transport`] implementation on top of `btleplug`.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing/deserializing data structures.
//! - `bin-dependencies`: Enables all features required by the `dalybms-ble` binary executable (currently `bluetooth` and `serde`).

/// Contains error types for the library.
mod error;
/// Defines the communication protocol for Daly BMS.
pub mod protocol;
pub mod reassembler;
pub mod registry;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use error::{Error, Result};
pub use registry::{Command, TelemetryUpdate};
pub use session::{PollReport, Session, SessionConfig, SessionState, SessionStatistics};
pub use telemetry::{Aggregator, TelemetrySnapshot};
pub use transport::{DeviceAddress, Transport};

/// Bluetooth LE transport for Daly BMS communication.
#[cfg_attr(docsrs, doc(cfg(feature = "bluetooth")))]
#[cfg(feature = "bluetooth")]
pub mod ble;

#[cfg(feature = "bluetooth")]
pub use ble::BleTransport;
