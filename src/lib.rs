#![cfg_attr(docsrs, feature(doc_cfg))]
//! # jkbms_lib
//!
//! This crate provides a library for interacting with JK-BMS (Jikong)
//! battery monitors over their BLE notification protocol and their
//! RS-485/Modbus-flavored serial protocol.
//!
//! The pure protocol layer (framing, checksums, record decoding, switch
//! command construction) carries no I/O dependencies; the async transport
//! and bus master are gated behind a feature.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, everything the `jkbms`
//!   command-line tool needs.
//! - `tokio-serial-async`: Enables the **asynchronous** serial transport and
//!   bus master using `tokio` and `tokio-serial`.

/// Contains error types for the library.
mod error;

/// Checksums used by the wire protocols.
pub mod crc;

/// BLE notification reassembly and command frames.
pub mod ble;

/// Records, decoders, and command builders of the register protocol.
pub mod protocol;

pub use error::Error;

/// Asynchronous serial transport and frame reader.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod serial;

/// Bus master: poll scheduling, switch-write queue, record channel.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod bus;
