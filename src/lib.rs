#![cfg_attr(docsrs, feature(doc_cfg))]
//! # canbms_lib
//!
//! This crate decodes the CAN messages of lithium battery BMSes speaking the
//! Pylontech or SMA style protocols and aggregates up to four batteries into
//! a single virtual battery toward an inverter.
//!
//! Decoding is table driven: [`protocol`] holds the field and flag layout,
//! [`decoder`] turns frames into values and flag bits, and [`flags`] merges
//! the protocol variants of each flag. [`charger`] ties everything together on
//! a poll tick, sending through a [`transport::Transport`] and reporting
//! through a [`publisher::Publisher`].
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `canbms` command-line tool.
//! - `socketcan`: Enables the Linux SocketCAN transport.
//! - `bin-dependencies`: Enables all features required by the `canbms` binary executable.

/// Contains error types for the library.
mod error;
/// Frame layout of the supported BMS protocols.
pub mod protocol;

pub mod battery;
pub mod candump;
pub mod charger;
pub mod config;
pub mod decoder;
pub mod flags;
pub mod liveness;
pub mod publisher;
pub mod transport;

pub use error::Error;

/// SocketCAN transport for Linux.
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
#[cfg(feature = "socketcan")]
pub mod can_socket;
