#![cfg_attr(docsrs, feature(doc_cfg))]
//! # ubms_lib
//!
//! This crate provides a library for talking to Valence U-BMS battery controllers
//! over CAN. It decodes the broadcast messages into a [`state::BatteryState`],
//! runs the connection handshake and keeps the operating mode command alive.
//! On top of that it derives alarms and keeps energy history across restarts.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `ubms` command-line tool.
//!
//! ### Transport Features
//! - `socketcan`: Enables the Linux SocketCAN [`transport::Transport`] implementation.
//!
//! ### Utility Features
//! - `bin-dependencies`: Enables all features required by the `ubms` binary executable (currently `socketcan`).

/// Contains error types for the library.
mod error;
/// Frame ids, filters and the field helpers of the U-BMS protocol.
pub mod protocol;

/// Alarm levels derived from the decoded state.
pub mod alarms;
/// Decoding of received frames.
pub mod decoder;
/// Connection handshake.
pub mod handshake;
/// Energy and capacity history.
pub mod history;
/// Operating mode keep-alive.
pub mod mode;
/// Shared state and the analytics cycle.
pub mod monitor;
/// Persistent settings.
pub mod settings;
/// Battery state and configuration.
pub mod state;
/// Frame transport abstraction.
pub mod transport;

pub use error::Error;

/// Linux SocketCAN transport.
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
#[cfg(feature = "socketcan")]
pub mod socketcan;
