//! Error types for the harness.
//!
//! This module defines all error types that can occur while driving BlueZ,
//! obexd and oFono, or while serving the simulated peripheral.

use std::path::PathBuf;

use bluer::Address;
use thiserror::Error;

/// Main error type for the harness.
#[derive(Error, Debug)]
pub enum HarnessError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus call error: {0}")]
   DBusCall(#[from] zbus::fdo::Error),

   #[error("D-Bus value error: {0}")]
   Variant(#[from] zbus::zvariant::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("Device {0} still present after removal")]
   DeviceStillPresent(Address),

   #[error("{interface} not found for {address}")]
   InterfaceNotFound {
      interface: &'static str,
      address: Address,
   },

   #[error("No oFono modem for {0}")]
   ModemNotFound(Address),

   #[error("Voice call manager not set up")]
   NoVoiceCallManager,

   #[error("No active call")]
   NoActiveCall,

   #[error("File not found: {0}")]
   FileNotFound(PathBuf),

   #[error("Invalid argument: {0}")]
   InvalidArgument(String),

   #[error("Unknown GATT service: {0}")]
   UnknownService(String),

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with `HarnessError`.
pub type Result<T> = std::result::Result<T, HarnessError>;
