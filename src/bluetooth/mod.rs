//! Bluetooth adapter layer.
//!
//! Device discovery, pairing and connection handling on one adapter, plus
//! the pairing agent BlueZ calls back into.

pub mod agent;
pub mod manager;
