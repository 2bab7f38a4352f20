//! Configuration module
//!
//! Loads the host configuration from a TOML file.

mod hub;

pub use hub::*;
