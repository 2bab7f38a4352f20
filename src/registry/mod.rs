//! Connection registry module
//!
//! Owns the live connection set, tears connections down on close and
//! broadcasts text to every connection of a category.

mod connection;
mod manager;

pub use connection::*;
pub use manager::*;
