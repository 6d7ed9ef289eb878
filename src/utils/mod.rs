//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `sessionbus` crate.
//!
//! It centralizes the error types shared by the store and bus layers and the
//! logging initialisation used by the binary and the tests.

pub mod error;
pub mod logging;

pub use error::{BusError, StoreError};
