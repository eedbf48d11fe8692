//! Shared utilities for kernif.

pub mod addr;

pub use addr::{in_prefix, network_of, parse_prefix};
