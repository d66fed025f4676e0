//! Shared utilities.
//!
//! External process execution and test helpers.

pub mod process;

#[cfg(test)]
pub mod testutil;
