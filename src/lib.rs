//! RustStk Library
//!
//! Emulation of a StorageTek tape library as seen by ACSLS clients: an ONC
//! RPC port mapper, the CSI_ACSLM program driving mounts and dismounts, and
//! a TCP tape server that reads and writes the mounted virtual tape images.

pub mod cli;
pub mod config;
pub mod error;
pub mod logger;
pub mod rpc;
pub mod stk;
pub mod xdr;

#[cfg(test)]
mod tests;

// Re-export key types for easier use
pub use error::{Result, RustStkError};
pub use stk::{Library, SharedLibrary};
