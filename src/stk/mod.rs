//! StorageTek library emulation: the ACSLS CSI engine, the shared drive and
//! volume state, and the tape server that exposes mounted images.

pub mod acsls;
pub mod catalog;
pub mod constants;
pub mod csi;
pub mod library;
pub mod tape;
pub mod tape_server;

pub use acsls::{CallbackDispatcher, DeferredResponse, StkCsi};
pub use library::{Library, SharedLibrary};
pub use tape_server::TapeServer;
