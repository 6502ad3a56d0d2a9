//! mbt-core — wire format, chunk bitmaps, timeouts and configuration shared by
//! every mbt crate.

pub mod bitmap;
pub mod config;
pub mod timeout;
pub mod wire;

pub use bitmap::Bitmap;
pub use config::MbtConfig;
pub use wire::{Address, Message, WireError};
