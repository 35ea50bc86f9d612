//! restream library crate.
//!
//! Re-streams a fixed channel catalog as HLS by supervising one ffmpeg
//! process per channel. The binary wires these modules together; they are
//! exposed here for integration testing.

pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod logging;
pub mod panic_hook;
pub mod stream;
pub mod utils;

pub use error::{Error, Result};
