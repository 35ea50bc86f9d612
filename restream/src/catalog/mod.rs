//! Channel catalog: the fixed set of sources this service can re-stream.

mod channel;
pub mod m3u;
mod store;

pub use channel::ChannelDescriptor;
pub use store::{ChannelCatalog, StaticCatalog};
