//! Catalog lookups.

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

use super::ChannelDescriptor;
use crate::utils::fs::io_error;
use crate::{Error, Result};

/// Read-only source of channel descriptors.
///
/// The supervisor only ever reads from the catalog; implementations backed by
/// a metadata store must be safe to call from any task.
pub trait ChannelCatalog: Send + Sync {
    /// Look up a single channel.
    fn lookup(&self, id: &str) -> Option<ChannelDescriptor>;

    /// All channels, in catalog order.
    fn list_all(&self) -> Vec<ChannelDescriptor>;
}

/// In-memory catalog loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    channels: Vec<ChannelDescriptor>,
    index: HashMap<String, usize>,
}

impl StaticCatalog {
    /// Build a catalog, rejecting duplicate or unusable ids.
    pub fn new(channels: Vec<ChannelDescriptor>) -> Result<Self> {
        let mut index = HashMap::with_capacity(channels.len());
        for (pos, channel) in channels.iter().enumerate() {
            if !channel.has_valid_id() {
                return Err(Error::config(format!(
                    "Invalid channel id '{}': use letters, digits, '_' or '-'",
                    channel.id
                )));
            }
            if channel.source_url.trim().is_empty() {
                return Err(Error::config(format!(
                    "Channel '{}' has no source url",
                    channel.id
                )));
            }
            if index.insert(channel.id.clone(), pos).is_some() {
                return Err(Error::config(format!(
                    "Duplicate channel id '{}'",
                    channel.id
                )));
            }
        }

        Ok(Self { channels, index })
    }

    /// Load a JSON array of channel descriptors.
    pub async fn load_json(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| io_error("reading channel catalog", path, e))?;
        let channels: Vec<ChannelDescriptor> = serde_json::from_str(&raw)?;
        let catalog = Self::new(channels)?;

        info!(
            path = %path.display(),
            channels = catalog.len(),
            "Loaded channel catalog"
        );
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl ChannelCatalog for StaticCatalog {
    fn lookup(&self, id: &str) -> Option<ChannelDescriptor> {
        self.index.get(id).map(|&pos| self.channels[pos].clone())
    }

    fn list_all(&self) -> Vec<ChannelDescriptor> {
        self.channels.clone()
    }
}
