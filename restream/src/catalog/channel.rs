use serde::{Deserialize, Serialize};

/// One re-streamable channel. Immutable once the catalog is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Stable identifier, also used as the output directory name.
    pub id: String,
    /// Source locator handed to the transcoder.
    pub source_url: String,
    /// Display name.
    pub name: String,
    /// Logo URI.
    #[serde(default)]
    pub logo: Option<String>,
    /// Group label (e.g. "News").
    #[serde(default)]
    pub group: Option<String>,
}

impl ChannelDescriptor {
    pub fn new(
        id: impl Into<String>,
        source_url: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_url: source_url.into(),
            name: name.into(),
            logo: None,
            group: None,
        }
    }

    pub fn with_logo(mut self, logo: impl Into<String>) -> Self {
        self.logo = Some(logo.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Ids become directory names and URL path segments.
    pub fn has_valid_id(&self) -> bool {
        !self.id.is_empty()
            && self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}
