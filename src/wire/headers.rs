use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::types::{ChannelId, ROOT_ID};
use crate::error::{ChanError, Result};

/// Header carrying the id of the channel a stream belongs to.
pub const REF_HEADER: &str = "libchan-ref";
/// Header carrying the id of the channel whose stream opened this one.
pub const PARENT_REF_HEADER: &str = "libchan-parent-ref";

/// Metadata delivered with every transport-level stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeaders {
    entries: HashMap<String, String>,
}

impl StreamHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers for the stream backing `id`. `None` marks a top-level channel.
    pub fn for_channel(id: ChannelId, parent: Option<ChannelId>) -> Self {
        Self::new()
            .with(REF_HEADER, id.to_string())
            .with(PARENT_REF_HEADER, parent.unwrap_or(ROOT_ID).to_string())
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// The channel this stream belongs to.
    pub fn channel_ref(&self) -> Result<ChannelId> {
        let id = self.parse_id(REF_HEADER)?;
        if id.is_root() {
            return Err(self.invalid(REF_HEADER));
        }
        Ok(id)
    }

    /// The parent channel, or `None` for a top-level stream.
    pub fn parent_ref(&self) -> Result<Option<ChannelId>> {
        let id = self.parse_id(PARENT_REF_HEADER)?;
        Ok((!id.is_root()).then_some(id))
    }

    fn parse_id(&self, name: &str) -> Result<ChannelId> {
        self.get(name)
            .and_then(|value| value.trim().parse::<u32>().ok())
            .map(ChannelId)
            .ok_or_else(|| self.invalid(name))
    }

    fn invalid(&self, name: &str) -> ChanError {
        ChanError::InvalidHeader {
            name: name.to_string(),
            value: self.get(name).map(str::to_string),
        }
    }
}
