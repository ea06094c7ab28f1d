//! Draft artifacts and the single-file draft slot.
//!
//! Presence of the slot file means "a new draft is ready". The slot never
//! interprets drafts beyond a best-effort read of the provenance header:
//! externally produced drafts are opaque text.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{write_atomic, StoreError};
use crate::params::StrategyModule;

/// BLAKE3 hex digest of draft content.
pub fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

/// Longest prefix of `text` with at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// An unpromoted candidate artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub content: String,
    pub content_hash: String,
    pub generated_at: Option<DateTime<Utc>>,
    pub provenance: Option<String>,
}

impl Draft {
    pub fn from_content(content: String) -> Self {
        let header = StrategyModule::parse(&content)
            .ok()
            .and_then(|m| m.provenance);
        Self {
            content_hash: content_hash(&content),
            generated_at: header.as_ref().map(|h| h.generated_at),
            provenance: header.map(|h| h.description),
            content,
        }
    }

    pub fn from_module(module: &StrategyModule) -> Result<Self, StoreError> {
        Ok(Self::from_content(module.render()?))
    }

    pub fn snippet(&self, max_chars: usize) -> &str {
        truncate_chars(&self.content, max_chars)
    }

    /// Short hash prefix for log lines and messages.
    pub fn short_hash(&self) -> &str {
        truncate_chars(&self.content_hash, 12)
    }
}

/// The file-like slot drafts are written to and polled from.
#[derive(Debug, Clone)]
pub struct DraftSlot {
    path: PathBuf,
}

impl DraftSlot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<Option<Draft>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(Draft::from_content(content))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }

    pub fn write_module(&self, module: &StrategyModule) -> Result<Draft, StoreError> {
        let draft = Draft::from_module(module)?;
        write_atomic(&self.path, draft.content.as_bytes())?;
        info!(path = %self.path.display(), hash = draft.short_hash(), "draft written");
        Ok(draft)
    }

    /// Delete the slot file if it still holds the draft with `hash`.
    ///
    /// Returns `Ok(false)` when the file is already gone or has been replaced
    /// by a different draft since.
    pub fn remove_if_matches(&self, hash: &str) -> Result<bool, StoreError> {
        let current = match self.load()? {
            Some(draft) => draft,
            None => return Ok(false),
        };
        if current.content_hash != hash {
            debug!(
                expected = truncate_chars(hash, 12),
                found = current.short_hash(),
                "draft slot holds a newer draft, leaving it"
            );
            return Ok(false);
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }
}
