//! Import tag bookkeeping.
//!
//! Every lead touched by a run gets linked to one tag identifying the run.
//! The tag is ensured once, before any worker starts, and links are written
//! check-first so a lead never carries the same tag twice.

use crate::import::repository::{LeadRepository, RepositoryError};
use serde::Serialize;
use std::sync::Arc;

/// Color used when neither the rule set nor the configuration provides one.
pub const DEFAULT_TAG_COLOR: &str = "#6366f1";

/// Tag created (or reused) for one import run.
///
/// An existing tag keeps its stored color; the color passed to
/// [`TagManager::ensure`] only applies on creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportTag {
    pub id: i32,
    pub name: String,
}

/// Deterministic tag name for a run: `"<source label> - <import label>"`.
pub fn tag_name(source_label: &str, import_label: &str) -> String {
    let import_label = import_label.trim();
    if import_label.is_empty() {
        source_label.to_string()
    } else {
        format!("{source_label} - {import_label}")
    }
}

#[derive(Clone)]
pub struct TagManager {
    repository: Arc<dyn LeadRepository>,
}

impl TagManager {
    pub fn new(repository: Arc<dyn LeadRepository>) -> Self {
        Self { repository }
    }

    /// Get or create the tag called `name`.
    pub async fn ensure(&self, name: &str, color: &str) -> Result<ImportTag, RepositoryError> {
        let id = self.repository.get_or_create_tag(name, color).await?;
        Ok(ImportTag {
            id,
            name: name.to_string(),
        })
    }

    /// Link `tag_id` to `lead_id` unless the link already exists.
    ///
    /// Returns whether a new link was written.
    pub async fn link(&self, lead_id: i32, tag_id: i32) -> Result<bool, RepositoryError> {
        if self.repository.find_tag_link(lead_id, tag_id).await? {
            return Ok(false);
        }
        self.repository.insert_tag_link(lead_id, tag_id).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory::MemoryLeadRepository;

    #[test]
    fn test_tag_name_format() {
        assert_eq!(tag_name("Importação CRM", "Feira 2026"), "Importação CRM - Feira 2026");
        assert_eq!(tag_name("Importação CRM", "  "), "Importação CRM");
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let repository = Arc::new(MemoryLeadRepository::new());
        let manager = TagManager::new(repository.clone());

        let first = manager.ensure("Importação CRM - x", "#fff").await.unwrap();
        let second = manager.ensure("Importação CRM - x", "#000").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(repository.tag_count(), 1);
        assert_eq!(
            repository.tag_color("Importação CRM - x").as_deref(),
            Some("#fff")
        );
    }

    #[tokio::test]
    async fn test_link_never_duplicates() {
        let repository = Arc::new(MemoryLeadRepository::new());
        let manager = TagManager::new(repository.clone());
        let tag = manager.ensure("t", DEFAULT_TAG_COLOR).await.unwrap();

        assert!(manager.link(1, tag.id).await.unwrap());
        assert!(!manager.link(1, tag.id).await.unwrap());
        assert_eq!(repository.tag_links_for(1), vec![tag.id]);
    }
}
