//! Resource providers
//!
//! A provider answers `resources/list`, `resources/templates/list` and
//! `resources/read`. [`StaticResources`] keeps everything in memory and can
//! be edited at runtime; pair edits with the server's resource notifications.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::mcp::types::{Resource, ResourceContents, ResourceTemplate};

#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn list(&self) -> Result<Vec<Resource>>;

    async fn templates(&self) -> Result<Vec<ResourceTemplate>> {
        Ok(Vec::new())
    }

    /// Contents for `uri`, or `None` if it does not exist
    async fn read(&self, uri: &str) -> Result<Option<Vec<ResourceContents>>>;
}

#[derive(Debug, Clone)]
struct Entry {
    resource: Resource,
    contents: ResourceContents,
}

/// In-memory resources
#[derive(Debug, Default)]
pub struct StaticResources {
    entries: RwLock<Vec<Entry>>,
    templates: Vec<ResourceTemplate>,
}

impl StaticResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a text resource
    pub fn with_text(
        mut self,
        uri: &str,
        name: &str,
        description: Option<&str>,
        text: impl Into<String>,
    ) -> Self {
        self.entries
            .get_mut()
            .push(text_entry(uri, name, description, "text/plain", text.into()));
        self
    }

    /// Add a JSON resource
    pub fn with_json(mut self, uri: &str, name: &str, description: Option<&str>, value: &Value) -> Self {
        let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
        self.entries
            .get_mut()
            .push(text_entry(uri, name, description, "application/json", text));
        self
    }

    pub fn with_template(mut self, template: ResourceTemplate) -> Self {
        self.templates.push(template);
        self
    }

    /// Insert or replace a text resource; returns true if it already existed
    pub async fn upsert_text(&self, uri: &str, name: &str, text: impl Into<String>) -> bool {
        let entry = text_entry(uri, name, None, "text/plain", text.into());
        let mut entries = self.entries.write().await;
        match entries.iter_mut().find(|e| e.resource.uri == uri) {
            Some(existing) => {
                *existing = entry;
                true
            }
            None => {
                entries.push(entry);
                false
            }
        }
    }

    pub async fn remove(&self, uri: &str) -> bool {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.resource.uri != uri);
        entries.len() != before
    }
}

fn text_entry(uri: &str, name: &str, description: Option<&str>, mime_type: &str, text: String) -> Entry {
    Entry {
        resource: Resource {
            uri: uri.to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            mime_type: Some(mime_type.to_string()),
        },
        contents: ResourceContents {
            uri: uri.to_string(),
            mime_type: Some(mime_type.to_string()),
            text: Some(text),
            blob: None,
        },
    }
}

#[async_trait]
impl ResourceProvider for StaticResources {
    async fn list(&self) -> Result<Vec<Resource>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .map(|e| e.resource.clone())
            .collect())
    }

    async fn templates(&self) -> Result<Vec<ResourceTemplate>> {
        Ok(self.templates.clone())
    }

    async fn read(&self, uri: &str) -> Result<Option<Vec<ResourceContents>>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .find(|e| e.resource.uri == uri)
            .map(|e| vec![e.contents.clone()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resources() {
        let resources = StaticResources::new()
            .with_text("notes://today", "Today", Some("Daily notes"), "buy milk")
            .with_json("config://app", "App config", None, &serde_json::json!({"debug": true}));

        let listed = resources.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].mime_type.as_deref(), Some("application/json"));

        let contents = resources.read("notes://today").await.unwrap().unwrap();
        assert_eq!(contents[0].text.as_deref(), Some("buy milk"));
        assert!(resources.read("notes://missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_runtime_edits() {
        let resources = StaticResources::new();
        assert!(!resources.upsert_text("a://1", "One", "first").await);
        assert!(resources.upsert_text("a://1", "One", "second").await);

        let contents = resources.read("a://1").await.unwrap().unwrap();
        assert_eq!(contents[0].text.as_deref(), Some("second"));

        assert!(resources.remove("a://1").await);
        assert!(resources.list().await.unwrap().is_empty());
    }
}
