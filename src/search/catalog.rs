use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::models::DocumentMeta;
use crate::search::DocumentMetadata;

/// In-memory document metadata store with optional JSON persistence.
pub struct DocumentCatalog {
    documents: RwLock<HashMap<Uuid, DocumentMeta>>,
    persist_path: Option<PathBuf>,
}

impl DocumentCatalog {
    pub fn in_memory() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            persist_path: None,
        }
    }

    pub fn open_or_create(path: &Path) -> Result<Self> {
        let documents: Vec<DocumentMeta> = if path.exists() {
            let data = std::fs::read_to_string(path).context("Failed to read document catalog")?;
            serde_json::from_str(&data).context("Failed to parse document catalog")?
        } else {
            Vec::new()
        };

        Ok(Self {
            documents: RwLock::new(documents.into_iter().map(|d| (d.id, d)).collect()),
            persist_path: Some(path.to_path_buf()),
        })
    }

    pub fn insert(&self, doc: DocumentMeta) -> Result<()> {
        self.documents.write().insert(doc.id, doc);
        self.persist()
    }

    /// Returns the removed document, if it existed.
    pub fn remove(&self, id: &Uuid) -> Result<Option<DocumentMeta>> {
        let removed = self.documents.write().remove(id);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn get(&self, id: &Uuid) -> Option<DocumentMeta> {
        self.documents.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomic write via temp file + rename.
    fn persist(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let docs: Vec<DocumentMeta> = self.documents.read().values().cloned().collect();
        let data = serde_json::to_string_pretty(&docs)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, data).context("Failed to write document catalog")?;
        std::fs::rename(&tmp_path, path).context("Failed to replace document catalog")?;
        Ok(())
    }
}

#[async_trait]
impl DocumentMetadata for DocumentCatalog {
    async fn lookup(&self, ids: &[Uuid]) -> crate::error::Result<Vec<DocumentMeta>> {
        let docs = self.documents.read();
        Ok(ids.iter().filter_map(|id| docs.get(id).cloned()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn doc(name: &str) -> DocumentMeta {
        DocumentMeta {
            id: Uuid::new_v4(),
            owner_id: "alice".to_string(),
            original_name: name.to_string(),
            document_type: Some("pdf".to_string()),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_lookup_skips_unknown_ids() {
        let catalog = DocumentCatalog::in_memory();
        let d = doc("manual.pdf");
        catalog.insert(d.clone()).unwrap();
        let found = catalog.lookup(&[d.id, Uuid::new_v4()]).await.unwrap();
        assert_eq!(found, vec![d]);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("documents.json");
        let d = doc("guide.pdf");
        {
            let catalog = DocumentCatalog::open_or_create(&path).unwrap();
            catalog.insert(d.clone()).unwrap();
            catalog.insert(doc("other.pdf")).unwrap();
            assert!(catalog.remove(&Uuid::new_v4()).unwrap().is_none());
        }
        let reopened = DocumentCatalog::open_or_create(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get(&d.id), Some(d.clone()));
        assert_eq!(reopened.remove(&d.id).unwrap().map(|x| x.id), Some(d.id));
        assert_eq!(DocumentCatalog::open_or_create(&path).unwrap().len(), 1);
    }
}
