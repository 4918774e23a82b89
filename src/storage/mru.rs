//! Most-recently-used lists persisted one item per line.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const DEFAULT_MAX_ITEMS: usize = 5000;

#[derive(Debug, Clone)]
pub struct Mru {
    path: PathBuf,
    max_items: usize,
}

impl Mru {
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(name),
            max_items: DEFAULT_MAX_ITEMS,
        }
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Items, most recent first. A missing file is an empty list.
    pub async fn load(&self) -> Result<Vec<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    /// Move `item` to the front, dropping the oldest beyond the cap.
    pub async fn add(&self, item: &str) -> Result<()> {
        let mut items = self.load().await?;
        items.retain(|existing| existing != item);
        items.insert(0, item.to_string());
        items.truncate(self.max_items);
        self.save(&items).await
    }

    pub async fn remove(&self, item: &str) -> Result<()> {
        let mut items = self.load().await?;
        let before = items.len();
        items.retain(|existing| existing != item);
        if items.len() != before {
            self.save(&items).await?;
        }
        Ok(())
    }

    /// Delete the backing file.
    pub async fn clean(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn save(&self, items: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut content = items.join("\n");
        content.push('\n');
        tokio::fs::write(&self.path, content)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_moves_to_front_and_caps() {
        let dir = tempfile::tempdir().unwrap();
        let mru = Mru::new(&dir.path().join("data"), "files").with_max_items(3);

        for item in ["a", "b", "c", "a", "d"] {
            mru.add(item).await.unwrap();
        }

        assert_eq!(mru.load().await.unwrap(), vec!["d", "a", "c"]);
        mru.remove("a").await.unwrap();
        assert_eq!(mru.load().await.unwrap(), vec!["d", "c"]);

        mru.clean().await.unwrap();
        mru.clean().await.unwrap();
        assert!(mru.load().await.unwrap().is_empty());
    }
}
