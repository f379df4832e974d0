// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client tokens accepted by the log server.
//!
//! Tokens either live in memory, where they are managed at runtime, or in a JSON file mapping
//! each token to its metadata. A file-backed store is re-read whenever the file's modification
//! time changes, so tokens can be rotated without restarting the server.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use serde_json::{Map, Value};
use tokio::fs;
use tracing::{debug, info};

use crate::errors::TokenStoreError;

type Tokens = HashMap<String, Map<String, Value>>;

#[derive(Debug)]
struct TokenFile {
    path: PathBuf,
    modified: Option<SystemTime>,
}

#[derive(Debug, Default)]
struct Inner {
    tokens: Tokens,
    file: Option<TokenFile>,
}

#[derive(Debug, Default)]
pub struct TokenStore {
    inner: Mutex<Inner>,
}

impl TokenStore {
    /// Creates an empty store managed through [`TokenStore::add_token`].
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Creates a store backed by `path`, which is read right away.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, TokenStoreError> {
        let path = path.into();
        let modified = std::fs::metadata(&path)
            .and_then(|metadata| metadata.modified())
            .map_err(|source| io_error(&path, source))?;
        let content = std::fs::read(&path).map_err(|source| io_error(&path, source))?;
        let tokens = parse_tokens(&path, &content)?;
        info!("Loaded {} tokens", tokens.len());

        Ok(Self {
            inner: Mutex::new(Inner {
                tokens,
                file: Some(TokenFile {
                    path,
                    modified: Some(modified),
                }),
            }),
        })
    }

    pub fn is_file_backed(&self) -> bool {
        self.lock().file.is_some()
    }

    /// Looks up `token` and returns the client's display name, which defaults to the token.
    ///
    /// A file-backed store is re-read first if the file changed since it was last loaded.
    pub async fn authenticate(&self, token: &str) -> Result<Option<String>, TokenStoreError> {
        self.refresh().await?;

        Ok(self.lock().tokens.get(token).map(|metadata| {
            metadata
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(token)
                .to_string()
        }))
    }

    pub fn add_token(
        &self,
        token: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Result<(), TokenStoreError> {
        let mut inner = self.lock();
        if inner.file.is_some() {
            return Err(TokenStoreError::FileBacked);
        }
        inner.tokens.insert(token.into(), metadata);
        Ok(())
    }

    /// Removes `token`. Returns whether it was known.
    pub fn delete_token(&self, token: &str) -> Result<bool, TokenStoreError> {
        let mut inner = self.lock();
        if inner.file.is_some() {
            return Err(TokenStoreError::FileBacked);
        }
        Ok(inner.tokens.remove(token).is_some())
    }

    pub fn len(&self) -> usize {
        self.lock().tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reloads the token file if its modification time changed. The file is read without
    /// holding the lock, which is only taken to compare and swap the tokens.
    async fn refresh(&self) -> Result<(), TokenStoreError> {
        let (path, known) = {
            let inner = self.lock();
            match &inner.file {
                Some(file) => (file.path.clone(), file.modified),
                None => return Ok(()),
            }
        };

        let modified = fs::metadata(&path)
            .await
            .and_then(|metadata| metadata.modified())
            .map_err(|source| io_error(&path, source))?;
        if known == Some(modified) {
            return Ok(());
        }

        debug!("Loading tokens from {}", path.display());
        let content = fs::read(&path)
            .await
            .map_err(|source| io_error(&path, source))?;
        let tokens = parse_tokens(&path, &content)?;

        let mut inner = self.lock();
        if let Some(file) = &mut inner.file {
            file.modified = Some(modified);
        }
        inner.tokens = tokens;
        info!("Loaded {} tokens", inner.tokens.len());
        Ok(())
    }
}

fn parse_tokens(path: &Path, content: &[u8]) -> Result<Tokens, TokenStoreError> {
    let raw: HashMap<String, Value> =
        serde_json::from_slice(content).map_err(|source| TokenStoreError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    // Entries that aren't objects carry no metadata but are still valid tokens
    Ok(raw
        .into_iter()
        .map(|(token, metadata)| match metadata {
            Value::Object(map) => (token, map),
            _ => (token, Map::new()),
        })
        .collect())
}

fn io_error(path: &Path, source: std::io::Error) -> TokenStoreError {
    TokenStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn metadata(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn write_tokens(file: &NamedTempFile, value: Value) {
        std::fs::write(file.path(), serde_json::to_vec(&value).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_in_memory() {
        let store = TokenStore::in_memory();
        assert!(store.is_empty());
        assert_eq!(store.authenticate("abc").await.unwrap(), None);

        store.add_token("abc", metadata(json!({"name": "svc"}))).unwrap();
        store.add_token("def", Map::new()).unwrap();
        assert_eq!(store.authenticate("abc").await.unwrap().as_deref(), Some("svc"));
        assert_eq!(store.authenticate("def").await.unwrap().as_deref(), Some("def"));

        assert!(store.delete_token("abc").unwrap());
        assert!(!store.delete_token("abc").unwrap());
        assert_eq!(store.authenticate("abc").await.unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_file_backed() {
        let file = NamedTempFile::new().unwrap();
        write_tokens(&file, json!({"abc": {"name": "svc"}, "plain": null}));

        let store = TokenStore::from_file(file.path()).unwrap();
        assert!(store.is_file_backed());
        assert_eq!(store.authenticate("abc").await.unwrap().as_deref(), Some("svc"));
        assert_eq!(store.authenticate("plain").await.unwrap().as_deref(), Some("plain"));
        assert_eq!(store.authenticate("other").await.unwrap(), None);

        assert!(matches!(
            store.add_token("new", Map::new()),
            Err(TokenStoreError::FileBacked)
        ));
        assert!(matches!(
            store.delete_token("abc"),
            Err(TokenStoreError::FileBacked)
        ));
    }

    #[tokio::test]
    async fn test_reload_on_change() {
        let file = NamedTempFile::new().unwrap();
        write_tokens(&file, json!({"abc": {}}));
        let store = TokenStore::from_file(file.path()).unwrap();
        assert!(store.authenticate("abc").await.unwrap().is_some());

        write_tokens(&file, json!({"def": {"name": "rotated"}}));
        // Make sure the modification time differs even on coarse filesystems
        let later = SystemTime::now() + Duration::from_secs(10);
        file.as_file().set_modified(later).unwrap();

        assert_eq!(store.authenticate("abc").await.unwrap(), None);
        assert_eq!(store.authenticate("def").await.unwrap().as_deref(), Some("rotated"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_reload() {
        let file = NamedTempFile::new().unwrap();
        write_tokens(&file, json!({"abc": {"name": "old"}}));
        let store = Arc::new(TokenStore::from_file(file.path()).unwrap());

        write_tokens(&file, json!({"abc": {"name": "new"}}));
        let later = SystemTime::now() + Duration::from_secs(10);
        file.as_file().set_modified(later).unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.authenticate("abc").await })
            })
            .collect();
        for task in tasks {
            let name = task.await.unwrap().unwrap();
            assert_eq!(name.as_deref(), Some("new"));
        }
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_removed_file_rejects() {
        let file = NamedTempFile::new().unwrap();
        write_tokens(&file, json!({"abc": {}}));
        let store = TokenStore::from_file(file.path()).unwrap();

        let path = file.path().to_path_buf();
        drop(file);
        assert!(matches!(
            store.authenticate("abc").await,
            Err(TokenStoreError::Io { path: p, .. }) if p == path
        ));
    }

    #[test]
    fn test_file_errors() {
        assert!(matches!(
            TokenStore::from_file("/nonexistent/tokens.json"),
            Err(TokenStoreError::Io { .. })
        ));

        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"[1, 2").unwrap();
        assert!(matches!(
            TokenStore::from_file(file.path()),
            Err(TokenStoreError::Parse { .. })
        ));
    }
}
