// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Token persistence collaborators

use crate::errors::{EnvoyError, EnvoyResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

const TOKEN_KEY: &str = "token";

/// Key/value persistence supplied by the host.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> EnvoyResult<Map<String, Value>>;

    async fn save(&self, data: Map<String, Value>) -> EnvoyResult<()>;
}

pub async fn load_token(store: &dyn TokenStore) -> EnvoyResult<Option<String>> {
    let data = store.load().await?;
    Ok(data
        .get(TOKEN_KEY)
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .map(str::to_string))
}

/// Stores the token, keeping whatever else the host keeps in the mapping.
pub async fn save_token(store: &dyn TokenStore, token: &str) -> EnvoyResult<()> {
    let mut data = store.load().await?;
    data.insert(TOKEN_KEY.to_string(), Value::String(token.to_string()));
    store.save(data).await
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    data: Mutex<Map<String, Value>>,
    saves: AtomicUsize,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert(TOKEN_KEY.to_string(), Value::String(token.into()));
        Self {
            data: Mutex::new(data),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self) -> EnvoyResult<Map<String, Value>> {
        Ok(self.data.lock().clone())
    }

    async fn save(&self, data: Map<String, Value>) -> EnvoyResult<()> {
        *self.data.lock() = data;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// JSON file on disk, written atomically through a sibling temp file.
#[derive(Debug, Clone)]
pub struct JsonFileTokenStore {
    path: PathBuf,
}

impl JsonFileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TokenStore for JsonFileTokenStore {
    async fn load(&self) -> EnvoyResult<Map<String, Value>> {
        if !tokio::fs::try_exists(&self.path).await? {
            debug!("No token store at {}, starting empty", self.path.display());
            return Ok(Map::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&content)? {
            Value::Object(map) => Ok(map),
            _ => Err(EnvoyError::ConfigError(format!(
                "Token store {} does not contain a JSON object",
                self.path.display()
            ))),
        }
    }

    async fn save(&self, data: Map<String, Value>) -> EnvoyResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = self.path.with_extension("tmp");
        let content = serde_json::to_string_pretty(&Value::Object(data))?;

        // Atomic write
        tokio::fs::write(&temp_path, content).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        debug!("Saved token store to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_store_token_roundtrip() {
        let store = MemoryTokenStore::new();
        assert_eq!(load_token(&store).await.unwrap(), None);

        save_token(&store, "abc.def.ghi").await.unwrap();
        assert_eq!(load_token(&store).await.unwrap().as_deref(), Some("abc.def.ghi"));
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_file_store_preserves_other_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("envoy").join("token.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"installer_serial": "121212"}"#).unwrap();

        let store = JsonFileTokenStore::new(&path);
        save_token(&store, "new-token").await.unwrap();

        let data = store.load().await.unwrap();
        assert_eq!(data["installer_serial"], "121212");
        assert_eq!(data["token"], "new-token");
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileTokenStore::new(dir.path().join("absent.json"));
        assert!(store.load().await.unwrap().is_empty());
        assert_eq!(load_token(&store).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_rejects_non_object() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        let store = JsonFileTokenStore::new(&path);
        assert!(matches!(
            store.load().await,
            Err(EnvoyError::ConfigError(_))
        ));
    }
}
