// src/services/storage.rs

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use super::{ObjectStore, ObjectStoreConnector};
use crate::error::{ActivityError, TerminalKind};
use crate::runtime::resource_pool::{Health, ResourceManager, ResourcePool};

pub type StoragePool = ResourcePool<StorageClientManager>;

fn not_found(key: &str) -> ActivityError {
    ActivityError::terminal(TerminalKind::NotFound, format!("object '{}' not found", key))
}

struct StoredObject {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

/// Process-local object store with TTL support.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, key: impl Into<String>, bytes: Vec<u8>) {
        self.objects.write().await.insert(
            key.into(),
            StoredObject {
                bytes,
                expires_at: None,
            },
        );
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.get(key).await.is_ok()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, ActivityError> {
        let objects = self.objects.read().await;
        match objects.get(key) {
            Some(object) if object.expires_at.map_or(true, |at| at > Instant::now()) => {
                Ok(object.bytes.clone())
            }
            _ => Err(not_found(key)),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, ttl: Option<Duration>) -> Result<(), ActivityError> {
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                bytes,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn ping(&self) -> Result<(), ActivityError> {
        Ok(())
    }
}

/// Filesystem-backed store rooted at a directory.
///
/// A TTL is kept in a `<key>.ttl` sidecar holding the expiry as a unix
/// timestamp; expired objects read as missing.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalObjectStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ActivityError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(ActivityError::terminal(
                TerminalKind::Rejected,
                format!("invalid object key '{}'", key),
            ));
        }
        Ok(self.root.join(relative))
    }

    fn sidecar(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".ttl");
        PathBuf::from(name)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, ActivityError> {
        let path = self.path_for(key)?;
        if let Ok(expiry) = tokio::fs::read_to_string(Self::sidecar(&path)).await {
            let expired = expiry
                .trim()
                .parse::<i64>()
                .map(|at| at <= chrono::Utc::now().timestamp())
                .unwrap_or(false);
            if expired {
                debug!(key, "Object expired");
                return Err(not_found(key));
            }
        }
        Ok(tokio::fs::read(&path).await?)
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, ttl: Option<Duration>) -> Result<(), ActivityError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        let sidecar = Self::sidecar(&path);
        match ttl {
            Some(ttl) => {
                let expires_at = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
                tokio::fs::write(sidecar, expires_at.to_string()).await?;
            }
            None => {
                // Overwrite drops any previous expiry.
                let _ = tokio::fs::remove_file(sidecar).await;
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), ActivityError> {
        let metadata = tokio::fs::metadata(&self.root).await?;
        if metadata.is_dir() {
            Ok(())
        } else {
            Err(ActivityError::transient(format!(
                "storage root '{}' is not a directory",
                self.root.display()
            )))
        }
    }
}

/// Builds object-store clients for the storage pool and probes them with `ping`.
pub struct StorageClientManager {
    connector: Arc<dyn ObjectStoreConnector>,
}

impl StorageClientManager {
    pub fn new(connector: Arc<dyn ObjectStoreConnector>) -> Self {
        StorageClientManager { connector }
    }
}

#[async_trait]
impl ResourceManager for StorageClientManager {
    type Resource = Arc<dyn ObjectStore>;

    async fn create(&self) -> Result<Self::Resource, ActivityError> {
        self.connector.connect().await
    }

    async fn check_health(&self, resource: &Self::Resource) -> Health {
        match resource.ping().await {
            Ok(()) => Health::Healthy,
            Err(_) => Health::Stale,
        }
    }
}
