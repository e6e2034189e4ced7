//! On-disk owner of pipeline configuration files
//!
//! Layout inside the config directory:
//!
//! ```text
//! <config_dir>/
//!   <config_id>.conf                       (0644)
//!   .backup/
//!     <config_id>.conf.backup.<version>
//!   .metadata.json
//! ```
//!
//! Mutating operations (save, delete, backup, restore) are serialised by a
//! single write lock; reads hold a read lock on the cache and fall back to
//! disk on miss. All live-file writes are atomic (temp file + rename).

use crate::protocol::model::PipelineConfig;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub mod metadata;

pub use metadata::{content_hash, MetadataRecord};

/// Configuration store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O failure {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Config {config_id} not found")]
    NotFound { config_id: String },

    #[error("No backups available for config {config_id}")]
    NoBackups { config_id: String },
}

impl StoreError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Default)]
struct Inner {
    cache: HashMap<String, PipelineConfig>,
    metadata: HashMap<String, MetadataRecord>,
}

/// On-disk configuration store with versioned backups
pub struct ConfigStore {
    config_dir: PathBuf,
    backup_count: usize,
    inner: RwLock<Inner>,
}

impl ConfigStore {
    /// Open the store, creating the directory tree and pruning metadata
    /// records whose live file has disappeared
    pub async fn open(config_dir: impl Into<PathBuf>, backup_count: usize) -> Result<Self, StoreError> {
        let config_dir = config_dir.into();
        tokio::fs::create_dir_all(&config_dir)
            .await
            .map_err(|e| StoreError::io(format!("creating {}", config_dir.display()), e))?;
        tokio::fs::create_dir_all(config_dir.join(".backup"))
            .await
            .map_err(|e| StoreError::io("creating backup directory", e))?;

        let mut records = metadata::load(&config_dir)
            .await
            .map_err(|e| StoreError::io("loading metadata", e))?;

        let before = records.len();
        records.retain(|config_id, record| {
            let exists = record.file_path.exists();
            if !exists {
                warn!(config_id = %config_id, "pruning metadata record with missing file");
            }
            exists
        });
        if records.len() != before {
            if let Err(e) = metadata::persist(&config_dir, &records).await {
                warn!(error = %e, "failed to persist pruned metadata");
            }
        }

        Ok(Self {
            config_dir,
            backup_count,
            inner: RwLock::new(Inner {
                cache: HashMap::new(),
                metadata: records,
            }),
        })
    }

    /// Directory this store owns
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Live file path for a config id
    pub fn file_path(&self, config_id: &str) -> PathBuf {
        self.config_dir.join(format!("{config_id}.conf"))
    }

    /// Backup file path for (config id, version)
    pub fn backup_path(&self, config_id: &str, version: u64) -> PathBuf {
        self.config_dir
            .join(".backup")
            .join(format!("{config_id}.conf.backup.{version}"))
    }

    /// Metadata record for a config id, if any
    pub async fn metadata_record(&self, config_id: &str) -> Option<MetadataRecord> {
        self.inner.read().await.metadata.get(config_id).cloned()
    }

    /// Save a configuration: back up any live file, write the new content
    /// atomically, update the cache and metadata
    pub async fn save(&self, config: &PipelineConfig) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let path = self.file_path(&config.id);

        if path.exists() {
            self.backup_locked(&mut inner, &config.id).await?;
        }

        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .map_err(|e| StoreError::io(format!("creating {}", self.config_dir.display()), e))?;
        atomic_write(&path, config.content.as_bytes())
            .await
            .map_err(|e| StoreError::io(format!("writing {}", path.display()), e))?;

        inner.cache.insert(config.id.clone(), config.clone());

        let hash = content_hash(config.content.as_bytes());
        let record = inner
            .metadata
            .entry(config.id.clone())
            .or_insert_with(|| MetadataRecord {
                config_id: config.id.clone(),
                version: config.version,
                file_path: path.clone(),
                backup_paths: Vec::new(),
                applied_at: Utc::now(),
                hash: String::new(),
            });
        record.version = config.version;
        record.file_path = path;
        record.applied_at = Utc::now();
        record.hash = hash;

        // Metadata persistence failure does not fail the save
        if let Err(e) = metadata::persist(&self.config_dir, &inner.metadata).await {
            warn!(config_id = %config.id, error = %e, "failed to persist metadata after save");
        }

        debug!(config_id = %config.id, version = config.version, "config saved");
        Ok(())
    }

    /// Load a configuration; cache hit first, disk on miss
    pub async fn load(&self, config_id: &str) -> Result<PipelineConfig, StoreError> {
        let inner = self.inner.read().await;
        if let Some(config) = inner.cache.get(config_id) {
            return Ok(config.clone());
        }

        let path = self.file_path(config_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    config_id: config_id.to_string(),
                })
            }
            Err(e) => return Err(StoreError::io(format!("reading {}", path.display()), e)),
        };
        let version = inner
            .metadata
            .get(config_id)
            .map(|r| r.version)
            .unwrap_or(0);

        Ok(PipelineConfig {
            id: config_id.to_string(),
            version,
            content,
            name: None,
        })
    }

    /// Copy the current live bytes to the next backup slot and rotate
    ///
    /// A missing live file is a successful no-op.
    pub async fn backup(&self, config_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        self.backup_locked(&mut inner, config_id).await?;
        if let Err(e) = metadata::persist(&self.config_dir, &inner.metadata).await {
            warn!(config_id, error = %e, "failed to persist metadata after backup");
        }
        Ok(())
    }

    async fn backup_locked(&self, inner: &mut Inner, config_id: &str) -> Result<(), StoreError> {
        let path = self.file_path(config_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::io(format!("reading {}", path.display()), e)),
        };

        let version = inner
            .metadata
            .get(config_id)
            .map(|r| r.version)
            .unwrap_or(1);
        let backup_path = self.backup_path(config_id, version);

        tokio::fs::create_dir_all(self.config_dir.join(".backup"))
            .await
            .map_err(|e| StoreError::io("creating backup directory", e))?;
        tokio::fs::write(&backup_path, &bytes)
            .await
            .map_err(|e| StoreError::io(format!("writing {}", backup_path.display()), e))?;

        let backup_count = self.backup_count;
        let record = inner
            .metadata
            .entry(config_id.to_string())
            .or_insert_with(|| MetadataRecord {
                config_id: config_id.to_string(),
                version,
                file_path: path,
                backup_paths: Vec::new(),
                applied_at: Utc::now(),
                hash: content_hash(&bytes),
            });

        // Re-backing-up the same version overwrites its slot in place
        if record.backup_paths.last() != Some(&backup_path) {
            record.backup_paths.push(backup_path);
        }
        while record.backup_paths.len() > backup_count {
            let oldest = record.backup_paths.remove(0);
            if let Err(e) = tokio::fs::remove_file(&oldest).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %oldest.display(), error = %e, "failed to delete rotated backup");
                }
            }
        }

        debug!(config_id, version, "config backed up");
        Ok(())
    }

    /// Replace the live file with the most recent backup
    pub async fn restore(&self, config_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;

        let (backup_path, restored_version) = {
            let record = inner
                .metadata
                .get(config_id)
                .ok_or_else(|| StoreError::NoBackups {
                    config_id: config_id.to_string(),
                })?;
            let last = record
                .backup_paths
                .last()
                .ok_or_else(|| StoreError::NoBackups {
                    config_id: config_id.to_string(),
                })?;
            let version = backup_version(last).unwrap_or(record.version);
            (last.clone(), version)
        };

        let bytes = tokio::fs::read(&backup_path)
            .await
            .map_err(|e| StoreError::io(format!("reading {}", backup_path.display()), e))?;
        let path = self.file_path(config_id);
        atomic_write(&path, &bytes)
            .await
            .map_err(|e| StoreError::io(format!("writing {}", path.display()), e))?;

        let content = String::from_utf8_lossy(&bytes).into_owned();
        inner.cache.insert(
            config_id.to_string(),
            PipelineConfig {
                id: config_id.to_string(),
                version: restored_version,
                content,
                name: None,
            },
        );
        if let Some(record) = inner.metadata.get_mut(config_id) {
            record.version = restored_version;
            record.hash = content_hash(&bytes);
        }
        if let Err(e) = metadata::persist(&self.config_dir, &inner.metadata).await {
            warn!(config_id, error = %e, "failed to persist metadata after restore");
        }

        debug!(config_id, version = restored_version, "config restored from backup");
        Ok(())
    }

    /// Delete a configuration: best-effort backup, then remove the live
    /// file, cache entry, and metadata record
    pub async fn delete(&self, config_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;

        if let Err(e) = self.backup_locked(&mut inner, config_id).await {
            warn!(config_id, error = %e, "backup before delete failed");
        }

        let path = self.file_path(config_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(format!("removing {}", path.display()), e)),
        }

        inner.cache.remove(config_id);
        inner.metadata.remove(config_id);
        if let Err(e) = metadata::persist(&self.config_dir, &inner.metadata).await {
            warn!(config_id, error = %e, "failed to persist metadata after delete");
        }

        debug!(config_id, "config deleted");
        Ok(())
    }

    /// All configurations present on disk
    ///
    /// Scans for `*.conf` files; directories, hidden files, and other
    /// extensions are skipped.
    pub async fn list(&self) -> Result<Vec<PipelineConfig>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.config_dir)
            .await
            .map_err(|e| StoreError::io(format!("scanning {}", self.config_dir.display()), e))?;

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io("scanning config directory", e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StoreError::io("reading entry type", e))?;
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            let Some(id) = name.strip_suffix(".conf") else {
                continue;
            };
            ids.push(id.to_string());
        }

        ids.sort();
        let mut configs = Vec::with_capacity(ids.len());
        for id in ids {
            configs.push(self.load(&id).await?);
        }
        Ok(configs)
    }
}

/// Parse the trailing version number of a backup path
fn backup_version(path: &Path) -> Option<u64> {
    path.extension()?.to_str()?.parse().ok()
}

/// Write bytes to `path` atomically with mode 0644
async fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    let tmp = path.with_file_name(format!("{file_name}.tmp"));

    tokio::fs::write(&tmp, bytes).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644)).await?;
    }
    tokio::fs::rename(&tmp, path).await
}
