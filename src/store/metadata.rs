//! Sidecar metadata for the configuration store
//!
//! One record per config id, persisted as a single JSON map in
//! `.metadata.json` inside the config directory. The file is written
//! atomically (temp file + rename) so a crash never leaves a torn map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Metadata file name inside the config directory
pub const METADATA_FILE: &str = ".metadata.json";

/// On-disk record describing one managed configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataRecord {
    pub config_id: String,
    pub version: u64,
    pub file_path: PathBuf,
    /// Backup files, oldest first; never longer than the configured count
    #[serde(default)]
    pub backup_paths: Vec<PathBuf>,
    pub applied_at: DateTime<Utc>,
    /// SHA-256 of the raw content bytes, lowercase hex
    #[serde(default)]
    pub hash: String,
}

/// Stable digest of config content bytes
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Load the metadata map; a missing file yields an empty map
pub async fn load(config_dir: &Path) -> std::io::Result<HashMap<String, MetadataRecord>> {
    let path = config_dir.join(METADATA_FILE);
    let raw = match tokio::fs::read(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e),
    };
    serde_json::from_slice(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Persist the metadata map atomically
pub async fn persist(
    config_dir: &Path,
    records: &HashMap<String, MetadataRecord>,
) -> std::io::Result<()> {
    let path = config_dir.join(METADATA_FILE);
    let raw = serde_json::to_vec_pretty(records)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &raw).await?;
    tokio::fs::rename(&tmp, &path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, version: u64) -> MetadataRecord {
        MetadataRecord {
            config_id: id.to_string(),
            version,
            file_path: PathBuf::from(format!("/tmp/{id}.conf")),
            backup_paths: Vec::new(),
            applied_at: Utc::now(),
            hash: content_hash(b"content"),
        }
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let map = load(dir.path()).await.unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_persist_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = HashMap::new();
        map.insert("c".to_string(), record("c", 3));

        persist(dir.path(), &map).await.unwrap();
        let loaded = load(dir.path()).await.unwrap();
        assert_eq!(loaded, map);
    }

    #[tokio::test]
    async fn test_persist_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let map = HashMap::from([("c".to_string(), record("c", 1))]);
        persist(dir.path(), &map).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![METADATA_FILE.to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_metadata_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(METADATA_FILE), b"{broken").unwrap();
        assert!(load(dir.path()).await.is_err());
    }

    #[test]
    fn test_content_hash_is_stable_sha256() {
        let hash = content_hash(b"input { stdin {} }");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, content_hash(b"input { stdin {} }"));
        assert_ne!(hash, content_hash(b"other"));
        // Known digest of the empty input
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
