//! Disk failover for service discovery
//!
//! Every published snapshot is mirrored to a JSON file so discovery keeps
//! answering from the last known state when the registry is unreachable
//! and memory holds nothing, e.g. right after a restart.

use std::path::{Path, PathBuf};

use sregistry_api::DEFAULT_NAMESPACE;
use sregistry_api::naming::ServiceInfo;
use tracing::debug;

use crate::error::{ClientError, Result};

/// Failover reactor for service discovery
#[derive(Debug)]
pub struct FailoverReactor {
    base_path: PathBuf,
}

impl FailoverReactor {
    /// Files live under `cache_dir/<namespace>`; the default namespace
    /// maps to `public`
    pub fn new(cache_dir: &Path, namespace: &str) -> Self {
        let namespace = if namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            namespace
        };
        Self {
            base_path: cache_dir.join(namespace),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    /// Save service info to failover file
    pub fn save_failover(&self, key: &str, service_info: &ServiceInfo) -> Result<()> {
        std::fs::create_dir_all(&self.base_path).map_err(|e| ClientError::Other(e.into()))?;

        let json = serde_json::to_string_pretty(service_info)
            .map_err(|e| ClientError::Other(e.into()))?;

        // Write then rename so a reader never sees a half-written file
        let file_path = self.file_path(key);
        let tmp_path = self.file_path(&format!("{}.tmp", key));
        std::fs::write(&tmp_path, json).map_err(|e| ClientError::Other(e.into()))?;
        std::fs::rename(&tmp_path, &file_path).map_err(|e| ClientError::Other(e.into()))?;

        debug!("Saved failover for service: {}", key);

        Ok(())
    }

    /// Load service info from failover file
    pub fn load_failover(&self, key: &str) -> Result<Option<ServiceInfo>> {
        let file_path = self.file_path(key);

        if !file_path.exists() {
            return Ok(None);
        }

        let content =
            std::fs::read_to_string(&file_path).map_err(|e| ClientError::Other(e.into()))?;

        let service_info: ServiceInfo =
            serde_json::from_str(&content).map_err(|e| ClientError::Other(e.into()))?;

        Ok(Some(service_info))
    }

    /// Clean all failover files
    pub fn clean_all_failover(&self) -> Result<()> {
        if self.base_path.exists() {
            std::fs::remove_dir_all(&self.base_path).map_err(|e| ClientError::Other(e.into()))?;
        }
        Ok(())
    }
}
