//! On-disk layout and file operations
//!
//! One root directory with four fixed subdirectories:
//!
//! ```text
//! <root>/data/<wallSec>_<uid>_<id>   buffered report snapshots
//! <root>/active/active_metrics       ActiveConfigList record
//! <root>/metadata/metadata           MetadataList record
//! <root>/trains/<trainName>          InstallTrainInfo records
//! <root>/configs/<uid>_<id>          config backups for ttl resets
//! ```
//!
//! Snapshot files are append targets awaiting upload; reads concatenate and
//! (usually) delete. Record files are replaced whole.

use std::fs;
use std::path::{Path, PathBuf};

use tally_config::{ConfigKey, TallyConfig};

use crate::codec;
use crate::error::{Result, StorageError};
use crate::records::{ActiveConfigList, InstallTrainInfo, MetadataList};

const DATA_DIR: &str = "data";
const ACTIVE_DIR: &str = "active";
const METADATA_DIR: &str = "metadata";
const TRAIN_DIR: &str = "trains";
const CONFIG_DIR: &str = "configs";

const ACTIVE_FILE: &str = "active_metrics";
const METADATA_FILE: &str = "metadata";

/// Filesystem adapter for everything the engine persists
#[derive(Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Open (and create) the storage layout under `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [DATA_DIR, ACTIVE_DIR, METADATA_DIR, TRAIN_DIR, CONFIG_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|e| StorageError::io(&path, e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ------------------------------------------------------------------
    // Report snapshots
    // ------------------------------------------------------------------

    fn snapshot_name(wall_sec: i64, key: &ConfigKey) -> String {
        format!("{}_{}_{}", wall_sec, key.uid(), key.id())
    }

    /// Parse `<wallSec>_<uid>_<id>` back into its parts
    fn parse_snapshot_name(name: &str) -> Option<(i64, i32, i64)> {
        let mut parts = name.splitn(3, '_');
        let wall_sec = parts.next()?.parse().ok()?;
        let uid = parts.next()?.parse().ok()?;
        let id = parts.next()?.parse().ok()?;
        Some((wall_sec, uid, id))
    }

    /// Persist one encoded report snapshot awaiting upload
    pub fn write_report_snapshot(
        &self,
        wall_sec: i64,
        key: &ConfigKey,
        payload: &[u8],
    ) -> Result<()> {
        let path = self.root.join(DATA_DIR).join(Self::snapshot_name(wall_sec, key));
        fs::write(&path, codec::frame_bytes(payload)).map_err(|e| StorageError::io(&path, e))?;
        tracing::debug!(config = %key, path = %path.display(), "wrote report snapshot");
        Ok(())
    }

    /// Whether any snapshot for `key` is on disk
    pub fn has_reports_for(&self, key: &ConfigKey) -> bool {
        self.snapshot_paths_for(key).map_or(false, |p| !p.is_empty())
    }

    fn snapshot_paths_for(&self, key: &ConfigKey) -> Result<Vec<(i64, PathBuf)>> {
        let dir = self.root.join(DATA_DIR);
        let entries = fs::read_dir(&dir).map_err(|e| StorageError::io(&dir, e))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((wall_sec, uid, id)) = Self::parse_snapshot_name(name) else {
                continue;
            };
            if uid == key.uid() && id == key.id() {
                paths.push((wall_sec, entry.path()));
            }
        }
        // Oldest first, so reports concatenate in history order.
        paths.sort();
        Ok(paths)
    }

    /// Read every buffered snapshot payload for `key`, oldest first,
    /// deleting the files when `erase` is set. Unreadable files are
    /// deleted and skipped.
    pub fn read_reports_for(&self, key: &ConfigKey, erase: bool) -> Result<Vec<Vec<u8>>> {
        let mut payloads = Vec::new();
        for (_, path) in self.snapshot_paths_for(key)? {
            match fs::read(&path) {
                Ok(bytes) => match codec::decode_frame::<serde_json::Value>(&bytes) {
                    Ok(_) => {
                        // Frame is intact; hand back the raw payload.
                        payloads.push(bytes[4..].to_vec());
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e,
                            "dropping corrupt report snapshot");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e,
                        "failed to read report snapshot");
                    continue;
                }
            }
            if erase {
                let _ = fs::remove_file(&path);
            }
        }
        Ok(payloads)
    }

    /// Delete snapshots older than `min_wall_sec`, returning how many
    pub fn sweep_stale_reports(&self, min_wall_sec: i64) -> Result<usize> {
        let dir = self.root.join(DATA_DIR);
        let entries = fs::read_dir(&dir).map_err(|e| StorageError::io(&dir, e))?;
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((wall_sec, _, _)) = Self::parse_snapshot_name(name)
                && wall_sec < min_wall_sec
                && fs::remove_file(entry.path()).is_ok()
            {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "swept stale report snapshots");
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Train install records
    // ------------------------------------------------------------------

    fn train_path(&self, train_name: &str) -> PathBuf {
        // Train names come from installer events; keep the name readable
        // but filesystem-safe.
        let safe: String = train_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.root.join(TRAIN_DIR).join(safe)
    }

    /// Read the persisted record for `train_name`, if any
    pub fn read_train_info(&self, train_name: &str) -> Option<InstallTrainInfo> {
        let path = self.train_path(train_name);
        let bytes = fs::read(&path).ok()?;
        match codec::decode_frame::<InstallTrainInfo>(&bytes) {
            Ok((info, _)) => Some(info),
            Err(e) => {
                tracing::warn!(train = train_name, error = %e, "corrupt train record");
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    /// Persist `info` under its train name
    pub fn write_train_info(&self, info: &InstallTrainInfo) -> Result<()> {
        let path = self.train_path(&info.train_name);
        let frame = codec::encode_frame(info)?;
        fs::write(&path, frame).map_err(|e| StorageError::io(&path, e))
    }

    // ------------------------------------------------------------------
    // Active configs and metadata records
    // ------------------------------------------------------------------

    /// Replace the active-config record
    pub fn save_active_configs(&self, list: &ActiveConfigList) -> Result<()> {
        let path = self.root.join(ACTIVE_DIR).join(ACTIVE_FILE);
        let frame = codec::encode_frame(list)?;
        fs::write(&path, frame).map_err(|e| StorageError::io(&path, e))
    }

    /// Read and delete the active-config record
    pub fn load_active_configs(&self) -> Option<ActiveConfigList> {
        self.load_and_remove(self.root.join(ACTIVE_DIR).join(ACTIVE_FILE))
    }

    /// Replace the metadata record; an empty list removes it instead
    pub fn save_metadata(&self, list: &MetadataList) -> Result<()> {
        let path = self.root.join(METADATA_DIR).join(METADATA_FILE);
        if list.entries.is_empty() {
            let _ = fs::remove_file(&path);
            return Ok(());
        }
        let frame = codec::encode_frame(list)?;
        fs::write(&path, frame).map_err(|e| StorageError::io(&path, e))
    }

    /// Read and delete the metadata record
    pub fn load_metadata(&self) -> Option<MetadataList> {
        self.load_and_remove(self.root.join(METADATA_DIR).join(METADATA_FILE))
    }

    fn load_and_remove<T: serde::de::DeserializeOwned>(&self, path: PathBuf) -> Option<T> {
        let bytes = fs::read(&path).ok()?;
        let _ = fs::remove_file(&path);
        match codec::decode_frame(&bytes) {
            Ok((value, _)) => Some(value),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "corrupt record dropped");
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Config backups
    // ------------------------------------------------------------------

    fn config_path(&self, key: &ConfigKey) -> PathBuf {
        self.root
            .join(CONFIG_DIR)
            .join(format!("{}_{}", key.uid(), key.id()))
    }

    /// Persist a validated config so ttl expiry can rebuild it
    pub fn save_config(&self, key: &ConfigKey, config: &TallyConfig) -> Result<()> {
        let path = self.config_path(key);
        let frame = codec::encode_frame(config)?;
        fs::write(&path, frame).map_err(|e| StorageError::io(&path, e))
    }

    /// Read a config backup
    pub fn read_config(&self, key: &ConfigKey) -> Option<TallyConfig> {
        let bytes = fs::read(self.config_path(key)).ok()?;
        codec::decode_frame(&bytes).ok().map(|(config, _)| config)
    }

    /// Remove a config backup
    pub fn remove_config(&self, key: &ConfigKey) {
        let _ = fs::remove_file(self.config_path(key));
    }
}
