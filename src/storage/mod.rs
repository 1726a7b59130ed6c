use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::backup::BackupMetadata;
use crate::error::{Result, SnapError};
use crate::plan::WorkUnit;
use crate::utils::copy_stream::{self, StreamShape};

pub const PRE_DATA_FILE: &str = "pre-data.dmp";
pub const POST_DATA_FILE: &str = "post-data.dmp";
pub const METADATA_FILE: &str = "meta-backup.json";

/// On-disk layout of one backup directory.
#[derive(Debug, Clone)]
pub struct BackupLayout {
    root: PathBuf,
}

impl BackupLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pre_data(&self) -> PathBuf {
        self.root.join(PRE_DATA_FILE)
    }

    pub fn post_data(&self) -> PathBuf {
        self.root.join(POST_DATA_FILE)
    }

    pub fn metadata(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn artifact(&self, unit: &WorkUnit) -> PathBuf {
        self.root.join(unit.artifact_name())
    }

    /// Create the backup directory. An existing directory is accepted only
    /// when empty so a previous backup is never overwritten.
    pub fn create(&self) -> Result<()> {
        if self.root.exists() {
            let mut entries = fs::read_dir(&self.root)?;
            if entries.next().is_some() {
                return Err(SnapError::Precondition(format!(
                    "output directory {} exists and is not empty",
                    self.root.display()
                )));
            }
            return Ok(());
        }
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Check an input directory holds a backup that can be restored.
    pub fn ensure_restorable(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(SnapError::Precondition(format!(
                "backup directory {} does not exist",
                self.root.display()
            )));
        }
        for file in [self.pre_data(), self.post_data()] {
            if !file.is_file() {
                return Err(SnapError::Precondition(format!(
                    "backup is incomplete: {} is missing",
                    file.display()
                )));
            }
        }
        Ok(())
    }

    /// Units whose artifact exists and is non-empty, sorted by schema then
    /// table so every restore derives the same plan.
    pub fn discover_units(&self) -> Result<Vec<WorkUnit>> {
        let mut units = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(unit) = name.to_str().and_then(WorkUnit::from_artifact_name) else {
                continue;
            };
            let meta = entry.metadata()?;
            if !meta.is_file() || meta.len() == 0 {
                tracing::warn!(file = ?name, "skipping unusable artifact");
                continue;
            }
            units.push(unit);
        }
        units.sort();
        Ok(units)
    }

    pub fn count_artifacts(&self) -> Result<usize> {
        Ok(self.discover_units()?.len())
    }

    /// Delete a unit's artifact when its stream carries no rows. Returns
    /// whether it was removed. Missing files and streams that cannot be
    /// parsed are left alone.
    pub fn prune_if_empty(&self, unit: &WorkUnit) -> Result<bool> {
        let path = self.artifact(unit);
        match copy_stream::inspect_gzip(&path) {
            Ok(StreamShape::Empty) => {
                fs::remove_file(&path)?;
                tracing::debug!(table = %unit, "removed empty artifact");
                Ok(true)
            }
            Ok(StreamShape::HasRows) => Ok(false),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => {
                tracing::warn!(table = %unit, error = %err, "artifact is not a binary COPY stream; keeping it");
                Ok(false)
            }
        }
    }

    /// Drop whatever a failed transfer left behind for `unit`.
    pub fn remove_artifact(&self, unit: &WorkUnit) -> Result<bool> {
        match fs::remove_file(self.artifact(unit)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save_metadata(&self, meta: &BackupMetadata) -> Result<()> {
        let content = serde_json::to_string_pretty(meta)?;
        fs::write(self.metadata(), content)?;
        Ok(())
    }

    pub fn load_metadata(&self) -> Result<BackupMetadata> {
        let path = self.metadata();
        let content = fs::read_to_string(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SnapError::Precondition(format!(
                "no backup metadata found at {}",
                path.display()
            )),
            _ => SnapError::Io(e),
        })?;
        serde_json::from_str(&content).map_err(|e| SnapError::InvalidArtifact {
            path,
            reason: e.to_string(),
        })
    }
}

/// Default output directory name for a dump started now.
pub fn default_backup_dir() -> PathBuf {
    let ts = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S");
    PathBuf::from(format!("binary_bkup_{}", ts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::copy_stream::tests::{empty_stream, gzip, one_row_stream};

    #[test]
    fn create_refuses_non_empty_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BackupLayout::new(dir.path().join("b1"));
        layout.create().unwrap();
        layout.create().unwrap();
        fs::write(layout.pre_data(), b"x").unwrap();
        assert!(matches!(layout.create(), Err(SnapError::Precondition(_))));
    }

    #[test]
    fn empty_streams_are_pruned_and_others_kept() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BackupLayout::new(dir.path());
        let empty = WorkUnit::new("public", "empty");
        let full = WorkUnit::new("public", "full");
        fs::write(layout.artifact(&empty), gzip(&empty_stream())).unwrap();
        fs::write(layout.artifact(&full), gzip(&one_row_stream())).unwrap();

        assert!(layout.prune_if_empty(&empty).unwrap());
        assert!(!layout.prune_if_empty(&full).unwrap());
        assert!(!layout.prune_if_empty(&WorkUnit::new("public", "never")).unwrap());

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["data-public.full.bin.gz"]);
    }

    #[test]
    fn garbage_artifacts_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BackupLayout::new(dir.path());
        let unit = WorkUnit::new("s", "t");
        fs::write(layout.artifact(&unit), b"not gzip at all").unwrap();
        assert!(!layout.prune_if_empty(&unit).unwrap());
        assert!(layout.artifact(&unit).exists());
    }

    #[test]
    fn partial_artifacts_can_be_removed() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BackupLayout::new(dir.path());
        let unit = WorkUnit::new("public", "orders");
        fs::write(layout.artifact(&unit), b"half a stream").unwrap();
        assert!(layout.remove_artifact(&unit).unwrap());
        assert!(!layout.remove_artifact(&unit).unwrap());
        assert!(layout.discover_units().unwrap().is_empty());
    }

    #[test]
    fn discovery_skips_foreign_and_zero_byte_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BackupLayout::new(dir.path());
        fs::write(layout.pre_data(), b"pre").unwrap();
        fs::write(layout.artifact(&WorkUnit::new("reporting", "sales")), b"x").unwrap();
        fs::write(layout.artifact(&WorkUnit::new("public", "orders")), b"x").unwrap();
        fs::write(layout.artifact(&WorkUnit::new("public", "blank")), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        assert_eq!(
            layout.discover_units().unwrap(),
            vec![WorkUnit::new("public", "orders"), WorkUnit::new("reporting", "sales")]
        );
    }

    #[test]
    fn metadata_round_trips_and_missing_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BackupLayout::new(dir.path());
        assert!(matches!(layout.load_metadata(), Err(SnapError::Precondition(_))));

        let meta = BackupMetadata::new("shop", "16.2", 7);
        layout.save_metadata(&meta).unwrap();
        assert_eq!(layout.load_metadata().unwrap(), meta);
    }

    #[test]
    fn restorable_needs_both_sections() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BackupLayout::new(dir.path());
        fs::write(layout.pre_data(), b"pre").unwrap();
        assert!(layout.ensure_restorable().is_err());
        fs::write(layout.post_data(), b"post").unwrap();
        assert!(layout.ensure_restorable().is_ok());
    }
}
