//! Atomic file store for the golden path

use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::document::{GoldenPath, PatternSummary};
use super::migration;
use crate::error::EngineError;

pub struct GoldenPathStore {
    path: PathBuf,
}

impl GoldenPathStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Load and upgrade the stored baseline
    pub fn load(&self) -> Result<GoldenPath, EngineError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::GoldenPathMissing(self.path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut doc: serde_json::Value = serde_json::from_str(&raw)?;
        let upgraded = migration::upgrade(&mut doc)?;
        let mut golden: GoldenPath = serde_json::from_value(doc)
            .map_err(|e| EngineError::InvalidGoldenPath(e.to_string()))?;

        if upgraded {
            golden.summary = PatternSummary::of(&golden.patterns);
        }

        info!(
            path = %self.path.display(),
            patterns = golden.patterns.len(),
            generated_at = %golden.generated_at,
            "Golden path loaded"
        );
        Ok(golden)
    }

    /// Previous baseline, if one has been saved
    pub fn load_existing(&self) -> Result<Option<GoldenPath>, EngineError> {
        match self.load() {
            Ok(golden) => Ok(Some(golden)),
            Err(EngineError::GoldenPathMissing(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Replace the stored baseline atomically.
    ///
    /// The previous file is copied to a timestamped backup first; the new
    /// content goes to a temporary file in the same directory and is renamed
    /// over the target, so readers only ever see a complete document. The
    /// directory is synced after the rename so the new entry survives a crash.
    pub fn save(&self, golden: &GoldenPath) -> Result<Option<PathBuf>, EngineError> {
        let parent = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let backup = if self.exists() {
            let backup = self.backup_path();
            fs::copy(&self.path, &backup)?;
            info!(backup = %backup.display(), "Previous golden path backed up");
            Some(backup)
        } else {
            None
        };

        let bytes = serde_json::to_vec_pretty(golden)?;
        let tmp = parent.join(format!(
            ".{}.{}.tmp",
            self.file_name(),
            uuid::Uuid::new_v4().simple()
        ));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            warn!(tmp = %tmp.display(), error = %e, "Golden path rename failed");
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        if let Err(e) = sync_dir(&parent) {
            warn!(dir = %parent.display(), error = %e, "Golden path directory sync failed");
        }

        info!(
            path = %self.path.display(),
            patterns = golden.patterns.len(),
            "Golden path saved"
        );
        Ok(backup)
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("golden_path.json")
            .to_string()
    }

    /// `<stem>_<YYYYmmdd_HHMMSS_mmm>.<ext>` next to the baseline
    fn backup_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("golden_path");
        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let name = match self.path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}_{}.{}", stem, stamp, ext),
            None => format!("{}_{}", stem, stamp),
        };
        self.path.with_file_name(name)
    }
}

/// Flush directory entries (the rename) to disk
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}
