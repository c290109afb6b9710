//! Artifact staging and export.
//!
//! Each declared artifact gets an ephemeral staging directory. A subtask
//! that produced the artifact copies it out of its container to
//! `<stage>/<subtaskName>/<basename>`; later lookups return either the
//! whole stage directory (several producing subtasks) or the single
//! staged file. The subtask name is the strategy key when sharding
//! applies, so slots stay unique across pods and retest passes. Stage
//! directories live until job end.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use thiserror::Error;

use crate::config::{ArtifactSpec, ExportArtifact};
use crate::fsutil;
use crate::logging::Logger;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact {0} is undefined")]
    Undefined(String),

    #[error("artifact {0} has no staged content")]
    Empty(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct ArtifactStage {
    dir: TempDir,
    /// Basename of the file inside the producing container.
    file_name: String,
}

/// Name → staging directory map plus the export table.
pub struct ArtifactManager {
    stages: Mutex<HashMap<String, ArtifactStage>>,
    exports: Vec<ExportArtifact>,
}

impl ArtifactManager {
    pub fn new(exports: Vec<ExportArtifact>) -> Self {
        Self {
            stages: Mutex::new(HashMap::new()),
            exports,
        }
    }

    /// Create staging directories for a step's declared artifacts. Called
    /// just before the step runs; already-known names are left alone.
    pub fn add_artifacts(&self, specs: &[ArtifactSpec]) -> Result<(), ArtifactError> {
        let mut stages = self.stages.lock().expect("artifact stages poisoned");
        for spec in specs {
            if stages.contains_key(&spec.name) {
                continue;
            }
            let file_name = Path::new(&spec.container.path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| spec.name.clone());
            stages.insert(
                spec.name.clone(),
                ArtifactStage {
                    dir: TempDir::new()?,
                    file_name,
                },
            );
        }
        Ok(())
    }

    /// Destination directory for one producing subtask's copy of the
    /// artifact; created on demand.
    pub fn stage_dir_for(
        &self,
        name: &str,
        subtask: &str,
    ) -> Result<PathBuf, ArtifactError> {
        let stages = self.stages.lock().expect("artifact stages poisoned");
        let stage = stages
            .get(name)
            .ok_or_else(|| ArtifactError::Undefined(name.to_string()))?;
        let dir = stage.dir.path().join(subtask);
        fsutil::ensure_dir(&dir)?;
        Ok(dir)
    }

    /// Local path for mounting the artifact into a later step: the single
    /// staged file when one subtask produced it, the whole stage
    /// directory when several did.
    pub fn local_path(&self, name: &str, logger: &Logger) -> Result<PathBuf, ArtifactError> {
        let stages = self.stages.lock().expect("artifact stages poisoned");
        let stage = stages
            .get(name)
            .ok_or_else(|| ArtifactError::Undefined(name.to_string()))?;
        let mut producer_dirs: Vec<PathBuf> = std::fs::read_dir(stage.dir.path())?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        producer_dirs.sort();
        match producer_dirs.len() {
            0 => Err(ArtifactError::Empty(name.to_string())),
            1 => Ok(producer_dirs[0].join(&stage.file_name)),
            _ => {
                logger.info(format!(
                    "multiple subtasks produced artifact {}; mounting the stage directory with one subdirectory per producer",
                    name
                ));
                Ok(stage.dir.path().to_path_buf())
            }
        }
    }

    /// Stage directory of an artifact (export source).
    pub fn export_path(&self, name: &str) -> Result<PathBuf, ArtifactError> {
        let stages = self.stages.lock().expect("artifact stages poisoned");
        stages
            .get(name)
            .map(|s| s.dir.path().to_path_buf())
            .ok_or_else(|| ArtifactError::Undefined(name.to_string()))
    }

    /// Copy every export's staged files into its destination, preserving
    /// the per-producer intermediate directories.
    pub fn export_all(&self, logger: &Arc<Logger>) -> Result<(), ArtifactError> {
        for export in &self.exports {
            logger.info(format!("export artifact {}", export.name));
            let src = self.export_path(&export.name)?;
            let dst = Path::new(&export.path);
            fsutil::ensure_dir(dst)?;
            for entry in std::fs::read_dir(&src)? {
                let entry = entry?;
                let target = dst.join(entry.file_name());
                logger.debug(format!(
                    "export artifact: copy from {} to {}",
                    entry.path().display(),
                    target.display()
                ));
                fsutil::copy_path(&entry.path(), &target)?;
            }
        }
        Ok(())
    }

    pub fn exports(&self) -> &[ExportArtifact] {
        &self.exports
    }
}
