//! Resource resolution: repositories, tokens, artifacts and the
//! orchestrator-provided log/report files, materialized into concrete
//! mount sources for the execution backend.

pub mod artifact;
pub mod repo;
pub mod token;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::backend::{CancelToken, MountSource, PodRequest};
use crate::config::{ContainerSpec, TemplateSpec, TestJobSpec, VolumeSourceKind};
use crate::fsutil;
use crate::logging::Logger;

pub use artifact::{ArtifactError, ArtifactManager};
pub use repo::{RepoError, RepositoryManager};
pub use token::{
    InstallationTokenFetcher, NullInstallationTokenFetcher, ResolvedToken, SecretReader,
    TokenError, TokenManager,
};

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("log volume requested before any log was captured")]
    LogUnavailable,

    #[error("report volume requested before the report was built")]
    ReportUnavailable,

    #[error("volume {0} has no usable source")]
    UnresolvableVolume(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Per-job resource state shared by every task.
pub struct ResourceManager {
    namespace: String,
    repos: RepositoryManager,
    tokens: TokenManager,
    artifacts: ArtifactManager,
    logger: Arc<Logger>,
    /// Token name → staged directory holding the token file.
    token_stages: Mutex<HashMap<String, (TempDir, PathBuf)>>,
    /// Injected at post-step time.
    log_file: Mutex<Option<(TempDir, PathBuf)>>,
    report_file: Mutex<Option<(TempDir, PathBuf)>>,
}

impl ResourceManager {
    pub fn new(
        spec: &TestJobSpec,
        namespace: impl Into<String>,
        secret_reader: SecretReader,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            repos: RepositoryManager::new(&spec.repos, logger.clone()),
            tokens: TokenManager::new(&spec.tokens, secret_reader, logger.clone()),
            artifacts: ArtifactManager::new(spec.export_artifacts.clone()),
            logger,
            token_stages: Mutex::new(HashMap::new()),
            log_file: Mutex::new(None),
            report_file: Mutex::new(None),
        }
    }

    /// Clone and archive every repository. Must run before the first
    /// materialization that references a repo volume.
    pub async fn clone_repositories(&mut self, cancel: &CancelToken) -> Result<(), ResourceError> {
        self.repos.clone_all(cancel, &self.tokens).await?;
        Ok(())
    }

    pub fn artifacts(&self) -> &ArtifactManager {
        &self.artifacts
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn repos(&self) -> &RepositoryManager {
        &self.repos
    }

    /// Make the captured orchestrator log available to `log` volumes.
    pub async fn set_captured_log(&self, content: &str) -> Result<(), ResourceError> {
        let dir = TempDir::new()?;
        let path = dir.path().join("shardtest.log");
        std::fs::write(&path, content)?;
        *self.log_file.lock().await = Some((dir, path));
        Ok(())
    }

    /// Make the serialized report available to `report` volumes.
    pub async fn set_report(&self, json: &str) -> Result<(), ResourceError> {
        let dir = TempDir::new()?;
        let path = dir.path().join("report.json");
        std::fs::write(&path, json)?;
        *self.report_file.lock().await = Some((dir, path));
        Ok(())
    }

    /// Stage a token as a directory holding one file named by the token's
    /// key, mode 0400.
    async fn token_mount(&self, token_name: &str) -> Result<PathBuf, ResourceError> {
        let mut stages = self.token_stages.lock().await;
        if let Some((_, path)) = stages.get(token_name) {
            return Ok(path.clone());
        }
        let token = self.tokens.resolve(token_name).await?;
        let dir = TempDir::new()?;
        let file = dir.path().join(&token.key);
        std::fs::write(&file, token.value.as_bytes())?;
        fsutil::set_mode(&file, 0o400)?;
        let staged = dir.path().to_path_buf();
        stages.insert(token_name.to_string(), (dir, staged.clone()));
        Ok(staged)
    }

    /// Produce a pod request without resolving any volume source. Used by
    /// dry runs, which validate wiring but must not clone, resolve or
    /// stage anything.
    pub fn materialize_unmounted(
        &self,
        pod_name: String,
        template: &TemplateSpec,
        containers: Vec<ContainerSpec>,
    ) -> PodRequest {
        PodRequest {
            name: pod_name,
            namespace: self.namespace.clone(),
            init_containers: template.spec.init_containers.clone(),
            containers,
            mounts: Vec::new(),
        }
    }

    /// Rewrite a template's volume sources into concrete mount sources
    /// and produce the pod request for the backend.
    ///
    /// `containers` is the (possibly strategy-expanded) main container
    /// list; init containers come from the template verbatim.
    pub async fn materialize(
        &self,
        pod_name: String,
        template: &TemplateSpec,
        containers: Vec<ContainerSpec>,
    ) -> Result<PodRequest, ResourceError> {
        let mut mounts = Vec::new();
        for volume in &template.spec.volumes {
            let (source, archive) = match volume.source.kind() {
                VolumeSourceKind::Repo => {
                    let name = &volume.source.repo.as_ref().expect("checked kind").name;
                    (
                        Some(self.repos.local_dir(name)?.to_path_buf()),
                        Some(self.repos.archive_path(name)?.to_path_buf()),
                    )
                }
                VolumeSourceKind::Token => {
                    let name = &volume.source.token.as_ref().expect("checked kind").name;
                    (Some(self.token_mount(name).await?), None)
                }
                VolumeSourceKind::Artifact => {
                    let name = &volume.source.artifact.as_ref().expect("checked kind").name;
                    (Some(self.artifacts.local_path(name, &self.logger)?), None)
                }
                VolumeSourceKind::Log => (
                    Some(
                        self.log_file
                            .lock()
                            .await
                            .as_ref()
                            .map(|(_, path)| path.clone())
                            .ok_or(ResourceError::LogUnavailable)?,
                    ),
                    None,
                ),
                VolumeSourceKind::Report => (
                    Some(
                        self.report_file
                            .lock()
                            .await
                            .as_ref()
                            .map(|(_, path)| path.clone())
                            .ok_or(ResourceError::ReportUnavailable)?,
                    ),
                    None,
                ),
                VolumeSourceKind::EmptyDir => (None, None),
                VolumeSourceKind::None => {
                    return Err(ResourceError::UnresolvableVolume(volume.name.clone()))
                }
            };
            if let Some(source) = source {
                mounts.push(MountSource {
                    volume: volume.name.clone(),
                    source,
                    archive,
                    file_mode: None,
                });
            }
        }

        Ok(PodRequest {
            name: pod_name,
            namespace: self.namespace.clone(),
            init_containers: template.spec.init_containers.clone(),
            containers,
            mounts,
        })
    }
}
