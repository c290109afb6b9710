//! Polymorphic pod execution substrate.
//!
//! One uniform operation set over three realizations: a cluster (pods via
//! the Kubernetes API), the local filesystem (containers as child
//! processes under a temp root) and dry-run (no effect). The variant is
//! picked at construction; everything above this module is
//! backend-agnostic.

pub mod cluster;
pub mod dryrun;
pub mod local;
pub mod tarcopy;

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::ContainerSpec;

/// Output every dry-run exec produces.
pub const DRY_RUN_OUTPUT: &[u8] = b"( dry running .... )";

/// Which execution substrate a job runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Cluster,
    Local,
    DryRun,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunMode::Cluster => "cluster",
            RunMode::Local => "local",
            RunMode::DryRun => "dry-run",
        };
        write!(f, "{}", s)
    }
}

/// Job-scoped cancellation token. Cloned into every component that may
/// block; tripping it makes in-flight backend calls surface
/// [`BackendError::Canceled`].
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: tokio::sync::Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the token is canceled; pends forever otherwise.
    pub async fn canceled(&self) {
        loop {
            if self.is_canceled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

/// Errors surfaced by the execution substrate.
///
/// Only [`BackendError::PreInit`] and [`BackendError::PendingTimeout`] are
/// retryable; everything else is terminal for the attempt.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("init container {container} failed with exit code {code}")]
    PreInit { container: String, code: i32 },

    #[error("pod {pod} stayed in pending phase for {timeout:?}")]
    PendingTimeout { pod: String, timeout: Duration },

    #[error("container {container} command exited with code {code}")]
    CommandFailed {
        container: String,
        code: i32,
        output: Vec<u8>,
    },

    #[error("invalid command for container {container}: {reason}")]
    InvalidCommand { container: String, reason: String },

    #[error("copy failed: {0}")]
    Copy(String),

    #[error("operation canceled")]
    Canceled,

    #[error("cluster api error: {0}")]
    Cluster(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Whether a fresh pod attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::PreInit { .. } | BackendError::PendingTimeout { .. }
        )
    }

    /// Whether this is a plain nonzero exit of the container command, i.e.
    /// a test failure rather than an infrastructure error.
    pub fn is_command_failure(&self) -> bool {
        matches!(self, BackendError::CommandFailed { .. })
    }
}

impl From<kube::Error> for BackendError {
    fn from(err: kube::Error) -> Self {
        BackendError::Cluster(err.to_string())
    }
}

/// A staged filesystem source bound to a volume name.
#[derive(Debug, Clone)]
pub struct MountSource {
    pub volume: String,
    pub source: PathBuf,
    /// Pre-built gzip tarball of the source directory. When present,
    /// remote delivery streams the archive instead of re-packing the
    /// directory for every pod.
    pub archive: Option<PathBuf>,
    /// File mode applied to delivered files (e.g. 0o400 for tokens).
    pub file_mode: Option<u32>,
}

/// A fully materialized pod: containers plus resolved mount sources.
#[derive(Debug, Clone)]
pub struct PodRequest {
    pub name: String,
    pub namespace: String,
    pub init_containers: Vec<ContainerSpec>,
    pub containers: Vec<ContainerSpec>,
    pub mounts: Vec<MountSource>,
}

impl PodRequest {
    /// Resolved (source, mount path, mode) triples for one container.
    pub fn mount_points(&self, container: &ContainerSpec) -> Vec<(PathBuf, String, Option<u32>)> {
        let mut points = Vec::new();
        for mount in &container.volume_mounts {
            if let Some(source) = self.mounts.iter().find(|m| m.volume == mount.name) {
                points.push((
                    source.source.clone(),
                    mount.mount_path.clone(),
                    source.file_mode,
                ));
            }
        }
        points
    }
}

/// The execution substrate for one job.
#[derive(Clone)]
pub enum Backend {
    Cluster(cluster::ClusterBackend),
    Local(local::LocalBackend),
    DryRun(dryrun::DryRunBackend),
}

impl Backend {
    pub fn local() -> Self {
        Backend::Local(local::LocalBackend::new())
    }

    pub fn dry_run() -> Self {
        Backend::DryRun(dryrun::DryRunBackend::new())
    }

    pub fn cluster(client: kube::Client, namespace: impl Into<String>) -> Self {
        Backend::Cluster(cluster::ClusterBackend::new(client, namespace))
    }

    pub fn mode(&self) -> RunMode {
        match self {
            Backend::Cluster(_) => RunMode::Cluster,
            Backend::Local(_) => RunMode::Local,
            Backend::DryRun(_) => RunMode::DryRun,
        }
    }

    /// Reserve a pod for the request. No container starts until
    /// [`PodHandle::run_with_handler`].
    pub async fn build_pod(&self, request: PodRequest) -> Result<PodHandle, BackendError> {
        match self {
            Backend::Cluster(b) => Ok(PodHandle::Cluster(b.build_pod(request))),
            Backend::Local(b) => Ok(PodHandle::Local(b.build_pod(request)?)),
            Backend::DryRun(b) => Ok(PodHandle::DryRun(b.build_pod(request))),
        }
    }
}

/// Future returned by a pod execution handler.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>>;

/// A reserved pod-equivalent.
pub enum PodHandle {
    Cluster(cluster::ClusterPod),
    Local(local::LocalPod),
    DryRun(dryrun::DryRunPod),
}

impl PodHandle {
    pub fn name(&self) -> &str {
        match self {
            PodHandle::Cluster(p) => p.name(),
            PodHandle::Local(p) => p.name(),
            PodHandle::DryRun(p) => p.name(),
        }
    }

    /// Start init containers to completion, start main and sidecar
    /// containers, hand one [`Executor`] per non-init container to the
    /// handler, then tear the pod down. Teardown happens on every exit
    /// path, including handler error and cancellation.
    pub async fn run_with_handler<'a, F>(
        &'a mut self,
        cancel: &'a CancelToken,
        handler: F,
    ) -> Result<(), BackendError>
    where
        F: FnOnce(Vec<Executor>) -> HandlerFuture<'a> + Send + 'a,
    {
        match self {
            PodHandle::Cluster(p) => p.run_with_handler(cancel, handler).await,
            PodHandle::Local(p) => p.run_with_handler(cancel, handler).await,
            PodHandle::DryRun(p) => p.run_with_handler(cancel, handler).await,
        }
    }
}

/// Handle to one live container.
#[derive(Clone)]
pub struct Executor {
    container: ContainerSpec,
    pod_name: String,
    imp: ExecutorImpl,
}

#[derive(Clone)]
enum ExecutorImpl {
    Cluster(cluster::ClusterExecutor),
    Local(local::LocalExecutor),
    DryRun,
}

impl Executor {
    pub(crate) fn cluster(
        container: ContainerSpec,
        pod_name: String,
        imp: cluster::ClusterExecutor,
    ) -> Self {
        Self {
            container,
            pod_name,
            imp: ExecutorImpl::Cluster(imp),
        }
    }

    pub(crate) fn local(
        container: ContainerSpec,
        pod_name: String,
        imp: local::LocalExecutor,
    ) -> Self {
        Self {
            container,
            pod_name,
            imp: ExecutorImpl::Local(imp),
        }
    }

    pub(crate) fn dry_run(container: ContainerSpec, pod_name: String) -> Self {
        Self {
            container,
            pod_name,
            imp: ExecutorImpl::DryRun,
        }
    }

    pub fn container(&self) -> &ContainerSpec {
        &self.container
    }

    pub fn pod_name(&self) -> &str {
        &self.pod_name
    }

    /// Synchronously execute the container's configured command and return
    /// its captured output.
    pub async fn output(&self, cancel: &CancelToken) -> Result<Vec<u8>, BackendError> {
        match &self.imp {
            ExecutorImpl::Cluster(e) => e.output(cancel, &self.container).await,
            ExecutorImpl::Local(e) => e.output(cancel, &self.container).await,
            ExecutorImpl::DryRun => Ok(DRY_RUN_OUTPUT.to_vec()),
        }
    }

    /// Start the container's command without waiting for completion.
    /// Used for sidecars.
    pub async fn exec_async(&self) {
        match &self.imp {
            ExecutorImpl::Cluster(e) => e.exec_async(&self.container).await,
            ExecutorImpl::Local(e) => e.exec_async(&self.container).await,
            ExecutorImpl::DryRun => {}
        }
    }

    /// Stop the container to free its capacity.
    pub async fn stop(&self) -> Result<(), BackendError> {
        match &self.imp {
            ExecutorImpl::Cluster(e) => e.stop(&self.container).await,
            ExecutorImpl::Local(e) => e.stop().await,
            ExecutorImpl::DryRun => Ok(()),
        }
    }

    /// Copy `src` (a path inside the container) to `dst` on the
    /// orchestrator's filesystem.
    pub async fn copy_from(
        &self,
        cancel: &CancelToken,
        src: &str,
        dst: &Path,
    ) -> Result<(), BackendError> {
        match &self.imp {
            ExecutorImpl::Cluster(e) => e.copy_from(cancel, &self.container, src, dst).await,
            ExecutorImpl::Local(e) => e.copy_from(src, dst).await,
            ExecutorImpl::DryRun => {
                tracing::debug!(
                    "dry-run: copy from {} on container to {} on local",
                    src,
                    dst.display()
                );
                Ok(())
            }
        }
    }

    /// Copy `src` on the orchestrator's filesystem to `dst` inside the
    /// container.
    pub async fn copy_to(
        &self,
        cancel: &CancelToken,
        src: &Path,
        dst: &str,
    ) -> Result<(), BackendError> {
        match &self.imp {
            ExecutorImpl::Cluster(e) => e.copy_to(cancel, &self.container, src, dst).await,
            ExecutorImpl::Local(e) => e.copy_to(src, dst).await,
            ExecutorImpl::DryRun => {
                tracing::debug!(
                    "dry-run: copy from {} on local to {} on container",
                    src.display(),
                    dst
                );
                Ok(())
            }
        }
    }

    /// Unpack a gzip tarball produced on the orchestrator side into `dst`
    /// inside the container.
    pub async fn unpack_archive(
        &self,
        cancel: &CancelToken,
        archive: &Path,
        dst: &str,
    ) -> Result<(), BackendError> {
        match &self.imp {
            ExecutorImpl::Cluster(e) => {
                e.unpack_archive(cancel, &self.container, archive, dst).await
            }
            ExecutorImpl::Local(e) => e.unpack_archive(archive, dst).await,
            ExecutorImpl::DryRun => {
                tracing::debug!(
                    "dry-run: unpack archive {} into {} on container",
                    archive.display(),
                    dst
                );
                Ok(())
            }
        }
    }

    /// Run an auxiliary command in the container, rebasing absolute paths
    /// where the substrate requires it, and return the captured output.
    pub async fn prepare_command(
        &self,
        cancel: &CancelToken,
        cmd: &[String],
    ) -> Result<Vec<u8>, BackendError> {
        match &self.imp {
            ExecutorImpl::Cluster(e) => e.prepare_command(cancel, &self.container, cmd).await,
            ExecutorImpl::Local(e) => e.prepare_command(cancel, &self.container, cmd).await,
            ExecutorImpl::DryRun => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let pre_init = BackendError::PreInit {
            container: "init".to_string(),
            code: 1,
        };
        let pending = BackendError::PendingTimeout {
            pod: "pod-0".to_string(),
            timeout: Duration::from_secs(600),
        };
        let failed = BackendError::CommandFailed {
            container: "test".to_string(),
            code: 1,
            output: Vec::new(),
        };
        let canceled = BackendError::Canceled;

        assert!(pre_init.is_retryable());
        assert!(pending.is_retryable());
        assert!(!failed.is_retryable());
        assert!(!canceled.is_retryable());
        assert!(failed.is_command_failure());
        assert!(!pre_init.is_command_failure());
    }

    #[tokio::test]
    async fn test_cancel_token_resolves_after_cancel() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());

        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.canceled().await;
        });

        token.cancel();
        handle.await.unwrap();
        assert!(token.is_canceled());
    }

    #[tokio::test]
    async fn test_cancel_token_already_canceled() {
        let token = CancelToken::new();
        token.cancel();
        // Resolves immediately.
        token.canceled().await;
    }

    #[test]
    fn test_mount_points_resolution() {
        use crate::config::{ContainerSpec, VolumeMount};

        let request = PodRequest {
            name: "pod-0".to_string(),
            namespace: "default".to_string(),
            init_containers: Vec::new(),
            containers: Vec::new(),
            mounts: vec![MountSource {
                volume: "repo-volume".to_string(),
                source: PathBuf::from("/tmp/repo"),
                archive: None,
                file_mode: None,
            }],
        };
        let container = ContainerSpec {
            name: "test".to_string(),
            volume_mounts: vec![
                VolumeMount {
                    name: "repo-volume".to_string(),
                    mount_path: "/work".to_string(),
                },
                VolumeMount {
                    name: "unknown".to_string(),
                    mount_path: "/other".to_string(),
                },
            ],
            ..Default::default()
        };

        let points = request.mount_points(&container);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].1, "/work");
    }
}
