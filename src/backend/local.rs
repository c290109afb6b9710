//! Local-filesystem realization of the execution substrate.
//!
//! Each pod-equivalent gets a temporary root directory; every container is
//! a child process whose working directory and absolute paths are rebased
//! under that root. Init containers run sequentially before main
//! containers; copy operations collapse to local file copies.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::ContainerSpec;
use crate::fsutil;

use super::{BackendError, CancelToken, Executor, HandlerFuture, PodRequest};

/// Local process backend. Stateless; each pod owns its own temp root.
#[derive(Clone, Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }

    pub fn build_pod(&self, request: PodRequest) -> Result<LocalPod, BackendError> {
        let root = TempDir::new()?;
        Ok(LocalPod {
            root: Arc::new(root),
            request,
            async_children: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

/// One pod-equivalent rooted in a temp directory.
pub struct LocalPod {
    root: Arc<TempDir>,
    request: PodRequest,
    async_children: Arc<Mutex<Vec<Child>>>,
}

impl LocalPod {
    pub fn name(&self) -> &str {
        &self.request.name
    }

    fn rebase(root: &Path, path: &str) -> PathBuf {
        root.join(path.trim_start_matches('/'))
    }

    async fn deliver_mounts(&self) -> Result<(), BackendError> {
        let root = self.root.path();
        for container in self
            .request
            .init_containers
            .iter()
            .chain(self.request.containers.iter())
        {
            for (source, mount_path, mode) in self.request.mount_points(container) {
                let dest = Self::rebase(root, &mount_path);
                if dest.exists() {
                    continue;
                }
                fsutil::copy_path(&source, &dest)?;
                if source.is_file() {
                    if let Some(mode) = mode {
                        fsutil::set_mode(&dest, mode)?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_init_containers(&self, cancel: &CancelToken) -> Result<(), BackendError> {
        for container in &self.request.init_containers {
            let executor = LocalExecutor::new(self.root.clone(), self.async_children.clone());
            match executor.output(cancel, container).await {
                Ok(_) => {}
                Err(BackendError::CommandFailed { code, .. }) => {
                    return Err(BackendError::PreInit {
                        container: container.name.clone(),
                        code,
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub async fn run_with_handler<'a, F>(
        &'a mut self,
        cancel: &'a CancelToken,
        handler: F,
    ) -> Result<(), BackendError>
    where
        F: FnOnce(Vec<Executor>) -> HandlerFuture<'a> + Send + 'a,
    {
        self.deliver_mounts().await?;
        for container in &self.request.containers {
            if let Some(dir) = &container.working_dir {
                fsutil::ensure_dir(&Self::rebase(self.root.path(), dir))?;
            }
        }
        self.run_init_containers(cancel).await?;

        let executors: Vec<Executor> = self
            .request
            .containers
            .iter()
            .map(|container| {
                Executor::local(
                    container.clone(),
                    self.request.name.clone(),
                    LocalExecutor::new(self.root.clone(), self.async_children.clone()),
                )
            })
            .collect();

        let result = handler(executors).await;
        self.teardown().await;
        result
    }

    async fn teardown(&self) {
        let mut children = self.async_children.lock().await;
        for child in children.iter_mut() {
            let _ = child.start_kill();
        }
        for mut child in children.drain(..) {
            let _ = child.wait().await;
        }
    }
}

/// Handle to one container-as-process.
#[derive(Clone)]
pub struct LocalExecutor {
    root: Arc<TempDir>,
    async_children: Arc<Mutex<Vec<Child>>>,
}

impl LocalExecutor {
    fn new(root: Arc<TempDir>, async_children: Arc<Mutex<Vec<Child>>>) -> Self {
        Self {
            root,
            async_children,
        }
    }

    fn command(&self, container: &ContainerSpec, cmdline: &[String]) -> Result<Command, BackendError> {
        if cmdline.is_empty() {
            return Err(BackendError::InvalidCommand {
                container: container.name.clone(),
                reason: "command is empty".to_string(),
            });
        }
        let mut cmd = Command::new(&cmdline[0]);
        cmd.args(&cmdline[1..]);
        for env in &container.env {
            if env.value.is_empty() {
                continue;
            }
            cmd.env(&env.name, &env.value);
        }
        let workdir = container.working_dir.as_deref().unwrap_or("");
        let dir = LocalPod::rebase(self.root.path(), workdir);
        std::fs::create_dir_all(&dir)?;
        cmd.current_dir(dir);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        Ok(cmd)
    }

    async fn run_capture(
        &self,
        cancel: &CancelToken,
        container: &ContainerSpec,
        cmdline: &[String],
    ) -> Result<Vec<u8>, BackendError> {
        let mut cmd = self.command(container, cmdline)?;
        let output = tokio::select! {
            out = cmd.output() => out?,
            _ = cancel.canceled() => return Err(BackendError::Canceled),
        };
        if output.status.success() {
            Ok(output.stdout)
        } else {
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            Err(BackendError::CommandFailed {
                container: container.name.clone(),
                code: output.status.code().unwrap_or(-1),
                output: combined,
            })
        }
    }

    pub async fn output(
        &self,
        cancel: &CancelToken,
        container: &ContainerSpec,
    ) -> Result<Vec<u8>, BackendError> {
        let cmdline = container.command_line();
        self.run_capture(cancel, container, &cmdline).await
    }

    pub async fn exec_async(&self, container: &ContainerSpec) {
        let cmdline = container.command_line();
        if cmdline.is_empty() {
            return;
        }
        let Ok(mut cmd) = self.command(container, &cmdline) else {
            return;
        };
        match cmd.spawn() {
            Ok(child) => self.async_children.lock().await.push(child),
            Err(err) => {
                tracing::warn!(
                    "failed to start sidecar {}: {}",
                    container.name,
                    err
                );
            }
        }
    }

    pub async fn stop(&self) -> Result<(), BackendError> {
        // Synchronous execs finish on their own; only async children hold
        // resources, and the pod teardown reaps them.
        Ok(())
    }

    pub async fn copy_from(&self, src: &str, dst: &Path) -> Result<(), BackendError> {
        let src_abs = LocalPod::rebase(self.root.path(), src);
        let dst = resolve_copy_destination(&src_abs, dst);
        if let Some(parent) = dst.parent() {
            fsutil::ensure_dir(parent)?;
        }
        tracing::debug!(
            "copy from {} on pod root to {} on local",
            src_abs.display(),
            dst.display()
        );
        fsutil::copy_path(&src_abs, &dst)?;
        Ok(())
    }

    pub async fn copy_to(&self, src: &Path, dst: &str) -> Result<(), BackendError> {
        let dst_abs = LocalPod::rebase(self.root.path(), dst);
        let dst_abs = resolve_copy_destination(src, &dst_abs);
        if let Some(parent) = dst_abs.parent() {
            fsutil::ensure_dir(parent)?;
        }
        tracing::debug!(
            "copy from {} on local to {} on pod root",
            src.display(),
            dst_abs.display()
        );
        fsutil::copy_path(src, &dst_abs)?;
        Ok(())
    }

    pub async fn unpack_archive(&self, archive: &Path, dst: &str) -> Result<(), BackendError> {
        let dst_abs = LocalPod::rebase(self.root.path(), dst);
        fsutil::ensure_dir(&dst_abs)?;
        let file = std::fs::File::open(archive)?;
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        archive.unpack(&dst_abs)?;
        Ok(())
    }

    pub async fn prepare_command(
        &self,
        cancel: &CancelToken,
        container: &ContainerSpec,
        cmd: &[String],
    ) -> Result<Vec<u8>, BackendError> {
        // Absolute paths in the command refer to pod paths; rebase them
        // under the pod root.
        let rebased: Vec<String> = cmd
            .iter()
            .map(|part| {
                if part.starts_with('/') {
                    LocalPod::rebase(self.root.path(), part)
                        .to_string_lossy()
                        .into_owned()
                } else {
                    part.clone()
                }
            })
            .collect();
        self.run_capture(cancel, container, &rebased).await
    }
}

/// When the basenames differ, treat the destination as a directory and
/// append the source's basename.
fn resolve_copy_destination(src: &Path, dst: &Path) -> PathBuf {
    match (src.file_name(), dst.file_name()) {
        (Some(src_name), Some(dst_name)) if src_name != dst_name => dst.join(src_name),
        (Some(src_name), None) => dst.join(src_name),
        _ => dst.to_path_buf(),
    }
}
