//! Cluster realization of the execution substrate.
//!
//! A pod-equivalent is a batch Job whose containers are held open by a
//! wait loop; the configured command runs through the exec subresource so
//! the engine controls start, capture and stop per container. Copy
//! operations ride an in-band tar stream.

use std::path::Path;
use std::time::{Duration, Instant};

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, Pod, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Status};
use kube::api::{Api, AttachParams, DeleteParams, ListParams, PostParams};
use kube::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::ContainerSpec;

use super::{tarcopy, BackendError, CancelToken, Executor, HandlerFuture, PodRequest};

const STOP_MARKER: &str = "/tmp/.shardtest-stop";
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Kubernetes-backed substrate.
#[derive(Clone)]
pub struct ClusterBackend {
    client: Client,
    namespace: String,
    pending_timeout: Duration,
}

impl ClusterBackend {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            pending_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    pub fn build_pod(&self, request: PodRequest) -> ClusterPod {
        let job_name = format!(
            "{}-{}",
            sanitize_name(&request.name),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        ClusterPod {
            backend: self.clone(),
            request,
            job_name,
        }
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// One batch Job plus the pod it schedules.
pub struct ClusterPod {
    backend: ClusterBackend,
    request: PodRequest,
    job_name: String,
}

impl ClusterPod {
    pub fn name(&self) -> &str {
        &self.job_name
    }

    fn namespace(&self) -> &str {
        if self.request.namespace.is_empty() {
            &self.backend.namespace
        } else {
            &self.request.namespace
        }
    }

    pub async fn run_with_handler<'a, F>(
        &'a mut self,
        cancel: &'a CancelToken,
        handler: F,
    ) -> Result<(), BackendError>
    where
        F: FnOnce(Vec<Executor>) -> HandlerFuture<'a> + Send + 'a,
    {
        let result = self.run_inner(cancel, handler).await;
        self.teardown().await;
        result
    }

    async fn run_inner<'a, F>(
        &mut self,
        cancel: &'a CancelToken,
        handler: F,
    ) -> Result<(), BackendError>
    where
        F: FnOnce(Vec<Executor>) -> HandlerFuture<'a> + Send + 'a,
    {
        let namespace = self.namespace().to_string();
        let jobs = self.backend.jobs(&namespace);
        let job = self.job_object();
        jobs.create(&PostParams::default(), &job).await?;

        let pod_name = tokio::select! {
            waited = self.wait_for_running(&namespace) => waited?,
            _ = cancel.canceled() => return Err(BackendError::Canceled),
        };

        let executors: Vec<Executor> = self
            .request
            .containers
            .iter()
            .map(|container| {
                Executor::cluster(
                    container.clone(),
                    pod_name.clone(),
                    ClusterExecutor {
                        backend: self.backend.clone(),
                        namespace: namespace.clone(),
                        pod_name: pod_name.clone(),
                    },
                )
            })
            .collect();

        self.deliver_mounts(cancel, &executors).await?;
        handler(executors).await
    }

    /// Containers are held open; the configured command runs via exec.
    fn job_object(&self) -> Job {
        let holder = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("until [ -f {} ]; do sleep 1; done", STOP_MARKER),
        ];
        // One emptyDir per volume name any container references; staged
        // content is delivered into it after the pod is running.
        let mut volume_names: Vec<String> = Vec::new();
        for container in self
            .request
            .init_containers
            .iter()
            .chain(self.request.containers.iter())
        {
            for mount in &container.volume_mounts {
                if !volume_names.contains(&mount.name) {
                    volume_names.push(mount.name.clone());
                }
            }
        }
        let volumes: Vec<Volume> = volume_names
            .into_iter()
            .map(|name| Volume {
                name,
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            })
            .collect();

        Job {
            metadata: ObjectMeta {
                name: Some(self.job_name.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        init_containers: if self.request.init_containers.is_empty() {
                            None
                        } else {
                            Some(
                                self.request
                                    .init_containers
                                    .iter()
                                    .map(|c| to_k8s_container(c, None))
                                    .collect(),
                            )
                        },
                        containers: self
                            .request
                            .containers
                            .iter()
                            .map(|c| to_k8s_container(c, Some(holder.clone())))
                            .collect(),
                        volumes: if volumes.is_empty() {
                            None
                        } else {
                            Some(volumes)
                        },
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Wait until the pod leaves the pending phase and reaches running.
    /// Pre-init failures and scheduling stalls surface as typed retryable
    /// errors.
    async fn wait_for_running(&self, namespace: &str) -> Result<String, BackendError> {
        let pods = self.backend.pods(namespace);
        let selector = format!("job-name={}", self.job_name);
        let lp = ListParams::default().labels(&selector);
        let deadline = Instant::now() + self.backend.pending_timeout;

        loop {
            let list = pods.list(&lp).await?;
            if let Some(pod) = list.items.first() {
                let pod_name = pod
                    .metadata
                    .name
                    .clone()
                    .unwrap_or_else(|| self.job_name.clone());
                if let Some(status) = &pod.status {
                    if let Some(statuses) = &status.init_container_statuses {
                        for cs in statuses {
                            if let Some(terminated) =
                                cs.state.as_ref().and_then(|s| s.terminated.as_ref())
                            {
                                if terminated.exit_code != 0 {
                                    return Err(BackendError::PreInit {
                                        container: cs.name.clone(),
                                        code: terminated.exit_code,
                                    });
                                }
                            }
                        }
                    }
                    match status.phase.as_deref() {
                        Some("Running") => return Ok(pod_name),
                        Some("Failed") => {
                            return Err(BackendError::Cluster(format!(
                                "pod {} failed before execution started",
                                pod_name
                            )))
                        }
                        _ => {}
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(BackendError::PendingTimeout {
                    pod: self.job_name.clone(),
                    timeout: self.backend.pending_timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Deliver staged mount content into the shared volumes. Each volume
    /// is filled once, through the first container that mounts it.
    async fn deliver_mounts(
        &self,
        cancel: &CancelToken,
        executors: &[Executor],
    ) -> Result<(), BackendError> {
        for mount in &self.request.mounts {
            let target = executors.iter().find_map(|exec| {
                exec.container()
                    .volume_mounts
                    .iter()
                    .find(|vm| vm.name == mount.volume)
                    .map(|vm| (exec, vm.mount_path.clone()))
            });
            let Some((exec, mount_path)) = target else {
                continue;
            };
            match &mount.archive {
                Some(archive) => {
                    exec.unpack_archive(cancel, archive, &mount_path).await?;
                }
                None => exec.copy_to(cancel, &mount.source, &mount_path).await?,
            }
        }
        Ok(())
    }

    async fn teardown(&self) {
        let namespace = self.namespace().to_string();
        let jobs = self.backend.jobs(&namespace);
        if let Err(err) = jobs.delete(&self.job_name, &DeleteParams::background()).await {
            tracing::warn!("failed to delete job {}: {}", self.job_name, err);
        }
        let pods = self.backend.pods(&namespace);
        let lp = ListParams::default().labels(&format!("job-name={}", self.job_name));
        if let Err(err) = pods
            .delete_collection(&DeleteParams::background(), &lp)
            .await
        {
            tracing::warn!("failed to delete pods of job {}: {}", self.job_name, err);
        }
    }
}

/// Handle to one running cluster container.
#[derive(Clone)]
pub struct ClusterExecutor {
    backend: ClusterBackend,
    namespace: String,
    pod_name: String,
}

impl ClusterExecutor {
    async fn exec_capture(
        &self,
        cancel: &CancelToken,
        container: &ContainerSpec,
        cmd: Vec<String>,
        stdin: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, BackendError> {
        tokio::select! {
            result = self.exec_capture_inner(container, cmd, stdin) => result,
            _ = cancel.canceled() => Err(BackendError::Canceled),
        }
    }

    async fn exec_capture_inner(
        &self,
        container: &ContainerSpec,
        cmd: Vec<String>,
        stdin: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, BackendError> {
        if cmd.is_empty() {
            return Err(BackendError::InvalidCommand {
                container: container.name.clone(),
                reason: "command is empty".to_string(),
            });
        }
        let pods = self.backend.pods(&self.namespace);
        let ap = AttachParams::default()
            .container(&container.name)
            .stdin(stdin.is_some())
            .stdout(true)
            .stderr(true);
        let mut proc = pods.exec(&self.pod_name, cmd, &ap).await?;

        if let Some(data) = stdin {
            let mut writer = proc.stdin().ok_or_else(|| {
                BackendError::Cluster("exec stream has no stdin channel".to_string())
            })?;
            writer.write_all(&data).await?;
            writer.shutdown().await?;
        }

        let mut stdout_reader = proc.stdout().ok_or_else(|| {
            BackendError::Cluster("exec stream has no stdout channel".to_string())
        })?;
        let mut stderr_reader = proc.stderr().ok_or_else(|| {
            BackendError::Cluster("exec stream has no stderr channel".to_string())
        })?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let (out_res, err_res) = tokio::join!(
            stdout_reader.read_to_end(&mut stdout),
            stderr_reader.read_to_end(&mut stderr),
        );
        out_res?;
        err_res?;

        let status = match proc.take_status() {
            Some(status) => status.await,
            None => None,
        };
        match exec_exit_code(status) {
            Some(0) | None => Ok(stdout),
            Some(code) => {
                let mut combined = stdout;
                combined.extend_from_slice(&stderr);
                Err(BackendError::CommandFailed {
                    container: container.name.clone(),
                    code,
                    output: combined,
                })
            }
        }
    }

    pub async fn output(
        &self,
        cancel: &CancelToken,
        container: &ContainerSpec,
    ) -> Result<Vec<u8>, BackendError> {
        self.exec_capture(cancel, container, container.command_line(), None)
            .await
    }

    pub async fn exec_async(&self, container: &ContainerSpec) {
        let this = self.clone();
        let container = container.clone();
        tokio::spawn(async move {
            let cancel = CancelToken::new();
            if let Err(err) = this
                .exec_capture(&cancel, &container, container.command_line(), None)
                .await
            {
                tracing::debug!("sidecar {} exec finished: {}", container.name, err);
            }
        });
    }

    pub async fn stop(&self, container: &ContainerSpec) -> Result<(), BackendError> {
        let cancel = CancelToken::new();
        let cmd = vec!["touch".to_string(), STOP_MARKER.to_string()];
        // A missing shell or an already-stopped container is not an error.
        if let Err(err) = self.exec_capture(&cancel, container, cmd, None).await {
            tracing::debug!("failed to stop container {}: {}", container.name, err);
        }
        Ok(())
    }

    pub async fn copy_from(
        &self,
        cancel: &CancelToken,
        container: &ContainerSpec,
        src: &str,
        dst: &Path,
    ) -> Result<(), BackendError> {
        tracing::debug!("copy from {} on container to {} on local", src, dst.display());
        let cmd = vec![
            "tar".to_string(),
            "cf".to_string(),
            "-".to_string(),
            src.to_string(),
        ];
        let stream = self.exec_capture(cancel, container, cmd, None).await?;
        tarcopy::unpack(&stream[..], dst, src)
            .map_err(|err| BackendError::Copy(err.to_string()))?;
        Ok(())
    }

    pub async fn copy_to(
        &self,
        cancel: &CancelToken,
        container: &ContainerSpec,
        src: &Path,
        dst: &str,
    ) -> Result<(), BackendError> {
        tracing::debug!("copy from {} on local to {} on container", src.display(), dst);
        let (bytes, extract_dir) = if src.is_dir() {
            (
                tarcopy::pack(src, ".").map_err(|err| BackendError::Copy(err.to_string()))?,
                dst.to_string(),
            )
        } else {
            let file_name = Path::new(dst)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            let parent = Path::new(dst)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| "/".to_string());
            (
                tarcopy::pack(src, &file_name)
                    .map_err(|err| BackendError::Copy(err.to_string()))?,
                parent,
            )
        };

        let mkdir = vec![
            "mkdir".to_string(),
            "-p".to_string(),
            extract_dir.clone(),
        ];
        self.exec_capture(cancel, container, mkdir, None).await?;

        let extract = vec![
            "tar".to_string(),
            "xmf".to_string(),
            "-".to_string(),
            "-C".to_string(),
            extract_dir,
        ];
        self.exec_capture(cancel, container, extract, Some(bytes))
            .await?;
        Ok(())
    }

    pub async fn unpack_archive(
        &self,
        cancel: &CancelToken,
        container: &ContainerSpec,
        archive: &Path,
        dst: &str,
    ) -> Result<(), BackendError> {
        tracing::debug!(
            "unpack archive {} into {} on container",
            archive.display(),
            dst
        );
        let bytes = tokio::fs::read(archive).await?;
        let mkdir = vec!["mkdir".to_string(), "-p".to_string(), dst.to_string()];
        self.exec_capture(cancel, container, mkdir, None).await?;
        let extract = vec![
            "tar".to_string(),
            "xzmf".to_string(),
            "-".to_string(),
            "-C".to_string(),
            dst.to_string(),
        ];
        self.exec_capture(cancel, container, extract, Some(bytes))
            .await?;
        Ok(())
    }

    pub async fn prepare_command(
        &self,
        cancel: &CancelToken,
        container: &ContainerSpec,
        cmd: &[String],
    ) -> Result<Vec<u8>, BackendError> {
        self.exec_capture(cancel, container, cmd.to_vec(), None).await
    }
}

fn to_k8s_container(spec: &ContainerSpec, command_override: Option<Vec<String>>) -> Container {
    let (command, args) = match command_override {
        Some(cmd) => (Some(cmd), None),
        None => (
            if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            if spec.args.is_empty() {
                None
            } else {
                Some(spec.args.clone())
            },
        ),
    };
    Container {
        name: spec.name.clone(),
        image: if spec.image.is_empty() {
            None
        } else {
            Some(spec.image.clone())
        },
        command,
        args,
        working_dir: spec.working_dir.clone(),
        env: if spec.env.is_empty() {
            None
        } else {
            Some(
                spec.env
                    .iter()
                    .map(|e| EnvVar {
                        name: e.name.clone(),
                        value: Some(e.value.clone()),
                        value_from: None,
                    })
                    .collect(),
            )
        },
        volume_mounts: if spec.volume_mounts.is_empty() {
            None
        } else {
            Some(
                spec.volume_mounts
                    .iter()
                    .map(|vm| VolumeMount {
                        name: vm.name.clone(),
                        mount_path: vm.mount_path.clone(),
                        ..Default::default()
                    })
                    .collect(),
            )
        },
        ..Default::default()
    }
}

/// Extract the command exit code from an exec Status object. `None` means
/// success could not be disproved (treated as success, matching the
/// stream's absence of a failure frame).
fn exec_exit_code(status: Option<Status>) -> Option<i32> {
    let status = status?;
    if status.status.as_deref() == Some("Success") {
        return Some(0);
    }
    if let Some(details) = &status.details {
        if let Some(causes) = &details.causes {
            for cause in causes {
                if cause.reason.as_deref() == Some("ExitCode") {
                    if let Some(code) = cause.message.as_ref().and_then(|m| m.parse().ok()) {
                        return Some(code);
                    }
                }
            }
        }
    }
    if status.status.as_deref() == Some("Failure") {
        // Nonzero exit without a parseable code.
        return Some(1);
    }
    None
}

fn sanitize_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    out.truncate(40);
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "pod".to_string()
    } else {
        trimmed.to_string()
    }
}
