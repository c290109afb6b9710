//! Task and subtask runtime.
//!
//! A [`Task`] owns one pod-equivalent and runs a contiguous slice of
//! subtasks inside it: sidecars start first in async mode, subtask groups
//! run sequentially with their members concurrent, artifacts are staged on
//! success, and the pod is recreated through a factory closure when a
//! retryable backend error burns an attempt.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::{Backend, BackendError, CancelToken, Executor, PodHandle, PodRequest};
use crate::config::{ArtifactSpec, ContainerSpec, EnvVar, MainStep, Strategy, TemplateSpec};
use crate::events::{Event, EventBus};
use crate::logging::Logger;
use crate::report::{ReportDetail, SubTaskStatus};
use crate::resources::{ResourceError, ResourceManager};
use crate::retry::RetryPolicy;
use crate::scheduler::{SubTaskScheduler, TaskScheduler};

/// Recreates the pod object for a retry; the prior attempt mutated the
/// backend's internal state.
pub type PodFactory = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<PodHandle, BackendError>> + Send>>
        + Send
        + Sync,
>;

/// Result of one subtask attempt.
#[derive(Debug, Clone)]
pub struct SubTaskResult {
    pub name: String,
    pub task_name: String,
    pub status: SubTaskStatus,
    pub elapsed: Duration,
    pub output: Vec<u8>,
    pub container: String,
    pub pod: String,
    pub is_main: bool,
}

impl SubTaskResult {
    pub fn failed(&self) -> bool {
        self.status != SubTaskStatus::Success
    }

    pub fn to_report_detail(&self) -> ReportDetail {
        ReportDetail {
            status: self.status.to_result_status(),
            name: self.name.clone(),
            elapsed_time_sec: self.elapsed.as_secs() as i64,
        }
    }
}

/// Aggregated result of one Task (one pod).
#[derive(Debug, Default)]
pub struct TaskResult {
    pub groups: Vec<Vec<SubTaskResult>>,
}

impl TaskResult {
    pub fn main_results(&self) -> impl Iterator<Item = &SubTaskResult> {
        self.groups.iter().flatten().filter(|r| r.is_main)
    }

    pub fn all_results(&self) -> impl Iterator<Item = &SubTaskResult> {
        self.groups.iter().flatten()
    }
}

/// One (container, key) pair inside a Task.
pub struct SubTask {
    pub name: String,
    pub task_name: String,
    pub is_main: bool,
    executor: Executor,
    artifacts: Vec<ArtifactSpec>,
    resources: Arc<ResourceManager>,
    events: Arc<EventBus>,
    logger: Arc<Logger>,
}

impl SubTask {
    /// Run the subtask once: exec the container command, stop the
    /// container, stage declared artifacts on success, emit the finish
    /// event. Artifact-copy errors fail this subtask only.
    pub async fn run(self, cancel: CancelToken) -> SubTaskResult {
        let started = Instant::now();
        self.events
            .emit(Event::SubTaskStarted {
                name: self.name.clone(),
                task_name: self.task_name.clone(),
            })
            .await;

        let exec_result = self.executor.output(&cancel).await;
        if let Err(err) = self.executor.stop().await {
            self.logger.debug(format!(
                "failed to stop container {}: {}",
                self.executor.container().name,
                err
            ));
        }

        let (mut status, output) = match exec_result {
            Ok(output) => (SubTaskStatus::Success, output),
            Err(BackendError::CommandFailed { output, code, .. }) => {
                self.logger.debug(format!(
                    "subtask {} exited with code {}",
                    self.name, code
                ));
                (SubTaskStatus::Failure, output)
            }
            Err(err) => {
                self.logger
                    .error(format!("subtask {} could not run: {}", self.name, err));
                (SubTaskStatus::Error, err.to_string().into_bytes())
            }
        };

        if status == SubTaskStatus::Success {
            if let Err(err) = self.copy_artifacts(&cancel).await {
                self.logger.error(format!(
                    "failed to copy artifacts of subtask {}: {}",
                    self.name, err
                ));
                status = SubTaskStatus::Error;
            }
        }

        self.logger
            .container_output(&self.executor.container().name, &String::from_utf8_lossy(&output));

        let result = SubTaskResult {
            name: self.name.clone(),
            task_name: self.task_name.clone(),
            status,
            elapsed: started.elapsed(),
            output: output.clone(),
            container: self.executor.container().name.clone(),
            pod: self.executor.pod_name().to_string(),
            is_main: self.is_main,
        };

        self.events
            .emit(Event::SubTaskFinished {
                name: result.name.clone(),
                task_name: result.task_name.clone(),
                status: result.status,
                elapsed: result.elapsed,
                output,
                container: result.container.clone(),
                pod: result.pod.clone(),
            })
            .await;

        result
    }

    async fn copy_artifacts(&self, cancel: &CancelToken) -> Result<(), ResourceError> {
        for artifact in &self.artifacts {
            // Stage under the subtask's key, not the container name: clone
            // containers restart numbering in every pod (and again on
            // retest), so the key is the only collision-free identity.
            let dest = self
                .resources
                .artifacts()
                .stage_dir_for(&artifact.name, &self.name)?;
            self.executor
                .copy_from(cancel, &artifact.container.path, &dest)
                .await
                .map_err(|err| {
                    ResourceError::Artifact(crate::resources::ArtifactError::Io(
                        std::io::Error::other(err.to_string()),
                    ))
                })?;
        }
        Ok(())
    }
}

/// One pod-equivalent running a slice of subtasks.
pub struct Task {
    pub name: String,
    main_container_name: String,
    strategy_env: Option<String>,
    subtask_count: usize,
    create_pod: PodFactory,
    subtask_scheduler: SubTaskScheduler,
    retry: RetryPolicy,
    /// Clone-container name → artifacts it produces.
    artifacts_by_container: HashMap<String, Vec<ArtifactSpec>>,
    resources: Arc<ResourceManager>,
    events: Arc<EventBus>,
    logger: Arc<Logger>,
}

impl Task {
    pub fn subtask_count(&self) -> usize {
        self.subtask_count
    }

    /// Run with pod-level retry. Only retryable backend errors consume
    /// the budget; the pod is recreated through the factory on each
    /// retry.
    pub async fn run(self, cancel: CancelToken) -> Result<TaskResult, BackendError> {
        let mut retries = 0u32;
        loop {
            let pod = (self.create_pod)().await?;
            match self.run_once(pod, &cancel).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_retryable() && self.retry.should_retry(retries) => {
                    self.logger.warn(format!(
                        "failed to run task {} because {}. retry {}/{}",
                        self.name, err, retries, self.retry.max_retries
                    ));
                    self.events
                        .emit(Event::TaskRetrying {
                            task_name: self.name.clone(),
                            attempt: retries + 1,
                            max_attempts: self.retry.max_retries + 1,
                            reason: err.to_string(),
                        })
                        .await;
                    tokio::time::sleep(self.retry.interval(retries)).await;
                    retries += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn run_once(
        &self,
        mut pod: PodHandle,
        cancel: &CancelToken,
    ) -> Result<TaskResult, BackendError> {
        let mut result = TaskResult::default();
        let task = self;
        pod.run_with_handler(cancel, |executors| {
            let result = &mut result;
            Box::pin(async move {
                let (mains, sidecars): (Vec<Executor>, Vec<Executor>) = executors
                    .into_iter()
                    .partition(|exec| task.is_main_executor(exec));

                for sidecar in &sidecars {
                    sidecar.exec_async().await;
                }

                let subtasks = task.build_subtasks(mains);
                let groups = task.subtask_scheduler.schedule(subtasks);
                for group in groups {
                    let group_results = run_subtask_group(group, cancel.clone()).await;
                    result.groups.push(group_results);
                }

                for sidecar in &sidecars {
                    if let Err(err) = sidecar.stop().await {
                        task.logger.debug(format!(
                            "failed to stop sidecar {}: {}",
                            sidecar.container().name,
                            err
                        ));
                    }
                }
                Ok(())
            })
        })
        .await?;
        Ok(result)
    }

    fn is_main_executor(&self, exec: &Executor) -> bool {
        let container = exec.container();
        if container.name == self.main_container_name {
            return true;
        }
        match &self.strategy_env {
            Some(env) => container.env_value(env).is_some(),
            None => false,
        }
    }

    fn key_name(&self, container: &ContainerSpec) -> String {
        if let Some(env) = &self.strategy_env {
            if let Some(value) = container.env_value(env) {
                return value.to_string();
            }
        }
        container.name.clone()
    }

    fn build_subtasks(&self, executors: Vec<Executor>) -> Vec<SubTask> {
        executors
            .into_iter()
            .map(|executor| {
                let container = executor.container().clone();
                SubTask {
                    name: self.key_name(&container),
                    task_name: self.name.clone(),
                    is_main: true,
                    artifacts: self
                        .artifacts_by_container
                        .get(&container.name)
                        .cloned()
                        .unwrap_or_default(),
                    executor,
                    resources: self.resources.clone(),
                    events: self.events.clone(),
                    logger: self.logger.clone(),
                }
            })
            .collect()
    }
}

/// Fan out a group's subtasks and join them all; a panicked member is
/// recorded as an errored subtask, not propagated.
async fn run_subtask_group(group: Vec<SubTask>, cancel: CancelToken) -> Vec<SubTaskResult> {
    let mut handles = Vec::with_capacity(group.len());
    for subtask in group {
        let cancel = cancel.clone();
        let name = subtask.name.clone();
        let task_name = subtask.task_name.clone();
        handles.push((
            name,
            task_name,
            tokio::spawn(subtask.run(cancel)),
        ));
    }
    let mut results = Vec::with_capacity(handles.len());
    for (name, task_name, handle) in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(err) => results.push(SubTaskResult {
                name,
                task_name,
                status: SubTaskStatus::Error,
                elapsed: Duration::ZERO,
                output: err.to_string().into_bytes(),
                container: String::new(),
                pod: String::new(),
                is_main: true,
            }),
        }
    }
    results
}

/// Aggregate over all Tasks of a step.
#[derive(Debug, Default)]
pub struct TaskGroupResult {
    pub total_subtask_num: usize,
    pub results: Vec<TaskResult>,
    /// Task-level failures (infrastructure errors after the retry budget).
    pub errors: Vec<String>,
}

impl TaskGroupResult {
    pub fn total_num(&self) -> usize {
        self.total_subtask_num
    }

    pub fn success_num(&self) -> usize {
        self.results
            .iter()
            .flat_map(|r| r.all_results())
            .filter(|r| r.status == SubTaskStatus::Success)
            .count()
    }

    pub fn failure_num(&self) -> usize {
        self.results
            .iter()
            .flat_map(|r| r.all_results())
            .filter(|r| r.failed())
            .count()
    }

    pub fn succeeded(&self) -> bool {
        self.errors.is_empty() && self.success_num() == self.total_subtask_num
    }

    /// Keys of failed main subtasks, in first-seen order.
    pub fn failed_main_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for result in &self.results {
            for subtask in result.main_results() {
                if subtask.failed() && !keys.contains(&subtask.name) {
                    keys.push(subtask.name.clone());
                }
            }
        }
        keys
    }

    pub fn to_report_details(&self) -> Vec<ReportDetail> {
        self.results
            .iter()
            .flat_map(|r| r.all_results())
            .map(|r| r.to_report_detail())
            .collect()
    }

    /// Replace the results of re-run keys with their retest outcomes.
    pub fn merge_retest(&mut self, retest: TaskGroupResult) {
        let replacements: HashMap<String, SubTaskResult> = retest
            .results
            .into_iter()
            .flat_map(|r| r.groups.into_iter().flatten())
            .map(|r| (r.name.clone(), r))
            .collect();
        for result in &mut self.results {
            for group in &mut result.groups {
                for subtask in group.iter_mut() {
                    if let Some(replacement) = replacements.get(&subtask.name) {
                        *subtask = replacement.clone();
                    }
                }
            }
        }
        self.errors.extend(retest.errors);
    }
}

/// Run tasks in parallel; errors are collected, siblings keep running.
pub struct TaskGroup {
    tasks: Vec<Task>,
}

impl TaskGroup {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    pub async fn run(self, cancel: &CancelToken) -> TaskGroupResult {
        let total_subtask_num = self.tasks.iter().map(|t| t.subtask_count()).sum();
        let mut handles = Vec::with_capacity(self.tasks.len());
        for task in self.tasks {
            let cancel = cancel.clone();
            let name = task.name.clone();
            handles.push((name, tokio::spawn(task.run(cancel))));
        }

        let mut group = TaskGroupResult {
            total_subtask_num,
            ..Default::default()
        };
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(result)) => group.results.push(result),
                Ok(Err(err)) => group
                    .errors
                    .push(format!("task {} failed: {}", name, err)),
                Err(err) => group
                    .errors
                    .push(format!("task {} panicked: {}", name, err)),
            }
        }
        group
    }
}

/// Converts one step plus a strategy key slice into Tasks backed by pods.
pub struct TaskBuilder {
    backend: Backend,
    resources: Arc<ResourceManager>,
    events: Arc<EventBus>,
    logger: Arc<Logger>,
}

impl TaskBuilder {
    pub fn new(
        backend: Backend,
        resources: Arc<ResourceManager>,
        events: Arc<EventBus>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            backend,
            resources,
            events,
            logger,
        }
    }

    /// Build the main step's Tasks for the given key list. With no keys
    /// the step degenerates to a single task using the template verbatim.
    pub async fn build_main_tasks(
        &self,
        step: &MainStep,
        keys: &[String],
        concurrency_override: Option<usize>,
    ) -> Result<Vec<Task>, ResourceError> {
        let Some(strategy) = &step.strategy else {
            return Ok(vec![
                self.build_single_task("main", &step.template).await?,
            ]);
        };
        if keys.is_empty() {
            return Ok(vec![
                self.build_single_task("main", &step.template).await?,
            ]);
        }

        let scheduler = TaskScheduler::from_spec(&strategy.scheduler, keys.len());
        let concurrency =
            concurrency_override.unwrap_or(strategy.scheduler.max_concurrent_num_per_pod);

        let mut tasks = Vec::new();
        for (index, slice) in scheduler.partition(keys).into_iter().enumerate() {
            let task = self
                .build_sharded_task(step, strategy, &slice, index, concurrency)
                .await?;
            tasks.push(task);
        }
        Ok(tasks)
    }

    async fn build_sharded_task(
        &self,
        step: &MainStep,
        strategy: &Strategy,
        keys: &[String],
        index: usize,
        concurrency: usize,
    ) -> Result<Task, ResourceError> {
        let template = &step.template;
        let main_name = main_container_name(template);
        let main_template = template
            .spec
            .containers
            .iter()
            .find(|c| c.name == main_name)
            .cloned()
            .unwrap_or_default();
        let template_artifacts: Vec<ArtifactSpec> = template
            .spec
            .artifacts
            .iter()
            .filter(|a| a.container.name == main_name)
            .cloned()
            .collect();

        let mut containers = Vec::with_capacity(keys.len());
        let mut artifacts_by_container: HashMap<String, Vec<ArtifactSpec>> = HashMap::new();
        for (i, key) in keys.iter().enumerate() {
            let mut clone = main_template.clone();
            clone.name = format!("{}-{}", main_name, i);
            clone.env.push(EnvVar {
                name: strategy.key.env.clone(),
                value: key.clone(),
            });
            artifacts_by_container.insert(clone.name.clone(), template_artifacts.clone());
            containers.push(clone);
        }
        // Sidecars ride along unchanged.
        for container in &template.spec.containers {
            if container.name != main_name {
                containers.push(container.clone());
                let sidecar_artifacts: Vec<ArtifactSpec> = template
                    .spec
                    .artifacts
                    .iter()
                    .filter(|a| a.container.name == container.name)
                    .cloned()
                    .collect();
                if !sidecar_artifacts.is_empty() {
                    artifacts_by_container.insert(container.name.clone(), sidecar_artifacts);
                }
            }
        }

        let task_name = format!("main-{}", index);
        let pod_name = format!(
            "{}-{}",
            template.metadata.base_name("main"),
            index
        );
        let request = self.materialize(pod_name, template, containers).await?;
        let subtask_count = keys.len();

        Ok(Task {
            name: task_name,
            main_container_name: main_name,
            strategy_env: Some(strategy.key.env.clone()),
            subtask_count,
            create_pod: pod_factory(self.backend.clone(), request),
            subtask_scheduler: SubTaskScheduler::new(concurrency),
            retry: RetryPolicy::default(),
            artifacts_by_container,
            resources: self.resources.clone(),
            events: self.events.clone(),
            logger: self.logger.clone(),
        })
    }

    /// Build a one-pod, no-sharding Task (pre-steps, post-steps, dynamic
    /// key evaluation and the degenerate main step).
    pub async fn build_single_task(
        &self,
        name: &str,
        template: &TemplateSpec,
    ) -> Result<Task, ResourceError> {
        let main_name = main_container_name(template);
        let mut artifacts_by_container: HashMap<String, Vec<ArtifactSpec>> = HashMap::new();
        for artifact in &template.spec.artifacts {
            artifacts_by_container
                .entry(artifact.container.name.clone())
                .or_default()
                .push(artifact.clone());
        }

        let pod_name = template.metadata.base_name(name).to_string();
        let request = self
            .materialize(pod_name, template, template.spec.containers.clone())
            .await?;

        Ok(Task {
            name: name.to_string(),
            main_container_name: main_name,
            strategy_env: None,
            subtask_count: 1,
            create_pod: pod_factory(self.backend.clone(), request),
            subtask_scheduler: SubTaskScheduler::new(0),
            retry: RetryPolicy::default(),
            artifacts_by_container,
            resources: self.resources.clone(),
            events: self.events.clone(),
            logger: self.logger.clone(),
        })
    }
}

impl TaskBuilder {
    /// Dry runs validate wiring without resolving volume sources.
    async fn materialize(
        &self,
        pod_name: String,
        template: &TemplateSpec,
        containers: Vec<ContainerSpec>,
    ) -> Result<PodRequest, ResourceError> {
        if self.backend.mode() == crate::backend::RunMode::DryRun {
            return Ok(self
                .resources
                .materialize_unmounted(pod_name, template, containers));
        }
        self.resources
            .materialize(pod_name, template, containers)
            .await
    }
}

fn pod_factory(backend: Backend, request: PodRequest) -> PodFactory {
    Arc::new(move || {
        let backend = backend.clone();
        let request = request.clone();
        Box::pin(async move { backend.build_pod(request).await })
    })
}

/// The primary container: `main` when set, else the single container.
fn main_container_name(template: &TemplateSpec) -> String {
    if let Some(main) = &template.main {
        return main.clone();
    }
    template
        .spec
        .containers
        .first()
        .map(|c| c.name.clone())
        .unwrap_or_default()
}
