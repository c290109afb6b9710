//! Top-level orchestration pipeline.
//!
//! Phase order: validate, clone repositories, pre-steps (sequential),
//! strategy key evaluation, main step (parallel tasks), optional retest
//! pass, post-steps (sequential, with injected log/report volumes),
//! artifact export, final report.

use chrono::Utc;
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::backend::{Backend, BackendError, CancelToken};
use crate::config::{ConfigError, SpecLoader, TestJob};
use crate::events::{Event, EventBus};
use crate::logging::Logger;
use crate::report::{Report, ResultStatus};
use crate::resources::{ResourceError, ResourceManager, SecretReader};
use crate::task::{TaskBuilder, TaskGroup, TaskGroupResult};

const DEFAULT_KEY_DELIMITER: &str = "\n";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Validation(#[from] ConfigError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("{kind}-step {name} failed")]
    StepFailed { kind: &'static str, name: String },

    #[error("failed to evaluate strategy keys: {0}")]
    Strategy(String),

    #[error("failed to encode report: {0}")]
    Report(#[from] serde_json::Error),

    #[error("job canceled")]
    Canceled,
}

impl RunnerError {
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            RunnerError::Canceled
                | RunnerError::Backend(BackendError::Canceled)
                | RunnerError::Resource(ResourceError::Repo(
                    crate::resources::RepoError::Canceled
                ))
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, RunnerError::Validation(_))
    }
}

/// Runs one job on one backend.
pub struct Runner {
    backend: Backend,
    namespace: String,
    secret_reader: SecretReader,
    logger: Arc<Logger>,
    events: Arc<EventBus>,
    static_key_override: Option<Vec<String>>,
}

impl Runner {
    pub fn new(backend: Backend, namespace: impl Into<String>, logger: Arc<Logger>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            secret_reader: SecretReader::Unavailable,
            logger,
            events: Arc::new(EventBus::new()),
            static_key_override: None,
        }
    }

    pub fn with_secret_reader(mut self, reader: SecretReader) -> Self {
        self.secret_reader = reader;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Override the strategy key source with a static list (`--list`).
    pub fn with_static_keys(mut self, keys: Vec<String>) -> Self {
        self.static_key_override = Some(keys);
        self
    }

    pub async fn run(&self, cancel: &CancelToken, job: TestJob) -> Result<Report, RunnerError> {
        let started_at = Utc::now();
        let started = Instant::now();

        SpecLoader::validate(&job)?;

        let mut resources = ResourceManager::new(
            &job.spec,
            &self.namespace,
            self.secret_reader.clone(),
            self.logger.clone(),
        );
        resources.clone_repositories(cancel).await?;
        let resources = Arc::new(resources);

        let builder = TaskBuilder::new(
            self.backend.clone(),
            resources.clone(),
            self.events.clone(),
            self.logger.clone(),
        );

        for step in &job.spec.pre_steps {
            self.run_aux_step(cancel, &builder, &resources, "pre", &step.name, &step.template)
                .await?;
        }

        let keys = self.evaluate_strategy_keys(cancel, &job, &builder).await?;
        if !keys.is_empty() {
            self.logger
                .info(format!("strategy produced {} keys", keys.len()));
        }

        self.events
            .emit(Event::StepStarted {
                name: "main".to_string(),
            })
            .await;
        resources
            .artifacts()
            .add_artifacts(&job.spec.main_step.template.spec.artifacts)
            .map_err(ResourceError::from)?;
        let tasks = builder
            .build_main_tasks(&job.spec.main_step, &keys, None)
            .await?;
        let mut group = TaskGroup::new(tasks).run(cancel).await;
        self.check_canceled(cancel)?;

        if let Some(strategy) = &job.spec.main_step.strategy {
            // Retest only applies to sharded runs; a degenerate main step
            // has no keys to re-run.
            if strategy.retest && !keys.is_empty() {
                let failed = group.failed_main_keys();
                if !failed.is_empty() {
                    self.logger.info("start retest....");
                    let retest_tasks = builder
                        .build_main_tasks(&job.spec.main_step, &failed, Some(1))
                        .await?;
                    let retest_group = TaskGroup::new(retest_tasks).run(cancel).await;
                    self.check_canceled(cancel)?;
                    group.merge_retest(retest_group);
                }
            }
        }

        // Post-steps see the log captured so far and the report of the
        // main step through injected volumes.
        let report = self.build_report(&job, &group, started_at, started.elapsed());
        resources.set_captured_log(&self.logger.captured()).await?;
        resources.set_report(&report.to_json_pretty()?).await?;

        for step in &job.spec.post_steps {
            self.run_aux_step(cancel, &builder, &resources, "post", &step.name, &step.template)
                .await?;
        }

        resources
            .artifacts()
            .export_all(&self.logger)
            .map_err(ResourceError::from)?;

        Ok(self.build_report(&job, &group, started_at, started.elapsed()))
    }

    /// Run a pre- or post-step as one pod with no sharding. A failing
    /// step aborts the whole job.
    async fn run_aux_step(
        &self,
        cancel: &CancelToken,
        builder: &TaskBuilder,
        resources: &Arc<ResourceManager>,
        kind: &'static str,
        name: &str,
        template: &crate::config::TemplateSpec,
    ) -> Result<(), RunnerError> {
        self.logger.info(format!("run {}-step {}", kind, name));
        self.events
            .emit(Event::StepStarted {
                name: name.to_string(),
            })
            .await;
        resources
            .artifacts()
            .add_artifacts(&template.spec.artifacts)
            .map_err(ResourceError::from)?;
        let task = builder.build_single_task(name, template).await?;
        let result = task
            .run(cancel.clone())
            .await
            .map_err(|err| self.map_backend_error(err))?;
        self.check_canceled(cancel)?;
        if result.all_results().any(|r| r.failed()) {
            return Err(RunnerError::StepFailed {
                kind,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Evaluate the strategy's key list: the `--list` override wins, then
    /// a static source verbatim, then the dynamic step's captured stdout
    /// split on the delimiter and filtered.
    async fn evaluate_strategy_keys(
        &self,
        cancel: &CancelToken,
        job: &TestJob,
        builder: &TaskBuilder,
    ) -> Result<Vec<String>, RunnerError> {
        if let Some(keys) = &self.static_key_override {
            return Ok(keys.clone());
        }
        let Some(strategy) = &job.spec.main_step.strategy else {
            return Ok(Vec::new());
        };
        let source = &strategy.key.source;
        if !source.static_keys.is_empty() {
            return Ok(source.static_keys.clone());
        }
        let Some(dynamic) = &source.dynamic else {
            return Ok(Vec::new());
        };

        self.logger.info("evaluate dynamic strategy key source");
        let task = builder.build_single_task("list", &dynamic.template).await?;
        let result = task
            .run(cancel.clone())
            .await
            .map_err(|err| self.map_backend_error(err))?;
        self.check_canceled(cancel)?;

        let Some(list_result) = result.all_results().next() else {
            return Err(RunnerError::Strategy(
                "dynamic key source produced no result".to_string(),
            ));
        };
        if list_result.failed() {
            return Err(RunnerError::Strategy(format!(
                "dynamic key source failed: {}",
                String::from_utf8_lossy(&list_result.output)
            )));
        }

        let stdout = String::from_utf8_lossy(&list_result.output).into_owned();
        let delimiter = dynamic
            .delimiter
            .as_deref()
            .unwrap_or(DEFAULT_KEY_DELIMITER);
        let mut keys: Vec<String> = stdout
            .split(delimiter)
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .collect();

        if let Some(filter) = &dynamic.filter {
            // Validated at load time.
            let pattern = Regex::new(filter)
                .map_err(|err| RunnerError::Strategy(err.to_string()))?;
            keys.retain(|key| pattern.is_match(key));
        }

        if keys.is_empty() {
            self.logger.warn(
                "dynamic key source produced no keys after filtering; \
                 running the main step as a single subtask",
            );
        }
        Ok(keys)
    }

    fn build_report(
        &self,
        job: &TestJob,
        group: &TaskGroupResult,
        started_at: chrono::DateTime<Utc>,
        elapsed: std::time::Duration,
    ) -> Report {
        let mut report = Report::new(started_at, elapsed);
        report.status = if group.succeeded() {
            ResultStatus::Success
        } else {
            ResultStatus::Failure
        };
        report.total_num = group.total_num();
        report.success_num = group.success_num();
        report.failure_num = group.failure_num();
        report.details = group.to_report_details();
        report.ext = job.spec.log.ext_param.clone();
        report
    }

    fn check_canceled(&self, cancel: &CancelToken) -> Result<(), RunnerError> {
        if cancel.is_canceled() {
            Err(RunnerError::Canceled)
        } else {
            Ok(())
        }
    }

    fn map_backend_error(&self, err: BackendError) -> RunnerError {
        match err {
            BackendError::Canceled => RunnerError::Canceled,
            other => RunnerError::Backend(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpecLoader;
    use crate::logging::LogLevel;
    use std::collections::BTreeMap;

    fn runner(backend: Backend) -> Runner {
        Runner::new(
            backend,
            "default",
            Arc::new(Logger::new(LogLevel::Debug)),
        )
    }

    fn parse(yaml: &str) -> TestJob {
        SpecLoader::parse(yaml, &BTreeMap::new()).unwrap()
    }

    const ECHO_JOB: &str = r#"
spec:
  mainStep:
    template:
      metadata:
        generateName: test-
      spec:
        containers:
          - name: test
            command: [echo, hello]
            workingDir: /work
"#;

    #[tokio::test]
    async fn test_simple_job_succeeds() {
        let report = runner(Backend::local())
            .run(&CancelToken::new(), parse(ECHO_JOB))
            .await
            .unwrap();
        assert_eq!(report.status, ResultStatus::Success);
        assert_eq!(report.total_num, 1);
        assert_eq!(report.success_num, 1);
        assert_eq!(report.failure_num, 0);
        assert_eq!(report.details.len(), 1);
        assert_eq!(report.details[0].name, "test");
    }

    #[tokio::test]
    async fn test_failing_main_subtask_reports_failure() {
        let yaml = r#"
spec:
  mainStep:
    template:
      spec:
        containers:
          - name: test
            command: [sh, -c, "exit 1"]
            workingDir: /work
"#;
        let report = runner(Backend::local())
            .run(&CancelToken::new(), parse(yaml))
            .await
            .unwrap();
        assert_eq!(report.status, ResultStatus::Failure);
        assert_eq!(report.failure_num, 1);
    }

    #[tokio::test]
    async fn test_static_keys_shard_main_step() {
        let yaml = r#"
spec:
  mainStep:
    strategy:
      key:
        env: TEST
        source:
          static: [A, B, C]
      scheduler:
        maxContainersPerPod: 2
        maxConcurrentNumPerPod: 1
    template:
      spec:
        containers:
          - name: test
            command: [sh, -c, "echo $TEST"]
            workingDir: /work
"#;
        let report = runner(Backend::local())
            .run(&CancelToken::new(), parse(yaml))
            .await
            .unwrap();
        assert_eq!(report.status, ResultStatus::Success);
        assert_eq!(report.total_num, 3);
        let mut names: Vec<&str> = report.details.iter().map(|d| d.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_retest_recovers_flaky_key() {
        // Key B fails until a marker file exists, then succeeds; the
        // retest pass sees the marker and turns the aggregate green.
        let marker_dir = tempfile::tempdir().unwrap();
        let marker = marker_dir.path().join("retried");
        let yaml = format!(
            r#"
spec:
  mainStep:
    strategy:
      key:
        env: TEST
        source:
          static: [A, B, C, D]
      scheduler:
        maxConcurrentNumPerPod: 4
      retest: true
    template:
      spec:
        containers:
          - name: test
            command: [sh, -c]
            args:
              - 'if [ "$TEST" = B ] && [ ! -f {marker} ]; then touch {marker}; exit 1; fi'
            workingDir: /work
"#,
            marker = marker.display()
        );
        let report = runner(Backend::local())
            .run(&CancelToken::new(), parse(&yaml))
            .await
            .unwrap();
        assert_eq!(report.status, ResultStatus::Success);
        assert_eq!(report.total_num, 4);
        assert_eq!(report.success_num, 4);
    }

    #[tokio::test]
    async fn test_without_retest_failure_persists() {
        let yaml = r#"
spec:
  mainStep:
    strategy:
      key:
        env: TEST
        source:
          static: [A, B]
      scheduler:
        maxConcurrentNumPerPod: 2
    template:
      spec:
        containers:
          - name: test
            command: [sh, -c, 'test "$TEST" != B']
            workingDir: /work
"#;
        let report = runner(Backend::local())
            .run(&CancelToken::new(), parse(yaml))
            .await
            .unwrap();
        assert_eq!(report.status, ResultStatus::Failure);
        assert_eq!(report.success_num, 1);
        assert_eq!(report.failure_num, 1);
    }

    #[tokio::test]
    async fn test_dynamic_keys_with_filter() {
        let yaml = r#"
spec:
  mainStep:
    strategy:
      key:
        env: TEST
        source:
          dynamic:
            filter: "^Test"
            template:
              spec:
                containers:
                  - name: list
                    command: [sh, -c]
                    args: ["printf 'TestA\nTestB\nhelper\nTestC\n'"]
                    workingDir: /work
      scheduler:
        maxConcurrentNumPerPod: 4
    template:
      spec:
        containers:
          - name: test
            command: [sh, -c, "echo $TEST"]
            workingDir: /work
"#;
        let report = runner(Backend::local())
            .run(&CancelToken::new(), parse(yaml))
            .await
            .unwrap();
        assert_eq!(report.total_num, 3);
        let mut names: Vec<&str> = report.details.iter().map(|d| d.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["TestA", "TestB", "TestC"]);
    }

    #[tokio::test]
    async fn test_dynamic_source_failure_is_fatal() {
        let yaml = r#"
spec:
  mainStep:
    strategy:
      key:
        env: TEST
        source:
          dynamic:
            template:
              spec:
                containers:
                  - name: list
                    command: [sh, -c, "exit 1"]
                    workingDir: /work
      scheduler: {}
    template:
      spec:
        containers:
          - name: test
            command: [sh, -c, "echo $TEST"]
            workingDir: /work
"#;
        let err = runner(Backend::local())
            .run(&CancelToken::new(), parse(yaml))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Strategy(_)));
    }

    #[tokio::test]
    async fn test_dynamic_zero_matches_degenerates() {
        let yaml = r#"
spec:
  mainStep:
    strategy:
      key:
        env: TEST
        source:
          dynamic:
            filter: "^NoSuchPrefix"
            template:
              spec:
                containers:
                  - name: list
                    command: [sh, -c, "printf 'a\nb\n'"]
                    workingDir: /work
      scheduler: {}
    template:
      spec:
        containers:
          - name: test
            command: [echo, verbatim]
            workingDir: /work
"#;
        let report = runner(Backend::local())
            .run(&CancelToken::new(), parse(yaml))
            .await
            .unwrap();
        assert_eq!(report.status, ResultStatus::Success);
        assert_eq!(report.total_num, 1);
        assert_eq!(report.details[0].name, "test");
    }

    #[tokio::test]
    async fn test_list_override_wins_over_source() {
        let yaml = r#"
spec:
  mainStep:
    strategy:
      key:
        env: TEST
        source:
          static: [X, Y]
      scheduler:
        maxConcurrentNumPerPod: 2
    template:
      spec:
        containers:
          - name: test
            command: [sh, -c, "echo $TEST"]
            workingDir: /work
"#;
        let report = runner(Backend::local())
            .with_static_keys(vec!["P".to_string(), "Q".to_string(), "R".to_string()])
            .run(&CancelToken::new(), parse(yaml))
            .await
            .unwrap();
        assert_eq!(report.total_num, 3);
    }

    #[tokio::test]
    async fn test_pre_step_failure_aborts_job() {
        let yaml = r#"
spec:
  preSteps:
    - name: build
      template:
        spec:
          containers:
            - name: build
              command: [sh, -c, "exit 2"]
              workingDir: /work
  mainStep:
    template:
      spec:
        containers:
          - name: test
            command: [echo, unreachable]
            workingDir: /work
"#;
        let err = runner(Backend::local())
            .run(&CancelToken::new(), parse(yaml))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RunnerError::StepFailed { kind: "pre", .. }
        ));
    }

    #[tokio::test]
    async fn test_pre_step_artifact_flows_to_main_step() {
        let yaml = r#"
spec:
  preSteps:
    - name: build
      template:
        spec:
          containers:
            - name: build
              command: [sh, -c, "echo built > /work/build.log"]
              workingDir: /work
          artifacts:
            - name: build-log
              container:
                name: build
                path: /work/build.log
  mainStep:
    template:
      spec:
        containers:
          - name: test
            command: [cat, /work/build.log]
            workingDir: /work
            volumeMounts:
              - name: log-volume
                mountPath: /work/build.log
        volumes:
          - name: log-volume
            artifact:
              name: build-log
"#;
        let report = runner(Backend::local())
            .run(&CancelToken::new(), parse(yaml))
            .await
            .unwrap();
        assert_eq!(report.status, ResultStatus::Success);
    }

    #[tokio::test]
    async fn test_artifact_export_three_keys() {
        let export_dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
spec:
  mainStep:
    strategy:
      key:
        env: TEST
        source:
          static: [A, B, C]
      scheduler:
        maxConcurrentNumPerPod: 3
    template:
      spec:
        artifacts:
          - name: out
            container:
              name: test
              path: /work/artifact
        containers:
          - name: test
            command: [sh, -c, "echo $TEST > /work/artifact"]
            workingDir: /work
  exportArtifacts:
    - name: out
      path: {path}
"#,
            path = export_dir.path().display()
        );
        let report = runner(Backend::local())
            .run(&CancelToken::new(), parse(&yaml))
            .await
            .unwrap();
        assert_eq!(report.status, ResultStatus::Success);

        // One staged file per strategy key.
        let mut files = Vec::new();
        for entry in std::fs::read_dir(export_dir.path()).unwrap() {
            let entry = entry.unwrap();
            assert!(entry.file_type().unwrap().is_dir());
            for inner in std::fs::read_dir(entry.path()).unwrap() {
                files.push(inner.unwrap().path());
            }
        }
        assert_eq!(files.len(), 3);
    }

    #[tokio::test]
    async fn test_post_step_receives_log_and_report() {
        let out_dir = tempfile::tempdir().unwrap();
        let out = out_dir.path().join("seen");
        let yaml = format!(
            r#"
spec:
  mainStep:
    template:
      spec:
        containers:
          - name: test
            command: [echo, main-done]
            workingDir: /work
  postSteps:
    - name: publish
      template:
        spec:
          containers:
            - name: publish
              command: [sh, -c]
              args:
                - 'cat /work/report.json /work/shardtest.log > {out}'
              workingDir: /work
              volumeMounts:
                - name: report-volume
                  mountPath: /work/report.json
                - name: log-volume
                  mountPath: /work/shardtest.log
        volumes:
          - name: report-volume
            report:
              format: json
          - name: log-volume
            log: {{}}
"#,
            out = out.display()
        );
        let report = runner(Backend::local())
            .run(&CancelToken::new(), parse(&yaml))
            .await
            .unwrap();
        assert_eq!(report.status, ResultStatus::Success);
        let seen = std::fs::read_to_string(&out).unwrap();
        assert!(seen.contains("\"totalNum\": 1"));
        assert!(seen.contains("main-done"));
    }

    #[tokio::test]
    async fn test_dry_run_end_to_end() {
        let yaml = r#"
spec:
  mainStep:
    strategy:
      key:
        env: TEST
        source:
          static: [A, B, C]
      scheduler:
        maxContainersPerPod: 2
    template:
      spec:
        containers:
          - name: test
            command: [sh, -c, "echo $TEST"]
            workingDir: /work
"#;
        let report = runner(Backend::dry_run())
            .run(&CancelToken::new(), parse(yaml))
            .await
            .unwrap();
        assert_eq!(report.status, ResultStatus::Success);
        assert_eq!(report.total_num, 3);
    }

    #[tokio::test]
    async fn test_validation_error_before_side_effects() {
        let yaml = r#"
spec:
  mainStep:
    template:
      spec:
        containers:
          - name: test
            command: ["true"]
  exportArtifacts:
    - name: missing
      path: /tmp/out
"#;
        let err = runner(Backend::local())
            .run(&CancelToken::new(), parse_invalid(yaml))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_canceled_job_surfaces_cancellation() {
        let yaml = r#"
spec:
  mainStep:
    template:
      spec:
        containers:
          - name: test
            command: [sleep, "30"]
            workingDir: /work
"#;
        let cancel = CancelToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            trip.cancel();
        });
        let started = Instant::now();
        let err = runner(Backend::local())
            .run(&cancel, parse(yaml))
            .await
            .unwrap_err();
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn test_ext_params_copied_into_report() {
        let yaml = r#"
spec:
  mainStep:
    template:
      spec:
        containers:
          - name: test
            command: [echo, ok]
            workingDir: /work
  log:
    extParam:
      branch: main
      suite: unit
"#;
        let report = runner(Backend::local())
            .run(&CancelToken::new(), parse(yaml))
            .await
            .unwrap();
        assert_eq!(report.ext.get("branch").map(String::as_str), Some("main"));
        assert_eq!(report.ext.get("suite").map(String::as_str), Some("unit"));
    }

    // Decode without validation so Runner::run exercises its own
    // validation path.
    fn parse_invalid(yaml: &str) -> TestJob {
        serde_yaml::from_str(yaml).unwrap()
    }
}
