//! Serde model of the job spec.
//!
//! Field names follow the persisted camelCase wire format; the spec file
//! may be YAML or JSON. Templates carry a subset of a standard pod spec
//! plus the engine-only extensions: `main`, the volume source
//! discriminators and `artifacts`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level job document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestJob {
    #[serde(default)]
    pub metadata: Metadata,
    pub spec: TestJobSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
}

impl Metadata {
    /// Display/prefix name: `name`, else `generateName`, else a fallback.
    pub fn base_name(&self, fallback: &str) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        if let Some(generate) = &self.generate_name {
            return generate.trim_end_matches('-').to_string();
        }
        fallback.to_string()
    }
}

/// Desired behavior of one orchestrator invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestJobSpec {
    #[serde(default)]
    pub tokens: Vec<TokenSpec>,
    #[serde(default)]
    pub repos: Vec<RepositorySpec>,
    #[serde(default)]
    pub pre_steps: Vec<NamedStep>,
    pub main_step: MainStep,
    #[serde(default)]
    pub post_steps: Vec<NamedStep>,
    #[serde(default)]
    pub export_artifacts: Vec<ExportArtifact>,
    #[serde(default)]
    pub log: LogSpec,
}

/// A named pre- or post-step, run as a single pod with no sharding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedStep {
    pub name: String,
    pub template: TemplateSpec,
}

/// The main testing step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MainStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    pub template: TemplateSpec,
}

/// Pod template for a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    #[serde(default)]
    pub metadata: Metadata,
    /// Name of the primary container. Required when the template holds
    /// more than one main-candidate container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    pub spec: PodTemplateSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub init_containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
}

/// Subset of a standard container spec the engine understands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

impl ContainerSpec {
    /// Full command line: `command` followed by `args`.
    pub fn command_line(&self) -> Vec<String> {
        let mut cmd = self.command.clone();
        cmd.extend(self.args.iter().cloned());
        cmd
    }

    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

/// Volume with an engine source discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    pub name: String,
    #[serde(flatten)]
    pub source: VolumeSource,
}

/// Exactly one of the fields is expected to be set; validation enforces it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<RepoVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<ReportVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,
}

impl VolumeSource {
    pub fn kind(&self) -> VolumeSourceKind {
        if self.repo.is_some() {
            VolumeSourceKind::Repo
        } else if self.token.is_some() {
            VolumeSourceKind::Token
        } else if self.artifact.is_some() {
            VolumeSourceKind::Artifact
        } else if self.log.is_some() {
            VolumeSourceKind::Log
        } else if self.report.is_some() {
            VolumeSourceKind::Report
        } else if self.empty_dir.is_some() {
            VolumeSourceKind::EmptyDir
        } else {
            VolumeSourceKind::None
        }
    }

    pub fn set_count(&self) -> usize {
        [
            self.repo.is_some(),
            self.token.is_some(),
            self.artifact.is_some(),
            self.log.is_some(),
            self.report.is_some(),
            self.empty_dir.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeSourceKind {
    Repo,
    Token,
    Artifact,
    Log,
    Report,
    EmptyDir,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoVolumeSource {
    /// This must match the name of a repository.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenVolumeSource {
    /// This must match the name of a token.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactVolumeSource {
    /// This must match the name of an artifact declared by an earlier step.
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogVolumeSource {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportVolumeSource {
    #[serde(default)]
    pub format: ReportFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyDirVolumeSource {}

/// A file produced by a container and staged for later steps or export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSpec {
    pub name: String,
    pub container: ArtifactContainer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactContainer {
    pub name: String,
    pub path: String,
}

/// Copy a staged artifact to a filesystem destination at job end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportArtifact {
    pub name: String,
    pub path: String,
}

/// Named authentication token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSpec {
    pub name: String,
    pub value: TokenSource,
}

/// Exactly one origin is expected to be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileTokenSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_installation: Option<AppInstallationTokenSource>,
}

impl TokenSource {
    pub fn set_count(&self) -> usize {
        [
            self.secret_ref.is_some(),
            self.file.is_some(),
            self.app_installation.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}

/// Reference to a key inside a cluster secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub name: String,
    pub key: String,
}

/// Token read from a local file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTokenSource {
    pub path: String,
}

/// Token minted through an app installation; the actual exchange is
/// delegated to an external fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInstallationTokenSource {
    pub app_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    pub key_file: SecretRef,
}

/// Named source repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    pub name: String,
    pub value: Repository,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// This must match the name of a token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeSpec>,
}

/// Merge the base branch into the checkout before testing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeSpec {
    pub base: String,
}

/// Sharding strategy for the main step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    pub key: StrategyKeySpec,
    #[serde(default)]
    pub scheduler: SchedulerSpec,
    /// Re-run failed keys once with concurrency forced to 1.
    #[serde(default)]
    pub retest: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyKeySpec {
    /// Env variable the key is bound to in each cloned container.
    pub env: String,
    pub source: StrategyKeySource,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyKeySource {
    #[serde(default, rename = "static")]
    pub static_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic: Option<DynamicKeySource>,
}

/// A one-off step whose stdout yields the key list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicKeySource {
    pub template: TemplateSpec,
    /// Key delimiter, default newline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
    /// Optional regex; only matching keys are kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Scheduler caps. Zero means "no cap" for the per-pod values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSpec {
    #[serde(default)]
    pub max_containers_per_pod: usize,
    #[serde(default)]
    pub max_pod_num: usize,
    #[serde(default)]
    pub max_concurrent_num_per_pod: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSpec {
    #[serde(default)]
    pub ext_param: BTreeMap<String, String>,
}
