//! Job spec model, loading and validation.

mod loader;
mod types;

pub use loader::{load_key_list, ConfigError, SpecLoader};
pub use types::{
    AppInstallationTokenSource, ArtifactContainer, ArtifactSpec, ArtifactVolumeSource,
    ContainerSpec, DynamicKeySource, EmptyDirVolumeSource, EnvVar, ExportArtifact,
    FileTokenSource, LogSpec, LogVolumeSource, MainStep, MergeSpec, Metadata, NamedStep,
    PodTemplateSpec, ReportFormat, ReportVolumeSource, RepoVolumeSource, Repository,
    RepositorySpec, SchedulerSpec, SecretRef, Strategy, StrategyKeySource, StrategyKeySpec,
    TemplateSpec, TestJob, TestJobSpec, TokenSource, TokenSpec, TokenVolumeSource, VolumeMount,
    VolumeSource, VolumeSourceKind, VolumeSpec,
};
