//! Job spec loading and validation.
//!
//! Loading applies `{{key}}` template substitutions to the raw file before
//! decoding, accepts YAML or JSON, and validates every cross-reference
//! before the engine is allowed to produce any side effect.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;

use super::types::{TemplateSpec, TestJob};

/// Errors produced while loading or validating a job spec.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode job spec: {0}")]
    Decode(#[from] serde_yaml::Error),

    #[error("invalid job spec: {0}")]
    Invalid(String),
}

/// Loader for job spec files.
pub struct SpecLoader;

impl SpecLoader {
    /// Load a job spec from a file, applying `{{key}}` substitutions.
    pub fn load_file(
        path: impl AsRef<Path>,
        substitutions: &BTreeMap<String, String>,
    ) -> Result<TestJob, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, substitutions)
    }

    /// Parse a job spec from a YAML or JSON string.
    pub fn parse(
        content: &str,
        substitutions: &BTreeMap<String, String>,
    ) -> Result<TestJob, ConfigError> {
        let substituted = Self::substitute(content, substitutions);
        // serde_yaml handles JSON input as well (JSON is a YAML subset).
        let job: TestJob = serde_yaml::from_str(&substituted)?;
        Self::validate(&job)?;
        Ok(job)
    }

    fn substitute(content: &str, substitutions: &BTreeMap<String, String>) -> String {
        let mut out = content.to_string();
        for (key, value) in substitutions {
            out = out.replace(&format!("{{{{{}}}}}", key), value);
        }
        out
    }

    /// Validate name uniqueness and every cross-reference in the job.
    pub fn validate(job: &TestJob) -> Result<(), ConfigError> {
        let spec = &job.spec;

        let repo_names = Self::unique_names(
            spec.repos.iter().map(|r| r.name.as_str()),
            "repository",
        )?;
        let token_names =
            Self::unique_names(spec.tokens.iter().map(|t| t.name.as_str()), "token")?;
        Self::unique_names(spec.pre_steps.iter().map(|s| s.name.as_str()), "pre-step")?;
        Self::unique_names(spec.post_steps.iter().map(|s| s.name.as_str()), "post-step")?;

        for token in &spec.tokens {
            if token.value.set_count() != 1 {
                return Err(ConfigError::Invalid(format!(
                    "token {} must declare exactly one source",
                    token.name
                )));
            }
        }

        for repo in &spec.repos {
            if let Some(token) = &repo.value.token {
                if !token_names.contains(token.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "repository {} references undefined token {}",
                        repo.name, token
                    )));
                }
            }
        }

        // Artifact names are unique across the whole job.
        let mut artifact_names = HashSet::new();
        let all_templates = Self::all_templates(job);
        for template in &all_templates {
            for artifact in &template.spec.artifacts {
                if !artifact_names.insert(artifact.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate artifact name: {}",
                        artifact.name
                    )));
                }
            }
        }

        for template in &all_templates {
            Self::validate_template(template, &repo_names, &token_names, &artifact_names)?;
        }

        if spec.main_step.template.spec.containers.is_empty() {
            return Err(ConfigError::Invalid(
                "main step must declare at least one container".to_string(),
            ));
        }

        for export in &spec.export_artifacts {
            if !artifact_names.contains(export.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "exportArtifacts references undefined artifact {}",
                    export.name
                )));
            }
        }

        if let Some(strategy) = &spec.main_step.strategy {
            if strategy.key.env.is_empty() {
                return Err(ConfigError::Invalid(
                    "strategy key env name must not be empty".to_string(),
                ));
            }
            let scheduler = &strategy.scheduler;
            if scheduler.max_containers_per_pod > 0 && scheduler.max_pod_num > 0 {
                return Err(ConfigError::Invalid(
                    "maxContainersPerPod and maxPodNum cannot both be set".to_string(),
                ));
            }
            if let Some(dynamic) = &strategy.key.source.dynamic {
                if let Some(filter) = &dynamic.filter {
                    regex::Regex::new(filter).map_err(|e| {
                        ConfigError::Invalid(format!(
                            "strategy key filter is not a valid regex: {}",
                            e
                        ))
                    })?;
                }
                if dynamic.template.spec.containers.is_empty() {
                    return Err(ConfigError::Invalid(
                        "dynamic key source must declare at least one container".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    fn all_templates(job: &TestJob) -> Vec<&TemplateSpec> {
        let spec = &job.spec;
        let mut templates: Vec<&TemplateSpec> = Vec::new();
        templates.extend(spec.pre_steps.iter().map(|s| &s.template));
        templates.push(&spec.main_step.template);
        if let Some(strategy) = &spec.main_step.strategy {
            if let Some(dynamic) = &strategy.key.source.dynamic {
                templates.push(&dynamic.template);
            }
        }
        templates.extend(spec.post_steps.iter().map(|s| &s.template));
        templates
    }

    fn validate_template(
        template: &TemplateSpec,
        repo_names: &HashSet<&str>,
        token_names: &HashSet<&str>,
        artifact_names: &HashSet<&str>,
    ) -> Result<(), ConfigError> {
        let mut container_names = HashSet::new();
        for container in template
            .spec
            .containers
            .iter()
            .chain(template.spec.init_containers.iter())
        {
            if container.name.is_empty() {
                return Err(ConfigError::Invalid(
                    "container name must not be empty".to_string(),
                ));
            }
            if !container_names.insert(container.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate container name: {}",
                    container.name
                )));
            }
        }

        if template.spec.containers.len() > 1 && template.main.is_none() {
            return Err(ConfigError::Invalid(format!(
                "template {} has multiple containers but no main container name",
                template.metadata.base_name("<unnamed>")
            )));
        }
        if let Some(main) = &template.main {
            if !template.spec.containers.iter().any(|c| &c.name == main) {
                return Err(ConfigError::Invalid(format!(
                    "main container {} is not declared in the template",
                    main
                )));
            }
        }

        let mut volume_names = HashSet::new();
        for volume in &template.spec.volumes {
            if !volume_names.insert(volume.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate volume name: {}",
                    volume.name
                )));
            }
            if volume.source.set_count() != 1 {
                return Err(ConfigError::Invalid(format!(
                    "volume {} must declare exactly one source",
                    volume.name
                )));
            }
            if let Some(repo) = &volume.source.repo {
                if !repo_names.contains(repo.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "volume {} references undefined repository {}",
                        volume.name, repo.name
                    )));
                }
            }
            if let Some(token) = &volume.source.token {
                if !token_names.contains(token.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "volume {} references undefined token {}",
                        volume.name, token.name
                    )));
                }
            }
            if let Some(artifact) = &volume.source.artifact {
                if !artifact_names.contains(artifact.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "volume {} references undefined artifact {}",
                        volume.name, artifact.name
                    )));
                }
            }
        }

        for container in template
            .spec
            .containers
            .iter()
            .chain(template.spec.init_containers.iter())
        {
            for mount in &container.volume_mounts {
                if !volume_names.contains(mount.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "container {} mounts undeclared volume {}",
                        container.name, mount.name
                    )));
                }
            }
        }

        for artifact in &template.spec.artifacts {
            if !container_names.contains(artifact.container.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "artifact {} references undefined container {}",
                    artifact.name, artifact.container.name
                )));
            }
        }

        Ok(())
    }

    fn unique_names<'a>(
        names: impl Iterator<Item = &'a str>,
        kind: &str,
    ) -> Result<HashSet<&'a str>, ConfigError> {
        let mut seen = HashSet::new();
        for name in names {
            if !seen.insert(name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate {} name: {}",
                    kind, name
                )));
            }
        }
        Ok(seen)
    }
}

/// Read a newline-separated static key list (the `--list` override),
/// dropping blank lines.
pub fn load_key_list(path: impl AsRef<Path>) -> Result<Vec<String>, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let keys: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    if keys.is_empty() {
        return Err(ConfigError::Invalid(
            "key list file contains no keys".to_string(),
        ));
    }
    Ok(keys)
}
