//! Token resolution.
//!
//! Tokens resolve lazily on first lookup and are cached for the rest of
//! the job. Every resolved value is registered with the log mask before it
//! is handed to anyone.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::{AppInstallationTokenSource, TokenSource, TokenSpec};
use crate::logging::Logger;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token {0} is undefined")]
    Undefined(String),

    #[error("token {name} declares no usable source")]
    NoSource { name: String },

    #[error("failed to read secret {name}: {reason}")]
    Secret { name: String, reason: String },

    #[error("failed to read token file {path}: {reason}")]
    File { path: String, reason: String },

    #[error("app installation token fetch failed: {0}")]
    Fetch(String),

    #[error("secret source is unavailable outside cluster mode")]
    SecretUnavailable,
}

/// A resolved token. `key` names the file the token appears as when
/// mounted into a pod.
#[derive(Debug, Clone)]
pub struct ResolvedToken {
    pub key: String,
    pub value: String,
}

/// Exchange seam for app-installation tokens. The concrete identity
/// provider lives outside the engine.
#[async_trait]
pub trait InstallationTokenFetcher: Send + Sync {
    async fn fetch(
        &self,
        source: &AppInstallationTokenSource,
        private_key: &str,
    ) -> Result<String, TokenError>;
}

/// Default fetcher: reports the source as unavailable.
pub struct NullInstallationTokenFetcher;

#[async_trait]
impl InstallationTokenFetcher for NullInstallationTokenFetcher {
    async fn fetch(
        &self,
        _source: &AppInstallationTokenSource,
        _private_key: &str,
    ) -> Result<String, TokenError> {
        Err(TokenError::Fetch(
            "no installation token fetcher is configured".to_string(),
        ))
    }
}

/// Where secret references are read from.
#[derive(Clone)]
pub enum SecretReader {
    Cluster { client: Client, namespace: String },
    Unavailable,
}

impl SecretReader {
    async fn read(&self, name: &str, key: &str) -> Result<String, TokenError> {
        match self {
            SecretReader::Cluster { client, namespace } => {
                let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
                let secret = secrets.get(name).await.map_err(|err| TokenError::Secret {
                    name: name.to_string(),
                    reason: err.to_string(),
                })?;
                let data = secret
                    .data
                    .as_ref()
                    .and_then(|d| d.get(key))
                    .ok_or_else(|| TokenError::Secret {
                        name: name.to_string(),
                        reason: format!("key {} not found", key),
                    })?;
                Ok(String::from_utf8_lossy(&data.0).trim().to_string())
            }
            SecretReader::Unavailable => Err(TokenError::SecretUnavailable),
        }
    }
}

/// Name → resolved token map with lazy resolution.
pub struct TokenManager {
    specs: HashMap<String, TokenSource>,
    cache: Mutex<HashMap<String, ResolvedToken>>,
    secret_reader: SecretReader,
    fetcher: Arc<dyn InstallationTokenFetcher>,
    logger: Arc<Logger>,
}

impl TokenManager {
    pub fn new(specs: &[TokenSpec], secret_reader: SecretReader, logger: Arc<Logger>) -> Self {
        Self {
            specs: specs
                .iter()
                .map(|t| (t.name.clone(), t.value.clone()))
                .collect(),
            cache: Mutex::new(HashMap::new()),
            secret_reader,
            fetcher: Arc::new(NullInstallationTokenFetcher),
            logger,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn InstallationTokenFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Resolve a token by name, caching the value and registering it with
    /// the log mask.
    pub async fn resolve(&self, name: &str) -> Result<ResolvedToken, TokenError> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.get(name) {
            return Ok(token.clone());
        }
        let source = self
            .specs
            .get(name)
            .ok_or_else(|| TokenError::Undefined(name.to_string()))?;
        let token = self.resolve_source(name, source).await?;
        self.logger.add_mask(token.value.clone());
        cache.insert(name.to_string(), token.clone());
        Ok(token)
    }

    async fn resolve_source(
        &self,
        name: &str,
        source: &TokenSource,
    ) -> Result<ResolvedToken, TokenError> {
        if let Some(secret_ref) = &source.secret_ref {
            let value = self
                .secret_reader
                .read(&secret_ref.name, &secret_ref.key)
                .await?;
            return Ok(ResolvedToken {
                key: secret_ref.key.clone(),
                value,
            });
        }
        if let Some(file) = &source.file {
            let value =
                std::fs::read_to_string(&file.path).map_err(|err| TokenError::File {
                    path: file.path.clone(),
                    reason: err.to_string(),
                })?;
            let key = Path::new(&file.path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.to_string());
            return Ok(ResolvedToken {
                key,
                value: value.trim_end().to_string(),
            });
        }
        if let Some(app) = &source.app_installation {
            let private_key = self
                .secret_reader
                .read(&app.key_file.name, &app.key_file.key)
                .await?;
            let value = self.fetcher.fetch(app, &private_key).await?;
            return Ok(ResolvedToken {
                key: name.to_string(),
                value,
            });
        }
        Err(TokenError::NoSource {
            name: name.to_string(),
        })
    }
}
