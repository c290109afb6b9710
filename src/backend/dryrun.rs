//! Dry-run realization: validates a job's wiring end-to-end without
//! creating pods, processes or files. Every exec returns the fixed
//! dry-run output; intended actions are recorded at debug level.

use super::{BackendError, CancelToken, Executor, HandlerFuture, PodRequest};

#[derive(Clone, Default)]
pub struct DryRunBackend;

impl DryRunBackend {
    pub fn new() -> Self {
        Self
    }

    pub fn build_pod(&self, request: PodRequest) -> DryRunPod {
        DryRunPod { request }
    }
}

pub struct DryRunPod {
    request: PodRequest,
}

impl DryRunPod {
    pub fn name(&self) -> &str {
        &self.request.name
    }

    pub async fn run_with_handler<'a, F>(
        &'a mut self,
        _cancel: &'a CancelToken,
        handler: F,
    ) -> Result<(), BackendError>
    where
        F: FnOnce(Vec<Executor>) -> HandlerFuture<'a> + Send + 'a,
    {
        for container in &self.request.init_containers {
            tracing::debug!(
                "dry-run: would run init container {} in pod {}",
                container.name,
                self.request.name
            );
        }
        for mount in &self.request.mounts {
            tracing::debug!(
                "dry-run: would mount {} from {}",
                mount.volume,
                mount.source.display()
            );
        }
        let executors: Vec<Executor> = self
            .request
            .containers
            .iter()
            .map(|container| Executor::dry_run(container.clone(), self.request.name.clone()))
            .collect();
        handler(executors).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, DRY_RUN_OUTPUT};
    use crate::config::ContainerSpec;

    #[tokio::test]
    async fn test_dry_run_output_is_fixed() {
        let backend = Backend::dry_run();
        let mut pod = backend
            .build_pod(PodRequest {
                name: "dry".to_string(),
                namespace: "default".to_string(),
                init_containers: Vec::new(),
                containers: vec![ContainerSpec {
                    name: "test".to_string(),
                    command: vec!["anything".to_string()],
                    ..Default::default()
                }],
                mounts: Vec::new(),
            })
            .await
            .unwrap();

        let cancel = CancelToken::new();
        let mut captured = Vec::new();
        pod.run_with_handler(&cancel, |execs| {
            let out = &mut captured;
            Box::pin(async move {
                out.extend_from_slice(&execs[0].output(&CancelToken::new()).await?);
                Ok(())
            })
        })
        .await
        .unwrap();

        assert_eq!(captured, DRY_RUN_OUTPUT);
    }
}
