/// Best-effort container teardown
use crate::common::{ContainerError, RuntimeClient};
use crate::error::ReconcileError;
use futures::future::join_all;
use std::sync::Arc;

#[derive(Clone)]
pub struct Cleanup {
    runtime: Arc<dyn RuntimeClient>,
}

impl Cleanup {
    pub fn new(runtime: Arc<dyn RuntimeClient>) -> Self {
        Self { runtime }
    }

    /// Stop then remove every container in `ids`, concurrently.
    ///
    /// Stop errors are logged and removal is still attempted. Removal of a container that
    /// is already gone counts as success. Returns the first other removal error.
    pub async fn eliminate_containers(&self, ids: &[String]) -> Result<(), ReconcileError> {
        if ids.is_empty() {
            return Ok(());
        }

        let results = join_all(ids.iter().map(|id| self.eliminate_one(id))).await;

        match results.into_iter().find_map(Result::err) {
            Some(e) => Err(ReconcileError::Runtime(e)),
            None => Ok(()),
        }
    }

    async fn eliminate_one(&self, id: &str) -> Result<(), ContainerError> {
        if let Err(e) = self.runtime.stop_container(id).await {
            tracing::debug!("[Cleanup] Stop of {} failed, removing anyway: {}", id, e);
        }

        match self.runtime.remove_container(id).await {
            Ok(()) => {
                tracing::info!("[Cleanup] Removed container {}", id);
                Ok(())
            }
            Err(e) if e.is_already_gone() => {
                tracing::debug!("[Cleanup] Container {} already gone: {}", id, e);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("[Cleanup] Failed to remove container {}: {}", id, e);
                Err(e)
            }
        }
    }

    /// Ids of all containers (running or not) registered as `name`
    pub async fn find_by_name(&self, name: &str) -> Result<Vec<String>, ReconcileError> {
        let registered = format!("/{}", name);
        let containers = self.runtime.list_containers(true).await?;

        Ok(containers
            .into_iter()
            .filter(|c| c.names.iter().any(|n| *n == registered))
            .map(|c| c.id)
            .collect())
    }

    /// Eliminate every container registered as `name`, to free the name for reuse.
    pub async fn eliminate_by_name(&self, name: &str) -> Result<(), ReconcileError> {
        let ids = self.find_by_name(name).await?;
        if !ids.is_empty() {
            tracing::info!(
                "[Cleanup] Eliminating {} container(s) named {}",
                ids.len(),
                name
            );
        }
        self.eliminate_containers(&ids).await
    }
}
