/// Desired state served by the control plane over HTTP
use super::{DesiredStateProvider, NOTIFY_CAPACITY};
use crate::app_spec::{AppStatus, DesiredState};
use crate::error::ReconcileError;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Serialize)]
struct StatusUpdate<'a> {
    status: &'a str,
}

pub struct HttpStateProvider {
    base_url: String,
    client: reqwest::Client,
    // The control plane has no push channel; the sender only keeps receivers open.
    notify_tx: broadcast::Sender<()>,
}

impl HttpStateProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ReconcileError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReconcileError::Validation(format!("Failed to build HTTP client: {}", e)))?;
        let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            notify_tx,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn decode(response: reqwest::Response) -> Result<DesiredState, ReconcileError> {
        let status = response.status();
        if !status.is_success() {
            let url = response.url().to_string();
            return Err(ReconcileError::State(format!(
                "Control plane returned {} for {}",
                status, url
            )));
        }
        response
            .json::<DesiredState>()
            .await
            .map_err(|e| ReconcileError::State(format!("Invalid desired state: {}", e)))
    }
}

#[async_trait]
impl DesiredStateProvider for HttpStateProvider {
    async fn get_state(&self) -> Result<DesiredState, ReconcileError> {
        let response = self.client.get(self.url("state")).send().await?;
        Self::decode(response).await
    }

    async fn update_status(&self, status: AppStatus) -> Result<DesiredState, ReconcileError> {
        tracing::debug!("[HttpStateProvider] Reporting status {}", status);
        let response = self
            .client
            .put(self.url("status"))
            .json(&StatusUpdate {
                status: status.as_str(),
            })
            .send()
            .await?;
        Self::decode(response).await
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify_tx.subscribe()
    }
}
