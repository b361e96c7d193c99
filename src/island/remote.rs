use super::client::IslandClient;
use super::protocol::{IslandCommand, IslandReply};
use super::IslandError;
use crate::handlers::ErrorResponse;
use std::future::Future;

/// An island served by `arboreal worker` on another process or host.
#[derive(Clone)]
pub struct RemoteIsland {
    endpoint: String,
    client: reqwest::Client,
}

impl RemoteIsland {
    /// `endpoint` is the worker's base URL, e.g. `http://10.0.0.7:7070`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        RemoteIsland {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl IslandClient for RemoteIsland {
    fn send(
        &self,
        command: IslandCommand,
    ) -> impl Future<Output = Result<IslandReply, IslandError>> + Send {
        let url = format!("{}/command", self.endpoint);
        let client = self.client.clone();
        async move {
            let response = client
                .post(&url)
                .json(&command)
                .send()
                .await
                .map_err(|e| IslandError::Transport(format!("{}: {}", command.name(), e)))?;

            let status = response.status();
            if status.is_success() {
                return response
                    .json::<IslandReply>()
                    .await
                    .map_err(|e| IslandError::Transport(e.to_string()));
            }
            let message = match response.json::<ErrorResponse>().await {
                Ok(body) => body.error,
                Err(_) => status.to_string(),
            };
            Err(IslandError::Remote(message))
        }
    }
}
