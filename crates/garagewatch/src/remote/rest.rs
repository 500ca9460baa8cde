use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use tracing::info;

use super::RemoteStateClient;
use crate::config::RemoteConfig;
use crate::entity::EntityState;
use crate::error::Result;
use crate::error::SyncError;

/// Entity state as returned by the REST API.
#[derive(Debug, Deserialize)]
struct RawState {
    #[serde(alias = "entityId")]
    entity_id: String,
    state: String,
}

impl TryFrom<RawState> for EntityState {
    type Error = SyncError;

    fn try_from(raw: RawState) -> Result<Self> {
        EntityState::from_raw(raw.entity_id, &raw.state)
    }
}

/// RemoteStateClient over a Home-Assistant-style REST API.
pub struct HassRestClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HassRestClient {
    pub fn new(config: &RemoteConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("garagewatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::from_reqwest(http, config, timeout))
    }

    pub fn from_reqwest(http: reqwest::Client, config: &RemoteConfig, timeout: Duration) -> Self {
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            timeout,
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<String> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| self.transport_error(e))?;
        if !status.is_success() {
            return Err(SyncError::RemoteRejected(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }
        Ok(body)
    }

    fn transport_error(&self, e: reqwest::Error) -> SyncError {
        if e.is_timeout() {
            SyncError::RequestTimeout(self.timeout)
        } else if e.is_decode() {
            SyncError::MalformedReply(e.to_string())
        } else {
            debug!("HTTP transport error: {}", e);
            SyncError::TransportUnreachable(self.base_url.clone())
        }
    }
}

#[async_trait]
impl RemoteStateClient for HassRestClient {
    async fn fetch_state(&self, entity_id: &str) -> Result<EntityState> {
        let url = format!("{}/api/states/{}", self.base_url, entity_id);
        debug!("GET {}", url);
        let body = self.send(self.http.get(&url)).await?;
        let raw: RawState = serde_json::from_str(&body)?;
        raw.try_into()
    }

    async fn invoke_command(&self, entity_id: &str, closed_or_off: bool) -> Result<EntityState> {
        let (domain, _) = entity_id
            .split_once('.')
            .ok_or_else(|| SyncError::UnknownEntity(entity_id.to_string()))?;
        let service = if closed_or_off { "turn_off" } else { "turn_on" };
        let url = format!("{}/api/services/{}/{}", self.base_url, domain, service);
        info!("Calling {}.{} for {}", domain, service, entity_id);

        let body = self
            .send(
                self.http
                    .post(&url)
                    .json(&serde_json::json!({ "entity_id": entity_id })),
            )
            .await?;

        // The service call lists the states it changed; it may be empty if
        // the entity was already in the requested state.
        let changed: Vec<RawState> = serde_json::from_str(&body)?;
        match changed.into_iter().find(|s| s.entity_id == entity_id) {
            Some(raw) => raw.try_into(),
            None => {
                debug!("{} not in service reply, fetching", entity_id);
                self.fetch_state(entity_id).await
            }
        }
    }
}
