//! REST transport for a hosted cloud store.
//!
//! Paths:
//! - `/v1/tenants/{ownerId}/{collection}` and `/v1/tenants/{ownerId}/{collection}/{id}`
//! - `/v1/inviteCodes/{code}` and `/v1/inviteCodes/{code}/consume`
//! - `/v1/driverLinks/{deviceId}`

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CloudDocument, CloudStore, ConsumeOutcome};
use crate::errors::AppError;
use crate::models::{DriverLink, InviteCode};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Body of a collection listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentList {
    pub documents: Vec<CloudDocument>,
}

/// Body of an invite consumption request. The server stamps `usedAt` and
/// judges expiry by its own clock.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub device_id: String,
}

pub struct HttpCloudStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpCloudStore {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    fn tenant_url(&self, owner_id: &str, collection: &str) -> String {
        self.url(&format!("tenants/{}/{}", owner_id, collection))
    }

    fn with_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, AppError> {
        Ok(self.with_auth(request).send().await?)
    }
}

fn unexpected(response: &Response) -> AppError {
    let status = response.status();
    tracing::warn!(status = status.as_u16(), url = %response.url(), "Unexpected cloud response");
    AppError::Sync(format!("Cloud store returned {}", status))
}

#[async_trait]
impl CloudStore for HttpCloudStore {
    async fn set_document(
        &self,
        owner_id: &str,
        collection: &str,
        doc_id: &str,
        data: Value,
    ) -> Result<(), AppError> {
        let url = format!("{}/{}", self.tenant_url(owner_id, collection), doc_id);
        let response = self.send(self.client.put(url).json(&data)).await?;
        if !response.status().is_success() {
            return Err(unexpected(&response));
        }
        Ok(())
    }

    async fn get_document(
        &self,
        owner_id: &str,
        collection: &str,
        doc_id: &str,
    ) -> Result<Option<CloudDocument>, AppError> {
        let url = format!("{}/{}", self.tenant_url(owner_id, collection), doc_id);
        let response = self.send(self.client.get(url)).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            _ => Err(unexpected(&response)),
        }
    }

    async fn list_documents(
        &self,
        owner_id: &str,
        collection: &str,
    ) -> Result<Vec<CloudDocument>, AppError> {
        let response = self
            .send(self.client.get(self.tenant_url(owner_id, collection)))
            .await?;
        if !response.status().is_success() {
            return Err(unexpected(&response));
        }
        let list: DocumentList = response.json().await?;
        Ok(list.documents)
    }

    async fn get_invite(&self, code: &str) -> Result<Option<InviteCode>, AppError> {
        let url = self.url(&format!("inviteCodes/{}", code));
        let response = self.send(self.client.get(url)).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            _ => Err(unexpected(&response)),
        }
    }

    async fn create_invite(&self, invite: &InviteCode) -> Result<bool, AppError> {
        let url = self.url(&format!("inviteCodes/{}", invite.code));
        let response = self.send(self.client.put(url).json(invite)).await?;
        match response.status() {
            StatusCode::CONFLICT => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(unexpected(&response)),
        }
    }

    async fn consume_invite(
        &self,
        code: &str,
        device_id: &str,
        _used_at: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, AppError> {
        let url = self.url(&format!("inviteCodes/{}/consume", code));
        let body = ConsumeRequest {
            device_id: device_id.to_string(),
        };
        let response = self.send(self.client.post(url).json(&body)).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(ConsumeOutcome::NotFound),
            StatusCode::CONFLICT => Ok(ConsumeOutcome::AlreadyUsed),
            StatusCode::GONE => Ok(ConsumeOutcome::Expired),
            status if status.is_success() => Ok(ConsumeOutcome::Consumed),
            _ => Err(unexpected(&response)),
        }
    }

    async fn put_driver_link(&self, link: &DriverLink) -> Result<(), AppError> {
        let url = self.url(&format!("driverLinks/{}", link.device_id));
        let response = self.send(self.client.put(url).json(link)).await?;
        if !response.status().is_success() {
            return Err(unexpected(&response));
        }
        Ok(())
    }
}
