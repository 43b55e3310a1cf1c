use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use url::Url;

use crate::error::{ApiErrorClass, classify_api_status};

/// Name of the page property that stores the source-system identifier.
/// It is the only join key between the two systems.
pub const SOURCE_ID_PROPERTY: &str = "source_id";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

impl WorkspaceError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            WorkspaceError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            WorkspaceError::Request(err) => err.is_timeout() || err.is_connect(),
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }
}

/// Client for the workspace-database REST API. Pages are never deleted
/// through this client, only archived.
#[derive(Clone)]
pub struct WorkspaceClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl WorkspaceClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, WorkspaceError> {
        Self::with_timeout(base_url, token, Duration::from_secs(30))
    }

    pub fn with_timeout(
        base_url: &str,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, WorkspaceError> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Looks up the page holding the given source id in a database.
    /// Returns the page's native id, or `None` when no such page exists.
    pub async fn find_page_by_source_id(
        &self,
        database_id: &str,
        source_id: i64,
    ) -> Result<Option<String>, WorkspaceError> {
        let url = self.endpoint(&format!("/v1/databases/{database_id}/query"))?;
        let body = json!({
            "filter": {
                "property": SOURCE_ID_PROPERTY,
                "number": { "equals": source_id }
            },
            "page_size": 1
        });
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&body)
            .send()
            .await?;
        let payload: QueryResponse = Self::handle_response(response).await?;
        Ok(payload.results.into_iter().next().map(|page| page.id))
    }

    /// Creates a page in a database and returns its native id.
    pub async fn create_page(
        &self,
        database_id: &str,
        properties: Value,
    ) -> Result<String, WorkspaceError> {
        let url = self.endpoint("/v1/pages")?;
        let body = json!({
            "parent": { "database_id": database_id },
            "properties": properties
        });
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&body)
            .send()
            .await?;
        let payload: PageRef = Self::handle_response(response).await?;
        Ok(payload.id)
    }

    pub async fn update_page(
        &self,
        page_id: &str,
        properties: Value,
    ) -> Result<(), WorkspaceError> {
        let url = self.endpoint(&format!("/v1/pages/{page_id}"))?;
        let body = json!({ "properties": properties });
        let response = self
            .http
            .patch(url)
            .header("Authorization", self.auth_header_value())
            .json(&body)
            .send()
            .await?;
        Self::handle_empty_response(response).await
    }

    pub async fn set_archived(
        &self,
        page_id: &str,
        archived: bool,
    ) -> Result<(), WorkspaceError> {
        let url = self.endpoint(&format!("/v1/pages/{page_id}"))?;
        let body = json!({ "archived": archived });
        let response = self
            .http
            .patch(url)
            .header("Authorization", self.auth_header_value())
            .json(&body)
            .send()
            .await?;
        Self::handle_empty_response(response).await
    }

    /// Attaches file content to a page as a multipart upload.
    pub async fn attach_file(
        &self,
        page_id: &str,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<(), WorkspaceError> {
        let url = self.endpoint(&format!("/v1/pages/{page_id}/files"))?;
        let form = Form::new().part("file", Part::bytes(bytes).file_name(filename.to_string()));
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .multipart(form)
            .send()
            .await?;
        Self::handle_empty_response(response).await
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, WorkspaceError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, WorkspaceError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(WorkspaceError::Api { status, body })
        }
    }

    async fn handle_empty_response(response: reqwest::Response) -> Result<(), WorkspaceError> {
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(WorkspaceError::Api { status, body })
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    results: Vec<PageRef>,
}

#[derive(Debug, Deserialize)]
struct PageRef {
    id: String,
}
