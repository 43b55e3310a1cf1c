use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::error::{ApiErrorClass, classify_api_status};

/// Upper bound on pages followed per listing, so a server that keeps
/// echoing the same `next` link cannot loop the client forever.
const MAX_LISTING_PAGES: usize = 1000;

#[derive(Debug, Error)]
pub enum DmsError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("listing did not terminate after {limit} pages")]
    TooManyPages { limit: usize },
}

impl DmsError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DmsError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    /// Connection-level failures and transient API responses are both
    /// candidates for a retry; 4xx rejections are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            DmsError::Request(err) => err.is_timeout() || err.is_connect(),
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }
}

/// Read-only client for the document-management REST API.
#[derive(Clone)]
pub struct DmsClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DmsClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, DmsError> {
        Self::with_timeout(base_url, token, Duration::from_secs(30))
    }

    pub fn with_timeout(
        base_url: &str,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DmsError> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Fetches one page of the document listing.
    pub async fn list_documents_page(&self, page: u32) -> Result<DocumentPage, DmsError> {
        let mut url = self.endpoint("/api/documents/")?;
        url.query_pairs_mut().append_pair("page", &page.to_string());
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let payload: Paged<Document> = Self::handle_response(response).await?;
        Ok(DocumentPage {
            has_more: payload.next.is_some(),
            results: payload.results,
        })
    }

    /// Fetches the full document listing, following pagination links.
    pub async fn list_documents(&self) -> Result<Vec<Document>, DmsError> {
        self.list_all("/api/documents/").await
    }

    pub async fn list_tags(&self) -> Result<Vec<Tag>, DmsError> {
        self.list_all("/api/tags/").await
    }

    pub async fn list_correspondents(&self) -> Result<Vec<Correspondent>, DmsError> {
        self.list_all("/api/correspondents/").await
    }

    /// Downloads the stored file for a document. The filename is taken from
    /// the `Content-Disposition` response header when the server provides one.
    pub async fn download_document(&self, id: i64) -> Result<DocumentFile, DmsError> {
        let url = self.endpoint(&format!("/api/documents/{id}/download/"))?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DmsError::Api { status, body });
        }
        let filename = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(filename_from_content_disposition);
        let bytes = response.bytes().await?.to_vec();
        Ok(DocumentFile { bytes, filename })
    }

    async fn list_all<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Vec<T>, DmsError> {
        let mut next = Some(self.endpoint(path)?);
        let mut out = Vec::new();
        let mut pages = 0usize;
        while let Some(url) = next {
            pages += 1;
            if pages > MAX_LISTING_PAGES {
                return Err(DmsError::TooManyPages {
                    limit: MAX_LISTING_PAGES,
                });
            }
            let response = self
                .http
                .get(url)
                .header("Authorization", self.auth_header_value())
                .send()
                .await?;
            let page: Paged<T> = Self::handle_response(response).await?;
            out.extend(page.results);
            next = match page.next.as_deref() {
                Some(link) => Some(Url::parse(link)?),
                None => None,
            };
        }
        Ok(out)
    }

    fn auth_header_value(&self) -> String {
        format!("Token {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, DmsError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DmsError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DmsError::Api { status, body })
        }
    }
}

fn filename_from_content_disposition(value: &str) -> Option<String> {
    value
        .split(';')
        .find_map(|part| part.trim().strip_prefix("filename="))
        .map(|name| name.trim_matches('"').to_string())
        .filter(|name| !name.is_empty())
}

#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub id: i64,
    pub title: String,
    pub created: String,
    pub added: String,
    pub modified: String,
    #[serde(default)]
    pub correspondent: Option<i64>,
    #[serde(default)]
    pub tags: Vec<i64>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub original_file_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Correspondent {
    pub id: i64,
    pub name: String,
}

#[derive(Debug)]
pub struct DocumentPage {
    pub results: Vec<Document>,
    pub has_more: bool,
}

#[derive(Debug)]
pub struct DocumentFile {
    pub bytes: Vec<u8>,
    pub filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Paged<T> {
    #[allow(dead_code)]
    #[serde(default)]
    count: Option<i64>,
    #[serde(default)]
    next: Option<String>,
    results: Vec<T>,
}
