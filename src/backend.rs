use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::citations::Citation;
use crate::error::ClientError;
use crate::settings::{EffectiveSettings, QueryField, ResponseMode, SourceMode};
use crate::stream::ByteStream;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub query: String,
    pub source: SourceMode,
}

impl ChatRequest {
    pub fn to_body(&self, field: QueryField) -> serde_json::Value {
        let mut body = serde_json::Map::new();
        body.insert(field.key().into(), serde_json::Value::String(self.query.clone()));
        body.insert("source".into(), serde_json::Value::String(self.source.as_str().into()));
        serde_json::Value::Object(body)
    }
}

pub enum ChatReply {
    Streaming(ByteStream),
    Complete { text: String, sources: Option<Vec<Citation>> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub filename: String,
    pub chunk_count: u64,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub documents_indexed: bool,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn open_chat(&self, req: &ChatRequest) -> Result<ChatReply, ClientError>;
    async fn upload(&self, path: &Path) -> Result<UploadReceipt, ClientError>;
    async fn health(&self) -> Result<HealthStatus, ClientError>;
}

pub fn is_pdf(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()).is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
}

#[derive(Clone)]
pub struct HttpBackend {
    pub base_url: String,
    pub response_mode: ResponseMode,
    pub query_field: QueryField,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(settings: &EffectiveSettings) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder().connect_timeout(settings.connect_timeout).build()?;
        Ok(Self {
            base_url: settings.backend_url.clone(),
            response_mode: settings.response_mode,
            query_field: settings.query_field,
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Debug, Deserialize)]
struct SyncChatResponse {
    #[serde(alias = "answer")]
    response: String,
    #[serde(default)]
    sources: Option<Vec<Citation>>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    chunks_indexed: u64,
    filename: Option<String>,
    message: Option<String>,
}

// FastAPI reports failures as `{"detail": "..."}`.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let detail = resp
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string));
    Err(ClientError::Status { status, detail })
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn open_chat(&self, req: &ChatRequest) -> Result<ChatReply, ClientError> {
        let url = self.endpoint("chat");
        tracing::debug!(%url, source = %req.source, mode = ?self.response_mode, "opening chat request");
        let resp = self.client.post(url).json(&req.to_body(self.query_field)).send().await?;
        let resp = check_status(resp).await?;
        match self.response_mode {
            ResponseMode::Streaming => {
                let body = resp
                    .bytes_stream()
                    .map(|r| r.map(|b| b.to_vec()).map_err(|e| ClientError::Stream(e.to_string())))
                    .boxed();
                Ok(ChatReply::Streaming(body))
            }
            ResponseMode::Sync => {
                let v: SyncChatResponse = resp.json().await?;
                Ok(ChatReply::Complete { text: v.response, sources: v.sources })
            }
        }
    }

    async fn upload(&self, path: &Path) -> Result<UploadReceipt, ClientError> {
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        if !is_pdf(path) {
            return Err(ClientError::UnsupportedFile(name));
        }
        let data = tokio::fs::read(path).await?;
        tracing::debug!(file = %name, bytes = data.len(), "uploading document");
        let part = reqwest::multipart::Part::bytes(data).file_name(name.clone()).mime_str("application/pdf")?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self
            .client
            .post(self.endpoint("upload"))
            .timeout(UPLOAD_TIMEOUT)
            .multipart(form)
            .send()
            .await?;
        let v: UploadResponse = check_status(resp).await?.json().await?;
        Ok(UploadReceipt { filename: v.filename.unwrap_or(name), chunk_count: v.chunks_indexed, message: v.message })
    }

    async fn health(&self) -> Result<HealthStatus, ClientError> {
        let resp = self.client.get(self.endpoint("health")).send().await?;
        Ok(check_status(resp).await?.json().await?)
    }
}
