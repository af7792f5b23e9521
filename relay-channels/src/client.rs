//! HTTP client for the Dify app API.
//!
//! Covers the endpoints the relay drives on every turn (`chat-messages`,
//! `workflows/run`, `files/upload`) plus the rest of the app API surface.
//! Every call carries the app key as a bearer token; any non-2xx status is
//! turned into [`RelayError::RemoteRequest`].

use async_trait::async_trait;
use futures_util::StreamExt;
use relay_common::config::DifyConfig;
use relay_common::error::{RelayError, Result};
use relay_common::util::sanitize_for_log;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::time::Duration;

use crate::sse::{parse_data_line, Flow, SseLineDecoder, StreamReducer, StreamReply};

/// Default timeout for chat and workflow calls.
pub const REQUEST_TIMEOUT_SECS: u64 = 50;
/// Default timeout for file uploads.
pub const UPLOAD_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    Blocking,
    Streaming,
}

/// Reference to a previously uploaded file, attached to a chat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFileRef {
    #[serde(rename = "type")]
    pub file_type: String,
    pub transfer_method: String,
    pub upload_file_id: String,
}

impl UploadFileRef {
    /// An image uploaded through `files/upload`.
    pub fn local_image(upload_file_id: impl Into<String>) -> Self {
        Self {
            file_type: "image".to_string(),
            transfer_method: "local_file".to_string(),
            upload_file_id: upload_file_id.into(),
        }
    }
}

/// Body of `POST /chat-messages`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub inputs: Map<String, Value>,
    pub query: String,
    pub user: String,
    pub response_mode: ResponseMode,
    /// Omitted until the remote side has assigned a conversation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<UploadFileRef>>,
}

impl ChatRequest {
    pub fn new(query: impl Into<String>, user: impl Into<String>, mode: ResponseMode) -> Self {
        Self {
            inputs: Map::new(),
            query: query.into(),
            user: user.into(),
            response_mode: mode,
            conversation_id: None,
            files: None,
        }
    }

    /// Continue a conversation. An empty id starts a new one.
    pub fn with_conversation(mut self, conversation_id: &str) -> Self {
        self.conversation_id = (!conversation_id.is_empty()).then(|| conversation_id.to_string());
        self
    }

    pub fn with_files(mut self, files: Vec<UploadFileRef>) -> Self {
        self.files = (!files.is_empty()).then_some(files);
        self
    }
}

/// Blocking `chat-messages` answer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl ChatCompletion {
    pub fn usage(&self) -> Option<&Value> {
        self.metadata.as_ref().and_then(|m| m.get("usage"))
    }
}

/// Body of `POST /workflows/run`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRequest {
    pub inputs: Value,
    pub response_mode: ResponseMode,
    pub user: String,
}

impl WorkflowRequest {
    /// Blocking run with the user's text as the `query` input.
    pub fn new(query: &str, user: impl Into<String>) -> Self {
        Self {
            inputs: json!({ "query": query }),
            response_mode: ResponseMode::Blocking,
            user: user.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowResponse {
    #[serde(default)]
    pub workflow_run_id: Option<String>,
    pub data: WorkflowRunData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRunData {
    #[serde(default)]
    pub status: Option<String>,
    pub outputs: WorkflowOutputs,
}

/// Workflow outputs. The relay answers with the `text` output.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowOutputs {
    pub text: String,
}

/// Result of `POST /files/upload`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedFile {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Like,
    Dislike,
}

/// Blocking `completion-messages` answer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

// ============================================================================
// Backend Seam
// ============================================================================

/// The remote calls a turn depends on.
///
/// [`DifyClient`] is the production implementation; tests substitute stubs.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// `chat-messages` in blocking mode.
    async fn chat_blocking(&self, request: &ChatRequest) -> Result<ChatCompletion>;

    /// `chat-messages` in streaming mode, reduced to fragments.
    async fn chat_streaming(&self, request: &ChatRequest) -> Result<StreamReply>;

    /// `workflows/run` in blocking mode.
    async fn run_workflow(&self, request: &WorkflowRequest) -> Result<WorkflowResponse>;

    /// Upload a local file on behalf of `user`.
    async fn upload_file(&self, path: &Path, user: &str) -> Result<UploadedFile>;
}

// ============================================================================
// Client
// ============================================================================

/// Dify app API client.
#[derive(Clone)]
pub struct DifyClient {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    request_timeout: Duration,
    upload_timeout: Duration,
}

impl std::fmt::Debug for DifyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DifyClient")
            .field("api_base", &self.api_base)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl DifyClient {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            upload_timeout: Duration::from_secs(UPLOAD_TIMEOUT_SECS),
        }
    }

    pub fn from_config(config: &DifyConfig) -> Self {
        Self::new(&config.api_base, &config.api_key)
            .with_timeouts(config.request_timeout(), config.upload_timeout())
    }

    pub fn with_timeouts(mut self, request: Duration, upload: Duration) -> Self {
        self.request_timeout = request;
        self.upload_timeout = upload;
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn request(&self, method: Method, endpoint: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_base, endpoint))
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
    }

    /// Pass 2xx responses through, turn anything else into `RemoteRequest`.
    async fn check(endpoint: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(
            endpoint,
            status = status.as_u16(),
            body = %sanitize_for_log(&body),
            "Dify request failed"
        );
        Err(RelayError::remote_request(status.as_u16(), &body))
    }

    /// Decode a success body. Reads the text first so decode failures are JSON errors.
    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn send_json<B, T>(&self, method: Method, endpoint: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        tracing::debug!(endpoint, "Sending Dify request");
        let response = self.request(method, endpoint).json(body).send().await?;
        let response = Self::check(endpoint, response).await?;
        Self::decode(response).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        tracing::debug!(endpoint, "Sending Dify request");
        let response = self
            .request(Method::GET, endpoint)
            .query(params)
            .send()
            .await?;
        let response = Self::check(endpoint, response).await?;
        Self::decode(response).await
    }

    // ------------------------------------------------------------------------
    // Remaining app API
    // ------------------------------------------------------------------------

    /// `POST /messages/{id}/feedbacks`. `None` revokes a previous rating.
    pub async fn message_feedback(
        &self,
        message_id: &str,
        rating: Option<Rating>,
        user: &str,
    ) -> Result<Value> {
        let body = json!({ "rating": rating, "user": user });
        self.send_json(Method::POST, &format!("/messages/{message_id}/feedbacks"), &body)
            .await
    }

    /// `GET /parameters`.
    pub async fn application_parameters(&self, user: &str) -> Result<Value> {
        self.get_json("/parameters", &[("user", user.to_string())])
            .await
    }

    /// `GET /messages`, the history of one conversation.
    pub async fn conversation_messages(
        &self,
        user: &str,
        conversation_id: Option<&str>,
        first_id: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Value> {
        let mut params = vec![("user", user.to_string())];
        if let Some(id) = conversation_id.filter(|s| !s.is_empty()) {
            params.push(("conversation_id", id.to_string()));
        }
        if let Some(id) = first_id.filter(|s| !s.is_empty()) {
            params.push(("first_id", id.to_string()));
        }
        if let Some(limit) = limit {
            params.push(("limit", limit.to_string()));
        }
        self.get_json("/messages", &params).await
    }

    /// `GET /conversations`.
    pub async fn conversations(
        &self,
        user: &str,
        last_id: Option<&str>,
        limit: Option<u32>,
        pinned: Option<bool>,
    ) -> Result<Value> {
        let mut params = vec![("user", user.to_string())];
        if let Some(id) = last_id {
            params.push(("last_id", id.to_string()));
        }
        if let Some(limit) = limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(pinned) = pinned {
            params.push(("pinned", pinned.to_string()));
        }
        self.get_json("/conversations", &params).await
    }

    /// `POST /conversations/{id}/name`.
    pub async fn rename_conversation(
        &self,
        conversation_id: &str,
        name: &str,
        user: &str,
    ) -> Result<Value> {
        let body = json!({ "name": name, "user": user });
        self.send_json(
            Method::POST,
            &format!("/conversations/{conversation_id}/name"),
            &body,
        )
        .await
    }

    /// `POST /completion-messages` in blocking mode.
    pub async fn completion_message(
        &self,
        inputs: Value,
        user: &str,
        files: Option<Vec<UploadFileRef>>,
    ) -> Result<CompletionResponse> {
        let body = json!({
            "inputs": inputs,
            "response_mode": ResponseMode::Blocking,
            "user": user,
            "files": files,
        });
        self.send_json(Method::POST, "/completion-messages", &body)
            .await
    }
}

#[async_trait]
impl ChatBackend for DifyClient {
    async fn chat_blocking(&self, request: &ChatRequest) -> Result<ChatCompletion> {
        let completion: ChatCompletion = self
            .send_json(Method::POST, "/chat-messages", request)
            .await?;
        tracing::debug!(usage = ?completion.usage(), "Chat completion usage");
        Ok(completion)
    }

    async fn chat_streaming(&self, request: &ChatRequest) -> Result<StreamReply> {
        tracing::debug!(endpoint = "/chat-messages", "Opening Dify event stream");
        let response = self
            .request(Method::POST, "/chat-messages")
            .header("Accept", "text/event-stream")
            .json(request)
            .send()
            .await?;
        let response = Self::check("/chat-messages", response).await?;

        let mut stream = response.bytes_stream();
        let mut lines = SseLineDecoder::new();
        let mut reducer = StreamReducer::new();

        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for line in lines.push(&chunk) {
                if let Some(event) = parse_data_line(&line) {
                    if reducer.push(event)? == Flow::Done {
                        break 'read;
                    }
                }
            }
        }

        if !reducer.is_done() {
            if let Some(event) = lines.finish().as_deref().and_then(parse_data_line) {
                reducer.push(event)?;
            }
        }

        reducer.finish()
    }

    async fn run_workflow(&self, request: &WorkflowRequest) -> Result<WorkflowResponse> {
        self.send_json(Method::POST, "/workflows/run", request).await
    }

    async fn upload_file(&self, path: &Path, user: &str) -> Result<UploadedFile> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mime = mime_guess::from_path(path).first_or_octet_stream();

        tracing::debug!(file = %path.display(), mime = %mime, "Uploading file to Dify");

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime.essence_str())?;
        let form = Form::new().text("user", user.to_string()).part("file", part);

        let response = self
            .request(Method::POST, "/files/upload")
            .timeout(self.upload_timeout)
            .multipart(form)
            .send()
            .await?;
        let response = Self::check("/files/upload", response).await?;
        let uploaded: UploadedFile = Self::decode(response).await?;
        tracing::debug!(upload_file_id = %uploaded.id, "Uploaded file");
        Ok(uploaded)
    }
}
