//! HTTP backend for the chat API.
//!
//! [`ChatBackend`] is the seam between the controller and the network:
//! the controller only sees classified results, never raw responses.
//! [`HttpBackend`] implements it over reqwest against the configured
//! base URL.

use bytes::Bytes;
use kheti_protocol::api::{
    ChatRequest, ChatResponse, ForkResponse, SessionEnvelope, TranscribeResponse, VisibilityUpdate,
};
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use crate::auth::Credentials;

/// Backend failure, classified for the state machine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Server confirmed the resource exists but the viewer may not see it.
    #[error("access denied")]
    Forbidden,
    /// Server confirmed the resource does not exist.
    #[error("not found")]
    NotFound,
    /// Anything else: network failure, timeout, 5xx, malformed body.
    /// Says nothing about whether the resource exists.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Transport(err.to_string())
    }
}

/// Chat API operations the controller needs. Implemented by
/// [`HttpBackend`] in production and by scripted mocks in tests.
pub trait ChatBackend: Send + Sync + 'static {
    /// GET the session metadata and transcript for a durable id.
    fn fetch_session(
        &self,
        session_id: &str,
    ) -> impl std::future::Future<Output = Result<SessionEnvelope, BackendError>> + Send;

    /// POST a fork of a public session; returns the new private id.
    fn fork_session(
        &self,
        session_id: &str,
    ) -> impl std::future::Future<Output = Result<String, BackendError>> + Send;

    /// POST a chat message; the response may carry a new session id.
    fn send_chat(
        &self,
        text: &str,
        session_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<ChatResponse, BackendError>> + Send;

    /// POST captured audio for transcription.
    fn transcribe(
        &self,
        audio: Bytes,
    ) -> impl std::future::Future<Output = Result<String, BackendError>> + Send;

    /// PATCH the session's public/private visibility.
    fn set_visibility(
        &self,
        session_id: &str,
        is_public: bool,
    ) -> impl std::future::Future<Output = Result<(), BackendError>> + Send;
}

/// reqwest-backed implementation against a single chat server.
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
            credentials,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match self.credentials.bearer() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Classify a session-scoped response status. 403 and 404 are the
    /// only statuses the state machine treats as authoritative.
    fn classify(status: StatusCode) -> Option<BackendError> {
        if status.is_success() {
            None
        } else if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
            Some(BackendError::Forbidden)
        } else if status == StatusCode::NOT_FOUND {
            Some(BackendError::NotFound)
        } else {
            Some(BackendError::Transport(format!("status {}", status)))
        }
    }

    /// Run the request with credentials attached; if the signed-in
    /// attempt is rejected or fails, retry once anonymously. A stale
    /// token must not hide a session the public could see.
    async fn get_with_fallback(&self, url: &str) -> Result<Response, BackendError> {
        if self.credentials.bearer().is_some() {
            match self.authorize(self.http.get(url)).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    debug!(status = %resp.status(), url, "authenticated fetch rejected, retrying anonymously");
                }
                Err(err) => {
                    warn!(error = %err, url, "authenticated fetch failed, retrying anonymously");
                }
            }
        }
        Ok(self.http.get(url).send().await?)
    }
}

impl ChatBackend for HttpBackend {
    async fn fetch_session(&self, session_id: &str) -> Result<SessionEnvelope, BackendError> {
        let url = self.url(&format!("/chat/sessions/{session_id}"));
        let resp = self.get_with_fallback(&url).await?;
        if let Some(err) = Self::classify(resp.status()) {
            return Err(err);
        }
        Ok(resp.json::<SessionEnvelope>().await?)
    }

    async fn fork_session(&self, session_id: &str) -> Result<String, BackendError> {
        let url = self.url(&format!("/chat/sessions/{session_id}/fork"));
        let resp = self.authorize(self.http.post(&url)).send().await?;
        if let Some(err) = Self::classify(resp.status()) {
            return Err(err);
        }
        let body = resp.json::<ForkResponse>().await?;
        Ok(body.session_id)
    }

    async fn send_chat(
        &self,
        text: &str,
        session_id: Option<&str>,
    ) -> Result<ChatResponse, BackendError> {
        let body = ChatRequest {
            text: text.to_string(),
            session_id: session_id.map(str::to_string),
        };
        let resp = self
            .authorize(self.http.post(self.url("/chat")))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BackendError::Transport(format!("status {}", resp.status())));
        }
        Ok(resp.json::<ChatResponse>().await?)
    }

    async fn transcribe(&self, audio: Bytes) -> Result<String, BackendError> {
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name("recording.webm")
            .mime_str("audio/webm")?;
        let form = reqwest::multipart::Form::new().part("audio", part);
        let resp = self
            .authorize(self.http.post(self.url("/asr/transcribe")))
            .multipart(form)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BackendError::Transport(format!("status {}", resp.status())));
        }
        let body = resp.json::<TranscribeResponse>().await?;
        Ok(body.transcription)
    }

    async fn set_visibility(&self, session_id: &str, is_public: bool) -> Result<(), BackendError> {
        let url = self.url(&format!("/chat/sessions/{session_id}"));
        let resp = self
            .authorize(self.http.patch(&url))
            .json(&VisibilityUpdate { is_public })
            .send()
            .await?;
        if let Some(err) = Self::classify(resp.status()) {
            return Err(err);
        }
        Ok(())
    }
}
