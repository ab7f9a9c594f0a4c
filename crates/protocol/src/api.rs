//! Request and response bodies for the chat backend HTTP API

use serde::{Deserialize, Serialize};

use crate::types::{MessageRole, Session};

/// `POST /chat` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// `POST /chat` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// `GET /chat/sessions/{id}` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEnvelope {
    pub session: Session,
    #[serde(default)]
    pub messages: Vec<TranscriptEntry>,
}

/// One stored message in a fetched transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// `POST /chat/sessions/{id}/fork` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkResponse {
    pub session_id: String,
}

/// `POST /asr/transcribe` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeResponse {
    pub transcription: String,
}

/// `PATCH /chat/sessions/{id}` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisibilityUpdate {
    pub is_public: bool,
}
