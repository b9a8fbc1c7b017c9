use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("chat service is unavailable")]
    Unavailable,

    #[error("chat service returned {status}")]
    Status {
        status: reqwest::StatusCode,
        detail: Option<String>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable
        } else {
            Self::Other(err.into())
        }
    }

    /// Text worth showing the user, including the server's explanation if it
    /// sent one.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Status {
                detail: Some(detail),
                ..
            } => format!("{self}: {detail}"),
            _ => self.to_string(),
        }
    }
}

/// Body of `POST /chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub session_id: String,
    pub message: String,
    pub user_id: String,
}

/// Body of `POST /cancel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub session_id: String,
    pub message_id: String,
}

/// HTTP side of the chat service. Replies arrive over the WebSocket, so
/// response bodies are only read for error details.
#[derive(Debug, Clone)]
pub struct ChatApi {
    client: reqwest::Client,
    base_url: String,
}

impl ChatApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn send(&self, request: &SendRequest) -> Result<(), ApiError> {
        self.post("chat", request).await
    }

    pub async fn cancel(&self, request: &CancelRequest) -> Result<(), ApiError> {
        self.post("cancel", request).await
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), ApiError> {
        let url = format!("{}/{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;

        let status = resp.status();
        if status.is_success() {
            debug!(%url, %status, "request accepted");
            return Ok(());
        }

        let detail = resp
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|body| {
                body.get("detail")
                    .or_else(|| body.get("error"))
                    .and_then(|d| d.as_str())
                    .map(str::to_owned)
            });
        Err(ApiError::Status { status, detail })
    }
}
