use serde::{Deserialize, Deserializer, Serialize};

/// Prefix carried by every locally-issued message id. Server ids never use it.
pub const PROVISIONAL_PREFIX: &str = "temp_";

/// Whether `message_id` was issued locally and still awaits its server echo.
pub fn is_provisional(message_id: &str) -> bool {
    message_id.starts_with(PROVISIONAL_PREFIX)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(format!("Invalid message role: {}", s)),
        }
    }
}

/// One entry of the conversation.
///
/// `content` is always the full text accumulated so far. The server sends
/// cumulative content on every update; `chunk` is the latest fragment and is
/// informational only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub message_id: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub session_id: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub user_id: String,

    pub role: Role,

    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,

    /// Epoch milliseconds. Only used to order a merged history batch.
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: i64,

    #[serde(default, deserialize_with = "null_as_default")]
    pub is_complete: bool,
}

impl Message {
    /// A locally-created user message, shown before the server acknowledges it.
    pub fn provisional(
        local_id: impl Into<String>,
        content: impl Into<String>,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            message_id: local_id.into(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            role: Role::User,
            content: content.into(),
            chunk: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
            is_complete: true,
        }
    }

    pub fn key(&self) -> EventKey {
        EventKey {
            message_id: self.message_id.clone(),
            timestamp: self.timestamp,
        }
    }

    pub fn is_provisional(&self) -> bool {
        is_provisional(&self.message_id)
    }
}

/// Identity of one delivery of a message update: the same message id at the
/// same timestamp is the same event, however many times it is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub message_id: String,
    pub timestamp: i64,
}

// The server writes `null` for missing booleans/longs on some user messages.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
