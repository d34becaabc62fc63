use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub const EVENT_NEW_MESSAGE: &str = "new_message";

/// Which backing data source a request is served from. Not mutable state;
/// a request-scoped selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tenant {
    AlAzhar,
    Lestari,
}

impl Tenant {
    pub const ALL: [Tenant; 2] = [Tenant::AlAzhar, Tenant::Lestari];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tenant::AlAzhar => "al-azhar",
            Tenant::Lestari => "lestari",
        }
    }

    /// Lenient query-parameter mapping: anything that is not exactly
    /// "lestari" selects al-azhar.
    pub fn from_param(param: Option<&str>) -> Tenant {
        match param {
            Some("lestari") => Tenant::Lestari,
            _ => Tenant::AlAzhar,
        }
    }

    pub fn other(&self) -> Tenant {
        match self {
            Tenant::AlAzhar => Tenant::Lestari,
            Tenant::Lestari => Tenant::AlAzhar,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Tenant::AlAzhar => "Al Azhar",
            Tenant::Lestari => "Lestari",
        }
    }
}

impl fmt::Display for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tenant {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "al-azhar" | "alazhar" | "al_azhar" => Ok(Tenant::AlAzhar),
            "lestari" => Ok(Tenant::Lestari),
            other => Err(format!("Unknown tenant: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Ai,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Human => "human",
            Role::Ai => "ai",
        }
    }

    /// Stored role values are only trusted when they are literally "ai";
    /// everything else (null, "system", free text) normalizes to human.
    pub fn from_stored(raw: Option<&str>) -> Role {
        match raw {
            Some("ai") => Role::Ai,
            _ => Role::Human,
        }
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::Human
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The most recent message of one conversation, as listed in the inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub last_message: String,
    pub last_message_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// One frame on the relay wire. The relay forwards payloads verbatim; it
/// never inspects them beyond requiring a JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewMessageBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
}

/// Payload of a `new_message` relay event, as emitted by the chat pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct NewMessagePayload {
    pub session_id: String,
    pub message: NewMessageBody,
    pub created_at: DateTime<Utc>,
    pub id: i64,
}

impl NewMessagePayload {
    pub fn to_summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            last_message: self.message.content.clone(),
            last_message_at: self.created_at,
        }
    }

    pub fn to_message(&self) -> ChatMessage {
        ChatMessage {
            id: self.id,
            session_id: self.session_id.clone(),
            role: Role::from_stored(Some(self.message.kind.as_str())),
            content: self.message.content.clone(),
            created_at: self.created_at,
        }
    }
}

/// Schema check at the subscription boundary. Malformed payloads are a
/// drop-and-log condition for the caller, never a propagated error.
pub fn parse_new_message(payload: &Value) -> Result<NewMessagePayload, &'static str> {
    let value: NewMessagePayload =
        serde_json::from_value(payload.clone()).map_err(|_| "invalid_payload")?;
    if value.session_id.trim().is_empty() {
        return Err("missing_session_id");
    }
    if value.message.kind.trim().is_empty() {
        return Err("missing_message_type");
    }
    Ok(value)
}
