use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What subscribers send over their socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Close the subscriber's current route and report its final aggregate.
    Finish,
    Ping,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerMessage {
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerMessage {
    pub fn new(kind: &str, message: Option<Value>) -> Self {
        Self {
            r#type: kind.to_string(),
            message,
            error: None,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            r#type: "error".to_string(),
            message: None,
            error: Some(text.into()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing this shape cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}
