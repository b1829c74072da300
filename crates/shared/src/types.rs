//! Core types for the chat log and telemetry wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One tool invocation performed while answering a turn. Order matters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub success: bool,
}

/// Chat message identifier. Assigned by the log at append time; strictly
/// increasing in creation order, unique for the process lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MessageId(pub u64);

/// A single conversation entry. Immutable once appended to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Backend-classified label for the user request, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    /// Which backend engine produced the reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Tool steps taken while producing the reply, in execution order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionRecord>,
}

/// Message content before the log assigns an id and timestamp.
///
/// User and system drafts carry content only; `origin` and `actions` are
/// meaningful on assistant replies.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub role: Role,
    pub content: String,
    pub intent: Option<String>,
    pub origin: Option<String>,
    pub actions: Vec<ActionRecord>,
}

impl MessageDraft {
    pub fn user(content: impl Into<String>) -> Self {
        Self::bare(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::bare(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::bare(Role::System, content)
    }

    fn bare(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            intent: None,
            origin: None,
            actions: Vec::new(),
        }
    }

    pub fn with_intent(mut self, intent: Option<String>) -> Self {
        self.intent = intent;
        self
    }

    pub fn with_origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_actions(mut self, actions: Vec<ActionRecord>) -> Self {
        self.actions = actions;
        self
    }

    pub fn into_message(self, id: MessageId, created_at: DateTime<Utc>) -> Message {
        Message {
            id,
            role: self.role,
            content: self.content,
            created_at,
            intent: self.intent,
            origin: self.origin,
            actions: self.actions,
        }
    }
}

/// The `{role, content}` projection sent to the backend as turn context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for HistoryEntry {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    pub percent: f32,
    pub cores: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub used_gb: f32,
    pub total_gb: f32,
    pub percent: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiskStats {
    pub used_gb: f32,
    pub total_gb: f32,
    pub percent: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryStats {
    pub percent: f32,
    pub plugged: bool,
}

/// One telemetry reading as pushed by the backend. Replaced wholesale on
/// every push; no history is retained client-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub disk: DiskStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<BatteryStats>,
}

/// Entry from the read-only plugin listing endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub description: String,
    pub version: String,
    pub enabled: bool,
    pub key: String,
}
