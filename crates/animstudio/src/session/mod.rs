use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::artifact::{AttemptMetadata, CodeArtifact, Diagnostic};
use crate::chat::ChatRole;

mod in_memory;
mod store;
pub use in_memory::{InMemorySessionStore, SessionPolicy};
pub use store::{SessionLease, SessionStore};

/// Session used when a caller does not name one.
pub const DEFAULT_SESSION: &str = "default";

/// A unique identifier for a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new, random session ID.
    pub fn new() -> Self {
        SessionId(Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation of the session ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Uses `id` when it is present and non-blank, the shared default session otherwise.
    pub fn or_default(id: Option<&str>) -> Self {
        match id.map(str::trim) {
            Some(id) if !id.is_empty() => SessionId(id.to_string()),
            _ => SessionId(DEFAULT_SESSION.to_string()),
        }
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        SessionId(s)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One conversational turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: ChatRole,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            at: OffsetDateTime::now_utc(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            at: OffsetDateTime::now_utc(),
        }
    }
}

/// Which entry point produced a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Generate,
    Render,
}

/// Outcome of one completed orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub operation: Operation,
    pub metadata: AttemptMetadata,
    pub code_name: String,
    pub video_file_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// An event appended to a session's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEntry {
    Turn(Turn),
    Code(CodeArtifact),
    Diagnostic(Diagnostic),
    Run(RunRecord),
}

/// Represents a continuous conversation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
    pub code_history: Vec<CodeArtifact>,
    pub error_history: Vec<Diagnostic>,
    pub conversation: Vec<Turn>,
    pub runs: Vec<RunRecord>,
    pub preferences: Map<String, Value>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            created_at: now,
            last_activity: now,
            code_history: Vec::new(),
            error_history: Vec::new(),
            conversation: Vec::new(),
            runs: Vec::new(),
            preferences: Map::new(),
        }
    }

    /// Appends `entry`, keeping at most `max_history` items per list.
    pub fn add_entry(&mut self, entry: SessionEntry, max_history: usize) {
        match entry {
            SessionEntry::Turn(turn) => push_bounded(&mut self.conversation, turn, max_history),
            SessionEntry::Code(code) => push_bounded(&mut self.code_history, code, max_history),
            SessionEntry::Diagnostic(diag) => {
                push_bounded(&mut self.error_history, diag, max_history)
            }
            SessionEntry::Run(run) => push_bounded(&mut self.runs, run, max_history),
        }
        self.last_activity = OffsetDateTime::now_utc();
    }

    /// Merges `preferences` into the stored map; later values win per key.
    pub fn merge_preferences(&mut self, preferences: Map<String, Value>) {
        for (key, value) in preferences {
            self.preferences.insert(key, value);
        }
        self.last_activity = OffsetDateTime::now_utc();
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            exists: true,
            last_activity: self.last_activity.format(&Rfc3339).ok(),
            code_history: Some(self.code_history.len()),
            error_history: Some(self.error_history.len()),
            conversation_length: Some(self.conversation.len()),
            user_preferences: Some(self.preferences.keys().cloned().collect()),
        }
    }

    /// Context handed to the generative stages: the last `turns` turns, the
    /// preferences and the most recent accepted code.
    pub fn context(&self, turns: usize) -> SessionContext {
        let skip = self.conversation.len().saturating_sub(turns);
        SessionContext {
            recent_turns: self.conversation[skip..].to_vec(),
            preferences: self.preferences.clone(),
            last_code: self.code_history.last().cloned(),
        }
    }
}

fn push_bounded<T>(items: &mut Vec<T>, item: T, max: usize) {
    items.push(item);
    if items.len() > max {
        let excess = items.len() - max;
        items.drain(..excess);
    }
}

/// Summary of a session as reported to clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_history: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_history: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_preferences: Option<Vec<String>>,
}

impl SessionInfo {
    pub fn missing() -> Self {
        Self::default()
    }
}

/// Read-only view of a session passed explicitly into every stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionContext {
    pub recent_turns: Vec<Turn>,
    pub preferences: Map<String, Value>,
    pub last_code: Option<CodeArtifact>,
}
