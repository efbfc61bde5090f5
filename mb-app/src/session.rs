//! In-memory conversation history per user.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mb_buffer::BufferedMessage;
use mb_channels::{MessageKind, UserKey};
use serde::Serialize;
use uuid::Uuid;

const HISTORY_PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct UserMessageSummary {
    pub kind: MessageKind,
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

/// One handled batch and the reply it produced.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedExchange {
    pub user_messages: Vec<UserMessageSummary>,
    pub agent_response: String,
    pub grouped_count: usize,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedExchange {
    pub fn from_batch(batch: &[BufferedMessage], agent_response: &str) -> Self {
        Self {
            user_messages: batch
                .iter()
                .map(|m| UserMessageSummary {
                    kind: m.kind,
                    data: m.content.chars().take(HISTORY_PREVIEW_CHARS).collect(),
                    timestamp: m.received_at,
                })
                .collect(),
            agent_response: agent_response.to_string(),
            grouped_count: batch.len(),
            processed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub user_key: UserKey,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub exchanges: Vec<ProcessedExchange>,
}

impl Session {
    fn new(user_key: &UserKey) -> Self {
        let now = Utc::now();
        Self {
            id: format!("sess_{}_{}", user_key, Uuid::new_v4().simple()),
            user_key: user_key.clone(),
            created_at: now,
            last_active: now,
            exchanges: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub user_key: UserKey,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub exchanges: usize,
}

#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<UserKey, Session>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the user's active session, created on first use.
    pub fn get_or_create(&self, user_key: &UserKey) -> String {
        self.sessions
            .entry(user_key.clone())
            .or_insert_with(|| {
                let session = Session::new(user_key);
                tracing::info!(user_key = %user_key, session_id = %session.id, "session created");
                session
            })
            .id
            .clone()
    }

    pub fn record_exchange(&self, user_key: &UserKey, exchange: ProcessedExchange) {
        let mut session = self
            .sessions
            .entry(user_key.clone())
            .or_insert_with(|| Session::new(user_key));
        session.last_active = exchange.processed_at;
        session.exchanges.push(exchange);
    }

    pub fn get(&self, user_key: &UserKey) -> Option<Session> {
        self.sessions.get(user_key).map(|s| s.value().clone())
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| {
                let s = entry.value();
                SessionSummary {
                    id: s.id.clone(),
                    user_key: s.user_key.clone(),
                    created_at: s.created_at,
                    last_active: s.last_active,
                    exchanges: s.exchanges.len(),
                }
            })
            .collect();
        out.sort_by_key(|s| s.last_active);
        out.reverse();
        out
    }

    pub fn remove(&self, user_key: &UserKey) -> bool {
        self.sessions.remove(user_key).is_some()
    }
}
