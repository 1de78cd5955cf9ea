//! In-memory multi-turn conversation state.
//!
//! All sessions live behind a single mutex. Callers only ever receive
//! copies, so nothing outside the store can mutate a session without going
//! through [`ConversationStore::add_turn`].

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use second_brain_core::models::Action;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConversationError {
    #[error("max_turns must be > 0")]
    ZeroMaxTurns,
    #[error("max_sessions must be > 0")]
    ZeroMaxSessions,
    #[error("Session {0} not found")]
    SessionNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub branch_code: Option<String>,
    pub action_taken: Option<Action>,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            branch_code: None,
            action_taken: None,
        }
    }

    pub fn assistant(content: impl Into<String>, branch_code: &str, action: Action) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            branch_code: Some(branch_code.to_string()),
            action_taken: Some(action),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationState {
    pub session_id: String,
    pub turns: Vec<ConversationTurn>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

impl ConversationState {
    fn new(session_id: String) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            turns: Vec::new(),
            created_at: now,
            last_active: now,
            metadata: Map::new(),
        }
    }

    /// Content of the most recent user turn.
    pub fn last_user_message(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.as_str())
    }
}

struct Entry {
    state: ConversationState,
    // Monotonic touch order; breaks ties between equal `last_active` values.
    touched: u64,
}

#[derive(Default)]
struct Sessions {
    entries: HashMap<String, Entry>,
    clock: u64,
}

impl Sessions {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

pub struct ConversationStore {
    max_turns: usize,
    max_sessions: usize,
    sessions: Mutex<Sessions>,
}

impl ConversationStore {
    pub fn new(max_turns: usize, max_sessions: usize) -> Result<Self, ConversationError> {
        if max_turns == 0 {
            return Err(ConversationError::ZeroMaxTurns);
        }
        if max_sessions == 0 {
            return Err(ConversationError::ZeroMaxSessions);
        }
        Ok(Self {
            max_turns,
            max_sessions,
            sessions: Mutex::new(Sessions::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Existing session `session_id`, or a new one. With `None` (or an
    /// empty id) a new session with a random id is created.
    pub fn get_or_create(&self, session_id: Option<&str>) -> ConversationState {
        let session_id = session_id.filter(|id| !id.is_empty());
        let mut sessions = self.lock();
        if let Some(entry) = session_id.and_then(|id| sessions.entries.get(id)) {
            return entry.state.clone();
        }

        let id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let state = ConversationState::new(id.clone());
        let touched = sessions.tick();
        sessions.entries.insert(
            id,
            Entry {
                state: state.clone(),
                touched,
            },
        );
        self.evict_excess(&mut sessions);
        state
    }

    pub fn get(&self, session_id: &str) -> Option<ConversationState> {
        self.lock()
            .entries
            .get(session_id)
            .map(|e| e.state.clone())
    }

    /// Append `turn`, keeping only the newest `max_turns` turns.
    pub fn add_turn(&self, session_id: &str, turn: ConversationTurn) -> Result<(), ConversationError> {
        let mut sessions = self.lock();
        let touched = sessions.tick();
        let entry = sessions
            .entries
            .get_mut(session_id)
            .ok_or_else(|| ConversationError::SessionNotFound(session_id.to_string()))?;

        entry.state.turns.push(turn);
        let excess = entry.state.turns.len().saturating_sub(self.max_turns);
        if excess > 0 {
            entry.state.turns.drain(..excess);
        }
        entry.state.last_active = Utc::now();
        entry.touched = touched;
        Ok(())
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.lock().entries.contains_key(session_id)
    }

    pub fn session_ids(&self) -> HashSet<String> {
        self.lock().entries.keys().cloned().collect()
    }

    /// Returns whether the session existed.
    pub fn delete_session(&self, session_id: &str) -> bool {
        self.lock().entries.remove(session_id).is_some()
    }

    fn evict_excess(&self, sessions: &mut Sessions) {
        let excess = sessions.entries.len().saturating_sub(self.max_sessions);
        if excess == 0 {
            return;
        }
        let mut order: Vec<(DateTime<Utc>, u64, String)> = sessions
            .entries
            .iter()
            .map(|(id, e)| (e.state.last_active, e.touched, id.clone()))
            .collect();
        order.sort();
        for (_, _, id) in order.into_iter().take(excess) {
            sessions.entries.remove(&id);
        }
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self {
            max_turns: 50,
            max_sessions: 100,
            sessions: Mutex::new(Sessions::default()),
        }
    }
}
