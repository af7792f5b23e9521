//! Per-user conversation sessions and their expiring store.
//!
//! A session binds a host user to a remote Dify conversation. Sessions live
//! only in memory: the store drops an entry once it has been idle for longer
//! than the configured TTL, checked lazily on access.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relay_common::config::DifyConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

// ============================================================================
// Session
// ============================================================================

/// Conversation state for one session key.
#[derive(Debug, Clone)]
pub struct Session {
    session_id: String,
    user: String,
    /// Remote conversation, empty until the first successful exchange
    conversation_id: String,
    user_message_counter: u32,
    max_messages: u32,
}

impl Session {
    pub fn new(session_id: impl Into<String>, user: impl Into<String>, max_messages: u32) -> Self {
        Self {
            session_id: session_id.into(),
            user: user.into(),
            conversation_id: String::new(),
            user_message_counter: 0,
            max_messages,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn set_conversation_id(&mut self, conversation_id: impl Into<String>) {
        self.conversation_id = conversation_id.into();
    }

    /// Turns counted since the last reset.
    pub fn message_count(&self) -> u32 {
        self.user_message_counter
    }

    /// Count one inbound turn.
    ///
    /// Once the cap has been reached the remote conversation is abandoned:
    /// the counter restarts and the conversation id is cleared, so this
    /// turn opens a fresh conversation. Returns `true` when that happened.
    pub fn count_user_message(&mut self) -> bool {
        let reset = self.user_message_counter >= self.max_messages;
        if reset {
            tracing::debug!(
                session_id = %self.session_id,
                max_messages = self.max_messages,
                "Conversation message cap reached, starting a new conversation"
            );
            self.user_message_counter = 0;
            self.conversation_id.clear();
        }
        self.user_message_counter += 1;
        reset
    }
}

/// Session handle shared between the store and the turn that uses it.
///
/// The lock is held for a whole turn, so turns on one session key run
/// one after another.
pub type SharedSession = Arc<Mutex<Session>>;

// ============================================================================
// Session Store
// ============================================================================

#[derive(Debug)]
struct StoreEntry {
    session: SharedSession,
    touched: Instant,
}

impl StoreEntry {
    fn new(session: Session, now: Instant) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            touched: now,
        }
    }
}

/// Keyed session container with sliding expiry.
///
/// Every read or write through the store refreshes the entry's timestamp.
/// An entry idle for longer than the TTL is treated as absent even before
/// [`SessionStore::purge_expired`] physically removes it.
#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<String, StoreEntry>,
    ttl: Option<Duration>,
    max_messages: u32,
}

impl SessionStore {
    /// Create a store. `ttl = None` keeps sessions until cleared.
    pub fn new(ttl: Option<Duration>, max_messages: u32) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
            max_messages,
        }
    }

    pub fn from_config(config: &DifyConfig) -> Self {
        Self::new(config.session_ttl(), config.conversation_max_messages)
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    fn is_expired(&self, entry: &StoreEntry, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(entry.touched) > ttl)
    }

    /// Return the live session for `key`, creating it if missing or expired.
    ///
    /// Creation happens under the map's per-key lock, so concurrent first
    /// accesses observe a single session.
    pub fn get_or_create(&self, key: &str, user: &str) -> SharedSession {
        let now = Instant::now();
        match self.sessions.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if self.is_expired(occupied.get(), now) {
                    tracing::debug!(session_id = %key, "Session expired, setting new session");
                    occupied.insert(StoreEntry::new(
                        Session::new(key, user, self.max_messages),
                        now,
                    ));
                } else {
                    occupied.get_mut().touched = now;
                    tracing::debug!(session_id = %key, "Got session");
                }
                occupied.get().session.clone()
            }
            Entry::Vacant(vacant) => {
                tracing::debug!(session_id = %key, "Session not found, setting new session");
                vacant
                    .insert(StoreEntry::new(
                        Session::new(key, user, self.max_messages),
                        now,
                    ))
                    .session
                    .clone()
            }
        }
    }

    /// Return the live session for `key` without creating one.
    pub fn get(&self, key: &str) -> Option<SharedSession> {
        let now = Instant::now();
        let mut entry = self.sessions.get_mut(key)?;
        if self.is_expired(&entry, now) {
            drop(entry);
            self.sessions.remove_if(key, |_, e| self.is_expired(e, now));
            return None;
        }
        entry.touched = now;
        Some(entry.session.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.sessions
            .get(key)
            .is_some_and(|e| !self.is_expired(&e, now))
    }

    pub fn clear(&self, key: &str) {
        if self.sessions.remove(key).is_some() {
            tracing::debug!(session_id = %key, "Cleared session");
        }
    }

    pub fn clear_all(&self) {
        tracing::debug!(count = self.sessions.len(), "Clearing all sessions");
        self.sessions.clear();
    }

    /// Physically remove expired entries. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_keys().len()
    }

    /// Physically remove expired entries and return their keys.
    pub fn purge_expired_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut removed = Vec::new();
        self.sessions.retain(|key, e| {
            let live = !self.is_expired(e, now);
            if !live {
                removed.push(key.clone());
            }
            live
        });
        removed
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
