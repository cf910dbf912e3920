//! Shared session types and the store for grouped chat history.
//!
//! This module defines the derived session format that all consumers
//! (dashboard endpoints, summary metrics, SSE stream) read from. The store
//! holds exactly one snapshot at a time; every refresh replaces it wholesale
//! rather than patching groups in place.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Maximum preview length in characters
const PREVIEW_MAX_CHARS: usize = 96;

/// Sessions counted as "active" on the dashboard overview
const ACTIVE_SESSION_CAP: usize = 12;

/// A normalized chat message derived from one table row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: String,
    /// Numeric ordering key extracted from the id
    pub sort_key: u64,
    pub text: String,
}

/// An ordered conversation keyed by session id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionGroup {
    pub session_id: String,
    /// Ascending by sort_key
    pub messages: Vec<MessageRecord>,
}

impl SessionGroup {
    /// Sort key of the latest message; None for an empty group, which
    /// orders after every populated group under descending comparison
    pub fn last_sort_key(&self) -> Option<u64> {
        self.messages.last().map(|m| m.sort_key)
    }

    /// Short card preview of the latest message: whitespace collapsed,
    /// capped without splitting a code point
    pub fn preview(&self) -> String {
        let last = match self.messages.last() {
            Some(m) => m.text.as_str(),
            None => return String::new(),
        };
        let collapsed = last.split_whitespace().collect::<Vec<_>>().join(" ");
        truncate_chars(&collapsed, PREVIEW_MAX_CHARS)
    }
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect()
}

/// Dashboard summary tiles computed from one grouped snapshot
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SummaryStats {
    pub total_records: usize,
    pub total_sessions: usize,
    /// Overview card count, capped
    pub active_sessions: usize,
    /// Conversations that never got past one message
    pub single_message_sessions: usize,
    /// Preview of the most recently active session
    pub latest_preview: Option<String>,
}

impl SummaryStats {
    pub fn compute(groups: &[SessionGroup], total_records: usize) -> Self {
        Self {
            total_records,
            total_sessions: groups.len(),
            active_sessions: groups.len().min(ACTIVE_SESSION_CAP),
            single_message_sessions: groups
                .iter()
                .filter(|g| g.messages.len() <= 1)
                .count(),
            latest_preview: groups.first().map(|g| g.preview()),
        }
    }
}

/// Events broadcast when the store changes
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// Snapshot was replaced after a refresh
    Refreshed {
        total_records: usize,
        total_sessions: usize,
    },
}

/// Snapshot-level bookkeeping guarded together so order, totals and
/// timestamp always describe the same refresh
#[derive(Default)]
struct SnapshotMeta {
    /// Session ids in recency order
    order: Vec<String>,
    total_records: usize,
    /// RFC 3339 stamp of the last successful refresh
    refreshed_at: Option<String>,
}

/// Store for the latest grouped snapshot, shared across all components
pub struct SessionStore {
    /// Session ID -> group, for direct lookup
    groups: DashMap<String, SessionGroup>,
    meta: RwLock<SnapshotMeta>,
    /// Broadcast channel for store events
    event_tx: broadcast::Sender<StoreEvent>,
}

impl SessionStore {
    pub fn new() -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            groups: DashMap::new(),
            meta: RwLock::new(SnapshotMeta::default()),
            event_tx,
        })
    }

    /// Get one session group by id
    pub fn get(&self, session_id: &str) -> Option<SessionGroup> {
        self.groups.get(session_id).map(|r| r.clone())
    }

    /// Replace the whole snapshot after a refresh and broadcast the change
    pub async fn replace(&self, groups: Vec<SessionGroup>, total_records: usize) {
        let order: Vec<String> = groups.iter().map(|g| g.session_id.clone()).collect();
        let total_sessions = order.len();

        self.groups.clear();
        for group in groups {
            self.groups.insert(group.session_id.clone(), group);
        }

        {
            let mut meta = self.meta.write().await;
            meta.order = order;
            meta.total_records = total_records;
            meta.refreshed_at = Some(chrono::Utc::now().to_rfc3339());
        }

        let _ = self.event_tx.send(StoreEvent::Refreshed {
            total_records,
            total_sessions,
        });
    }

    /// Groups in recency order (most recently active first)
    pub async fn list_groups(&self) -> Vec<SessionGroup> {
        let meta = self.meta.read().await;
        meta.order.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Summary tiles plus the stamp of the snapshot they describe
    pub async fn summary(&self) -> (SummaryStats, Option<String>) {
        let groups = self.list_groups().await;
        let meta = self.meta.read().await;
        (
            SummaryStats::compute(&groups, meta.total_records),
            meta.refreshed_at.clone(),
        )
    }

    pub async fn session_count(&self) -> usize {
        self.meta.read().await.order.len()
    }

    /// Subscribe to store events
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.event_tx.subscribe()
    }
}
