// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use pi_model::{Message, ThinkingLevel};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One persisted JSONL line.  Entries form a forest: `parent_id = None`
/// marks a root; a fork appends a new entry whose parent is an older entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub id: String,
    pub parent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EntryKind {
    #[serde(rename_all = "camelCase")]
    Message { message: Message },
    #[serde(rename_all = "camelCase")]
    ModelChange { provider: String, model_id: String },
    #[serde(rename_all = "camelCase")]
    ThinkingLevel { thinking_level: ThinkingLevel },
    #[serde(rename_all = "camelCase")]
    Compaction {
        summary: String,
        first_kept_entry_id: String,
        tokens_before: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    BranchSummary { summary: String },
    #[serde(rename_all = "camelCase")]
    Custom { custom_type: String, data: Value },
    #[serde(rename_all = "camelCase")]
    CustomMessage { role: String, payload: Value },
    #[serde(rename_all = "camelCase")]
    Label { label: String },
    #[serde(rename_all = "camelCase")]
    SessionInfo { name: String },
}

impl SessionEntry {
    pub fn new(parent_id: Option<String>, kind: EntryKind) -> Self {
        Self {
            id: next_entry_id(),
            parent_id,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// The message carried by this entry, reconstructing custom messages
    /// from their persisted role/payload.
    pub fn as_message(&self) -> Option<Message> {
        match &self.kind {
            EntryKind::Message { message } => Some(message.clone()),
            EntryKind::CustomMessage { role, payload } => Some(Message::Custom {
                role: role.clone(),
                payload: payload.clone(),
                timestamp: self.timestamp,
            }),
            _ => None,
        }
    }
}

/// Sortable unique entry id: zero-padded millisecond timestamp, a
/// process-local counter, and a random suffix for cross-process uniqueness.
/// Lexicographic order matches creation order within a process; readers must
/// not assume timestamps alone are monotonic.
pub fn next_entry_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let count = COUNTER.fetch_add(1, Ordering::Relaxed) & 0xffff;
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{millis:012x}-{count:04x}-{}", &suffix[..6])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
