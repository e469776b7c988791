// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use pi_model::{Message, ThinkingLevel};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::entry::{EntryKind, SessionEntry};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session file is locked by another process: {0}")]
    Locked(PathBuf),
    #[error("malformed session line {line}: {source}")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },
    #[error("unknown entry id: {0}")]
    UnknownEntry(String),
    #[error("no session found for this directory")]
    NoRecentSession,
}

/// Summary of a stored session, for pickers and `--list-sessions`.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub path: PathBuf,
    pub id: String,
    pub cwd: PathBuf,
    pub name: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub message_count: usize,
    pub first_message: Option<String>,
    /// Concatenated text of all user/assistant turns, for search.
    pub all_messages_text: String,
}

/// Conversation state projected from the path root → active leaf.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub messages: Vec<Message>,
    /// Originating entry id per message, parallel to `messages`.  `None`
    /// for synthetic messages (the compaction summary).
    pub entry_ids: Vec<Option<String>>,
    pub model: Option<(String, String)>,
    pub thinking_level: Option<ThinkingLevel>,
}

/// Append-only parented session log.
///
/// One JSONL line per entry, written eagerly after every mutation and never
/// rewritten; replacing an entry means appending a new one that makes the
/// old one unreachable from the active leaf.  A companion `.leaf` file
/// tracks the active leaf across restarts.  The store holds an exclusive
/// advisory lock on the file for its lifetime; multiple readers (`list`)
/// may coexist with one writer.
#[derive(Debug)]
pub struct SessionStore {
    session_id: String,
    cwd: PathBuf,
    path: Option<PathBuf>,
    file: Option<File>,
    entries: Vec<SessionEntry>,
    by_id: HashMap<String, usize>,
    leaf: Option<String>,
    name: Option<String>,
}

/// Per-cwd session directory: `<root>/<first 16 hex of sha256(cwd)>`.
pub fn sessions_dir(sessions_root: &Path, cwd: &Path) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(cwd.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    sessions_root.join(&hex[..16])
}

impl SessionStore {
    /// Create a new empty on-disk session for `cwd`.
    pub fn create(sessions_root: &Path, cwd: &Path) -> Result<Self, StoreError> {
        let dir = sessions_dir(sessions_root, cwd);
        std::fs::create_dir_all(&dir)?;
        let session_id = Uuid::new_v4().to_string();
        let path = dir.join(format!("{session_id}.jsonl"));
        let file = open_locked(&path)?;
        Ok(Self {
            session_id,
            cwd: cwd.to_path_buf(),
            path: Some(path),
            file: Some(file),
            entries: Vec::new(),
            by_id: HashMap::new(),
            leaf: None,
            name: None,
        })
    }

    /// Same API, no disk writes.  Used for ephemeral sessions.
    pub fn in_memory(cwd: &Path) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            cwd: cwd.to_path_buf(),
            path: None,
            file: None,
            entries: Vec::new(),
            by_id: HashMap::new(),
            leaf: None,
            name: None,
        }
    }

    /// Open an explicit session file.  The active leaf comes from the
    /// companion pointer file, falling back to the last entry.
    pub fn open(path: &Path, cwd: &Path) -> Result<Self, StoreError> {
        let text = std::fs::read_to_string(path)?;
        let mut entries = Vec::new();
        let mut by_id = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: SessionEntry =
                serde_json::from_str(line).map_err(|source| StoreError::Parse {
                    line: lineno + 1,
                    source,
                })?;
            by_id.insert(entry.id.clone(), entries.len());
            entries.push(entry);
        }
        let session_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let leaf = read_leaf_pointer(path)
            .filter(|id| by_id.contains_key(id))
            .or_else(|| entries.last().map(|e| e.id.clone()));
        let name = entries.iter().rev().find_map(|e| match &e.kind {
            EntryKind::SessionInfo { name } => Some(name.clone()),
            _ => None,
        });
        let file = open_locked(path)?;
        Ok(Self {
            session_id,
            cwd: cwd.to_path_buf(),
            path: Some(path.to_path_buf()),
            file: Some(file),
            entries,
            by_id,
            leaf,
            name,
        })
    }

    /// Open the most recently modified session for `cwd`.
    pub fn continue_recent(sessions_root: &Path, cwd: &Path) -> Result<Self, StoreError> {
        let dir = sessions_dir(sessions_root, cwd);
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in std::fs::read_dir(&dir).map_err(|_| StoreError::NoRecentSession)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let mtime = entry.metadata()?.modified()?;
            if newest.as_ref().map(|(t, _)| mtime > *t).unwrap_or(true) {
                newest = Some((mtime, path));
            }
        }
        let (_, path) = newest.ok_or(StoreError::NoRecentSession)?;
        Self::open(&path, cwd)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn leaf(&self) -> Option<&str> {
        self.leaf.as_deref()
    }

    pub fn entry(&self, id: &str) -> Option<&SessionEntry> {
        self.by_id.get(id).map(|&i| &self.entries[i])
    }

    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    /// Append a new entry as a child of the current leaf and advance the
    /// leaf to it.
    pub fn append(&mut self, kind: EntryKind) -> &SessionEntry {
        let parent = self.leaf.clone();
        self.append_with_parent(kind, parent)
    }

    /// Append a new entry under an explicit parent (used by fork).
    pub fn append_with_parent(
        &mut self,
        kind: EntryKind,
        parent_id: Option<String>,
    ) -> &SessionEntry {
        if let EntryKind::SessionInfo { name } = &kind {
            self.name = Some(name.clone());
        }
        let entry = SessionEntry::new(parent_id, kind);
        self.write_line(&entry);
        self.leaf = Some(entry.id.clone());
        self.write_leaf_pointer();
        self.by_id.insert(entry.id.clone(), self.entries.len());
        self.entries.push(entry);
        self.entries.last().unwrap()
    }

    /// Move the active leaf to an existing entry.  The abandoned branch
    /// stays in the file; it is merely unreachable from the new leaf.
    pub fn set_leaf(&mut self, entry_id: &str) -> Result<(), StoreError> {
        if !self.by_id.contains_key(entry_id) {
            return Err(StoreError::UnknownEntry(entry_id.to_string()));
        }
        self.leaf = Some(entry_id.to_string());
        self.write_leaf_pointer();
        Ok(())
    }

    /// Entries on the path root → active leaf, in order.
    pub fn current_path(&self) -> Vec<&SessionEntry> {
        let mut rev = Vec::new();
        let mut cursor = self.leaf.clone();
        while let Some(id) = cursor {
            let Some(&index) = self.by_id.get(&id) else { break };
            let entry = &self.entries[index];
            cursor = entry.parent_id.clone();
            rev.push(entry);
        }
        rev.reverse();
        rev
    }

    /// Project the conversation state from the current path: messages in
    /// order, the last model/thinking-level change, and compaction
    /// replacement (everything older than the latest compaction's
    /// `first_kept_entry_id` collapses into one synthetic summary message).
    pub fn build_session_context(&self) -> SessionContext {
        let path = self.current_path();
        let mut ctx = SessionContext::default();

        for entry in &path {
            match &entry.kind {
                EntryKind::ModelChange { provider, model_id } => {
                    ctx.model = Some((provider.clone(), model_id.clone()));
                }
                EntryKind::ThinkingLevel { thinking_level } => {
                    ctx.thinking_level = Some(*thinking_level);
                }
                _ => {}
            }
        }

        let compaction = path.iter().rev().find_map(|e| match &e.kind {
            EntryKind::Compaction {
                summary,
                first_kept_entry_id,
                ..
            } => Some((summary.clone(), first_kept_entry_id.clone())),
            _ => None,
        });

        match compaction {
            Some((summary, first_kept)) => {
                ctx.messages.push(Message::user(summary));
                ctx.entry_ids.push(None);
                for entry in &path {
                    if entry.id < first_kept {
                        continue;
                    }
                    if let Some(m) = entry.as_message() {
                        ctx.messages.push(m);
                        ctx.entry_ids.push(Some(entry.id.clone()));
                    }
                }
            }
            None => {
                for entry in &path {
                    if let Some(m) = entry.as_message() {
                        ctx.messages.push(m);
                        ctx.entry_ids.push(Some(entry.id.clone()));
                    }
                }
            }
        }
        ctx
    }

    fn write_line(&mut self, entry: &SessionEntry) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let line = match serde_json::to_string(entry) {
            Ok(l) => l,
            Err(e) => {
                warn!("failed to serialize session entry: {e}");
                return;
            }
        };
        // Write failures must not abort the turn; in-memory state stays the
        // source of truth until the next successful flush.
        if let Err(e) = writeln!(file, "{line}").and_then(|_| file.flush()) {
            eprintln!("pi: session write failed: {e}");
        }
    }

    fn write_leaf_pointer(&self) {
        let (Some(path), Some(leaf)) = (&self.path, &self.leaf) else {
            return;
        };
        if let Err(e) = std::fs::write(leaf_pointer_path(path), leaf) {
            warn!("failed to write leaf pointer: {e}");
        }
    }
}

fn leaf_pointer_path(session_path: &Path) -> PathBuf {
    session_path.with_extension("leaf")
}

fn read_leaf_pointer(session_path: &Path) -> Option<String> {
    std::fs::read_to_string(leaf_pointer_path(session_path))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn open_locked(path: &Path) -> Result<File, StoreError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    match file.try_lock_exclusive() {
        Ok(true) => Ok(file),
        Ok(false) => Err(StoreError::Locked(path.to_path_buf())),
        Err(e) => Err(StoreError::Io(e)),
    }
}

/// Enumerate stored sessions for `cwd`, newest first.
pub fn list(sessions_root: &Path, cwd: &Path) -> Vec<SessionInfo> {
    let dir = sessions_dir(sessions_root, cwd);
    let Ok(read_dir) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut infos: Vec<SessionInfo> = read_dir
        .flatten()
        .filter(|e| {
            e.path().extension().and_then(|x| x.to_str()) == Some("jsonl")
        })
        .filter_map(|e| session_info(&e.path(), cwd))
        .collect();
    infos.sort_by(|a, b| b.modified.cmp(&a.modified));
    infos
}

fn session_info(path: &Path, cwd: &Path) -> Option<SessionInfo> {
    let text = std::fs::read_to_string(path).ok()?;
    let mut created = None;
    let mut name = None;
    let mut message_count = 0usize;
    let mut first_message = None;
    let mut all_text = String::new();
    for line in text.lines() {
        let Ok(entry) = serde_json::from_str::<SessionEntry>(line) else {
            continue;
        };
        if created.is_none() {
            created = Some(entry.timestamp);
        }
        match &entry.kind {
            EntryKind::SessionInfo { name: n } => name = Some(n.clone()),
            EntryKind::Message { message } => {
                message_count += 1;
                let text = match message {
                    Message::User { content, .. } => {
                        content.as_text().map(str::to_string).unwrap_or_default()
                    }
                    Message::Assistant(a) => a.text(),
                    _ => String::new(),
                };
                if !text.is_empty() {
                    if first_message.is_none() && message.is_user() {
                        first_message = Some(text.clone());
                    }
                    if !all_text.is_empty() {
                        all_text.push('\n');
                    }
                    all_text.push_str(&text);
                }
            }
            _ => {}
        }
    }
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from);
    Some(SessionInfo {
        path: path.to_path_buf(),
        id: path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default(),
        cwd: cwd.to_path_buf(),
        name,
        created,
        modified,
        message_count,
        first_message,
        all_messages_text: all_text,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pi_model::StopReason;

    fn user_entry(text: &str) -> EntryKind {
        EntryKind::Message {
            message: Message::user(text),
        }
    }

    fn assistant_entry(text: &str) -> EntryKind {
        EntryKind::Message {
            message: Message::Assistant(pi_model::AssistantMessage {
                content: vec![pi_model::ContentBlock::text(text)],
                api: "mock".into(),
                provider: "mock".into(),
                model: "mock-model".into(),
                usage: Default::default(),
                stop_reason: StopReason::Stop,
                error_message: None,
                invalid_tool_call_ids: vec![],
                timestamp: Utc::now(),
            }),
        }
    }

    fn tmp_store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::create(dir.path(), Path::new("/proj")).unwrap();
        (dir, store)
    }

    #[test]
    fn create_produces_empty_session_with_file() {
        let (_dir, store) = tmp_store();
        assert!(store.entries().is_empty());
        assert!(store.path().unwrap().exists());
        assert!(store.leaf().is_none());
    }

    #[test]
    fn append_links_entries_and_advances_leaf() {
        let (_dir, mut store) = tmp_store();
        let first = store.append(user_entry("a")).id.clone();
        let second = store.append(assistant_entry("b")).id.clone();
        assert_eq!(store.leaf(), Some(second.as_str()));
        assert_eq!(
            store.entry(&second).unwrap().parent_id.as_deref(),
            Some(first.as_str())
        );
        assert_eq!(store.entry(&first).unwrap().parent_id, None);
    }

    #[test]
    fn append_grows_file_and_never_rewrites() {
        let (_dir, mut store) = tmp_store();
        let path = store.path().unwrap().to_path_buf();
        let mut previous = String::new();
        for i in 0..5 {
            store.append(user_entry(&format!("msg {i}")));
            let now = std::fs::read_to_string(&path).unwrap();
            assert!(now.len() > previous.len(), "file must strictly grow");
            assert!(
                now.starts_with(&previous),
                "prior bytes must never be overwritten"
            );
            previous = now;
        }
    }

    #[test]
    fn reopen_restores_entries_and_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = Path::new("/proj");
        let path;
        let leaf;
        {
            let mut store = SessionStore::create(dir.path(), cwd).unwrap();
            store.append(user_entry("hello"));
            leaf = store.append(assistant_entry("world")).id.clone();
            path = store.path().unwrap().to_path_buf();
        }
        let store = SessionStore::open(&path, cwd).unwrap();
        assert_eq!(store.entries().len(), 2);
        assert_eq!(store.leaf(), Some(leaf.as_str()));
    }

    #[test]
    fn second_writer_is_rejected_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = Path::new("/proj");
        let store = SessionStore::create(dir.path(), cwd).unwrap();
        let path = store.path().unwrap().to_path_buf();
        match SessionStore::open(&path, cwd) {
            Err(StoreError::Locked(p)) => assert_eq!(p, path),
            other => panic!("expected Locked, got {other:?}"),
        }
    }

    #[test]
    fn fork_keeps_abandoned_branch_readable() {
        let (_dir, mut store) = tmp_store();
        let a = store.append(user_entry("A")).id.clone();
        let reply_a = store.append(assistant_entry("reply A")).id.clone();
        let b = store.append(user_entry("B")).id.clone();
        let reply_b = store.append(assistant_entry("reply B")).id.clone();

        store.set_leaf(&reply_a).unwrap();
        let c = store.append(user_entry("C")).id.clone();

        // Path is root → A → replyA → C.
        let ids: Vec<_> = store.current_path().iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec![a, reply_a, c]);
        // B and its reply are still present in the file.
        assert!(store.entry(&b).is_some());
        assert!(store.entry(&reply_b).is_some());
        let text = std::fs::read_to_string(store.path().unwrap()).unwrap();
        assert!(text.contains("reply B"));
    }

    #[test]
    fn fork_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = Path::new("/proj");
        let path;
        let expected: Vec<String>;
        {
            let mut store = SessionStore::create(dir.path(), cwd).unwrap();
            let a = store.append(user_entry("A")).id.clone();
            let ra = store.append(assistant_entry("reply A")).id.clone();
            store.append(user_entry("B"));
            store.append(assistant_entry("reply B"));
            store.set_leaf(&ra).unwrap();
            let c = store.append(user_entry("C")).id.clone();
            let rc = store.append(assistant_entry("reply C")).id.clone();
            expected = vec![a, ra, c, rc];
            path = store.path().unwrap().to_path_buf();
        }
        let store = SessionStore::open(&path, cwd).unwrap();
        let ids: Vec<_> = store.current_path().iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, expected);
        assert_eq!(store.entries().len(), 6, "all entries stay in the file");
    }

    #[test]
    fn set_leaf_rejects_unknown_entry() {
        let (_dir, mut store) = tmp_store();
        assert!(matches!(
            store.set_leaf("nope"),
            Err(StoreError::UnknownEntry(_))
        ));
    }

    #[test]
    fn context_projects_model_and_thinking_changes() {
        let (_dir, mut store) = tmp_store();
        store.append(EntryKind::ModelChange {
            provider: "anthropic".into(),
            model_id: "claude-haiku-4-5".into(),
        });
        store.append(user_entry("hi"));
        store.append(EntryKind::ModelChange {
            provider: "openai".into(),
            model_id: "gpt-5.2".into(),
        });
        store.append(EntryKind::ThinkingLevel {
            thinking_level: ThinkingLevel::High,
        });
        let ctx = store.build_session_context();
        assert_eq!(ctx.model, Some(("openai".into(), "gpt-5.2".into())));
        assert_eq!(ctx.thinking_level, Some(ThinkingLevel::High));
        assert_eq!(ctx.messages.len(), 1);
    }

    #[test]
    fn compaction_replaces_prefix_with_summary() {
        let (_dir, mut store) = tmp_store();
        for i in 0..4 {
            store.append(user_entry(&format!("old {i}")));
        }
        let first_kept = store.append(user_entry("kept 1")).id.clone();
        store.append(assistant_entry("kept reply"));
        store.append(EntryKind::Compaction {
            summary: "earlier conversation summary".into(),
            first_kept_entry_id: first_kept,
            tokens_before: 4000,
            details: None,
        });
        store.append(user_entry("after compaction"));

        let ctx = store.build_session_context();
        // summary + kept 1 + kept reply + after compaction
        assert_eq!(ctx.messages.len(), 4);
        match &ctx.messages[0] {
            Message::User { content, .. } => {
                assert_eq!(content.as_text(), Some("earlier conversation summary"))
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(&ctx.messages[1], Message::User { content, .. }
            if content.as_text() == Some("kept 1")));
    }

    #[test]
    fn in_memory_store_never_touches_disk() {
        let mut store = SessionStore::in_memory(Path::new("/proj"));
        store.append(user_entry("x"));
        assert!(store.path().is_none());
        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn list_reports_sessions_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = Path::new("/proj");
        {
            let mut s1 = SessionStore::create(dir.path(), cwd).unwrap();
            s1.append(user_entry("first session prompt"));
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        {
            let mut s2 = SessionStore::create(dir.path(), cwd).unwrap();
            s2.append(user_entry("second session prompt"));
            s2.append(EntryKind::SessionInfo {
                name: "named".into(),
            });
        }
        let infos = list(dir.path(), cwd);
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].name.as_deref(), Some("named"));
        assert_eq!(
            infos[0].first_message.as_deref(),
            Some("second session prompt")
        );
        assert_eq!(infos[1].message_count, 1);
        assert!(infos[1].all_messages_text.contains("first session prompt"));
    }

    #[test]
    fn continue_recent_picks_latest_by_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = Path::new("/proj");
        let older;
        {
            let mut s = SessionStore::create(dir.path(), cwd).unwrap();
            s.append(user_entry("old"));
            older = s.session_id().to_string();
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        let newer;
        {
            let mut s = SessionStore::create(dir.path(), cwd).unwrap();
            s.append(user_entry("new"));
            newer = s.session_id().to_string();
        }
        let store = SessionStore::continue_recent(dir.path(), cwd).unwrap();
        assert_eq!(store.session_id(), newer);
        assert_ne!(store.session_id(), older);
    }

    #[test]
    fn continue_recent_errors_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SessionStore::continue_recent(dir.path(), Path::new("/proj")),
            Err(StoreError::NoRecentSession)
        ));
    }

    #[test]
    fn different_cwds_use_disjoint_directories() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut s = SessionStore::create(dir.path(), Path::new("/proj-a")).unwrap();
            s.append(user_entry("a"));
        }
        assert!(list(dir.path(), Path::new("/proj-b")).is_empty());
        assert_eq!(list(dir.path(), Path::new("/proj-a")).len(), 1);
    }
}
