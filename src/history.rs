//! Append-only chat history keyed by conversation.
//!
//! The whole mapping lives in memory and is mirrored to a [`Durable`] backend
//! on every append. Backends only move whole documents; parsing, self-healing
//! and the media-URL migration live in [`HistoryStore`].

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use tracing::{error, info, warn};

use crate::{
    media,
    message::{ChatUser, MediaType, Message, conversation_key},
};

/// Conversation key → messages in arrival order.
pub type Conversations = BTreeMap<String, Vec<Message>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("history file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not encode history: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("in-memory history backend refused the write")]
    Unavailable,
}

/// Durable side of the history store.
pub trait Durable: Send {
    /// Returns the stored document, or `None` when nothing was ever written.
    fn read(&mut self) -> Result<Option<String>, StoreError>;

    /// Replaces the stored document with `conversations`.
    fn write(&mut self, conversations: &Conversations) -> Result<(), StoreError>;

    /// Moves an unreadable document out of the way.
    fn quarantine(&mut self) -> Result<(), StoreError>;
}

/// A single pretty-printed JSON document on disk.
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn io_error(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl Durable for JsonFile {
    fn read(&mut self) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(doc) => Ok(Some(doc)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    // Written to a sibling temp file, synced, then renamed over the original
    // so a crash never leaves a half-written document behind.
    fn write(&mut self, conversations: &Conversations) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(conversations)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let tmp = self.sibling(".tmp");
        let mut file = File::create(&tmp).map_err(|e| self.io_error(e))?;
        file.write_all(&bytes).map_err(|e| self.io_error(e))?;
        file.sync_all().map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))
    }

    fn quarantine(&mut self) -> Result<(), StoreError> {
        let aside = self.sibling(".corrupt");
        warn!("moving unreadable history {} to {}", self.path.display(), aside.display());
        fs::rename(&self.path, &aside).map_err(|e| self.io_error(e))
    }
}

#[derive(Default)]
struct EphemeralInner {
    document: Option<String>,
    quarantined: Option<String>,
    writes: usize,
    fail_writes: bool,
}

/// Keeps the "durable" document in memory.
///
/// Clones share the same document, so a test can keep one handle and hand
/// the other to a store.
#[derive(Clone, Default)]
pub struct Ephemeral {
    inner: Arc<Mutex<EphemeralInner>>,
}

impl Ephemeral {
    pub fn with_document(document: impl Into<String>) -> Self {
        let backend = Ephemeral::default();
        backend.lock().document = Some(document.into());
        backend
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EphemeralInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn document(&self) -> Option<String> {
        self.lock().document.clone()
    }

    pub fn quarantined(&self) -> Option<String> {
        self.lock().quarantined.clone()
    }

    /// Number of successful writes so far.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    /// Makes every subsequent write fail until switched back.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }
}

impl Durable for Ephemeral {
    fn read(&mut self) -> Result<Option<String>, StoreError> {
        Ok(self.lock().document.clone())
    }

    fn write(&mut self, conversations: &Conversations) -> Result<(), StoreError> {
        let doc = serde_json::to_string_pretty(conversations)?;
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(StoreError::Unavailable);
        }
        inner.document = Some(doc);
        inner.writes += 1;
        Ok(())
    }

    fn quarantine(&mut self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.quarantined = inner.document.take();
        Ok(())
    }
}

/// Outcome of [`HistoryStore::load`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub conversations: usize,
    pub messages: usize,
    /// Messages whose media reference was rewritten to the relative form.
    pub migrated: usize,
    /// True when an unreadable document was replaced with an empty one.
    pub recovered: bool,
}

pub struct HistoryStore {
    conversations: Conversations,
    durable: Box<dyn Durable>,
}

impl HistoryStore {
    pub fn new(durable: impl Durable + 'static) -> Self {
        HistoryStore {
            conversations: Conversations::new(),
            durable: Box::new(durable),
        }
    }

    /// Loads the durable document into memory.
    ///
    /// An absent or empty document starts an empty history and writes it out
    /// straight away; an unparsable one is quarantined first. Afterwards every
    /// media reference is migrated to the relative form, persisting once if
    /// anything changed. Errors mean the durable side is unusable.
    pub fn load(&mut self) -> Result<LoadReport, StoreError> {
        let mut recovered = false;

        self.conversations = match self.durable.read()? {
            Some(doc) if !doc.trim().is_empty() => match serde_json::from_str(&doc) {
                Ok(conversations) => conversations,
                Err(e) => {
                    error!("chat history is unreadable, starting empty: {e}");
                    self.durable.quarantine()?;
                    self.durable.write(&Conversations::new())?;
                    recovered = true;
                    Conversations::new()
                }
            },
            _ => {
                info!("no chat history found, starting empty");
                self.durable.write(&Conversations::new())?;
                Conversations::new()
            }
        };

        let migrated = self.migrate_media_urls();
        if migrated > 0 {
            self.durable.write(&self.conversations)?;
            info!("migrated {migrated} media reference(s) to relative paths");
        }

        Ok(LoadReport {
            conversations: self.conversations.len(),
            messages: self.conversations.values().map(Vec::len).sum(),
            migrated,
            recovered,
        })
    }

    fn migrate_media_urls(&mut self) -> usize {
        let mut changed = 0;
        for message in self.conversations.values_mut().flatten() {
            let Some(before) = message.media_url.as_deref() else {
                continue;
            };
            let after = media::to_relative_url(before);
            if after != before {
                message.media_url = Some(after);
                changed += 1;
            }
        }
        changed
    }

    /// Appends `message` under `key` and rewrites the durable document.
    ///
    /// Invalid messages are ignored. When the durable write fails the message
    /// stays in memory and the error is returned.
    pub fn append(&mut self, key: String, message: Message) -> Result<(), StoreError> {
        if !message.is_valid() {
            return Ok(());
        }
        self.conversations.entry(key).or_default().push(message);
        self.durable.write(&self.conversations)
    }

    pub fn read(&self, key: &str) -> &[Message] {
        self.conversations.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn read_between(&self, a: &str, b: &str) -> &[Message] {
        self.read(&conversation_key(a, b))
    }

    pub fn conversations(&self) -> impl Iterator<Item = (&String, &Vec<Message>)> {
        self.conversations.iter()
    }

    /// One entry per conversation `username` takes part in, built from its last message.
    pub fn chat_users(&self, username: &str) -> Vec<ChatUser> {
        let mut users: Vec<ChatUser> = Vec::new();

        for (key, messages) in self.conversations() {
            let Some(last) = messages.last() else {
                continue;
            };
            if !last.involves(username) {
                continue;
            }
            let other = if last.sender == username { &last.receiver } else { &last.sender };
            if other == username || *key != conversation_key(username, other) {
                continue;
            }
            if users.iter().any(|user| &user.username == other) {
                continue;
            }

            users.push(ChatUser {
                username: other.clone(),
                last_message: preview(last),
                last_message_time: last.timestamp.clone(),
                profile_url: Some(format!("{}/{other}.jpg", media::UPLOAD_BASE_PATH)),
            });
        }

        users
    }
}

fn preview(message: &Message) -> String {
    if !message.text.is_empty() {
        return message.text.clone();
    }
    match message.media_type {
        Some(MediaType::Image) => "Sent an image".to_string(),
        Some(MediaType::Video) => "Sent a video".to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(sender: &str, receiver: &str, body: &str) -> Message {
        Message {
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            text: body.to_string(),
            media_type: None,
            media_url: None,
            timestamp: "2024-05-01T10:00:00Z".to_string(),
        }
    }

    fn loaded(backend: &Ephemeral) -> HistoryStore {
        let mut store = HistoryStore::new(backend.clone());
        store.load().unwrap();
        store
    }

    #[test]
    fn absent_document_is_initialized() {
        let backend = Ephemeral::default();
        let report = HistoryStore::new(backend.clone()).load().unwrap();
        assert_eq!(report, LoadReport::default());
        assert_eq!(backend.document().as_deref().map(str::trim), Some("{}"));
    }

    #[test]
    fn append_preserves_arrival_order() {
        let backend = Ephemeral::default();
        let mut store = loaded(&backend);
        let key = conversation_key("alice", "bob");

        store.append(key.clone(), text("alice", "bob", "one")).unwrap();
        store.append(key.clone(), text("bob", "alice", "two")).unwrap();
        store.append(key.clone(), text("alice", "bob", "three")).unwrap();

        let bodies: Vec<&str> = store.read(&key).iter().map(|m| m.text.as_str()).collect();
        assert_eq!(bodies, ["one", "two", "three"]);
        assert_eq!(store.read_between("bob", "alice").len(), 3);
        assert!(store.read("nobody__else").is_empty());
    }

    #[test]
    fn append_writes_through() {
        let backend = Ephemeral::default();
        let mut store = loaded(&backend);
        store
            .append(conversation_key("alice", "bob"), text("alice", "bob", "hi"))
            .unwrap();

        let mut reloaded = HistoryStore::new(backend.clone());
        let report = reloaded.load().unwrap();
        assert_eq!(report.messages, 1);
        assert_eq!(reloaded.read_between("alice", "bob")[0].text, "hi");
    }

    #[test]
    fn invalid_message_is_not_appended() {
        let backend = Ephemeral::default();
        let mut store = loaded(&backend);
        let writes = backend.writes();

        store
            .append(conversation_key("alice", "bob"), text("alice", "bob", "  "))
            .unwrap();

        assert!(store.read_between("alice", "bob").is_empty());
        assert_eq!(backend.writes(), writes);
    }

    #[test]
    fn failed_write_keeps_message_in_memory() {
        let backend = Ephemeral::default();
        let mut store = loaded(&backend);
        backend.fail_writes(true);

        let result = store.append(conversation_key("alice", "bob"), text("alice", "bob", "hi"));
        assert!(matches!(result, Err(StoreError::Unavailable)));
        assert_eq!(store.read_between("alice", "bob").len(), 1);

        backend.fail_writes(false);
        store
            .append(conversation_key("alice", "bob"), text("alice", "bob", "again"))
            .unwrap();
        let mut reloaded = HistoryStore::new(backend.clone());
        assert_eq!(reloaded.load().unwrap().messages, 2);
    }

    #[test]
    fn migration_rewrites_absolute_urls_once() {
        let doc = r#"{
            "alice__bob": [
                {"sender":"alice","receiver":"bob","text":"","mediaType":"image",
                 "mediaUrl":"http://192.168.0.107:3001/uploads/cat.jpg","timestamp":"t1"},
                {"sender":"bob","receiver":"alice","text":"nice","mediaType":null,
                 "mediaUrl":null,"timestamp":"t2"}
            ]
        }"#;
        let backend = Ephemeral::with_document(doc);

        let mut store = HistoryStore::new(backend.clone());
        let first = store.load().unwrap();
        assert_eq!(first.migrated, 1);
        assert_eq!(
            store.read_between("alice", "bob")[0].media_url.as_deref(),
            Some("/uploads/cat.jpg")
        );
        let writes = backend.writes();
        let persisted = backend.document();

        let mut again = HistoryStore::new(backend.clone());
        let second = again.load().unwrap();
        assert_eq!(second.migrated, 0);
        assert_eq!(backend.writes(), writes);
        assert_eq!(backend.document(), persisted);
    }

    #[test]
    fn corrupt_document_is_quarantined() {
        let backend = Ephemeral::with_document("{ not json");
        let mut store = HistoryStore::new(backend.clone());
        let report = store.load().unwrap();

        assert!(report.recovered);
        assert_eq!(backend.quarantined().as_deref(), Some("{ not json"));
        assert_eq!(backend.document().as_deref().map(str::trim), Some("{}"));
    }

    #[test]
    fn null_text_record_loads_without_recovery() {
        let doc = r#"{"alice__bob":[
            {"sender":"alice","receiver":"bob","text":null,"mediaType":"image","mediaUrl":"/uploads/a.jpg","timestamp":"T1"},
            {"sender":"bob","receiver":"alice","text":"nice","mediaType":null,"mediaUrl":null,"timestamp":"T2"}
        ]}"#;
        let backend = Ephemeral::with_document(doc);
        let mut store = HistoryStore::new(backend.clone());
        let report = store.load().unwrap();

        assert!(!report.recovered);
        assert_eq!(report.messages, 2);
        assert!(backend.quarantined().is_none());
        assert_eq!(store.read_between("bob", "alice")[0].text, "");
    }

    #[test]
    fn unwritable_backend_fails_load() {
        let backend = Ephemeral::default();
        backend.fail_writes(true);
        assert!(HistoryStore::new(backend).load().is_err());
    }

    #[test]
    fn chat_users_reports_last_message() {
        let backend = Ephemeral::default();
        let mut store = loaded(&backend);
        store
            .append(conversation_key("alice", "bob"), text("alice", "bob", "hello"))
            .unwrap();
        store
            .append(conversation_key("alice", "bob"), text("bob", "alice", "hey alice"))
            .unwrap();
        let mut photo = text("carol", "alice", "");
        photo.media_type = Some(MediaType::Image);
        photo.media_url = Some("/uploads/p.jpg".to_string());
        store.append(conversation_key("carol", "alice"), photo).unwrap();
        store
            .append(conversation_key("bob", "carol"), text("bob", "carol", "not alice"))
            .unwrap();

        let users = store.chat_users("alice");
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].username, "bob");
        assert_eq!(users[0].last_message, "hey alice");
        assert_eq!(users[0].profile_url.as_deref(), Some("/uploads/bob.jpg"));
        assert_eq!(users[1].username, "carol");
        assert_eq!(users[1].last_message, "Sent an image");

        assert!(store.chat_users("al").is_empty());
    }

    #[test]
    fn json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("chat-history.json");

        let file = JsonFile::new(&path);
        assert_eq!(file.path(), path.as_path());
        let mut store = HistoryStore::new(file);
        store.load().unwrap();
        assert!(path.exists());
        store
            .append(conversation_key("alice", "bob"), text("alice", "bob", "persisted"))
            .unwrap();

        let mut reopened = HistoryStore::new(JsonFile::new(&path));
        assert_eq!(reopened.load().unwrap().messages, 1);
        assert_eq!(reopened.read_between("bob", "alice")[0].text, "persisted");
    }

    #[test]
    fn json_file_corruption_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat-history.json");
        fs::write(&path, "[1, 2").unwrap();

        let report = HistoryStore::new(JsonFile::new(&path)).load().unwrap();
        assert!(report.recovered);
        assert_eq!(fs::read_to_string(dir.path().join("chat-history.json.corrupt")).unwrap(), "[1, 2");
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), "{}");
    }
}
