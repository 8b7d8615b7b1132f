//! Persistence collaborators used by the advisor pipeline
//!
//! [`MessageStore`] is the database-facing side (owned by the application's
//! CRUD layer); [`FallbackStore`] is the durable local side store that keeps
//! writes the queue gave up on.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tokio::sync::RwLock;

use crate::errors::{StoreError, StoreResult};
use crate::models::chat::{ChatMessage, Sender};
use crate::queue::{NewMessage, QueuedMessage};

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Check that `user_id` may write to `conversation_id`.
    async fn authorize(&self, conversation_id: &str, user_id: &str) -> StoreResult<()>;

    /// Durably store the user's message for a turn. Must complete before the
    /// model is called.
    async fn persist_user_message(
        &self,
        conversation_id: &str,
        user_id: &str,
        content: &str,
        message_order: u64,
    ) -> StoreResult<ChatMessage>;

    /// Store (or overwrite, keyed by id) an assistant or system message.
    async fn persist_message(&self, message: &NewMessage) -> StoreResult<()>;

    /// Messages of a conversation sorted by `message_order`.
    async fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<ChatMessage>>;

    /// Highest `message_order` stored for the conversation, 0 when empty.
    async fn last_message_order(&self, conversation_id: &str) -> StoreResult<u64>;
}

#[derive(Debug, Default)]
struct Conversation {
    owner: String,
    messages: HashMap<String, ChatMessage>,
}

/// Message store kept in process memory. The first user to write to a
/// conversation becomes its owner.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn authorize(&self, conversation_id: &str, user_id: &str) -> StoreResult<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Conversation {
                owner: user_id.to_string(),
                messages: HashMap::new(),
            });
        if conversation.owner != user_id {
            return Err(StoreError::Forbidden {
                user: user_id.to_string(),
                conversation: conversation_id.to_string(),
            });
        }
        Ok(())
    }

    async fn persist_user_message(
        &self,
        conversation_id: &str,
        user_id: &str,
        content: &str,
        message_order: u64,
    ) -> StoreResult<ChatMessage> {
        self.authorize(conversation_id, user_id).await?;
        let message = ChatMessage::new(conversation_id, Sender::User, content, message_order);

        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))?;
        conversation
            .messages
            .insert(message.id.clone(), message.clone());
        Ok(message)
    }

    async fn persist_message(&self, message: &NewMessage) -> StoreResult<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(&message.conversation_id)
            .ok_or_else(|| StoreError::ConversationNotFound(message.conversation_id.clone()))?;
        conversation
            .messages
            .insert(message.id.clone(), message.to_chat_message());
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<ChatMessage>> {
        let conversations = self.conversations.read().await;
        let mut messages: Vec<ChatMessage> = conversations
            .get(conversation_id)
            .map(|c| c.messages.values().cloned().collect())
            .unwrap_or_default();
        messages.sort_by(|a, b| {
            a.message_order
                .cmp(&b.message_order)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(messages)
    }

    async fn last_message_order(&self, conversation_id: &str) -> StoreResult<u64> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(conversation_id)
            .and_then(|c| c.messages.values().map(|m| m.message_order).max())
            .unwrap_or(0))
    }
}

/// Durable side store for writes that exhausted their retries.
///
/// Implementations keep a single recovery list; `append` never stores the
/// same message id twice.
pub trait FallbackStore: Send + Sync {
    fn load(&self) -> StoreResult<Vec<QueuedMessage>>;

    fn append(&self, item: QueuedMessage) -> StoreResult<()>;

    /// Remove and return everything in the recovery list.
    fn take(&self) -> StoreResult<Vec<QueuedMessage>>;
}

fn push_unique(items: &mut Vec<QueuedMessage>, item: QueuedMessage) -> bool {
    if items.iter().any(|existing| existing.message.id == item.message.id) {
        return false;
    }
    items.push(item);
    true
}

#[derive(Debug, Default)]
pub struct MemoryFallbackStore {
    items: Mutex<Vec<QueuedMessage>>,
}

impl MemoryFallbackStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FallbackStore for MemoryFallbackStore {
    fn load(&self) -> StoreResult<Vec<QueuedMessage>> {
        Ok(self.items.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn append(&self, item: QueuedMessage) -> StoreResult<()> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        push_unique(&mut items, item);
        Ok(())
    }

    fn take(&self) -> StoreResult<Vec<QueuedMessage>> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        Ok(std::mem::take(&mut *items))
    }
}

/// Recovery list kept as a JSON array in a local file.
#[derive(Debug)]
pub struct FileFallbackStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileFallbackStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `~/.local/share/advisor/failed_messages.json` (or the platform equivalent).
    pub fn default_path() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine local data directory"))?;
        Ok(data_dir.join("advisor").join("failed_messages.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> StoreResult<Vec<QueuedMessage>> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        // Only a never-written file counts as empty; anything unreadable is
        // reported so the next write cannot replace it.
        if file.metadata()?.len() == 0 {
            return Ok(Vec::new());
        }
        let items = serde_json::from_reader(BufReader::new(file))?;
        Ok(items)
    }

    /// Replace the file atomically: write a sibling temp file, then rename it
    /// over the target.
    fn write(&self, items: &[QueuedMessage]) -> StoreResult<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut temp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, items)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl FallbackStore for FileFallbackStore {
    fn load(&self) -> StoreResult<Vec<QueuedMessage>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read()
    }

    fn append(&self, item: QueuedMessage) -> StoreResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut items = self.read()?;
        if push_unique(&mut items, item) {
            self.write(&items)?;
        }
        Ok(())
    }

    fn take(&self) -> StoreResult<Vec<QueuedMessage>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let items = self.read()?;
        if !items.is_empty() {
            self.write(&[])?;
        }
        Ok(items)
    }
}
