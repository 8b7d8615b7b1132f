//! Write queue between the live chat and durable storage
//!
//! Assistant messages are queued instead of written inline so a slow or
//! failing database never stalls the stream. Batches are persisted in
//! parallel, failures are retried with a linear backoff and, once out of
//! retries, parked in the [`FallbackStore`] until the next recovery.
//!
//! The queue does not deliver in order. Every item carries the
//! `message_order` assigned before it was queued, and readers sort by it.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use crate::errors::StoreError;
use crate::models::chat::{ChatMessage, Sender};
use crate::models::component::ComponentAction;
use crate::store::{FallbackStore, MessageStore};

/// A message ready to be written by the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender: Sender,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_timestamp: Option<DateTime<Utc>>,
    pub message_order: u64,
}

impl NewMessage {
    /// Capture a chat message for persistence. The component payload and the
    /// response id travel in `metadata`.
    pub fn from_chat(message: &ChatMessage) -> Self {
        let mut metadata = Map::new();
        if let Some(component) = &message.component {
            metadata.insert("component".to_string(), json!(component));
        }
        if let Some(response_id) = &message.response_id {
            metadata.insert("responseId".to_string(), json!(response_id));
        }

        Self {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            sender: message.sender,
            content: message.content.clone(),
            component_id: message.component.as_ref().map(|c| c.component_id.clone()),
            metadata: (!metadata.is_empty()).then_some(Value::Object(metadata)),
            custom_timestamp: Some(message.created_at),
            message_order: message.message_order,
        }
    }

    pub fn with_metadata<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        let metadata = self
            .metadata
            .get_or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = metadata {
            map.insert(key.into(), value);
        }
        self
    }

    /// Rebuild the chat view of a stored message.
    pub fn to_chat_message(&self) -> ChatMessage {
        let metadata = self.metadata.as_ref();
        let component = metadata
            .and_then(|m| m.get("component"))
            .and_then(|c| serde_json::from_value::<ComponentAction>(c.clone()).ok());
        let response_id = metadata
            .and_then(|m| m.get("responseId"))
            .and_then(|r| r.as_str())
            .map(String::from);

        ChatMessage {
            id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            sender: self.sender,
            content: self.content.clone(),
            is_streaming: false,
            component,
            response_id,
            message_order: self.message_order,
            created_at: self.custom_timestamp.unwrap_or_else(Utc::now),
        }
    }
}

/// A persistence work item owned by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    #[serde(flatten)]
    pub message: NewMessage,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip)]
    retry_at: Option<Instant>,
}

impl QueuedMessage {
    pub fn new(message: NewMessage) -> Self {
        Self {
            message,
            retry_count: 0,
            enqueued_at: Utc::now(),
            retry_at: None,
        }
    }

    fn is_ready(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Items persisted concurrently per batch, and items evicted on overflow
    pub batch_size: usize,
    pub max_queue_size: usize,
    /// Retries after the first failed attempt before an item is parked
    pub max_retries: u32,
    /// Backoff unit; the n-th retry waits `retry_delay * n`
    pub retry_delay: Duration,
    pub flush_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_queue_size: 100,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            flush_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub in_flight: usize,
    pub persisted: u64,
    pub retried: u64,
    pub failed: u64,
    pub evicted: u64,
    pub recovered: u64,
}

#[derive(Default)]
struct State {
    items: VecDeque<QueuedMessage>,
    // Copies of the batch currently being written
    writing: Vec<NewMessage>,
    stats: QueueStats,
}

struct Inner {
    config: QueueConfig,
    store: Arc<dyn MessageStore>,
    fallback: Arc<dyn FallbackStore>,
    state: Mutex<State>,
    pending: tokio::sync::Mutex<JoinSet<()>>,
    // Signalled whenever a batch finishes
    settled: Notify,
}

/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct WriteQueue {
    inner: Arc<Inner>,
}

impl WriteQueue {
    pub fn new(
        config: QueueConfig,
        store: Arc<dyn MessageStore>,
        fallback: Arc<dyn FallbackStore>,
    ) -> Self {
        let config = QueueConfig {
            batch_size: config.batch_size.max(1),
            max_queue_size: config.max_queue_size.max(1),
            flush_interval: config.flush_interval.max(Duration::from_millis(1)),
            ..config
        };
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                fallback,
                state: Mutex::new(State::default()),
                pending: tokio::sync::Mutex::new(JoinSet::new()),
                settled: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a message. When the queue is full the oldest batch is evicted
    /// so the newest writes are kept.
    pub fn enqueue(&self, message: NewMessage) {
        self.push(QueuedMessage::new(message));
    }

    fn push(&self, item: QueuedMessage) {
        let config = &self.inner.config;
        let mut state = self.state();
        if state.items.len() >= config.max_queue_size {
            let count = config.batch_size.min(state.items.len());
            let evicted: Vec<QueuedMessage> = state.items.drain(..count).collect();
            state.stats.evicted += count as u64;
            tracing::warn!(
                "Write queue full ({} items), evicted {} oldest messages: {:?}",
                config.max_queue_size,
                count,
                evicted.iter().map(|i| &i.message.id).collect::<Vec<_>>()
            );
        }
        state.items.push_back(item);
        state.stats.queued = state.items.len();
    }

    /// Persist right away instead of waiting for the next batch.
    ///
    /// The write runs as a tracked task; if it fails the item joins the normal
    /// queue as a first retry.
    pub async fn enqueue_immediate(&self, message: NewMessage) {
        let queue = self.clone();
        let mut pending = self.inner.pending.lock().await;
        while pending.try_join_next().is_some() {}
        pending.spawn(async move {
            let item = QueuedMessage::new(message);
            match queue.inner.store.persist_message(&item.message).await {
                Ok(()) => queue.state().stats.persisted += 1,
                Err(e) => {
                    tracing::warn!("Immediate persist of {} failed: {}", item.message.id, e);
                    queue.handle_failure(item, e);
                }
            }
        });
    }

    /// Wait for every write started by [`WriteQueue::enqueue_immediate`].
    pub async fn wait_for_pending(&self) {
        let mut pending = self.inner.pending.lock().await;
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                tracing::error!("Immediate persist task failed: {}", e);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().items.is_empty()
    }

    /// Messages of a conversation that are queued or being written but not
    /// yet confirmed by storage, sorted by message order.
    pub fn pending_messages(&self, conversation_id: &str) -> Vec<ChatMessage> {
        let state = self.state();
        let mut messages: Vec<ChatMessage> = state
            .items
            .iter()
            .map(|item| &item.message)
            .chain(state.writing.iter())
            .filter(|message| message.conversation_id == conversation_id)
            .map(NewMessage::to_chat_message)
            .collect();
        messages.sort_by_key(|message| message.message_order);
        messages.dedup_by(|a, b| a.id == b.id);
        messages
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state();
        QueueStats {
            queued: state.items.len(),
            ..state.stats.clone()
        }
    }

    /// Take up to one batch of items whose backoff has elapsed, leaving the
    /// rest in their current order.
    fn take_ready(&self) -> Vec<QueuedMessage> {
        let batch_size = self.inner.config.batch_size;
        let now = Instant::now();
        let mut state = self.state();

        let mut batch = Vec::new();
        let mut rest = VecDeque::with_capacity(state.items.len());
        while let Some(item) = state.items.pop_front() {
            if batch.len() < batch_size && item.is_ready(now) {
                batch.push(item);
            } else {
                rest.push_back(item);
            }
        }
        state.items = rest;
        state.stats.queued = state.items.len();
        state.stats.in_flight += batch.len();
        state
            .writing
            .extend(batch.iter().map(|item| item.message.clone()));
        batch
    }

    /// Persist one batch in parallel. Returns how many items were written.
    pub async fn flush_batch(&self) -> usize {
        let batch = self.take_ready();
        if batch.is_empty() {
            return 0;
        }

        let store = &self.inner.store;
        let results = join_all(batch.iter().map(|item| store.persist_message(&item.message))).await;

        let total = batch.len();
        let ids: Vec<String> = batch.iter().map(|item| item.message.id.clone()).collect();
        let mut persisted = 0;
        for (item, result) in batch.into_iter().zip(results) {
            match result {
                Ok(()) => persisted += 1,
                Err(e) => self.handle_failure(item, e),
            }
        }

        {
            let mut state = self.state();
            state.stats.in_flight -= total;
            state.stats.persisted += persisted as u64;
            state.writing.retain(|message| !ids.contains(&message.id));
        }
        self.inner.settled.notify_waiters();
        tracing::debug!("Flushed batch: {} of {} persisted", persisted, total);
        persisted
    }

    fn handle_failure(&self, mut item: QueuedMessage, error: StoreError) {
        item.retry_count += 1;
        if item.retry_count > self.inner.config.max_retries {
            tracing::error!(
                "Giving up on message {} after {} retries: {}",
                item.message.id,
                self.inner.config.max_retries,
                error
            );
            self.state().stats.failed += 1;
            self.park(item);
            return;
        }

        let delay = self.inner.config.retry_delay * item.retry_count;
        tracing::warn!(
            "Persist of message {} failed (attempt {}), retrying in {:?}: {}",
            item.message.id,
            item.retry_count,
            delay,
            error
        );
        item.retry_at = Some(Instant::now() + delay);
        self.state().stats.retried += 1;
        self.push(item);
    }

    fn park(&self, item: QueuedMessage) {
        let id = item.message.id.clone();
        if let Err(e) = self.inner.fallback.append(item) {
            tracing::error!("Failed to move message {} to fallback storage: {}", id, e);
        }
    }

    /// Move everything in the fallback store back into the queue with a fresh
    /// retry budget. Returns the number of recovered items.
    pub fn recover_failed(&self) -> usize {
        let items = match self.inner.fallback.take() {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!("Could not read fallback storage: {}", e);
                return 0;
            }
        };

        let count = items.len();
        for mut item in items {
            item.retry_count = 0;
            item.retry_at = None;
            self.push(item);
        }
        if count > 0 {
            tracing::info!("Recovered {} messages from fallback storage", count);
            self.state().stats.recovered += count as u64;
        }
        count
    }

    /// Recover parked items, then drain the whole queue, waiting out backoff
    /// delays and batches other tasks still have in flight. Items that fail
    /// for good end up back in fallback storage.
    pub async fn flush(&self) -> QueueStats {
        self.recover_failed();
        loop {
            self.wait_for_pending().await;

            // Registered before the check so a batch finishing in between is not missed
            let settled = self.inner.settled.notified();
            let (idle, in_flight, earliest) = {
                let state = self.state();
                let now = Instant::now();
                let earliest = if state.items.iter().any(|item| item.is_ready(now)) {
                    None
                } else {
                    state.items.iter().filter_map(|item| item.retry_at).min()
                };
                (state.items.is_empty(), state.stats.in_flight, earliest)
            };
            if idle {
                if in_flight == 0 {
                    break;
                }
                settled.await;
                continue;
            }
            if let Some(deadline) = earliest {
                tokio::time::sleep_until(deadline).await;
            }

            self.flush_batch().await;
        }
        self.stats()
    }

    /// Move every queued item to fallback storage without trying to write it.
    pub fn park_all(&self) -> usize {
        let items: Vec<QueuedMessage> = {
            let mut state = self.state();
            let items = state.items.drain(..).collect();
            state.stats.queued = 0;
            items
        };
        let count = items.len();
        for item in items {
            self.park(item);
        }
        count
    }

    /// Flush periodically in the background.
    ///
    /// Ticks are skipped while `online` is false. When it flips back to true
    /// the fallback store is recovered and flushed. On shutdown the queue is
    /// drained, or parked when offline.
    pub fn spawn_worker(&self, mut online: watch::Receiver<bool>) -> QueueWorker {
        let queue = self.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.inner.config.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut was_online = *online.borrow_and_update();
            let mut signal_open = true;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        if was_online && !queue.is_empty() {
                            queue.flush_batch().await;
                        }
                    }
                    changed = online.changed(), if signal_open => {
                        if changed.is_err() {
                            signal_open = false;
                            continue;
                        }
                        let is_online = *online.borrow_and_update();
                        if is_online && !was_online {
                            tracing::info!("Storage back online, retrying parked messages");
                            queue.recover_failed();
                            queue.flush_batch().await;
                        } else if !is_online && was_online {
                            tracing::warn!("Storage offline, pausing write queue");
                        }
                        was_online = is_online;
                    }
                }
            }

            if was_online {
                let stats = queue.flush().await;
                tracing::info!("Write queue drained on shutdown: {:?}", stats);
            } else {
                let parked = queue.park_all();
                tracing::warn!("Shutting down offline, parked {} queued messages", parked);
            }
        });

        QueueWorker {
            shutdown: Some(shutdown_tx),
            handle,
        }
    }
}

/// Handle to the background flush task.
pub struct QueueWorker {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl QueueWorker {
    /// Stop ticking, drain the queue and wait for the task to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.handle.await {
            tracing::error!("Write queue worker failed: {}", e);
        }
    }
}
