use advisor::providers::base::Provider;
use advisor::queue::WriteQueue;
use advisor::sequence::MessageSequencer;
use advisor::store::MessageStore;
use std::sync::Arc;
use tokio::sync::watch;

use crate::configuration::ChatSettings;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<dyn Provider>,
    pub store: Arc<dyn MessageStore>,
    pub queue: WriteQueue,
    pub sequencer: Arc<MessageSequencer>,
    /// Drives the queue worker; false pauses flushing
    pub online: Arc<watch::Sender<bool>>,
    pub chat: ChatSettings,
}

impl AppState {
    pub fn new(
        provider: Arc<dyn Provider>,
        store: Arc<dyn MessageStore>,
        queue: WriteQueue,
        online: watch::Sender<bool>,
        chat: ChatSettings,
    ) -> Self {
        Self {
            provider,
            store,
            queue,
            sequencer: Arc::new(MessageSequencer::new()),
            online: Arc::new(online),
            chat,
        }
    }
}
