use std::collections::HashMap;
use std::sync::Mutex;

/// Hands out the monotonic `message_order` for each conversation.
///
/// Persistence may complete in any order, so every message is tagged before it
/// is queued; sorting by this value recovers the emission order.
#[derive(Debug, Default)]
pub struct MessageSequencer {
    counters: Mutex<HashMap<String, u64>>,
}

impl MessageSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next order value for `conversation_id`. The first value
    /// handed out for an unseen conversation is 1.
    pub fn next(&self, conversation_id: &str) -> u64 {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let counter = counters.entry(conversation_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Raise the floor so later values are greater than `order`.
    ///
    /// Used to seed the counter from storage; lower values are ignored.
    pub fn observe(&self, conversation_id: &str, order: u64) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let counter = counters.entry(conversation_id.to_string()).or_insert(0);
        if order > *counter {
            *counter = order;
        }
    }

    /// Last value handed out (or observed) for the conversation.
    pub fn current(&self, conversation_id: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.get(conversation_id).copied().unwrap_or(0)
    }
}
