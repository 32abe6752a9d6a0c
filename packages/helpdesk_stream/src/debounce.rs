//! Per-conversation batching of `message.created` events.
//!
//! The first message for a conversation arms a timer for the window; later
//! messages join the buffer without re-arming it. Timers never flush on their
//! own: they send a [`Wake`] tagged with the buffer's generation back to the
//! event loop, which calls [`DebounceAggregator::on_wake`]. A wake whose
//! generation no longer matches (the buffer already flushed on size) is stale
//! and ignored.

use std::collections::HashMap;
use std::time::Duration;

use helpdesk_api::models::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wake {
    pub conversation_id: u64,
    pub generation: u64,
}

/// Messages of one conversation flushed together, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub conversation_id: u64,
    pub messages: Vec<Message>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn first_created_at(&self) -> i64 {
        self.messages
            .iter()
            .map(|m| m.created_at)
            .min()
            .unwrap_or_default()
    }

    pub fn last_created_at(&self) -> i64 {
        self.messages
            .iter()
            .map(|m| m.created_at)
            .max()
            .unwrap_or_default()
    }

    /// The message to display for the batch: latest timestamp, then highest id.
    pub fn newest(&self) -> Option<&Message> {
        self.messages.iter().max_by_key(|m| (m.created_at, m.id))
    }

    pub fn max_message_id(&self) -> u64 {
        self.messages.iter().map(|m| m.id).max().unwrap_or_default()
    }

    pub fn message_ids(&self) -> Vec<u64> {
        self.messages.iter().map(|m| m.id).collect()
    }

    /// Non-empty contents joined by newlines, in arrival order.
    pub fn content(&self) -> String {
        self.messages
            .iter()
            .filter_map(|m| m.content.as_deref())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

struct Pending {
    generation: u64,
    messages: Vec<Message>,
    timer: JoinHandle<()>,
}

pub struct DebounceAggregator {
    window: Duration,
    max_batch: usize,
    buffers: HashMap<u64, Pending>,
    next_generation: u64,
    wake_tx: mpsc::UnboundedSender<Wake>,
}

impl DebounceAggregator {
    /// The receiver yields timer wake-ups; feed them to [`Self::on_wake`].
    pub fn new(window: Duration, max_batch: usize) -> (Self, mpsc::UnboundedReceiver<Wake>) {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let aggregator = Self {
            window,
            max_batch: max_batch.max(1),
            buffers: HashMap::new(),
            next_generation: 0,
            wake_tx,
        };
        (aggregator, wake_rx)
    }

    pub fn pending_conversations(&self) -> usize {
        self.buffers.len()
    }

    /// Buffer a message. Returns a batch when the buffer reached `max_batch`.
    pub fn push(&mut self, message: Message) -> Option<Batch> {
        let conversation_id = message.conversation_id;
        if !self.buffers.contains_key(&conversation_id) {
            let pending = self.arm(conversation_id);
            self.buffers.insert(conversation_id, pending);
        }
        let full = match self.buffers.get_mut(&conversation_id) {
            Some(pending) => {
                pending.messages.push(message);
                pending.messages.len() >= self.max_batch
            }
            None => false,
        };

        if full {
            debug!(conversation_id, "debounce buffer full, flushing");
            return self.take(conversation_id);
        }
        None
    }

    /// Flush the buffer the wake-up was armed for, unless it is stale.
    pub fn on_wake(&mut self, wake: Wake) -> Option<Batch> {
        let current = self.buffers.get(&wake.conversation_id)?;
        if current.generation != wake.generation {
            return None;
        }
        self.take(wake.conversation_id)
    }

    /// Everything pending, ordered by conversation id.
    pub fn flush_all(&mut self) -> Vec<Batch> {
        let mut ids: Vec<u64> = self.buffers.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().filter_map(|id| self.take(id)).collect()
    }

    fn arm(&mut self, conversation_id: u64) -> Pending {
        self.next_generation += 1;
        let wake = Wake {
            conversation_id,
            generation: self.next_generation,
        };
        let tx = self.wake_tx.clone();
        let window = self.window;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = tx.send(wake);
        });
        Pending {
            generation: wake.generation,
            messages: Vec::new(),
            timer,
        }
    }

    fn take(&mut self, conversation_id: u64) -> Option<Batch> {
        let pending = self.buffers.remove(&conversation_id)?;
        pending.timer.abort();
        Some(Batch {
            conversation_id,
            messages: pending.messages,
        })
    }
}

impl Drop for DebounceAggregator {
    fn drop(&mut self) {
        for pending in self.buffers.values() {
            pending.timer.abort();
        }
    }
}
