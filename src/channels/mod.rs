//! Channel abstraction: one adapter per external chat system.
//!
//! Every adapter owns a disjoint slice of the JID space, reads its
//! credentials from the env file (never the process environment), buffers
//! outbound sends while disconnected, and reports inbound traffic through
//! the [`InboundSink`] callbacks it was constructed with.

mod mail;
mod slack;
mod whatsapp;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::types::StoredMessage;

pub use mail::MailChannel;
pub use slack::SlackChannel;
pub use whatsapp::WhatsAppChannel;

/// Default outbound length cap; adapters can override per platform.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 4000;

/// A communication channel (WhatsApp bridge, Slack socket mode, mail).
///
/// `owns_jid` is the routing key: predicates across the configured channel
/// set never overlap, so any JID resolves to at most one adapter.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &'static str;

    fn owns_jid(&self, jid: &str) -> bool;

    fn is_connected(&self) -> bool;

    /// Bring the connection up and flush the outgoing queue. Long-running
    /// work (socket reads, polling) continues on a background task; the
    /// call returns once the channel is usable.
    async fn connect(self: Arc<Self>) -> anyhow::Result<()>;

    /// Tear the connection down. Pending outbound messages stay queued.
    async fn disconnect(&self);

    /// Send text to a conversation, splitting to the platform limit.
    /// While disconnected the message is queued for the next connect.
    async fn send_message(&self, jid: &str, text: &str) -> anyhow::Result<()>;

    /// Best-effort typing indicator; a no-op where unsupported.
    async fn set_typing(&self, _jid: &str, _on: bool) -> anyhow::Result<()> {
        Ok(())
    }

    fn max_message_len(&self) -> usize {
        DEFAULT_MAX_MESSAGE_LEN
    }
}

/// Inbound callbacks, supplied at channel construction. The orchestrator
/// implements this: metadata and messages land in the store, and
/// registered conversations get a message check enqueued.
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn on_chat_metadata(
        &self,
        jid: &str,
        ts: &str,
        name: Option<&str>,
        channel_tag: &str,
        is_group: bool,
    );

    async fn on_message(&self, jid: &str, msg: StoredMessage);
}

/// Per-channel FIFO for sends attempted while disconnected (or that threw
/// mid-send). Flushed in arrival order on connect.
pub struct OutgoingQueue {
    items: Mutex<VecDeque<(String, String)>>,
}

impl OutgoingQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, jid: &str, text: &str) {
        self.items
            .lock()
            .expect("outgoing queue lock poisoned")
            .push_back((jid.to_string(), text.to_string()));
    }

    /// Take everything, oldest first.
    pub fn drain(&self) -> Vec<(String, String)> {
        self.items
            .lock()
            .expect("outgoing queue lock poisoned")
            .drain(..)
            .collect()
    }

    /// Put undelivered items back at the front, preserving their order
    /// ahead of anything queued meanwhile.
    pub fn restore(&self, items: Vec<(String, String)>) {
        let mut queue = self.items.lock().expect("outgoing queue lock poisoned");
        for item in items.into_iter().rev() {
            queue.push_front(item);
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("outgoing queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OutgoingQueue {
    fn default() -> Self {
        Self::new()
    }
}
