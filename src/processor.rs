//! Message batch processing: read uncursored messages for a group, decide
//! dispatch, drive an agent container, route its results back out, and
//! advance the cursor only on success.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::Channel;
use crate::config::CoreConfig;
use crate::container::{AgentRecord, ContainerLauncher, LaunchSpec};
use crate::groups::{self, GroupRegistry};
use crate::queue::GroupQueue;
use crate::router;
use crate::store::Store;
use crate::types::StoredMessage;
use crate::utils::now_ts;

/// Group folder → agent session id, for context continuity across
/// container restarts. Held by the orchestrator, shared with the
/// scheduler for `context_mode = group` tasks.
pub type SessionMap = Mutex<HashMap<String, String>>;

enum BatchOutcome {
    Success,
    Error(String),
}

pub struct MessageProcessor {
    config: Arc<CoreConfig>,
    store: Arc<Store>,
    groups: Arc<GroupRegistry>,
    queue: Arc<GroupQueue>,
    launcher: Arc<dyn ContainerLauncher>,
    channels: Vec<Arc<dyn Channel>>,
    sessions: Arc<SessionMap>,
}

impl MessageProcessor {
    pub fn new(
        config: Arc<CoreConfig>,
        store: Arc<Store>,
        groups: Arc<GroupRegistry>,
        queue: Arc<GroupQueue>,
        launcher: Arc<dyn ContainerLauncher>,
        channels: Vec<Arc<dyn Channel>>,
        sessions: Arc<SessionMap>,
    ) -> Self {
        Self {
            config,
            store,
            groups,
            queue,
            launcher,
            channels,
            sessions,
        }
    }

    /// One batch for one JID. `false` means the batch failed and the queue
    /// should retry with backoff; the cursor stays at its pre-batch value.
    pub async fn process_messages(&self, jid: &str) -> bool {
        let Some(group) = self.groups.get(jid) else {
            debug!(jid = %jid, "Message check for unregistered JID; nothing to do");
            return true;
        };

        let cursor = self.groups.cursor(jid);
        let messages = match self
            .store
            .get_messages_since(jid, &cursor, &self.config.assistant_name)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                warn!(jid = %jid, "Message read failed: {e}");
                return false;
            }
        };
        if messages.is_empty() {
            return true;
        }
        let newest = messages
            .last()
            .map(|m| m.timestamp.clone())
            .unwrap_or_default();

        let should_dispatch = if group.requires_trigger {
            match groups::trigger_regex(&group.trigger) {
                Ok(re) => messages.iter().any(|m| re.is_match(&m.content)),
                Err(e) => {
                    warn!(jid = %jid, trigger = %group.trigger, "Bad trigger pattern: {e}");
                    false
                }
            }
        } else {
            true
        };

        if !should_dispatch {
            // Nothing for the agent here; consume the batch.
            return self.advance_cursor(jid, &newest).await;
        }

        let Some(channel) = router::find_channel(&self.channels, jid) else {
            warn!(jid = %jid, "No channel owns this JID; cannot dispatch");
            return false;
        };
        let channel = Arc::clone(channel);

        // Saved for rollback: on failure the cursor is restored to this
        // value, so the next attempt replays the same batch.
        let cursor_before = cursor;

        let transcript = build_transcript(&messages);
        let _ = channel.set_typing(jid, true).await;

        let session_id = self
            .sessions
            .lock()
            .expect("session map lock poisoned")
            .get(&group.folder)
            .cloned();

        // Prefer feeding the still-running container; fall back to a
        // fresh spawn when there is none (or it belongs to a task). Reuse
        // must not depend on a recorded session: a live container always
        // outranks spawning a second one for the same JID.
        let mut events = None;
        if self.queue.send_message(jid, &transcript) {
            if let Some(handle) = self.queue.active_container(jid) {
                events = handle.take_events().map(|rx| (handle, rx));
            }
        }
        let (handle, mut events) = match events {
            Some(pair) => pair,
            None => {
                let spec = LaunchSpec {
                    jid: jid.to_string(),
                    group_folder: group.folder.clone(),
                    prompt: transcript,
                    session_id: session_id.clone(),
                    task_container: false,
                    extra_mounts: Vec::new(),
                };
                let handle = match self.launcher.launch(spec).await {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!(jid = %jid, "Agent container launch failed: {e}");
                        let _ = channel.set_typing(jid, false).await;
                        return false;
                    }
                };
                let Some(rx) = handle.take_events() else {
                    warn!(jid = %jid, "Container event stream unavailable");
                    let _ = channel.set_typing(jid, false).await;
                    return false;
                };
                (handle, rx)
            }
        };

        let mut pending_session = None;
        let outcome = loop {
            match events.recv().await {
                Some(AgentRecord::Result { text }) => {
                    self.deliver_result(&channel, jid, &text).await;
                }
                Some(AgentRecord::Typing { on }) => {
                    let _ = channel.set_typing(jid, on).await;
                }
                Some(AgentRecord::Session { session_id }) => {
                    pending_session = Some(session_id);
                }
                Some(AgentRecord::Status { status, error }) => {
                    if status == "success" {
                        break BatchOutcome::Success;
                    }
                    break BatchOutcome::Error(error.unwrap_or(status));
                }
                None => {
                    break BatchOutcome::Error("container exited mid-batch".to_string());
                }
            }
        };

        // Hand the stream back for the next batch on this container.
        handle.return_events(events);
        let _ = channel.set_typing(jid, false).await;

        match outcome {
            BatchOutcome::Success => {
                if let Some(session) = pending_session {
                    self.sessions
                        .lock()
                        .expect("session map lock poisoned")
                        .insert(group.folder.clone(), session);
                }
                self.advance_cursor(jid, &newest).await
            }
            BatchOutcome::Error(reason) => {
                warn!(jid = %jid, "Agent batch failed: {reason}; cursor rolled back");
                // Restore the saved cursor so the next run retries the
                // same messages. (In-memory state was never advanced, so
                // this re-asserts the pre-batch value.)
                self.groups.set_cursor(jid, &cursor_before);
                false
            }
        }
    }

    async fn advance_cursor(&self, jid: &str, newest: &str) -> bool {
        if newest.is_empty() {
            return true;
        }
        match self.store.save_cursor(jid, newest).await {
            Ok(()) => {
                self.groups.set_cursor(jid, newest);
                true
            }
            Err(e) => {
                warn!(jid = %jid, "Cursor persist failed: {e}");
                false
            }
        }
    }

    /// Send one agent result out through the owning channel and persist it
    /// with the bot flag (plus the legacy content prefix as backstop).
    async fn deliver_result(&self, channel: &Arc<dyn Channel>, jid: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Err(e) = channel.send_message(jid, text).await {
            warn!(jid = %jid, channel = channel.name(), "Result send failed: {e}");
        }
        let record = StoredMessage {
            id: format!("bot-{}", Uuid::new_v4().simple()),
            chat_jid: jid.to_string(),
            sender: "relaybot".to_string(),
            sender_name: self.config.assistant_name.clone(),
            content: router::format_outgoing(text, &self.config.assistant_name),
            timestamp: now_ts(),
            is_from_me: true,
            is_bot_message: true,
        };
        if let Err(e) = self.store.store_message(&record).await {
            warn!(jid = %jid, "Bot message persist failed: {e}");
        }
        info!(jid = %jid, chars = text.len(), "Agent result routed");
    }
}

/// Render a batch as the agent-facing transcript, one line per message,
/// in timestamp order.
fn build_transcript(messages: &[StoredMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("[{}] {} ({}): {}", m.timestamp, m.sender_name, m.sender, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}
