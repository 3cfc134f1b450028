//! WhatsApp adapter: persistent WebSocket to a local bridge process that
//! speaks the actual device protocol. Frames both ways are single-line
//! JSON. The hello frame carries the bot's own JID, which drives self-echo
//! suppression.
//!
//! Owned JIDs use the WhatsApp suffixes: `@g.us` (groups) and
//! `@s.whatsapp.net` (direct chats).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Channel, InboundSink, OutgoingQueue};
use crate::envfile;
use crate::router::split_for_length;
use crate::types::StoredMessage;
use crate::utils::to_ts;

const GROUP_SUFFIX: &str = "@g.us";
const DIRECT_SUFFIX: &str = "@s.whatsapp.net";
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeEvent {
    /// Bridge accepted our auth; `jid` is the logged-in account.
    Ready { jid: String },
    Message {
        id: String,
        chat_jid: String,
        sender: String,
        #[serde(default)]
        sender_name: String,
        #[serde(default)]
        text: String,
        /// Unix seconds.
        timestamp: i64,
        #[serde(default)]
        chat_name: Option<String>,
        #[serde(default)]
        is_group: bool,
        #[serde(default)]
        from_me: bool,
    },
    /// Chat roster/metadata update without a message body.
    Chat {
        jid: String,
        #[serde(default)]
        name: Option<String>,
        timestamp: i64,
        #[serde(default)]
        is_group: bool,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeCommand {
    Auth { token: String },
    Send { jid: String, text: String },
    Typing { jid: String, on: bool },
}

pub struct WhatsAppChannel {
    url: String,
    token: String,
    sink: Arc<dyn InboundSink>,
    connected: AtomicBool,
    outgoing: OutgoingQueue,
    self_jid: RwLock<Option<String>>,
    writer: RwLock<Option<mpsc::UnboundedSender<BridgeCommand>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for WhatsAppChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhatsAppChannel").finish_non_exhaustive()
    }
}

impl WhatsAppChannel {
    /// `WA_BRIDGE_URL` (required) and `WA_BRIDGE_TOKEN` come from the env
    /// file. No URL means the channel is not configured.
    pub fn from_env_file(
        env_path: &std::path::Path,
        sink: Arc<dyn InboundSink>,
    ) -> anyhow::Result<Self> {
        let creds = envfile::read_env_file(env_path, &["WA_BRIDGE_URL", "WA_BRIDGE_TOKEN"]);
        let url = creds
            .get("WA_BRIDGE_URL")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("WA_BRIDGE_URL missing from env file"))?;
        Ok(Self {
            url,
            token: creds.get("WA_BRIDGE_TOKEN").cloned().unwrap_or_default(),
            sink,
            connected: AtomicBool::new(false),
            outgoing: OutgoingQueue::new(),
            self_jid: RwLock::new(None),
            writer: RwLock::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    fn queue_command(&self, command: BridgeCommand) -> bool {
        let writer = self.writer.read().expect("writer lock poisoned");
        match writer.as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    async fn run_bridge(self: Arc<Self>) {
        let mut backoff = RECONNECT_BASE;
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            match self.bridge_session().await {
                Ok(()) => backoff = RECONNECT_BASE,
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    *self.writer.write().expect("writer lock poisoned") = None;
                    warn!("WhatsApp bridge error: {e}. Reconnecting in {backoff:?}");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(RECONNECT_CAP);
                }
            }
        }
    }

    async fn bridge_session(self: &Arc<Self>) -> anyhow::Result<()> {
        let (ws, _) = tokio_tungstenite::connect_async(&self.url).await?;
        let (mut write, mut read) = ws.split();

        let auth = serde_json::to_string(&BridgeCommand::Auth {
            token: self.token.clone(),
        })?;
        write.send(WsMessage::Text(auth)).await?;

        // Writer task: serializes queued commands onto the socket.
        let (tx, mut rx) = mpsc::unbounded_channel::<BridgeCommand>();
        let writer_task = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let Ok(frame) = serde_json::to_string(&command) else {
                    continue;
                };
                if write.send(WsMessage::Text(frame)).await.is_err() {
                    break;
                }
            }
        });

        let session_result = self.read_loop(&tx, &mut read).await;

        self.connected.store(false, Ordering::SeqCst);
        *self.writer.write().expect("writer lock poisoned") = None;
        drop(tx);
        writer_task.abort();
        session_result
    }

    async fn read_loop(
        self: &Arc<Self>,
        tx: &mpsc::UnboundedSender<BridgeCommand>,
        read: &mut (impl futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
                  + Unpin),
    ) -> anyhow::Result<()> {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                frame = read.next() => frame,
            };
            let Some(frame) = frame else {
                anyhow::bail!("bridge socket closed");
            };
            let WsMessage::Text(raw) = frame? else {
                continue;
            };
            let event: BridgeEvent = match serde_json::from_str(&raw) {
                Ok(event) => event,
                Err(e) => {
                    debug!("Unparseable bridge frame: {e}");
                    continue;
                }
            };
            match event {
                BridgeEvent::Ready { jid } => {
                    info!(self_jid = %jid, "WhatsApp bridge ready");
                    *self.self_jid.write().expect("self jid lock poisoned") = Some(jid);
                    *self.writer.write().expect("writer lock poisoned") = Some(tx.clone());
                    self.connected.store(true, Ordering::SeqCst);
                    self.flush_outgoing();
                }
                BridgeEvent::Message {
                    id,
                    chat_jid,
                    sender,
                    sender_name,
                    text,
                    timestamp,
                    chat_name,
                    is_group,
                    from_me,
                } => {
                    let ts = unix_to_timestamp(timestamp);
                    let self_jid = self
                        .self_jid
                        .read()
                        .expect("self jid lock poisoned")
                        .clone()
                        .unwrap_or_default();
                    let is_from_me = from_me || (!self_jid.is_empty() && sender == self_jid);

                    self.sink
                        .on_chat_metadata(&chat_jid, &ts, chat_name.as_deref(), "whatsapp", is_group)
                        .await;
                    self.sink
                        .on_message(
                            &chat_jid,
                            StoredMessage {
                                id,
                                chat_jid: chat_jid.clone(),
                                sender,
                                sender_name,
                                content: text,
                                timestamp: ts,
                                is_from_me,
                                is_bot_message: is_from_me,
                            },
                        )
                        .await;
                }
                BridgeEvent::Chat {
                    jid,
                    name,
                    timestamp,
                    is_group,
                } => {
                    let ts = unix_to_timestamp(timestamp);
                    self.sink
                        .on_chat_metadata(&jid, &ts, name.as_deref(), "whatsapp", is_group)
                        .await;
                }
            }
        }
    }

    /// Queued sends drain in arrival order once the bridge is back.
    fn flush_outgoing(&self) {
        let pending = self.outgoing.drain();
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "Flushing queued WhatsApp messages");
        let mut undelivered = Vec::new();
        for (jid, text) in pending {
            if !undelivered.is_empty()
                || !self.queue_command(BridgeCommand::Send {
                    jid: jid.clone(),
                    text: text.clone(),
                })
            {
                undelivered.push((jid, text));
            }
        }
        self.outgoing.restore(undelivered);
    }
}

fn unix_to_timestamp(secs: i64) -> String {
    match chrono::DateTime::from_timestamp(secs, 0) {
        Some(dt) => to_ts(dt),
        None => to_ts(chrono::Utc::now()),
    }
}

pub fn owns_whatsapp_jid(jid: &str) -> bool {
    jid.ends_with(GROUP_SUFFIX) || jid.ends_with(DIRECT_SUFFIX)
}

#[async_trait]
impl Channel for WhatsAppChannel {
    fn name(&self) -> &'static str {
        "whatsapp"
    }

    fn owns_jid(&self, jid: &str) -> bool {
        owns_whatsapp_jid(jid)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(self: Arc<Self>) -> anyhow::Result<()> {
        let channel = Arc::clone(&self);
        tokio::spawn(async move {
            channel.run_bridge().await;
        });
        Ok(())
    }

    async fn disconnect(&self) {
        self.shutdown.cancel();
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn send_message(&self, jid: &str, text: &str) -> anyhow::Result<()> {
        for chunk in split_for_length(text, self.max_message_len()) {
            let delivered = self.is_connected()
                && self.queue_command(BridgeCommand::Send {
                    jid: jid.to_string(),
                    text: chunk.clone(),
                });
            if !delivered {
                self.outgoing.push(jid, &chunk);
            }
        }
        Ok(())
    }

    async fn set_typing(&self, jid: &str, on: bool) -> anyhow::Result<()> {
        // Best effort: a dropped typing frame is not worth queueing.
        if self.is_connected() {
            self.queue_command(BridgeCommand::Typing {
                jid: jid.to_string(),
                on,
            });
        }
        Ok(())
    }
}
