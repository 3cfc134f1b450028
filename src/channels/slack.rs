//! Slack adapter: Socket Mode for inbound events, Web API for sends.
//!
//! JIDs carry the `slack:` prefix (`slack:C0123`). Inbound `<@BOTID>`
//! mentions are rewritten to the canonical `@<assistant>` form before they
//! reach trigger evaluation, so one trigger pattern covers every channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Channel, InboundSink, OutgoingQueue};
use crate::envfile;
use crate::router::split_for_length;
use crate::types::StoredMessage;
use crate::utils::to_ts;

const JID_PREFIX: &str = "slack:";
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);

pub struct SlackChannel {
    bot_token: String,
    app_token: String,
    assistant_name: String,
    sink: Arc<dyn InboundSink>,
    client: reqwest::Client,
    connected: AtomicBool,
    outgoing: OutgoingQueue,
    bot_user_id: RwLock<Option<String>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SlackChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackChannel").finish_non_exhaustive()
    }
}

impl SlackChannel {
    /// Credentials come from the env file (`SLACK_BOT_TOKEN`,
    /// `SLACK_APP_TOKEN`), never from process env. Missing tokens are an
    /// auth error: the channel is skipped at startup.
    pub fn from_env_file(
        env_path: &std::path::Path,
        assistant_name: &str,
        sink: Arc<dyn InboundSink>,
    ) -> anyhow::Result<Self> {
        let creds = envfile::read_env_file(env_path, &["SLACK_BOT_TOKEN", "SLACK_APP_TOKEN"]);
        let bot_token = creds
            .get("SLACK_BOT_TOKEN")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("SLACK_BOT_TOKEN missing from env file"))?;
        let app_token = creds
            .get("SLACK_APP_TOKEN")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("SLACK_APP_TOKEN missing from env file"))?;
        Ok(Self {
            bot_token,
            app_token,
            assistant_name: assistant_name.to_string(),
            sink,
            client: reqwest::Client::new(),
            connected: AtomicBool::new(false),
            outgoing: OutgoingQueue::new(),
            bot_user_id: RwLock::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Resolve the bot's own user id so self-echo never re-triggers us.
    async fn auth_test(&self) -> anyhow::Result<String> {
        let resp: Value = self
            .client
            .get("https://slack.com/api/auth.test")
            .bearer_auth(&self.bot_token)
            .send()
            .await?
            .json()
            .await?;
        if resp.get("ok") != Some(&Value::Bool(true)) {
            anyhow::bail!(
                "Slack auth.test failed: {}",
                resp.get("error").and_then(Value::as_str).unwrap_or("unknown")
            );
        }
        resp.get("user_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Slack auth.test returned no user_id"))
    }

    async fn open_socket_url(&self) -> anyhow::Result<String> {
        let resp: Value = self
            .client
            .post("https://slack.com/api/apps.connections.open")
            .bearer_auth(&self.app_token)
            .send()
            .await?
            .json()
            .await?;
        if resp.get("ok") != Some(&Value::Bool(true)) {
            anyhow::bail!(
                "Slack apps.connections.open failed: {}",
                resp.get("error").and_then(Value::as_str).unwrap_or("unknown")
            );
        }
        resp.get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Slack returned no socket URL"))
    }

    async fn post_message(&self, channel_id: &str, text: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .post("https://slack.com/api/chat.postMessage")
            .bearer_auth(&self.bot_token)
            .json(&json!({ "channel": channel_id, "text": text }))
            .send()
            .await?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or_default();
        if !status.is_success() || body.get("ok") != Some(&Value::Bool(true)) {
            anyhow::bail!(
                "Slack chat.postMessage failed ({status}): {}",
                body.get("error").and_then(Value::as_str).unwrap_or("unknown")
            );
        }
        Ok(())
    }

    async fn flush_outgoing(&self) {
        let pending = self.outgoing.drain();
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "Flushing queued Slack messages");
        let mut undelivered = Vec::new();
        let mut failed = false;
        for (jid, text) in pending {
            if failed {
                undelivered.push((jid, text));
                continue;
            }
            if let Err(e) = self.post_message(channel_id(&jid), &text).await {
                warn!("Slack flush send failed: {e}");
                failed = true;
                undelivered.push((jid, text));
            }
        }
        self.outgoing.restore(undelivered);
    }

    async fn run_socket(self: Arc<Self>) {
        let mut backoff = RECONNECT_BASE;
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            match self.socket_session().await {
                Ok(()) => {
                    backoff = RECONNECT_BASE;
                }
                Err(e) => {
                    warn!("Slack socket error: {e}. Reconnecting in {backoff:?}");
                    self.connected.store(false, Ordering::SeqCst);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(RECONNECT_CAP);
                }
            }
        }
    }

    /// One Socket Mode connection: read envelopes, ack them, dispatch
    /// message events. Returns Ok on a server-requested reconnect.
    async fn socket_session(self: &Arc<Self>) -> anyhow::Result<()> {
        let url = self.open_socket_url().await?;
        let (ws, _) = tokio_tungstenite::connect_async(&url).await?;
        let (mut write, mut read) = ws.split();

        self.connected.store(true, Ordering::SeqCst);
        info!("Slack socket connected");
        self.flush_outgoing().await;

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                frame = read.next() => frame,
            };
            let Some(frame) = frame else {
                anyhow::bail!("Slack socket closed");
            };
            let WsMessage::Text(raw) = frame? else {
                continue;
            };
            let envelope: Value = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(e) => {
                    debug!("Unparseable Slack envelope: {e}");
                    continue;
                }
            };

            match envelope.get("type").and_then(Value::as_str) {
                Some("hello") => {}
                Some("disconnect") => {
                    info!("Slack asked for a reconnect");
                    return Ok(());
                }
                Some("events_api") => {
                    if let Some(envelope_id) = envelope.get("envelope_id").and_then(Value::as_str) {
                        let ack = json!({ "envelope_id": envelope_id }).to_string();
                        write.send(WsMessage::Text(ack)).await?;
                    }
                    self.handle_event(&envelope).await;
                }
                _ => {}
            }
        }
    }

    async fn handle_event(&self, envelope: &Value) {
        let bot_user_id = self
            .bot_user_id
            .read()
            .expect("bot user id lock poisoned")
            .clone()
            .unwrap_or_default();
        let Some(event) = envelope.pointer("/payload/event") else {
            return;
        };
        let Some(msg) = parse_message_event(event, &bot_user_id, &self.assistant_name) else {
            return;
        };
        let jid = msg.chat_jid.clone();
        self.sink
            .on_chat_metadata(&jid, &msg.timestamp, None, "slack", true)
            .await;
        self.sink.on_message(&jid, msg).await;
    }
}

fn channel_id(jid: &str) -> &str {
    jid.strip_prefix(JID_PREFIX).unwrap_or(jid)
}

/// Convert a Socket Mode message event into a stored message. Returns
/// None for non-message noise (edits, joins, empty text).
fn parse_message_event(event: &Value, bot_user_id: &str, assistant_name: &str) -> Option<StoredMessage> {
    if event.get("type").and_then(Value::as_str) != Some("message") {
        return None;
    }
    // Subtyped messages (edits, joins, bot attachments) are not user text.
    if event.get("subtype").is_some() {
        return None;
    }
    let channel = event.get("channel").and_then(Value::as_str)?;
    let ts = event.get("ts").and_then(Value::as_str)?;
    let user = event.get("user").and_then(Value::as_str).unwrap_or("unknown");
    let text = event.get("text").and_then(Value::as_str).unwrap_or("");
    if text.is_empty() {
        return None;
    }

    let is_from_me = user == bot_user_id || event.get("bot_id").is_some();
    let content = rewrite_mentions(text, bot_user_id, assistant_name);

    Some(StoredMessage {
        id: format!("slack-{channel}-{ts}"),
        chat_jid: format!("{JID_PREFIX}{channel}"),
        sender: user.to_string(),
        sender_name: user.to_string(),
        content,
        timestamp: slack_ts_to_timestamp(ts),
        is_from_me,
        is_bot_message: is_from_me,
    })
}

/// `<@U123>` → `@Andy` when the mention targets the bot: foreign mention
/// syntax re-expressed in the canonical trigger form.
fn rewrite_mentions(text: &str, bot_user_id: &str, assistant_name: &str) -> String {
    if bot_user_id.is_empty() {
        return text.to_string();
    }
    text.replace(
        &format!("<@{bot_user_id}>"),
        &format!("@{assistant_name}"),
    )
}

/// Slack `ts` ("1704067200.123456") → canonical timestamp string.
fn slack_ts_to_timestamp(ts: &str) -> String {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs: i64 = secs.parse().unwrap_or(0);
    let millis: u32 = frac
        .chars()
        .chain(std::iter::repeat('0'))
        .take(3)
        .collect::<String>()
        .parse()
        .unwrap_or(0);
    match chrono::DateTime::from_timestamp(secs, millis * 1_000_000) {
        Some(dt) => to_ts(dt),
        None => to_ts(chrono::Utc::now()),
    }
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn owns_jid(&self, jid: &str) -> bool {
        jid.starts_with(JID_PREFIX)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(self: Arc<Self>) -> anyhow::Result<()> {
        let bot_user_id = self.auth_test().await?;
        info!(bot_user_id = %bot_user_id, "Slack authenticated");
        *self.bot_user_id.write().expect("bot user id lock poisoned") = Some(bot_user_id);

        let channel = Arc::clone(&self);
        tokio::spawn(async move {
            channel.run_socket().await;
        });
        Ok(())
    }

    async fn disconnect(&self) {
        // Sends go over the Web API, so a final flush can still succeed
        // even as the socket goes away.
        self.flush_outgoing().await;
        self.shutdown.cancel();
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn send_message(&self, jid: &str, text: &str) -> anyhow::Result<()> {
        for chunk in split_for_length(text, self.max_message_len()) {
            if !self.is_connected() {
                self.outgoing.push(jid, &chunk);
                continue;
            }
            if let Err(e) = self.post_message(channel_id(jid), &chunk).await {
                warn!("Slack send failed, queueing: {e}");
                self.outgoing.push(jid, &chunk);
            }
        }
        Ok(())
    }

    // Slack has no typing indicator for Socket Mode bots; inherit the
    // no-op default.
}
