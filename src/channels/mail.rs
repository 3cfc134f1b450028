//! Mail adapter: IMAP polling for inbound, SMTP for replies.
//!
//! Unlike the socket channels this one is not per-conversation: every
//! inbound mail is posted to the fixed JID `mail:main`, which operators
//! register as the `main` group. Replies go to the sender of the most
//! recent inbound message. This flattening is deliberate and matches how
//! the mailbox is actually used: one operator inbox, one agent context.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_native_tls::TlsConnector;
use async_std::net::TcpStream;
use async_trait::async_trait;
use futures::TryStreamExt;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message as MailMessage, SmtpTransport, Transport};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Channel, InboundSink, OutgoingQueue};
use crate::envfile;
use crate::types::StoredMessage;
use crate::utils::now_ts;

pub const MAIN_JID: &str = "mail:main";
const JID_PREFIX: &str = "mail:";

/// Processed-UID memory: cap, then compact to half by dropping the oldest.
const SEEN_CAP: usize = 5000;
const SEEN_COMPACT_TO: usize = 2500;

/// Poll backoff ceiling under consecutive errors.
const BACKOFF_CAP: Duration = Duration::from_secs(30 * 60);

const DEFAULT_POLL: Duration = Duration::from_secs(60);

/// Bodies are clipped before they reach the transcript.
const BODY_MAX_CHARS: usize = 4000;

struct MailConfig {
    imap_host: String,
    imap_port: u16,
    smtp_host: String,
    smtp_port: u16,
    username: String,
    password: String,
    from_address: String,
    folder: String,
}

pub struct MailChannel {
    config: MailConfig,
    sink: Arc<dyn InboundSink>,
    connected: AtomicBool,
    outgoing: OutgoingQueue,
    seen: Mutex<SeenSet>,
    reply_to: RwLock<Option<String>>,
    consecutive_errors: AtomicU32,
    shutdown: CancellationToken,
    poll_interval: Duration,
}

impl std::fmt::Debug for MailChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailChannel").finish_non_exhaustive()
    }
}

impl MailChannel {
    /// Credentials from the env file: `MAIL_IMAP_HOST`, `MAIL_SMTP_HOST`,
    /// `MAIL_USERNAME`, `MAIL_PASSWORD` required; ports and from-address
    /// have sensible defaults.
    pub fn from_env_file(
        env_path: &std::path::Path,
        sink: Arc<dyn InboundSink>,
    ) -> anyhow::Result<Self> {
        let creds = envfile::read_env_file(
            env_path,
            &[
                "MAIL_IMAP_HOST",
                "MAIL_IMAP_PORT",
                "MAIL_SMTP_HOST",
                "MAIL_SMTP_PORT",
                "MAIL_USERNAME",
                "MAIL_PASSWORD",
                "MAIL_FROM",
                "MAIL_FOLDER",
            ],
        );
        let require = |key: &str| {
            creds
                .get(key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("{key} missing from env file"))
        };
        let username = require("MAIL_USERNAME")?;
        let config = MailConfig {
            imap_host: require("MAIL_IMAP_HOST")?,
            imap_port: creds
                .get("MAIL_IMAP_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(993),
            smtp_host: require("MAIL_SMTP_HOST")?,
            smtp_port: creds
                .get("MAIL_SMTP_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(587),
            password: require("MAIL_PASSWORD")?,
            from_address: creds.get("MAIL_FROM").cloned().unwrap_or_else(|| username.clone()),
            folder: creds.get("MAIL_FOLDER").cloned().unwrap_or_else(|| "INBOX".to_string()),
            username,
        };
        Ok(Self {
            config,
            sink,
            connected: AtomicBool::new(false),
            outgoing: OutgoingQueue::new(),
            seen: Mutex::new(SeenSet::new(SEEN_CAP)),
            reply_to: RwLock::new(None),
            consecutive_errors: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
            poll_interval: DEFAULT_POLL,
        })
    }

    async fn run_poll_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            match self.poll_once().await {
                Ok(new_messages) => {
                    self.consecutive_errors.store(0, Ordering::SeqCst);
                    self.connected.store(true, Ordering::SeqCst);
                    if new_messages > 0 {
                        info!(count = new_messages, "New mail ingested");
                    }
                    self.flush_outgoing().await;
                }
                Err(e) => {
                    let errors = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                    self.connected.store(false, Ordering::SeqCst);
                    warn!(consecutive = errors, "Mail poll failed: {e}");
                }
            }
            let delay = backoff_delay(
                self.poll_interval,
                self.consecutive_errors.load(Ordering::SeqCst),
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One IMAP pass: list UNSEEN, fetch envelope + text, post anything we
    /// have not processed yet to the main group.
    async fn poll_once(&self) -> anyhow::Result<usize> {
        let config = &self.config;
        let tcp = TcpStream::connect((&*config.imap_host, config.imap_port)).await?;
        let tls = TlsConnector::new();
        let tls_stream = tls.connect(&config.imap_host, tcp).await?;

        let client = async_imap::Client::new(tls_stream);
        let mut session = client
            .login(&config.username, &config.password)
            .await
            .map_err(|e| e.0)?;
        session.select(&config.folder).await?;

        let unseen = session.uid_search("UNSEEN").await?;
        let mut ingested = 0;

        for uid in unseen {
            let message_id = format!("mail-{uid}");
            if !self.seen.lock().expect("seen set lock poisoned").insert(&message_id) {
                continue;
            }

            let fetches: Vec<_> = session
                .uid_fetch(uid.to_string(), "(ENVELOPE BODY[TEXT])")
                .await?
                .try_collect()
                .await?;
            let Some(fetch) = fetches.first() else {
                continue;
            };

            let envelope = fetch.envelope();
            let subject = envelope
                .and_then(|e| e.subject.as_ref())
                .map(|s| String::from_utf8_lossy(s).to_string())
                .unwrap_or_else(|| "(no subject)".to_string());
            let from = envelope
                .and_then(|e| e.from.as_deref())
                .and_then(|addrs| addrs.first())
                .map(|a| {
                    let mailbox = a
                        .mailbox
                        .as_ref()
                        .map(|m| String::from_utf8_lossy(m).to_string())
                        .unwrap_or_default();
                    let host = a
                        .host
                        .as_ref()
                        .map(|h| String::from_utf8_lossy(h).to_string())
                        .unwrap_or_default();
                    format!("{mailbox}@{host}")
                })
                .unwrap_or_else(|| "unknown".to_string());
            let body = fetch
                .text()
                .map(|b| String::from_utf8_lossy(b).to_string())
                .unwrap_or_default();

            *self.reply_to.write().expect("reply-to lock poisoned") = Some(from.clone());

            let ts = now_ts();
            let content = render_mail(&from, &subject, &body);
            self.sink
                .on_chat_metadata(MAIN_JID, &ts, Some("Mailbox"), "mail", false)
                .await;
            self.sink
                .on_message(
                    MAIN_JID,
                    StoredMessage {
                        id: message_id,
                        chat_jid: MAIN_JID.to_string(),
                        sender: from.clone(),
                        sender_name: from,
                        content,
                        timestamp: ts,
                        is_from_me: false,
                        is_bot_message: false,
                    },
                )
                .await;
            ingested += 1;
        }

        session.logout().await.ok();
        Ok(ingested)
    }

    async fn try_send(&self, text: &str) -> anyhow::Result<()> {
        let Some(to) = self.reply_to.read().expect("reply-to lock poisoned").clone() else {
            anyhow::bail!("no inbound mail to reply to yet");
        };
        let this_text = text.to_string();
        let config_clone = (
            self.config.from_address.clone(),
            self.config.smtp_host.clone(),
            self.config.smtp_port,
            self.config.username.clone(),
            self.config.password.clone(),
        );
        tokio::task::spawn_blocking(move || {
            let (from_address, smtp_host, smtp_port, username, password) = config_clone;
            let email = MailMessage::builder()
                .from(from_address.parse()?)
                .to(to.parse()?)
                .subject("Re: your message")
                .body(this_text)?;
            let transport = SmtpTransport::starttls_relay(&smtp_host)?
                .port(smtp_port)
                .credentials(Credentials::new(username, password))
                .build();
            transport.send(&email)?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    async fn flush_outgoing(&self) {
        let pending = self.outgoing.drain();
        if pending.is_empty() {
            return;
        }
        let mut undelivered = Vec::new();
        let mut failed = false;
        for (jid, text) in pending {
            if failed {
                undelivered.push((jid, text));
                continue;
            }
            if let Err(e) = self.try_send(&text).await {
                warn!("Mail flush send failed: {e}");
                failed = true;
                undelivered.push((jid, text));
            }
        }
        self.outgoing.restore(undelivered);
    }
}

/// Render one mail as transcript content, body clipped to a sane size.
fn render_mail(from: &str, subject: &str, body: &str) -> String {
    let body = crate::utils::truncate_str(body.trim(), BODY_MAX_CHARS);
    format!("Email from {from}\nSubject: {subject}\n\n{body}")
}

/// Exponential poll backoff under consecutive errors, capped at 30 min.
fn backoff_delay(base: Duration, consecutive_errors: u32) -> Duration {
    if consecutive_errors == 0 {
        return base;
    }
    let factor = 2u32.saturating_pow(consecutive_errors.min(16));
    base.saturating_mul(factor).min(BACKOFF_CAP)
}

/// Ordered processed-id memory with a hard cap: on overflow the oldest
/// half is dropped.
struct SeenSet {
    cap: usize,
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenSet {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns false when the id was already present.
    fn insert(&mut self, id: &str) -> bool {
        if !self.set.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > self.cap {
            let drop_count = self.order.len().saturating_sub(self.compact_to());
            for _ in 0..drop_count {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
        true
    }

    fn compact_to(&self) -> usize {
        // 5000 → 2500 at the production cap; half in general.
        if self.cap == SEEN_CAP {
            SEEN_COMPACT_TO
        } else {
            self.cap / 2
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

#[async_trait]
impl Channel for MailChannel {
    fn name(&self) -> &'static str {
        "mail"
    }

    fn owns_jid(&self, jid: &str) -> bool {
        jid.starts_with(JID_PREFIX)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(self: Arc<Self>) -> anyhow::Result<()> {
        let channel = Arc::clone(&self);
        tokio::spawn(async move {
            channel.run_poll_loop().await;
        });
        Ok(())
    }

    async fn disconnect(&self) {
        // SMTP is independent of the poll loop; drain what we can.
        self.flush_outgoing().await;
        self.shutdown.cancel();
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn send_message(&self, jid: &str, text: &str) -> anyhow::Result<()> {
        if !self.is_connected() {
            self.outgoing.push(jid, text);
            return Ok(());
        }
        if let Err(e) = self.try_send(text).await {
            warn!("Mail send failed, queueing: {e}");
            self.outgoing.push(jid, text);
        }
        Ok(())
    }

    // Mail has no typing indicator; inherit the no-op default.

    fn max_message_len(&self) -> usize {
        // One reply per result; never split an email body.
        usize::MAX
    }
}
