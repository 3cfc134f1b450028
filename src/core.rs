//! Process wiring: load state, bring up channels, run the main loops,
//! shut everything down on signal.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::channels::{Channel, InboundSink, MailChannel, SlackChannel, WhatsAppChannel};
use crate::config::{CoreConfig, BASE_RETRY_MS, MAX_RETRIES, SHUTDOWN_DEADLINE};
use crate::container::{ContainerLauncher, ContainerRunner, MountAllowlist};
use crate::daemon::{self, HealthState};
use crate::groups::GroupRegistry;
use crate::processor::{MessageProcessor, SessionMap};
use crate::queue::GroupQueue;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::types::StoredMessage;

/// Process exit disposition. The numeric codes are part of the operator
/// contract: 0 clean, 1 config, 2 container runtime, 3 channel auth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Clean,
    ConfigError,
    RuntimeUnavailable,
    ChannelAuthError,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::ConfigError => 1,
            Self::RuntimeUnavailable => 2,
            Self::ChannelAuthError => 3,
        }
    }
}

/// The inbound half of the orchestrator: channels call this for every
/// sighting. Everything is stored; only registered, non-bot traffic
/// produces agent work.
struct Ingest {
    store: Arc<Store>,
    groups: Arc<GroupRegistry>,
    queue: Arc<GroupQueue>,
}

#[async_trait]
impl InboundSink for Ingest {
    async fn on_chat_metadata(
        &self,
        jid: &str,
        ts: &str,
        name: Option<&str>,
        channel_tag: &str,
        is_group: bool,
    ) {
        if let Err(e) = self
            .store
            .store_chat_metadata(jid, ts, name, channel_tag, is_group)
            .await
        {
            warn!(jid = %jid, "Chat metadata store failed: {e}");
        }
    }

    async fn on_message(&self, jid: &str, msg: StoredMessage) {
        if let Err(e) = self.store.store_message(&msg).await {
            warn!(jid = %jid, "Message store failed: {e}");
            return;
        }
        if msg.is_bot_message {
            return;
        }
        if self.groups.is_registered(jid) {
            self.queue.enqueue_message_check(jid);
        }
    }
}

pub async fn run(config: CoreConfig) -> ExitStatus {
    let config = Arc::new(config);

    let allowlist = match MountAllowlist::load(&CoreConfig::mount_allowlist_path()) {
        Ok(allowlist) => allowlist,
        Err(e) => {
            error!("Mount allowlist unusable: {e}");
            return ExitStatus::ConfigError;
        }
    };

    let store = match Store::new(&config.store_dir.join("relaybot.db")).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Store initialization failed: {e}");
            return ExitStatus::ConfigError;
        }
    };
    info!(path = %config.store_dir.display(), "Store initialized");

    let groups = Arc::new(GroupRegistry::new());
    match store.get_registered_groups().await {
        Ok(registered) => {
            info!(count = registered.len(), "Registered groups loaded");
            groups.replace(registered);
        }
        Err(e) => {
            error!("Registered group load failed: {e}");
            return ExitStatus::ConfigError;
        }
    }

    let queue = Arc::new(GroupQueue::new(
        config.max_concurrent_containers,
        Duration::from_millis(BASE_RETRY_MS),
        MAX_RETRIES,
    ));

    let runner = Arc::new(ContainerRunner::new(
        Arc::clone(&config),
        allowlist,
        Arc::clone(&queue),
    ));
    if let Err(e) = runner.precheck_runtime().await {
        error!("{e}");
        error!("Start the container runtime and retry.");
        return ExitStatus::RuntimeUnavailable;
    }
    runner.cleanup_orphans().await;

    let sink: Arc<dyn InboundSink> = Arc::new(Ingest {
        store: Arc::clone(&store),
        groups: Arc::clone(&groups),
        queue: Arc::clone(&queue),
    });

    // Channel construction: a channel with missing/broken credentials is
    // skipped; the broker runs with whatever connects.
    let env_file = config.env_file();
    let mut channels: Vec<Arc<dyn Channel>> = Vec::new();
    match WhatsAppChannel::from_env_file(&env_file, Arc::clone(&sink)) {
        Ok(channel) => channels.push(Arc::new(channel)),
        Err(e) => warn!("WhatsApp channel unavailable: {e}"),
    }
    match SlackChannel::from_env_file(&env_file, &config.assistant_name, Arc::clone(&sink)) {
        Ok(channel) => channels.push(Arc::new(channel)),
        Err(e) => warn!("Slack channel unavailable: {e}"),
    }
    match MailChannel::from_env_file(&env_file, Arc::clone(&sink)) {
        Ok(channel) => channels.push(Arc::new(channel)),
        Err(e) => warn!("Mail channel unavailable: {e}"),
    }
    if channels.is_empty() {
        error!("No channel could be configured; check {}", env_file.display());
        return ExitStatus::ChannelAuthError;
    }

    let sessions: Arc<SessionMap> = Arc::new(Mutex::new(std::collections::HashMap::new()));
    let launcher: Arc<dyn ContainerLauncher> = runner;

    let processor = Arc::new(MessageProcessor::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&groups),
        Arc::clone(&queue),
        Arc::clone(&launcher),
        channels.clone(),
        Arc::clone(&sessions),
    ));
    {
        let processor = Arc::clone(&processor);
        queue.set_process_messages_fn(Arc::new(move |jid: String| {
            let processor = Arc::clone(&processor);
            Box::pin(async move { processor.process_messages(&jid).await })
        }));
    }

    let shutdown = CancellationToken::new();

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&groups),
        Arc::clone(&queue),
        Arc::clone(&launcher),
        channels.clone(),
        Arc::clone(&sessions),
        shutdown.clone(),
    ));
    scheduler.spawn();

    {
        let state = Arc::new(HealthState {
            channels: channels.clone(),
            queue: Arc::clone(&queue),
            groups: Arc::clone(&groups),
        });
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = daemon::start_health_server(port, state).await {
                error!("Health server error: {e}");
            }
        });
    }

    // Connect all channels in parallel; each manages its own reconnects
    // from here on.
    let connects = channels
        .iter()
        .map(|c| {
            let channel = Arc::clone(c);
            async move {
                let name = channel.name();
                (name, channel.connect().await)
            }
        })
        .collect::<Vec<_>>();
    let mut connected = 0;
    for (name, result) in futures::future::join_all(connects).await {
        match result {
            Ok(()) => {
                connected += 1;
                info!(channel = name, "Channel connected");
            }
            Err(e) => warn!(channel = name, "Channel connect failed: {e}"),
        }
    }
    if connected == 0 {
        error!("Every channel failed to connect");
        return ExitStatus::ChannelAuthError;
    }

    spawn_message_loop(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&groups),
        Arc::clone(&queue),
        shutdown.clone(),
    );

    info!("relaybot up: {} channel(s), cap {}", connected, config.max_concurrent_containers);
    wait_for_signal().await;
    info!("Shutdown signal received");

    shutdown.cancel();
    queue.shutdown(SHUTDOWN_DEADLINE).await;
    for channel in &channels {
        channel.disconnect().await;
    }
    info!("Shutdown complete");
    ExitStatus::Clean
}

/// Periodic sweep: any registered JID with uncursored messages gets a
/// message check enqueued. This is what replays persisted-but-unprocessed
/// traffic after a restart, and it also picks up externally (re)registered
/// groups from the store.
fn spawn_message_loop(
    config: Arc<CoreConfig>,
    store: Arc<Store>,
    groups: Arc<GroupRegistry>,
    queue: Arc<GroupQueue>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }

            // Pick up registration changes made by the external CLI. The
            // persisted cursor always matches the in-memory one (it is
            // written first), so a full replace loses nothing.
            match store.get_registered_groups().await {
                Ok(registered) => groups.replace(registered),
                Err(e) => {
                    warn!("Registered group refresh failed: {e}");
                    continue;
                }
            }

            for jid in groups.jids() {
                let cursor = groups.cursor(&jid);
                match store
                    .get_messages_since(&jid, &cursor, &config.assistant_name)
                    .await
                {
                    Ok(messages) if !messages.is_empty() => {
                        queue.enqueue_message_check(&jid);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(jid = %jid, "Message sweep failed: {e}"),
                }
            }
        }
    });
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("SIGTERM handler failed: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RegisteredGroup;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn exit_codes_match_the_operator_contract() {
        assert_eq!(ExitStatus::Clean.code(), 0);
        assert_eq!(ExitStatus::ConfigError.code(), 1);
        assert_eq!(ExitStatus::RuntimeUnavailable.code(), 2);
        assert_eq!(ExitStatus::ChannelAuthError.code(), 3);
    }

    fn message(id: &str, jid: &str, bot: bool) -> StoredMessage {
        StoredMessage {
            id: id.to_string(),
            chat_jid: jid.to_string(),
            sender: "someone".to_string(),
            sender_name: "Someone".to_string(),
            content: "hello".to_string(),
            timestamp: "2024-01-01T00:00:01Z".to_string(),
            is_from_me: bot,
            is_bot_message: bot,
        }
    }

    async fn ingest_fixture() -> (tempfile::TempDir, Ingest, Arc<Store>, Arc<AtomicUsize>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(&dir.path().join("test.db")).await.unwrap());
        let groups = Arc::new(GroupRegistry::new());
        groups.replace(vec![RegisteredGroup {
            jid: "g1@g.us".to_string(),
            name: "Family".to_string(),
            folder: "family".to_string(),
            trigger: "@Andy".to_string(),
            requires_trigger: true,
            added_at: "2024-01-01T00:00:00Z".to_string(),
            last_processed_at: String::new(),
        }]);

        let queue = Arc::new(GroupQueue::new(2, Duration::from_millis(5000), MAX_RETRIES));
        let batches = Arc::new(AtomicUsize::new(0));
        let batches_in = Arc::clone(&batches);
        queue.set_process_messages_fn(Arc::new(move |_jid| {
            let batches = Arc::clone(&batches_in);
            Box::pin(async move {
                batches.fetch_add(1, Ordering::SeqCst);
                true
            })
        }));

        let ingest = Ingest {
            store: Arc::clone(&store),
            groups,
            queue,
        };
        (dir, ingest, store, batches)
    }

    #[tokio::test]
    async fn inbound_messages_are_stored_and_registered_jids_enqueued() {
        let (_dir, ingest, store, batches) = ingest_fixture().await;

        ingest
            .on_chat_metadata("g1@g.us", "2024-01-01T00:00:01Z", Some("Family"), "whatsapp", true)
            .await;
        ingest.on_message("g1@g.us", message("m1", "g1@g.us", false)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(batches.load(Ordering::SeqCst), 1);
        let stored = store.get_messages_since("g1@g.us", "", "Andy").await.unwrap();
        assert_eq!(stored.len(), 1);
        let chats = store.get_all_chats().await.unwrap();
        assert_eq!(chats[0].name, "Family");
    }

    #[tokio::test]
    async fn unregistered_jids_are_stored_but_never_dispatched() {
        let (_dir, ingest, store, batches) = ingest_fixture().await;

        ingest
            .on_message("stranger@g.us", message("m1", "stranger@g.us", false))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(batches.load(Ordering::SeqCst), 0, "no agent work");
        let stored = store
            .get_messages_since("stranger@g.us", "", "Andy")
            .await
            .unwrap();
        assert_eq!(stored.len(), 1, "but the message is persisted");
    }

    #[tokio::test]
    async fn bot_authored_messages_never_trigger_work() {
        let (_dir, ingest, _store, batches) = ingest_fixture().await;

        ingest.on_message("g1@g.us", message("m1", "g1@g.us", true)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(batches.load(Ordering::SeqCst), 0);
    }
}
