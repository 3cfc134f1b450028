//! End-to-end flow over the real store, registry, queue, and processor,
//! with the container runtime and the chat networks replaced by local
//! doubles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use relaybot::channels::Channel;
use relaybot::config::CoreConfig;
use relaybot::container::{AgentRecord, ContainerHandle, ContainerLauncher, LaunchSpec};
use relaybot::groups::GroupRegistry;
use relaybot::processor::{MessageProcessor, SessionMap};
use relaybot::queue::GroupQueue;
use relaybot::store::Store;
use relaybot::types::{RegisteredGroup, StoredMessage};

struct CapturingChannel {
    channel_name: &'static str,
    suffix_owned: bool,
    connected: AtomicBool,
    sent: Mutex<Vec<(String, String)>>,
}

impl CapturingChannel {
    fn whatsapp() -> Self {
        Self {
            channel_name: "whatsapp",
            suffix_owned: true,
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn slack() -> Self {
        Self {
            channel_name: "slack",
            suffix_owned: false,
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Channel for CapturingChannel {
    fn name(&self) -> &'static str {
        self.channel_name
    }

    fn owns_jid(&self, jid: &str) -> bool {
        if self.suffix_owned {
            jid.ends_with("@g.us") || jid.ends_with("@s.whatsapp.net")
        } else {
            jid.starts_with("slack:")
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(self: Arc<Self>) -> anyhow::Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn send_message(&self, jid: &str, text: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((jid.to_string(), text.to_string()));
        Ok(())
    }
}

/// Launcher double that scripts every container's output stream.
struct ScriptedLauncher {
    queue: Arc<GroupQueue>,
    script: Mutex<Vec<AgentRecord>>,
    launches: AtomicUsize,
}

#[async_trait]
impl ContainerLauncher for ScriptedLauncher {
    async fn launch(&self, spec: LaunchSpec) -> anyhow::Result<Arc<ContainerHandle>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("relaybot-it-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        let handle = Arc::new(ContainerHandle::new(
            relaybot::container::container_name(&spec.group_folder),
            spec.jid.clone(),
            spec.group_folder.clone(),
            dir,
            spec.task_container,
        ));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        handle.attach_events(rx);
        self.queue.register_process(&spec.jid, Arc::clone(&handle));
        for record in self.script.lock().unwrap().clone() {
            let _ = tx.send(record);
        }
        let exit_handle = Arc::clone(&handle);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(tx);
            exit_handle.mark_exited();
        });
        Ok(handle)
    }
}

struct Harness {
    store: Arc<Store>,
    groups: Arc<GroupRegistry>,
    queue: Arc<GroupQueue>,
    processor: Arc<MessageProcessor>,
    whatsapp: Arc<CapturingChannel>,
    launcher: Arc<ScriptedLauncher>,
    _dir: tempfile::TempDir,
}

async fn harness(script: Vec<AgentRecord>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::new(&dir.path().join("broker.db")).await.unwrap());

    let group = RegisteredGroup {
        jid: "g1@g.us".to_string(),
        name: "Family".to_string(),
        folder: "family".to_string(),
        trigger: "@Andy".to_string(),
        requires_trigger: true,
        added_at: "2024-01-01T00:00:00Z".to_string(),
        last_processed_at: String::new(),
    };
    store.register_group(&group).await.unwrap();
    let groups = Arc::new(GroupRegistry::new());
    groups.replace(vec![group]);

    let config = Arc::new(CoreConfig {
        assistant_name: "Andy".to_string(),
        poll_interval: Duration::from_millis(15_000),
        scheduler_poll_interval: Duration::from_millis(30_000),
        max_concurrent_containers: 2,
        container_image: "relaybot-agent:latest".to_string(),
        timezone: "UTC".to_string(),
        data_dir: dir.path().join("data"),
        groups_dir: dir.path().join("groups"),
        store_dir: dir.path().join("store"),
        health_port: 8080,
    });

    let queue = Arc::new(GroupQueue::new(2, Duration::from_millis(5000), 5));
    let launcher = Arc::new(ScriptedLauncher {
        queue: Arc::clone(&queue),
        script: Mutex::new(script),
        launches: AtomicUsize::new(0),
    });
    let whatsapp = Arc::new(CapturingChannel::whatsapp());
    let slack = Arc::new(CapturingChannel::slack());
    let channels: Vec<Arc<dyn Channel>> = vec![whatsapp.clone(), slack];
    let sessions: Arc<SessionMap> = Arc::new(Mutex::new(HashMap::new()));

    let processor = Arc::new(MessageProcessor::new(
        config,
        Arc::clone(&store),
        Arc::clone(&groups),
        Arc::clone(&queue),
        launcher.clone() as Arc<dyn ContainerLauncher>,
        channels,
        sessions,
    ));

    {
        let processor = Arc::clone(&processor);
        queue.set_process_messages_fn(Arc::new(move |jid: String| {
            let processor = Arc::clone(&processor);
            Box::pin(async move { processor.process_messages(&jid).await })
        }));
    }

    Harness {
        store,
        groups,
        queue,
        processor,
        whatsapp,
        launcher,
        _dir: dir,
    }
}

fn inbound(id: &str, content: &str, ts: &str) -> StoredMessage {
    StoredMessage {
        id: id.to_string(),
        chat_jid: "g1@g.us".to_string(),
        sender: "5551234@s.whatsapp.net".to_string(),
        sender_name: "Alice".to_string(),
        content: content.to_string(),
        timestamp: ts.to_string(),
        is_from_me: false,
        is_bot_message: false,
    }
}

#[tokio::test]
async fn untriggered_message_consumes_without_agent_work() {
    let hx = harness(vec![]).await;
    hx.store
        .store_message(&inbound("m1", "hi team", "2024-01-01T00:00:01Z"))
        .await
        .unwrap();

    assert!(hx.processor.process_messages("g1@g.us").await);

    assert_eq!(hx.groups.cursor("g1@g.us"), "2024-01-01T00:00:01Z");
    assert_eq!(hx.launcher.launches.load(Ordering::SeqCst), 0);
    assert!(hx.whatsapp.sent().is_empty());
}

#[tokio::test]
async fn triggered_message_round_trips_through_the_agent() {
    let hx = harness(vec![
        AgentRecord::Result {
            text: "Done.".to_string(),
        },
        AgentRecord::Status {
            status: "success".to_string(),
            error: None,
        },
    ])
    .await;
    hx.store
        .store_message(&inbound("m2", "@Andy summary?", "2024-01-01T00:00:02Z"))
        .await
        .unwrap();

    assert!(hx.processor.process_messages("g1@g.us").await);

    assert_eq!(hx.launcher.launches.load(Ordering::SeqCst), 1);
    assert_eq!(
        hx.whatsapp.sent(),
        vec![("g1@g.us".to_string(), "Done.".to_string())]
    );
    assert_eq!(hx.groups.cursor("g1@g.us"), "2024-01-01T00:00:02Z");

    // The cursor survives a registry reload from the store (restart path).
    let persisted = hx.store.get_registered_groups().await.unwrap();
    hx.groups.replace(persisted);
    assert_eq!(hx.groups.cursor("g1@g.us"), "2024-01-01T00:00:02Z");
}

#[tokio::test]
async fn failed_agent_batch_replays_on_next_attempt() {
    let hx = harness(vec![AgentRecord::Status {
        status: "error".to_string(),
        error: Some("boom".to_string()),
    }])
    .await;
    hx.store
        .store_message(&inbound("m2", "@Andy go", "2024-01-01T00:00:02Z"))
        .await
        .unwrap();

    assert!(!hx.processor.process_messages("g1@g.us").await);
    assert_eq!(hx.groups.cursor("g1@g.us"), "", "cursor unchanged");

    // Second attempt sees the same batch again.
    *hx.launcher.script.lock().unwrap() = vec![
        AgentRecord::Result {
            text: "Recovered.".to_string(),
        },
        AgentRecord::Status {
            status: "success".to_string(),
            error: None,
        },
    ];
    assert!(hx.processor.process_messages("g1@g.us").await);
    assert_eq!(hx.groups.cursor("g1@g.us"), "2024-01-01T00:00:02Z");
    assert_eq!(
        hx.whatsapp.sent(),
        vec![("g1@g.us".to_string(), "Recovered.".to_string())]
    );
}

#[tokio::test]
async fn queue_drives_the_processor_through_enqueue() {
    let hx = harness(vec![
        AgentRecord::Result {
            text: "Done.".to_string(),
        },
        AgentRecord::Status {
            status: "success".to_string(),
            error: None,
        },
    ])
    .await;
    hx.store
        .store_message(&inbound("m2", "@Andy summary?", "2024-01-01T00:00:02Z"))
        .await
        .unwrap();

    hx.queue.enqueue_message_check("g1@g.us");
    // The batch, the container exit, and the lane drain all settle.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(hx.whatsapp.sent().len(), 1);
    assert_eq!(hx.queue.active_count(), 0);
}

#[tokio::test]
async fn shutdown_prevents_further_dispatch() {
    let hx = harness(vec![]).await;
    hx.queue.shutdown(Duration::from_millis(100)).await;

    hx.store
        .store_message(&inbound("m1", "@Andy hello", "2024-01-01T00:00:01Z"))
        .await
        .unwrap();
    assert!(!hx.queue.enqueue_message_check("g1@g.us"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hx.launcher.launches.load(Ordering::SeqCst), 0);
}
