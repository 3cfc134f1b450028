//! Time-triggered task firing. Polls the store for due tasks, coalesces
//! their execution with message work through the per-group queue, advances
//! `next_run_at`, and writes the run log.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::channels::Channel;
use crate::config::{CoreConfig, TASK_CLOSE_DELAY};
use crate::container::{AgentRecord, ContainerLauncher, LaunchSpec};
use crate::groups::GroupRegistry;
use crate::processor::SessionMap;
use crate::queue::GroupQueue;
use crate::router;
use crate::store::Store;
use crate::types::{ContextMode, RunStatus, ScheduleKind, ScheduledTask, TaskRunRecord, TaskStatus};
use crate::utils::{now_ts, to_ts, truncate_str};

const RESULT_SUMMARY_MAX_CHARS: usize = 500;

pub struct Scheduler {
    config: Arc<CoreConfig>,
    store: Arc<Store>,
    groups: Arc<GroupRegistry>,
    queue: Arc<GroupQueue>,
    launcher: Arc<dyn ContainerLauncher>,
    channels: Vec<Arc<dyn Channel>>,
    sessions: Arc<SessionMap>,
    shutdown: CancellationToken,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<CoreConfig>,
        store: Arc<Store>,
        groups: Arc<GroupRegistry>,
        queue: Arc<GroupQueue>,
        launcher: Arc<dyn ContainerLauncher>,
        channels: Vec<Arc<dyn Channel>>,
        sessions: Arc<SessionMap>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            groups,
            queue,
            launcher,
            channels,
            sessions,
            shutdown,
        }
    }

    /// Spawn the scheduler tick loop as a background task.
    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            // Tasks that came due while the process was down fire on the
            // first tick; surface that in the log so restarts are legible.
            match self.store.get_due_tasks(&now_ts()).await {
                Ok(missed) if !missed.is_empty() => {
                    info!(count = missed.len(), "Recovering missed scheduled tasks");
                }
                Err(e) => error!("Scheduler startup query failed: {e}"),
                _ => {}
            }

            let mut interval = tokio::time::interval(self.config.scheduler_poll_interval);
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        info!("Scheduler stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.tick().await {
                            error!("Scheduler tick error: {e}");
                        }
                    }
                }
            }
        });
        info!("Scheduler spawned");
    }

    /// Check for due tasks and enqueue them on their group lanes.
    pub async fn tick(self: &Arc<Self>) -> anyhow::Result<()> {
        let now = Utc::now();
        let due = self.store.get_due_tasks(&to_ts(now)).await?;

        for due_task in due {
            // Re-read: the task may have been paused or deleted since the
            // due query.
            let Some(task) = self.store.get_task_by_id(&due_task.id).await? else {
                continue;
            };
            if task.status != TaskStatus::Active {
                continue;
            }

            if !self
                .groups
                .folder_resolvable(&self.config.groups_dir, &task.group_folder)
            {
                warn!(task_id = %task.id, folder = %task.group_folder, "Task folder unresolvable; pausing");
                self.store
                    .set_task_status(&task.id, TaskStatus::Paused)
                    .await?;
                self.store
                    .log_task_run(&TaskRunRecord {
                        task_id: task.id.clone(),
                        run_at: now_ts(),
                        duration_ms: 0,
                        status: RunStatus::Error,
                        result: None,
                        error: Some("invalid group folder".to_string()),
                    })
                    .await?;
                continue;
            }

            let next_run = match compute_next_run(
                task.schedule_kind,
                &task.schedule_value,
                &self.config.timezone,
                now,
            ) {
                Ok(next) => next.map(to_ts),
                Err(e) => {
                    warn!(task_id = %task.id, "Schedule unusable; pausing: {e}");
                    self.store
                        .set_task_status(&task.id, TaskStatus::Paused)
                        .await?;
                    self.store
                        .log_task_run(&TaskRunRecord {
                            task_id: task.id.clone(),
                            run_at: now_ts(),
                            duration_ms: 0,
                            status: RunStatus::Error,
                            result: None,
                            error: Some(format!("invalid schedule: {e}")),
                        })
                        .await?;
                    continue;
                }
            };

            // Advance the fire time before the run starts so the next
            // tick cannot double-fire a long-running task.
            self.store
                .set_task_next_run(&task.id, next_run.as_deref())
                .await?;

            let chat_jid = task.chat_jid.clone();
            let task_id = task.id.clone();
            let run = self.build_run(task, next_run);
            if !self.queue.enqueue_task(&chat_jid, &task_id, run) {
                warn!(task_id = %task_id, "Task enqueue refused (shutting down)");
            } else {
                info!(task_id = %task_id, jid = %chat_jid, "Scheduled task fired");
            }
        }

        Ok(())
    }

    /// Build the queue-side run future. The scheduler owns run logging and
    /// the post-run task update; the queue only sequences execution.
    fn build_run(self: &Arc<Self>, task: ScheduledTask, next_run: Option<String>) -> crate::queue::TaskFuture {
        let scheduler = Arc::clone(self);
        Box::pin(async move {
            let run_at = now_ts();
            let started = tokio::time::Instant::now();
            let outcome = scheduler.execute_task(&task).await;
            let duration_ms = started.elapsed().as_millis() as i64;

            let (record, summary) = match outcome {
                Ok(result) => {
                    let summary = truncate_str(&result, RESULT_SUMMARY_MAX_CHARS);
                    (
                        TaskRunRecord {
                            task_id: task.id.clone(),
                            run_at,
                            duration_ms,
                            status: RunStatus::Success,
                            result: Some(summary.clone()),
                            error: None,
                        },
                        summary,
                    )
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(task_id = %task.id, "Task run failed: {message}");
                    (
                        TaskRunRecord {
                            task_id: task.id.clone(),
                            run_at,
                            duration_ms,
                            status: RunStatus::Error,
                            result: None,
                            error: Some(message.clone()),
                        },
                        format!("error: {message}"),
                    )
                }
            };

            if let Err(e) = scheduler.store.log_task_run(&record).await {
                error!(task_id = %task.id, "Run log write failed: {e}");
            }
            if let Err(e) = scheduler
                .store
                .update_task_after_run(&task.id, next_run.as_deref(), &summary)
                .await
            {
                error!(task_id = %task.id, "Post-run task update failed: {e}");
            }
        })
    }

    /// Run one task through an agent container. Results are routed to the
    /// task's chat; after the first result a short close delay lets any
    /// trailing tool calls finish before the close sentinel lands.
    async fn execute_task(&self, task: &ScheduledTask) -> anyhow::Result<String> {
        let session_id = match task.context_mode {
            ContextMode::Group => self
                .sessions
                .lock()
                .expect("session map lock poisoned")
                .get(&task.group_folder)
                .cloned(),
            ContextMode::Isolated => None,
        };

        let handle = self
            .launcher
            .launch(LaunchSpec {
                jid: task.chat_jid.clone(),
                group_folder: task.group_folder.clone(),
                prompt: task.prompt.clone(),
                session_id,
                task_container: true,
                extra_mounts: Vec::new(),
            })
            .await?;
        let mut events = handle
            .take_events()
            .ok_or_else(|| anyhow::anyhow!("container event stream unavailable"))?;

        let channel = router::find_channel(&self.channels, &task.chat_jid).cloned();
        if channel.is_none() {
            warn!(jid = %task.chat_jid, "No channel owns the task chat; results will be dropped");
        }

        let mut results: Vec<String> = Vec::new();
        let mut success = false;
        let mut failure: Option<String> = None;
        let mut close_deadline: Option<tokio::time::Instant> = None;
        let mut close_requested = false;

        loop {
            let deadline = close_deadline
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(86_400));
            tokio::select! {
                record = events.recv() => {
                    match record {
                        Some(AgentRecord::Result { text }) => {
                            if let Some(channel) = &channel {
                                if let Err(e) = channel.send_message(&task.chat_jid, &text).await {
                                    warn!(jid = %task.chat_jid, "Task result send failed: {e}");
                                }
                            }
                            results.push(text);
                            if close_deadline.is_none() && !close_requested {
                                close_deadline =
                                    Some(tokio::time::Instant::now() + TASK_CLOSE_DELAY);
                            }
                        }
                        Some(AgentRecord::Typing { on }) => {
                            if let Some(channel) = &channel {
                                let _ = channel.set_typing(&task.chat_jid, on).await;
                            }
                        }
                        Some(AgentRecord::Session { session_id }) => {
                            if task.context_mode == ContextMode::Group {
                                self.sessions
                                    .lock()
                                    .expect("session map lock poisoned")
                                    .insert(task.group_folder.clone(), session_id);
                            }
                        }
                        Some(AgentRecord::Status { status, error }) => {
                            if status == "success" {
                                success = true;
                                if results.is_empty() && !close_requested {
                                    // Nothing to wait for; reclaim the lane.
                                    self.queue.close_stdin(&task.chat_jid);
                                    close_requested = true;
                                }
                            } else {
                                failure = Some(error.unwrap_or(status));
                            }
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline), if close_deadline.is_some() && !close_requested => {
                    self.queue.close_stdin(&task.chat_jid);
                    close_requested = true;
                    close_deadline = None;
                }
            }
        }

        if let Some(reason) = failure {
            anyhow::bail!(reason);
        }
        if !success && results.is_empty() {
            anyhow::bail!("container exited without a result");
        }
        Ok(results.join("\n"))
    }
}

/// Next fire time for a schedule, in the configured timezone. `Once`
/// schedules have no next run; the task transitions to `done` after this
/// fire.
pub fn compute_next_run(
    kind: ScheduleKind,
    value: &str,
    timezone: &str,
    from: DateTime<Utc>,
) -> anyhow::Result<Option<DateTime<Utc>>> {
    match kind {
        ScheduleKind::Once => Ok(None),
        ScheduleKind::Interval => {
            let ms: u64 = value
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("interval must be milliseconds, got '{value}'"))?;
            if ms == 0 {
                anyhow::bail!("interval must be > 0");
            }
            let delta = chrono::Duration::milliseconds(i64::try_from(ms)?);
            from.checked_add_signed(delta)
                .map(Some)
                .ok_or_else(|| anyhow::anyhow!("interval overflowed"))
        }
        ScheduleKind::Cron => {
            let cron: Cron = value
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid cron '{value}': {e}"))?;
            let tz: chrono_tz::Tz = timezone
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid timezone '{timezone}'"))?;
            let next = cron
                .find_next_occurrence(&from.with_timezone(&tz), false)
                .map_err(|e| anyhow::anyhow!("no next occurrence for '{value}': {e}"))?;
            Ok(Some(next.with_timezone(&Utc)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::testing::StubChannel;
    use crate::container::ContainerHandle;
    use crate::types::RegisteredGroup;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn next_run_interval_adds_milliseconds() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let next = compute_next_run(ScheduleKind::Interval, "60000", "UTC", from)
            .unwrap()
            .unwrap();
        assert_eq!(next, from + chrono::Duration::minutes(1));

        assert!(compute_next_run(ScheduleKind::Interval, "0", "UTC", from).is_err());
        assert!(compute_next_run(ScheduleKind::Interval, "soon", "UTC", from).is_err());
    }

    #[test]
    fn next_run_once_is_none() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            compute_next_run(ScheduleKind::Once, "", "UTC", from).unwrap(),
            None
        );
    }

    #[test]
    fn next_run_cron_honors_timezone() {
        let from = Utc.with_ymd_and_hms(2024, 2, 16, 0, 0, 0).unwrap();
        let next = compute_next_run(
            ScheduleKind::Cron,
            "0 9 * * *",
            "America/Los_Angeles",
            from,
        )
        .unwrap()
        .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 2, 16, 17, 0, 0).unwrap());

        let utc_next = compute_next_run(ScheduleKind::Cron, "0 9 * * *", "UTC", from)
            .unwrap()
            .unwrap();
        assert_eq!(utc_next, Utc.with_ymd_and_hms(2024, 2, 16, 9, 0, 0).unwrap());
    }

    #[test]
    fn next_run_cron_rejects_garbage() {
        let from = Utc::now();
        assert!(compute_next_run(ScheduleKind::Cron, "not a cron", "UTC", from).is_err());
        assert!(compute_next_run(ScheduleKind::Cron, "0 9 * * *", "Mars/Olympus", from).is_err());
    }

    // ── Tick fixture ────────────────────────────────────────────────────

    struct FakeLauncher {
        queue: Arc<GroupQueue>,
        script: Mutex<Vec<AgentRecord>>,
        launches: AtomicUsize,
        last_spec: Mutex<Option<LaunchSpec>>,
    }

    #[async_trait]
    impl ContainerLauncher for FakeLauncher {
        async fn launch(&self, spec: LaunchSpec) -> anyhow::Result<Arc<ContainerHandle>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            *self.last_spec.lock().unwrap() = Some(spec.clone());
            let dir = std::env::temp_dir().join(format!("relaybot-sched-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&dir).unwrap();
            let handle = Arc::new(ContainerHandle::new(
                crate::container::container_name(&spec.group_folder),
                spec.jid.clone(),
                spec.group_folder.clone(),
                dir,
                spec.task_container,
            ));
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            handle.attach_events(rx);
            self.queue.register_process(&spec.jid, Arc::clone(&handle));
            for record in self.script.lock().unwrap().drain(..) {
                tx.send(record).unwrap();
            }
            let exit_handle = Arc::clone(&handle);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                drop(tx);
                exit_handle.mark_exited();
            });
            Ok(handle)
        }
    }

    struct Fixture {
        scheduler: Arc<Scheduler>,
        store: Arc<Store>,
        channel: Arc<StubChannel>,
        launcher: Arc<FakeLauncher>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(script: Vec<AgentRecord>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(&dir.path().join("test.db")).await.unwrap());

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
        std::fs::create_dir_all(config.groups_dir.join("family")).unwrap();

        let queue = Arc::new(GroupQueue::new(2, Duration::from_millis(5000), 5));
        let launcher = Arc::new(FakeLauncher {
            queue: Arc::clone(&queue),
            script: Mutex::new(script),
            launches: AtomicUsize::new(0),
            last_spec: Mutex::new(None),
        });
        let channel = Arc::new(StubChannel::new("whatsapp", |jid| jid.ends_with("@g.us")));
        let sessions: Arc<SessionMap> = Arc::new(Mutex::new(HashMap::new()));

        let scheduler = Arc::new(Scheduler::new(
            config,
            Arc::clone(&store),
            groups,
            queue,
            launcher.clone() as Arc<dyn ContainerLauncher>,
            vec![channel.clone() as Arc<dyn Channel>],
            sessions,
            CancellationToken::new(),
        ));

        Fixture {
            scheduler,
            store,
            channel,
            launcher,
            _dir: dir,
        }
    }

    fn due_task(id: &str, kind: ScheduleKind, value: &str, folder: &str) -> ScheduledTask {
        ScheduledTask {
            id: id.to_string(),
            group_folder: folder.to_string(),
            chat_jid: "g1@g.us".to_string(),
            prompt: "run the report".to_string(),
            schedule_kind: kind,
            schedule_value: value.to_string(),
            context_mode: ContextMode::Isolated,
            status: TaskStatus::Active,
            next_run_at: Some("2024-01-01T00:00:00Z".to_string()),
            created_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn due_task_runs_and_advances() {
        let fx = fixture(vec![
            AgentRecord::Result {
                text: "report ready".to_string(),
            },
            AgentRecord::Status {
                status: "success".to_string(),
                error: None,
            },
        ])
        .await;
        fx.store
            .create_task(&due_task("t1", ScheduleKind::Interval, "60000", "family"))
            .await
            .unwrap();

        fx.scheduler.tick().await.unwrap();
        // Let the queued run and the 10s close delay play out.
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(fx.launcher.launches.load(Ordering::SeqCst), 1);
        let spec = fx.launcher.last_spec.lock().unwrap().clone().unwrap();
        assert!(spec.task_container, "tasks run in task containers");
        assert_eq!(spec.prompt, "run the report");

        assert_eq!(
            fx.channel.sent(),
            vec![("g1@g.us".to_string(), "report ready".to_string())]
        );

        let task = fx.store.get_task_by_id("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Active);
        let next = task.next_run_at.expect("interval task reschedules");
        assert!(next > "2024-01-01T00:00:00Z".to_string());

        let runs = fx.store.get_task_runs("t1", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].result.as_deref(), Some("report ready"));
    }

    #[tokio::test(start_paused = true)]
    async fn once_task_becomes_done_after_run() {
        let fx = fixture(vec![
            AgentRecord::Result {
                text: "one-shot done".to_string(),
            },
            AgentRecord::Status {
                status: "success".to_string(),
                error: None,
            },
        ])
        .await;
        fx.store
            .create_task(&due_task("t1", ScheduleKind::Once, "", "family"))
            .await
            .unwrap();

        fx.scheduler.tick().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        let task = fx.store.get_task_by_id("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert!(task.next_run_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_folder_pauses_task_with_error_run() {
        let fx = fixture(vec![]).await;
        fx.store
            .create_task(&due_task("t1", ScheduleKind::Interval, "60000", "missing"))
            .await
            .unwrap();

        fx.scheduler.tick().await.unwrap();

        let task = fx.store.get_task_by_id("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Paused);
        assert_eq!(fx.launcher.launches.load(Ordering::SeqCst), 0);

        let runs = fx.store.get_task_runs("t1", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Error);
        assert_eq!(runs[0].error.as_deref(), Some("invalid group folder"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_schedule_pauses_task() {
        let fx = fixture(vec![]).await;
        fx.store
            .create_task(&due_task("t1", ScheduleKind::Cron, "ten past never", "family"))
            .await
            .unwrap();

        fx.scheduler.tick().await.unwrap();

        let task = fx.store.get_task_by_id("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Paused);
        let runs = fx.store.get_task_runs("t1", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].error.as_deref().unwrap().contains("invalid schedule"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_is_logged_but_task_stays_active() {
        let fx = fixture(vec![AgentRecord::Status {
            status: "error".to_string(),
            error: Some("agent blew up".to_string()),
        }])
        .await;
        fx.store
            .create_task(&due_task("t1", ScheduleKind::Interval, "60000", "family"))
            .await
            .unwrap();

        fx.scheduler.tick().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        let task = fx.store.get_task_by_id("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Active, "failures do not pause the task");
        assert!(task.next_run_at.is_some());

        let runs = fx.store.get_task_runs("t1", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Error);
        assert_eq!(runs[0].error.as_deref(), Some("agent blew up"));
    }

    #[tokio::test(start_paused = true)]
    async fn tick_does_not_double_fire_a_running_task() {
        let fx = fixture(vec![
            AgentRecord::Result {
                text: "slow result".to_string(),
            },
            AgentRecord::Status {
                status: "success".to_string(),
                error: None,
            },
        ])
        .await;
        fx.store
            .create_task(&due_task("t1", ScheduleKind::Interval, "3600000", "family"))
            .await
            .unwrap();

        fx.scheduler.tick().await.unwrap();
        // Second tick runs before the task's run future has completed.
        fx.scheduler.tick().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(
            fx.launcher.launches.load(Ordering::SeqCst),
            1,
            "next_run_at advanced at fire time"
        );
    }
}
