//! Per-group work queue: one serialized lane per JID under a global
//! concurrency cap.
//!
//! A lane's slot covers the whole container lifetime, not just one batch:
//! after a message batch succeeds the container lingers in Idle and can
//! accept follow-up input through its inbox, so the lane worker stays
//! parked on it until the container exits. Scheduled tasks preempt only
//! idle containers (via the `_close` sentinel) and always run in a fresh
//! container of their own.
//!
//! Drain order on container exit: pending tasks first (enqueue order),
//! then the pending message batch, then the slot is released and the next
//! waiting JID admitted.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::container::ContainerHandle;

/// Installed by the orchestrator; runs one message batch for a JID and
/// reports success. Failures are retried with exponential backoff.
pub type ProcessMessagesFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// A scheduled-task execution, fully formed by the scheduler (which owns
/// run logging); the queue only sequences it.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct QueuedTask {
    task_id: String,
    run: TaskFuture,
}

enum Work {
    Messages,
    Task(QueuedTask),
}

#[derive(Default)]
struct Lane {
    active: bool,
    task_container: bool,
    idle_waiting: bool,
    container: Option<Arc<ContainerHandle>>,
    pending_messages: bool,
    pending_tasks: VecDeque<QueuedTask>,
    retry_count: u32,
    /// Wakes the lane worker out of its idle park when new work arrives.
    wake: Arc<Notify>,
}

struct QueueInner {
    lanes: HashMap<String, Lane>,
    active_count: usize,
    waiting: VecDeque<String>,
    shutdown: bool,
}

pub struct GroupQueue {
    max_concurrent: usize,
    base_retry: Duration,
    max_retries: u32,
    inner: Mutex<QueueInner>,
    process_fn: RwLock<Option<ProcessMessagesFn>>,
}

impl GroupQueue {
    pub fn new(max_concurrent: usize, base_retry: Duration, max_retries: u32) -> Self {
        Self {
            max_concurrent,
            base_retry,
            max_retries,
            inner: Mutex::new(QueueInner {
                lanes: HashMap::new(),
                active_count: 0,
                waiting: VecDeque::new(),
                shutdown: false,
            }),
            process_fn: RwLock::new(None),
        }
    }

    pub fn set_process_messages_fn(&self, f: ProcessMessagesFn) {
        *self.process_fn.write().expect("process_fn lock poisoned") = Some(f);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("group queue lock poisoned")
    }

    /// Mark that a JID has unconsumed messages and start a lane if a slot
    /// is free. Refused after shutdown.
    pub fn enqueue_message_check(self: &Arc<Self>, jid: &str) -> bool {
        let admitted = {
            let mut inner = self.lock();
            if inner.shutdown {
                return false;
            }
            let lane = inner.lanes.entry(jid.to_string()).or_default();
            lane.pending_messages = true;
            lane.wake.notify_one();
            Self::try_admit(&mut inner, self.max_concurrent, jid)
        };
        if admitted {
            self.spawn_lane_worker(jid.to_string());
        }
        true
    }

    /// Queue a scheduled-task run. An idle container on the lane is asked
    /// to close so the task can start fresh; a busy one keeps running and
    /// the task fires on drain.
    pub fn enqueue_task(self: &Arc<Self>, jid: &str, task_id: &str, run: TaskFuture) -> bool {
        let (admitted, close_target) = {
            let mut inner = self.lock();
            if inner.shutdown {
                return false;
            }
            let lane = inner.lanes.entry(jid.to_string()).or_default();
            lane.pending_tasks.push_back(QueuedTask {
                task_id: task_id.to_string(),
                run,
            });
            lane.wake.notify_one();
            if lane.active {
                let close = if lane.idle_waiting {
                    lane.container.clone()
                } else {
                    None
                };
                (false, close)
            } else {
                (Self::try_admit(&mut inner, self.max_concurrent, jid), None)
            }
        };
        if let Some(handle) = close_target {
            Self::request_close(&handle);
        }
        if admitted {
            self.spawn_lane_worker(jid.to_string());
        }
        true
    }

    /// Called by the container runner once the agent process is up.
    pub fn register_process(&self, jid: &str, handle: Arc<ContainerHandle>) {
        let mut inner = self.lock();
        let lane = inner.lanes.entry(jid.to_string()).or_default();
        lane.task_container = handle.task_container;
        lane.idle_waiting = false;
        lane.container = Some(handle);
    }

    /// Container reported a clean batch end (IDLE). If tasks are waiting,
    /// the idle container is closed so the next one starts fresh.
    pub fn notify_idle(&self, jid: &str) {
        let close_target = {
            let mut inner = self.lock();
            let Some(lane) = inner.lanes.get_mut(jid) else {
                return;
            };
            lane.idle_waiting = true;
            lane.wake.notify_one();
            if lane.pending_tasks.is_empty() {
                None
            } else {
                lane.container.clone()
            }
        };
        if let Some(handle) = close_target {
            Self::request_close(&handle);
        }
    }

    /// Deliver user input to the lane's running container. Returns false
    /// when there is no container to accept it or the container belongs to
    /// a scheduled task (user messages never enter task containers).
    pub fn send_message(&self, jid: &str, text: &str) -> bool {
        let handle = {
            let mut inner = self.lock();
            let Some(lane) = inner.lanes.get_mut(jid) else {
                return false;
            };
            if !lane.active || lane.task_container {
                return false;
            }
            let Some(handle) = lane.container.clone() else {
                return false;
            };
            if handle.exited() {
                return false;
            }
            lane.idle_waiting = false;
            handle
        };
        match handle.write_inbox(text) {
            Ok(()) => true,
            Err(e) => {
                warn!(jid = %jid, "Inbox write failed: {e}");
                false
            }
        }
    }

    /// Write the close sentinel for the lane's container, asking the agent
    /// to exit cleanly.
    pub fn close_stdin(&self, jid: &str) {
        let handle = {
            let inner = self.lock();
            inner.lanes.get(jid).and_then(|l| l.container.clone())
        };
        if let Some(handle) = handle {
            Self::request_close(&handle);
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock().active_count
    }

    pub fn active_container(&self, jid: &str) -> Option<Arc<ContainerHandle>> {
        self.lock().lanes.get(jid).and_then(|l| l.container.clone())
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shutdown
    }

    /// Drain to shutdown: refuse new work, ask running containers to
    /// close, wait up to `deadline` for slots to empty, then forcibly
    /// release whatever is left.
    pub async fn shutdown(&self, deadline: Duration) {
        let close_targets: Vec<Arc<ContainerHandle>> = {
            let mut inner = self.lock();
            inner.shutdown = true;
            inner.waiting.clear();
            inner
                .lanes
                .values()
                .filter(|l| l.active)
                .filter_map(|l| l.container.clone())
                .collect()
        };
        for handle in &close_targets {
            Self::request_close(handle);
        }

        let deadline_at = tokio::time::Instant::now() + deadline;
        loop {
            if self.lock().active_count == 0 {
                info!("Group queue drained cleanly");
                return;
            }
            if tokio::time::Instant::now() >= deadline_at {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let abandoned = {
            let mut inner = self.lock();
            let mut abandoned = 0;
            for lane in inner.lanes.values_mut() {
                if lane.active {
                    if let Some(handle) = &lane.container {
                        handle.cancel.cancel();
                    }
                    lane.active = false;
                    lane.container = None;
                    lane.pending_messages = false;
                    lane.pending_tasks.clear();
                    abandoned += 1;
                }
            }
            inner.active_count = 0;
            abandoned
        };
        warn!(abandoned, "Group queue shutdown deadline elapsed; slots forcibly released");
    }

    // ── Lane worker ─────────────────────────────────────────────────────

    fn try_admit(inner: &mut QueueInner, max_concurrent: usize, jid: &str) -> bool {
        let already_active = inner.lanes.get(jid).is_some_and(|l| l.active);
        if already_active {
            return false;
        }
        if inner.active_count >= max_concurrent {
            if !inner.waiting.iter().any(|j| j == jid) {
                inner.waiting.push_back(jid.to_string());
            }
            return false;
        }
        inner.active_count += 1;
        inner.lanes.entry(jid.to_string()).or_default().active = true;
        true
    }

    fn spawn_lane_worker(self: &Arc<Self>, jid: String) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            queue.run_lane(jid).await;
        });
    }

    async fn run_lane(self: Arc<Self>, jid: String) {
        loop {
            match self.take_work(&jid) {
                None => break,
                Some(Work::Task(task)) => {
                    info!(jid = %jid, task_id = %task.task_id, "Running scheduled task");
                    task.run.await;
                }
                Some(Work::Messages) => {
                    self.run_message_batch(&jid).await;
                }
            }
            // The container from this work item may still be alive and
            // idle; park on it so follow-up input can reuse it.
            self.idle_park(&jid).await;
        }
    }

    async fn run_message_batch(self: &Arc<Self>, jid: &str) {
        let process = self
            .process_fn
            .read()
            .expect("process_fn lock poisoned")
            .clone();
        let Some(process) = process else {
            warn!(jid = %jid, "No message processor installed; dropping batch");
            return;
        };
        let ok = process(jid.to_string()).await;
        self.note_message_outcome(jid, ok);
    }

    /// Bookkeeping after a message batch: reset the retry counter on
    /// success, otherwise schedule the next attempt at
    /// `base_retry * 2^retry_count` until the budget is exhausted.
    fn note_message_outcome(self: &Arc<Self>, jid: &str, ok: bool) {
        let retry_in = {
            let mut inner = self.lock();
            let Some(lane) = inner.lanes.get_mut(jid) else {
                return;
            };
            if ok {
                lane.retry_count = 0;
                None
            } else if lane.retry_count >= self.max_retries {
                warn!(jid = %jid, retries = lane.retry_count, "Message batch retries exhausted; giving up until next enqueue");
                lane.retry_count = 0;
                None
            } else {
                let delay = self.base_retry * 2u32.pow(lane.retry_count);
                lane.retry_count += 1;
                Some(delay)
            }
        };
        if let Some(delay) = retry_in {
            debug!(jid = %jid, ?delay, "Scheduling message batch retry");
            let queue = self.weak_self();
            let jid = jid.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(queue) = queue.upgrade() {
                    queue.enqueue_message_check(&jid);
                }
            });
        }
    }

    /// Park while the lane's container is alive. New pending messages are
    /// fed to it in place; pending tasks close it (from `notify_idle` /
    /// `enqueue_task`) and are picked up by `take_work` after exit.
    async fn idle_park(self: &Arc<Self>, jid: &str) {
        loop {
            let (handle, wake) = {
                let inner = self.lock();
                let Some(lane) = inner.lanes.get(jid) else {
                    return;
                };
                match &lane.container {
                    Some(h) if !h.exited() => (Arc::clone(h), Arc::clone(&lane.wake)),
                    _ => return,
                }
            };

            tokio::select! {
                _ = handle.wait_exit() => {
                    let mut inner = self.lock();
                    if let Some(lane) = inner.lanes.get_mut(jid) {
                        if lane
                            .container
                            .as_ref()
                            .is_some_and(|h| Arc::ptr_eq(h, &handle))
                        {
                            lane.container = None;
                            lane.idle_waiting = false;
                        }
                    }
                    return;
                }
                _ = wake.notified() => {
                    let run_messages = {
                        let mut inner = self.lock();
                        match inner.lanes.get_mut(jid) {
                            Some(lane) if lane.pending_messages && !lane.task_container => {
                                lane.pending_messages = false;
                                true
                            }
                            _ => false,
                        }
                    };
                    if run_messages {
                        self.run_message_batch(jid).await;
                    }
                }
            }
        }
    }

    /// Pick the lane's next unit of work, or release the slot (and admit
    /// the next waiting JID) when there is none.
    fn take_work(self: &Arc<Self>, jid: &str) -> Option<Work> {
        let mut inner = self.lock();

        if !inner.shutdown {
            let lane = inner
                .lanes
                .get_mut(jid)
                .expect("active lane must exist in map");
            if let Some(task) = lane.pending_tasks.pop_front() {
                lane.task_container = true;
                lane.idle_waiting = false;
                lane.container = None;
                return Some(Work::Task(task));
            }
            if lane.pending_messages {
                lane.pending_messages = false;
                lane.task_container = false;
                return Some(Work::Messages);
            }
        }

        // Nothing left (or draining): release the slot.
        if let Some(lane) = inner.lanes.get_mut(jid) {
            if lane.active {
                lane.active = false;
                lane.task_container = false;
                lane.idle_waiting = false;
                lane.container = None;
                inner.active_count -= 1;
            }
        }

        if !inner.shutdown {
            while let Some(next) = inner.waiting.pop_front() {
                if Self::try_admit(&mut inner, self.max_concurrent, &next) {
                    self.spawn_lane_worker(next);
                    break;
                }
            }
        }
        None
    }

    fn request_close(handle: &ContainerHandle) {
        if let Err(e) = handle.request_close() {
            warn!(container = %handle.name, "Close sentinel write failed: {e}");
        }
    }

    fn weak_self(self: &Arc<Self>) -> std::sync::Weak<Self> {
        Arc::downgrade(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn queue(max: usize) -> Arc<GroupQueue> {
        Arc::new(GroupQueue::new(max, Duration::from_millis(5000), 5))
    }

    /// Install a processor that records each invocation's virtual time and
    /// returns the scripted outcomes in order (last outcome repeats).
    fn scripted_processor(
        queue: &Arc<GroupQueue>,
        outcomes: Vec<bool>,
    ) -> Arc<Mutex<Vec<(String, tokio::time::Instant)>>> {
        let calls: Arc<Mutex<Vec<(String, tokio::time::Instant)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let calls_in = Arc::clone(&calls);
        let outcomes = Arc::new(outcomes);
        queue.set_process_messages_fn(Arc::new(move |jid: String| {
            let calls = Arc::clone(&calls_in);
            let outcomes = Arc::clone(&outcomes);
            Box::pin(async move {
                let n = {
                    let mut calls = calls.lock().unwrap();
                    calls.push((jid, tokio::time::Instant::now()));
                    calls.len() - 1
                };
                *outcomes.get(n).or_else(|| outcomes.last()).unwrap()
            })
        }));
        calls
    }

    fn test_handle(dir: &std::path::Path, task_container: bool) -> Arc<ContainerHandle> {
        Arc::new(ContainerHandle::new(
            "relaybot-test-0001".to_string(),
            "g@g.us".to_string(),
            "test".to_string(),
            dir.to_path_buf(),
            task_container,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn single_enqueue_processes_once() {
        let q = queue(2);
        let calls = scripted_processor(&q, vec![true]);
        q.enqueue_message_check("g1@g.us");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(q.active_count(), 0, "slot released after drain");
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_enqueues_coalesce() {
        let q = queue(2);
        let calls = scripted_processor(&q, vec![true]);
        // Burst of inbound notifications for the same JID before the
        // worker gets scheduled: one batch.
        q.enqueue_message_check("g1@g.us");
        q.enqueue_message_check("g1@g.us");
        q.enqueue_message_check("g1@g.us");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn global_cap_admits_third_jid_after_drain() {
        let q = queue(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = mpsc::unbounded_channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(release_rx));

        let running_in = Arc::clone(&running);
        let peak_in = Arc::clone(&peak);
        q.set_process_messages_fn(Arc::new(move |_jid| {
            let running = Arc::clone(&running_in);
            let peak = Arc::clone(&peak_in);
            let release_rx = Arc::clone(&release_rx);
            Box::pin(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                release_rx.lock().await.recv().await;
                running.fetch_sub(1, Ordering::SeqCst);
                true
            })
        }));

        q.enqueue_message_check("a@g.us");
        q.enqueue_message_check("b@g.us");
        q.enqueue_message_check("c@g.us");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(running.load(Ordering::SeqCst), 2, "third JID must wait");
        assert_eq!(q.active_count(), 2);

        release_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(running.load(Ordering::SeqCst), 2, "c admitted after a slot freed");

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(running.load(Ordering::SeqCst), 0);
        assert_eq!(peak.load(Ordering::SeqCst), 2, "cap never exceeded");
        assert_eq!(q.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn per_jid_batches_are_serialized() {
        let q = queue(4);
        let running = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));

        let running_in = Arc::clone(&running);
        let overlap_in = Arc::clone(&overlap);
        q.set_process_messages_fn(Arc::new(move |_jid| {
            let running = Arc::clone(&running_in);
            let overlap = Arc::clone(&overlap_in);
            Box::pin(async move {
                if running.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlap.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                true
            })
        }));

        for _ in 0..5 {
            q.enqueue_message_check("g1@g.us");
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(overlap.load(Ordering::SeqCst), 0, "same-JID batches overlapped");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_backoff_schedule_matches_doubling_series() {
        let q = queue(2);
        let calls = scripted_processor(&q, vec![false]);
        let t0 = tokio::time::Instant::now();
        q.enqueue_message_check("g1@g.us");

        tokio::time::sleep(Duration::from_secs(400)).await;

        let observed: Vec<u64> = calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, at)| at.duration_since(t0).as_secs())
            .collect();
        assert_eq!(
            observed,
            vec![0, 5, 15, 35, 75, 155],
            "attempts at base * 2^n offsets"
        );

        // Exhausted: no further attempts without a new enqueue.
        tokio::time::sleep(Duration::from_secs(400)).await;
        assert_eq!(calls.lock().unwrap().len(), 6);

        // A new enqueue restarts the sequence from a clean counter.
        q.enqueue_message_check("g1@g.us");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.lock().unwrap().len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_retry_counter() {
        let q = queue(2);
        let calls = scripted_processor(&q, vec![false, true, false, true]);
        let t0 = tokio::time::Instant::now();
        q.enqueue_message_check("g1@g.us");
        // fail@0 -> retry@5 succeeds; counter resets.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(calls.lock().unwrap().len(), 2);

        q.enqueue_message_check("g1@g.us");
        tokio::time::sleep(Duration::from_secs(20)).await;

        let observed: Vec<u64> = calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, at)| at.duration_since(t0).as_secs())
            .collect();
        // Third attempt fails at 20s and retries 5s later, not 10s: the
        // success at 5s reset the counter.
        assert_eq!(observed, vec![0, 5, 20, 25]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_refuses_new_work_and_drains() {
        let q = queue(2);
        let calls = scripted_processor(&q, vec![true]);

        q.shutdown(Duration::from_millis(100)).await;
        assert!(q.is_shut_down());
        assert!(!q.enqueue_message_check("g1@g.us"));
        assert!(!q.enqueue_task("g1@g.us", "t1", Box::pin(async {})));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(q.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_inflight_batch() {
        let q = queue(2);
        let (release_tx, release_rx) = mpsc::unbounded_channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(release_rx));
        let done = Arc::new(AtomicUsize::new(0));
        let done_in = Arc::clone(&done);
        q.set_process_messages_fn(Arc::new(move |_jid| {
            let release_rx = Arc::clone(&release_rx);
            let done = Arc::clone(&done_in);
            Box::pin(async move {
                release_rx.lock().await.recv().await;
                done.fetch_add(1, Ordering::SeqCst);
                true
            })
        }));

        q.enqueue_message_check("g1@g.us");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(q.active_count(), 1);

        let q2 = Arc::clone(&q);
        let shutdown = tokio::spawn(async move {
            q2.shutdown(Duration::from_secs(60)).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        release_tx.send(()).unwrap();
        shutdown.await.unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 1, "in-flight batch completed");
        assert_eq!(q.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_force_releases_after_deadline() {
        let q = queue(2);
        q.set_process_messages_fn(Arc::new(move |_jid| {
            Box::pin(async move {
                // Never finishes on its own.
                std::future::pending::<()>().await;
                true
            })
        }));
        q.enqueue_message_check("g1@g.us");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(q.active_count(), 1);

        q.shutdown(Duration::from_millis(500)).await;
        assert_eq!(q.active_count(), 0, "abandoned slot forcibly released");
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_run_before_pending_messages_on_drain() {
        let q = queue(1);
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        // Occupy the lane with a long first batch, then queue a message
        // check and two tasks behind it.
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let gate = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        let order_first = Arc::clone(&order);
        let gate_in = Arc::clone(&gate);
        q.set_process_messages_fn(Arc::new(move |_jid| {
            let order = Arc::clone(&order_first);
            let gate = Arc::clone(&gate_in);
            Box::pin(async move {
                let rx = gate.lock().await.take();
                if let Some(rx) = rx {
                    let _ = rx.await;
                    order.lock().unwrap().push("first-batch");
                } else {
                    order.lock().unwrap().push("messages");
                }
                true
            })
        }));

        q.enqueue_message_check("g1@g.us");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let order_t1 = Arc::clone(&order);
        q.enqueue_task(
            "g1@g.us",
            "t1",
            Box::pin(async move {
                order_t1.lock().unwrap().push("task-1");
            }),
        );
        let order_t2 = Arc::clone(&order);
        q.enqueue_task(
            "g1@g.us",
            "t2",
            Box::pin(async move {
                order_t2.lock().unwrap().push("task-2");
            }),
        );
        q.enqueue_message_check("g1@g.us");

        release_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            *order.lock().unwrap(),
            vec!["first-batch", "task-1", "task-2", "messages"],
            "tasks drain in enqueue order before the message batch"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn task_enqueue_closes_idle_container() {
        let q = queue(2);
        let dir = tempfile::tempdir().unwrap();
        let handle = test_handle(dir.path(), false);
        let ran = Arc::new(AtomicUsize::new(0));

        // Occupy the lane: the worker will park on the live container.
        let handle_for_fn = Arc::clone(&handle);
        let q_for_fn = Arc::downgrade(&q);
        q.set_process_messages_fn(Arc::new(move |jid: String| {
            let handle = Arc::clone(&handle_for_fn);
            let q = q_for_fn.clone();
            Box::pin(async move {
                if let Some(q) = q.upgrade() {
                    q.register_process(&jid, handle);
                }
                true
            })
        }));
        q.enqueue_message_check("g2@g.us");
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.notify_idle("g2@g.us");
        assert!(!handle.ipc_dir().join("_close").exists());

        let ran_in = Arc::clone(&ran);
        q.enqueue_task(
            "g2@g.us",
            "t1",
            Box::pin(async move {
                ran_in.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // Preemption point: idle container asked to close.
        assert!(handle.ipc_dir().join("_close").exists());
        assert_eq!(ran.load(Ordering::SeqCst), 0, "task waits for container exit");

        // While the task container is pending/active, user sends fail.
        handle.mark_exited();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1, "task ran after container exit");
    }

    #[tokio::test(start_paused = true)]
    async fn task_preemption_waits_for_busy_container() {
        let q = queue(2);
        let dir = tempfile::tempdir().unwrap();
        let handle = test_handle(dir.path(), false);

        let handle_for_fn = Arc::clone(&handle);
        let q_for_fn = Arc::downgrade(&q);
        q.set_process_messages_fn(Arc::new(move |jid: String| {
            let handle = Arc::clone(&handle_for_fn);
            let q = q_for_fn.clone();
            Box::pin(async move {
                if let Some(q) = q.upgrade() {
                    q.register_process(&jid, handle);
                }
                true
            })
        }));
        q.enqueue_message_check("g2@g.us");
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Container is busy (no notify_idle yet): a task must not close it.
        q.enqueue_task("g2@g.us", "t1", Box::pin(async {}));
        assert!(!handle.ipc_dir().join("_close").exists());

        // Once it reports idle with a task pending, it is preempted.
        q.notify_idle("g2@g.us");
        assert!(handle.ipc_dir().join("_close").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn send_message_rejects_task_containers_and_accepts_user_ones() {
        let q = queue(2);
        let dir = tempfile::tempdir().unwrap();

        assert!(!q.send_message("g2@g.us", "nobody home"));

        let user_handle = test_handle(dir.path(), false);
        let handle_for_fn = Arc::clone(&user_handle);
        let q_for_fn = Arc::downgrade(&q);
        q.set_process_messages_fn(Arc::new(move |jid: String| {
            let handle = Arc::clone(&handle_for_fn);
            let q = q_for_fn.clone();
            Box::pin(async move {
                if let Some(q) = q.upgrade() {
                    q.register_process(&jid, handle);
                }
                true
            })
        }));
        q.enqueue_message_check("g2@g.us");
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.notify_idle("g2@g.us");

        assert!(q.send_message("g2@g.us", "hello again"));
        let inbox_files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".msg"))
            .collect();
        assert_eq!(inbox_files.len(), 1);

        // Swap in a task container: user input must bounce.
        let task_handle = test_handle(dir.path(), true);
        q.register_process("g2@g.us", Arc::clone(&task_handle));
        assert!(!q.send_message("g2@g.us", "user input"));

        user_handle.mark_exited();
        task_handle.mark_exited();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_container_receives_followup_batch_in_place() {
        let q = queue(2);
        let dir = tempfile::tempdir().unwrap();
        let handle = test_handle(dir.path(), false);

        let batches = Arc::new(AtomicUsize::new(0));
        let batches_in = Arc::clone(&batches);
        let handle_for_fn = Arc::clone(&handle);
        let q_for_fn = Arc::downgrade(&q);
        q.set_process_messages_fn(Arc::new(move |jid: String| {
            let handle = Arc::clone(&handle_for_fn);
            let q = q_for_fn.clone();
            let batches = Arc::clone(&batches_in);
            Box::pin(async move {
                let n = batches.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    if let Some(q) = q.upgrade() {
                        q.register_process(&jid, handle);
                    }
                } else if let Some(q) = q.upgrade() {
                    // Follow-up batch reuses the still-running container.
                    assert!(q.send_message(&jid, "follow-up"));
                }
                true
            })
        }));

        q.enqueue_message_check("g1@g.us");
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.notify_idle("g1@g.us");
        assert_eq!(q.active_count(), 1, "slot held while container idles");

        q.enqueue_message_check("g1@g.us");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(batches.load(Ordering::SeqCst), 2, "second batch ran in place");
        assert_eq!(q.active_count(), 1, "still the same slot");

        handle.mark_exited();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(q.active_count(), 0, "slot released once the container exits");
    }
}
