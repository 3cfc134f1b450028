//! Agent container lifecycle: spawn, stdin secret hand-off, structured
//! stdout stream, inbox/close IPC files, idle backstop.
//!
//! The wire protocol is newline-delimited JSON on the child's stdout:
//! `result`, `status`, `typing`, and `session` records. Unknown record
//! types are ignored; malformed lines are logged and skipped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{CoreConfig, IDLE_TIMEOUT};
use crate::envfile;
use crate::groups;
use crate::queue::GroupQueue;

pub const CLOSE_SENTINEL: &str = "_close";

// ── Wire protocol ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AgentRecord {
    Result {
        text: String,
    },
    Status {
        status: String,
        #[serde(default)]
        error: Option<String>,
    },
    Typing {
        on: bool,
    },
    Session {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

impl AgentRecord {
    pub fn is_success(&self) -> bool {
        matches!(self, AgentRecord::Status { status, .. } if status == "success")
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentRecord::Status { .. })
    }
}

/// Parse one stdout line. Unknown record types are silently dropped;
/// anything else that fails to parse is a protocol error, logged here and
/// skipped.
pub fn parse_record(line: &str) -> Option<AgentRecord> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<AgentRecord>(line) {
        Ok(record) => Some(record),
        Err(_) => {
            // Valid JSON with an unrecognized type is fine per protocol;
            // anything else is malformed.
            match serde_json::from_str::<serde_json::Value>(line) {
                Ok(value) if value.get("type").is_some() => {
                    debug!(kind = %value["type"], "Ignoring unknown agent record type");
                }
                _ => warn!(line = %crate::utils::truncate_str(line, 120), "Malformed agent record"),
            }
            None
        }
    }
}

/// The single stdin payload: secrets ride here (never env vars or argv),
/// along with the opening prompt and session continuity info.
#[derive(Debug, Serialize)]
struct StdinPayload<'a> {
    secrets: &'a HashMap<String, String>,
    prompt: &'a str,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
    group: &'a str,
    task: bool,
}

// ── Container handle ────────────────────────────────────────────────────

/// Shared view of one running agent container. The queue keeps it for
/// inbox/close delivery; the processor borrows its event stream per batch.
pub struct ContainerHandle {
    pub name: String,
    pub jid: String,
    pub group_folder: String,
    pub task_container: bool,
    pub cancel: CancellationToken,
    ipc_dir: PathBuf,
    events: Mutex<Option<mpsc::UnboundedReceiver<AgentRecord>>>,
    exit: watch::Sender<bool>,
}

impl ContainerHandle {
    pub fn new(
        name: String,
        jid: String,
        group_folder: String,
        ipc_dir: PathBuf,
        task_container: bool,
    ) -> Self {
        let (exit, _) = watch::channel(false);
        Self {
            name,
            jid,
            group_folder,
            task_container,
            cancel: CancellationToken::new(),
            ipc_dir,
            events: Mutex::new(None),
            exit,
        }
    }

    pub fn ipc_dir(&self) -> &Path {
        &self.ipc_dir
    }

    pub fn attach_events(&self, rx: mpsc::UnboundedReceiver<AgentRecord>) {
        *self.events.lock().expect("events lock poisoned") = Some(rx);
    }

    /// Borrow the event stream for one batch. Per-JID mutual exclusion
    /// guarantees a single consumer at a time.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AgentRecord>> {
        self.events.lock().expect("events lock poisoned").take()
    }

    pub fn return_events(&self, rx: mpsc::UnboundedReceiver<AgentRecord>) {
        *self.events.lock().expect("events lock poisoned") = Some(rx);
    }

    /// Atomic inbox drop: write-to-temp then rename, so the agent-side
    /// watcher never observes a partial file.
    pub fn write_inbox(&self, text: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.ipc_dir)?;
        let name = format!("msg-{}.msg", Uuid::new_v4().simple());
        atomic_write(&self.ipc_dir.join(name), text)
    }

    /// Ask the agent to exit by placing the close sentinel.
    pub fn request_close(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.ipc_dir)?;
        atomic_write(&self.ipc_dir.join(CLOSE_SENTINEL), "")
    }

    pub fn mark_exited(&self) {
        let _ = self.exit.send(true);
    }

    pub fn exited(&self) -> bool {
        *self.exit.borrow()
    }

    pub async fn wait_exit(&self) {
        let mut rx = self.exit.subscribe();
        let _ = rx.wait_for(|exited| *exited).await;
    }
}

fn atomic_write(path: &Path, content: &str) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ── Mount allowlist ─────────────────────────────────────────────────────

/// Operator-controlled allowlist for extra host mounts, at
/// `~/.config/relaybot/mount-allowlist.json`. Paths outside every allowed
/// root, or matching a blocked pattern, are rejected.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct MountAllowlist {
    pub allowed_roots: Vec<String>,
    pub blocked_patterns: Vec<String>,
    pub non_main_read_only: bool,
}

impl MountAllowlist {
    /// Absent file means no extra mounts are allowed; a file that exists
    /// but does not parse is a config error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self {
                non_main_read_only: true,
                ..Self::default()
            });
        }
        let content = std::fs::read_to_string(path)?;
        let allowlist: Self = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Malformed mount allowlist {}: {e}", path.display()))?;
        // Fail fast on bad patterns instead of at first container spawn.
        for pattern in &allowlist.blocked_patterns {
            Regex::new(pattern)
                .map_err(|e| anyhow::anyhow!("Invalid blocked pattern '{pattern}': {e}"))?;
        }
        Ok(allowlist)
    }

    /// Validate one extra mount path. Returns the canonicalized host path.
    pub fn validate(&self, path: &Path) -> anyhow::Result<PathBuf> {
        let canonical = std::fs::canonicalize(path)
            .map_err(|e| anyhow::anyhow!("Mount path {} not resolvable: {e}", path.display()))?;
        let canonical_str = canonical.to_string_lossy();

        for pattern in &self.blocked_patterns {
            if let Ok(re) = Regex::new(pattern) {
                if re.is_match(&canonical_str) {
                    anyhow::bail!("Mount path {} matches blocked pattern '{pattern}'", canonical_str);
                }
            }
        }

        let allowed = self.allowed_roots.iter().any(|root| {
            std::fs::canonicalize(root)
                .map(|r| canonical.starts_with(&r))
                .unwrap_or(false)
        });
        if !allowed {
            anyhow::bail!("Mount path {} is outside every allowed root", canonical_str);
        }
        Ok(canonical)
    }
}

// ── Launcher ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub jid: String,
    pub group_folder: String,
    /// Opening transcript or task prompt, delivered in the stdin payload.
    pub prompt: String,
    pub session_id: Option<String>,
    pub task_container: bool,
    pub extra_mounts: Vec<PathBuf>,
}

/// Seam between the work pipeline and the container runtime. The
/// production implementation shells out to docker; tests substitute fakes.
#[async_trait]
pub trait ContainerLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> anyhow::Result<Arc<ContainerHandle>>;
}

pub struct ContainerRunner {
    config: Arc<CoreConfig>,
    allowlist: MountAllowlist,
    queue: Arc<GroupQueue>,
}

impl ContainerRunner {
    pub fn new(config: Arc<CoreConfig>, allowlist: MountAllowlist, queue: Arc<GroupQueue>) -> Self {
        Self {
            config,
            allowlist,
            queue,
        }
    }

    /// Verify the container runtime answers before accepting work.
    pub async fn precheck_runtime(&self) -> anyhow::Result<()> {
        let output = Command::new("docker")
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("Container runtime not reachable: {e}"))?;
        if !output.status.success() {
            anyhow::bail!(
                "Container runtime precheck failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        info!(
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            "Container runtime reachable"
        );
        Ok(())
    }

    /// Remove leftover agent containers from a previous process, matched
    /// by the product name prefix.
    pub async fn cleanup_orphans(&self) {
        let listed = Command::new("docker")
            .args(["ps", "-aq", "--filter", "name=relaybot-"])
            .output()
            .await;
        let Ok(output) = listed else {
            warn!("Orphan container listing failed");
            return;
        };
        let ids: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "Removing orphaned agent containers");
        for id in ids {
            let _ = Command::new("docker").args(["rm", "-f", &id]).output().await;
        }
    }

    fn build_docker_args(
        &self,
        name: &str,
        spec: &LaunchSpec,
        extra_mounts: &[PathBuf],
    ) -> anyhow::Result<Vec<String>> {
        let project_root = std::env::current_dir()?;
        let group_dir = abs(&self.config.group_dir(&spec.group_folder))?;
        let ipc_dir = abs(&self.config.ipc_dir(&spec.group_folder))?;

        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "-i".into(),
            "--name".into(),
            name.to_string(),
            "-v".into(),
            format!("{}:/project:ro", project_root.display()),
            "-v".into(),
            format!("{}:/workspace/group", group_dir.display()),
            "-v".into(),
            format!("{}:/workspace/ipc", ipc_dir.display()),
        ];
        for mount in extra_mounts {
            let read_only = self.allowlist.non_main_read_only && spec.group_folder != "main";
            let suffix = if read_only { ":ro" } else { "" };
            let target = mount
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "mount".to_string());
            args.push("-v".into());
            args.push(format!("{}:/workspace/extra/{}{}", mount.display(), target, suffix));
        }
        args.push(self.config.container_image.clone());
        Ok(args)
    }
}

fn abs(path: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(path)?;
    Ok(std::fs::canonicalize(path)?)
}

pub fn container_name(group_folder: &str) -> String {
    let tag = Uuid::new_v4().simple().to_string();
    format!("relaybot-{}-{}", group_folder, &tag[..8])
}

#[async_trait]
impl ContainerLauncher for ContainerRunner {
    async fn launch(&self, spec: LaunchSpec) -> anyhow::Result<Arc<ContainerHandle>> {
        if !groups::is_valid_folder(&spec.group_folder) {
            anyhow::bail!("Invalid group folder '{}'", spec.group_folder);
        }

        let ipc_dir = self.config.ipc_dir(&spec.group_folder);
        std::fs::create_dir_all(&ipc_dir)?;
        // A stale close sentinel would make the fresh agent exit at once.
        let _ = std::fs::remove_file(ipc_dir.join(CLOSE_SENTINEL));

        let mut validated_mounts = Vec::with_capacity(spec.extra_mounts.len());
        for mount in &spec.extra_mounts {
            validated_mounts.push(self.allowlist.validate(mount)?);
        }

        let name = container_name(&spec.group_folder);
        let args = self.build_docker_args(&name, &spec, &validated_mounts)?;

        let mut child = Command::new("docker")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("Container spawn failed: {e}"))?;

        // Secrets go down stdin in one atomic JSON payload, then stdin
        // closes; later user input arrives as inbox files.
        let secrets = envfile::read_all(&self.config.env_file());
        let payload = serde_json::to_vec(&StdinPayload {
            secrets: &secrets,
            prompt: &spec.prompt,
            session_id: spec.session_id.as_deref(),
            group: &spec.group_folder,
            task: spec.task_container,
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.write_all(b"\n").await?;
            stdin.shutdown().await?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("Container stdout unavailable"))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ContainerHandle::new(
            name.clone(),
            spec.jid.clone(),
            spec.group_folder.clone(),
            ipc_dir,
            spec.task_container,
        ));
        handle.attach_events(events_rx);
        self.queue.register_process(&spec.jid, Arc::clone(&handle));

        info!(container = %name, jid = %spec.jid, task = spec.task_container, "Agent container started");

        let queue = Arc::clone(&self.queue);
        let reader_handle = Arc::clone(&handle);
        tokio::spawn(async move {
            pump_container_output(child, stdout, reader_handle, queue, events_tx).await;
        });

        Ok(handle)
    }
}

/// Read NDJSON records off the child's stdout until EOF, cancellation, or
/// the hard idle ceiling; then reap the child and mark the handle exited.
async fn pump_container_output(
    mut child: tokio::process::Child,
    stdout: tokio::process::ChildStdout,
    handle: Arc<ContainerHandle>,
    queue: Arc<GroupQueue>,
    events_tx: mpsc::UnboundedSender<AgentRecord>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut kill = false;

    loop {
        let idle_deadline = tokio::time::sleep(IDLE_TIMEOUT);
        tokio::select! {
            _ = handle.cancel.cancelled() => {
                kill = true;
                break;
            }
            _ = idle_deadline => {
                warn!(container = %handle.name, "Idle ceiling reached; stopping container");
                kill = true;
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let Some(record) = parse_record(&line) else { continue };
                        if record.is_success() {
                            queue.notify_idle(&handle.jid);
                        }
                        if events_tx.send(record).is_err() {
                            // Nobody will ever consume again; shut down.
                            kill = true;
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(container = %handle.name, "Container stdout read error: {e}");
                        break;
                    }
                }
            }
        }
    }

    if kill {
        let _ = child.kill().await;
    }
    match child.wait().await {
        Ok(status) if status.success() => {
            debug!(container = %handle.name, "Container exited cleanly");
        }
        Ok(status) => {
            warn!(container = %handle.name, %status, "Container exited with error");
        }
        Err(e) => warn!(container = %handle.name, "Container reap failed: {e}"),
    }
    handle.mark_exited();
    // Dropping events_tx ends the batch stream; a consumer mid-batch sees
    // the closed channel and reports the batch as failed.
}
