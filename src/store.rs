//! Embedded relational store: chats, messages, registered groups, scheduled
//! tasks, task runs.
//!
//! All timestamps are canonical RFC 3339 UTC strings (`utils::to_ts`), so
//! string comparison in SQL matches chronological order. Message storage is
//! idempotent on `(chat_jid, id)` with REPLACE semantics: re-delivering the
//! same id overwrites content, which is how message edits land.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::types::{
    ChatMetadata, ContextMode, RegisteredGroup, RunStatus, ScheduleKind, ScheduledTask,
    StoredMessage, TaskRunRecord, TaskStatus,
};
use crate::utils::now_ts;

/// The database and its WAL/SHM siblings hold full chat history; keep
/// them owner-only (0600).
#[cfg(unix)]
fn restrict_db_permissions(db_path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let base = db_path.display().to_string();
    let targets =
        std::iter::once(base.clone()).chain(["-wal", "-shm"].map(|s| format!("{base}{s}")));
    for target in targets {
        let path = Path::new(&target);
        if !path.exists() {
            continue;
        }
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
            tracing::warn!(path = %target, "Store file left with default permissions: {e}");
        }
    }
}

#[cfg(not(unix))]
fn restrict_db_permissions(_db_path: &Path) {}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn new(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        restrict_db_permissions(db_path);

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS chats (
                jid TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                channel TEXT NOT NULL DEFAULT '',
                is_group INTEGER NOT NULL DEFAULT 0,
                last_message_time TEXT NOT NULL DEFAULT ''
            )",
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT NOT NULL,
                chat_jid TEXT NOT NULL,
                sender TEXT NOT NULL DEFAULT '',
                sender_name TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL DEFAULT '',
                timestamp TEXT NOT NULL,
                is_from_me INTEGER NOT NULL DEFAULT 0,
                is_bot_message INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (chat_jid, id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_messages_chat_time
                ON messages(chat_jid, timestamp)",
            "CREATE TABLE IF NOT EXISTS registered_groups (
                jid TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                folder TEXT NOT NULL UNIQUE,
                trigger_pattern TEXT NOT NULL DEFAULT '',
                requires_trigger INTEGER NOT NULL DEFAULT 1,
                added_at TEXT NOT NULL,
                last_processed_at TEXT NOT NULL DEFAULT ''
            )",
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                group_folder TEXT NOT NULL,
                chat_jid TEXT NOT NULL,
                prompt TEXT NOT NULL,
                schedule_kind TEXT NOT NULL,
                schedule_value TEXT NOT NULL,
                context_mode TEXT NOT NULL DEFAULT 'isolated',
                status TEXT NOT NULL DEFAULT 'active',
                next_run_at TEXT,
                last_run_at TEXT,
                last_result TEXT,
                created_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_tasks_due
                ON tasks(status, next_run_at)",
            "CREATE TABLE IF NOT EXISTS task_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                run_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                result TEXT,
                error TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_task_runs_task
                ON task_runs(task_id, run_at)",
        ];
        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ── Chats ───────────────────────────────────────────────────────────

    /// Upsert chat metadata. `last_message_time` only moves forward; `name`
    /// replaces the existing value only when non-empty.
    pub async fn store_chat_metadata(
        &self,
        jid: &str,
        ts: &str,
        name: Option<&str>,
        channel: &str,
        is_group: bool,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO chats (jid, name, channel, is_group, last_message_time)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(jid) DO UPDATE SET
               last_message_time = CASE
                   WHEN excluded.last_message_time > chats.last_message_time
                   THEN excluded.last_message_time
                   ELSE chats.last_message_time END,
               name = CASE WHEN excluded.name != '' THEN excluded.name ELSE chats.name END,
               channel = excluded.channel,
               is_group = excluded.is_group",
        )
        .bind(jid)
        .bind(name.unwrap_or(""))
        .bind(channel)
        .bind(is_group as i32)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_chat_name(&self, jid: &str, name: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE chats SET name = ? WHERE jid = ?")
            .bind(name)
            .bind(jid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_all_chats(&self) -> anyhow::Result<Vec<ChatMetadata>> {
        let rows = sqlx::query(
            "SELECT jid, name, channel, is_group, last_message_time
             FROM chats ORDER BY last_message_time DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| ChatMetadata {
                jid: r.get("jid"),
                name: r.get("name"),
                channel: r.get("channel"),
                is_group: r.get::<i32, _>("is_group") != 0,
                last_message_time: r.get("last_message_time"),
            })
            .collect())
    }

    // ── Messages ────────────────────────────────────────────────────────

    /// Idempotent upsert by `(chat_jid, id)`; last writer wins for content.
    pub async fn store_message(&self, msg: &StoredMessage) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO messages
               (id, chat_jid, sender, sender_name, content, timestamp, is_from_me, is_bot_message)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&msg.id)
        .bind(&msg.chat_jid)
        .bind(&msg.sender)
        .bind(&msg.sender_name)
        .bind(&msg.content)
        .bind(&msg.timestamp)
        .bind(msg.is_from_me as i32)
        .bind(msg.is_bot_message as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Messages newer than `since_ts`, excluding anything the bot authored.
    /// The `content NOT LIKE '<name>:%'` clause is a migration backstop for
    /// rows that predate the `is_bot_message` flag; it must stay.
    pub async fn get_messages_since(
        &self,
        jid: &str,
        since_ts: &str,
        assistant_name: &str,
    ) -> anyhow::Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, chat_jid, sender, sender_name, content, timestamp,
                    is_from_me, is_bot_message
             FROM messages
             WHERE chat_jid = ? AND timestamp > ?
               AND is_bot_message = 0
               AND content != ''
               AND content NOT LIKE ? ESCAPE '\\'
             ORDER BY timestamp ASC",
        )
        .bind(jid)
        .bind(since_ts)
        .bind(bot_prefix_pattern(assistant_name))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    /// Union of `get_messages_since` over a set of JIDs, plus the max
    /// timestamp observed (empty string when nothing matched).
    pub async fn get_new_messages(
        &self,
        jids: &[String],
        since_ts: &str,
        assistant_name: &str,
    ) -> anyhow::Result<(Vec<StoredMessage>, String)> {
        if jids.is_empty() {
            return Ok((Vec::new(), String::new()));
        }
        let placeholders: Vec<&str> = jids.iter().map(|_| "?").collect();
        let sql = format!(
            "SELECT id, chat_jid, sender, sender_name, content, timestamp,
                    is_from_me, is_bot_message
             FROM messages
             WHERE chat_jid IN ({}) AND timestamp > ?
               AND is_bot_message = 0
               AND content != ''
               AND content NOT LIKE ? ESCAPE '\\'
             ORDER BY timestamp ASC",
            placeholders.join(", ")
        );
        let mut query = sqlx::query(&sql);
        for jid in jids {
            query = query.bind(jid);
        }
        query = query.bind(since_ts).bind(bot_prefix_pattern(assistant_name));

        let rows = query.fetch_all(&self.pool).await?;
        let messages: Vec<StoredMessage> = rows.iter().map(row_to_message).collect();
        let new_timestamp = messages
            .iter()
            .map(|m| m.timestamp.as_str())
            .max()
            .unwrap_or("")
            .to_string();
        Ok((messages, new_timestamp))
    }

    // ── Registered groups ───────────────────────────────────────────────

    pub async fn register_group(&self, group: &RegisteredGroup) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO registered_groups
               (jid, name, folder, trigger_pattern, requires_trigger, added_at, last_processed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(jid) DO UPDATE SET
               name = excluded.name,
               folder = excluded.folder,
               trigger_pattern = excluded.trigger_pattern,
               requires_trigger = excluded.requires_trigger",
        )
        .bind(&group.jid)
        .bind(&group.name)
        .bind(&group.folder)
        .bind(&group.trigger)
        .bind(group.requires_trigger as i32)
        .bind(&group.added_at)
        .bind(&group.last_processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unregister_group(&self, jid: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM registered_groups WHERE jid = ?")
            .bind(jid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_registered_groups(&self) -> anyhow::Result<Vec<RegisteredGroup>> {
        let rows = sqlx::query(
            "SELECT jid, name, folder, trigger_pattern, requires_trigger,
                    added_at, last_processed_at
             FROM registered_groups ORDER BY added_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| RegisteredGroup {
                jid: r.get("jid"),
                name: r.get("name"),
                folder: r.get("folder"),
                trigger: r.get("trigger_pattern"),
                requires_trigger: r.get::<i32, _>("requires_trigger") != 0,
                added_at: r.get("added_at"),
                last_processed_at: r.get("last_processed_at"),
            })
            .collect())
    }

    /// Persist the per-group cursor. Written only after a successful batch.
    pub async fn save_cursor(&self, jid: &str, ts: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE registered_groups SET last_processed_at = ? WHERE jid = ?")
            .bind(ts)
            .bind(jid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Scheduled tasks ─────────────────────────────────────────────────

    pub async fn create_task(&self, task: &ScheduledTask) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO tasks
               (id, group_folder, chat_jid, prompt, schedule_kind, schedule_value,
                context_mode, status, next_run_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.group_folder)
        .bind(&task.chat_jid)
        .bind(&task.prompt)
        .bind(task.schedule_kind.as_str())
        .bind(&task.schedule_value)
        .bind(task.context_mode.as_str())
        .bind(task.status.as_str())
        .bind(&task.next_run_at)
        .bind(&task.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_task(&self, task: &ScheduledTask) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE tasks SET
               group_folder = ?, chat_jid = ?, prompt = ?, schedule_kind = ?,
               schedule_value = ?, context_mode = ?, status = ?, next_run_at = ?
             WHERE id = ?",
        )
        .bind(&task.group_folder)
        .bind(&task.chat_jid)
        .bind(&task.prompt)
        .bind(task.schedule_kind.as_str())
        .bind(&task.schedule_value)
        .bind(task.context_mode.as_str())
        .bind(task.status.as_str())
        .bind(&task.next_run_at)
        .bind(&task.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_task(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_task_by_id(&self, id: &str) -> anyhow::Result<Option<ScheduledTask>> {
        let row = sqlx::query(
            "SELECT id, group_folder, chat_jid, prompt, schedule_kind, schedule_value,
                    context_mode, status, next_run_at, created_at
             FROM tasks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_task(&r)).transpose()
    }

    pub async fn get_all_tasks(&self) -> anyhow::Result<Vec<ScheduledTask>> {
        let rows = sqlx::query(
            "SELECT id, group_folder, chat_jid, prompt, schedule_kind, schedule_value,
                    context_mode, status, next_run_at, created_at
             FROM tasks ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    /// Active tasks whose next run is due at `now`.
    pub async fn get_due_tasks(&self, now: &str) -> anyhow::Result<Vec<ScheduledTask>> {
        let rows = sqlx::query(
            "SELECT id, group_folder, chat_jid, prompt, schedule_kind, schedule_value,
                    context_mode, status, next_run_at, created_at
             FROM tasks
             WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= ?
             ORDER BY next_run_at ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    /// Move the fire time forward (or clear it) at enqueue time, so a
    /// long-running task cannot be double-fired by the next tick.
    pub async fn set_task_next_run(&self, id: &str, next_run: Option<&str>) -> anyhow::Result<()> {
        sqlx::query("UPDATE tasks SET next_run_at = ? WHERE id = ?")
            .bind(next_run)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_task_status(&self, id: &str, status: TaskStatus) -> anyhow::Result<()> {
        sqlx::query("UPDATE tasks SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Advance a task after a run: store the next fire time (or mark a
    /// one-shot done) and keep the latest result summary for inspection.
    pub async fn update_task_after_run(
        &self,
        id: &str,
        next_run: Option<&str>,
        result_summary: &str,
    ) -> anyhow::Result<()> {
        match next_run {
            Some(next) => {
                sqlx::query(
                    "UPDATE tasks SET next_run_at = ?, last_run_at = ?, last_result = ?
                     WHERE id = ?",
                )
                .bind(next)
                .bind(now_ts())
                .bind(result_summary)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE tasks SET next_run_at = NULL, status = 'done',
                            last_run_at = ?, last_result = ?
                     WHERE id = ?",
                )
                .bind(now_ts())
                .bind(result_summary)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn log_task_run(&self, run: &TaskRunRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO task_runs (task_id, run_at, duration_ms, status, result, error)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.task_id)
        .bind(&run.run_at)
        .bind(run.duration_ms)
        .bind(run.status.as_str())
        .bind(&run.result)
        .bind(&run.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_task_runs(
        &self,
        task_id: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<TaskRunRecord>> {
        let rows = sqlx::query(
            "SELECT task_id, run_at, duration_ms, status, result, error
             FROM task_runs WHERE task_id = ?
             ORDER BY run_at DESC LIMIT ?",
        )
        .bind(task_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| TaskRunRecord {
                task_id: r.get("task_id"),
                run_at: r.get("run_at"),
                duration_ms: r.get("duration_ms"),
                status: if r.get::<String, _>("status") == "success" {
                    RunStatus::Success
                } else {
                    RunStatus::Error
                },
                result: r.get("result"),
                error: r.get("error"),
            })
            .collect())
    }
}

/// LIKE pattern matching content that begins with `<assistant_name>:`,
/// with LIKE metacharacters in the name escaped.
fn bot_prefix_pattern(assistant_name: &str) -> String {
    let escaped = assistant_name
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("{}:%", escaped)
}

fn row_to_message(r: &SqliteRow) -> StoredMessage {
    StoredMessage {
        id: r.get("id"),
        chat_jid: r.get("chat_jid"),
        sender: r.get("sender"),
        sender_name: r.get("sender_name"),
        content: r.get("content"),
        timestamp: r.get("timestamp"),
        is_from_me: r.get::<i32, _>("is_from_me") != 0,
        is_bot_message: r.get::<i32, _>("is_bot_message") != 0,
    }
}

fn row_to_task(r: &SqliteRow) -> anyhow::Result<ScheduledTask> {
    Ok(ScheduledTask {
        id: r.get("id"),
        group_folder: r.get("group_folder"),
        chat_jid: r.get("chat_jid"),
        prompt: r.get("prompt"),
        schedule_kind: ScheduleKind::parse(&r.get::<String, _>("schedule_kind"))?,
        schedule_value: r.get("schedule_value"),
        context_mode: ContextMode::parse(&r.get::<String, _>("context_mode")),
        status: TaskStatus::parse(&r.get::<String, _>("status")),
        next_run_at: r.get("next_run_at"),
        created_at: r.get("created_at"),
    })
}
