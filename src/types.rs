//! Shared domain types: everything the store persists and the components
//! pass between each other.

/// A channel-qualified conversation identifier. Ownership is decided by the
/// channels' `owns_jid` predicates (suffix `@g.us`/`@s.whatsapp.net` for
/// WhatsApp, prefix `slack:` for Slack, prefix `mail:` for mail).
pub type Jid = String;

/// One chat message, unique on `(chat_jid, id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub chat_jid: Jid,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    /// Canonical timestamp string (see `utils::to_ts`).
    pub timestamp: String,
    pub is_from_me: bool,
    pub is_bot_message: bool,
}

/// Chat-level metadata, created on first sighting of a JID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMetadata {
    pub jid: Jid,
    pub name: String,
    pub channel: String,
    pub is_group: bool,
    pub last_message_time: String,
}

/// A conversation the broker dispatches to agent containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredGroup {
    pub jid: Jid,
    pub name: String,
    /// Filesystem-safe identifier: `[A-Za-z0-9_-]+`, never `global`.
    pub folder: String,
    /// Trigger mention, e.g. `@Andy`.
    pub trigger: String,
    pub requires_trigger: bool,
    pub added_at: String,
    /// Cursor: newest timestamp already processed for this JID. Empty means
    /// nothing consumed yet.
    pub last_processed_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Cron,
    Interval,
    Once,
}

impl ScheduleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Interval => "interval",
            Self::Once => "once",
        }
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw {
            "cron" => Ok(Self::Cron),
            "interval" => Ok(Self::Interval),
            "once" => Ok(Self::Once),
            other => anyhow::bail!("Invalid schedule kind '{other}'"),
        }
    }
}

/// Whether a scheduled task shares the group's agent session or runs cold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextMode {
    #[default]
    Isolated,
    Group,
}

impl ContextMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Isolated => "isolated",
            Self::Group => "group",
        }
    }

    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("group") {
            Self::Group
        } else {
            Self::Isolated
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Active,
    Paused,
    Done,
    Error,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "paused" => Self::Paused,
            "done" => Self::Done,
            "error" => Self::Error,
            _ => Self::Active,
        }
    }
}

/// A time-triggered job firing against the same agent infrastructure as
/// inbound messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    pub id: String,
    pub group_folder: String,
    pub chat_jid: Jid,
    pub prompt: String,
    pub schedule_kind: ScheduleKind,
    /// Cron expression, interval in ms, or a one-shot fire time, per kind.
    pub schedule_value: String,
    pub context_mode: ContextMode,
    pub status: TaskStatus,
    pub next_run_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// One execution of a scheduled task, for the run log.
#[derive(Debug, Clone)]
pub struct TaskRunRecord {
    pub task_id: String,
    pub run_at: String,
    pub duration_ms: i64,
    pub status: RunStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}
