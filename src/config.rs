use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, assembled from the enumerated environment
/// variables. Nothing else is read from the process environment: channel
/// and agent credentials live in the env *file* (see `envfile`), so they
/// are never inherited by spawned children.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Displayed bot identity; also the legacy content-prefix backstop.
    pub assistant_name: String,
    /// Interval between message-loop ticks.
    pub poll_interval: Duration,
    /// Interval between scheduler ticks.
    pub scheduler_poll_interval: Duration,
    /// Global cap on concurrently running agent containers.
    pub max_concurrent_containers: usize,
    /// Container image tag for agent containers.
    pub container_image: String,
    /// IANA timezone used for cron schedules.
    pub timezone: String,
    /// Root for mutable state: ipc dirs, env file.
    pub data_dir: PathBuf,
    /// Root for per-group working folders.
    pub groups_dir: PathBuf,
    /// Directory holding the embedded database.
    pub store_dir: PathBuf,
    /// Health endpoint port.
    pub health_port: u16,
}

pub const BASE_RETRY_MS: u64 = 5_000;
pub const MAX_RETRIES: u32 = 5;
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const TASK_CLOSE_DELAY: Duration = Duration::from_secs(10);
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

fn default_assistant_name() -> String {
    "Andy".to_string()
}
fn default_poll_interval_ms() -> u64 {
    15_000
}
fn default_scheduler_poll_interval_ms() -> u64 {
    30_000
}
fn default_max_concurrent() -> usize {
    2
}
fn default_container_image() -> String {
    "relaybot-agent:latest".to_string()
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_health_port() -> u16 {
    8080
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl CoreConfig {
    /// Build the config from the enumerated environment variables.
    /// Malformed numeric values are a config error, not a silent default.
    pub fn from_env() -> anyhow::Result<Self> {
        let poll_interval_ms = match env_var("POLL_INTERVAL") {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| anyhow::anyhow!("POLL_INTERVAL must be an integer (ms), got '{raw}'"))?,
            None => default_poll_interval_ms(),
        };
        let scheduler_poll_ms = match env_var("SCHEDULER_POLL_INTERVAL") {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                anyhow::anyhow!("SCHEDULER_POLL_INTERVAL must be an integer (ms), got '{raw}'")
            })?,
            None => default_scheduler_poll_interval_ms(),
        };
        let max_concurrent = match env_var("MAX_CONCURRENT_CONTAINERS") {
            Some(raw) => {
                let n = raw.parse::<usize>().map_err(|_| {
                    anyhow::anyhow!("MAX_CONCURRENT_CONTAINERS must be an integer, got '{raw}'")
                })?;
                if n < 1 {
                    anyhow::bail!("MAX_CONCURRENT_CONTAINERS must be >= 1");
                }
                n
            }
            None => default_max_concurrent(),
        };
        let health_port = match env_var("HEALTH_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| anyhow::anyhow!("HEALTH_PORT must be a port number, got '{raw}'"))?,
            None => default_health_port(),
        };

        let data_dir = PathBuf::from(env_var("DATA_DIR").unwrap_or_else(|| "./data".to_string()));

        Ok(Self {
            assistant_name: env_var("ASSISTANT_NAME").unwrap_or_else(default_assistant_name),
            poll_interval: Duration::from_millis(poll_interval_ms),
            scheduler_poll_interval: Duration::from_millis(scheduler_poll_ms),
            max_concurrent_containers: max_concurrent,
            container_image: env_var("CONTAINER_IMAGE").unwrap_or_else(default_container_image),
            timezone: env_var("TIMEZONE").unwrap_or_else(default_timezone),
            groups_dir: PathBuf::from("./groups"),
            store_dir: PathBuf::from("./store"),
            data_dir,
            health_port,
        })
    }

    /// Path of the env file channels and the container runner read
    /// credentials from.
    pub fn env_file(&self) -> PathBuf {
        self.data_dir.join("env").join("env")
    }

    /// Per-group IPC directory (inbox files + close sentinel).
    pub fn ipc_dir(&self, folder: &str) -> PathBuf {
        self.data_dir.join("ipc").join(folder)
    }

    /// Per-group working folder mounted read-write into the container.
    pub fn group_dir(&self, folder: &str) -> PathBuf {
        self.groups_dir.join(folder)
    }

    /// Location of the mount allowlist.
    pub fn mount_allowlist_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home)
            .join(".config")
            .join("relaybot")
            .join("mount-allowlist.json")
    }
}
