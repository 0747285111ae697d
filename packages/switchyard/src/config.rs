//! Runtime configuration.
//!
//! One value holds every tunable the runtime reads. Components receive it at
//! construction; nothing reads the environment after startup.

use std::path::PathBuf;
use std::time::Duration;

/// Tunables for a switchyard runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root of the on-disk layout (`data/` by default). Journal lines land
    /// under `<data_dir>/<tenant>/events/...`, snapshots under
    /// `<data_dir>/<tenant>/fsm/...`.
    pub data_dir: PathBuf,

    /// Capacity of each pub/sub broadcast channel.
    pub bus_capacity: usize,

    /// How long a cancelled effect worker gets to wind down cooperatively
    /// before it is aborted.
    pub effect_cancel_grace: Duration,

    /// Soft ceiling on a single `send_event` call. The transition may still
    /// complete internally after the caller sees a timeout.
    pub navigate_timeout: Duration,

    /// Number of per-id lock shards serializing writes to the same instance.
    pub lock_shards: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            bus_capacity: 1024,
            effect_cancel_grace: Duration::from_millis(10),
            navigate_timeout: Duration::from_secs(60),
            lock_shards: 64,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from `SWITCHYARD_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `SWITCHYARD_DATA_DIR` | journal/snapshot root |
    /// | `SWITCHYARD_BUS_CAPACITY` | broadcast channel capacity |
    /// | `SWITCHYARD_EFFECT_GRACE_MS` | cancel grace in milliseconds |
    /// | `SWITCHYARD_NAVIGATE_TIMEOUT_MS` | send_event ceiling in milliseconds |
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("SWITCHYARD_DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }
        if let Some(capacity) = env_parse::<usize>("SWITCHYARD_BUS_CAPACITY") {
            config.bus_capacity = capacity.max(1);
        }
        if let Some(ms) = env_parse::<u64>("SWITCHYARD_EFFECT_GRACE_MS") {
            config.effect_cancel_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("SWITCHYARD_NAVIGATE_TIMEOUT_MS") {
            config.navigate_timeout = Duration::from_millis(ms.max(1));
        }
        config
    }

    /// Override the data directory (builder style, for tests and embedders).
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Override the navigate ceiling.
    pub fn with_navigate_timeout(mut self, timeout: Duration) -> Self {
        self.navigate_timeout = timeout;
        self
    }

    /// Override the effect cancel grace period.
    pub fn with_effect_cancel_grace(mut self, grace: Duration) -> Self {
        self.effect_cancel_grace = grace;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
