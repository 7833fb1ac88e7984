use std::io;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

const DEFAULT_STREAM_IDLE_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_EVENT_BUFFER: usize = 256;
const DEFAULT_STREAM_CHANNEL_CAPACITY: usize = 16;

/// Per-session tuning. Every field is optional so a partial TOML file only
/// overrides what it names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// How long a turn may go without a stream event before it is settled as
    /// errored.
    pub stream_idle_timeout_ms: Option<u64>,

    /// Capacity of the observer broadcast channel. Slow observers skip events
    /// past this many.
    pub event_buffer: Option<usize>,

    /// Capacity of the channel between a transport and its event stream.
    pub stream_channel_capacity: Option<usize>,
}

impl SessionConfig {
    pub fn from_toml_str(contents: &str) -> io::Result<Self> {
        toml::from_str(contents).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        self.stream_idle_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_STREAM_IDLE_TIMEOUT_MS))
    }

    pub fn event_buffer(&self) -> usize {
        self.event_buffer.unwrap_or(DEFAULT_EVENT_BUFFER).max(1)
    }

    pub fn stream_channel_capacity(&self) -> usize {
        self.stream_channel_capacity
            .unwrap_or(DEFAULT_STREAM_CHANNEL_CAPACITY)
            .max(1)
    }
}

/// Reads a [`SessionConfig`] from a TOML file. A missing file yields the
/// defaults.
pub fn load_config_from_path(path: &Path) -> io::Result<SessionConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => SessionConfig::from_toml_str(&contents).map_err(|e| {
            tracing::error!("Failed to parse {}: {e}", path.display());
            e
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::info!("{} not found, using defaults", path.display());
            Ok(SessionConfig::default())
        }
        Err(e) => {
            tracing::error!("Failed to read {}: {e}", path.display());
            Err(e)
        }
    }
}
