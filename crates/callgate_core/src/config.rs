use std::time::Duration;

pub const DEFAULT_PENDING_SOFT_LIMIT: usize = 1000;
pub const DEFAULT_PENDING_HARD_LIMIT: usize = 3000;
pub const DEFAULT_MAX_PENDING_DURATION: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_METADATA_ENTRIES: usize = 1024;

/// How an arriving call waits for an application request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchingMode {
    /// The arrival awaits its match; admission control applies.
    #[default]
    Promise,
    /// The arrival is parked as call data and published by whichever
    /// request drains it.
    Legacy,
}

/// Server configuration.
///
/// ```ignore
/// let config = ServerConfig::builder()
///     .pending_soft_limit(10)
///     .pending_hard_limit(20)
///     .build();
/// ```
#[derive(Debug, Clone, bon::Builder)]
pub struct ServerConfig {
    /// Pending-queue depth at which admission control starts rejecting.
    #[builder(default = DEFAULT_PENDING_SOFT_LIMIT)]
    pub pending_soft_limit: usize,

    /// Pending-queue depth at which every new arrival is rejected.
    #[builder(default = DEFAULT_PENDING_HARD_LIMIT)]
    pub pending_hard_limit: usize,

    /// Arrivals that waited longer than this are failed on the next drain.
    #[builder(default = DEFAULT_MAX_PENDING_DURATION)]
    pub max_pending_duration: Duration,

    #[builder(default)]
    pub matching: MatchingMode,

    /// Upper bound on entries in one metadata array.
    #[builder(default = DEFAULT_MAX_METADATA_ENTRIES)]
    pub max_metadata_entries: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ServerConfig {
    /// Defaults overridden by `CALLGATE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_usize("CALLGATE_MAX_PENDING_REQUESTS") {
            config.pending_soft_limit = v;
        }
        if let Some(v) = env_usize("CALLGATE_MAX_PENDING_REQUESTS_HARD_LIMIT") {
            config.pending_hard_limit = v;
        }
        if let Some(v) = env_usize("CALLGATE_MAX_PENDING_SECONDS") {
            config.max_pending_duration = Duration::from_secs(v as u64);
        }
        config
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
}

/// Configuration for a client channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Authority sent with every call; the transport's peer is used when unset.
    pub authority: Option<String>,

    /// Deadline applied to calls created without one.
    pub default_timeout: Option<Duration>,

    /// Upper bound on entries in one metadata array.
    pub max_metadata_entries: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            authority: None,
            default_timeout: None,
            max_metadata_entries: DEFAULT_MAX_METADATA_ENTRIES,
        }
    }
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the authority.
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    /// Set the default call timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_max_metadata_entries(mut self, max: usize) -> Self {
        self.max_metadata_entries = max;
        self
    }
}
