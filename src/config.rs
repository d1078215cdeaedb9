//! Runtime configuration for one replica.

/// Tunables of a replica driver.
///
/// Create a configuration, adjust fields, validate it, and pass it to
/// [`RaftServer::start`](crate::RaftServer::start):
///
/// ```
/// use quoraft::Config;
///
/// let config = Config {
///     snapshot_threshold: 512,
///     ..Default::default()
/// };
/// let config = config.validate()?;
/// # Ok::<(), quoraft::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Maximum number of entries the FSM packs into one append request.
    pub append_request_threshold: u64,

    /// Soft cap on the unsnapshotted in-memory log, in entries. Submission
    /// blocks while the log is at or above this size.
    pub max_log_size: u64,

    /// Run the pre-vote phase before real elections.
    pub enable_prevoting: bool,

    /// Take a local snapshot once this many entries were applied on top of
    /// the previous snapshot.
    pub snapshot_threshold: u64,

    /// Number of entries to keep below a locally taken snapshot, so slightly
    /// lagging followers can still be served from the log.
    pub snapshot_trailing: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            append_request_threshold: 100,
            max_log_size: 4096,
            enable_prevoting: true,
            snapshot_threshold: 1024,
            snapshot_trailing: 200,
        }
    }
}

impl Config {
    /// Validate the state of this config.
    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.snapshot_threshold > self.max_log_size {
            return Err(ConfigError::SnapshotThresholdTooLarge {
                snapshot_threshold: self.snapshot_threshold,
                max_log_size: self.max_log_size,
            });
        }

        Ok(self)
    }
}

/// Errors raised while validating a [`Config`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("snapshot_threshold ({snapshot_threshold}) must not exceed max_log_size ({max_log_size})")]
    SnapshotThresholdTooLarge {
        snapshot_threshold: u64,
        max_log_size: u64,
    },
}
