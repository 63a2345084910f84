use crate::error::{EmberError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub prune: PruneConfig,
}

/// Replication settings for the bin table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Target number of active locations per bin.
    pub locations_per_bin: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            locations_per_bin: 3,
        }
    }
}

/// Tombstone collection settings.
///
/// The engine stamps tombstones with the clock's current instant, so the
/// effective grace period is decided by whoever drives `prune`: a caller
/// wanting tombstones to linger passes `now - grace` as the horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneConfig {
    /// How often the owning worker should run a prune pass.
    pub interval_secs: u64,
    /// How long expired assignments stay reachable before a prune pass
    /// drops them.
    pub grace_secs: u64,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            grace_secs: 600,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("EMBERCACHE"))
            .build()
            .map_err(|e| EmberError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| EmberError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.replication.locations_per_bin == 0 {
            return Err(EmberError::Config(
                "replication.locations_per_bin must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            replication: ReplicationConfig::default(),
            prune: PruneConfig::default(),
        }
    }
}
