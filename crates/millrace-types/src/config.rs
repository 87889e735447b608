//! Engine configuration.
//!
//! All tunables are carried in an explicit `EngineConfig` value passed to
//! the components that need it. There is no global configuration state.

use serde::{Deserialize, Serialize};

/// Tunables for the workflow execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Age in seconds after which another worker may forcibly reclaim an
    /// instance lock, assuming the holder crashed.
    #[serde(default = "default_lock_confiscation_secs")]
    pub lock_confiscation_secs: u64,
    /// Expected normal upper bound on how long a worker holds an instance
    /// lock before voluntarily releasing it.
    #[serde(default = "default_max_lock_duration_secs")]
    pub max_lock_duration_secs: u64,
    /// Safety cap on greedy-strategy iterations per engine-step cycle.
    /// Guards against pathological models looping forever; not a
    /// correctness mechanism.
    #[serde(default = "default_greedy_iteration_cap")]
    pub greedy_iteration_cap: u32,
}

fn default_lock_confiscation_secs() -> u64 {
    600
}

fn default_max_lock_duration_secs() -> u64 {
    300
}

fn default_greedy_iteration_cap() -> u32 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_confiscation_secs: default_lock_confiscation_secs(),
            max_lock_duration_secs: default_max_lock_duration_secs(),
            greedy_iteration_cap: default_greedy_iteration_cap(),
        }
    }
}
