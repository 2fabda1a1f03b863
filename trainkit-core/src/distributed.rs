//! Rank awareness for multi-process runs.
//!
//! Process groups and collectives belong to the numerical framework; this
//! module only answers "is this the coordinating rank" so that console
//! output, evaluation, storage and checkpoint writes happen once.

use serde::{Deserialize, Serialize};

/// Rank layout of the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedContext {
    pub rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
}

impl Default for DistributedContext {
    fn default() -> Self {
        Self::single()
    }
}

impl DistributedContext {
    /// A lone process.
    pub fn single() -> Self {
        Self {
            rank: 0,
            local_rank: 0,
            world_size: 1,
        }
    }

    /// Read `RANK`, `LOCAL_RANK` and `WORLD_SIZE` from the environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    /// Unparseable or missing values fall back to a single-process layout.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());
        let world_size = read("WORLD_SIZE").filter(|&w| w > 0).unwrap_or(1);
        let rank = read("RANK").filter(|&r| r < world_size).unwrap_or(0);
        let local_rank = read("LOCAL_RANK").unwrap_or(rank);
        Self {
            rank,
            local_rank,
            world_size,
        }
    }

    pub fn is_master(&self) -> bool {
        self.rank == 0
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }
}
