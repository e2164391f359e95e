//! Worker identities and shards.

use crate::errors::ConfigError;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A machine in the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Machine {
    pub name: String,
    pub address: String,
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.address)
    }
}

/// Position of one worker within a statically enumerated pool. This is the only coordination
/// primitive between workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerIdentity {
    index: usize,
    pool_size: usize,
}

impl WorkerIdentity {
    pub fn new(index: usize, pool_size: usize) -> Result<WorkerIdentity, ConfigError> {
        if pool_size == 0 {
            return Err(ConfigError::EmptyPool);
        }
        if index >= pool_size {
            return Err(ConfigError::WorkerOutOfRange { index, pool_size });
        }
        Ok(WorkerIdentity { index, pool_size })
    }

    /// Locate `host` (a machine name or address) in the pool. The pool is ordered by machine
    /// name so that every orchestrator derives the same identity for the same host.
    pub fn from_pool(machines: &[Machine], host: &str) -> Result<WorkerIdentity, ConfigError> {
        if machines.is_empty() {
            return Err(ConfigError::EmptyPool);
        }
        let sorted: Vec<&Machine> = machines.iter().sorted().collect();
        let index = sorted
            .iter()
            .position(|m| m.name == host || m.address == host)
            .ok_or_else(|| ConfigError::UnknownHost {
                host: host.to_string(),
                pool: sorted.iter().map(|m| m.name.clone()).collect(),
            })?;
        WorkerIdentity::new(index, sorted.len())
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker {} of {}", self.index, self.pool_size)
    }
}

/// The sample ids assigned to one worker, in global order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerShard {
    pub worker_index: usize,
    pub pool_size: usize,
    pub assigned_sample_ids: Vec<String>,
}

impl WorkerShard {
    pub fn len(&self) -> usize {
        self.assigned_sample_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assigned_sample_ids.is_empty()
    }
}
