//! Execution strategy selection: maps a strategy token and device/node
//! counts to a concrete parallel execution plan.
//!
//! Resuming from a checkpoint is not part of any plan.

use crate::error::{Result, RunError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Parallelism mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// One device, no replication.
    Single,
    /// One process; the batch is split across a replica per device.
    DataParallel,
    /// One process per device per node; gradients all-reduced between steps.
    DistributedDataParallel,
    /// As `DistributedDataParallel`, with workers spawned by the launcher.
    DistributedSpawn,
}

impl StrategyKind {
    pub fn parse(token: &str) -> Result<Self> {
        match token {
            "single" => Ok(Self::Single),
            "dp" => Ok(Self::DataParallel),
            "ddp" => Ok(Self::DistributedDataParallel),
            "ddp_spawn" => Ok(Self::DistributedSpawn),
            other => Err(RunError::assembly(format!(
                "unknown execution strategy `{other}` (expected single, dp, ddp, or ddp_spawn)"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::DataParallel => "dp",
            Self::DistributedDataParallel => "ddp",
            Self::DistributedSpawn => "ddp_spawn",
        }
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, Self::DistributedDataParallel | Self::DistributedSpawn)
    }
}

/// Resolved parallel execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub strategy: StrategyKind,
    pub devices: Vec<u32>,
    pub node_count: usize,
    pub local_rank: usize,
    /// Number of processes taking part in the run.
    pub world_size: usize,
    /// Number of model replicas computing gradients for each step.
    pub replicas: usize,
    /// Always false: the data pipeline partitions batches upstream, so the
    /// engine must not redistribute samples again.
    pub replace_sampler: bool,
    /// Synchronise batch-norm statistics across replicas.
    pub sync_batchnorm: bool,
}

impl ExecutionPlan {
    /// Devices taking part across all nodes.
    pub fn participating_devices(&self) -> usize {
        self.devices.len() * self.node_count
    }

    /// True for the first process on this node. The plan carries no node rank,
    /// so under a multi-node plan every node has a local zero; nodes sharing
    /// one output root then each write the same all-reduced weights there.
    pub fn is_local_zero(&self) -> bool {
        self.local_rank == 0
    }

    pub fn with_local_rank(mut self, local_rank: usize) -> Result<Self> {
        let ranks = if self.strategy.is_distributed() {
            self.devices.len()
        } else {
            1
        };
        if local_rank >= ranks {
            return Err(RunError::assembly(format!(
                "local rank {local_rank} out of range for {} with {ranks} local process(es)",
                self.strategy.as_str()
            )));
        }
        self.local_rank = local_rank;
        Ok(self)
    }
}

/// Build the execution plan for `strategy` over `devices` on `node_count` nodes.
pub fn select(devices: &[u32], node_count: usize, strategy: &str) -> Result<ExecutionPlan> {
    let kind = StrategyKind::parse(strategy)?;
    if devices.is_empty() {
        return Err(RunError::assembly("at least one device is required"));
    }
    if node_count == 0 {
        return Err(RunError::assembly("node count must be at least 1"));
    }
    let unique: HashSet<&u32> = devices.iter().collect();
    if unique.len() != devices.len() {
        return Err(RunError::assembly(format!("duplicate device ids in {devices:?}")));
    }

    let (world_size, replicas) = match kind {
        StrategyKind::Single => {
            if devices.len() != 1 || node_count != 1 {
                return Err(RunError::assembly(
                    "single strategy takes exactly one device on one node",
                ));
            }
            (1, 1)
        }
        StrategyKind::DataParallel => {
            if node_count != 1 {
                return Err(RunError::assembly(
                    "dp runs in a single process and cannot span nodes; use ddp",
                ));
            }
            (1, devices.len())
        }
        StrategyKind::DistributedDataParallel | StrategyKind::DistributedSpawn => {
            let world = devices.len() * node_count;
            (world, world)
        }
    };

    let plan = ExecutionPlan {
        strategy: kind,
        devices: devices.to_vec(),
        node_count,
        local_rank: 0,
        world_size,
        replicas,
        replace_sampler: false,
        sync_batchnorm: devices.len() * node_count > 1,
    };
    tracing::info!(
        strategy = kind.as_str(),
        devices = ?plan.devices,
        nodes = node_count,
        world_size,
        replicas,
        sync_batchnorm = plan.sync_batchnorm,
        "Selected execution plan"
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_dp_single_device() {
        let plan = select(&[0], 1, "dp").unwrap();
        assert_eq!(plan.strategy, StrategyKind::DataParallel);
        assert_eq!(plan.replicas, 1);
        assert_eq!(plan.world_size, 1);
        assert!(!plan.sync_batchnorm);
        assert!(!plan.replace_sampler);
        assert!(plan.is_local_zero());
    }

    #[test]
    fn test_dp_multi_device_syncs_batchnorm() {
        let plan = select(&[0, 1, 2], 1, "dp").unwrap();
        assert_eq!(plan.replicas, 3);
        assert_eq!(plan.world_size, 1);
        assert!(plan.sync_batchnorm);
    }

    #[test]
    fn test_ddp_spans_nodes() {
        let plan = select(&[0, 1], 2, "ddp").unwrap();
        assert_eq!(plan.world_size, 4);
        assert_eq!(plan.participating_devices(), 4);
        assert!(plan.sync_batchnorm);
        assert!(!plan.replace_sampler);

        // One device on each of two nodes still needs synchronised statistics.
        assert!(select(&[0], 2, "ddp_spawn").unwrap().sync_batchnorm);
    }

    #[test]
    fn test_rejections() {
        assert!(matches!(select(&[0], 1, "horovod"), Err(RunError::AssemblyFailure(_))));
        assert!(select(&[0], 2, "dp").is_err());
        assert!(select(&[0, 1], 1, "single").is_err());
        assert!(select(&[0, 0], 1, "ddp").is_err());
        assert!(select(&[], 1, "dp").is_err());
    }

    #[test]
    fn test_local_rank() {
        let plan = select(&[0, 1], 1, "ddp").unwrap().with_local_rank(1).unwrap();
        assert!(!plan.is_local_zero());
        assert!(select(&[0, 1], 1, "dp").unwrap().with_local_rank(1).is_err());
    }

    #[test]
    fn test_local_zero_is_per_node() {
        let plan = select(&[0, 1], 2, "ddp").unwrap();
        assert_eq!(plan.world_size, 4);
        assert!(plan.is_local_zero());
        assert!(!plan.clone().with_local_rank(1).unwrap().is_local_zero());
        // Ranks index devices on one node, not the whole world.
        assert!(plan.with_local_rank(2).is_err());
    }
}
