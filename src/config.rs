//! Process-level parameters for a dispatch node. Configuration comes from
//! the embedding process or the environment; there is no flags parsing here.

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// How a Shiftboss picks the worker for each work order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    #[default]
    LoadBalancing,
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Worker tasks spawned per Shiftboss.
    pub num_workers: usize,
    /// NUMA node hint per worker index; -1 or missing means unpinned.
    pub worker_numa_nodes: Vec<i32>,
    /// In-flight work orders tolerated per worker before backlogging.
    pub max_messages_per_worker: usize,
    /// Bus server endpoint for networked deployments.
    pub bus_address: String,
    pub selection_strategy: SelectionStrategy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            worker_numa_nodes: Vec::new(),
            max_messages_per_worker: 2,
            bus_address: "127.0.0.1:4575".to_string(),
            selection_strategy: SelectionStrategy::default(),
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(num_workers) = std::env::var("DISPATCH_NUM_WORKERS") {
            config.num_workers = num_workers.parse().map_err(|e| {
                DispatchError::Configuration {
                    message: format!("invalid DISPATCH_NUM_WORKERS: {e}"),
                }
            })?;
        }

        if let Ok(max_messages) = std::env::var("DISPATCH_MAX_MESSAGES_PER_WORKER") {
            config.max_messages_per_worker = max_messages.parse().map_err(|e| {
                DispatchError::Configuration {
                    message: format!("invalid DISPATCH_MAX_MESSAGES_PER_WORKER: {e}"),
                }
            })?;
        }

        if let Ok(bus_address) = std::env::var("DISPATCH_BUS_ADDRESS") {
            config.bus_address = bus_address;
        }

        if let Ok(strategy) = std::env::var("DISPATCH_SELECTION_STRATEGY") {
            config.selection_strategy = match strategy.as_str() {
                "round_robin" => SelectionStrategy::RoundRobin,
                "load_balancing" => SelectionStrategy::LoadBalancing,
                "random" => SelectionStrategy::Random,
                other => {
                    return Err(DispatchError::Configuration {
                        message: format!("invalid DISPATCH_SELECTION_STRATEGY: {other}"),
                    })
                }
            };
        }

        if config.num_workers == 0 {
            return Err(DispatchError::Configuration {
                message: "DISPATCH_NUM_WORKERS must be at least 1".into(),
            });
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DispatchConfig::default();
        assert!(config.num_workers > 0);
        assert!(config.max_messages_per_worker > 0);
        assert_eq!(config.selection_strategy, SelectionStrategy::LoadBalancing);
    }

    #[test]
    fn test_strategy_round_trips_through_serde() {
        let json = serde_json::to_string(&SelectionStrategy::RoundRobin).unwrap();
        assert_eq!(json, "\"round_robin\"");
        let back: SelectionStrategy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SelectionStrategy::RoundRobin);
    }
}
