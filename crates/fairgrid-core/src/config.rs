//! fairgrid.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::bitmap::NodeBitmap;
use crate::error::{CoreError, CoreResult};
use crate::tables::{NodeTable, PartitionTable};
use crate::types::PartitionRecord;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FairgridConfig {
    pub cluster: ClusterConfig,
    pub accounting: AccountingConfig,
    pub backfill: BackfillConfig,
    pub steps: StepConfig,
    /// Node groups, appended to the node table in order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeGroupConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub partitions: Vec<PartitionConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub name: String,
    /// Total CPUs used to scale the root's cpu_shares. 0 = count the node table.
    pub cpu_count: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "cluster".to_string(),
            cpu_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    /// Treat missing associations, users and QOS as hard errors.
    pub enforce: bool,
    /// Fairshare accounting (decay, removal notifications).
    pub fairshare: bool,
    pub half_life_secs: u32,
    pub decay_interval_secs: u64,
    /// How often the cache re-fetches from accounting storage. 0 disables.
    pub refresh_interval_secs: u64,
    pub state_dir: PathBuf,
    pub checkpoint_interval_secs: u64,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            enforce: false,
            fairshare: true,
            half_life_secs: 7 * 24 * 60 * 60,
            decay_interval_secs: 300,
            refresh_interval_secs: 600,
            state_dir: PathBuf::from("/var/lib/fairgrid"),
            checkpoint_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    pub interval_secs: u64,
    /// Skip root-only partitions.
    pub root_filter: bool,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            root_filter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    pub max_tasks_per_node: u32,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_node: 128,
        }
    }
}

/// `count` identical nodes named `{prefix}{n}`, numbered from zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroupConfig {
    pub prefix: String,
    pub count: usize,
    pub cpus: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub name: String,
    #[serde(default)]
    pub priority: u32,
    /// Node index ranges, e.g. `"0-15,32"`.
    pub nodes: String,
    #[serde(default)]
    pub root_only: bool,
    pub max_time: Option<u32>,
    pub max_nodes: Option<u32>,
}

impl FairgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FairgridConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Path of the association checkpoint file.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.accounting.state_dir.join("assoc_mgr_state")
    }

    /// Path of the usage-only file.
    pub fn usage_path(&self) -> PathBuf {
        self.accounting.state_dir.join("assoc_usage")
    }

    /// Build the node table from the `[[nodes]]` groups.
    pub fn node_table(&self) -> NodeTable {
        let mut table = NodeTable::new();
        for group in &self.nodes {
            for n in 0..group.count {
                table.add_node(&format!("{}{n}", group.prefix), group.cpus);
            }
        }
        table
    }

    /// Build the partition table over `nodes`. Duplicate partition names
    /// and ranges past the end of the node table are rejected.
    pub fn partition_table(&self, nodes: &NodeTable) -> CoreResult<PartitionTable> {
        let mut table = PartitionTable::new();
        for part in &self.partitions {
            if table.get(&part.name).is_some() {
                return Err(CoreError::InvalidRange(format!(
                    "duplicate partition {}",
                    part.name
                )));
            }
            let mut record = PartitionRecord::new(
                &part.name,
                part.priority,
                NodeBitmap::from_list(nodes.len(), &part.nodes)?,
            );
            record.root_only = part.root_only;
            record.max_time = part.max_time;
            record.max_nodes = part.max_nodes;
            table.insert(record);
        }
        Ok(table)
    }
}
