//! Job, node and partition tables.
//!
//! Each table carries a `last_update` stamp, a monotonic millisecond
//! timestamp bumped on every mutation. Consumers (the backfill planner)
//! compare stamps to decide whether anything changed since they last looked.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::bitmap::NodeBitmap;
use crate::error::{CoreError, CoreResult};
use crate::types::*;

/// Advance a stamp: wall-clock milliseconds, but always strictly increasing.
fn next_stamp(prev: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    now.max(prev + 1)
}

// ── Jobs ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct JobTable {
    jobs: BTreeMap<JobId, JobRecord>,
    last_update: u64,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job: JobRecord) {
        self.jobs.insert(job.id, job);
        self.touch();
    }

    pub fn remove(&mut self, id: JobId) -> Option<JobRecord> {
        let job = self.jobs.remove(&id);
        if job.is_some() {
            self.touch();
        }
        job
    }

    pub fn get(&self, id: JobId) -> Option<&JobRecord> {
        self.jobs.get(&id)
    }

    /// Mutable access. Callers that change scheduling-relevant fields
    /// should call [`JobTable::touch`].
    pub fn get_mut(&mut self, id: JobId) -> Option<&mut JobRecord> {
        self.jobs.get_mut(&id)
    }

    /// Set a job's priority. Returns false if the job is unknown.
    pub fn set_priority(&mut self, id: JobId, priority: u32) -> bool {
        match self.jobs.get_mut(&id) {
            Some(job) => {
                job.priority = priority;
                self.touch();
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn touch(&mut self) {
        self.last_update = next_stamp(self.last_update);
    }

    pub fn last_update(&self) -> u64 {
        self.last_update
    }
}

// ── Nodes ──────────────────────────────────────────────────────────

/// The cluster's nodes plus the globally available bitmap.
#[derive(Debug, Clone)]
pub struct NodeTable {
    nodes: Vec<NodeRecord>,
    available: NodeBitmap,
    last_update: u64,
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTable {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            available: NodeBitmap::new(0),
            last_update: 0,
        }
    }

    /// Build a table of `count` up nodes named `{prefix}{index}`.
    pub fn uniform(prefix: &str, count: usize, cpus: u32) -> Self {
        let mut table = Self::new();
        for i in 0..count {
            table.add_node(&format!("{prefix}{i}"), cpus);
        }
        table
    }

    /// Append a node; it starts up and available. Returns its index.
    pub fn add_node(&mut self, name: &str, cpus: u32) -> usize {
        let index = self.nodes.len();
        self.nodes.push(NodeRecord {
            index,
            name: name.to_string(),
            cpus,
            up: true,
        });
        let mut available = NodeBitmap::new(self.nodes.len());
        for i in self.available.iter() {
            // Sizes only grow, so every old index still fits.
            let _ = available.set(i);
        }
        let _ = available.set(index);
        self.available = available;
        self.touch();
        index
    }

    /// Mark a node up (available) or down.
    pub fn set_up(&mut self, index: usize, up: bool) -> CoreResult<()> {
        let size = self.nodes.len();
        let node = self
            .nodes
            .get_mut(index)
            .ok_or(CoreError::IndexOutOfRange { index, size })?;
        node.up = up;
        if up {
            self.available.set(index)?;
        } else {
            self.available.clear(index)?;
        }
        self.touch();
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&NodeRecord> {
        self.nodes.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    /// Resolve node names into a bitmap over this table.
    pub fn bitmap_from_names(&self, names: &[String]) -> CoreResult<NodeBitmap> {
        let mut map = NodeBitmap::new(self.nodes.len());
        for name in names {
            let index = self
                .index_of(name)
                .ok_or_else(|| CoreError::UnknownNode(name.clone()))?;
            map.set(index)?;
        }
        Ok(map)
    }

    /// Node names for each set bit, in ascending index order.
    pub fn names(&self, map: &NodeBitmap) -> Vec<String> {
        map.iter()
            .filter_map(|i| self.nodes.get(i).map(|n| n.name.clone()))
            .collect()
    }

    pub fn available(&self) -> &NodeBitmap {
        &self.available
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Total CPUs over every node.
    pub fn total_cpus(&self) -> u64 {
        self.nodes.iter().map(|n| u64::from(n.cpus)).sum()
    }

    pub fn touch(&mut self) {
        self.last_update = next_stamp(self.last_update);
    }

    pub fn last_update(&self) -> u64 {
        self.last_update
    }
}

// ── Partitions ─────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct PartitionTable {
    parts: BTreeMap<String, PartitionRecord>,
    last_update: u64,
}

impl PartitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, part: PartitionRecord) {
        self.parts.insert(part.name.clone(), part);
        self.touch();
    }

    pub fn get(&self, name: &str) -> Option<&PartitionRecord> {
        self.parts.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut PartitionRecord> {
        self.parts.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartitionRecord> {
        self.parts.values()
    }

    /// Partitions ordered by descending priority, then by name.
    pub fn by_priority(&self) -> Vec<&PartitionRecord> {
        let mut parts: Vec<&PartitionRecord> = self.parts.values().collect();
        parts.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn touch(&mut self) {
        self.last_update = next_stamp(self.last_update);
    }

    pub fn last_update(&self) -> u64 {
        self.last_update
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_strictly_increase() {
        let mut jobs = JobTable::new();
        let before = jobs.last_update();
        jobs.insert(JobRecord::pending(1, "batch", 10, 1));
        let after_insert = jobs.last_update();
        assert!(after_insert > before);
        assert!(jobs.set_priority(1, 20));
        assert!(jobs.last_update() > after_insert);
        assert!(!jobs.set_priority(99, 1));
    }

    #[test]
    fn node_table_availability() {
        let mut nodes = NodeTable::uniform("n", 4, 8);
        assert_eq!(nodes.available().to_string(), "0-3");
        nodes.set_up(2, false).unwrap();
        assert_eq!(nodes.available().to_string(), "0-1,3");
        assert!(nodes.set_up(9, true).is_err());
        assert_eq!(nodes.total_cpus(), 32);
    }

    #[test]
    fn node_names_round_trip() {
        let nodes = NodeTable::uniform("n", 4, 8);
        let names = vec!["n3".to_string(), "n1".to_string()];
        let map = nodes.bitmap_from_names(&names).unwrap();
        assert_eq!(nodes.names(&map), vec!["n1".to_string(), "n3".to_string()]);
        assert_eq!(
            nodes.bitmap_from_names(&["zz".to_string()]),
            Err(CoreError::UnknownNode("zz".to_string()))
        );
    }

    #[test]
    fn partitions_sorted_by_priority() {
        let mut parts = PartitionTable::new();
        parts.insert(PartitionRecord::new("low", 1, NodeBitmap::new(2)));
        parts.insert(PartitionRecord::new("high", 10, NodeBitmap::new(2)));
        parts.insert(PartitionRecord::new("alpha", 10, NodeBitmap::new(2)));
        let names: Vec<&str> = parts.by_priority().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "high", "low"]);
    }
}
