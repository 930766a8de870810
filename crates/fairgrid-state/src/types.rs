//! Accounting rows: associations, users and QOS.
//!
//! Rows are what the storage backend returns. The association cache
//! fills in the derived fields (`level_shares`, `norm_shares`,
//! `cpu_shares`, `level_cpu_shares`) and the usage counters; storage
//! leaves them at their defaults.

use serde::{Deserialize, Serialize};

/// Unique identifier of an association.
pub type AssocId = u32;

/// Unique identifier of a QOS.
pub type QosId = u32;

// ── Associations ───────────────────────────────────────────────────

/// A (user?, account, cluster, partition?) node of the fairshare tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Association {
    pub id: AssocId,
    /// Parent association id (0 = root).
    pub parent_id: AssocId,
    pub cluster: String,
    pub account: String,
    /// `None` for account-level associations.
    pub user: Option<String>,
    /// `None` for cluster-wide associations.
    pub partition: Option<String>,
    /// Resolved OS uid of `user`.
    #[serde(default)]
    pub uid: Option<u32>,
    /// Relative entitlement among siblings.
    pub fairshare: u32,
    #[serde(default)]
    pub limits: AssocLimits,
    /// Allowed QOS names. Empty means inherit from the parent.
    #[serde(default)]
    pub qos: Vec<String>,

    /// Sum of the children's fairshare, wide enough for any set of `u32` weights.
    #[serde(default)]
    pub level_shares: u64,
    /// Fraction of the whole cluster's entitlement.
    #[serde(default)]
    pub norm_shares: f64,
    #[serde(default)]
    pub cpu_shares: f64,
    #[serde(default)]
    pub level_cpu_shares: f64,
    #[serde(default)]
    pub usage: AssocUsage,
}

/// Resource ceilings. `None` means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssocLimits {
    pub max_jobs: Option<u32>,
    pub max_submit_jobs: Option<u32>,
    pub max_nodes_per_job: Option<u32>,
    /// Minutes.
    pub max_wall_per_job: Option<u32>,
    pub max_cpu_mins_per_job: Option<u64>,
    pub grp_jobs: Option<u32>,
    pub grp_submit_jobs: Option<u32>,
    pub grp_nodes: Option<u32>,
    /// Minutes.
    pub grp_wall: Option<u32>,
    pub grp_cpu_mins: Option<u64>,
}

/// Accumulated usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AssocUsage {
    pub used_jobs: u32,
    pub used_submit_jobs: u32,
    /// Decayed CPU-seconds consumed.
    pub used_shares: f64,
}

impl AssocUsage {
    pub fn is_zero(&self) -> bool {
        self.used_jobs == 0 && self.used_submit_jobs == 0 && self.used_shares == 0.0
    }

    pub fn add(&mut self, other: &AssocUsage) {
        self.used_jobs += other.used_jobs;
        self.used_submit_jobs += other.used_submit_jobs;
        self.used_shares += other.used_shares;
    }
}

impl Association {
    /// An account-level association (no user).
    pub fn account(id: AssocId, parent_id: AssocId, cluster: &str, account: &str, fairshare: u32) -> Self {
        Self {
            id,
            parent_id,
            cluster: cluster.to_string(),
            account: account.to_string(),
            user: None,
            partition: None,
            uid: None,
            fairshare,
            limits: AssocLimits::default(),
            qos: Vec::new(),
            level_shares: 0,
            norm_shares: 0.0,
            cpu_shares: 0.0,
            level_cpu_shares: 0.0,
            usage: AssocUsage::default(),
        }
    }

    /// A user association under `account`.
    pub fn user(
        id: AssocId,
        parent_id: AssocId,
        cluster: &str,
        account: &str,
        user: &str,
        fairshare: u32,
    ) -> Self {
        Self {
            user: Some(user.to_string()),
            ..Self::account(id, parent_id, cluster, account, fairshare)
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id == 0
    }

    /// True for associations without a user.
    pub fn is_account_level(&self) -> bool {
        self.user.is_none()
    }
}

// ── Users ──────────────────────────────────────────────────────────

/// Administrative privilege of a user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminLevel {
    #[default]
    None,
    Operator,
    SuperUser,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub uid: Option<u32>,
    pub default_account: Option<String>,
    #[serde(default)]
    pub admin_level: AdminLevel,
    /// Accounts this user coordinates.
    #[serde(default)]
    pub coord_accounts: Vec<String>,
}

impl User {
    pub fn new(name: &str, default_account: &str) -> Self {
        Self {
            name: name.to_string(),
            uid: None,
            default_account: Some(default_account.to_string()),
            admin_level: AdminLevel::None,
            coord_accounts: Vec::new(),
        }
    }
}

// ── QOS ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Qos {
    pub id: QosId,
    pub name: String,
    pub priority: u32,
    /// `priority / max priority` over the loaded QOS set.
    #[serde(default)]
    pub norm_priority: f64,
    #[serde(default)]
    pub limits: QosLimits,
    /// QOS names this QOS may preempt.
    #[serde(default)]
    pub preemptees: Vec<String>,
    /// QOS names that may preempt this QOS.
    #[serde(default)]
    pub preemptors: Vec<String>,
    #[serde(default)]
    pub used_shares: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QosLimits {
    pub grp_jobs: Option<u32>,
    pub grp_cpu_mins: Option<u64>,
    pub max_jobs_per_user: Option<u32>,
    /// Minutes.
    pub max_wall_per_job: Option<u32>,
}

impl Qos {
    pub fn new(id: QosId, name: &str, priority: u32) -> Self {
        Self {
            id,
            name: name.to_string(),
            priority,
            norm_priority: 0.0,
            limits: QosLimits::default(),
            preemptees: Vec::new(),
            preemptors: Vec::new(),
            used_shares: 0.0,
        }
    }
}

// ── Conditions ─────────────────────────────────────────────────────

/// Filter for association fetches. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssocCondition {
    pub cluster: Option<String>,
    pub accounts: Vec<String>,
    pub users: Vec<String>,
}

impl AssocCondition {
    pub fn cluster(name: &str) -> Self {
        Self {
            cluster: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, assoc: &Association) -> bool {
        if let Some(cluster) = &self.cluster {
            if !cluster.eq_ignore_ascii_case(&assoc.cluster) {
                return false;
            }
        }
        if !self.accounts.is_empty()
            && !self
                .accounts
                .iter()
                .any(|a| a.eq_ignore_ascii_case(&assoc.account))
        {
            return false;
        }
        if !self.users.is_empty() {
            match &assoc.user {
                Some(user) => self.users.iter().any(|u| u == user),
                None => false,
            }
        } else {
            true
        }
    }
}

/// Filter for user fetches. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserCondition {
    pub names: Vec<String>,
}

impl UserCondition {
    pub fn matches(&self, user: &User) -> bool {
        self.names.is_empty() || self.names.iter().any(|n| n == &user.name)
    }
}

/// Filter for QOS fetches. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QosCondition {
    pub names: Vec<String>,
}

impl QosCondition {
    pub fn matches(&self, qos: &Qos) -> bool {
        self.names.is_empty()
            || self
                .names
                .iter()
                .any(|n| n.eq_ignore_ascii_case(&qos.name))
    }
}
