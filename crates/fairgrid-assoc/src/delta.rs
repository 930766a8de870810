//! Update deltas applied to the cache.

use fairgrid_state::{AdminLevel, AssocId, AssocLimits, Association, Qos, QosId, QosLimits, User};

use crate::error::{AssocError, AssocResult};

/// A field update: leave it, clear it, or set it.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Setting<T> {
    #[default]
    Unchanged,
    Clear,
    Set(T),
}

impl<T: Clone + PartialEq> Setting<T> {
    /// Apply to an optional field. Returns true if the value changed.
    pub fn apply_to(&self, target: &mut Option<T>) -> bool {
        let next = match self {
            Setting::Unchanged => return false,
            Setting::Clear => None,
            Setting::Set(v) => Some(v.clone()),
        };
        let changed = *target != next;
        *target = next;
        changed
    }
}

/// Limit updates for an association.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimitsUpdate {
    pub max_jobs: Setting<u32>,
    pub max_submit_jobs: Setting<u32>,
    pub max_nodes_per_job: Setting<u32>,
    pub max_wall_per_job: Setting<u32>,
    pub max_cpu_mins_per_job: Setting<u64>,
    pub grp_jobs: Setting<u32>,
    pub grp_submit_jobs: Setting<u32>,
    pub grp_nodes: Setting<u32>,
    pub grp_wall: Setting<u32>,
    pub grp_cpu_mins: Setting<u64>,
}

impl LimitsUpdate {
    pub fn apply_to(&self, limits: &mut AssocLimits) {
        self.max_jobs.apply_to(&mut limits.max_jobs);
        self.max_submit_jobs.apply_to(&mut limits.max_submit_jobs);
        self.max_nodes_per_job.apply_to(&mut limits.max_nodes_per_job);
        self.max_wall_per_job.apply_to(&mut limits.max_wall_per_job);
        self.max_cpu_mins_per_job
            .apply_to(&mut limits.max_cpu_mins_per_job);
        self.grp_jobs.apply_to(&mut limits.grp_jobs);
        self.grp_submit_jobs.apply_to(&mut limits.grp_submit_jobs);
        self.grp_nodes.apply_to(&mut limits.grp_nodes);
        self.grp_wall.apply_to(&mut limits.grp_wall);
        self.grp_cpu_mins.apply_to(&mut limits.grp_cpu_mins);
    }
}

/// Changes to an existing association.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssocModify {
    pub id: AssocId,
    /// Move under a new parent.
    pub parent_id: Option<AssocId>,
    pub fairshare: Option<u32>,
    pub limits: LimitsUpdate,
    /// QOS delta tokens (`+x`, `-x`, `=x`, `x`).
    pub qos: Vec<String>,
}

impl AssocModify {
    pub fn new(id: AssocId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssocDelta {
    Add(Association),
    Modify(AssocModify),
    Remove(AssocId),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserModify {
    pub name: String,
    pub default_account: Setting<String>,
    pub admin_level: Option<AdminLevel>,
    pub coord_accounts: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserDelta {
    Add(User),
    Modify(UserModify),
    Remove(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QosLimitsUpdate {
    pub grp_jobs: Setting<u32>,
    pub grp_cpu_mins: Setting<u64>,
    pub max_jobs_per_user: Setting<u32>,
    pub max_wall_per_job: Setting<u32>,
}

impl QosLimitsUpdate {
    pub fn apply_to(&self, limits: &mut QosLimits) {
        self.grp_jobs.apply_to(&mut limits.grp_jobs);
        self.grp_cpu_mins.apply_to(&mut limits.grp_cpu_mins);
        self.max_jobs_per_user.apply_to(&mut limits.max_jobs_per_user);
        self.max_wall_per_job.apply_to(&mut limits.max_wall_per_job);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QosModify {
    pub id: QosId,
    pub priority: Option<u32>,
    pub limits: QosLimitsUpdate,
    pub preemptees: Option<Vec<String>>,
    pub preemptors: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QosDelta {
    Add(Qos),
    Modify(QosModify),
    Remove(QosId),
}

/// Options for association updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    /// After a structural change, rebuild account-level usage from the
    /// user associations below them.
    pub propagate_usage: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            propagate_usage: true,
        }
    }
}

/// A delta that failed to apply.
#[derive(Debug)]
pub struct DeltaFailure {
    /// Position of the delta in the batch.
    pub index: usize,
    pub error: AssocError,
}

/// Outcome of a best-effort batch.
#[derive(Debug, Default)]
pub struct UpdateReport {
    pub applied: usize,
    pub failures: Vec<DeltaFailure>,
    /// The fairshare tree was recomputed.
    pub recomputed: bool,
}

impl UpdateReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    /// The first failure, if any.
    pub fn into_result(self) -> AssocResult<usize> {
        match self.failures.into_iter().next() {
            Some(failure) => Err(failure.error),
            None => Ok(self.applied),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setting_semantics() {
        let mut field = Some(5u32);
        assert!(!Setting::Unchanged.apply_to(&mut field));
        assert_eq!(field, Some(5));
        assert!(!Setting::Set(5).apply_to(&mut field));
        assert!(Setting::Set(7).apply_to(&mut field));
        assert_eq!(field, Some(7));
        assert!(Setting::<u32>::Clear.apply_to(&mut field));
        assert_eq!(field, None);
    }

    #[test]
    fn limits_update_touches_only_set_fields() {
        let mut limits = AssocLimits {
            max_jobs: Some(10),
            grp_nodes: Some(4),
            ..AssocLimits::default()
        };
        let update = LimitsUpdate {
            max_jobs: Setting::Set(20),
            grp_wall: Setting::Set(60),
            grp_nodes: Setting::Clear,
            ..LimitsUpdate::default()
        };
        update.apply_to(&mut limits);
        assert_eq!(limits.max_jobs, Some(20));
        assert_eq!(limits.grp_wall, Some(60));
        assert_eq!(limits.grp_nodes, None);
        assert_eq!(limits.max_submit_jobs, None);
    }

    #[test]
    fn report_into_result() {
        let mut report = UpdateReport {
            applied: 2,
            ..UpdateReport::default()
        };
        assert!(report.is_ok());
        report.failures.push(DeltaFailure {
            index: 1,
            error: AssocError::Conflict("missing".into()),
        });
        assert!(matches!(report.into_result(), Err(AssocError::Conflict(_))));
    }
}
