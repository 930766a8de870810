//! Feasibility oracles for backfill.
//!
//! An oracle answers one question: can this candidate start right now
//! without pushing back any higher-priority pending job in its partition?

use fairgrid_core::{JobId, JobRecord, NodeBitmap, PartitionRecord};

/// Nodes a running job holds inside the partition, and when it is
/// projected to release them (`None` = never).
#[derive(Debug, Clone, PartialEq)]
pub struct RunningHold {
    pub job_id: JobId,
    pub nodes: NodeBitmap,
    pub end: Option<u64>,
}

/// Everything an oracle sees about one candidate.
#[derive(Debug, Clone, Copy)]
pub struct BackfillWindow<'a> {
    pub candidate: &'a JobRecord,
    /// Highest-priority pending job of the partition.
    pub baseline: &'a JobRecord,
    /// Pending jobs ahead of the candidate, highest priority first. The
    /// baseline is the first entry.
    pub ahead: &'a [&'a JobRecord],
    pub partition: &'a PartitionRecord,
    /// Partition nodes that are up and not held by a running job.
    pub idle: &'a NodeBitmap,
    pub running: &'a [RunningHold],
    /// Unix seconds.
    pub now: u64,
}

pub trait FeasibilityOracle: Send + Sync {
    fn can_start_without_delay(&self, window: &BackfillWindow<'_>) -> bool;
}

/// A node-count sweep over the partition's future free capacity.
///
/// Running jobs release their nodes at their projected end. Each job ahead
/// of the candidate, in priority order, reserves its nodes from the
/// earliest moment they are free for its whole duration (the first of
/// these is the baseline's shadow time). The candidate passes when it fits
/// in what is left from now until its own end.
#[derive(Debug, Default, Clone, Copy)]
pub struct NodeSpaceOracle;

#[derive(Debug, Clone, Copy)]
struct Reservation {
    start: u64,
    end: Option<u64>,
    nodes: usize,
}

struct Profile {
    idle: usize,
    /// (end, nodes) for holds that eventually release.
    releases: Vec<(u64, usize)>,
    reservations: Vec<Reservation>,
}

impl Profile {
    fn free_at(&self, t: u64) -> i64 {
        let released: usize = self
            .releases
            .iter()
            .filter(|&&(end, _)| end <= t)
            .map(|&(_, n)| n)
            .sum();
        let reserved: usize = self
            .reservations
            .iter()
            .filter(|r| r.start <= t && r.end.is_none_or(|e| t < e))
            .map(|r| r.nodes)
            .sum();
        (self.idle + released) as i64 - reserved as i64
    }

    /// Times at which free capacity changes, ascending.
    fn breakpoints(&self) -> Vec<u64> {
        let mut points: Vec<u64> = self.releases.iter().map(|&(end, _)| end).collect();
        for r in &self.reservations {
            points.push(r.start);
            points.extend(r.end);
        }
        points.sort_unstable();
        points.dedup();
        points
    }

    fn fits(&self, start: u64, end: Option<u64>, need: usize) -> bool {
        let need = need as i64;
        if self.free_at(start) < need {
            return false;
        }
        self.breakpoints()
            .into_iter()
            .filter(|&t| t > start && end.is_none_or(|e| t < e))
            .all(|t| self.free_at(t) >= need)
    }

    fn earliest_start(&self, now: u64, duration: Option<u64>, need: usize) -> Option<u64> {
        std::iter::once(now)
            .chain(self.breakpoints().into_iter().filter(|&t| t > now))
            .find(|&t| self.fits(t, duration.map(|d| t + d), need))
    }
}

fn node_need(job: &JobRecord) -> usize {
    job.min_nodes.max(1) as usize
}

fn duration_secs(job: &JobRecord, partition: &PartitionRecord) -> Option<u64> {
    job.effective_limit(partition.max_time)
        .map(|minutes| u64::from(minutes) * 60)
}

impl FeasibilityOracle for NodeSpaceOracle {
    fn can_start_without_delay(&self, window: &BackfillWindow<'_>) -> bool {
        let need = node_need(window.candidate);
        let idle = window.idle.weight();
        if need > idle {
            return false;
        }

        let mut profile = Profile {
            idle,
            releases: window
                .running
                .iter()
                .filter_map(|hold| hold.end.map(|end| (end.max(window.now), hold.nodes.weight())))
                .collect(),
            reservations: Vec::new(),
        };

        for job in window.ahead {
            let duration = duration_secs(job, window.partition);
            let need = node_need(job);
            if let Some(start) = profile.earliest_start(window.now, duration, need) {
                profile.reservations.push(Reservation {
                    start,
                    end: duration.map(|d| start + d),
                    nodes: need,
                });
            }
        }

        let end = duration_secs(window.candidate, window.partition).map(|d| window.now + d);
        profile.fits(window.now, end, need)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_000_000;

    fn job(id: JobId, priority: u32, nodes: u32, minutes: Option<u32>) -> JobRecord {
        let mut job = JobRecord::pending(id, "batch", priority, nodes);
        job.time_limit = minutes;
        job
    }

    fn hold(id: JobId, nodes: &str, end_in_mins: Option<u64>) -> RunningHold {
        RunningHold {
            job_id: id,
            nodes: NodeBitmap::from_list(8, nodes).unwrap(),
            end: end_in_mins.map(|m| NOW + m * 60),
        }
    }

    fn check(
        candidate: &JobRecord,
        ahead: &[&JobRecord],
        idle: &str,
        running: &[RunningHold],
    ) -> bool {
        let partition = PartitionRecord::new("batch", 1, NodeBitmap::full(8));
        let idle = NodeBitmap::from_list(8, idle).unwrap();
        NodeSpaceOracle.can_start_without_delay(&BackfillWindow {
            candidate,
            baseline: ahead[0],
            ahead,
            partition: &partition,
            idle: &idle,
            running,
            now: NOW,
        })
    }

    #[test]
    fn short_job_finishing_before_shadow_passes() {
        // 4 idle, baseline wants 6: it starts when the 4 held nodes free up at +60.
        let baseline = job(1, 100, 6, Some(60));
        let running = [hold(9, "4-7", Some(60))];
        assert!(check(&job(2, 50, 4, Some(30)), &[&baseline], "0-3", &running));
        assert!(!check(&job(3, 50, 4, Some(90)), &[&baseline], "0-3", &running));
    }

    #[test]
    fn long_job_fits_beside_baseline_reservation() {
        let baseline = job(1, 100, 6, Some(60));
        let running = [hold(9, "4-7", Some(60))];
        // Two nodes stay free after the baseline takes six of eight.
        assert!(check(&job(2, 50, 2, None), &[&baseline], "0-3", &running));
        assert!(!check(&job(3, 50, 3, None), &[&baseline], "0-3", &running));
    }

    #[test]
    fn candidate_larger_than_idle_fails() {
        let baseline = job(1, 100, 1, Some(10));
        assert!(!check(&job(2, 50, 5, Some(1)), &[&baseline], "0-3", &[]));
    }

    #[test]
    fn every_job_ahead_is_protected() {
        let baseline = job(1, 100, 6, Some(60));
        let second = job(2, 90, 2, Some(120));
        let running = [hold(9, "4-7", Some(60))];
        // Second starts now on 2 idle nodes and overlaps the baseline at +60.
        assert!(!check(&job(3, 50, 2, None), &[&baseline, &second], "0-3", &running));
        assert!(check(&job(3, 50, 2, Some(60)), &[&baseline, &second], "0-3", &running));
    }

    #[test]
    fn unbounded_holds_never_release() {
        let baseline = job(1, 100, 6, Some(60));
        let running = [hold(9, "4-7", None)];
        // The baseline can never start, so it reserves nothing.
        assert!(check(&job(2, 50, 4, None), &[&baseline], "0-3", &running));
    }
}
