use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::partition;
use crate::collab::JobRecord;
use crate::protocol::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Initializing,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Initializing => write!(f, "initializing"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time view of one job, published after every state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub customer_id: String,
    pub object_id: String,
    pub status: JobStatus,
    pub first_frame: Option<u32>,
    pub last_frame: Option<u32>,
    pub total_frames: usize,
    pub rendered_frames: usize,
    pub remaining_frames: usize,
    pub workers: Vec<WorkerId>,
    pub desired_workers: usize,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    pub fn new(job_id: Uuid, customer_id: &str, object_id: &str, desired_workers: usize) -> Self {
        Self {
            job_id,
            customer_id: customer_id.to_string(),
            object_id: object_id.to_string(),
            status: JobStatus::Initializing,
            first_frame: None,
            last_frame: None,
            total_frames: 0,
            rendered_frames: 0,
            remaining_frames: 0,
            workers: Vec::new(),
            desired_workers,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Frames a worker should now be rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceUpdate {
    pub worker_id: WorkerId,
    pub frames: Vec<u32>,
}

/// Outcome of a re-partition: slices to push, and workers left with nothing
/// to do. Surplus workers are already detached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rebalance {
    pub updates: Vec<SliceUpdate>,
    pub surplus: Vec<WorkerId>,
}

/// Frames and workers of one render job.
///
/// While at least one worker is attached, every remaining frame has exactly
/// one owner and each worker's frames form one contiguous run of the
/// remaining set.
#[derive(Debug, Clone)]
pub struct RenderJob {
    scene_locator: String,
    first_frame: u32,
    last_frame: u32,
    remaining: BTreeSet<u32>,
    workers: Vec<WorkerId>,
    slices: HashMap<WorkerId, Vec<u32>>,
    owner: HashMap<u32, WorkerId>,
}

impl RenderJob {
    /// Validate a job record. Ranges spanning more than `max_frames` frames
    /// are rejected before any frame set is built.
    pub fn from_record(record: &JobRecord, max_frames: usize) -> Result<Self, String> {
        if record.scene_locator.trim().is_empty() {
            return Err("job record has no scene locator".to_string());
        }
        if record.first_frame > record.last_frame {
            return Err(format!(
                "invalid frame range {}..={}",
                record.first_frame, record.last_frame
            ));
        }
        let span = u64::from(record.last_frame - record.first_frame) + 1;
        if span > max_frames as u64 {
            return Err(format!(
                "frame range {}..={} spans {} frames, limit is {}",
                record.first_frame, record.last_frame, span, max_frames
            ));
        }
        Ok(Self {
            scene_locator: record.scene_locator.clone(),
            first_frame: record.first_frame,
            last_frame: record.last_frame,
            remaining: (record.first_frame..=record.last_frame).collect(),
            workers: Vec::new(),
            slices: HashMap::new(),
            owner: HashMap::new(),
        })
    }

    pub fn scene_locator(&self) -> &str {
        &self.scene_locator
    }

    pub fn first_frame(&self) -> u32 {
        self.first_frame
    }

    pub fn last_frame(&self) -> u32 {
        self.last_frame
    }

    pub fn total_frames(&self) -> usize {
        (self.last_frame - self.first_frame) as usize + 1
    }

    pub fn remaining_frames(&self) -> usize {
        self.remaining.len()
    }

    pub fn rendered_frames(&self) -> usize {
        self.total_frames() - self.remaining.len()
    }

    pub fn is_finished(&self) -> bool {
        self.remaining.is_empty()
    }

    /// Attached workers, in attach order.
    pub fn workers(&self) -> &[WorkerId] {
        &self.workers
    }

    pub fn is_attached(&self, worker_id: &WorkerId) -> bool {
        self.workers.contains(worker_id)
    }

    pub fn slice_of(&self, worker_id: &WorkerId) -> &[u32] {
        self.slices.get(worker_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn owner_of(&self, frame: u32) -> Option<&WorkerId> {
        self.owner.get(&frame)
    }

    /// Append workers not already attached. Returns how many were new.
    pub fn attach(&mut self, workers: &[WorkerId]) -> usize {
        let mut added = 0;
        for worker in workers {
            if !self.workers.contains(worker) {
                self.workers.push(worker.clone());
                added += 1;
            }
        }
        added
    }

    /// Drop a worker. Its frames stay in the remaining set, unowned until
    /// the next rebalance.
    pub fn detach(&mut self, worker_id: &WorkerId) -> bool {
        let Some(pos) = self.workers.iter().position(|w| w == worker_id) else {
            return false;
        };
        self.workers.remove(pos);
        if let Some(frames) = self.slices.remove(worker_id) {
            for frame in frames {
                self.owner.remove(&frame);
            }
        }
        true
    }

    /// Detach the `count` most recently attached workers.
    pub fn detach_newest(&mut self, count: usize) -> Vec<WorkerId> {
        let keep = self.workers.len().saturating_sub(count);
        let dropped: Vec<WorkerId> = self.workers[keep..].to_vec();
        for worker in &dropped {
            self.detach(worker);
        }
        dropped
    }

    /// Re-partition the remaining frames over the attached workers.
    ///
    /// Workers still holding frames come ahead of dry ones in the split, so
    /// only dry workers can end up as surplus. With `resend_all` every worker with frames gets an update;
    /// otherwise only workers whose slice changed do.
    pub fn rebalance(&mut self, resend_all: bool) -> Rebalance {
        let frames: Vec<u32> = self.remaining.iter().copied().collect();
        let mut result = Rebalance::default();

        let (busy, idle): (Vec<WorkerId>, Vec<WorkerId>) = self
            .workers
            .iter()
            .cloned()
            .partition(|w| !self.slice_of(w).is_empty());
        let order: Vec<WorkerId> = busy.into_iter().chain(idle).collect();

        let mut slices = HashMap::with_capacity(self.workers.len());
        let mut owner = HashMap::with_capacity(frames.len());
        for (worker, slice) in partition::contiguous(&frames, &order) {
            if slice.is_empty() {
                result.surplus.push(worker);
                continue;
            }
            for frame in &slice {
                owner.insert(*frame, worker.clone());
            }
            if resend_all || self.slices.get(&worker) != Some(&slice) {
                result.updates.push(SliceUpdate {
                    worker_id: worker.clone(),
                    frames: slice.clone(),
                });
            }
            slices.insert(worker, slice);
        }

        self.workers.retain(|w| !result.surplus.contains(w));
        self.slices = slices;
        self.owner = owner;
        result
    }

    /// Mark `frame` as rendered. Returns false for duplicates and for frames
    /// outside the job.
    pub fn frame_rendered(&mut self, frame: u32) -> bool {
        if !self.remaining.remove(&frame) {
            return false;
        }
        if let Some(worker) = self.owner.remove(&frame) {
            if let Some(slice) = self.slices.get_mut(&worker) {
                slice.retain(|f| *f != frame);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(first: u32, last: u32) -> JobRecord {
        JobRecord {
            job_id: Uuid::new_v4(),
            customer_id: "cust".to_string(),
            object_id: "obj".to_string(),
            scene_locator: "scenes/obj.blend".to_string(),
            first_frame: first,
            last_frame: last,
        }
    }

    const LIMIT: usize = 1_000;

    fn w(name: &str) -> WorkerId {
        WorkerId::from(name)
    }

    fn assert_owner_covers_remaining(job: &RenderJob) {
        if job.workers().is_empty() {
            return;
        }
        for frame in &job.remaining {
            assert!(job.owner_of(*frame).is_some(), "frame {frame} unowned");
        }
        assert_eq!(job.owner.len(), job.remaining.len());
    }

    #[test]
    fn rejects_inverted_range_and_missing_scene() {
        assert!(RenderJob::from_record(&record(10, 9), LIMIT).is_err());

        let mut no_scene = record(1, 2);
        no_scene.scene_locator = " ".to_string();
        assert!(RenderJob::from_record(&no_scene, LIMIT).is_err());

        let single = RenderJob::from_record(&record(5, 5), LIMIT).unwrap();
        assert_eq!(single.total_frames(), 1);
    }

    #[test]
    fn rejects_range_over_frame_limit() {
        let err = RenderJob::from_record(&record(0, u32::MAX), LIMIT).unwrap_err();
        assert!(err.contains("limit is 1000"), "{err}");
        assert!(RenderJob::from_record(&record(1, 1_001), LIMIT).is_err());

        let at_limit = RenderJob::from_record(&record(1, 1_000), LIMIT).unwrap();
        assert_eq!(at_limit.total_frames(), 1_000);
    }

    #[test]
    fn attach_and_rebalance_sends_every_slice() {
        let mut job = RenderJob::from_record(&record(1, 10), LIMIT).unwrap();
        assert_eq!(job.attach(&[w("A"), w("B"), w("A")]), 2);

        let rebalance = job.rebalance(true);

        assert_eq!(rebalance.updates.len(), 2);
        assert_eq!(job.slice_of(&w("A")), &[1, 2, 3, 4, 5]);
        assert_eq!(job.slice_of(&w("B")), &[6, 7, 8, 9, 10]);
        assert!(rebalance.surplus.is_empty());
        assert_owner_covers_remaining(&job);
    }

    #[test]
    fn lost_worker_frames_move_to_survivor() {
        let mut job = RenderJob::from_record(&record(1, 10), LIMIT).unwrap();
        job.attach(&[w("A"), w("B")]);
        job.rebalance(true);
        job.frame_rendered(1);
        job.frame_rendered(2);

        assert!(job.detach(&w("B")));
        let rebalance = job.rebalance(false);

        assert_eq!(
            rebalance.updates,
            vec![SliceUpdate {
                worker_id: w("A"),
                frames: vec![3, 4, 5, 6, 7, 8, 9, 10],
            }]
        );
        assert_owner_covers_remaining(&job);
    }

    #[test]
    fn unchanged_slices_are_not_resent() {
        let mut job = RenderJob::from_record(&record(1, 4), LIMIT).unwrap();
        job.attach(&[w("A"), w("B")]);
        job.rebalance(true);

        assert!(job.rebalance(false).updates.is_empty());
    }

    #[test]
    fn idle_worker_picks_up_share_of_remaining() {
        let mut job = RenderJob::from_record(&record(1, 6), LIMIT).unwrap();
        job.attach(&[w("A"), w("B")]);
        job.rebalance(true);
        for frame in 1..=3 {
            job.frame_rendered(frame);
        }
        assert!(job.slice_of(&w("A")).is_empty());

        let rebalance = job.rebalance(false);

        // B is still busy, so it keeps the head of what it already had.
        assert_eq!(job.slice_of(&w("B")), &[4, 5]);
        assert_eq!(job.slice_of(&w("A")), &[6]);
        assert_eq!(rebalance.updates.len(), 2);
        assert_eq!(job.workers(), &[w("A"), w("B")]);
    }

    #[test]
    fn busy_worker_is_not_made_surplus_by_dry_one() {
        let mut job = RenderJob::from_record(&record(1, 4), LIMIT).unwrap();
        job.attach(&[w("A"), w("B")]);
        job.rebalance(true);
        for frame in [1, 2, 3] {
            job.frame_rendered(frame);
        }
        assert_eq!(job.slice_of(&w("B")), &[4]);

        let rebalance = job.rebalance(false);

        assert_eq!(rebalance.surplus, vec![w("A")]);
        assert!(rebalance.updates.is_empty());
        assert_eq!(job.slice_of(&w("B")), &[4]);
        assert_eq!(job.workers(), &[w("B")]);
        assert_owner_covers_remaining(&job);
    }

    #[test]
    fn surplus_workers_are_detached() {
        let mut job = RenderJob::from_record(&record(1, 2), LIMIT).unwrap();
        job.attach(&[w("A"), w("B"), w("C")]);

        let rebalance = job.rebalance(true);

        assert_eq!(rebalance.surplus, vec![w("C")]);
        assert_eq!(job.workers(), &[w("A"), w("B")]);
        assert_owner_covers_remaining(&job);
    }

    #[test]
    fn duplicate_and_foreign_frames_are_ignored() {
        let mut job = RenderJob::from_record(&record(1, 3), LIMIT).unwrap();
        job.attach(&[w("A")]);
        job.rebalance(true);

        assert!(job.frame_rendered(2));
        assert!(!job.frame_rendered(2));
        assert!(!job.frame_rendered(99));
        assert_eq!(job.rendered_frames(), 1);
        assert_eq!(job.slice_of(&w("A")), &[1, 3]);
    }

    #[test]
    fn detach_newest_keeps_oldest() {
        let mut job = RenderJob::from_record(&record(1, 9), LIMIT).unwrap();
        job.attach(&[w("A"), w("B"), w("C")]);
        job.rebalance(true);

        assert_eq!(job.detach_newest(2), vec![w("B"), w("C")]);
        assert_eq!(job.workers(), &[w("A")]);
        assert_eq!(job.detach_newest(5), vec![w("A")]);
    }

    #[test]
    fn finishing_last_frame() {
        let mut job = RenderJob::from_record(&record(7, 8), LIMIT).unwrap();
        job.attach(&[w("A")]);
        job.rebalance(true);
        job.frame_rendered(7);
        assert!(!job.is_finished());
        job.frame_rendered(8);
        assert!(job.is_finished());
        assert_eq!(job.rendered_frames(), 2);
    }
}
