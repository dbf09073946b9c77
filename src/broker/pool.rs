use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::JobAddress;
use crate::protocol::{WorkerEvent, WorkerId};

/// One job's outstanding request for more workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Demand {
    pub job_id: Uuid,
    pub count: usize,
}

/// Workers handed to one job by a distribution pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub job_id: Uuid,
    pub address: JobAddress,
    pub workers: Vec<WorkerId>,
}

/// A message the broker owes some job after a state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    WorkerLost {
        job_id: Uuid,
        address: JobAddress,
        worker_id: WorkerId,
    },
    Relay {
        job_id: Uuid,
        address: JobAddress,
        worker_id: WorkerId,
        event: WorkerEvent,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub idle: Vec<WorkerId>,
    pub demands: Vec<Demand>,
    pub assignments: BTreeMap<WorkerId, Uuid>,
    pub registered_jobs: usize,
}

/// The broker's state: idle workers, the FIFO of demands, job routes and the
/// single authoritative worker -> job map.
///
/// A worker id is either idle, assigned to exactly one job, or unknown.
/// Every method keeps that invariant; nothing outside the broker actor ever
/// touches this struct.
#[derive(Debug, Default)]
pub struct WorkerPool {
    idle: VecDeque<WorkerId>,
    demands: VecDeque<Demand>,
    routes: HashMap<Uuid, JobAddress>,
    assignments: HashMap<WorkerId, Uuid>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_job(&mut self, job_id: Uuid, address: JobAddress) {
        tracing::info!(job_id = %job_id, address = %address, "Job registered with broker");
        self.routes.insert(job_id, address);
    }

    /// Forget a job. Any workers still recorded against it go back to the
    /// idle pool. Returns how many were reclaimed.
    pub fn unregister_job(&mut self, job_id: Uuid) -> usize {
        self.routes.remove(&job_id);
        self.withdraw_demand(job_id);

        let orphaned: Vec<WorkerId> = self
            .assignments
            .iter()
            .filter(|(_, owner)| **owner == job_id)
            .map(|(worker, _)| worker.clone())
            .collect();
        for worker in &orphaned {
            self.assignments.remove(worker);
            self.idle.push_back(worker.clone());
        }
        if !orphaned.is_empty() {
            tracing::warn!(
                job_id = %job_id,
                reclaimed = orphaned.len(),
                "Job unregistered while still holding workers"
            );
        }
        tracing::info!(job_id = %job_id, "Job unregistered from broker");
        orphaned.len()
    }

    /// A worker connected, or came back from a job. Returns false if the id
    /// is already known, in which case nothing changes.
    pub fn worker_available(&mut self, worker_id: WorkerId) -> bool {
        if self.idle.contains(&worker_id) || self.assignments.contains_key(&worker_id) {
            tracing::debug!(worker_id = %worker_id, "Worker already known, ignoring");
            return false;
        }
        tracing::info!(worker_id = %worker_id, "Worker available");
        self.idle.push_back(worker_id);
        true
    }

    /// A worker disconnected. If it was working for a job, that job is owed a
    /// `worker-lost` notice.
    pub fn worker_gone(&mut self, worker_id: &WorkerId) -> Option<Notice> {
        if let Some(pos) = self.idle.iter().position(|w| w == worker_id) {
            self.idle.remove(pos);
            tracing::info!(worker_id = %worker_id, "Idle worker disconnected");
            return None;
        }

        let job_id = self.assignments.remove(worker_id)?;
        tracing::info!(worker_id = %worker_id, job_id = %job_id, "Assigned worker disconnected");
        let Some(address) = self.routes.get(&job_id).cloned() else {
            tracing::warn!(job_id = %job_id, "Lost worker belonged to an unrouted job");
            return None;
        };
        Some(Notice::WorkerLost {
            job_id,
            address,
            worker_id: worker_id.clone(),
        })
    }

    /// Upsert a demand. An existing record keeps its place in the queue and
    /// has its count replaced; a count of zero withdraws it.
    pub fn demand(&mut self, job_id: Uuid, count: usize) -> bool {
        if !self.routes.contains_key(&job_id) {
            tracing::warn!(job_id = %job_id, count, "Demand from unregistered job ignored");
            return false;
        }
        if count == 0 {
            self.withdraw_demand(job_id);
            return true;
        }
        match self.demands.iter_mut().find(|d| d.job_id == job_id) {
            Some(existing) => existing.count = count,
            None => self.demands.push_back(Demand { job_id, count }),
        }
        tracing::debug!(job_id = %job_id, count, "Demand recorded");
        true
    }

    pub fn withdraw_demand(&mut self, job_id: Uuid) -> bool {
        let before = self.demands.len();
        self.demands.retain(|d| d.job_id != job_id);
        before != self.demands.len()
    }

    /// Return workers from `job_id` to the idle pool.
    ///
    /// Only workers the broker still records against that job are re-idled;
    /// a worker that disconnected in the meantime, or that belongs to another
    /// job, is skipped. Returns how many were re-idled.
    pub fn release(&mut self, job_id: Uuid, workers: &[WorkerId]) -> usize {
        let mut released = 0;
        for worker in workers {
            if self.assignments.get(worker) == Some(&job_id) {
                self.assignments.remove(worker);
                self.idle.push_back(worker.clone());
                released += 1;
            } else {
                tracing::debug!(
                    worker_id = %worker,
                    job_id = %job_id,
                    "Released worker not owned by job, skipping"
                );
            }
        }
        tracing::info!(job_id = %job_id, released, "Workers released to pool");
        released
    }

    /// Route a worker's own report to the job that owns it.
    pub fn relay(&self, worker_id: &WorkerId, event: WorkerEvent) -> Option<Notice> {
        let job_id = *self.assignments.get(worker_id)?;
        let address = self.routes.get(&job_id)?.clone();
        Some(Notice::Relay {
            job_id,
            address,
            worker_id: worker_id.clone(),
            event,
        })
    }

    /// Greedy FIFO matching of idle workers to demands.
    ///
    /// Pops demands from the head while idle workers remain. Each popped
    /// demand gets `min(count, idle)` workers from the front of the pool and
    /// is consumed entirely, even when the allocation is partial.
    pub fn distribute(&mut self) -> Vec<Assignment> {
        let mut assignments = Vec::new();

        while !self.idle.is_empty() {
            let Some(demand) = self.demands.pop_front() else {
                break;
            };
            let Some(address) = self.routes.get(&demand.job_id).cloned() else {
                tracing::warn!(job_id = %demand.job_id, "Dropping demand for unrouted job");
                continue;
            };

            let take = demand.count.min(self.idle.len());
            let workers: Vec<WorkerId> = self.idle.drain(..take).collect();
            for worker in &workers {
                self.assignments.insert(worker.clone(), demand.job_id);
            }

            tracing::info!(
                job_id = %demand.job_id,
                requested = demand.count,
                granted = workers.len(),
                idle_left = self.idle.len(),
                "Workers assigned"
            );
            assignments.push(Assignment {
                job_id: demand.job_id,
                address,
                workers,
            });
        }

        assignments
    }

    pub fn idle_workers(&self) -> Vec<WorkerId> {
        self.idle.iter().cloned().collect()
    }

    pub fn pending_demands(&self) -> Vec<Demand> {
        self.demands.iter().cloned().collect()
    }

    pub fn owner_of(&self, worker_id: &WorkerId) -> Option<Uuid> {
        self.assignments.get(worker_id).copied()
    }

    pub fn workers_of(&self, job_id: Uuid) -> Vec<WorkerId> {
        let mut workers: Vec<WorkerId> = self
            .assignments
            .iter()
            .filter(|(_, owner)| **owner == job_id)
            .map(|(worker, _)| worker.clone())
            .collect();
        workers.sort();
        workers
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            idle: self.idle_workers(),
            demands: self.pending_demands(),
            assignments: self
                .assignments
                .iter()
                .map(|(w, j)| (w.clone(), *j))
                .collect(),
            registered_jobs: self.routes.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workers(names: &[&str]) -> Vec<WorkerId> {
        names.iter().map(|n| WorkerId::from(*n)).collect()
    }

    fn pool_with_idle(n: usize) -> WorkerPool {
        let mut pool = WorkerPool::new();
        for i in 0..n {
            pool.worker_available(WorkerId::new(format!("w{i}")));
        }
        pool
    }

    fn registered(pool: &mut WorkerPool) -> Uuid {
        let job_id = Uuid::new_v4();
        pool.register_job(job_id, JobAddress::for_job(job_id));
        job_id
    }

    fn assert_exclusive(pool: &WorkerPool) {
        for worker in pool.idle.iter() {
            assert!(
                !pool.assignments.contains_key(worker),
                "{worker} is both idle and assigned"
            );
        }
    }

    #[test]
    fn full_allocation_leaves_remainder_idle() {
        let mut pool = pool_with_idle(5);
        let job = registered(&mut pool);

        pool.demand(job, 3);
        let assigned = pool.distribute();

        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].workers, workers(&["w0", "w1", "w2"]));
        assert_eq!(pool.idle_workers(), workers(&["w3", "w4"]));
        assert!(pool.pending_demands().is_empty());
        assert_exclusive(&pool);
    }

    #[test]
    fn partial_allocation_consumes_demand() {
        let mut pool = pool_with_idle(2);
        let job = registered(&mut pool);

        pool.demand(job, 5);
        let assigned = pool.distribute();

        assert_eq!(assigned[0].workers.len(), 2);
        assert!(pool.idle_workers().is_empty());
        assert!(pool.pending_demands().is_empty());
    }

    #[test]
    fn demand_waits_when_pool_is_empty() {
        let mut pool = WorkerPool::new();
        let job = registered(&mut pool);

        pool.demand(job, 2);
        assert!(pool.distribute().is_empty());
        assert_eq!(pool.pending_demands(), vec![Demand { job_id: job, count: 2 }]);

        pool.worker_available(WorkerId::from("late"));
        let assigned = pool.distribute();
        assert_eq!(assigned[0].workers, workers(&["late"]));
    }

    #[test]
    fn demand_upsert_replaces_and_keeps_position() {
        let mut pool = WorkerPool::new();
        let first = registered(&mut pool);
        let second = registered(&mut pool);

        pool.demand(first, 1);
        pool.demand(second, 1);
        pool.demand(first, 4);

        assert_eq!(
            pool.pending_demands(),
            vec![
                Demand { job_id: first, count: 4 },
                Demand { job_id: second, count: 1 },
            ]
        );
    }

    #[test]
    fn zero_demand_withdraws() {
        let mut pool = WorkerPool::new();
        let job = registered(&mut pool);
        pool.demand(job, 2);
        pool.demand(job, 0);
        assert!(pool.pending_demands().is_empty());
    }

    #[test]
    fn demand_from_unregistered_job_is_ignored() {
        let mut pool = pool_with_idle(1);
        assert!(!pool.demand(Uuid::new_v4(), 1));
        assert!(pool.distribute().is_empty());
        assert_eq!(pool.idle_workers().len(), 1);
    }

    #[test]
    fn fifo_order_across_jobs() {
        let mut pool = pool_with_idle(3);
        let first = registered(&mut pool);
        let second = registered(&mut pool);

        pool.demand(first, 2);
        pool.demand(second, 2);
        let assigned = pool.distribute();

        assert_eq!(assigned.len(), 2);
        assert_eq!(assigned[0].job_id, first);
        assert_eq!(assigned[0].workers.len(), 2);
        assert_eq!(assigned[1].job_id, second);
        assert_eq!(assigned[1].workers.len(), 1);
        assert_exclusive(&pool);
    }

    #[test]
    fn never_allocates_more_than_idle() {
        let mut pool = pool_with_idle(4);
        let jobs: Vec<Uuid> = (0..3).map(|_| registered(&mut pool)).collect();
        for job in &jobs {
            pool.demand(*job, 3);
        }

        let granted: usize = pool.distribute().iter().map(|a| a.workers.len()).sum();
        assert_eq!(granted, 4);
        // The third demand was never popped because the pool ran dry.
        assert_eq!(pool.pending_demands().len(), 1);
        assert_exclusive(&pool);
    }

    #[test]
    fn duplicate_availability_is_ignored() {
        let mut pool = pool_with_idle(1);
        assert!(!pool.worker_available(WorkerId::from("w0")));
        assert_eq!(pool.idle_workers().len(), 1);

        let job = registered(&mut pool);
        pool.demand(job, 1);
        pool.distribute();
        assert!(!pool.worker_available(WorkerId::from("w0")));
        assert!(pool.idle_workers().is_empty());
    }

    #[test]
    fn gone_idle_worker_produces_no_notice() {
        let mut pool = pool_with_idle(2);
        assert!(pool.worker_gone(&WorkerId::from("w0")).is_none());
        assert_eq!(pool.idle_workers(), workers(&["w1"]));
    }

    #[test]
    fn gone_assigned_worker_notifies_owner() {
        let mut pool = pool_with_idle(1);
        let job = registered(&mut pool);
        pool.demand(job, 1);
        pool.distribute();

        let notice = pool.worker_gone(&WorkerId::from("w0"));
        assert_eq!(
            notice,
            Some(Notice::WorkerLost {
                job_id: job,
                address: JobAddress::for_job(job),
                worker_id: WorkerId::from("w0"),
            })
        );
        assert!(pool.owner_of(&WorkerId::from("w0")).is_none());
    }

    #[test]
    fn release_only_reidles_owned_workers() {
        let mut pool = pool_with_idle(2);
        let job = registered(&mut pool);
        let other = registered(&mut pool);
        pool.demand(job, 1);
        pool.demand(other, 1);
        pool.distribute();

        // w0 went away before the job got round to releasing it.
        pool.worker_gone(&WorkerId::from("w0"));
        let released = pool.release(job, &workers(&["w0", "w1", "ghost"]));

        assert_eq!(released, 0);
        assert!(pool.idle_workers().is_empty());
        assert_eq!(pool.owner_of(&WorkerId::from("w1")), Some(other));

        assert_eq!(pool.release(other, &workers(&["w1"])), 1);
        assert_eq!(pool.idle_workers(), workers(&["w1"]));
        assert_exclusive(&pool);
    }

    #[test]
    fn relay_routes_to_owner_only() {
        let mut pool = pool_with_idle(2);
        let job = registered(&mut pool);
        pool.demand(job, 1);
        pool.distribute();

        let event = WorkerEvent::RenderingCompleted {};
        assert!(matches!(
            pool.relay(&WorkerId::from("w0"), event.clone()),
            Some(Notice::Relay { job_id, .. }) if job_id == job
        ));
        assert!(pool.relay(&WorkerId::from("w1"), event).is_none());
    }

    #[test]
    fn unregister_reclaims_orphans_and_drops_demand() {
        let mut pool = pool_with_idle(2);
        let job = registered(&mut pool);
        pool.demand(job, 1);
        pool.distribute();
        pool.demand(job, 1);

        assert_eq!(pool.unregister_job(job), 1);
        assert_eq!(pool.idle_workers().len(), 2);
        assert!(pool.pending_demands().is_empty());
        assert_eq!(pool.snapshot().registered_jobs, 0);
    }

    #[test]
    fn demand_for_job_unregistered_while_queued_is_dropped() {
        let mut pool = WorkerPool::new();
        let job = registered(&mut pool);
        pool.demand(job, 1);
        pool.routes.remove(&job);
        pool.worker_available(WorkerId::from("w0"));

        assert!(pool.distribute().is_empty());
        assert!(pool.pending_demands().is_empty());
        assert_eq!(pool.idle_workers().len(), 1);
    }
}
