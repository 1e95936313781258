use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use stampede_proto::{BatchOutput, BatchStatus, Job, Process};
use tracing::{debug, info, warn};

use crate::serve::ralloc;
use crate::serve::resource::ResourceManager;

/// Which fair-time policy the reallocation pass applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FairnessMode {
    /// DP over projected QPS curves (§ global fair time).
    Global,
    /// Proportional to local batch service time.
    Local,
}

/// Scheduler state: the worker pool plus the three job collections.
/// Lives under the coordinator's lock; every method here is a pure
/// state transition so the coordinator can snapshot RPC work and run it
/// outside the lock.
#[derive(Debug)]
pub struct Scheduler {
    pub resources: ResourceManager,
    pub active_jobs: HashMap<String, Job>,
    pub pending_jobs: VecDeque<String>,
    pub completed_jobs: HashMap<String, Job>,
    pub fairness: FairnessMode,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            resources: ResourceManager::default(),
            active_jobs: HashMap::new(),
            pending_jobs: VecDeque::new(),
            completed_jobs: HashMap::new(),
            fairness: FairnessMode::Global,
        }
    }
}

impl Scheduler {
    pub fn add_job(&mut self, job: Job) {
        info!(job = %job.id, batches = job.total_queries, "job registered");
        self.active_jobs.insert(job.id.clone(), job);
    }

    pub fn job(&self, job_id: &str) -> Option<&Job> {
        self.active_jobs.get(job_id)
    }

    /// Any worker still pointing at a job that no longer exists goes
    /// back to idle.
    pub fn refresh_worker_status(&mut self, now: DateTime<Utc>) {
        for worker in self.resources.iter_mut() {
            let stale = worker
                .job_id
                .as_ref()
                .is_some_and(|job_id| !self.active_jobs.contains_key(job_id));
            if stale {
                worker.reset(now);
            }
        }
    }

    /// Demote any `InProgress` batch no worker is actually holding back
    /// to `Available`; this is how batches survive worker failures and
    /// preemption.
    pub fn refresh_batch_status(&mut self) {
        for job in self.active_jobs.values_mut() {
            let held: Vec<u32> = self
                .resources
                .iter()
                .filter(|worker| worker.job_id.as_deref() == Some(job.id.as_str()))
                .filter_map(|worker| worker.current_batch.as_ref())
                .map(|batch| batch.batch_id)
                .collect();

            for state in &mut job.batches {
                if state.status == BatchStatus::InProgress
                    && !held.contains(&state.input.batch_id)
                {
                    debug!(job = %job.id, batch = state.input.batch_id, "orphaned batch demoted");
                    state.status = BatchStatus::Available;
                }
            }
        }
    }

    /// Deterministic reallocation pass. Computes per-job shares, preempts
    /// the excess (most recently active workers first, releasing any
    /// batch they hold), then hands idle workers to under-allocated jobs
    /// FIFO over the sorted job ids. Returns the dispatch list of
    /// (job id, worker addresses) the coordinator must notify.
    pub fn refresh_schedule(&mut self, now: DateTime<Utc>) -> Vec<(String, Vec<String>)> {
        if self.resources.is_empty() || self.active_jobs.is_empty() {
            return Vec::new();
        }

        // A stable input ordering keeps the allocator deterministic.
        let mut ids: Vec<String> = self.active_jobs.keys().cloned().collect();
        ids.sort();

        let jobs: Vec<&Job> = ids.iter().map(|id| &self.active_jobs[id]).collect();
        let total = self.resources.len();

        let (shares, _) = match self.fairness {
            FairnessMode::Global => {
                let qps = ralloc::jobs_to_qps(&jobs, total, now);
                ralloc::global_fair_ralloc(jobs.len(), total, &qps)
            }
            FairnessMode::Local => ralloc::local_fair_ralloc(&jobs, total),
        };

        // Preempt the excess, most recent query first.
        for (i, id) in ids.iter().enumerate() {
            let current = self.resources.addresses_for_job_recent_first(id);
            let excess = current.len().saturating_sub(shares[i]);

            for address in current.into_iter().take(excess) {
                let Some(worker) = self.resources.get_mut(&address) else {
                    continue;
                };
                worker.job_id = None;
                let released = worker.current_batch.take();

                if let (Some(batch), Some(job)) = (released, self.active_jobs.get_mut(id)) {
                    if let Some(state) = job.batches.get_mut(batch.batch_id as usize) {
                        debug!(job = %id, batch = batch.batch_id, worker = %address,
                               "batch released by preemption");
                        state.status = BatchStatus::Available;
                    }
                }
            }
        }

        // Hand idle workers to jobs that are short of their share.
        let idle = self.resources.idle_addresses();
        let mut next_idle = 0usize;
        let mut schedule: Vec<(String, Vec<String>)> = Vec::new();

        for (i, id) in ids.iter().enumerate() {
            let mut count = self.resources.count_for_job(id);
            let mut assigned = Vec::new();

            while count < shares[i] {
                let Some(address) = idle.get(next_idle) else {
                    warn!(job = %id, "not enough idle workers to satisfy allocation");
                    break;
                };
                assigned.push(address.clone());
                next_idle += 1;
                count += 1;
            }

            if !assigned.is_empty() {
                schedule.push((id.clone(), assigned));
            }
        }

        if next_idle != idle.len() {
            debug!(unused = idle.len() - next_idle, "allocation left workers idle");
        }

        schedule
    }

    /// Ingest one batch result. Marks the batch complete, refreshes the
    /// worker, and enqueues the job for flushing (idempotently) once the
    /// last batch lands.
    pub fn on_receive_batch_output(
        &mut self,
        job_id: &str,
        worker_address: &str,
        output: BatchOutput,
        now: DateTime<Utc>,
    ) {
        let Some(job) = self.active_jobs.get_mut(job_id) else {
            warn!(job = %job_id, "batch output for unknown job");
            return;
        };

        let batch_id = output.batch_id as usize;
        let Some(state) = job.batches.get_mut(batch_id) else {
            warn!(job = %job_id, batch = output.batch_id, "batch output out of range");
            return;
        };

        state.output = Some(output);
        state.status = BatchStatus::Completed;
        state.receive_time = Some(now);
        job.completed_queries = job.completed_batch_count();

        if let Some(worker) = self.resources.get_mut(worker_address) {
            worker.last_query_time = now;
            worker.current_batch = None;
        }

        if !job.is_terminal() {
            return;
        }
        if self.pending_jobs.iter().any(|id| id == job_id) {
            return;
        }
        info!(job = %job_id, "all batches complete, queued for flush");
        self.pending_jobs.push_back(job_id.to_string());
    }

    /// A member joined the ring: it becomes an idle worker.
    pub fn on_worker_joined(&mut self, process: &Process, now: DateTime<Utc>) {
        info!(worker = %process.address(), "worker joined");
        self.resources.add_worker(process.clone(), now);
    }

    /// A member expired out of the ring: drop the worker and free any
    /// batch it was holding.
    pub fn on_worker_failed(&mut self, process: &Process) {
        info!(worker = %process.address(), "worker failed");
        let Some(failed) = self.resources.remove_worker(&process.address()) else {
            return;
        };
        let (Some(job_id), Some(batch)) = (failed.job_id, failed.current_batch) else {
            return;
        };
        if let Some(job) = self.active_jobs.get_mut(&job_id) {
            if let Some(state) = job.batches.get_mut(batch.batch_id as usize) {
                state.status = BatchStatus::Available;
            }
        }
    }

    /// This coordinator left the ring: evacuate everything.
    pub fn on_self_leave(&mut self) {
        info!("leaving ring, clearing workers and active jobs");
        self.resources.clear();
        self.active_jobs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampede_proto::EvalResult;

    fn job_with_batches(id: &str, batches: usize, now: DateTime<Utc>) -> Job {
        let inputs = (0..batches).map(|i| format!("in-{i}")).collect();
        Job::new(
            id.to_string(),
            "model".to_string(),
            1,
            "dataset.txt".to_string(),
            inputs,
            now,
        )
    }

    fn scheduler_with_workers(count: u16, now: DateTime<Utc>) -> Scheduler {
        let mut scheduler = Scheduler::default();
        for port in 0..count {
            scheduler.on_worker_joined(&Process::new("w", 6000 + port), now);
        }
        scheduler
    }

    fn output(batch_id: u32) -> BatchOutput {
        BatchOutput {
            batch_id,
            results: vec![EvalResult {
                input: format!("in-{batch_id}"),
                output: "out".to_string(),
            }],
            metric: 1.0,
        }
    }

    #[test]
    fn equal_jobs_split_workers_evenly() {
        let now = Utc::now();
        let mut scheduler = scheduler_with_workers(4, now);
        scheduler.add_job(job_with_batches("job-a", 10, now));
        scheduler.add_job(job_with_batches("job-b", 10, now));

        let schedule = scheduler.refresh_schedule(now);
        let assigned: usize = schedule.iter().map(|(_, workers)| workers.len()).sum();
        assert_eq!(assigned, 4, "every worker is dispatched");

        for (_, workers) in &schedule {
            assert_eq!(workers.len(), 2);
        }

        // Simulate the coordinator's successful dispatch.
        for (job_id, workers) in &schedule {
            for address in workers {
                scheduler.resources.get_mut(address).expect("worker").job_id =
                    Some(job_id.clone());
            }
        }

        // A second pass with unchanged progress moves nothing.
        let again = scheduler.refresh_schedule(now);
        assert!(again.is_empty(), "stable schedule reassigns nothing: {again:?}");
    }

    #[test]
    fn preemption_takes_most_recent_workers_and_frees_batches() {
        let now = Utc::now();
        let mut scheduler = scheduler_with_workers(4, now);
        scheduler.add_job(job_with_batches("job-a", 10, now));

        // All four workers on job-a, each holding a batch; distinct
        // query times so the preemption order is observable.
        for (i, port) in (0..4u16).enumerate() {
            let address = format!("w:{}", 6000 + port);
            let job = scheduler.active_jobs.get_mut("job-a").expect("job");
            let batch = job.fetch_batch_input(now).expect("batch");
            let worker = scheduler.resources.get_mut(&address).expect("worker");
            worker.job_id = Some("job-a".to_string());
            worker.current_batch = Some(batch);
            worker.last_query_time = now + chrono::Duration::seconds(i as i64);
        }

        // Adding an equal job forces job-a down to two workers.
        scheduler.add_job(job_with_batches("job-b", 10, now));
        let schedule = scheduler.refresh_schedule(now);

        // The two most recently active workers (ports 6003, 6002) were
        // preempted and immediately became assignable to job-b.
        let job_b_workers: Vec<String> = schedule
            .iter()
            .find(|(id, _)| id == "job-b")
            .map(|(_, workers)| workers.clone())
            .unwrap_or_default();
        assert_eq!(job_b_workers, vec!["w:6002", "w:6003"]);

        // Their batches went back to Available.
        let job = scheduler.job("job-a").expect("job");
        let available = job
            .batches
            .iter()
            .filter(|state| state.status == BatchStatus::Available)
            .count();
        assert_eq!(available, 8, "two in-flight batches were released");
    }

    #[test]
    fn orphaned_in_progress_batches_are_demoted() {
        let now = Utc::now();
        let mut scheduler = scheduler_with_workers(2, now);
        scheduler.add_job(job_with_batches("job-a", 2, now));

        // Hand out a batch to a worker, then lose the worker.
        let batch = scheduler
            .active_jobs
            .get_mut("job-a")
            .expect("job")
            .fetch_batch_input(now)
            .expect("batch");
        let worker = scheduler.resources.get_mut("w:6000").expect("worker");
        worker.job_id = Some("job-a".to_string());
        worker.current_batch = Some(batch);

        scheduler.refresh_batch_status();
        assert_eq!(
            scheduler.job("job-a").expect("job").batches[0].status,
            BatchStatus::InProgress,
            "held batch stays in progress"
        );

        scheduler.on_worker_failed(&Process::new("w", 6000));
        scheduler.refresh_batch_status();
        assert_eq!(
            scheduler.job("job-a").expect("job").batches[0].status,
            BatchStatus::Available
        );
    }

    #[test]
    fn stale_workers_reset_to_idle() {
        let now = Utc::now();
        let mut scheduler = scheduler_with_workers(1, now);
        scheduler
            .resources
            .get_mut("w:6000")
            .expect("worker")
            .job_id = Some("long-gone".to_string());

        scheduler.refresh_worker_status(now);
        assert!(scheduler.resources.get("w:6000").expect("worker").is_idle());
    }

    #[test]
    fn terminal_job_enqueues_for_flush_once() {
        let now = Utc::now();
        let mut scheduler = scheduler_with_workers(1, now);
        scheduler.add_job(job_with_batches("job-a", 2, now));

        scheduler.on_receive_batch_output("job-a", "w:6000", output(0), now);
        assert!(scheduler.pending_jobs.is_empty());

        scheduler.on_receive_batch_output("job-a", "w:6000", output(1), now);
        assert_eq!(scheduler.pending_jobs.len(), 1);

        // A re-delivered output must not enqueue the job twice.
        scheduler.on_receive_batch_output("job-a", "w:6000", output(1), now);
        assert_eq!(scheduler.pending_jobs.len(), 1);

        let job = scheduler.job("job-a").expect("job");
        assert!(job.is_terminal());
        assert_eq!(job.completed_queries, 2);
    }

    #[test]
    fn self_leave_clears_pool_and_jobs() {
        let now = Utc::now();
        let mut scheduler = scheduler_with_workers(3, now);
        scheduler.add_job(job_with_batches("job-a", 2, now));

        scheduler.on_self_leave();
        assert!(scheduler.resources.is_empty());
        assert!(scheduler.active_jobs.is_empty());
    }
}
