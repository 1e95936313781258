use std::collections::HashMap;

use chrono::{DateTime, Utc};
use stampede_proto::{BatchInput, Process};

/// One machine in the serving pool.
#[derive(Clone, Debug)]
pub struct WorkerSlot {
    pub process: Process,
    pub job_id: Option<String>,
    pub current_batch: Option<BatchInput>,
    pub last_query_time: DateTime<Utc>,
}

impl WorkerSlot {
    pub fn is_idle(&self) -> bool {
        self.job_id.is_none()
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.job_id = None;
        self.current_batch = None;
        self.last_query_time = now;
    }
}

/// Address-keyed pool of workers known to the coordinator.
#[derive(Debug, Default)]
pub struct ResourceManager {
    workers: HashMap<String, WorkerSlot>,
}

impl ResourceManager {
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn get(&self, address: &str) -> Option<&WorkerSlot> {
        self.workers.get(address)
    }

    pub fn get_mut(&mut self, address: &str) -> Option<&mut WorkerSlot> {
        self.workers.get_mut(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.workers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkerSlot> {
        self.workers.values_mut()
    }

    pub fn add_worker(&mut self, process: Process, now: DateTime<Utc>) {
        self.workers.insert(
            process.address(),
            WorkerSlot {
                process,
                job_id: None,
                current_batch: None,
                last_query_time: now,
            },
        );
    }

    pub fn remove_worker(&mut self, address: &str) -> Option<WorkerSlot> {
        self.workers.remove(address)
    }

    pub fn clear(&mut self) {
        self.workers.clear();
    }

    /// Idle workers in deterministic (address) order, so repeated
    /// reallocation passes assign the same machines.
    pub fn idle_addresses(&self) -> Vec<String> {
        let mut idle: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.is_idle())
            .map(|(address, _)| address.clone())
            .collect();
        idle.sort();
        idle
    }

    pub fn addresses_for_job(&self, job_id: &str) -> Vec<String> {
        self.workers
            .iter()
            .filter(|(_, worker)| worker.job_id.as_deref() == Some(job_id))
            .map(|(address, _)| address.clone())
            .collect()
    }

    /// Workers of a job ordered most-recent-query first; the preemption
    /// pass trims the excess from the front of this list.
    pub fn addresses_for_job_recent_first(&self, job_id: &str) -> Vec<String> {
        let mut addresses: Vec<(DateTime<Utc>, String)> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.job_id.as_deref() == Some(job_id))
            .map(|(address, worker)| (worker.last_query_time, address.clone()))
            .collect();
        addresses.sort_by(|a, b| b.cmp(a));
        addresses.into_iter().map(|(_, address)| address).collect()
    }

    pub fn count_for_job(&self, job_id: &str) -> usize {
        self.workers
            .values()
            .filter(|worker| worker.job_id.as_deref() == Some(job_id))
            .count()
    }
}
