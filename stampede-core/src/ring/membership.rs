use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use stampede_proto::{Process, ProcessStatus};

/// What happened to a member, as reported to observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberUpdate {
    Insert,
    Delete,
    Leaved,
}

/// Membership list plus the expiration pool.
///
/// Invariant: a process has an expiration entry iff its status is not
/// `Alive`. Members are kept sorted by join time, so index 0 is always
/// the leader candidate.
#[derive(Debug)]
pub struct MembershipState {
    pub self_process: Process,
    members: Vec<Process>,
    expirations: HashMap<String, DateTime<Utc>>,
}

impl MembershipState {
    pub fn new(self_process: Process) -> Self {
        Self {
            self_process,
            members: Vec::new(),
            expirations: HashMap::new(),
        }
    }

    pub fn members(&self) -> &[Process] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn expirations_empty(&self) -> bool {
        self.expirations.is_empty()
    }

    pub fn find_index(&self, process: &Process) -> Option<usize> {
        self.members
            .iter()
            .position(|member| member.same_identity(process))
    }

    pub fn contains_self(&self) -> bool {
        self.members
            .iter()
            .any(|member| member.same_identity(&self.self_process))
    }

    /// Insert keeping the join-time order.
    pub fn insert(&mut self, process: Process) {
        let at = self
            .members
            .partition_point(|member| member.join_time <= process.join_time);
        self.members.insert(at, process);
    }

    pub fn leader(&self) -> Option<&Process> {
        self.members.first()
    }

    pub fn is_self_leader(&self) -> bool {
        self.leader()
            .is_some_and(|leader| leader.same_identity(&self.self_process))
    }

    /// Refresh our own heartbeat, both the canonical copy and the list
    /// entry disseminated through pings.
    pub fn refresh_self(&mut self, now: DateTime<Utc>) {
        self.self_process.last_update_time = now;
        let identity = self.self_process.clone();
        if let Some(index) = self.find_index(&identity) {
            self.members[index].last_update_time = now;
        }
    }

    /// Up to `max` members clockwise of self in join-time order,
    /// excluding self; fewer when the ring is small.
    pub fn successors(&self, max: usize) -> Vec<Process> {
        let Some(index) = self
            .members
            .iter()
            .position(|member| member.same_identity(&self.self_process))
        else {
            return Vec::new();
        };

        let mut successors = Vec::new();
        for i in 0..max.min(self.members.len()) {
            let candidate = &self.members[(index + i + 1) % self.members.len()];
            if candidate.same_identity(&self.self_process) {
                break;
            }
            successors.push(candidate.clone());
        }
        successors
    }

    /// Remove every member whose expiration deadline has passed.
    /// Returns the removed processes so the caller can notify observers.
    pub fn remove_expired(&mut self, now: DateTime<Utc>) -> Vec<Process> {
        let expired: Vec<String> = self
            .expirations
            .iter()
            .filter(|(_, deadline)| now > **deadline)
            .map(|(address, _)| address.clone())
            .collect();

        let mut removed = Vec::new();
        for address in expired {
            self.expirations.remove(&address);
            if let Some(index) = self
                .members
                .iter()
                .position(|member| member.address() == address)
            {
                removed.push(self.members.remove(index));
            }
        }
        removed
    }

    /// Merge a remote membership list received in a ping.
    ///
    /// Unknown `Alive` processes are inserted (and returned for
    /// notification). Known processes only accept strictly newer
    /// heartbeats; accepting one copies the remote status and
    /// arms/disarms the expiration entry to keep the pool invariant.
    pub fn merge_remote(
        &mut self,
        remote: &[Process],
        now: DateTime<Utc>,
        expiration: Duration,
    ) -> Vec<Process> {
        let mut inserted = Vec::new();

        for process in remote {
            if process.same_identity(&self.self_process) {
                continue;
            }

            match self.find_index(process) {
                None => {
                    if process.status != ProcessStatus::Alive {
                        continue;
                    }
                    self.insert(process.clone());
                    inserted.push(process.clone());
                }
                Some(index) => {
                    let current = &mut self.members[index];
                    if process.last_update_time <= current.last_update_time {
                        continue;
                    }
                    current.last_update_time = process.last_update_time;
                    current.status = process.status;

                    let address = current.address();
                    if current.status == ProcessStatus::Alive {
                        self.expirations.remove(&address);
                    } else {
                        self.expirations
                            .entry(address)
                            .or_insert_with(|| now + to_chrono(expiration));
                    }
                }
            }
        }

        inserted
    }

    /// Suspect a member after a failed ping: mark `Timeout`, refresh its
    /// heartbeat so the suspicion disseminates, and arm its expiration.
    pub fn mark_failure(
        &mut self,
        process: &Process,
        now: DateTime<Utc>,
        expiration: Duration,
    ) -> bool {
        let Some(index) = self.find_index(process) else {
            return false;
        };
        let member = &mut self.members[index];
        member.status = ProcessStatus::Timeout;
        member.last_update_time = now;

        let address = member.address();
        self.expirations
            .entry(address)
            .or_insert_with(|| now + to_chrono(expiration));
        true
    }

    /// A peer announced it is leaving: mark it and let the expiration
    /// pool remove it on schedule.
    pub fn mark_peer_leave(
        &mut self,
        process: &Process,
        now: DateTime<Utc>,
        expiration: Duration,
    ) -> bool {
        let Some(index) = self.find_index(process) else {
            return false;
        };
        self.members[index].status = ProcessStatus::Leaved;
        self.expirations
            .insert(self.members[index].address(), now + to_chrono(expiration));
        true
    }

    /// A ping we sent was acked: refresh the target's heartbeat.
    pub fn on_ack(&mut self, process: &Process, now: DateTime<Utc>) {
        if let Some(index) = self.find_index(process) {
            self.members[index].last_update_time = now;
        }
    }

    /// Voluntary self-leave: wipe the list; observers get a `Leaved`.
    pub fn clear_for_leave(&mut self) {
        self.self_process.status = ProcessStatus::Leaved;
        self.members.clear();
        self.expirations.clear();
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(6))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn process(port: u16, join_offset_secs: i64, now: DateTime<Utc>) -> Process {
        let mut process = Process::new("127.0.0.1", port);
        process.join_time = now + ChronoDuration::seconds(join_offset_secs);
        process.last_update_time = process.join_time;
        process
    }

    fn state_with(ports_and_offsets: &[(u16, i64)], now: DateTime<Utc>) -> MembershipState {
        let mut state = MembershipState::new(process(ports_and_offsets[0].0, ports_and_offsets[0].1, now));
        for &(port, offset) in ports_and_offsets {
            state.insert(process(port, offset, now));
        }
        state
    }

    #[test]
    fn leader_is_earliest_join_time() {
        let now = Utc::now();
        let state = state_with(&[(5002, 2), (5000, 0), (5001, 1)], now);
        assert_eq!(state.leader().expect("leader").port, 5000);
        assert!(!state.is_self_leader(), "self joined at offset 2");
    }

    #[test]
    fn successors_wrap_and_exclude_self() {
        let now = Utc::now();
        let state = state_with(&[(5001, 1), (5000, 0), (5002, 2), (5003, 3)], now);
        // self is 5001; clockwise by join time: 5002, 5003, wrap to 5000.
        let successors: Vec<u16> = state.successors(6).iter().map(|p| p.port).collect();
        assert_eq!(successors, vec![5002, 5003, 5000]);

        let capped: Vec<u16> = state.successors(2).iter().map(|p| p.port).collect();
        assert_eq!(capped, vec![5002, 5003]);
    }

    #[test]
    fn merge_inserts_unknown_alive_only() {
        let now = Utc::now();
        let mut state = state_with(&[(5000, 0)], now);

        let newcomer = process(5001, 1, now);
        let mut dead = process(5002, 2, now);
        dead.status = ProcessStatus::Timeout;

        let inserted = state.merge_remote(
            &[newcomer.clone(), dead],
            now,
            std::time::Duration::from_secs(6),
        );
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].port, 5001);
        assert_eq!(state.len(), 2, "dead unknown process is skipped");
    }

    #[test]
    fn merge_accepts_only_newer_heartbeats() {
        let now = Utc::now();
        let mut state = state_with(&[(5000, 0), (5001, 1)], now);

        // Stale copy: ignored.
        let mut stale = process(5001, 1, now);
        stale.status = ProcessStatus::Timeout;
        stale.last_update_time = now - ChronoDuration::seconds(10);
        state.merge_remote(&[stale], now, std::time::Duration::from_secs(6));
        let index = state
            .members()
            .iter()
            .position(|p| p.port == 5001)
            .expect("member");
        assert_eq!(state.members()[index].status, ProcessStatus::Alive);
        assert!(state.expirations_empty());

        // Newer suspicion: accepted and expiration armed.
        let mut fresh = process(5001, 1, now);
        fresh.status = ProcessStatus::Timeout;
        fresh.last_update_time = now + ChronoDuration::seconds(10);
        state.merge_remote(&[fresh], now, std::time::Duration::from_secs(6));
        assert_eq!(state.members()[index].status, ProcessStatus::Timeout);
        assert!(!state.expirations_empty());

        // Even newer recovery: status restored, expiration disarmed.
        let mut recovered = process(5001, 1, now);
        recovered.status = ProcessStatus::Alive;
        recovered.last_update_time = now + ChronoDuration::seconds(20);
        state.merge_remote(&[recovered], now, std::time::Duration::from_secs(6));
        assert_eq!(state.members()[index].status, ProcessStatus::Alive);
        assert!(state.expirations_empty());
    }

    #[test]
    fn failure_then_expiry_removes_member() {
        let now = Utc::now();
        let mut state = state_with(&[(5000, 0), (5001, 1)], now);
        let target = state.members()[1].clone();

        assert!(state.mark_failure(&target, now, std::time::Duration::from_secs(6)));
        assert_eq!(state.members()[1].status, ProcessStatus::Timeout);

        // Not yet expired.
        assert!(state.remove_expired(now + ChronoDuration::seconds(5)).is_empty());
        // Past the deadline.
        let removed = state.remove_expired(now + ChronoDuration::seconds(7));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].port, 5001);
        assert_eq!(state.len(), 1);
        assert!(state.expirations_empty());
    }

    #[test]
    fn mark_failure_is_idempotent_on_deadline() {
        let now = Utc::now();
        let mut state = state_with(&[(5000, 0), (5001, 1)], now);
        let target = state.members()[1].clone();

        state.mark_failure(&target, now, std::time::Duration::from_secs(6));
        // A second suspicion later must not extend the deadline.
        state.mark_failure(&target, now + ChronoDuration::seconds(3), std::time::Duration::from_secs(6));
        let removed = state.remove_expired(now + ChronoDuration::seconds(7));
        assert_eq!(removed.len(), 1);
    }
}
