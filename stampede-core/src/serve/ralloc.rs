//! Fair-time resource allocation.
//!
//! Two strategies: a global dynamic program that minimises the maximum
//! pair-wise gap in projected queries-per-second, and a local
//! proportional split driven by per-job batch service time.

use chrono::{DateTime, Utc};
use stampede_proto::Job;

const EPSILON: f64 = 1e-6;

/// Build the `n x (m+1)` expected-QPS matrix the global allocator
/// consumes: `qps[i][k]` is job `i`'s projected rate on `k` workers.
pub fn jobs_to_qps(jobs: &[&Job], total_resources: usize, now: DateTime<Utc>) -> Vec<Vec<f64>> {
    jobs.iter()
        .map(|job| {
            (0..=total_resources)
                .map(|k| job.expected_qps(k, now))
                .collect()
        })
        .collect()
}

/// Allocate `m` workers among `n` jobs, minimising the maximum absolute
/// pair-wise difference of projected QPS.
///
/// `dp[i][j]` is the best achievable gap for the first `i + 1` jobs with
/// `j` workers; `min_q`/`max_q` track the extreme per-job rates under
/// that optimum so the transition can price giving `k` workers to job
/// `i` in O(1). Total cost O(n·m²).
///
/// Returns the allocation (summing exactly to `m`) and the relative QPS
/// difference achieved by it.
pub fn global_fair_ralloc(n: usize, m: usize, qps: &[Vec<f64>]) -> (Vec<usize>, f64) {
    assert_eq!(qps.len(), n, "qps matrix must have one row per job");
    assert!(
        qps.iter().all(|row| row.len() == m + 1),
        "qps rows must cover 0..=m resources"
    );

    if n == 0 {
        return (Vec::new(), 0.0);
    }

    let mut dp = vec![vec![0.0f64; m + 1]; n];
    let mut min_q = vec![vec![0.0f64; m + 1]; n];
    let mut max_q = vec![vec![0.0f64; m + 1]; n];
    let mut alloc = vec![vec![0usize; m + 1]; n];

    for j in 0..=m {
        dp[0][j] = 0.0;
        min_q[0][j] = qps[0][j];
        max_q[0][j] = qps[0][j];
        alloc[0][j] = j;
    }

    for i in 1..n {
        for j in 0..=m {
            dp[i][j] = f64::MAX;
            let mut resource = 0;

            for k in 0..=j {
                let candidate = (qps[i][k] - min_q[i - 1][j - k])
                    .abs()
                    .max((qps[i][k] - max_q[i - 1][j - k]).abs())
                    .max(dp[i - 1][j - k]);
                if candidate < dp[i][j] {
                    dp[i][j] = candidate;
                    resource = k;
                }
            }

            alloc[i][j] = resource;
            min_q[i][j] = qps[i][resource].min(min_q[i - 1][j - resource]);
            max_q[i][j] = qps[i][resource].max(max_q[i - 1][j - resource]);
        }
    }

    let mut resources = vec![0usize; n];
    let mut remaining = m;
    for i in (0..n).rev() {
        resources[i] = alloc[i][remaining];
        remaining -= resources[i];
    }

    let achieved: Vec<f64> = (0..n).map(|i| qps[i][resources[i]]).collect();
    (resources, rel_qps_diff(&achieved))
}

/// Allocate proportionally to each job's local processing time (seconds
/// per batch averaged over completed batches, clamped). Slower jobs get
/// more workers. The cumulative sum is clamped to `m`; rounding may
/// leave a worker unassigned, which the next pass redistributes.
pub fn local_fair_ralloc(jobs: &[&Job], total_resources: usize) -> (Vec<usize>, f64) {
    let times: Vec<f64> = jobs.iter().map(|job| job.query_processing_time()).collect();
    let total_time: f64 = times.iter().sum();

    let mut alloc = vec![0usize; jobs.len()];
    if total_time <= 0.0 {
        return (alloc, 0.0);
    }

    let mut remaining = total_resources;
    for (i, time) in times.iter().enumerate() {
        let raw = total_resources as f64 * time / total_time;
        let share = (raw.round() as usize).min(remaining);
        alloc[i] = share;
        remaining -= share;
    }

    (alloc, rel_qps_diff(&times))
}

/// Maximum relative pair-wise difference, the allocator's objective.
pub fn rel_qps_diff(qps: &[f64]) -> f64 {
    if qps.len() <= 1 {
        return 0.0;
    }

    let mut max_err = 0.0f64;
    for i in 0..qps.len() {
        for j in i + 1..qps.len() {
            let diff = (qps[i] - qps[j]).abs();
            let err = diff / (qps[i].max(qps[j]) + EPSILON);
            max_err = max_err.max(err);
        }
    }
    max_err
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    /// A job that has run for `elapsed_secs` and completed `completed`
    /// of `total` batches, evaluated at a fixed "now".
    fn job(total: u64, completed: u64, elapsed_secs: i64, now: DateTime<Utc>) -> Job {
        Job {
            id: format!("job-{total}-{completed}-{elapsed_secs}"),
            model: "model".to_string(),
            batch_size: 1,
            dataset: "dataset".to_string(),
            start_time: now - Duration::seconds(elapsed_secs),
            finish_time: None,
            total_queries: total,
            completed_queries: completed,
            batches: Vec::new(),
            query_rates: Vec::new(),
            query_process_times: Vec::new(),
        }
    }

    #[test]
    fn one_job_takes_every_worker() {
        let now = Utc::now();
        let only = job(100, 0, 0, now);
        let qps = jobs_to_qps(&[&only], 10, now);
        let (alloc, diff) = global_fair_ralloc(1, 10, &qps);
        assert_eq!(alloc, vec![10]);
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn two_equal_jobs_split_by_elapsed_time() {
        let now = Utc::now();
        let first = job(10_000, 2, 1, now);
        let second = job(10_000, 2, 2, now);
        let jobs = [&first, &second];

        let qps = jobs_to_qps(&jobs, 9, now);
        let (alloc, diff) = global_fair_ralloc(2, 9, &qps);
        assert_eq!(alloc, vec![3, 6]);
        assert!(diff <= 0.1, "diff {diff} should be within 10%");

        let qps = jobs_to_qps(&jobs, 12, now);
        let (alloc, diff) = global_fair_ralloc(2, 12, &qps);
        assert_eq!(alloc, vec![4, 8]);
        assert!(diff <= 0.1);

        let qps = jobs_to_qps(&jobs, 120, now);
        let (alloc, diff) = global_fair_ralloc(2, 120, &qps);
        assert_eq!(alloc, vec![40, 80]);
        assert!(diff <= 0.1);
    }

    #[test]
    fn unbalanced_progress_starves_the_near_finished_job() {
        let now = Utc::now();
        let nearly_done = job(10_000, 9_000, 9_000, now);
        let just_started = job(10_000, 1, 1, now);

        let qps = jobs_to_qps(&[&nearly_done, &just_started], 100, now);
        let (alloc, diff) = global_fair_ralloc(2, 100, &qps);
        assert_eq!(alloc, vec![99, 1]);
        assert!(diff <= 0.1);

        let halfway = job(10_000, 4_000, 1_000, now);
        let fresh = job(10_000, 1, 1, now);
        let qps = jobs_to_qps(&[&halfway, &fresh], 100, now);
        let (alloc, diff) = global_fair_ralloc(2, 100, &qps);
        assert_eq!(alloc, vec![90, 10]);
        assert!(diff <= 0.1);
    }

    #[test]
    fn three_jobs_ramp_with_elapsed_time() {
        let now = Utc::now();
        let a = job(10_000, 6, 2, now);
        let b = job(10_000, 6, 3, now);
        let c = job(10_000, 6, 6, now);

        let qps = jobs_to_qps(&[&a, &b, &c], 120, now);
        let (alloc, diff) = global_fair_ralloc(3, 120, &qps);
        assert!(diff <= 0.1);
        assert!((alloc[0] as i64 - 20).abs() <= 10, "alloc {alloc:?}");
        assert!((alloc[1] as i64 - 40).abs() <= 10, "alloc {alloc:?}");
        assert!((alloc[2] as i64 - 60).abs() <= 10, "alloc {alloc:?}");
    }

    #[test]
    fn global_allocation_always_sums_to_resources() {
        let now = Utc::now();
        let a = job(500, 17, 60, now);
        let b = job(9_000, 3, 4, now);
        let c = job(42, 0, 0, now);

        for m in [1usize, 5, 16, 33] {
            let qps = jobs_to_qps(&[&a, &b, &c], m, now);
            let (alloc, _) = global_fair_ralloc(3, m, &qps);
            assert_eq!(alloc.iter().sum::<usize>(), m, "m = {m}");
        }
    }

    #[test]
    fn local_split_is_proportional_and_clamped() {
        let now = Utc::now();
        // No completions: both default to 1 s per query, equal split.
        let a = job(100, 0, 10, now);
        let b = job(100, 0, 10, now);
        let (alloc, _) = local_fair_ralloc(&[&a, &b], 4);
        assert_eq!(alloc, vec![2, 2]);

        // Cumulative clamp: shares never exceed the pool.
        let c = job(100, 0, 10, now);
        let (alloc, _) = local_fair_ralloc(&[&a, &b, &c], 2);
        assert!(alloc.iter().sum::<usize>() <= 2);
    }

    #[test]
    fn rel_diff_bounds() {
        assert_eq!(rel_qps_diff(&[]), 0.0);
        assert_eq!(rel_qps_diff(&[5.0]), 0.0);
        assert!(rel_qps_diff(&[1.0, 1.0]) < 1e-6);
        let spread = rel_qps_diff(&[1.0, 2.0]);
        assert!((spread - 0.5).abs() < 1e-3);
    }
}
