//! Operator-facing status rendering: text tables for the CLI and JSON
//! for the HTTP façade.

use chrono::{DateTime, Utc};
use stampede_proto::Job;
use stampede_proto::job::QPS_WINDOW_SECS;
use tabled::builder::Builder;
use tabled::settings::Style;

use crate::serve::ralloc::rel_qps_diff;
use crate::serve::scheduler::{FairnessMode, Scheduler};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn finish_table(builder: Builder) -> String {
    let mut table = builder.build();
    table.with(Style::sharp());
    table.to_string()
}

/// QPS figure shown for a job: the projection that drives global fair
/// time, or the windowed measurement in local mode.
fn job_qps(job: &Job, workers: usize, mode: FairnessMode, now: DateTime<Utc>) -> f64 {
    match mode {
        FairnessMode::Global => job.expected_qps(workers, now),
        FairnessMode::Local => job.qps(QPS_WINDOW_SECS, now),
    }
}

pub fn workers_table(scheduler: &Scheduler) -> String {
    let mut builder = Builder::default();
    builder.push_record(["Worker", "Join Time", "Running Job", "Idle", "Last Query"]);

    let mut workers: Vec<_> = scheduler.resources.iter().collect();
    workers.sort_by_key(|worker| worker.process.join_time);

    for worker in &workers {
        builder.push_record([
            worker.process.address(),
            worker.process.join_time.format(TIME_FORMAT).to_string(),
            worker.job_id.clone().unwrap_or_default(),
            worker.is_idle().to_string(),
            worker.last_query_time.format(TIME_FORMAT).to_string(),
        ]);
    }
    builder.push_record([
        "Total Workers".to_string(),
        workers.len().to_string(),
        String::new(),
        String::new(),
        String::new(),
    ]);

    finish_table(builder)
}

pub fn workers_json(scheduler: &Scheduler) -> String {
    let workers: Vec<serde_json::Value> = scheduler
        .resources
        .iter()
        .map(|worker| {
            serde_json::json!({
                "address": worker.process.address(),
                "joinTime": worker.process.join_time.format(TIME_FORMAT).to_string(),
                "runningJob": worker.job_id.clone().unwrap_or_default(),
                "lastQueryTime": worker.last_query_time.format(TIME_FORMAT).to_string(),
            })
        })
        .collect();
    serde_json::to_string(&workers).unwrap_or_default()
}

fn job_row(job: &Job, scheduler: &Scheduler, now: DateTime<Utc>) -> (Vec<String>, f64) {
    let workers = scheduler.resources.count_for_job(&job.id);
    let qps = job_qps(job, workers, scheduler.fairness, now);
    let mut time_left = job.expected_time_left(workers, now);
    if time_left == f64::MAX {
        time_left = 99_999.0;
    }

    let progress = if job.total_queries == 0 {
        100.0
    } else {
        job.completed_queries as f64 / job.total_queries as f64 * 100.0
    };

    let row = vec![
        job.id.clone(),
        job.model.clone(),
        job.batch_size.to_string(),
        job.total_queries.to_string(),
        job.completed_queries.to_string(),
        format!("{:.2} sec", job.total_query_time(now).num_milliseconds() as f64 / 1_000.0),
        workers.to_string(),
        format!("{progress:.2}%"),
        format!("{qps:.2}"),
        format!("{time_left:.2} sec"),
    ];
    (row, qps)
}

pub fn jobs_table(scheduler: &Scheduler, now: DateTime<Utc>) -> String {
    let mut builder = Builder::default();
    builder.push_record([
        "Job ID",
        "Model",
        "Batch Size",
        "Total",
        "Completed",
        "Query Time",
        "VMs",
        "Progress",
        "Query/Sec",
        "Time Left",
    ]);

    let mut ids: Vec<&String> = scheduler.active_jobs.keys().collect();
    ids.sort();

    let mut rates = Vec::new();
    for id in &ids {
        let (row, qps) = job_row(&scheduler.active_jobs[*id], scheduler, now);
        rates.push(qps);
        builder.push_record(row);
    }

    builder.push_record([
        "Running Jobs".to_string(),
        ids.len().to_string(),
        format!("Rel QPS Diff {:.2}%", rel_qps_diff(&rates) * 100.0),
        String::new(),
        String::new(),
        String::new(),
        String::new(),
        String::new(),
        String::new(),
        String::new(),
    ]);

    finish_table(builder)
}

pub fn jobs_json(scheduler: &Scheduler, now: DateTime<Utc>) -> String {
    let mut ids: Vec<&String> = scheduler.active_jobs.keys().collect();
    ids.sort();

    let mut rates = Vec::new();
    let jobs: Vec<serde_json::Value> = ids
        .iter()
        .map(|id| {
            let job = &scheduler.active_jobs[*id];
            let workers = scheduler.resources.count_for_job(&job.id);
            let qps = job_qps(job, workers, scheduler.fairness, now);
            rates.push(qps);
            let mut time_left = job.expected_time_left(workers, now);
            if time_left == f64::MAX {
                time_left = 99_999.0;
            }
            serde_json::json!({
                "id": job.id,
                "modelType": job.model,
                "batchSize": job.batch_size,
                "totalQueries": job.total_queries,
                "completedQueries": job.completed_queries,
                "totalQueryTime": job.total_query_time(now).num_milliseconds() as f64 / 1_000.0,
                "runningVMs": workers,
                "progress": if job.total_queries == 0 { 100.0 } else {
                    job.completed_queries as f64 / job.total_queries as f64 * 100.0
                },
                "qps": qps,
                "timeLeft": time_left,
            })
        })
        .collect();

    serde_json::to_string(&serde_json::json!({
        "jobs": jobs,
        "relativeQPSDifference": rel_qps_diff(&rates) * 100.0,
    }))
    .unwrap_or_default()
}

pub fn completed_jobs_table(scheduler: &Scheduler, now: DateTime<Utc>) -> String {
    let mut builder = Builder::default();
    builder.push_record([
        "Job ID",
        "Model",
        "Batch Size",
        "Total",
        "Query Time",
        "Query/Sec",
    ]);

    let mut ids: Vec<&String> = scheduler.completed_jobs.keys().collect();
    ids.sort();

    for id in ids {
        let job = &scheduler.completed_jobs[id];
        let elapsed = job.total_query_time(now).num_milliseconds() as f64 / 1_000.0;
        let qps = if elapsed > 0.0 {
            job.total_queries as f64 / elapsed
        } else {
            0.0
        };
        builder.push_record([
            job.id.clone(),
            job.model.clone(),
            job.batch_size.to_string(),
            job.total_queries.to_string(),
            format!("{elapsed:.2} sec"),
            format!("{qps:.2}"),
        ]);
    }

    finish_table(builder)
}

pub fn completed_jobs_json(scheduler: &Scheduler, now: DateTime<Utc>) -> String {
    let jobs: Vec<serde_json::Value> = scheduler
        .completed_jobs
        .values()
        .map(|job| {
            let elapsed = job.total_query_time(now).num_milliseconds() as f64 / 1_000.0;
            serde_json::json!({
                "id": job.id,
                "modelType": job.model,
                "batchSize": job.batch_size,
                "totalQueries": job.total_queries,
                "totalQueryTime": elapsed,
                "qps": if elapsed > 0.0 { job.total_queries as f64 / elapsed } else { 0.0 },
            })
        })
        .collect();
    serde_json::to_string(&jobs).unwrap_or_default()
}

fn find_job<'a>(scheduler: &'a Scheduler, job_id: &str) -> Option<&'a Job> {
    scheduler
        .active_jobs
        .get(job_id)
        .or_else(|| scheduler.completed_jobs.get(job_id))
}

pub fn job_detail_table(scheduler: &Scheduler, job_id: &str) -> String {
    let Some(job) = find_job(scheduler, job_id) else {
        return format!("job {job_id} not found\n");
    };

    let mut builder = Builder::default();
    builder.push_record(["Input", "Output"]);

    let (results, metric) = job.results();
    for result in &results {
        builder.push_record([truncate(&result.input, 100), truncate(&result.output, 100)]);
    }
    builder.push_record(["Metric".to_string(), format!("{:.2}%", metric * 100.0)]);

    finish_table(builder)
}

pub fn job_detail_json(scheduler: &Scheduler, job_id: &str) -> String {
    let Some(job) = find_job(scheduler, job_id) else {
        return String::new();
    };

    let (results, metric) = job.results();
    let batches: Vec<serde_json::Value> = results
        .iter()
        .map(|result| {
            serde_json::json!({
                "batchInput": result.input,
                "batchOutput": result.output,
            })
        })
        .collect();

    serde_json::to_string(&serde_json::json!({
        "id": job.id,
        "metric": metric,
        "batches": batches,
        "queryRates": job.query_rates,
        "queryProcessTimes": job.query_process_times,
    }))
    .unwrap_or_default()
}

pub fn job_stats_table(scheduler: &Scheduler, job_id: &str) -> String {
    let Some(job) = find_job(scheduler, job_id) else {
        return format!("job {job_id} not found\n");
    };

    let rates: Vec<f64> = job.query_rates.iter().map(|r| *r as f64).collect();
    let times: Vec<f64> = job.query_process_times.iter().map(|t| *t as f64).collect();

    let mut builder = Builder::default();
    builder.push_record(["Stat", "Query Rate", "Query Processing Time"]);
    for (label, value) in [
        ("Mean", (mean(&rates), mean(&times))),
        ("Median", (percentile(&rates, 50.0), percentile(&times, 50.0))),
        ("Std Dev", (std_dev(&rates), std_dev(&times))),
        ("p90", (percentile(&rates, 90.0), percentile(&times, 90.0))),
        ("p95", (percentile(&rates, 95.0), percentile(&times, 95.0))),
        ("p99", (percentile(&rates, 99.0), percentile(&times, 99.0))),
    ] {
        builder.push_record([
            label.to_string(),
            format!("{:.2}", value.0),
            format!("{:.2}", value.1),
        ]);
    }

    finish_table(builder)
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    }
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

fn std_dev(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let avg = mean(samples);
    let variance =
        samples.iter().map(|s| (s - avg) * (s - avg)).sum::<f64>() / samples.len() as f64;
    variance.sqrt()
}

fn percentile(samples: &[f64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let index = ((sorted.len() as f64 * p / 100.0) as usize).min(sorted.len() - 1);
    sorted[index]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_helpers() {
        let samples = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((mean(&samples) - 3.0).abs() < 1e-9);
        assert!((percentile(&samples, 50.0) - 3.0).abs() < 1e-9);
        assert!((percentile(&samples, 99.0) - 5.0).abs() < 1e-9);
        assert!(std_dev(&samples) > 0.0);
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn missing_job_renders_placeholder() {
        let scheduler = Scheduler::default();
        assert!(job_detail_table(&scheduler, "nope").contains("not found"));
        assert!(job_detail_json(&scheduler, "nope").is_empty());
    }

    #[test]
    fn truncation_appends_ellipsis() {
        assert_eq!(truncate("short", 100), "short");
        let long = "x".repeat(150);
        let cut = truncate(&long, 100);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), 103);
    }
}
