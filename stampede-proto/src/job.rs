use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cap applied to a single batch's observed service time when averaging
/// local processing time, so one straggler cannot dominate the share
/// computation.
pub const QUERY_TIME_LIMIT_SECS: f64 = 6.0;

/// Window used by the sampled query-rate measurement.
pub const QPS_WINDOW_SECS: f64 = 10.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Available,
    InProgress,
    Completed,
}

/// One schedulable slice of a job's inputs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchInput {
    pub batch_id: u32,
    pub inputs: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvalResult {
    pub input: String,
    pub output: String,
}

/// Result of evaluating one batch on a worker's model runner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchOutput {
    pub batch_id: u32,
    pub results: Vec<EvalResult>,
    pub metric: f32,
}

/// State machine entry for one batch. `Completed` implies `output` is
/// set; `InProgress` implies exactly one worker currently holds this
/// batch id as its current input.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchState {
    pub status: BatchStatus,
    pub input: BatchInput,
    pub output: Option<BatchOutput>,
    pub query_time: Option<DateTime<Utc>>,
    pub receive_time: Option<DateTime<Utc>>,
}

impl BatchState {
    pub fn available(input: BatchInput) -> Self {
        Self {
            status: BatchStatus::Available,
            input,
            output: None,
            query_time: None,
            receive_time: None,
        }
    }
}

/// An admitted inference job and everything the scheduler knows about it.
///
/// `total_queries` counts batches, not raw inputs; a job is terminal when
/// `completed_queries == total_queries`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub model: String,
    pub batch_size: usize,
    pub dataset: String,
    pub start_time: DateTime<Utc>,
    pub finish_time: Option<DateTime<Utc>>,
    pub total_queries: u64,
    pub completed_queries: u64,
    pub batches: Vec<BatchState>,
    pub query_rates: Vec<f32>,
    pub query_process_times: Vec<f32>,
}

impl Job {
    /// Partition `inputs` into `ceil(n / batch_size)` available batches.
    pub fn new(
        id: String,
        model: String,
        batch_size: usize,
        dataset: String,
        inputs: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let batch_size = batch_size.max(1);
        let batches: Vec<BatchState> = inputs
            .chunks(batch_size)
            .enumerate()
            .map(|(i, chunk)| {
                BatchState::available(BatchInput {
                    batch_id: i as u32,
                    inputs: chunk.to_vec(),
                })
            })
            .collect();

        Self {
            id,
            model,
            batch_size,
            dataset,
            start_time: now,
            finish_time: None,
            total_queries: batches.len() as u64,
            completed_queries: 0,
            batches,
            query_rates: Vec::new(),
            query_process_times: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.completed_queries >= self.total_queries
    }

    /// Wall time the job has been running (or ran, once finished).
    pub fn total_query_time(&self, now: DateTime<Utc>) -> chrono::Duration {
        match self.finish_time {
            Some(finish) => finish - self.start_time,
            None => now - self.start_time,
        }
    }

    /// Running global average of seconds per completed batch; defaults to
    /// 1 before any batch completes.
    pub fn second_per_query(&self, now: DateTime<Utc>) -> f64 {
        if self.completed_queries == 0 {
            return 1.0;
        }
        duration_secs(self.total_query_time(now)) / self.completed_queries as f64
    }

    /// Mean single-batch service latency over completed batches, each
    /// sample clamped at [`QUERY_TIME_LIMIT_SECS`]. Defaults to 1 before
    /// any batch completes.
    pub fn query_processing_time(&self) -> f64 {
        let mut total = 0.0;
        let mut completed = 0u64;
        for state in &self.batches {
            if state.status != BatchStatus::Completed {
                continue;
            }
            if let (Some(query), Some(receive)) = (state.query_time, state.receive_time) {
                total += duration_secs(receive - query).min(QUERY_TIME_LIMIT_SECS);
                completed += 1;
            }
        }
        if completed == 0 {
            return 1.0;
        }
        total / completed as f64
    }

    /// Projected queries-per-second if this job ran on `resource` workers
    /// until completion.
    pub fn expected_qps(&self, resource: usize, now: DateTime<Utc>) -> f64 {
        if resource == 0 {
            return 0.0;
        }
        let remaining = (self.total_queries - self.completed_queries) as f64;
        let projected = duration_secs(self.total_query_time(now))
            + remaining * self.second_per_query(now) / resource as f64;
        self.total_queries as f64 / projected
    }

    /// Achieved query rate over the trailing `last_seconds` window
    /// (clamped to the job's elapsed time).
    pub fn qps(&self, last_seconds: f64, now: DateTime<Utc>) -> f64 {
        if last_seconds <= 0.0 {
            return 0.0;
        }
        let elapsed = duration_secs(now - self.start_time);
        let window = last_seconds.min(elapsed).max(f64::MIN_POSITIVE);

        let in_window = self
            .batches
            .iter()
            .filter_map(|state| state.query_time)
            .filter(|query| duration_secs(now - *query) <= window)
            .count();

        in_window as f64 / window
    }

    pub fn expected_time_left(&self, resource: usize, now: DateTime<Utc>) -> f64 {
        if resource == 0 {
            return f64::MAX;
        }
        let remaining = (self.total_queries - self.completed_queries) as f64;
        let rate = self.qps(QPS_WINDOW_SECS, now);
        if rate <= 0.0 {
            return f64::MAX;
        }
        remaining / rate
    }

    /// Append one sample of each tracked statistic.
    pub fn measure_stats(&mut self, now: DateTime<Utc>) {
        self.query_rates.push(self.qps(QPS_WINDOW_SECS, now) as f32);
        self.query_process_times
            .push(self.query_processing_time() as f32);
    }

    /// Hand out the next available batch, marking it in progress and
    /// stamping its query time. Returns `None` when nothing is available.
    pub fn fetch_batch_input(&mut self, now: DateTime<Utc>) -> Option<BatchInput> {
        for state in &mut self.batches {
            if state.status == BatchStatus::Available {
                state.status = BatchStatus::InProgress;
                state.query_time = Some(now);
                return Some(state.input.clone());
            }
        }
        None
    }

    pub fn completed_batch_count(&self) -> u64 {
        self.batches
            .iter()
            .filter(|state| state.status == BatchStatus::Completed)
            .count() as u64
    }

    /// Aggregate per-batch outputs into a flat result list plus the mean
    /// metric. Input names are reduced to their final path component.
    pub fn results(&self) -> (Vec<EvalResult>, f32) {
        let mut metric_sum = 0.0f32;
        let mut results = Vec::new();

        for state in &self.batches {
            let Some(output) = &state.output else {
                continue;
            };
            metric_sum += output.metric;
            results.extend(output.results.iter().cloned());
        }

        for result in &mut results {
            if let Some(basename) = result.input.rsplit('/').next() {
                result.input = basename.to_string();
            }
        }

        let metric = if results.is_empty() {
            0.0
        } else {
            metric_sum / results.len() as f32
        };
        (results, metric)
    }
}

fn duration_secs(duration: chrono::Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job_with_inputs(n: usize, batch_size: usize) -> Job {
        let inputs = (0..n).map(|i| format!("input-{i}")).collect();
        Job::new(
            "m:2:0".to_string(),
            "m".to_string(),
            batch_size,
            "dataset.txt".to_string(),
            inputs,
            Utc::now(),
        )
    }

    #[test]
    fn partitions_into_ceil_batches() {
        let job = job_with_inputs(7, 2);
        assert_eq!(job.total_queries, 4);
        assert_eq!(job.batches.len(), 4);
        let ids: Vec<u32> = job.batches.iter().map(|b| b.input.batch_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(job.batches[3].input.inputs, vec!["input-6"]);
    }

    #[test]
    fn fetch_marks_in_progress_in_order() {
        let mut job = job_with_inputs(4, 2);
        let now = Utc::now();

        let first = job.fetch_batch_input(now).expect("first batch");
        assert_eq!(first.batch_id, 0);
        assert_eq!(job.batches[0].status, BatchStatus::InProgress);
        assert_eq!(job.batches[0].query_time, Some(now));

        let second = job.fetch_batch_input(now).expect("second batch");
        assert_eq!(second.batch_id, 1);
        assert!(job.fetch_batch_input(now).is_none());
    }

    #[test]
    fn second_per_query_defaults_before_completions() {
        let job = job_with_inputs(4, 2);
        assert_eq!(job.second_per_query(Utc::now()), 1.0);
        assert_eq!(job.query_processing_time(), 1.0);
    }

    #[test]
    fn expected_qps_rewards_more_workers() {
        let mut job = job_with_inputs(100, 1);
        job.completed_queries = 2;
        let now = job.start_time + Duration::seconds(2);
        let slow = job.expected_qps(1, now);
        let fast = job.expected_qps(10, now);
        assert!(fast > slow);
        assert_eq!(job.expected_qps(0, now), 0.0);
    }

    #[test]
    fn processing_time_clamps_stragglers() {
        let mut job = job_with_inputs(2, 1);
        let base = job.start_time;
        for (i, state) in job.batches.iter_mut().enumerate() {
            state.status = BatchStatus::Completed;
            state.query_time = Some(base);
            // one 2 s batch, one 60 s straggler clamped to 6 s
            let secs = if i == 0 { 2 } else { 60 };
            state.receive_time = Some(base + Duration::seconds(secs));
        }
        job.completed_queries = 2;
        assert!((job.query_processing_time() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn results_flatten_and_basename_inputs() {
        let mut job = job_with_inputs(2, 1);
        job.batches[0].output = Some(BatchOutput {
            batch_id: 0,
            results: vec![EvalResult {
                input: "dir/sub/img-0.jpg".to_string(),
                output: "cat".to_string(),
            }],
            metric: 0.5,
        });
        job.batches[1].output = Some(BatchOutput {
            batch_id: 1,
            results: vec![EvalResult {
                input: "img-1.jpg".to_string(),
                output: "dog".to_string(),
            }],
            metric: 1.0,
        });

        let (results, metric) = job.results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].input, "img-0.jpg");
        assert!((metric - 0.75).abs() < 1e-6);
    }

    #[test]
    fn results_empty_job_has_zero_metric() {
        let (results, metric) = job_with_inputs(2, 1).results();
        assert!(results.is_empty());
        assert_eq!(metric, 0.0);
    }
}
