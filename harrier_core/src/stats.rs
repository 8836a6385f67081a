use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Width of the sliding window used for the executions-per-second rate.
const EXEC_RATE_WINDOW: Duration = Duration::from_secs(10);

/// Longest `last_input` preview exposed to presentation consumers.
const INPUT_PREVIEW_MAX_CHARS: usize = 200;

/// Lifecycle stage of the engine, exposed through the stats snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    #[default]
    #[serde(rename = "initializing")]
    Uninitialized,
    Ready,
    /// Alternate ready state for externally driven (non-batch) execution.
    InteractiveReady,
    Fuzzing,
    Stopping,
    Completed,
}

/// Counters and derived metrics aggregated from completed iterations.
///
/// Mutated only by the fuzzing loop after each iteration; presentation layers
/// read it through the immutable [`StatsSnapshot`].
#[derive(Debug)]
pub struct RunStatistics {
    start: Instant,
    total_execs: u64,
    crash_count: u64,
    unique_crash_inputs: HashSet<String>,
    path_count: u64,
    current_coverage: f64,
    cumulative_coverage: f64,
    max_coverage: f64,
    exec_times: VecDeque<Instant>,
    last_input: String,
    stage: Stage,
}

/// Immutable, serializable view of [`RunStatistics`] for external consumers.
/// Field names match the persisted-state wire format.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub runtime: String,
    pub total_execs: u64,
    pub crash_count: u64,
    pub unique_crashes: usize,
    pub paths: u64,
    pub current_coverage: f64,
    pub cumulative_coverage: f64,
    pub max_coverage: f64,
    pub execs_per_sec: f64,
    pub last_input_preview: String,
    /// Absent in state files written by older builds.
    #[serde(default)]
    pub stage: Stage,
}

impl Default for RunStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStatistics {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            total_execs: 0,
            crash_count: 0,
            unique_crash_inputs: HashSet::new(),
            path_count: 0,
            current_coverage: 0.0,
            cumulative_coverage: 0.0,
            max_coverage: 0.0,
            exec_times: VecDeque::new(),
            last_input: String::new(),
            stage: Stage::Uninitialized,
        }
    }

    /// Records one completed iteration.
    ///
    /// Non-finite coverage values default to 0. Unique crashes are keyed by
    /// the verbatim input text, so distinct inputs hitting the same underlying
    /// bug count separately.
    pub fn update_exec(
        &mut self,
        input: &str,
        current_coverage: f64,
        cumulative_coverage: f64,
        is_crash: bool,
        is_new_path: bool,
    ) {
        self.update_exec_at(
            Instant::now(),
            input,
            current_coverage,
            cumulative_coverage,
            is_crash,
            is_new_path,
        );
    }

    /// Same as [`update_exec`](Self::update_exec) with an explicit timestamp,
    /// so the sliding window is testable without real waits.
    pub fn update_exec_at(
        &mut self,
        now: Instant,
        input: &str,
        current_coverage: f64,
        cumulative_coverage: f64,
        is_crash: bool,
        is_new_path: bool,
    ) {
        self.total_execs += 1;
        self.last_input = input.to_string();
        self.current_coverage = sanitize_pct(current_coverage);
        self.cumulative_coverage = sanitize_pct(cumulative_coverage);
        if self.current_coverage > self.max_coverage {
            self.max_coverage = self.current_coverage;
        }
        if is_crash {
            self.crash_count += 1;
            self.unique_crash_inputs.insert(input.to_string());
        }
        if is_new_path {
            self.path_count += 1;
        }
        self.exec_times.push_back(now);
        while let Some(&oldest) = self.exec_times.front() {
            if now.duration_since(oldest) > EXEC_RATE_WINDOW {
                self.exec_times.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn total_execs(&self) -> u64 {
        self.total_execs
    }

    pub fn crash_count(&self) -> u64 {
        self.crash_count
    }

    pub fn path_count(&self) -> u64 {
        self.path_count
    }

    /// Executions per second over the trailing 10-second window.
    pub fn execs_per_sec(&self) -> f64 {
        self.exec_times.len() as f64 / EXEC_RATE_WINDOW.as_secs() as f64
    }

    /// Wall-clock time since construction, formatted `HH:MM:SS`.
    pub fn runtime(&self) -> String {
        let elapsed = self.start.elapsed().as_secs();
        format!(
            "{:02}:{:02}:{:02}",
            elapsed / 3600,
            (elapsed % 3600) / 60,
            elapsed % 60
        )
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            runtime: self.runtime(),
            total_execs: self.total_execs,
            crash_count: self.crash_count,
            unique_crashes: self.unique_crash_inputs.len(),
            paths: self.path_count,
            current_coverage: self.current_coverage,
            cumulative_coverage: self.cumulative_coverage,
            max_coverage: self.max_coverage,
            execs_per_sec: self.execs_per_sec(),
            last_input_preview: preview(&self.last_input),
            stage: self.stage,
        }
    }
}

fn sanitize_pct(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

fn preview(input: &str) -> String {
    if input.chars().count() > INPUT_PREVIEW_MAX_CHARS {
        let mut truncated: String = input.chars().take(INPUT_PREVIEW_MAX_CHARS).collect();
        truncated.push_str("...");
        truncated
    } else {
        input.to_string()
    }
}
