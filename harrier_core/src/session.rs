use crate::coverage::{range_key, CoverageRange, CoverageSample, FunctionCoverage, ScriptCoverage};
use crate::target::TargetMatcher;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Poll step while waiting for the in-flight snapshot slot to clear.
const BUSY_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Error, Debug)]
pub enum SessionError {
    /// The profiling backend rejected a request.
    #[error("Coverage session backend error: {0}")]
    Backend(String),

    /// A request was issued against a session that is not collecting.
    #[error("Coverage session is not active")]
    NotActive,
}

/// A profiling session that supports range-level, per-call-count coverage.
///
/// The underlying backend accepts only one outstanding snapshot request at a
/// time; callers must go through [`SamplingGateway`].
pub trait CoverageSession: Send {
    fn enable(&mut self) -> Result<(), SessionError>;
    fn start_precise_coverage(&mut self) -> Result<(), SessionError>;
    fn take_precise_coverage(&mut self) -> Result<CoverageSample, SessionError>;
    fn stop_precise_coverage(&mut self) -> Result<(), SessionError>;
    fn disable(&mut self) -> Result<(), SessionError>;
    fn disconnect(&mut self);
}

/// Shared hit-count store bumped by instrumented target code.
///
/// Ranges are declared up front (count 0) so unexecuted regions still appear
/// in snapshots; [`CoverageRecorder::hit`] increments the count. Taking a
/// snapshot drains the counts but keeps the declared ranges.
#[derive(Debug, Default)]
pub struct CoverageRecorder {
    hits: Mutex<BTreeMap<(String, u32, u32), u64>>,
}

impl CoverageRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&self, url: &str, start_offset: u32, end_offset: u32) {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        hits.entry((url.to_string(), start_offset, end_offset))
            .or_insert(0);
    }

    pub fn hit(&self, url: &str, start_offset: u32, end_offset: u32) {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        *hits
            .entry((url.to_string(), start_offset, end_offset))
            .or_insert(0) += 1;
    }

    fn drain_sample(&self) -> CoverageSample {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let mut scripts: BTreeMap<String, Vec<CoverageRange>> = BTreeMap::new();
        for ((url, start, end), count) in hits.iter_mut() {
            scripts
                .entry(url.clone())
                .or_default()
                .push(CoverageRange::new(*start, *end, *count));
            *count = 0;
        }
        CoverageSample {
            scripts: scripts
                .into_iter()
                .map(|(url, ranges)| ScriptCoverage {
                    url,
                    functions: vec![FunctionCoverage {
                        function_name: String::new(),
                        ranges,
                    }],
                })
                .collect(),
        }
    }
}

/// A [`CoverageSession`] backed by a [`CoverageRecorder`] shared with the
/// target's instrumentation.
pub struct InstrumentedSession {
    recorder: Arc<CoverageRecorder>,
    connected: bool,
    enabled: bool,
    collecting: bool,
}

impl InstrumentedSession {
    pub fn new(recorder: Arc<CoverageRecorder>) -> Self {
        Self {
            recorder,
            connected: true,
            enabled: false,
            collecting: false,
        }
    }
}

impl CoverageSession for InstrumentedSession {
    fn enable(&mut self) -> Result<(), SessionError> {
        if !self.connected {
            return Err(SessionError::NotActive);
        }
        self.enabled = true;
        Ok(())
    }

    fn start_precise_coverage(&mut self) -> Result<(), SessionError> {
        if !self.enabled {
            return Err(SessionError::NotActive);
        }
        self.collecting = true;
        Ok(())
    }

    fn take_precise_coverage(&mut self) -> Result<CoverageSample, SessionError> {
        if !self.connected || !self.collecting {
            return Err(SessionError::NotActive);
        }
        Ok(self.recorder.drain_sample())
    }

    fn stop_precise_coverage(&mut self) -> Result<(), SessionError> {
        self.collecting = false;
        Ok(())
    }

    fn disable(&mut self) -> Result<(), SessionError> {
        self.enabled = false;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

/// A session that replays queued samples; repeats the last one when the queue
/// runs dry. Meant for tests and for driving presentation layers without a
/// live target.
#[derive(Default)]
pub struct ScriptedSession {
    queue: VecDeque<CoverageSample>,
    last: Option<CoverageSample>,
    fail_next_take: bool,
}

impl ScriptedSession {
    pub fn new(samples: Vec<CoverageSample>) -> Self {
        Self {
            queue: samples.into(),
            last: None,
            fail_next_take: false,
        }
    }

    /// Makes the next snapshot request fail, to exercise degraded iterations.
    pub fn fail_next_take(&mut self) {
        self.fail_next_take = true;
    }
}

impl CoverageSession for ScriptedSession {
    fn enable(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn start_precise_coverage(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn take_precise_coverage(&mut self) -> Result<CoverageSample, SessionError> {
        if self.fail_next_take {
            self.fail_next_take = false;
            return Err(SessionError::Backend("scripted take failure".to_string()));
        }
        if let Some(sample) = self.queue.pop_front() {
            self.last = Some(sample.clone());
            return Ok(sample);
        }
        Ok(self.last.clone().unwrap_or_default())
    }

    fn stop_precise_coverage(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn disable(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn disconnect(&mut self) {}
}

/// Aggregate coverage figures for one snapshot reduction.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CoverageSummary {
    /// Executed / total ranges within this snapshot, as a percentage.
    pub coverage_pct: f64,
    /// Ever-executed / ever-seen ranges across the run, as a percentage.
    pub cumulative_coverage_pct: f64,
    pub total_ranges: usize,
    pub executed_ranges: usize,
    pub cumulative_ranges: usize,
    pub all_ranges_count: usize,
}

/// Serializes snapshot requests against the single-request profiling session
/// and reduces raw samples into aggregate coverage.
///
/// The session slot is claimed through a busy flag with cooperative
/// sleep-and-retry polling; the flag is released on every exit path.
pub struct SamplingGateway {
    session: Box<dyn CoverageSession>,
    busy: Arc<AtomicBool>,
    all_ranges: BTreeSet<String>,
    executed_ranges: BTreeSet<String>,
}

impl SamplingGateway {
    pub fn new(session: Box<dyn CoverageSession>) -> Self {
        Self {
            session,
            busy: Arc::new(AtomicBool::new(false)),
            all_ranges: BTreeSet::new(),
            executed_ranges: BTreeSet::new(),
        }
    }

    /// Enables the backend and starts precise coverage collection.
    pub fn open(&mut self) -> Result<(), SessionError> {
        self.session.enable()?;
        self.session.start_precise_coverage()
    }

    /// Takes exactly one snapshot, waiting for any in-flight request first.
    pub fn take_snapshot(&mut self) -> Result<CoverageSample, SessionError> {
        while self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            thread::sleep(BUSY_POLL_INTERVAL);
        }
        let _release = BusyRelease(Arc::clone(&self.busy));
        self.session.take_precise_coverage()
    }

    /// Folds a snapshot into the run-lifetime range sets and computes the
    /// per-snapshot and cumulative coverage percentages. Only scripts owned by
    /// the target contribute.
    pub fn reduce(&mut self, sample: &CoverageSample, matcher: &TargetMatcher) -> CoverageSummary {
        let mut snapshot_total = 0usize;
        let mut snapshot_executed = 0usize;
        for script in &sample.scripts {
            if !matcher.matches(&script.url) {
                continue;
            }
            for func in &script.functions {
                for range in &func.ranges {
                    let key = range_key(&script.url, range);
                    self.all_ranges.insert(key.clone());
                    snapshot_total += 1;
                    if range.is_executed() {
                        self.executed_ranges.insert(key);
                        snapshot_executed += 1;
                    }
                }
            }
        }
        CoverageSummary {
            coverage_pct: percentage(snapshot_executed, snapshot_total),
            cumulative_coverage_pct: self.cumulative_pct(),
            total_ranges: snapshot_total,
            executed_ranges: snapshot_executed,
            cumulative_ranges: self.executed_ranges.len(),
            all_ranges_count: self.all_ranges.len(),
        }
    }

    /// Ever-executed / ever-seen percentage, 0 when nothing was observed yet.
    pub fn cumulative_pct(&self) -> f64 {
        percentage(self.executed_ranges.len(), self.all_ranges.len())
    }

    pub fn all_ranges(&self) -> &BTreeSet<String> {
        &self.all_ranges
    }

    pub fn executed_ranges(&self) -> &BTreeSet<String> {
        &self.executed_ranges
    }

    /// Replaces both range sets, e.g. when importing persisted state.
    /// Executed keys are folded into the seen set to keep the subset invariant.
    pub fn restore_ranges<A, E>(&mut self, all: A, executed: E)
    where
        A: IntoIterator<Item = String>,
        E: IntoIterator<Item = String>,
    {
        self.all_ranges = all.into_iter().collect();
        self.executed_ranges = executed.into_iter().collect();
        for key in &self.executed_ranges {
            self.all_ranges.insert(key.clone());
        }
    }

    /// Clears the run-lifetime range sets.
    pub fn reset(&mut self) {
        self.all_ranges.clear();
        self.executed_ranges.clear();
    }

    /// Stops collection and tears the session down, swallowing backend errors
    /// so teardown cannot itself fail the run.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.session.stop_precise_coverage() {
            eprintln!("Warning: failed to stop precise coverage: {e}");
        }
        if let Err(e) = self.session.disable() {
            eprintln!("Warning: failed to disable coverage session: {e}");
        }
        self.session.disconnect();
    }

    #[cfg(test)]
    fn busy_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.busy)
    }
}

fn percentage(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64 * 100.0
    }
}

struct BusyRelease(Arc<AtomicBool>);

impl Drop for BusyRelease {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
