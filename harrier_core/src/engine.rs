use crate::args::ShapeDescriptor;
use crate::config::EngineConfig;
use crate::harness::{unix_millis, unix_nanos, ExecutionReport, Harness};
use crate::mutator::{IdentityMutator, Mutator, SubprocessMutator};
use crate::session::{CoverageSession, SamplingGateway, SessionError};
use crate::signature::SignatureManager;
use crate::stats::{RunStatistics, Stage, StatsSnapshot};
use crate::target::{TargetContext, TargetError, TargetLoader, TargetMatcher, TargetModule};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Fallback seed when no seed file is configured or usable.
const DEFAULT_SEED: &str = "initial";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize engine state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Cooperative stop switch for a running fuzzing loop; safe to trigger from
/// another thread or a signal handler.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Persisted engine state, one JSON document per export.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PersistedState {
    stats: StatsSnapshot,
    all_ranges: Vec<String>,
    executed_ranges: Vec<String>,
    seeds: Vec<String>,
}

/// The coverage-guided fuzzing engine.
///
/// Owns the seed pool, the novelty oracle, the coverage gateway, and the run
/// statistics; drives the mutate / execute / observe loop over the loaded
/// target module.
pub struct FuzzerEngine {
    config: EngineConfig,
    stats: RunStatistics,
    signatures: SignatureManager,
    gateway: SamplingGateway,
    module: Box<dyn TargetModule>,
    matcher: TargetMatcher,
    harness: Harness,
    mutator: Box<dyn Mutator>,
    seed_pool: Vec<String>,
    running: Arc<AtomicBool>,
    rng: ChaCha8Rng,
}

impl FuzzerEngine {
    /// Loads the target and opens the coverage session. Both are fatal when
    /// they fail: without a target or a session there is nothing to fuzz.
    pub fn init(
        config: EngineConfig,
        loader: &dyn TargetLoader,
        session: Box<dyn CoverageSession>,
    ) -> Result<Self, EngineError> {
        fs::create_dir_all(&config.corpus_dir)?;

        let context = TargetContext::new(config.corpus_dir.clone());
        let module = loader.load(&context)?;
        let matcher = TargetMatcher::new(module.path());

        let mut gateway = SamplingGateway::new(session);
        gateway.open()?;

        let seed_pool = load_seed_pool(config.seed_file.as_deref());

        let mutator: Box<dyn Mutator> = if config.mutator_command.is_empty() {
            Box::new(IdentityMutator)
        } else {
            Box::new(SubprocessMutator::new(
                config.mutator_command.clone(),
                config.mutator_max_output_bytes,
                Duration::from_millis(config.mutator_timeout_ms),
            ))
        };

        let rng = match config.rng_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };

        let harness = Harness::new(
            Duration::from_millis(config.call_timeout_ms),
            config.save_crashes,
            config.corpus_dir.clone(),
            ShapeDescriptor::new(config.param_shapes.clone()),
        );

        let mut stats = RunStatistics::new();
        stats.set_stage(Stage::Ready);

        Ok(Self {
            config,
            stats,
            signatures: SignatureManager::new(),
            gateway,
            module,
            matcher,
            harness,
            mutator,
            seed_pool,
            running: Arc::new(AtomicBool::new(false)),
            rng,
        })
    }

    /// Marks the engine as driven externally rather than by the batch loop.
    pub fn mark_interactive(&mut self) {
        self.stats.set_stage(Stage::InteractiveReady);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.running))
    }

    /// Requests a stop and best-effort tears the session down. The flag takes
    /// effect at iteration granularity, so at most one more batch iteration
    /// completes; for interactively driven engines this is the teardown path.
    /// Use [`stop_handle`](Self::stop_handle) to request a stop from another
    /// thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.stats.set_stage(Stage::Stopping);
        self.gateway.shutdown();
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn seeds(&self) -> &[String] {
        &self.seed_pool
    }

    /// Adds a seed to the pool; blank seeds are ignored.
    pub fn add_seed(&mut self, seed: &str) {
        let trimmed = seed.trim();
        if !trimmed.is_empty() {
            self.seed_pool.push(trimmed.to_string());
        }
    }

    /// Produces one mutation of `seed` without executing it.
    pub fn mutate_input(&mut self, seed: &str) -> String {
        self.mutator.mutate(seed)
    }

    /// Executes one input against every target callable and reduces the
    /// resulting coverage snapshot. Does not touch the seed pool or stats.
    pub fn run_input(&mut self, input: &str) -> Result<ExecutionReport, SessionError> {
        self.harness
            .run_input(self.module.as_ref(), &mut self.gateway, &self.matcher, input)
    }

    /// Forgets all accumulated range knowledge; the next snapshot starts the
    /// cumulative figures from scratch. Seen signatures are kept.
    pub fn reset_coverage(&mut self) {
        self.gateway.reset();
    }

    /// Runs the fuzzing loop for at most `max_iterations` iterations, invoking
    /// `on_progress` with a fresh snapshot after every iteration and once more
    /// after completion.
    ///
    /// An iteration whose snapshot fails is degraded, not fatal: it counts as
    /// an execution with zero current coverage and no novelty.
    pub fn start_fuzzing(
        &mut self,
        max_iterations: u64,
        on_progress: &mut dyn FnMut(&StatsSnapshot),
    ) {
        self.running.store(true, Ordering::SeqCst);
        self.stats.set_stage(Stage::Fuzzing);
        let exec_delay = Duration::from_millis(self.config.exec_delay_ms);

        for _ in 0..max_iterations {
            if !self.running.load(Ordering::SeqCst) {
                self.stats.set_stage(Stage::Stopping);
                break;
            }

            let seed_index = self.rng.random_range(0..self.seed_pool.len());
            let seed = self.seed_pool[seed_index].clone();
            let input = self.mutator.mutate(&seed);

            match self.harness.run_input(
                self.module.as_ref(),
                &mut self.gateway,
                &self.matcher,
                &input,
            ) {
                Ok(report) => {
                    let matcher = &self.matcher;
                    let filter = |url: &str| matcher.matches(url);
                    let is_new = self
                        .signatures
                        .check_new_coverage(&report.sample, Some(&filter));
                    if is_new {
                        persist_novel_input(&self.config.corpus_dir, &input);
                        self.seed_pool.push(input.clone());
                    }
                    self.stats.update_exec(
                        &input,
                        report.summary.coverage_pct,
                        report.summary.cumulative_coverage_pct,
                        report.crashed,
                        is_new,
                    );
                }
                Err(e) => {
                    eprintln!("Warning: coverage snapshot failed, degrading iteration: {e}");
                    self.stats
                        .update_exec(&input, 0.0, self.gateway.cumulative_pct(), false, false);
                }
            }

            on_progress(&self.stats.snapshot());
            if !exec_delay.is_zero() {
                thread::sleep(exec_delay);
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.stats.set_stage(Stage::Completed);
        on_progress(&self.stats.snapshot());
        self.gateway.shutdown();
    }

    /// Writes the current stats, range sets, and seed pool to a timestamped
    /// JSON file under `dir`, returning the file's path.
    pub fn export_state(&self, dir: &Path) -> Result<PathBuf, EngineError> {
        fs::create_dir_all(dir)?;
        let state = PersistedState {
            stats: self.stats.snapshot(),
            all_ranges: self.gateway.all_ranges().iter().cloned().collect(),
            executed_ranges: self.gateway.executed_ranges().iter().cloned().collect(),
            seeds: self.seed_pool.clone(),
        };
        let path = dir.join(format!("fuzzer_state_{}.json", unix_millis()));
        fs::write(&path, serde_json::to_string_pretty(&state)?)?;
        Ok(path)
    }

    /// Restores seeds and range knowledge from a previously exported state
    /// file. Returns false (and leaves the engine untouched) when the file
    /// cannot be read or parsed.
    pub fn import_state(&mut self, path: &Path) -> bool {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                eprintln!("Warning: failed to read state file {path:?}: {e}");
                return false;
            }
        };
        let state: PersistedState = match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                eprintln!("Warning: failed to parse state file {path:?}: {e}");
                return false;
            }
        };
        self.gateway
            .restore_ranges(state.all_ranges, state.executed_ranges);
        if !state.seeds.is_empty() {
            self.seed_pool = state.seeds;
        }
        true
    }
}

fn load_seed_pool(seed_file: Option<&Path>) -> Vec<String> {
    let Some(path) = seed_file else {
        return vec![DEFAULT_SEED.to_string()];
    };
    match fs::read_to_string(path) {
        Ok(content) => {
            let seeds: Vec<String> = content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
            if seeds.is_empty() {
                eprintln!("Warning: seed file {path:?} has no usable seeds, using default");
                vec![DEFAULT_SEED.to_string()]
            } else {
                seeds
            }
        }
        Err(e) => {
            eprintln!("Warning: failed to read seed file {path:?}: {e}, using default");
            vec![DEFAULT_SEED.to_string()]
        }
    }
}

/// Best-effort: losing an interesting input to a disk error must not stop the
/// loop.
fn persist_novel_input(corpus_dir: &Path, input: &str) {
    let path = corpus_dir.join(format!("input_{}_{}.txt", unix_millis(), unix_nanos()));
    if let Err(e) = fs::write(&path, input) {
        eprintln!("Warning: failed to persist novel input {path:?}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageSample;
    use crate::session::{CoverageRecorder, CoverageSession, InstrumentedSession};
    use crate::target::{FnCallable, StaticModule, TargetCallable};
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    const TARGET_URL: &str = "/srv/targets/demo_target.js";

    struct FixedLoader {
        callables: Vec<Arc<dyn TargetCallable>>,
    }

    impl TargetLoader for FixedLoader {
        fn load(&self, _context: &TargetContext) -> Result<Box<dyn TargetModule>, TargetError> {
            Ok(Box::new(StaticModule::new(
                PathBuf::from(TARGET_URL),
                self.callables.clone(),
            )))
        }
    }

    struct FailingLoader;

    impl TargetLoader for FailingLoader {
        fn load(&self, _context: &TargetContext) -> Result<Box<dyn TargetModule>, TargetError> {
            Err(TargetError::LoadFailed("missing module".to_string()))
        }
    }

    fn test_config(corpus_dir: &Path) -> EngineConfig {
        EngineConfig {
            corpus_dir: corpus_dir.to_path_buf(),
            exec_delay_ms: 0,
            rng_seed: Some(7),
            ..EngineConfig::default()
        }
    }

    /// An engine whose target bumps a hit count that grows with every call, so
    /// every iteration produces a never-before-seen signature.
    fn engine_with_growing_coverage(corpus_dir: &Path) -> FuzzerEngine {
        let recorder = Arc::new(CoverageRecorder::new());
        recorder.declare(TARGET_URL, 0, 50);
        let hits = Arc::clone(&recorder);
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = FixedLoader {
            callables: vec![FnCallable::new("process", &["payload"], move |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                for _ in 0..n {
                    hits.hit(TARGET_URL, 0, 50);
                }
                Ok(Value::Null)
            })],
        };
        let session = Box::new(InstrumentedSession::new(recorder));
        FuzzerEngine::init(test_config(corpus_dir), &loader, session).unwrap()
    }

    #[test]
    fn failed_target_load_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let session = Box::new(InstrumentedSession::new(Arc::new(CoverageRecorder::new())));
        let result = FuzzerEngine::init(test_config(dir.path()), &FailingLoader, session);
        assert!(matches!(result, Err(EngineError::Target(_))));
    }

    #[test]
    fn init_defaults_to_a_single_seed_and_ready_stage() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_growing_coverage(dir.path());
        assert_eq!(engine.seeds(), &[DEFAULT_SEED.to_string()]);
        assert_eq!(engine.stats_snapshot().stage, Stage::Ready);
    }

    #[test]
    fn seed_file_lines_replace_the_default_seed() {
        let dir = tempfile::tempdir().unwrap();
        let seed_path = dir.path().join("seeds.txt");
        fs::write(&seed_path, "alpha\n\n  beta  \n").unwrap();
        let mut config = test_config(dir.path());
        config.seed_file = Some(seed_path);

        let recorder = Arc::new(CoverageRecorder::new());
        let loader = FixedLoader {
            callables: vec![FnCallable::new("noop", &[], |_| Ok(Value::Null))],
        };
        let session = Box::new(InstrumentedSession::new(recorder));
        let engine = FuzzerEngine::init(config, &loader, session).unwrap();
        assert_eq!(engine.seeds(), &["alpha".to_string(), "beta".to_string()]);
    }

    #[test]
    fn zero_iteration_run_completes_with_one_final_callback() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with_growing_coverage(dir.path());
        let mut callbacks = 0;
        engine.start_fuzzing(0, &mut |_| callbacks += 1);

        assert_eq!(callbacks, 1, "only the final snapshot is reported");
        let snap = engine.stats_snapshot();
        assert_eq!(snap.stage, Stage::Completed);
        assert_eq!(snap.total_execs, 0);
    }

    #[test]
    fn novel_coverage_grows_the_seed_pool_and_persists_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with_growing_coverage(dir.path());
        let mut callbacks = 0;
        engine.start_fuzzing(3, &mut |_| callbacks += 1);

        assert_eq!(callbacks, 4, "one per iteration plus the final one");
        let snap = engine.stats_snapshot();
        assert_eq!(snap.total_execs, 3);
        assert_eq!(snap.paths, 3, "each growing hit count is a new signature");
        assert_eq!(engine.seeds().len(), 1 + 3);

        let novel_inputs = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with("input_")
            })
            .count();
        assert_eq!(novel_inputs, 3);
    }

    #[test]
    fn crashing_target_is_counted_but_does_not_stop_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(CoverageRecorder::new());
        let loader = FixedLoader {
            callables: vec![FnCallable::new("explode", &["x"], |_| {
                Err("boom".to_string())
            })],
        };
        let session = Box::new(InstrumentedSession::new(recorder));
        let mut config = test_config(dir.path());
        config.save_crashes = false;
        let mut engine = FuzzerEngine::init(config, &loader, session).unwrap();

        engine.start_fuzzing(5, &mut |_| {});
        let snap = engine.stats_snapshot();
        assert_eq!(snap.total_execs, 5);
        assert_eq!(snap.crash_count, 5);
        assert_eq!(snap.unique_crashes, 1, "identity mutation repeats the seed");
    }

    #[derive(Default)]
    struct TeardownFlags {
        stopped: AtomicBool,
        disabled: AtomicBool,
        disconnected: AtomicBool,
    }

    /// Records which teardown requests the backend received.
    struct TrackingSession {
        flags: Arc<TeardownFlags>,
    }

    impl CoverageSession for TrackingSession {
        fn enable(&mut self) -> Result<(), crate::session::SessionError> {
            Ok(())
        }

        fn start_precise_coverage(&mut self) -> Result<(), crate::session::SessionError> {
            Ok(())
        }

        fn take_precise_coverage(
            &mut self,
        ) -> Result<CoverageSample, crate::session::SessionError> {
            Ok(CoverageSample::default())
        }

        fn stop_precise_coverage(&mut self) -> Result<(), crate::session::SessionError> {
            self.flags.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn disable(&mut self) -> Result<(), crate::session::SessionError> {
            self.flags.disabled.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn disconnect(&mut self) {
            self.flags.disconnected.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn interactive_stop_tears_down_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let flags = Arc::new(TeardownFlags::default());
        let loader = FixedLoader {
            callables: vec![FnCallable::new("noop", &[], |_| Ok(Value::Null))],
        };
        let session = Box::new(TrackingSession {
            flags: Arc::clone(&flags),
        });
        let mut engine = FuzzerEngine::init(test_config(dir.path()), &loader, session).unwrap();
        engine.mark_interactive();
        engine.run_input("hello").unwrap();
        engine.stop();

        assert!(
            flags.stopped.load(Ordering::SeqCst),
            "stop() must stop precise coverage collection"
        );
        assert!(
            flags.disabled.load(Ordering::SeqCst),
            "stop() must disable the session"
        );
        assert!(
            flags.disconnected.load(Ordering::SeqCst),
            "stop() must disconnect the session"
        );
        assert_eq!(engine.stats_snapshot().stage, Stage::Stopping);
    }

    #[test]
    fn stop_handle_ends_the_loop_early() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with_growing_coverage(dir.path());
        let handle = engine.stop_handle();
        let mut seen = 0u64;
        engine.start_fuzzing(1_000_000, &mut |snap| {
            seen = snap.total_execs;
            if snap.total_execs == 3 {
                handle.stop();
            }
        });
        assert_eq!(seen, 3, "loop exits on the iteration after the stop request");
        assert_eq!(engine.stats_snapshot().stage, Stage::Completed);
    }

    #[test]
    fn state_export_and_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with_growing_coverage(dir.path());
        engine.add_seed("interesting");
        engine.start_fuzzing(2, &mut |_| {});
        let exported = engine.export_state(dir.path()).unwrap();
        assert!(exported
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("fuzzer_state_"));

        let fresh_dir = tempfile::tempdir().unwrap();
        let mut fresh = engine_with_growing_coverage(fresh_dir.path());
        assert!(fresh.import_state(&exported));
        assert_eq!(fresh.seeds(), engine.seeds());
        assert_eq!(
            fresh.gateway.executed_ranges(),
            engine.gateway.executed_ranges()
        );
        assert_eq!(fresh.gateway.all_ranges(), engine.gateway.all_ranges());
    }

    #[test]
    fn import_accepts_state_whose_stats_lack_a_stage() {
        let dir = tempfile::tempdir().unwrap();
        let state = r#"{
            "stats": {
                "runtime": "00:00:03",
                "totalExecs": 4,
                "crashCount": 1,
                "uniqueCrashes": 1,
                "paths": 2,
                "currentCoverage": 25.0,
                "cumulativeCoverage": 50.0,
                "maxCoverage": 50.0,
                "execsPerSec": 0.4,
                "lastInputPreview": "alpha"
            },
            "allRanges": ["t.js:0:10", "t.js:11:20"],
            "executedRanges": ["t.js:0:10"],
            "seeds": ["alpha"]
        }"#;
        let path = dir.path().join("fuzzer_state_0.json");
        fs::write(&path, state).unwrap();

        let mut engine = engine_with_growing_coverage(dir.path());
        assert!(
            engine.import_state(&path),
            "a stage-less stats object must still import"
        );
        assert_eq!(engine.seeds(), &["alpha".to_string()]);
        assert_eq!(engine.gateway.all_ranges().len(), 2);
        assert_eq!(engine.gateway.executed_ranges().len(), 1);
    }

    #[test]
    fn import_of_garbage_state_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("state.json");
        fs::write(&bogus, "not json at all").unwrap();
        let mut engine = engine_with_growing_coverage(dir.path());
        let seeds_before = engine.seeds().to_vec();
        assert!(!engine.import_state(&bogus));
        assert!(!engine.import_state(Path::new("/no/such/state.json")));
        assert_eq!(engine.seeds(), seeds_before, "failed import changes nothing");
    }

    #[test]
    fn reset_coverage_clears_cumulative_knowledge() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with_growing_coverage(dir.path());
        engine.start_fuzzing(2, &mut |_| {});
        assert!(!engine.gateway.all_ranges().is_empty());
        engine.reset_coverage();
        assert!(engine.gateway.all_ranges().is_empty());
        assert_eq!(engine.gateway.cumulative_pct(), 0.0);
    }
}
