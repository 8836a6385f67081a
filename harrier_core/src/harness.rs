use crate::args::{coerce_arguments, expected_arity, prepare_arguments, ShapeDescriptor};
use crate::coverage::CoverageSample;
use crate::session::{CoverageSummary, SamplingGateway, SessionError};
use crate::target::{TargetCallable, TargetMatcher, TargetModule};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// What went wrong inside one callable invocation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FaultKind {
    /// The callable returned an error.
    Error,
    /// The callable panicked.
    Panic,
    /// The invocation lost the race against the per-call timeout.
    Timeout,
}

/// Discriminated result of invoking one target callable.
#[derive(Debug)]
pub enum InvocationOutcome {
    Completed,
    Fault {
        kind: FaultKind,
        message: String,
        trace: String,
    },
}

/// A captured target fault, persisted per crashing invocation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrashRecord {
    pub func: String,
    pub kind: FaultKind,
    pub message: String,
    pub stack: String,
    pub timestamp_ms: u64,
}

/// Result of running one input against every exported callable.
#[derive(Debug)]
pub struct ExecutionReport {
    pub crashed: bool,
    pub crash_info: Option<CrashRecord>,
    /// The raw snapshot taken after all callables were attempted.
    pub sample: CoverageSample,
    pub summary: CoverageSummary,
}

/// Invokes every exported callable of the target with inferred and coerced
/// arguments under a timeout, captures failures, and persists crash artifacts.
pub struct Harness {
    call_timeout: Duration,
    save_crashes: bool,
    corpus_dir: PathBuf,
    shapes: ShapeDescriptor,
}

impl Harness {
    pub fn new(
        call_timeout: Duration,
        save_crashes: bool,
        corpus_dir: PathBuf,
        shapes: ShapeDescriptor,
    ) -> Self {
        Self {
            call_timeout,
            save_crashes,
            corpus_dir,
            shapes,
        }
    }

    /// Feeds `input` to every callable independently; a fault in one callable
    /// does not prevent testing the others. Takes exactly one coverage
    /// snapshot afterwards. Snapshot errors propagate to the caller.
    pub fn run_input(
        &self,
        module: &dyn TargetModule,
        gateway: &mut SamplingGateway,
        matcher: &TargetMatcher,
        input: &str,
    ) -> Result<ExecutionReport, SessionError> {
        let mut crashed = false;
        let mut crash_info: Option<CrashRecord> = None;

        for callable in module.callables() {
            let param_names = callable.param_names().to_vec();
            let arity = expected_arity(&param_names);
            let prepared = prepare_arguments(input, arity, &param_names, &self.shapes);
            let coerced = coerce_arguments(prepared, arity, &param_names, &self.shapes);

            match invoke_with_timeout(Arc::clone(callable), coerced, self.call_timeout) {
                InvocationOutcome::Completed => {}
                InvocationOutcome::Fault {
                    kind,
                    message,
                    trace,
                } => {
                    crashed = true;
                    let record = CrashRecord {
                        func: callable.name().to_string(),
                        kind,
                        message,
                        stack: trace,
                        timestamp_ms: unix_millis(),
                    };
                    if self.save_crashes {
                        self.save_crash_artifact(input, &record);
                    }
                    crash_info = Some(record);
                }
            }
        }

        let sample = gateway.take_snapshot()?;
        let summary = gateway.reduce(&sample, matcher);
        Ok(ExecutionReport {
            crashed,
            crash_info,
            sample,
            summary,
        })
    }

    /// Best-effort: a failed write must not cost loop liveness.
    fn save_crash_artifact(&self, input: &str, record: &CrashRecord) {
        if let Err(e) = fs::create_dir_all(&self.corpus_dir) {
            eprintln!("Warning: failed to create corpus dir {:?}: {e}", self.corpus_dir);
            return;
        }
        let filename = format!(
            "crash_{}_{}_{}.json",
            record.timestamp_ms,
            unix_nanos(),
            record.func
        );
        let artifact = json!({ "input": input, "crashInfo": record });
        let payload = match serde_json::to_string_pretty(&artifact) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("Warning: failed to serialize crash artifact: {e}");
                return;
            }
        };
        let path = self.corpus_dir.join(filename);
        if let Err(e) = fs::write(&path, payload) {
            eprintln!("Warning: failed to write crash artifact {path:?}: {e}");
        }
    }
}

/// Races one invocation against the timeout on a helper thread. A callable
/// that outlives the race is abandoned, not preempted.
pub fn invoke_with_timeout(
    callable: Arc<dyn TargetCallable>,
    args: Vec<Value>,
    timeout: Duration,
) -> InvocationOutcome {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = catch_unwind(AssertUnwindSafe(|| callable.invoke(args)));
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(Ok(_value))) => InvocationOutcome::Completed,
        Ok(Ok(Err(message))) => InvocationOutcome::Fault {
            kind: FaultKind::Error,
            message,
            trace: String::new(),
        },
        Ok(Err(panic_payload)) => {
            let message = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic type".to_string()
            };
            InvocationOutcome::Fault {
                kind: FaultKind::Panic,
                message,
                trace: String::new(),
            }
        }
        Err(_) => InvocationOutcome::Fault {
            kind: FaultKind::Timeout,
            message: "function timeout".to_string(),
            trace: String::new(),
        },
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}
