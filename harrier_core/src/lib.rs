pub mod args;
pub mod config;
pub mod coverage;
pub mod engine;
pub mod harness;
pub mod mutator;
pub mod session;
pub mod signature;
pub mod stats;
pub mod target;

pub use args::{ParamShape, ShapeDescriptor};
pub use config::EngineConfig;
pub use coverage::{CoverageRange, CoverageSample, FunctionCoverage, ScriptCoverage};
pub use engine::{EngineError, FuzzerEngine, StopHandle};
pub use harness::{CrashRecord, ExecutionReport, FaultKind, Harness, InvocationOutcome};
pub use mutator::{IdentityMutator, Mutator, SubprocessMutator};
pub use session::{
    CoverageRecorder, CoverageSession, CoverageSummary, InstrumentedSession, SamplingGateway,
    ScriptedSession, SessionError,
};
pub use signature::{Signature, SignatureManager, compute_signature};
pub use stats::{RunStatistics, Stage, StatsSnapshot};
pub use target::{
    FnCallable, StaticModule, TargetCallable, TargetContext, TargetError, TargetLoader,
    TargetMatcher, TargetModule,
};
