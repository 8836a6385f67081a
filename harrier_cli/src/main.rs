use harrier_core::config::EngineConfig;
use harrier_core::engine::FuzzerEngine;
use harrier_core::session::{CoverageRecorder, InstrumentedSession};
use harrier_core::target::{
    FnCallable, StaticModule, TargetCallable, TargetContext, TargetError, TargetLoader,
    TargetModule,
};

use clap::Parser;
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(short, long, default_value_t = 1000)]
    iterations: u64,
    #[clap(long)]
    corpus_dir: Option<PathBuf>,
    #[clap(long)]
    seed_file: Option<PathBuf>,
}

const DEMO_TARGET_PATH: &str = "/tmp/harrier_demo_target.js";

/// A small built-in target with branchy, hit-counted behavior so a run
/// produces coverage novelty, crashes of every kind, and a growing corpus.
fn demo_callables(recorder: &Arc<CoverageRecorder>) -> Vec<Arc<dyn TargetCallable>> {
    recorder.declare(DEMO_TARGET_PATH, 0, 40);
    recorder.declare(DEMO_TARGET_PATH, 41, 90);
    recorder.declare(DEMO_TARGET_PATH, 91, 140);
    recorder.declare(DEMO_TARGET_PATH, 141, 200);

    let header_hits = Arc::clone(recorder);
    let check_header = FnCallable::new("check_header", &["payload"], move |args| {
        header_hits.hit(DEMO_TARGET_PATH, 0, 40);
        let payload = args
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if payload.starts_with("BAD") {
            panic!("BAD input detected by demo target!");
        }
        if payload.len() > 8 {
            header_hits.hit(DEMO_TARGET_PATH, 41, 90);
        }
        Ok(Value::String(payload))
    });

    let command_hits = Arc::clone(recorder);
    let run_commands = FnCallable::new("run_commands", &["commands"], move |args| {
        command_hits.hit(DEMO_TARGET_PATH, 91, 140);
        let commands = match args.first() {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        for command in &commands {
            if command.as_str() == Some("CRASH") {
                return Err("CRASH command rejected by demo target".to_string());
            }
            command_hits.hit(DEMO_TARGET_PATH, 141, 200);
        }
        Ok(Value::Number(commands.len().into()))
    });

    vec![check_header, run_commands]
}

struct DemoLoader {
    recorder: Arc<CoverageRecorder>,
}

impl TargetLoader for DemoLoader {
    fn load(&self, _context: &TargetContext) -> Result<Box<dyn TargetModule>, TargetError> {
        Ok(Box::new(StaticModule::new(
            PathBuf::from(DEMO_TARGET_PATH),
            demo_callables(&self.recorder),
        )))
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let mut config = match cli.config_file {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}");
            EngineConfig::load_from_file(&config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("harrier.toml");
            if default_config_path.exists() {
                println!(
                    "No config file specified via CLI, loading default: {default_config_path:?}"
                );
                EngineConfig::load_from_file(&default_config_path)?
            } else {
                println!(
                    "No config file specified and default 'harrier.toml' not found, using built-in defaults."
                );
                EngineConfig::default()
            }
        }
    };

    if let Some(corpus_dir) = cli.corpus_dir {
        config.corpus_dir = corpus_dir;
    }
    if let Some(seed_file) = cli.seed_file {
        config.seed_file = Some(seed_file);
    }

    println!("Effective configuration: {config:#?}");

    let recorder = Arc::new(CoverageRecorder::new());
    let loader = DemoLoader {
        recorder: Arc::clone(&recorder),
    };
    let session = Box::new(InstrumentedSession::new(recorder));
    let mut engine = FuzzerEngine::init(config.clone(), &loader, session)?;

    let max_iterations = cli.iterations;
    println!(
        "Starting fuzz loop for {} iterations with {} initial seeds...",
        max_iterations,
        engine.seeds().len()
    );

    let progress_step = (max_iterations / 100).max(1);
    engine.start_fuzzing(max_iterations, &mut |snap| {
        if snap.total_execs % progress_step == 0 {
            print!(
                "\r[{}] Execs: {}/{}, Paths: {}, Crashes: {} ({} unique), Cov: {:.1}% (cum {:.1}%), Execs/sec: {:.2}   ",
                snap.runtime,
                snap.total_execs,
                max_iterations,
                snap.paths,
                snap.crash_count,
                snap.unique_crashes,
                snap.current_coverage,
                snap.cumulative_coverage,
                snap.execs_per_sec
            );
            let _ = std::io::stdout().flush();
        }
    });

    let state_path = engine.export_state(&config.corpus_dir)?;

    let snap = engine.stats_snapshot();
    println!("\nFuzz loop finished in {}.", snap.runtime);
    println!(
        "Total Executions: {}, Paths: {}, Crashes: {} ({} unique), Max Coverage: {:.1}%",
        snap.total_execs, snap.paths, snap.crash_count, snap.unique_crashes, snap.max_coverage
    );
    println!("Seed pool: {} entries", engine.seeds().len());
    println!("State written to {state_path:?}");

    Ok(())
}
