use shadowfuzz_core::config::ShadowfuzzConfig;
use shadowfuzz_core::corpus::{self, CorpusManager};
use shadowfuzz_core::executor::TimeoutPolicy;
use shadowfuzz_core::generator::Generator;
use shadowfuzz_core::grammar::Grammar;
use shadowfuzz_core::minimizer::{Minimized, Minimizer};
use shadowfuzz_core::oracle::{Oracle, Verdict};
use shadowfuzz_core::pool::run_pool;
use shadowfuzz_core::report::{self, ReportFormat, RunReport};
use shadowfuzz_core::schema::Schema;
use shadowfuzz_core::testcase::{self, GeneratedTest, StrategyKind};

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Schema-driven behavioral fuzzing and differential execution", long_about = None)]
struct Cli {
    /// Configuration file; `shadowfuzz.toml` in the current directory is used when present.
    #[clap(short, long, global = true, value_parser)]
    config: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate test programs from a schema.
    Generate {
        schema: PathBuf,
        #[clap(long, default_value = "schema")]
        strategy: StrategyKind,
        #[clap(long, default_value_t = 100)]
        count: usize,
        #[clap(long, default_value_t = 0)]
        seed: u64,
        #[clap(long)]
        out: PathBuf,
        /// Seed programs for the mutation strategy (files or directories).
        #[clap(long)]
        seeds: Vec<PathBuf>,
        #[clap(long)]
        grammar: Option<PathBuf>,
    },
    /// Execute every test in a directory.
    Run {
        test_dir: PathBuf,
        #[clap(long)]
        timeout_ms: Option<u64>,
        #[clap(long, default_value = "text")]
        report: ReportFormat,
        #[clap(long)]
        corpus: Option<PathBuf>,
        #[clap(long)]
        minimize: bool,
        /// Schema used to minimize sequence tests; defaults to the one recorded in each test.
        #[clap(long)]
        schema: Option<PathBuf>,
    },
    /// Shrink one failing test.
    Minimize {
        test: PathBuf,
        #[clap(long)]
        schema: Option<PathBuf>,
        #[clap(long)]
        out: Option<PathBuf>,
        #[clap(long)]
        timeout_ms: Option<u64>,
    },
    /// Re-execute every corpus entry.
    Replay {
        corpus_dir: PathBuf,
        #[clap(long, default_value = "text")]
        report: ReportFormat,
        #[clap(long)]
        timeout_ms: Option<u64>,
    },
    /// Remove one corpus entry.
    Prune { corpus_dir: PathBuf, signature: String },
}

/// What a command found, as opposed to a fault that stopped it.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Clean,
    Findings,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(Outcome::Clean) => ExitCode::SUCCESS,
        Ok(Outcome::Findings) => ExitCode::from(1),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn dispatch(cli: Cli) -> Result<Outcome, anyhow::Error> {
    let config = ShadowfuzzConfig::load_or_default(cli.config.as_deref())?;
    match cli.command {
        Command::Generate {
            schema,
            strategy,
            count,
            seed,
            out,
            seeds,
            grammar,
        } => cmd_generate(&config, &schema, strategy, count, seed, &out, seeds, grammar),
        Command::Run {
            test_dir,
            timeout_ms,
            report,
            corpus,
            minimize,
            schema,
        } => cmd_run(&config, &test_dir, timeout_ms, report, corpus, minimize, schema),
        Command::Minimize {
            test,
            schema,
            out,
            timeout_ms,
        } => cmd_minimize(&config, &test, schema, out, timeout_ms),
        Command::Replay {
            corpus_dir,
            report,
            timeout_ms,
        } => cmd_replay(&config, &corpus_dir, report, timeout_ms),
        Command::Prune {
            corpus_dir,
            signature,
        } => {
            let mut corpus = CorpusManager::open(&corpus_dir)?;
            let entry = corpus.prune(&signature)?;
            println!("pruned {} ({})", entry.signature, entry.failure_class);
            Ok(Outcome::Clean)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_generate(
    config: &ShadowfuzzConfig,
    schema_path: &Path,
    strategy: StrategyKind,
    count: usize,
    seed: u64,
    out: &Path,
    seeds: Vec<PathBuf>,
    grammar: Option<PathBuf>,
) -> Result<Outcome, anyhow::Error> {
    let schema = Schema::load_from_file(schema_path)?;
    let schema_source = std::fs::canonicalize(schema_path)
        .with_context(|| format!("resolving schema path {}", schema_path.display()))?;
    let mut generator = Generator::new(&schema)
        .with_schema_source(schema_source)
        .with_render(config.render.clone())
        .with_grammar_depth(config.generator.grammar_max_depth);

    if let Some(path) = grammar.as_ref().or(config.generator.grammar.as_ref()) {
        generator = generator.with_grammar(Grammar::load_from_file(path)?);
    }
    if strategy == StrategyKind::Mutation {
        let mut seed_paths = seeds;
        seed_paths.extend(config.generator.seed_paths.iter().cloned());
        generator = generator.with_seeds(corpus::load_seed_programs(&seed_paths)?);
    }

    let generation = generator.generate(strategy, count, seed)?;
    for warning in &generation.warnings {
        eprintln!("warning: {warning}");
    }
    for test in &generation.tests {
        test.save_to_dir(out)?;
    }
    println!("generated {} tests into {}", generation.tests.len(), out.display());
    Ok(Outcome::Clean)
}

/// Schema given on the command line, else the one a test was generated from.
fn schema_for(explicit: Option<&Schema>, test: &GeneratedTest) -> Result<Option<Schema>, anyhow::Error> {
    if let Some(schema) = explicit {
        return Ok(Some(schema.clone()));
    }
    let Some(source) = test.schema_ref.as_ref().and_then(|r| r.source.as_ref()) else {
        return Ok(None);
    };
    let schema = Schema::load_from_file(source)
        .with_context(|| format!("loading schema recorded by test '{}'", test.id))?;
    if test.schema_ref.as_ref().is_some_and(|r| !r.matches(&schema)) {
        warn!(test_id = %test.id, schema = ?source, "schema changed since the test was generated");
    }
    Ok(Some(schema))
}

fn minimize_test(
    config: &ShadowfuzzConfig,
    oracle: &dyn Oracle,
    policy: TimeoutPolicy,
    schema: Option<&Schema>,
    test: &GeneratedTest,
) -> Result<Minimized, anyhow::Error> {
    let minimized = Minimizer::new(oracle, schema)
        .with_render(config.render.clone())
        .with_policy(policy)
        .with_max_attempts(config.minimizer.max_attempts)
        .minimize(test)?;
    if minimized.budget_exceeded {
        warn!(test_id = %test.id, attempts = minimized.attempts, "minimization budget exceeded");
    }
    Ok(minimized)
}

struct Examined {
    test_id: String,
    verdict: Verdict,
    minimized: Option<(usize, usize)>,
    signature: Option<String>,
    notes: Vec<String>,
}

/// What `run` does with each failing test.
struct RunOptions<'a> {
    policy: TimeoutPolicy,
    minimize: bool,
    explicit_schema: Option<&'a Schema>,
    corpus: Option<&'a Mutex<CorpusManager>>,
}

/// Examines one test. Only harness faults are errors; a failure that cannot
/// be minimized or recorded is still reported, with a note saying why.
fn examine_one(
    config: &ShadowfuzzConfig,
    oracle: &dyn Oracle,
    options: &RunOptions<'_>,
    test: GeneratedTest,
) -> Result<Examined, anyhow::Error> {
    let verdict = oracle.examine_test(&test, &options.policy)?;
    let mut examined = Examined {
        test_id: test.id.clone(),
        verdict,
        minimized: None,
        signature: None,
        notes: Vec::new(),
    };
    let Some(class) = examined.verdict.class else {
        return Ok(examined);
    };
    info!(test_id = %test.id, class = %class, "failure detected");

    let mut reproduction = test;
    let mut recorded_class = class;
    if options.minimize {
        let attempt = schema_for(options.explicit_schema, &reproduction)
            .and_then(|schema| minimize_test(config, oracle, options.policy, schema.as_ref(), &reproduction));
        match attempt {
            Ok(minimized) => {
                examined.minimized = Some((minimized.original_len, minimized.minimal_len));
                recorded_class = minimized.class;
                reproduction = minimized.test;
            }
            Err(err) => {
                warn!(test_id = %reproduction.id, error = %format!("{err:#}"), "keeping unminimized test");
                examined.notes.push(format!("not minimized: {err:#}"));
            }
        }
    }
    if let Some(corpus) = options.corpus {
        let recorded = corpus
            .lock()
            .map_err(|_| anyhow::anyhow!("corpus lock poisoned"))
            .and_then(|mut corpus| Ok(corpus.record(&reproduction, recorded_class)?));
        match recorded {
            Ok(entry) => examined.signature = Some(entry.signature),
            Err(err) => {
                warn!(test_id = %reproduction.id, error = %format!("{err:#}"), "failed to record corpus entry");
                examined.notes.push(format!("not recorded: {err:#}"));
            }
        }
    }
    Ok(examined)
}

fn run_tests(
    config: &ShadowfuzzConfig,
    oracle: &dyn Oracle,
    options: &RunOptions<'_>,
    tests: Vec<GeneratedTest>,
) -> Result<RunReport, anyhow::Error> {
    info!(tests = tests.len(), threads = config.fuzzer.threads, "starting run");
    let start = Instant::now();
    let results = run_pool(tests, config.fuzzer.threads, |test| {
        examine_one(config, oracle, options, test)
    });

    let mut run_report = RunReport::default();
    for result in results {
        let examined = result?;
        if let Some(finding) = run_report.add(&examined.test_id, &examined.verdict) {
            finding.minimized = examined.minimized;
            finding.signature = examined.signature;
            finding.notes = examined.notes;
        }
    }
    info!(
        elapsed = ?start.elapsed(),
        passed = run_report.passed,
        failed = run_report.failed,
        "run finished"
    );
    Ok(run_report)
}

fn cmd_run(
    config: &ShadowfuzzConfig,
    test_dir: &Path,
    timeout_ms: Option<u64>,
    format: ReportFormat,
    corpus_dir: Option<PathBuf>,
    minimize: bool,
    schema_path: Option<PathBuf>,
) -> Result<Outcome, anyhow::Error> {
    let tests = testcase::load_dir(test_dir)?;
    let oracle = config.build_oracle()?;
    let explicit_schema = schema_path.as_deref().map(Schema::load_from_file).transpose()?;
    let corpus = corpus_dir.map(CorpusManager::open).transpose()?.map(Mutex::new);
    let options = RunOptions {
        policy: config.timeout_policy(timeout_ms),
        minimize,
        explicit_schema: explicit_schema.as_ref(),
        corpus: corpus.as_ref(),
    };

    let run_report = run_tests(config, oracle.as_ref(), &options, tests)?;
    print!("{}", run_report.render(format)?);
    Ok(if run_report.has_failures() {
        Outcome::Findings
    } else {
        Outcome::Clean
    })
}

fn cmd_minimize(
    config: &ShadowfuzzConfig,
    test_path: &Path,
    schema_path: Option<PathBuf>,
    out: Option<PathBuf>,
    timeout_ms: Option<u64>,
) -> Result<Outcome, anyhow::Error> {
    let test = GeneratedTest::load_from_file(test_path)?;
    let explicit_schema = schema_path.as_deref().map(Schema::load_from_file).transpose()?;
    let schema = schema_for(explicit_schema.as_ref(), &test)?;
    let oracle = config.build_oracle()?;
    let minimized = minimize_test(
        config,
        oracle.as_ref(),
        config.timeout_policy(timeout_ms),
        schema.as_ref(),
        &test,
    )?;

    let out = out.unwrap_or_else(|| test_path.with_extension("min.json"));
    std::fs::write(&out, minimized.test.to_json()?)
        .with_context(|| format!("writing minimized test to {}", out.display()))?;
    println!(
        "{}: {} reduced {} -> {} in {} attempts{}; written to {}",
        test.id,
        minimized.class,
        minimized.original_len,
        minimized.minimal_len,
        minimized.attempts,
        if minimized.budget_exceeded { " (budget exceeded)" } else { "" },
        out.display()
    );
    Ok(Outcome::Clean)
}

fn cmd_replay(
    config: &ShadowfuzzConfig,
    corpus_dir: &Path,
    format: ReportFormat,
    timeout_ms: Option<u64>,
) -> Result<Outcome, anyhow::Error> {
    let mut corpus = CorpusManager::open(corpus_dir)?;
    let oracle = config.build_oracle()?;
    let replay = corpus.replay_all(oracle.as_ref(), &config.timeout_policy(timeout_ms), config.fuzzer.threads)?;
    print!("{}", report::render_replay(&replay, format)?);
    Ok(if replay.has_regressions() {
        Outcome::Findings
    } else {
        Outcome::Clean
    })
}
