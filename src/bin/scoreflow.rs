#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use scoreflow::graph::{self, DependencyGraph};
use scoreflow::orchestrator::{JsonlSnapshotSink, Orchestrator, OrchestratorConfig};
use scoreflow::progress::ProgressTracker;
use scoreflow::question::{AnswerValue, QuestionSet};
use scoreflow::scorer::{OpenAiAdapter, ScorerClient};

#[derive(Parser)]
#[command(name = "scoreflow", version, about = "Questionnaire evaluation harness CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a question set's dependency graph
    Validate {
        #[arg(long)]
        questions: PathBuf,
        /// Emit the full report as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Print dependency levels and a suggested evaluation order
    Order {
        #[arg(long)]
        questions: PathBuf,
    },
    /// Score a set of answers (startup reconciliation against the live scorer)
    Score {
        #[arg(long)]
        questions: PathBuf,
        /// JSON file: map of question id -> answer value
        #[arg(long)]
        answers: PathBuf,
        /// System prompt file; defaults to the built-in prompt
        #[arg(long)]
        prompt: Option<PathBuf>,
        /// Write each committed snapshot as a JSON line to this file
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Validate { questions, json } => {
            let set = QuestionSet::load(&questions)?;
            let graph = DependencyGraph::build(&set.questions);
            let report = graph::validate(&set, &graph);

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "questions: {}  with dependencies: {}  max depth: {}",
                    report.stats.total_questions,
                    report.stats.questions_with_deps,
                    report.stats.max_depth
                );
                for warning in &report.warnings {
                    println!("warning: {warning}");
                }
                for error in &report.errors {
                    println!("error: {error}");
                }
                println!("{}", if report.is_valid() { "VALID" } else { "INVALID" });
            }

            Ok(if report.is_valid() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Order { questions } => {
            let set = QuestionSet::load(&questions)?;
            let graph = DependencyGraph::build(&set.questions);
            let report = graph::validate(&set, &graph);

            match &report.topo_order {
                Some(order) => {
                    for id in order {
                        let level = report.levels.get(id).copied().unwrap_or(0);
                        match set.find(id).and_then(|q| q.cluster_name.as_deref()) {
                            Some(cluster) => println!("{level}\t{id}\t{cluster}"),
                            None => println!("{level}\t{id}"),
                        }
                    }
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("no topological order: the dependency graph has a cycle");
                    for cycle in &report.stats.circular_dependencies {
                        eprintln!("  cycle: {}", cycle.join(" -> "));
                    }
                    Ok(ExitCode::FAILURE)
                }
            }
        }

        Commands::Score {
            questions,
            answers,
            prompt,
            out,
        } => {
            let set = QuestionSet::load(&questions)?;
            let raw_answers = std::fs::read_to_string(&answers)?;
            let answer_map: HashMap<String, AnswerValue> = serde_json::from_str(&raw_answers)?;

            let system_prompt = match prompt {
                Some(path) => std::fs::read_to_string(path)?,
                None => String::new(),
            };

            let adapter = OpenAiAdapter::from_env()?;
            let client = ScorerClient::new(adapter);
            let config = OrchestratorConfig {
                system_prompt,
                ..OrchestratorConfig::default()
            };
            let mut orchestrator =
                Orchestrator::with_config(set, client, ProgressTracker::default(), config);
            if let Some(path) = out {
                orchestrator =
                    orchestrator.with_sink(Arc::new(JsonlSnapshotSink::create(path)?));
            }

            for (id, value) in answer_map {
                // Answers for ids missing from the question set are reported
                // but do not abort the run.
                if let Err(err) = orchestrator.load_answer(&id, value) {
                    eprintln!("warning: {err}");
                }
            }

            let runtime = tokio::runtime::Runtime::new()?;
            let report = runtime.block_on(async {
                orchestrator.schedule_startup_reconciliation();
                orchestrator.run_round().await
            });

            eprintln!(
                "scored: {}  failed: {}  passes: {}",
                report.scored.len(),
                report.failed.len(),
                report.passes
            );
            println!(
                "{}",
                serde_json::to_string_pretty(orchestrator.snapshot().as_ref())?
            );

            Ok(if report.failed.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
