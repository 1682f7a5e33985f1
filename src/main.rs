use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use task_orchestrator::config::{OrchestratorConfig, SandboxConfig, ShellConfig};
use task_orchestrator::events::{EventBus, LifecycleEvent};
use task_orchestrator::scheduler::{
    Job, JobDefinition, JobFilter, JobId, JobState, JobStore, RetryPolicy,
};
use task_orchestrator::shutdown::wait_for_signal;
use task_orchestrator::worker::ShellExecutor;
use task_orchestrator::Orchestrator;

#[derive(Parser, Debug)]
#[command(name = "task-orchestrator")]
#[command(version)]
#[command(about = "A single-node job scheduler with retries, backoff and dependencies")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run every job in a job file to completion
    Run(RunArgs),

    /// Show jobs from a saved state file
    Inspect(InspectArgs),
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// JSON file with an array of job entries
    #[arg(long, short = 'j')]
    jobs: PathBuf,

    /// Number of worker slots
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Number of dispatcher loops
    #[arg(long, default_value = "1")]
    dispatchers: usize,

    /// Default attempts per job when the file does not set max_attempts
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Default timeout per attempt when the file does not set timeout_ms
    #[arg(long, default_value = "60000")]
    timeout_ms: u64,

    /// Base retry delay; doubled after each failed attempt
    #[arg(long, default_value = "500")]
    base_delay_ms: u64,

    /// Upper bound on the retry delay
    #[arg(long, default_value = "30000")]
    max_delay_ms: u64,

    /// Random delay added on top of each retry delay
    #[arg(long, default_value = "100")]
    jitter_ms: u64,

    /// How long cancelled attempts get to stop before their slot is reclaimed
    #[arg(long, default_value = "5000")]
    grace_ms: u64,

    /// Snapshot file: loaded on start if present, written on shutdown
    #[arg(long)]
    state: Option<PathBuf>,

    /// Run commands in this Docker image instead of the host shell
    #[arg(long)]
    image: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

// =============================================================================
// Inspect Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Snapshot file written by `run --state`
    #[arg(long)]
    state: PathBuf,

    /// Show a single job with its attempt history
    #[arg(long)]
    job: Option<String>,

    /// Only list jobs in this state
    #[arg(long)]
    status: Option<StateArg>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StateArg {
    Pending,
    Running,
    Succeeded,
    Failed,
    Exhausted,
    Cancelled,
}

impl From<StateArg> for JobState {
    fn from(arg: StateArg) -> Self {
        match arg {
            StateArg::Pending => JobState::Pending,
            StateArg::Running => JobState::Running,
            StateArg::Succeeded => JobState::Succeeded,
            StateArg::Failed => JobState::Failed,
            StateArg::Exhausted => JobState::Exhausted,
            StateArg::Cancelled => JobState::Cancelled,
        }
    }
}

// =============================================================================
// Job File Format
// =============================================================================

/// One job in a job file. Dependencies refer to earlier entries by name.
#[derive(Debug, Deserialize)]
struct JobFileEntry {
    name: String,
    command: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    priority: i32,
    max_attempts: Option<u32>,
    timeout_ms: Option<u64>,
    #[serde(default)]
    depends_on: Vec<String>,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSummaryOutput {
    job_id: String,
    name: String,
    state: JobState,
    attempts: u32,
    max_attempts: u32,
    last_error: Option<String>,
}

impl From<&Job> for JobSummaryOutput {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.to_string(),
            name: job.definition.name.clone(),
            state: job.state,
            attempts: job.attempts,
            max_attempts: job.definition.max_attempts,
            last_error: job.last_error.clone(),
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

fn build_definitions(
    entries: Vec<JobFileEntry>,
    config: &OrchestratorConfig,
) -> Result<Vec<(String, JobDefinition, Vec<String>)>, Box<dyn std::error::Error>> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        if !seen.insert(entry.name.clone()) {
            return Err(format!("duplicate job name '{}'", entry.name).into());
        }
        for dep in &entry.depends_on {
            if !seen.contains(dep) || dep == &entry.name {
                return Err(format!(
                    "job '{}' depends on '{}', which must appear earlier in the file",
                    entry.name, dep
                )
                .into());
            }
        }
        let definition = JobDefinition::new(entry.command)
            .with_name(entry.name.clone())
            .with_payload(entry.payload)
            .with_priority(entry.priority)
            .with_max_attempts(entry.max_attempts.unwrap_or(config.default_max_attempts));
        let definition = JobDefinition {
            timeout_ms: entry.timeout_ms.unwrap_or(config.default_timeout_ms),
            ..definition
        };
        definition
            .validate()
            .map_err(|e| format!("job '{}': {}", entry.name, e))?;
        out.push((entry.name, definition, entry.depends_on));
    }
    Ok(out)
}

fn print_event(event: &LifecycleEvent, labels: &HashMap<JobId, String>, format: &OutputFormat) {
    match format {
        OutputFormat::Json => match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!(error = %e, "Failed to serialize event"),
        },
        OutputFormat::Table => {
            let label = labels
                .get(&event.job_id)
                .cloned()
                .unwrap_or_else(|| event.job_id.to_string());
            println!(
                "{:<12} {:<24} {:<10} {:<8} {}",
                event.at.format("%H:%M:%S%.3f"),
                label,
                event.kind.to_string(),
                event.attempt,
                event.error.as_deref().map(first_line).unwrap_or("")
            );
        }
    }
}

fn print_jobs(jobs: &[Job], format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            let output: Vec<JobSummaryOutput> = jobs.iter().map(JobSummaryOutput::from).collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<38} {:<20} {:<10} {:<9} LAST ERROR",
                "JOB ID", "NAME", "STATE", "ATTEMPTS"
            );
            println!("{}", "-".repeat(96));
            for job in jobs {
                println!(
                    "{:<38} {:<20} {:<10} {:<9} {}",
                    job.id.to_string(),
                    job.definition.name,
                    job.state.to_string(),
                    format!("{}/{}", job.attempts, job.definition.max_attempts),
                    job.last_error.as_deref().map(first_line).unwrap_or("")
                );
            }
        }
    }
    Ok(())
}

fn print_job_detail(job: &Job, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(job)?),
        OutputFormat::Table => {
            println!("Job ID:       {}", job.id);
            println!("Name:         {}", job.definition.name);
            println!("Command:      {}", job.definition.command);
            println!("State:        {}", job.state);
            println!(
                "Attempts:     {}/{}",
                job.attempts, job.definition.max_attempts
            );
            println!("Submitted:    {}", job.submitted_at);
            if let Some(finished) = job.finished_at {
                println!("Finished:     {}", finished);
            }
            if let Some(attempt) = job.last_attempt() {
                println!("Last Outcome: {} (attempt {})", attempt.outcome, attempt.number);
            }
            if let Some(ref error) = job.last_error {
                println!("Last Error:");
                for line in error.lines() {
                    println!("  {}", line);
                }
            }
            if !job.history.is_empty() {
                println!();
                println!("{:<8} {:<10} {:<10} ERROR", "ATTEMPT", "OUTCOME", "MILLIS");
                println!("{}", "-".repeat(60));
                for attempt in &job.history {
                    let millis = (attempt.finished_at - attempt.started_at).num_milliseconds();
                    println!(
                        "{:<8} {:<10} {:<10} {}",
                        attempt.number,
                        attempt.outcome.to_string(),
                        millis,
                        attempt.error.as_deref().map(first_line).unwrap_or("")
                    );
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_jobs(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let data = tokio::fs::read(&args.jobs).await?;
    let entries: Vec<JobFileEntry> = serde_json::from_slice(&data)?;

    let mut config = OrchestratorConfig::new(args.workers)
        .with_dispatchers(args.dispatchers)
        .with_retry(RetryPolicy::new(
            args.base_delay_ms,
            args.max_delay_ms,
            args.jitter_ms,
        ));
    config.shutdown_grace_ms = args.grace_ms;
    config.default_max_attempts = args.max_attempts;
    config.default_timeout_ms = args.timeout_ms;
    config.state_path = args.state.clone();

    let shell = match args.image {
        Some(image) => ShellConfig::sandboxed(SandboxConfig {
            image,
            ..SandboxConfig::default()
        }),
        None => ShellConfig::default(),
    };

    let definitions = build_definitions(entries, &config)?;

    tracing::info!(
        jobs = definitions.len(),
        workers = config.worker_capacity,
        sandbox = ?shell.sandbox.as_ref().map(|s| s.image.clone()),
        state = ?config.state_path,
        "Starting task-orchestrator"
    );

    let orchestrator = Orchestrator::new(config, Arc::new(ShellExecutor::new(shell)))?;
    let mut events = orchestrator.subscribe();
    orchestrator.start()?;

    let mut ids: HashMap<String, JobId> = HashMap::new();
    let mut labels: HashMap<JobId, String> = orchestrator
        .list(&JobFilter::default())
        .iter()
        .map(|job| (job.id, job.label()))
        .collect();

    for (name, mut definition, depends_on) in definitions {
        for dep in depends_on {
            if let Some(id) = ids.get(&dep) {
                definition = definition.depends_on(*id);
            }
        }
        let job_id = match orchestrator.submit(definition) {
            Ok(job_id) => job_id,
            Err(e) => {
                tracing::error!(job = %name, error = %e, "Submission failed, stopping");
                orchestrator.shutdown().await?;
                return Err(format!("job '{}': {}", name, e).into());
            }
        };
        ids.insert(name.clone(), job_id);
        labels.insert(job_id, name);
    }

    let mut outstanding: HashSet<JobId> = orchestrator
        .list(&JobFilter::default())
        .into_iter()
        .filter(|job| !job.state.is_terminal())
        .map(|job| job.id)
        .collect();

    if let OutputFormat::Table = args.output {
        println!(
            "{:<12} {:<24} {:<10} {:<8} ERROR",
            "TIME", "JOB", "EVENT", "ATTEMPT"
        );
        println!("{}", "-".repeat(78));
    }

    let signal = wait_for_signal();
    tokio::pin!(signal);

    while !outstanding.is_empty() {
        tokio::select! {
            received = &mut signal => {
                received?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event, &labels, &args.output);
                    if event.to.is_terminal() {
                        outstanding.remove(&event.job_id);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event output lagged, re-reading job states");
                    outstanding.retain(|id| {
                        orchestrator
                            .get(id)
                            .map(|job| !job.state.is_terminal())
                            .unwrap_or(false)
                    });
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    orchestrator.shutdown().await?;

    let jobs = orchestrator.list(&JobFilter::default());
    if let OutputFormat::Table = args.output {
        println!();
        print_jobs(&jobs, &args.output)?;
    }

    let failed = jobs
        .iter()
        .filter(|job| job.state != JobState::Succeeded)
        .count();
    if failed > 0 {
        eprintln!("{} of {} jobs did not succeed", failed, jobs.len());
        std::process::exit(1);
    }
    Ok(())
}

fn inspect_state(args: InspectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = JobStore::load(&args.state, EventBus::default(), usize::MAX)?;

    if let Some(job_id) = args.job {
        let job_id: JobId = job_id.parse()?;
        let job = store.get(&job_id)?;
        return print_job_detail(&job, &args.output);
    }

    let filter = JobFilter {
        state: args.status.map(JobState::from),
        ..JobFilter::default()
    };
    print_jobs(&store.list(&filter), &args.output)
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Commands::Run(run_args) => run_jobs(run_args).await?,
        Commands::Inspect(inspect_args) => inspect_state(inspect_args)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(json: &str) -> Vec<JobFileEntry> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_build_definitions_applies_defaults() {
        let config = OrchestratorConfig::default();
        let defs = build_definitions(
            entries(r#"[{"name": "a", "command": "true"},
                        {"name": "b", "command": "true", "max_attempts": 5, "depends_on": ["a"]}]"#),
            &config,
        )
        .unwrap();

        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].1.max_attempts, config.default_max_attempts);
        assert_eq!(defs[0].1.timeout_ms, config.default_timeout_ms);
        assert_eq!(defs[1].1.max_attempts, 5);
        assert_eq!(defs[1].2, vec!["a".to_string()]);
    }

    #[test]
    fn test_build_definitions_rejects_invalid_job_before_submission() {
        let config = OrchestratorConfig::default();
        let result = build_definitions(
            entries(r#"[{"name": "ok", "command": "true"},
                        {"name": "bad", "command": "true", "max_attempts": 0}]"#),
            &config,
        );
        let err = result.unwrap_err().to_string();
        assert!(err.contains("bad"), "{err}");
        assert!(err.contains("max_attempts"), "{err}");
    }

    #[test]
    fn test_build_definitions_rejects_unknown_dependency() {
        let config = OrchestratorConfig::default();
        let result = build_definitions(
            entries(r#"[{"name": "a", "command": "true", "depends_on": ["later"]},
                        {"name": "later", "command": "true"}]"#),
            &config,
        );
        assert!(result.is_err());
    }
}
