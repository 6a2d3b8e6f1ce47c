//! Command-line interface for the `stagehand` binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::config::JobsConfig;
use crate::jobs::{ArgValue, Job, JobIdAllocator, JobStatus, RawArgs};
use crate::process::ProcessState;
use crate::runner::{CommandExecutor, JobRunner, RunOutcome, RunReport};

#[derive(Parser, Debug)]
#[command(name = "stagehand", version, about = "Persistent job queue for step-based media processing")]
pub struct Cli {
    /// Job store root (overrides STAGEHAND_JOBS_PATH).
    #[arg(long, global = true)]
    pub jobs_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create an empty drafted job.
    Create {
        id: String,
    },

    /// Append a step to a drafted job.
    AddStep {
        id: String,

        /// Step arguments as key=value pairs.
        #[arg(required = true, value_parser = parse_key_value)]
        args: Vec<(String, ArgValue)>,
    },

    /// Queue a drafted job for running.
    Submit {
        id: String,
    },

    /// List jobs, oldest first.
    List {
        /// Only show jobs in this status.
        #[arg(long)]
        status: Option<JobStatus>,
    },

    /// Print a job record as JSON.
    Show {
        id: String,
    },

    /// Suggest an unused job id.
    SuggestId {
        /// Id prefix (defaults to STAGEHAND_JOB_PREFIX).
        prefix: Option<String>,
    },

    /// Run one queued job, one process per step.
    Run {
        id: String,

        /// Program invoked for each step.
        #[arg(long)]
        command: PathBuf,

        /// Extra arguments placed before the step flags.
        #[arg(last = true)]
        command_args: Vec<String>,
    },

    /// Run every queued job, oldest first.
    RunQueued {
        /// Program invoked for each step.
        #[arg(long)]
        command: PathBuf,

        /// Extra arguments placed before the step flags.
        #[arg(last = true)]
        command_args: Vec<String>,
    },

    /// Mark jobs left processing by a crashed run as failed.
    Recover,
}

/// Parse a `key=value` step argument.
fn parse_key_value(raw: &str) -> Result<(String, ArgValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("missing key in '{raw}'"));
    }
    Ok((key.to_string(), ArgValue::parse_loose(value)))
}

/// Execute a parsed command line.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = JobsConfig::from_env()?;
    if let Some(path) = cli.jobs_path {
        config.jobs_path = path;
    }

    let runner = JobRunner::open(&config, Arc::new(ProcessState::new()))
        .with_context(|| format!("opening job store at {}", config.jobs_path.display()))?;
    let manager = Arc::clone(runner.manager());

    match cli.command {
        Command::Create { id } => {
            let job = manager.create_job(&id)?;
            println!("Created job {}", job.id);
        }
        Command::AddStep { id, args } => {
            let args: RawArgs = args.into_iter().collect();
            let step = manager.add_step(&id, args)?;
            println!("Added step {} ({}) to job {id}", step.index, step.kind);
        }
        Command::Submit { id } => {
            let job = manager.submit_job(&id)?;
            println!("Queued job {} with {} step(s)", job.id, job.step_count());
        }
        Command::List { status } => {
            let jobs = match status {
                Some(status) => manager.find_jobs_by_status(status),
                None => manager.list_jobs(),
            };
            print_jobs(&jobs);
        }
        Command::Show { id } => {
            let job = manager
                .get_job(&id)
                .with_context(|| format!("job {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::SuggestId { prefix } => {
            let allocator = JobIdAllocator::new(Arc::clone(manager.store()));
            let prefix = prefix.unwrap_or(config.job_prefix);
            println!("{}", allocator.suggest_job_id(&prefix)?);
        }
        Command::Run {
            id,
            command,
            command_args,
        } => {
            stop_on_ctrl_c(&runner);
            let executor = CommandExecutor::new(command).with_args(command_args);
            let report = runner.run_job(&id, &executor).await?;
            print_report(&report, manager.get_job(&id).as_ref());
            if !report.is_success() {
                anyhow::bail!("job {id} did not complete");
            }
        }
        Command::RunQueued {
            command,
            command_args,
        } => {
            stop_on_ctrl_c(&runner);
            let executor = CommandExecutor::new(command).with_args(command_args);
            let reports = runner.run_queued(&executor).await?;
            if reports.is_empty() {
                println!("No queued jobs");
            }
            for report in &reports {
                print_report(report, manager.get_job(&report.job_id).as_ref());
            }
            let failed = reports.iter().filter(|r| !r.is_success()).count();
            if failed > 0 {
                anyhow::bail!("{failed} of {} job(s) did not complete", reports.len());
            }
        }
        Command::Recover => {
            let recovered = manager.recover_interrupted()?;
            if recovered.is_empty() {
                println!("No interrupted jobs");
            }
            for id in recovered {
                println!("Marked {id} failed (interrupted)");
            }
        }
    }

    Ok(())
}

/// Request a stop on the runner's processing state when Ctrl-C arrives.
fn stop_on_ctrl_c(runner: &JobRunner) {
    let on_signal = Arc::clone(runner.process());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Stopping after the current step...");
            on_signal.stop();
        }
    });
}

fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs");
        return;
    }
    println!("{:<40} {:<11} {:>5}  CREATED", "ID", "STATUS", "STEPS");
    for job in jobs {
        println!(
            "{:<40} {:<11} {:>5}  {}",
            job.id,
            job.status,
            job.step_count(),
            job.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn print_report(report: &RunReport, job: Option<&Job>) {
    let progress = job
        .map(|job| format!(" ({}/{} steps succeeded)", job.succeeded_steps(), job.step_count()))
        .unwrap_or_default();
    match &report.outcome {
        RunOutcome::Completed => println!("{}: completed{progress}", report.job_id),
        RunOutcome::StepFailed { index, detail } => println!(
            "{}: step {index} failed: {}{progress}",
            report.job_id,
            detail.as_deref().unwrap_or("no detail")
        ),
        RunOutcome::Stopped { next_index } => {
            println!("{}: stopped before step {next_index}{progress}", report.job_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_add_step_arguments() {
        let cli = Cli::try_parse_from([
            "stagehand",
            "add-step",
            "j1",
            "output_path=/tmp/a.png",
            "scale=2",
            "keep_fps=true",
        ])
        .unwrap();
        let Command::AddStep { id, args } = cli.command else {
            panic!("expected add-step");
        };
        assert_eq!(id, "j1");
        assert_eq!(
            args,
            vec![
                ("output_path".to_string(), ArgValue::from("/tmp/a.png")),
                ("scale".to_string(), ArgValue::Number(2.0)),
                ("keep_fps".to_string(), ArgValue::Bool(true)),
            ]
        );
    }

    #[test]
    fn rejects_malformed_key_value() {
        assert!(parse_key_value("no-equals").is_err());
        assert!(parse_key_value("=value").is_err());
        assert_eq!(
            parse_key_value("model=a=b").unwrap(),
            ("model".to_string(), ArgValue::from("a=b"))
        );
    }

    #[test]
    fn parses_status_filter_and_global_path() {
        let cli = Cli::try_parse_from([
            "stagehand",
            "list",
            "--status",
            "queued",
            "--jobs-path",
            "/srv/jobs",
        ])
        .unwrap();
        assert_eq!(cli.jobs_path, Some(PathBuf::from("/srv/jobs")));
        assert!(matches!(
            cli.command,
            Command::List {
                status: Some(JobStatus::Queued)
            }
        ));
    }

    #[test]
    fn run_takes_trailing_command_args() {
        let cli = Cli::try_parse_from([
            "stagehand",
            "run",
            "j1",
            "--command",
            "ffmpeg-wrapper",
            "--",
            "--headless",
        ])
        .unwrap();
        let Command::Run { command_args, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(command_args, vec!["--headless"]);
    }
}
