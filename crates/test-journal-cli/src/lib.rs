//! Command surface for driving the test journal from a shell.
//!
//! - [`run_cli`] executes a parsed command line.
//! - [`run_events`] replays a JSON Lines stream of lifecycle notifications
//!   through the listeners enabled by a [`JournalConfig`].

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use test_journal_core::{
    JournalConfig, LifecycleListener, ResultDispatcher, RunSummary, RunTally, TestState,
};
use test_journal_store_sqlite::JournalRecorder;
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "tj")]
#[command(about = "Test lifecycle journal CLI")]
pub struct Cli {
    /// Records test status changes into the job's journal database.
    /// `record` refuses to run without it.
    #[arg(long)]
    journal: bool,

    #[arg(long)]
    job_logdir: PathBuf,

    /// Defaults to a fresh ULID.
    #[arg(long)]
    job_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Run(RunArgs),
    Record {
        #[command(subcommand)]
        command: RecordCommand,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// JSON Lines notification stream; `-` reads stdin.
    #[arg(long, default_value = "-")]
    events: String,
}

#[derive(Debug, Subcommand)]
pub enum RecordCommand {
    Start(RecordStartArgs),
    End(RecordEndArgs),
}

#[derive(Debug, Args)]
pub struct RecordStartArgs {
    #[arg(long)]
    tag: String,
}

#[derive(Debug, Args)]
pub struct RecordEndArgs {
    #[arg(long)]
    tag: String,
    #[arg(long)]
    status: String,
}

/// One line of the notification stream consumed by `tj run`.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    Start { tagged_name: String },
    End { tagged_name: String, status: String },
    EndTests,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct JobContext {
    pub job_logdir: PathBuf,
    pub job_unique_id: String,
}

impl JobContext {
    #[must_use]
    pub fn state(&self, tagged_name: &str, status: Option<&str>) -> TestState {
        TestState {
            job_logdir: self.job_logdir.clone(),
            job_unique_id: self.job_unique_id.clone(),
            tagged_name: tagged_name.to_string(),
            status: status.map(str::to_string),
        }
    }
}

/// Executes the parsed command line.
///
/// # Errors
/// Returns an error when the event stream cannot be read or parsed, or when a
/// listener rejects a notification.
pub fn run_cli(cli: Cli) -> Result<()> {
    let job = JobContext {
        job_logdir: cli.job_logdir,
        job_unique_id: cli.job_id.unwrap_or_else(|| Ulid::new().to_string()),
    };
    let config = JournalConfig {
        enabled: cli.journal,
    };

    match cli.command {
        Command::Run(args) => {
            let summary = if args.events == "-" {
                run_events(io::stdin().lock(), &job, config)?
            } else {
                let file = File::open(&args.events)
                    .with_context(|| format!("failed to open event stream {}", args.events))?;
                run_events(BufReader::new(file), &job, config)?
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Record { command } => run_record(&job, command, config),
    }
}

/// Dispatches every notification in `reader` and finishes the run, calling
/// `end_tests` at end of input when the stream did not.
///
/// # Errors
/// Returns an error on unreadable or malformed lines, events after
/// `end_tests`, or any listener failure.
pub fn run_events<R: BufRead>(
    reader: R,
    job: &JobContext,
    config: JournalConfig,
) -> Result<RunSummary> {
    let mut tally = RunTally::new();
    let mut recorder = config.enabled.then(JournalRecorder::new);

    {
        let mut dispatcher = ResultDispatcher::new();
        dispatcher.register(&mut tally);
        if let Some(recorder) = recorder.as_mut() {
            dispatcher.register(recorder);
        }

        let mut finished = false;
        for (index, line) in reader.lines().enumerate() {
            let line_no = index + 1;
            let line = line.with_context(|| format!("failed to read event line {line_no}"))?;
            if line.trim().is_empty() {
                continue;
            }
            if finished {
                return Err(anyhow!("event on line {line_no} arrives after end_tests"));
            }

            let notification: Notification = serde_json::from_str(&line)
                .with_context(|| format!("invalid notification on line {line_no}"))?;
            match notification {
                Notification::Start { tagged_name } => dispatcher
                    .start_test(&job.state(&tagged_name, None))
                    .with_context(|| format!("failed to record start of {tagged_name}"))?,
                Notification::End {
                    tagged_name,
                    status,
                } => dispatcher
                    .end_test(&job.state(&tagged_name, Some(&status)))
                    .with_context(|| format!("failed to record end of {tagged_name}"))?,
                Notification::EndTests => {
                    dispatcher.end_tests().context("failed to finish run")?;
                    finished = true;
                }
            }
        }

        if !finished {
            tracing::debug!("event stream ended without end_tests; finishing run");
            dispatcher.end_tests().context("failed to finish run")?;
        }
    }

    Ok(tally.summary().clone())
}

fn run_record(job: &JobContext, command: RecordCommand, config: JournalConfig) -> Result<()> {
    if !config.enabled {
        return Err(anyhow!(
            "record writes only to the journal; pass --journal to enable it"
        ));
    }

    let mut recorder = JournalRecorder::new();
    let (tag, action) = match command {
        RecordCommand::Start(args) => {
            recorder
                .start_test(&job.state(&args.tag, None))
                .with_context(|| format!("failed to record start of {}", args.tag))?;
            (args.tag, "STARTED")
        }
        RecordCommand::End(args) => {
            recorder
                .end_test(&job.state(&args.tag, Some(&args.status)))
                .with_context(|| format!("failed to record end of {}", args.tag))?;
            (args.tag, "ENDED")
        }
    };

    let journal = recorder
        .journal_path()
        .map(|path| path.display().to_string())
        .ok_or_else(|| anyhow!("journal was not activated for {tag}"))?;
    recorder.end_tests().context("failed to close journal")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "journal": journal,
            "job_unique_id": job.job_unique_id,
            "tag": tag,
            "action": action,
        }))?
    );
    Ok(())
}
