//! Job execution callback.
//!
//! The worker loop never loads job handlers itself. It hands each decoded
//! job to a [`JobExecutor`] and acts on the four-way [`ExecutionOutcome`].

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::job::QueuedJob;

/// Exit code a [`CommandExecutor`] program uses to request a retry
/// (`EX_TEMPFAIL`).
pub const RETRY_EXIT_CODE: i32 = 75;

/// Result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    /// Re-enqueue with an incremented fail count.
    Retry(String),
    /// Re-enqueue after `delay` without counting a failure.
    Reschedule { error: String, delay: Duration },
    /// Give up.
    Fail(String),
}

impl ExecutionOutcome {
    /// Metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success => "success",
            ExecutionOutcome::Retry(_) => "retry",
            ExecutionOutcome::Reschedule { .. } => "reschedule",
            ExecutionOutcome::Fail(_) => "fail",
        }
    }
}

/// Runs a job.
///
/// Called on a separate task; a panic is treated as `Fail`.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    async fn execute(&self, job: &QueuedJob) -> ExecutionOutcome;
}

/// Runs the job class as an external program found in a fixed directory.
///
/// The queued job JSON is written to the program's stdin and its
/// environment overrides are applied. Exit code 0 is success,
/// [`RETRY_EXIT_CODE`] a retry, anything else a failure. A class that is
/// not a plain file name fails without running anything.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program_dir: PathBuf,
}

impl CommandExecutor {
    pub fn new(program_dir: impl Into<PathBuf>) -> Self {
        Self {
            program_dir: program_dir.into(),
        }
    }

    /// Program for `class`, which must name a single entry of the program
    /// directory.
    fn program(&self, class: &str) -> Result<PathBuf, String> {
        let mut components = Path::new(class).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) if !class.contains(['/', '\\']) => {
                Ok(self.program_dir.join(name))
            }
            _ => Err(format!("job class '{class}' is not a program name")),
        }
    }

    async fn run(
        &self,
        program: &Path,
        job: &QueuedJob,
    ) -> std::io::Result<std::process::ExitStatus> {
        let payload = serde_json::to_vec(job)?;

        let mut command = Command::new(program);
        command
            .envs(&job.job.environment)
            .env("JOBFORGE_JOB_ID", &job.id)
            .env("JOBFORGE_FAIL_COUNT", job.job.fail_count.to_string())
            .stdin(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &job.job.include_path {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
        }
        child.wait().await
    }
}

#[async_trait]
impl JobExecutor for CommandExecutor {
    async fn execute(&self, job: &QueuedJob) -> ExecutionOutcome {
        let program = match self.program(&job.job.class) {
            Ok(program) => program,
            Err(reason) => {
                warn!(job_id = %job.id, class = %job.job.class, "Refusing to run job class");
                return ExecutionOutcome::Fail(reason);
            }
        };
        match self.run(&program, job).await {
            Ok(status) => {
                debug!(job_id = %job.id, status = %status, "Job program exited");
                match status.code() {
                    Some(0) => ExecutionOutcome::Success,
                    Some(RETRY_EXIT_CODE) => {
                        ExecutionOutcome::Retry(format!("program requested retry ({status})"))
                    }
                    _ => ExecutionOutcome::Fail(format!("program failed ({status})")),
                }
            }
            Err(e) => ExecutionOutcome::Fail(format!("failed to run '{}': {e}", job.job.class)),
        }
    }
}
