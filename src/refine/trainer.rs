//! The external trainer seam and its subprocess implementation.

use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::process::{Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::RefinementConfig;
use crate::error::{CartError, Result};

use super::job::TrainerInvocation;

/// Number of log lines quoted in a failure message.
const LOG_TAIL_LINES: usize = 10;

/// Grows a subtree for one job. On success the tree has been written to
/// `invocation.output`.
///
/// Called from worker threads, one job per call.
pub trait SubtreeTrainer: Send + Sync {
    fn train(&self, invocation: &TrainerInvocation) -> Result<()>;
}

/// Runs the wagon program as a child process, with stdout and stderr
/// redirected to the job's log file.
#[derive(Debug, Clone)]
pub struct WagonTrainer {
    program: String,
    /// Passed before the job's own arguments.
    leading_args: Vec<String>,
    timeout: Option<Duration>,
    poll_interval: Duration,
}

impl WagonTrainer {
    pub fn new<S: Into<String>>(program: S) -> Self {
        WagonTrainer {
            program: program.into(),
            leading_args: Vec::new(),
            timeout: None,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn from_config(config: &RefinementConfig) -> Self {
        WagonTrainer {
            program: config.trainer_program.clone(),
            leading_args: config.trainer_args.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn failure(&self, job: usize, reason: String) -> CartError {
        CartError::TrainerProcessFailure { job, reason }
    }
}

impl SubtreeTrainer for WagonTrainer {
    fn train(&self, invocation: &TrainerInvocation) -> Result<()> {
        let job = invocation.id;
        // A tree left by an earlier run must not pass for this run's output.
        match fs::remove_file(&invocation.output) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let log = File::create(&invocation.log)?;
        let mut child = Command::new(&self.program)
            .args(&self.leading_args)
            .args(invocation.args())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()
            .map_err(|e| self.failure(job, format!("cannot start '{}': {}", self.program, e)))?;

        let status: ExitStatus = match self.timeout {
            None => child.wait()?,
            Some(limit) => {
                let started = Instant::now();
                loop {
                    if let Some(status) = child.try_wait()? {
                        break status;
                    }
                    if started.elapsed() >= limit {
                        // The process may have exited in between; either way it is gone after wait().
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(self.failure(job, format!("killed after {} s", limit.as_secs_f64())));
                    }
                    thread::sleep(self.poll_interval);
                }
            }
        };

        if !status.success() {
            return Err(self.failure(job, format!("{}; log tail:\n{}", status, log_tail(&invocation.log))));
        }
        if !invocation.output.exists() {
            return Err(self.failure(job, format!("no output file {}", invocation.output.display())));
        }
        Ok(())
    }
}

fn log_tail(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(text) => {
            let lines: Vec<&str> = text.lines().collect();
            lines[lines.len().saturating_sub(LOG_TAIL_LINES)..].join("\n")
        }
        Err(e) => format!("<log unavailable: {}>", e),
    }
}
