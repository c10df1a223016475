//! Fixed pool of worker threads running trainer jobs.
//!
//! Jobs are handed over a rendezvous channel, so a job is only taken when a
//! worker is idle and at most `workers` trainers ever run at once. Each
//! worker grows and remaps the subtree for its job and reports back; the
//! main tree is only ever touched by the thread that owns it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::features::FeatureSchema;
use crate::splice::remap_local_indices;
use crate::tree::Arena;
use crate::wagon::read_trainer_tree_file;

use super::job::RefinementJob;
use super::trainer::SubtreeTrainer;

/// Message from a worker to the orchestrator.
#[derive(Debug)]
pub(crate) struct JobReport {
    pub job: RefinementJob,
    pub outcome: JobOutcome,
}

#[derive(Debug)]
pub(crate) enum JobOutcome {
    /// The trainer ran; on success the subtree already holds global indices.
    Finished { subtree: Result<Arena>, elapsed: Duration },
    /// Received after the pass was aborted.
    Skipped,
}

/// Shared, read-only state of one worker.
#[derive(Clone, Copy)]
pub(crate) struct WorkerContext<'a> {
    pub trainer: &'a dyn SubtreeTrainer,
    pub schema: &'a FeatureSchema,
    pub abort: &'a AtomicBool,
}

/// Runs jobs until the job channel is closed.
///
/// A failing worker raises `abort` before reporting, so every job received
/// afterwards, by any worker, is skipped without launching the trainer.
pub(crate) fn worker_loop(
    slot: usize,
    ctx: WorkerContext<'_>,
    jobs: Arc<Mutex<Receiver<RefinementJob>>>,
    reports: Sender<JobReport>,
) {
    loop {
        let next = {
            let guard = match jobs.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.recv()
        };
        let Ok(job) = next else { break };

        if ctx.abort.load(Ordering::SeqCst) {
            tracing::debug!(slot, job = job.id, "pass aborted, skipping job");
            if reports.send(JobReport { job, outcome: JobOutcome::Skipped }).is_err() {
                break;
            }
            continue;
        }

        tracing::info!(slot, job = job.id, units = job.local_to_global.len(), "running trainer");
        let started = Instant::now();
        let subtree = run_job(&job, &ctx);
        let elapsed = started.elapsed();
        if subtree.is_err() {
            ctx.abort.store(true, Ordering::SeqCst);
        }
        tracing::debug!(slot, job = job.id, ok = subtree.is_ok(), elapsed_ms = elapsed.as_millis() as u64, "trainer done");
        if reports.send(JobReport { job, outcome: JobOutcome::Finished { subtree, elapsed } }).is_err() {
            break;
        }
    }
}

fn run_job(job: &RefinementJob, ctx: &WorkerContext<'_>) -> Result<Arena> {
    ctx.trainer.train(&job.invocation)?;
    let mut subtree = read_trainer_tree_file(&job.invocation.output, ctx.schema, job.id)?;
    remap_local_indices(&mut subtree, &job.local_to_global, job.id)?;
    Ok(subtree)
}
