//! One refinement job: the leaf it targets, the mapping from the trainer's
//! local indices back to global unit indices, and the files it uses.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tree::NodeId;

/// Name of the feature description file shared by every job of a pass.
pub const DESCRIPTION_FILE: &str = "wagon.desc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Handed out after the pass was aborted; the trainer never ran.
    Skipped,
}

/// What happened to one job, as reported in the pass summary.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: usize,
    pub leaf: NodeId,
    pub members: usize,
    pub status: JobStatus,
    pub elapsed: Duration,
}

/// Files and parameters of one trainer run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainerInvocation {
    pub id: usize,
    pub description: PathBuf,
    pub features: PathBuf,
    pub distances: PathBuf,
    pub output: PathBuf,
    pub log: PathBuf,
    pub stop: usize,
    pub balance: u32,
}

impl TrainerInvocation {
    /// Per-job files in `work_dir`, suffixed with the job id.
    pub fn new(id: usize, work_dir: &Path, stop: usize, balance: u32) -> Self {
        TrainerInvocation {
            id,
            description: work_dir.join(DESCRIPTION_FILE),
            features: work_dir.join(format!("wagon.feats{}", id)),
            distances: work_dir.join(format!("wagon.distabs{}", id)),
            output: work_dir.join(format!("wagon.cart{}", id)),
            log: work_dir.join(format!("wagon.log{}", id)),
            stop,
            balance,
        }
    }

    /// Command-line arguments of the trainer.
    pub fn args(&self) -> Vec<OsString> {
        vec![
            "-desc".into(),
            self.description.clone().into(),
            "-data".into(),
            self.features.clone().into(),
            "-balance".into(),
            self.balance.to_string().into(),
            "-distmatrix".into(),
            self.distances.clone().into(),
            "-stop".into(),
            self.stop.to_string().into(),
            "-output".into(),
            self.output.clone().into(),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct RefinementJob {
    pub id: usize,
    pub leaf: NodeId,
    /// `local_to_global[i]` is the global index of the unit written on line `i`.
    pub local_to_global: Vec<usize>,
    pub invocation: TrainerInvocation,
}

impl RefinementJob {
    /// Deletes the feature dump and distance matrix unless `keep_files`.
    pub fn cleanup(&self, keep_files: bool) {
        if keep_files {
            return;
        }
        for path in [&self.invocation.features, &self.invocation.distances] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(job = self.id, path = %path.display(), error = %e, "could not delete job file"),
            }
        }
    }
}
