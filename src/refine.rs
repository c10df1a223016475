//! Refinement of oversized leaves by an external CART trainer.
//!
//! For every leaf larger than the stop size, the orchestrator (the caller's
//! thread) exports the leaf's feature vectors and acoustic distance matrix,
//! hands the job to a fixed pool of workers, and splices each returned
//! subtree into the main tree as the reports come back. The first failure
//! aborts the pass: nothing new is dispatched, jobs already running finish,
//! and successful splices are kept.

mod job;
mod scheduler;
mod trainer;

pub use job::{JobRecord, JobStatus, RefinementJob, TrainerInvocation, DESCRIPTION_FILE};
pub use trainer::{SubtreeTrainer, WagonTrainer};

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, SendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rustc_hash::FxHashSet;

use crate::cepstra::CepstralSource;
use crate::config::RefinementConfig;
use crate::distance::{leaf_distance_matrix, UnitDistance, WeightedFeature};
use crate::error::{CartError, Result};
use crate::features::{Corpus, FeatureSchema, FeatureVector};
use crate::splice::splice_subtree;
use crate::tree::{Arena, NodeId};
use crate::wagon::{write_description, write_distance_matrix, write_feature_vectors};
use scheduler::{worker_loop, JobOutcome, JobReport, WorkerContext};

/// Result of a completed refinement pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefinementSummary {
    pub jobs: Vec<JobRecord>,
    /// Leaves handed in but at or below the stop size.
    pub skipped_small: usize,
    pub spliced: usize,
    pub nodes_before: usize,
    pub nodes_after: usize,
}

/// Bookkeeping of one pass, owned by the orchestrator.
struct PassState {
    records: Vec<JobRecord>,
    first_error: Option<CartError>,
    spliced: usize,
    finished: usize,
    total: usize,
}

impl PassState {
    fn record(&mut self, id: usize, status: JobStatus, elapsed: Duration) {
        if let Some(record) = self.records.iter_mut().find(|r| r.id == id) {
            record.status = status;
            record.elapsed = elapsed;
        }
    }

    fn fail(&mut self, id: usize, error: CartError, abort: &AtomicBool) {
        tracing::error!(job = id, error = %error, "refinement job failed");
        abort.store(true, Ordering::SeqCst);
        self.record(id, JobStatus::Failed, Duration::ZERO);
        if self.first_error.is_none() {
            self.first_error = Some(error);
        }
    }
}

/// Everything a pass produced, including a failure. On failure `summary`
/// still lists every job and the splices that were kept.
#[derive(Debug)]
pub struct RefinementOutcome {
    pub summary: RefinementSummary,
    pub error: Option<CartError>,
}

impl RefinementOutcome {
    pub fn into_result(self) -> Result<RefinementSummary> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.summary),
        }
    }
}

pub struct LeafRefiner {
    config: RefinementConfig,
    progress: Arc<AtomicUsize>,
}

impl LeafRefiner {
    pub fn new(config: RefinementConfig) -> Self {
        LeafRefiner { config, progress: Arc::new(AtomicUsize::new(0)) }
    }

    /// Percentage of jobs finished in the current or last pass.
    pub fn progress(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.progress)
    }

    /// Refines the given leaves of `arena`.
    ///
    /// # Errors
    /// The error of the first job that failed, after in-flight jobs have
    /// drained. Subtrees spliced before that stay in `arena`; use
    /// [`LeafRefiner::run_pass`] to also get the job records of a failed pass.
    pub fn refine(
        &self,
        arena: &mut Arena,
        leaves: &[NodeId],
        corpus: &Corpus,
        cepstra: &dyn CepstralSource,
        trainer: &dyn SubtreeTrainer,
    ) -> Result<RefinementSummary> {
        self.run_pass(arena, leaves, corpus, cepstra, trainer).into_result()
    }

    /// Runs one refinement pass over the given leaves of `arena`.
    ///
    /// Ids listed twice are refined once and ids that are not leaves are
    /// ignored. Leaves of at most `stop` units are left alone. Every other
    /// leaf gets one job; at most `effective_workers()` trainers run at a time.
    pub fn run_pass(
        &self,
        arena: &mut Arena,
        leaves: &[NodeId],
        corpus: &Corpus,
        cepstra: &dyn CepstralSource,
        trainer: &dyn SubtreeTrainer,
    ) -> RefinementOutcome {
        let schema = corpus.schema();
        let nodes_before = arena.node_count();
        let mut summary = RefinementSummary { nodes_before, nodes_after: nodes_before, ..Default::default() };
        self.progress.store(0, Ordering::Relaxed);

        let mut seen = FxHashSet::default();
        let mut candidates = Vec::with_capacity(leaves.len());
        for &leaf in leaves {
            if !seen.insert(leaf) {
                tracing::warn!(leaf, "leaf listed twice, refining it once");
                continue;
            }
            let members = if leaf < arena.node_count() { arena.members(leaf) } else { None };
            let Some(size) = members.map(<[usize]>::len) else {
                tracing::warn!(leaf, "not a leaf of the tree, skipped");
                continue;
            };
            if size <= self.config.stop {
                tracing::debug!(leaf, size, stop = self.config.stop, "leaf too small to refine");
                summary.skipped_small += 1;
            } else {
                candidates.push(leaf);
            }
        }
        if candidates.is_empty() {
            tracing::info!(skipped = summary.skipped_small, "no leaf to refine");
            self.progress.store(100, Ordering::Relaxed);
            return RefinementOutcome { summary, error: None };
        }

        if let Err(e) = self.prepare_work_dir(schema) {
            tracing::error!(error = %e, work_dir = %self.config.work_dir.display(), "cannot prepare work directory");
            return RefinementOutcome { summary, error: Some(e) };
        }
        let metric = self.metric(schema);
        let workers = self.config.effective_workers().min(candidates.len());
        tracing::info!(jobs = candidates.len(), workers, work_dir = %self.config.work_dir.display(), "starting refinement pass");

        let abort = AtomicBool::new(false);
        let mut pass = PassState { records: Vec::new(), first_error: None, spliced: 0, finished: 0, total: candidates.len() };

        thread::scope(|scope| {
            let (job_tx, job_rx) = mpsc::sync_channel::<RefinementJob>(0);
            let (report_tx, report_rx) = mpsc::channel::<JobReport>();
            let job_rx = Arc::new(Mutex::new(job_rx));
            let ctx = WorkerContext { trainer, schema, abort: &abort };
            for slot in 0..workers {
                let jobs = Arc::clone(&job_rx);
                let reports = report_tx.clone();
                scope.spawn(move || worker_loop(slot, ctx, jobs, reports));
            }
            // Workers own the receiving ends from here on.
            drop(job_rx);
            drop(report_tx);

            for (id, &leaf) in candidates.iter().enumerate() {
                while let Ok(report) = report_rx.try_recv() {
                    self.handle_report(&mut pass, report, arena, &abort);
                }
                if abort.load(Ordering::SeqCst) {
                    tracing::warn!(remaining = candidates.len() - id, "refinement aborted, not dispatching further jobs");
                    break;
                }

                let units = arena.members(leaf).map_or(0, <[usize]>::len);
                pass.records.push(JobRecord { id, leaf, members: units, status: JobStatus::Pending, elapsed: Duration::ZERO });
                let job = match self.prepare_job(id, leaf, arena, corpus, cepstra, &metric) {
                    Ok(job) => job,
                    Err(e) => {
                        pass.fail(id, e, &abort);
                        break;
                    }
                };
                tracing::info!(job = id, leaf, units, "dispatching job {} of {}", id + 1, candidates.len());
                pass.record(id, JobStatus::Running, Duration::ZERO);
                if let Err(SendError(job)) = job_tx.send(job) {
                    job.cleanup(self.config.keep_files);
                    let reason = "no worker left to run the job".to_string();
                    pass.fail(id, CartError::TrainerProcessFailure { job: id, reason }, &abort);
                    break;
                }
            }
            drop(job_tx);

            for report in report_rx {
                self.handle_report(&mut pass, report, arena, &abort);
            }
        });

        summary.jobs = pass.records;
        summary.spliced = pass.spliced;
        summary.nodes_after = arena.node_count();
        tracing::info!(
            spliced = summary.spliced,
            nodes_before = summary.nodes_before,
            nodes_after = summary.nodes_after,
            failed = pass.first_error.is_some(),
            "refinement pass finished"
        );
        RefinementOutcome { summary, error: pass.first_error }
    }

    /// Creates the work directory and writes the description file shared by
    /// every job of the pass.
    fn prepare_work_dir(&self, schema: &FeatureSchema) -> Result<()> {
        fs::create_dir_all(&self.config.work_dir)?;
        write_description(schema, &self.config.ignored_features, &self.config.work_dir.join(DESCRIPTION_FILE))
    }

    /// Acoustic distance used for every job: spectral distance plus the
    /// weighted F0 and duration terms, if the schema has those features.
    fn metric(&self, schema: &FeatureSchema) -> UnitDistance {
        let weighted = |name: &str, weight: f64| match schema.index_of(name) {
            Some(feature) if !schema.is_discrete(feature) => Some(WeightedFeature { feature, weight }),
            _ => {
                tracing::warn!(feature = name, "no continuous feature of this name, left out of unit distances");
                None
            }
        };
        UnitDistance {
            alignment: self.config.alignment,
            f0: weighted(&self.config.f0_feature, self.config.f0_weight),
            duration: weighted(&self.config.duration_feature, self.config.duration_weight),
        }
    }

    /// Writes the feature dump and distance matrix of one leaf.
    fn prepare_job(
        &self,
        id: usize,
        leaf: NodeId,
        arena: &Arena,
        corpus: &Corpus,
        cepstra: &dyn CepstralSource,
        metric: &UnitDistance,
    ) -> Result<RefinementJob> {
        let members = arena.members(leaf).unwrap_or(&[]).to_vec();
        let invocation = TrainerInvocation::new(id, &self.config.work_dir, self.config.stop, self.config.balance);
        let job = RefinementJob { id, leaf, local_to_global: members, invocation };
        match self.write_job_inputs(&job, corpus, cepstra, metric) {
            Ok(()) => Ok(job),
            Err(e) => {
                job.cleanup(self.config.keep_files);
                Err(e)
            }
        }
    }

    fn write_job_inputs(
        &self,
        job: &RefinementJob,
        corpus: &Corpus,
        cepstra: &dyn CepstralSource,
        metric: &UnitDistance,
    ) -> Result<()> {
        let units = job
            .local_to_global
            .iter()
            .map(|&idx| corpus.unit(idx).ok_or_else(|| CartError::SchemaMismatch(format!("unit {} is not in the corpus", idx))))
            .collect::<Result<Vec<&FeatureVector>>>()?;
        write_feature_vectors(corpus.schema(), &units, &job.invocation.features)?;
        let matrix = leaf_distance_matrix(&units, cepstra, metric)?;
        write_distance_matrix(&matrix, &job.invocation.distances)
    }

    fn handle_report(&self, pass: &mut PassState, report: JobReport, arena: &mut Arena, abort: &AtomicBool) {
        let JobReport { job, outcome } = report;
        match outcome {
            JobOutcome::Skipped => pass.record(job.id, JobStatus::Skipped, Duration::ZERO),
            JobOutcome::Finished { subtree, elapsed } => {
                match subtree.and_then(|subtree| splice_subtree(arena, job.leaf, &subtree, job.id)) {
                    Ok(outcome) => {
                        tracing::info!(
                            job = job.id,
                            leaf = job.leaf,
                            nodes_added = outcome.nodes_added,
                            leaves_added = outcome.leaves_added,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "spliced subtree"
                        );
                        pass.spliced += 1;
                        pass.record(job.id, JobStatus::Succeeded, elapsed);
                    }
                    Err(e) => {
                        pass.fail(job.id, e, abort);
                        pass.record(job.id, JobStatus::Failed, elapsed);
                    }
                }
            }
        }
        job.cleanup(self.config.keep_files);
        pass.finished += 1;
        self.progress.store(pass.finished * 100 / pass.total.max(1), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cepstra::InMemoryCepstra;
    use crate::features::{FeatureDescriptor, FeatureValue};
    use crate::tree::{Node, Predicate, ROOT};
    use std::path::Path;

    /// Trainer double: splits the job's units in two halves on
    /// unit_duration, or misbehaves on request. Failing jobs return at once,
    /// every other job takes a while.
    #[derive(Default)]
    struct FakeTrainer {
        fail_sizes: Vec<usize>,
        garbage_sizes: Vec<usize>,
        calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    fn leaf_line(indices: &[usize], closing: usize) -> String {
        let pairs: Vec<String> = indices.iter().map(|i| format!("({} 0)", i)).collect();
        format!("((({}) 0{}", pairs.join(" "), ")".repeat(closing + 2))
    }

    impl SubtreeTrainer for FakeTrainer {
        fn train(&self, inv: &TrainerInvocation) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let n = fs::read_to_string(&inv.features)?.lines().count();
            assert!(inv.description.exists());
            assert!(inv.distances.exists());
            if self.fail_sizes.contains(&n) {
                return Err(CartError::TrainerProcessFailure { job: inv.id, reason: "exit status: 1".into() });
            }

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.garbage_sizes.contains(&n) {
                fs::write(&inv.output, "not a tree\n")?;
                return Ok(());
            }
            let all: Vec<usize> = (0..n).collect();
            let (low, high) = all.split_at(n / 2);
            let text = format!("((unit_duration < 0.5)\n{}\n{}\n", leaf_line(low, 0), leaf_line(high, 1));
            fs::write(&inv.output, text)?;
            Ok(())
        }
    }

    fn corpus(sizes: &[usize]) -> Corpus {
        let schema = FeatureSchema::new(vec![
            FeatureDescriptor::discrete("phone", &["0", "a", "b", "c", "d"]),
            FeatureDescriptor::continuous("unit_logf0"),
            FeatureDescriptor::continuous("unit_duration"),
        ])
        .unwrap();
        let mut vectors = Vec::new();
        for (p, &size) in sizes.iter().enumerate() {
            for _ in 0..size {
                let idx = vectors.len();
                vectors.push(FeatureVector::new(
                    idx,
                    vec![
                        FeatureValue::Discrete(p as u16 + 1),
                        FeatureValue::Continuous(4.0 + (idx % 7) as f32 * 0.1),
                        FeatureValue::Continuous(0.05 * (idx % 5) as f32),
                    ],
                ));
            }
        }
        Corpus::new(schema, vectors).unwrap()
    }

    fn cepstra(corpus: &Corpus) -> InMemoryCepstra {
        let mut cepstra = InMemoryCepstra::new(2, 16000);
        for v in corpus.vectors() {
            let i = v.unit_index() as f64;
            cepstra.insert(v.unit_index(), vec![vec![i, 1.0], vec![i * 0.5, 2.0 + i]]).unwrap();
        }
        cepstra
    }

    /// One leaf per phone, members in corpus order.
    fn tree(corpus: &Corpus, phones: usize) -> Arena {
        let mut arena = Arena::with_decision_root(0);
        for p in 1..=phones as u16 {
            let members = corpus.vectors().iter().filter(|v| v.discrete(0) == Some(p)).map(|v| v.unit_index()).collect();
            arena.add_child(ROOT, Predicate::Is(p), Node::Leaf { members });
        }
        arena
    }

    fn refiner(work_dir: &Path, workers: usize) -> LeafRefiner {
        LeafRefiner::new(RefinementConfig {
            stop: 4,
            num_workers: workers,
            work_dir: work_dir.to_path_buf(),
            ..RefinementConfig::default()
        })
    }

    #[test]
    fn test_refines_big_leaves_and_skips_small() {
        let dir = tempfile::tempdir().unwrap();
        let c = corpus(&[10, 3, 8]);
        let mut arena = tree(&c, 3);
        let leaves = arena.leaves();
        let trainer = FakeTrainer::default();
        let refiner = refiner(dir.path(), 2);

        let summary = refiner.refine(&mut arena, &leaves, &c, &cepstra(&c), &trainer).unwrap();

        assert_eq!(summary.skipped_small, 1);
        assert_eq!(summary.spliced, 2);
        assert_eq!(summary.nodes_before, 4);
        assert_eq!(summary.nodes_after, 8);
        assert!(summary.jobs.iter().all(|j| j.status == JobStatus::Succeeded));
        assert_eq!(refiner.progress().load(Ordering::Relaxed), 100);

        let mut all = arena.all_members();
        all.sort_unstable();
        assert_eq!(all, (0..21).collect::<Vec<_>>());
        let paths: Vec<String> = arena.leaves().iter().map(|&l| arena.decision_path(l, c.schema())).collect();
        assert_eq!(
            paths,
            vec![
                "phone==a - unit_duration<0.5",
                "phone==a - unit_duration>=0.5",
                "phone==b",
                "phone==c - unit_duration<0.5",
                "phone==c - unit_duration>=0.5",
            ]
        );
        // Local indices were mapped back: the "c" leaf held units 13..21.
        assert_eq!(arena.members(arena.leaves()[3]), Some(&[13, 14, 15, 16][..]));
        // Job inputs removed, outputs kept.
        assert!(!dir.path().join("wagon.feats0").exists());
        assert!(dir.path().join("wagon.cart0").exists());
    }

    #[test]
    fn test_worker_bound() {
        let dir = tempfile::tempdir().unwrap();
        let c = corpus(&[6, 6, 6, 6]);
        let mut arena = tree(&c, 4);
        let leaves = arena.leaves();
        let trainer = FakeTrainer::default();
        refiner(dir.path(), 2).refine(&mut arena, &leaves, &c, &cepstra(&c), &trainer).unwrap();
        assert_eq!(trainer.calls.load(Ordering::SeqCst), 4);
        assert!(trainer.max_running.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_failure_stops_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let c = corpus(&[7, 6, 6]);
        let mut arena = tree(&c, 3);
        let leaves = arena.leaves();
        let before = arena.all_members();
        let trainer = FakeTrainer { fail_sizes: vec![7], ..Default::default() };

        let err = refiner(dir.path(), 1).refine(&mut arena, &leaves, &c, &cepstra(&c), &trainer).unwrap_err();

        assert!(matches!(err, CartError::TrainerProcessFailure { job: 0, .. }));
        assert_eq!(trainer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(arena.node_count(), 4);
        assert_eq!(arena.all_members(), before);
    }

    #[test]
    fn test_failure_with_several_workers_launches_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        // Job 0 is slow, job 1 fails right away on the second worker.
        let c = corpus(&[6, 7, 6, 6]);
        let mut arena = tree(&c, 4);
        let leaves = arena.leaves();
        let trainer = FakeTrainer { fail_sizes: vec![7], ..Default::default() };

        let outcome = refiner(dir.path(), 2).run_pass(&mut arena, &leaves, &c, &cepstra(&c), &trainer);

        assert!(matches!(outcome.error, Some(CartError::TrainerProcessFailure { job: 1, .. })));
        assert_eq!(trainer.calls.load(Ordering::SeqCst), 2);
        let status = |id: usize| outcome.summary.jobs.iter().find(|j| j.id == id).map(|j| j.status);
        assert_eq!(status(0), Some(JobStatus::Succeeded));
        assert_eq!(status(1), Some(JobStatus::Failed));
        // Handed out after the failure at most, and then never launched.
        assert!(matches!(status(2), None | Some(JobStatus::Skipped)));
        assert_eq!(status(3), None);
        assert_eq!(outcome.summary.spliced, 1);
        assert_eq!(arena.leaf_count(), 5);
    }

    #[test]
    fn test_duplicate_and_non_leaf_ids_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let c = corpus(&[10]);
        let mut arena = tree(&c, 1);
        let leaf = arena.leaves()[0];
        let trainer = FakeTrainer::default();

        let summary = refiner(dir.path(), 2)
            .refine(&mut arena, &[leaf, ROOT, leaf, 99], &c, &cepstra(&c), &trainer)
            .unwrap();

        assert_eq!(trainer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.jobs.len(), 1);
        assert_eq!(summary.spliced, 1);
        assert_eq!(arena.leaf_count(), 2);
    }

    #[test]
    fn test_malformed_output_fails_pass() {
        let dir = tempfile::tempdir().unwrap();
        let c = corpus(&[6]);
        let mut arena = tree(&c, 1);
        let leaves = arena.leaves();
        let trainer = FakeTrainer { garbage_sizes: vec![6], ..Default::default() };
        let err = refiner(dir.path(), 1).refine(&mut arena, &leaves, &c, &cepstra(&c), &trainer).unwrap_err();
        assert!(matches!(err, CartError::MalformedTrainerOutput { job: 0, .. }));
        assert_eq!(arena.node_count(), 2);
    }

    #[test]
    fn test_missing_cepstra_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let c = corpus(&[6]);
        let mut arena = tree(&c, 1);
        let leaves = arena.leaves();
        let trainer = FakeTrainer::default();
        let empty = InMemoryCepstra::new(2, 16000);
        let err = refiner(dir.path(), 1).refine(&mut arena, &leaves, &c, &empty, &trainer).unwrap_err();
        assert!(matches!(err, CartError::Io(_)));
        assert_eq!(trainer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_nothing_to_refine() {
        let dir = tempfile::tempdir().unwrap();
        let c = corpus(&[2, 3]);
        let mut arena = tree(&c, 2);
        let leaves = arena.leaves();
        let summary = refiner(dir.path(), 1)
            .refine(&mut arena, &leaves, &c, &cepstra(&c), &FakeTrainer::default())
            .unwrap();
        assert_eq!(summary.skipped_small, 2);
        assert!(summary.jobs.is_empty());
        assert!(!dir.path().join(DESCRIPTION_FILE).exists());
    }
}
