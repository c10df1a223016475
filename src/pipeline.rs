//! End-to-end construction of a pre-selection CART: drop edge units, build
//! the top-level tree, validate its leaves and optionally refine the ones
//! that are too big.

use serde::Serialize;

use crate::cepstra::CepstralSource;
use crate::config::CartConfig;
use crate::error::{CartError, Result};
use crate::features::Corpus;
use crate::refine::{LeafRefiner, RefinementSummary, SubtreeTrainer};
use crate::toplevel::build_top_level;
use crate::tree::Arena;
use crate::validate::{LeafReport, LeafValidator};

/// A finished tree together with the corpus its leaves index into.
#[derive(Debug)]
pub struct Cart {
    pub tree: Arena,
    /// Corpus without edge units.
    pub corpus: Corpus,
    /// Validation of the final tree.
    pub report: LeafReport,
    /// Present when a refinement pass ran.
    pub refinement: Option<RefinementSummary>,
}

/// One leaf of the output listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeafSummary {
    pub path: String,
    pub members: Vec<usize>,
}

impl Cart {
    /// Leaves in depth-first order with their decision paths.
    pub fn leaf_summaries(&self) -> Vec<LeafSummary> {
        self.tree
            .leaves()
            .into_iter()
            .map(|leaf| LeafSummary {
                path: self.tree.decision_path(leaf, self.corpus.schema()),
                members: self.tree.members(leaf).map(<[usize]>::to_vec).unwrap_or_default(),
            })
            .collect()
    }
}

/// A construction that stopped on an error. When the refinement pass was
/// the one failing, `partial` holds the tree with the splices made before
/// the failure.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct CartFailure {
    #[source]
    pub error: CartError,
    pub partial: Option<Cart>,
}

impl From<CartError> for CartFailure {
    fn from(error: CartError) -> Self {
        CartFailure { error, partial: None }
    }
}

pub struct CartBuilder {
    config: CartConfig,
}

impl CartBuilder {
    pub fn new(config: CartConfig) -> Self {
        CartBuilder { config }
    }

    pub fn config(&self) -> &CartConfig {
        &self.config
    }

    pub fn prepare_corpus(&self, corpus: &Corpus) -> Corpus {
        corpus.without_edge_units(&self.config.edge_feature)
    }

    pub fn build_top_level(&self, corpus: &Corpus) -> Result<Arena> {
        build_top_level(&self.config.top_level, corpus)
    }

    pub fn validator(&self) -> LeafValidator {
        LeafValidator::new(
            self.config.min_leaf_size,
            self.config.max_leaf_size,
            self.config.small_leaf_exemptions.clone(),
        )
    }

    /// Runs the whole construction.
    ///
    /// # Errors
    /// Any error of top-level construction, or the first failed refinement
    /// job. A failed pass hands back the partly refined tree in
    /// [`CartFailure::partial`].
    pub fn run(
        &self,
        corpus: &Corpus,
        cepstra: &dyn CepstralSource,
        trainer: &dyn SubtreeTrainer,
    ) -> std::result::Result<Cart, CartFailure> {
        let corpus = self.prepare_corpus(corpus);
        let mut tree = self.build_top_level(&corpus)?;
        let validator = self.validator();
        let mut report = validator.validate(&tree, corpus.schema());

        let refinement = if self.config.refine && !report.too_big.is_empty() {
            let refiner = LeafRefiner::new(self.config.refinement.clone());
            let outcome = refiner.run_pass(&mut tree, &report.too_big_ids(), &corpus, cepstra, trainer);
            let summary = outcome.summary;
            if let Some(error) = outcome.error {
                report = validator.validate(&tree, corpus.schema());
                tracing::warn!(spliced = summary.spliced, "refinement pass failed, keeping the partial tree");
                let partial = Cart { tree, corpus, report, refinement: Some(summary) };
                return Err(CartFailure { error, partial: Some(partial) });
            }
            tracing::info!(
                spliced = summary.spliced,
                nodes_before = summary.nodes_before,
                nodes_after = summary.nodes_after,
                "refinement pass finished"
            );
            report = validator.validate(&tree, corpus.schema());
            Some(summary)
        } else {
            if !report.too_big.is_empty() {
                tracing::info!(too_big = report.too_big.len(), "refinement disabled, leaving big leaves as they are");
            }
            None
        };

        Ok(Cart { tree, corpus, report, refinement })
    }
}
