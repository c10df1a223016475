//! Run configuration: top-level construction mode, leaf size thresholds and
//! the settings of the refinement pass. Every field has a default, so an
//! empty TOML document is a valid configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::distance::Alignment;
use crate::error::{CartError, Result};
use crate::features::EDGE_FEATURE;
use crate::validate::SmallLeafExemption;

/// Written when the feature sequence file does not exist yet.
const DEFAULT_FEATURE_SEQUENCE: &str = "\
# Feature sequence for the top-level CART, one feature name per line.
# Units are split on each feature in turn. Lines starting with # are ignored.
phone
";

/// How the top-level tree is obtained.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TopLevelSource {
    /// Split on the listed features, in order.
    Sequence { features: Vec<String> },
    /// Split on the features listed in a text file.
    SequenceFile { path: PathBuf },
    /// Fill the empty leaves of a hand-written tree.
    Skeleton { path: PathBuf },
}

impl Default for TopLevelSource {
    fn default() -> Self {
        TopLevelSource::SequenceFile { path: PathBuf::from("feature_sequence.txt") }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CartConfig {
    pub top_level: TopLevelSource,
    /// Leaves below this size are reported as too small.
    pub min_leaf_size: usize,
    /// Leaves above this size are reported as too big and refined.
    pub max_leaf_size: usize,
    /// Run the refinement pass on leaves that are too big.
    pub refine: bool,
    /// Units whose value for this feature is not the null value are dropped
    /// before construction.
    pub edge_feature: String,
    pub small_leaf_exemptions: Vec<SmallLeafExemption>,
    pub refinement: RefinementConfig,
}

impl Default for CartConfig {
    fn default() -> Self {
        CartConfig {
            top_level: TopLevelSource::default(),
            min_leaf_size: 5,
            max_leaf_size: 10_000_000,
            refine: false,
            edge_feature: EDGE_FEATURE.to_string(),
            small_leaf_exemptions: SmallLeafExemption::defaults(),
            refinement: RefinementConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    /// Leaves of at most this many units are left alone; also the trainer's
    /// `-stop` value.
    pub stop: usize,
    pub num_workers: usize,
    /// Directory for the trainer's input, output and log files.
    pub work_dir: PathBuf,
    pub trainer_program: String,
    /// Arguments placed before the per-job ones, e.g. a wrapper script.
    pub trainer_args: Vec<String>,
    pub balance: u32,
    /// Keep the per-job feature dumps and distance matrices.
    pub keep_files: bool,
    /// Kill a trainer that runs longer than this. `None` waits forever.
    pub timeout_secs: Option<u64>,
    pub poll_interval_ms: u64,
    /// Features the trainer must not split on.
    pub ignored_features: Vec<String>,
    pub f0_feature: String,
    pub duration_feature: String,
    pub f0_weight: f64,
    pub duration_weight: f64,
    pub alignment: Alignment,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        RefinementConfig {
            stop: 50,
            num_workers: 1,
            work_dir: PathBuf::from("wagon"),
            trainer_program: "wagon".to_string(),
            trainer_args: Vec::new(),
            balance: 0,
            keep_files: false,
            timeout_secs: None,
            poll_interval_ms: 100,
            ignored_features: vec!["unit_logf0".to_string(), "unit_duration".to_string()],
            f0_feature: "unit_logf0".to_string(),
            duration_feature: "unit_duration".to_string(),
            f0_weight: 100.0,
            duration_weight: 1000.0,
            alignment: Alignment::Stretch,
        }
    }
}

impl RefinementConfig {
    /// Worker count clamped to `[1, available parallelism]`.
    pub fn effective_workers(&self) -> usize {
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        self.num_workers.clamp(1, cores.max(1))
    }
}

impl CartConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: CartConfig = toml::from_str(text).map_err(|e| CartError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_leaf_size < self.min_leaf_size {
            return Err(CartError::Config(format!(
                "max_leaf_size ({}) is smaller than min_leaf_size ({})",
                self.max_leaf_size, self.min_leaf_size
            )));
        }
        let r = &self.refinement;
        if r.num_workers == 0 {
            return Err(CartError::Config("num_workers must be at least 1".to_string()));
        }
        if r.stop == 0 {
            return Err(CartError::Config("stop must be at least 1".to_string()));
        }
        if r.poll_interval_ms == 0 {
            return Err(CartError::Config("poll_interval_ms must be at least 1".to_string()));
        }
        if !(r.f0_weight >= 0.0 && r.duration_weight >= 0.0) {
            return Err(CartError::Config("distance weights must be non-negative".to_string()));
        }
        if r.trainer_program.trim().is_empty() {
            return Err(CartError::Config("trainer_program is empty".to_string()));
        }
        Ok(())
    }
}

/// Reads a feature sequence: one feature name per line, blank lines and
/// `#` comments skipped. A missing file is created with a default sequence
/// splitting on `phone` only.
pub fn read_feature_sequence(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "feature sequence file not found, writing default");
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, DEFAULT_FEATURE_SEQUENCE)?;
    }
    let text = fs::read_to_string(path)?;
    let features: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();
    tracing::info!(path = %path.display(), features = ?features, "read feature sequence");
    Ok(features)
}
