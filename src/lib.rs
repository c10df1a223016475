//! Construction of pre-selection CARTs for unit-selection speech synthesis.
//!
//! A top-level tree partitions the units of a voice by a feature sequence or
//! a hand-written skeleton. Leaves that come out too big can be refined by an
//! external trainer growing an acoustic-distance subtree per leaf, run on a
//! bounded pool of workers and spliced back into the main tree.

pub mod cepstra;
pub mod config;
pub mod distance;
pub mod error;
pub mod features;
pub mod input;
pub mod pipeline;
pub mod refine;
pub mod splice;
pub mod toplevel;
pub mod tree;
pub mod validate;
pub mod wagon;

pub use config::CartConfig;
pub use error::{CartError, Result};
pub use features::{Corpus, FeatureSchema, FeatureVector};
pub use pipeline::{Cart, CartBuilder, CartFailure};
pub use tree::{Arena, NodeId};
