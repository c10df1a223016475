//! Access to per-unit cepstral trajectories.
//!
//! The timeline files themselves are read elsewhere; the tree builder only
//! needs, for a global unit index, the unit's ordered frames of cepstral
//! coefficients.

use std::io;

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::error::Result;

/// One frame of cepstral coefficients.
pub type Frame = Vec<f64>;

/// Source of cepstral frames, shared read-only by the refinement workers.
pub trait CepstralSource: Sync {
    /// Number of coefficients per frame.
    fn order(&self) -> usize;

    /// Corpus-wide sample rate of the underlying timeline.
    fn sample_rate(&self) -> u32;

    /// Frames of the unit with the given global index.
    ///
    /// # Errors
    /// A unit that cannot be read is an `Io` error; it is never reported as an
    /// empty trajectory.
    fn frames(&self, unit_index: usize) -> Result<Vec<Frame>>;
}

/// Cepstra held in memory, keyed by global unit index.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InMemoryCepstra {
    order: usize,
    #[serde(default)]
    sample_rate: u32,
    units: FxHashMap<usize, Vec<Frame>>,
}

impl InMemoryCepstra {
    pub fn new(order: usize, sample_rate: u32) -> Self {
        InMemoryCepstra { order, sample_rate, units: FxHashMap::default() }
    }

    /// Registers the frames of one unit. Every frame must have `order` coefficients.
    pub fn insert(&mut self, unit_index: usize, frames: Vec<Frame>) -> Result<()> {
        check_order(unit_index, &frames, self.order)?;
        self.units.insert(unit_index, frames);
        Ok(())
    }

    /// Checks that every stored frame has `order` coefficients, for data
    /// that was deserialized rather than inserted.
    pub fn validate(&self) -> Result<()> {
        self.units.iter().try_for_each(|(&unit, frames)| check_order(unit, frames, self.order))
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

fn check_order(unit_index: usize, frames: &[Frame], order: usize) -> Result<()> {
    match frames.iter().find(|f| f.len() != order) {
        Some(bad) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unit {}: frame has {} coefficients, expected {}", unit_index, bad.len(), order),
        )
        .into()),
        None => Ok(()),
    }
}

impl CepstralSource for InMemoryCepstra {
    fn order(&self) -> usize {
        self.order
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frames(&self, unit_index: usize) -> Result<Vec<Frame>> {
        self.units.get(&unit_index).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no cepstral frames for unit {}", unit_index)).into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CartError;

    #[test]
    fn test_missing_unit_is_io_error() {
        let mut cepstra = InMemoryCepstra::new(2, 16000);
        cepstra.insert(4, vec![vec![0.0, 1.0]]).unwrap();
        assert_eq!(cepstra.frames(4).unwrap().len(), 1);
        assert!(matches!(cepstra.frames(5), Err(CartError::Io(_))));
    }

    #[test]
    fn test_insert_checks_order() {
        let mut cepstra = InMemoryCepstra::new(3, 16000);
        assert!(cepstra.insert(0, vec![vec![0.0, 1.0]]).is_err());
        assert!(cepstra.insert(0, vec![]).is_ok());
        assert_eq!(cepstra.frames(0).unwrap().len(), 0);
    }

    #[test]
    fn test_deserialize_from_json() {
        let json = r#"{"order": 2, "sample_rate": 16000, "units": {"7": [[1.0, 2.0], [3.0, 4.0]]}}"#;
        let cepstra: InMemoryCepstra = serde_json::from_str(json).unwrap();
        assert_eq!(cepstra.order(), 2);
        assert_eq!(cepstra.frames(7).unwrap()[1], vec![3.0, 4.0]);
        assert!(cepstra.validate().is_ok());

        let short: InMemoryCepstra = serde_json::from_str(r#"{"order": 3, "units": {"1": [[1.0]]}}"#).unwrap();
        assert!(short.validate().is_err());
    }
}
