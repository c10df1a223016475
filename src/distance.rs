//! Acoustic distances between units, computed from their cepstral
//! trajectories, and the per-leaf distance matrix handed to the trainer.
//!
//! All spectral costs are built from one atomic per-frame cost, the
//! variance-normalised squared (Mahalanobis) distance. Two alignments are
//! available: linear time-stretching (used by default) and an Itakura-style
//! DTW with a 2:1 weighting toward the diagonal.

#[cfg(not(feature = "non-parallel"))]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cepstra::{CepstralSource, Frame};
use crate::error::Result;
use crate::features::FeatureVector;

/// Large finite stand-in for an infinite or undefined distance.
pub const DISTANCE_SENTINEL: f64 = 100_000.0;

/// Strategy used to align two frame sequences of different lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alignment {
    #[default]
    Stretch,
    Dtw,
}

#[inline]
fn clamp(dist: f64) -> f64 {
    if dist.is_finite() { dist } else { DISTANCE_SENTINEL }
}

/// Mahalanobis distance between two frames: `sum_k (v1[k] - v2[k])^2 / variance[k]`.
///
/// Coefficients on which both frames agree contribute nothing, even when
/// their variance is zero.
#[inline]
pub fn mahalanobis(v1: &[f64], v2: &[f64], variance: &[f64]) -> f64 {
    let mut sum = 0.0;
    for ((a, b), var) in v1.iter().zip(v2).zip(variance) {
        let diff = a - b;
        if diff != 0.0 {
            sum += diff * diff / var;
        }
    }
    sum
}

/// Average Mahalanobis distance along the linear time-stretched
/// correspondence between two frame sequences.
///
/// Frame `i` of the longer sequence is paired with frame
/// `floor(i * shorter.len() / longer.len())` of the shorter one. Per-frame
/// costs that are infinite or NaN count as `DISTANCE_SENTINEL`.
/// Two empty sequences are at distance 0; one empty sequence is at the sentinel.
pub fn stretch_distance(seq1: &[Frame], seq2: &[Frame], variance: &[f64]) -> f64 {
    if seq1.is_empty() || seq2.is_empty() {
        return if seq1.len() == seq2.len() { 0.0 } else { DISTANCE_SENTINEL };
    }
    let (shorter, longer) = if seq1.len() < seq2.len() { (seq1, seq2) } else { (seq2, seq1) };
    let total: f64 = longer
        .iter()
        .enumerate()
        .map(|(i, frame)| {
            let i_shorter = i * shorter.len() / longer.len();
            clamp(mahalanobis(frame, &shorter[i_shorter], variance))
        })
        .sum();
    clamp(total / longer.len() as f64)
}

/// Picks the cheapest of three (cost, step count) candidates; ties go to the
/// earlier candidate.
#[inline]
fn cheapest(candidates: [(f64, u32); 3]) -> (f64, u32) {
    let mut best = if candidates[0].0 < candidates[1].0 { 0 } else { 1 };
    if candidates[2].0 < candidates[best].0 {
        best = 2;
    }
    candidates[best]
}

/// Average Mahalanobis distance along the optimal DTW path.
///
/// Local constraint:
/// `D(i,j) = min { D(i-2,j-1) + 2d(i-1,j) + d(i,j) ; D(i-1,j-1) + 2d(i,j) ; D(i-1,j-2) + 2d(i,j-1) + d(i,j) }`.
/// The cumulated cost is divided by the number of local distances summed
/// along the chosen path, so the result has the magnitude of one frame
/// distance. Returns `None` if either sequence is empty.
pub fn dtw_distance(seq1: &[Frame], seq2: &[Frame], variance: &[f64]) -> Option<f64> {
    let (l1, l2) = (seq1.len(), seq2.len());
    if l1 == 0 || l2 == 0 {
        return None;
    }
    let at = |i: usize, j: usize| i * l2 + j;

    let mut d = vec![0.0; l1 * l2];
    for (i, a) in seq1.iter().enumerate() {
        for (j, b) in seq2.iter().enumerate() {
            d[at(i, j)] = mahalanobis(a, b, variance);
        }
    }
    let mut cost = vec![0.0; l1 * l2];
    let mut steps = vec![0u32; l1 * l2];

    // --- First row and column (one frame or more) ---
    cost[at(0, 0)] = 2.0 * d[at(0, 0)];
    steps[at(0, 0)] = 2;
    for i in 1..l1 {
        cost[at(i, 0)] = d[at(i, 0)];
        steps[at(i, 0)] = 1;
    }
    for j in 1..l2 {
        cost[at(0, j)] = d[at(0, j)];
        steps[at(0, j)] = 1;
    }

    // --- Second row and column (two frames or more) ---
    if l1 > 1 && l2 > 1 {
        let (c, n) = cheapest([
            (2.0 * d[at(0, 1)] + d[at(1, 1)], 3),
            (cost[at(0, 0)] + 2.0 * d[at(1, 1)], steps[at(0, 0)] + 2),
            (2.0 * d[at(1, 0)] + d[at(1, 1)], 3),
        ]);
        cost[at(1, 1)] = c;
        steps[at(1, 1)] = n;

        for i in 2..l1 {
            let (c, n) = cheapest([
                (cost[at(i - 2, 0)] + 2.0 * d[at(i - 1, 1)] + d[at(i, 1)], steps[at(i - 2, 0)] + 3),
                (cost[at(i - 1, 0)] + 2.0 * d[at(i, 1)], steps[at(i - 1, 0)] + 2),
                (2.0 * d[at(i, 0)] + d[at(i, 1)], 3),
            ]);
            cost[at(i, 1)] = c;
            steps[at(i, 1)] = n;
        }
        for j in 2..l2 {
            let (c, n) = cheapest([
                (2.0 * d[at(0, j)] + d[at(1, j)], 3),
                (cost[at(0, j - 1)] + 2.0 * d[at(1, j)], steps[at(0, j - 1)] + 2),
                (cost[at(0, j - 2)] + 2.0 * d[at(1, j - 1)] + d[at(1, j)], steps[at(0, j - 2)] + 3),
            ]);
            cost[at(1, j)] = c;
            steps[at(1, j)] = n;
        }
    }

    // --- Rest of the matrix (three frames or more) ---
    if l1 > 2 && l2 > 2 {
        for i in 2..l1 {
            for j in 2..l2 {
                let (c, n) = cheapest([
                    (cost[at(i - 2, j - 1)] + 2.0 * d[at(i - 1, j)] + d[at(i, j)], steps[at(i - 2, j - 1)] + 3),
                    (cost[at(i - 1, j - 1)] + 2.0 * d[at(i, j)], steps[at(i - 1, j - 1)] + 2),
                    (cost[at(i - 1, j - 2)] + 2.0 * d[at(i, j - 1)] + d[at(i, j)], steps[at(i - 1, j - 2)] + 3),
                ]);
                cost[at(i, j)] = c;
                steps[at(i, j)] = n;
            }
        }
    }

    let last = at(l1 - 1, l2 - 1);
    Some(cost[last] / steps[last] as f64)
}

/// Running sums over all frames of a batch of units, for the shared
/// per-coefficient variance.
#[derive(Debug, Clone)]
pub struct FrameStatistics {
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
    frames: usize,
}

impl FrameStatistics {
    pub fn new(order: usize) -> Self {
        FrameStatistics { sum: vec![0.0; order], sum_sq: vec![0.0; order], frames: 0 }
    }

    pub fn add(&mut self, frames: &[Frame]) {
        for frame in frames {
            for (k, &val) in frame.iter().enumerate().take(self.sum.len()) {
                self.sum[k] += val;
                self.sum_sq[k] += val * val;
            }
        }
        self.frames += frames.len();
    }

    pub fn frame_count(&self) -> usize {
        self.frames
    }

    /// `variance[k] = (sumSq[k] - sum[k]^2 / N) / N`; all zeros when no frame was seen.
    pub fn variance(&self) -> Vec<f64> {
        if self.frames == 0 {
            return vec![0.0; self.sum.len()];
        }
        let n = self.frames as f64;
        self.sum.iter().zip(&self.sum_sq).map(|(s, sq)| (sq - s * s / n) / n).collect()
    }
}

/// A continuous feature whose absolute difference is added to the spectral distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedFeature {
    pub feature: usize,
    pub weight: f64,
}

impl WeightedFeature {
    #[inline]
    fn term(&self, a: &FeatureVector, b: &FeatureVector) -> f64 {
        match (a.continuous(self.feature), b.continuous(self.feature)) {
            (Some(x), Some(y)) => self.weight * (x as f64 - y as f64).abs(),
            _ => 0.0,
        }
    }
}

/// Pairwise unit distance: spectral distance plus weighted log-F0 and
/// duration differences.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitDistance {
    pub alignment: Alignment,
    pub f0: Option<WeightedFeature>,
    pub duration: Option<WeightedFeature>,
}

impl UnitDistance {
    pub fn spectral_only(alignment: Alignment) -> Self {
        UnitDistance { alignment, f0: None, duration: None }
    }

    /// Distance between two units given their frames and the shared variance.
    /// If either unit has no frames, the scalar terms are not added.
    pub fn between(
        &self,
        a: &FeatureVector,
        frames_a: &[Frame],
        b: &FeatureVector,
        frames_b: &[Frame],
        variance: &[f64],
    ) -> f64 {
        if frames_a.is_empty() || frames_b.is_empty() {
            return if frames_a.len() == frames_b.len() { 0.0 } else { DISTANCE_SENTINEL };
        }
        let spectral = match self.alignment {
            Alignment::Stretch => stretch_distance(frames_a, frames_b, variance),
            Alignment::Dtw => dtw_distance(frames_a, frames_b, variance).map_or(DISTANCE_SENTINEL, clamp),
        };
        let f0 = self.f0.map_or(0.0, |t| t.term(a, b));
        let duration = self.duration.map_or(0.0, |t| t.term(a, b));
        spectral + f0 + duration
    }
}

/// Dense symmetric matrix of distances between the members of one leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceMatrix {
    size: usize,
    values: Vec<f64>,
}

impl DistanceMatrix {
    /// Computes all pairwise distances. The diagonal is zero and only the
    /// upper triangle is evaluated.
    pub fn compute(units: &[&FeatureVector], frames: &[Vec<Frame>], variance: &[f64], metric: &UnitDistance) -> Self {
        let n = units.len();
        debug_assert_eq!(n, frames.len());
        let row = |i: usize| -> Vec<f64> {
            ((i + 1)..n).map(|j| metric.between(units[i], &frames[i], units[j], &frames[j], variance)).collect()
        };

        #[cfg(not(feature = "non-parallel"))]
        let upper: Vec<Vec<f64>> = (0..n).into_par_iter().map(row).collect();
        #[cfg(feature = "non-parallel")]
        let upper: Vec<Vec<f64>> = (0..n).map(row).collect();

        let mut values = vec![0.0; n * n];
        for (i, r) in upper.iter().enumerate() {
            for (k, &dist) in r.iter().enumerate() {
                let j = i + 1 + k;
                values[i * n + j] = dist;
                values[j * n + i] = dist;
            }
        }
        DistanceMatrix { size: n, values }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// # Panics
    /// Panics if `i` or `j` is out of bounds.
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        assert!(i < self.size && j < self.size, "index ({}, {}) outside {}x{} matrix", i, j, self.size, self.size);
        self.values[i * self.size + j]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        // chunks() panics on a zero chunk size
        self.values.chunks(self.size.max(1))
    }
}

/// Reads the frames of every unit in a leaf, estimates the variance over all
/// of them, and builds the leaf's distance matrix.
pub fn leaf_distance_matrix(
    units: &[&FeatureVector],
    cepstra: &dyn CepstralSource,
    metric: &UnitDistance,
) -> Result<DistanceMatrix> {
    let mut stats = FrameStatistics::new(cepstra.order());
    let mut frames = Vec::with_capacity(units.len());
    for unit in units {
        let unit_frames = cepstra.frames(unit.unit_index())?;
        stats.add(&unit_frames);
        frames.push(unit_frames);
    }
    let variance = stats.variance();
    tracing::debug!(units = units.len(), frames = stats.frame_count(), "computing leaf distance matrix");
    Ok(DistanceMatrix::compute(units, &frames, &variance, metric))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cepstra::InMemoryCepstra;
    use crate::features::FeatureValue;

    fn frames(values: &[f64]) -> Vec<Frame> {
        values.iter().map(|&v| vec![v]).collect()
    }

    fn unit(idx: usize, logf0: f32, dur: f32) -> FeatureVector {
        FeatureVector::new(idx, vec![FeatureValue::Continuous(logf0), FeatureValue::Continuous(dur)])
    }

    #[test]
    fn test_mahalanobis() {
        assert_eq!(mahalanobis(&[1.0, 2.0], &[3.0, 2.0], &[2.0, 1.0]), 2.0);
        assert_eq!(mahalanobis(&[1.0], &[1.0], &[0.0]), 0.0);
        assert!(mahalanobis(&[1.0], &[2.0], &[0.0]).is_infinite());
    }

    #[test]
    fn test_stretch_distance() {
        let var = [1.0];
        let long = frames(&[0.0, 1.0, 2.0, 3.0]);
        let short = frames(&[0.0, 2.0]);
        // Pairs (0,0) (1,0) (2,2) (3,2): costs 0 + 1 + 0 + 1 over 4 frames.
        assert_eq!(stretch_distance(&long, &short, &var), 0.5);
        assert_eq!(stretch_distance(&short, &long, &var), 0.5);
    }

    #[test]
    fn test_stretch_identity_and_symmetry() {
        let var = [0.5, 2.0];
        let a: Vec<Frame> = vec![vec![0.1, 3.0], vec![0.7, -1.0], vec![1.5, 0.0]];
        let b: Vec<Frame> = vec![vec![0.4, 1.0], vec![-0.2, 2.0], vec![0.9, 0.5], vec![0.3, 0.3], vec![1.1, 1.1]];
        assert_eq!(stretch_distance(&a, &a, &var), 0.0);
        assert_eq!(stretch_distance(&a, &b, &var), stretch_distance(&b, &a, &var));
        // Zero variance on a coefficient does not break identity.
        assert_eq!(stretch_distance(&a, &a, &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_stretch_empty_and_sentinel() {
        let var = [1.0];
        assert_eq!(stretch_distance(&[], &[], &var), 0.0);
        assert_eq!(stretch_distance(&frames(&[1.0]), &[], &var), DISTANCE_SENTINEL);
        assert_eq!(stretch_distance(&[], &frames(&[1.0]), &var), DISTANCE_SENTINEL);
        // Infinite per-frame cost is clamped.
        assert_eq!(stretch_distance(&frames(&[1.0]), &frames(&[2.0]), &[0.0]), DISTANCE_SENTINEL);
    }

    #[test]
    fn test_dtw_distance() {
        let var = [1.0];
        assert_eq!(dtw_distance(&frames(&[0.0, 1.0]), &frames(&[0.0, 1.0]), &var), Some(0.0));
        assert_eq!(dtw_distance(&frames(&[1.0]), &frames(&[3.0]), &var), Some(4.0));
        assert_eq!(dtw_distance(&frames(&[0.0]), &frames(&[0.0, 3.0]), &var), Some(9.0));
        assert_eq!(dtw_distance(&[], &frames(&[0.0]), &var), None);

        let a = frames(&[0.0, 0.5, 1.0, 1.5, 2.0]);
        assert_eq!(dtw_distance(&a, &a, &var), Some(0.0));
        let b = frames(&[0.0, 1.0, 2.0, 2.0]);
        let ab = dtw_distance(&a, &b, &var).unwrap();
        assert!(ab.is_finite() && ab >= 0.0);
    }

    #[test]
    fn test_frame_statistics_variance() {
        let mut stats = FrameStatistics::new(2);
        stats.add(&[vec![1.0, 0.0], vec![3.0, 0.0]]);
        stats.add(&[vec![2.0, 0.0]]);
        assert_eq!(stats.frame_count(), 3);
        let var = stats.variance();
        assert!((var[0] - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(var[1], 0.0);
        assert_eq!(FrameStatistics::new(3).variance(), vec![0.0; 3]);
    }

    #[test]
    fn test_unit_distance_adds_weighted_terms() {
        let metric = UnitDistance {
            alignment: Alignment::Stretch,
            f0: Some(WeightedFeature { feature: 0, weight: 100.0 }),
            duration: Some(WeightedFeature { feature: 1, weight: 1000.0 }),
        };
        let a = unit(0, 5.0, 0.25);
        let b = unit(1, 5.5, 0.5);
        let fa = frames(&[0.0, 1.0]);
        let fb = frames(&[0.0, 1.0]);
        let d = metric.between(&a, &fa, &b, &fb, &[1.0]);
        assert!((d - (50.0 + 250.0)).abs() < 1e-9);
        assert_eq!(metric.between(&a, &fa, &a, &fa, &[1.0]), 0.0);
        // Zero frames: no scalar terms.
        assert_eq!(metric.between(&a, &[], &b, &[], &[1.0]), 0.0);
        assert_eq!(metric.between(&a, &fa, &b, &[], &[1.0]), DISTANCE_SENTINEL);
    }

    #[test]
    fn test_leaf_distance_matrix() {
        let mut cepstra = InMemoryCepstra::new(1, 16000);
        cepstra.insert(10, frames(&[0.0, 1.0])).unwrap();
        cepstra.insert(11, frames(&[2.0, 3.0, 4.0])).unwrap();
        cepstra.insert(12, vec![]).unwrap();
        let units = [unit(10, 0.0, 0.0), unit(11, 0.0, 0.0), unit(12, 0.0, 0.0)];
        let refs: Vec<&FeatureVector> = units.iter().collect();
        let matrix = leaf_distance_matrix(&refs, &cepstra, &UnitDistance::spectral_only(Alignment::Stretch)).unwrap();

        assert_eq!(matrix.size(), 3);
        for i in 0..3 {
            assert_eq!(matrix.get(i, i), 0.0);
            for j in 0..3 {
                assert_eq!(matrix.get(i, j), matrix.get(j, i));
            }
        }
        assert!(matrix.get(0, 1) > 0.0);
        assert_eq!(matrix.get(0, 2), DISTANCE_SENTINEL);
        assert_eq!(matrix.rows().count(), 3);
    }

    #[test]
    fn test_leaf_distance_matrix_propagates_read_errors() {
        let cepstra = InMemoryCepstra::new(1, 16000);
        let units = [unit(99, 0.0, 0.0)];
        let refs: Vec<&FeatureVector> = units.iter().collect();
        assert!(leaf_distance_matrix(&refs, &cepstra, &UnitDistance::spectral_only(Alignment::Dtw)).is_err());
    }
}
