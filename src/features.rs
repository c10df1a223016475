//! Feature schema, per-unit feature vectors and the unit corpus they form.
//!
//! A `FeatureSchema` is loaded once per run and shared read-only by every
//! component. Feature vectors are created once, validated against the schema
//! when the `Corpus` is assembled, and never mutated afterwards; tree leaves
//! refer to them by global unit index.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{CartError, Result};

/// Name of the discrete feature flagging utterance-edge placeholder units.
pub const EDGE_FEATURE: &str = "edge";
/// Rendering of value index 0 of every discrete feature (the "no value" value).
pub const NULL_VALUE: &str = "0";

/// Declared type of a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureKind {
    /// Finite value set; a vector stores the index into `values`.
    Discrete { values: Vec<String> },
    Continuous,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub kind: FeatureKind,
}

impl FeatureDescriptor {
    pub fn discrete<S: Into<String>>(name: S, values: &[&str]) -> Self {
        FeatureDescriptor {
            name: name.into(),
            kind: FeatureKind::Discrete { values: values.iter().map(|v| v.to_string()).collect() },
        }
    }

    pub fn continuous<S: Into<String>>(name: S) -> Self {
        FeatureDescriptor { name: name.into(), kind: FeatureKind::Continuous }
    }
}

/// Ordered, immutable list of named features with name -> index lookup.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "Vec<FeatureDescriptor>")]
pub struct FeatureSchema {
    features: Vec<FeatureDescriptor>,
    index: FxHashMap<String, usize>,
}

impl TryFrom<Vec<FeatureDescriptor>> for FeatureSchema {
    type Error = CartError;

    fn try_from(features: Vec<FeatureDescriptor>) -> Result<Self> {
        FeatureSchema::new(features)
    }
}

impl FeatureSchema {
    /// Builds a schema, rejecting duplicate names and unusable value sets.
    pub fn new(features: Vec<FeatureDescriptor>) -> Result<Self> {
        let mut index = FxHashMap::default();
        for (i, feature) in features.iter().enumerate() {
            if let FeatureKind::Discrete { values } = &feature.kind {
                if values.is_empty() || values.len() > u16::MAX as usize {
                    return Err(CartError::SchemaMismatch(format!(
                        "discrete feature '{}' declares {} values",
                        feature.name,
                        values.len()
                    )));
                }
            }
            if index.insert(feature.name.clone(), i).is_some() {
                return Err(CartError::SchemaMismatch(format!("duplicate feature name '{}'", feature.name)));
            }
        }
        Ok(FeatureSchema { features, index })
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn descriptors(&self) -> &[FeatureDescriptor] {
        &self.features
    }

    /// # Panics
    /// Panics if `feature` is out of bounds.
    pub fn name(&self, feature: usize) -> &str {
        &self.features[feature].name
    }

    /// # Panics
    /// Panics if `feature` is out of bounds.
    pub fn kind(&self, feature: usize) -> &FeatureKind {
        &self.features[feature].kind
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Like `index_of`, but an unknown name is a `SchemaMismatch`.
    pub fn require(&self, name: &str) -> Result<usize> {
        self.index_of(name)
            .ok_or_else(|| CartError::SchemaMismatch(format!("feature '{}' is not defined in the schema", name)))
    }

    pub fn is_discrete(&self, feature: usize) -> bool {
        matches!(self.features[feature].kind, FeatureKind::Discrete { .. })
    }

    /// Number of declared values of a discrete feature, 0 for continuous ones.
    pub fn num_values(&self, feature: usize) -> usize {
        match &self.features[feature].kind {
            FeatureKind::Discrete { values } => values.len(),
            FeatureKind::Continuous => 0,
        }
    }

    pub fn value_index(&self, feature: usize, value: &str) -> Option<u16> {
        match &self.features[feature].kind {
            FeatureKind::Discrete { values } => values.iter().position(|v| v == value).map(|p| p as u16),
            FeatureKind::Continuous => None,
        }
    }

    pub fn value_name(&self, feature: usize, value: u16) -> Option<&str> {
        match &self.features[feature].kind {
            FeatureKind::Discrete { values } => values.get(value as usize).map(String::as_str),
            FeatureKind::Continuous => None,
        }
    }

    /// Renders a stored value the way the trainer files spell it.
    pub fn render_value(&self, feature: usize, value: &FeatureValue) -> String {
        match value {
            FeatureValue::Discrete(v) => self.value_name(feature, *v).unwrap_or(NULL_VALUE).to_string(),
            FeatureValue::Continuous(x) => x.to_string(),
        }
    }
}

/// One slot of a feature vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FeatureValue {
    Discrete(u16),
    Continuous(f32),
}

/// Feature values of one acoustic unit instance plus its global unit index.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    unit_index: usize,
    values: Vec<FeatureValue>,
}

impl FeatureVector {
    pub fn new(unit_index: usize, values: Vec<FeatureValue>) -> Self {
        FeatureVector { unit_index, values }
    }

    #[inline]
    pub fn unit_index(&self) -> usize {
        self.unit_index
    }

    pub fn values(&self) -> &[FeatureValue] {
        &self.values
    }

    #[inline]
    pub fn value(&self, feature: usize) -> Option<&FeatureValue> {
        self.values.get(feature)
    }

    #[inline]
    pub fn discrete(&self, feature: usize) -> Option<u16> {
        match self.values.get(feature) {
            Some(FeatureValue::Discrete(v)) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn continuous(&self, feature: usize) -> Option<f32> {
        match self.values.get(feature) {
            Some(FeatureValue::Continuous(x)) => Some(*x),
            _ => None,
        }
    }

    /// True when the edge feature holds anything but the null value.
    pub fn is_edge(&self, edge_feature: usize) -> bool {
        self.discrete(edge_feature).is_some_and(|v| v != 0)
    }
}

/// All unit feature vectors of a voice, validated against one schema.
#[derive(Debug, Clone)]
pub struct Corpus {
    schema: FeatureSchema,
    vectors: Vec<FeatureVector>,
    positions: FxHashMap<usize, usize>,
}

impl Corpus {
    /// Assembles a corpus, checking every vector against the schema.
    ///
    /// # Errors
    /// `SchemaMismatch` if a vector has the wrong length, a slot of the wrong
    /// kind, an out-of-range discrete value, or a unit index seen before.
    pub fn new(schema: FeatureSchema, vectors: Vec<FeatureVector>) -> Result<Self> {
        let mut positions = FxHashMap::with_capacity_and_hasher(vectors.len(), Default::default());
        for (pos, vector) in vectors.iter().enumerate() {
            if vector.values.len() != schema.len() {
                return Err(CartError::SchemaMismatch(format!(
                    "unit {} has {} feature values, schema declares {}",
                    vector.unit_index,
                    vector.values.len(),
                    schema.len()
                )));
            }
            for (feature, value) in vector.values.iter().enumerate() {
                let ok = match (schema.kind(feature), value) {
                    (FeatureKind::Discrete { values }, FeatureValue::Discrete(v)) => (*v as usize) < values.len(),
                    (FeatureKind::Continuous, FeatureValue::Continuous(_)) => true,
                    _ => false,
                };
                if !ok {
                    return Err(CartError::SchemaMismatch(format!(
                        "unit {} holds {:?} for feature '{}'",
                        vector.unit_index,
                        value,
                        schema.name(feature)
                    )));
                }
            }
            if positions.insert(vector.unit_index, pos).is_some() {
                return Err(CartError::SchemaMismatch(format!("unit index {} occurs twice", vector.unit_index)));
            }
        }
        Ok(Corpus { schema, vectors, positions })
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn vectors(&self) -> &[FeatureVector] {
        &self.vectors
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Looks a vector up by its global unit index.
    pub fn unit(&self, unit_index: usize) -> Option<&FeatureVector> {
        self.positions.get(&unit_index).map(|&pos| &self.vectors[pos])
    }

    /// Copy of this corpus without utterance-edge placeholder units.
    pub fn without_edge_units(&self, edge_feature: &str) -> Corpus {
        let Some(edge) = self.schema.index_of(edge_feature) else {
            tracing::warn!(feature = edge_feature, "edge feature not in schema; keeping all units");
            return self.clone();
        };
        let kept: Vec<FeatureVector> = self.vectors.iter().filter(|v| !v.is_edge(edge)).cloned().collect();
        tracing::info!(
            removed = self.vectors.len() - kept.len(),
            remaining = kept.len(),
            "removed edge vectors"
        );
        let positions = kept.iter().enumerate().map(|(pos, v)| (v.unit_index, pos)).collect();
        Corpus { schema: self.schema.clone(), vectors: kept, positions }
    }
}
