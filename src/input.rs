//! Loading of a voice's unit corpus from JSON.
//!
//! The file holds the feature schema, one entry per unit, and optionally the
//! cepstral frames of every unit:
//!
//! ```json
//! {
//!   "schema": [{"name": "phone", "kind": "discrete", "values": ["0", "a"]},
//!              {"name": "unit_duration", "kind": "continuous"}],
//!   "units": [{"unit_index": 0, "values": ["a", 0.08]}],
//!   "cepstra": {"order": 2, "sample_rate": 16000, "units": {"0": [[0.1, 0.2]]}}
//! }
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::cepstra::InMemoryCepstra;
use crate::error::{CartError, Result};
use crate::features::{Corpus, FeatureKind, FeatureSchema, FeatureValue, FeatureVector};

/// A feature value as written in the file: discrete values by name,
/// continuous values as numbers.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum RawValue {
    Name(String),
    Number(f32),
}

#[derive(Deserialize, Debug, Clone)]
struct RawUnit {
    unit_index: usize,
    values: Vec<RawValue>,
}

#[derive(Deserialize, Debug)]
struct CorpusFile {
    schema: FeatureSchema,
    units: Vec<RawUnit>,
    #[serde(default)]
    cepstra: Option<InMemoryCepstra>,
}

/// Corpus and cepstra read from one file.
#[derive(Debug)]
pub struct LoadedCorpus {
    pub corpus: Corpus,
    pub cepstra: InMemoryCepstra,
}

/// Parses and validates a corpus document. A missing `cepstra` section gives
/// an empty source of order 0.
pub fn parse_corpus(text: &str) -> Result<LoadedCorpus> {
    let file: CorpusFile = serde_json::from_str(text)?;
    let vectors = file
        .units
        .into_iter()
        .map(|raw| convert_unit(&file.schema, raw))
        .collect::<Result<Vec<FeatureVector>>>()?;
    let corpus = Corpus::new(file.schema, vectors)?;
    let cepstra = file.cepstra.unwrap_or_default();
    cepstra.validate()?;
    Ok(LoadedCorpus { corpus, cepstra })
}

pub fn load_corpus<P: AsRef<Path>>(path: P) -> Result<LoadedCorpus> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    let loaded = parse_corpus(&text)?;
    tracing::info!(path = %path.display(), units = loaded.corpus.len(), "loaded corpus");
    Ok(loaded)
}

fn convert_unit(schema: &FeatureSchema, raw: RawUnit) -> Result<FeatureVector> {
    if raw.values.len() != schema.len() {
        return Err(CartError::SchemaMismatch(format!(
            "unit {} has {} feature values, schema declares {}",
            raw.unit_index,
            raw.values.len(),
            schema.len()
        )));
    }
    let values = raw
        .values
        .into_iter()
        .enumerate()
        .map(|(feature, value)| match (schema.kind(feature), value) {
            (FeatureKind::Discrete { .. }, RawValue::Name(name)) => {
                schema.value_index(feature, &name).map(FeatureValue::Discrete).ok_or_else(|| {
                    CartError::SchemaMismatch(format!(
                        "unit {}: '{}' is not a value of feature '{}'",
                        raw.unit_index,
                        name,
                        schema.name(feature)
                    ))
                })
            }
            (FeatureKind::Continuous, RawValue::Number(x)) => Ok(FeatureValue::Continuous(x)),
            (_, other) => Err(CartError::SchemaMismatch(format!(
                "unit {}: {:?} does not fit feature '{}'",
                raw.unit_index,
                other,
                schema.name(feature)
            ))),
        })
        .collect::<Result<Vec<FeatureValue>>>()?;
    Ok(FeatureVector::new(raw.unit_index, values))
}
