//! Writers for the trainer's input files.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use csv::{QuoteStyle, WriterBuilder};

use crate::distance::DistanceMatrix;
use crate::error::Result;
use crate::features::{FeatureKind, FeatureSchema, FeatureVector};

fn escape(value: &str) -> String {
    value.replace('"', "\\\"")
}

/// Writes the feature description file. Features named in `ignored` are
/// marked so the trainer never splits on them.
pub fn write_description(schema: &FeatureSchema, ignored: &[String], path: &Path) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "(")?;
    writeln!(out, "(occurid cluster)")?;
    for descriptor in schema.descriptors() {
        let ignore = if ignored.iter().any(|name| name == &descriptor.name) { " ignore" } else { "" };
        match &descriptor.kind {
            FeatureKind::Discrete { values } => {
                write!(out, "( {}{}", descriptor.name, ignore)?;
                for value in values {
                    write!(out, "  \"{}\"", escape(value))?;
                }
                writeln!(out, " )")?;
            }
            FeatureKind::Continuous => writeln!(out, "( {}{} float )", descriptor.name, ignore)?,
        }
    }
    writeln!(out, ")")?;
    out.flush()?;
    Ok(())
}

/// Writes one line per unit: the job-local index followed by every feature
/// value, discrete values spelled by name.
pub fn write_feature_vectors(schema: &FeatureSchema, units: &[&FeatureVector], path: &Path) -> Result<()> {
    let mut wtr = WriterBuilder::new()
        .delimiter(b' ')
        .quote_style(QuoteStyle::Never)
        .has_headers(false)
        .from_path(path)?;
    for (local, unit) in units.iter().enumerate() {
        let mut record = Vec::with_capacity(schema.len() + 1);
        record.push(local.to_string());
        for (feature, value) in unit.values().iter().enumerate() {
            record.push(schema.render_value(feature, value));
        }
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes the matrix as `n` lines of `n` space-separated single-precision values.
pub fn write_distance_matrix(matrix: &DistanceMatrix, path: &Path) -> Result<()> {
    let mut wtr = WriterBuilder::new()
        .delimiter(b' ')
        .quote_style(QuoteStyle::Never)
        .has_headers(false)
        .from_path(path)?;
    for row in matrix.rows() {
        wtr.write_record(row.iter().map(|&d| (d as f32).to_string()))?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::{Alignment, UnitDistance};
    use crate::features::{FeatureDescriptor, FeatureValue};
    use std::fs;

    fn schema() -> FeatureSchema {
        FeatureSchema::new(vec![
            FeatureDescriptor::discrete("phone", &["0", "a", "\"q\""]),
            FeatureDescriptor::continuous("unit_logf0"),
        ])
        .unwrap()
    }

    #[test]
    fn test_description_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wagon.desc");
        write_description(&schema(), &["unit_logf0".to_string()], &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "(\n(occurid cluster)\n( phone  \"0\"  \"a\"  \"\\\"q\\\"\" )\n( unit_logf0 ignore float )\n)\n"
        );
    }

    #[test]
    fn test_feature_dump_uses_local_indices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wagon.feats0");
        let units = [
            FeatureVector::new(40, vec![FeatureValue::Discrete(1), FeatureValue::Continuous(5.25)]),
            FeatureVector::new(12, vec![FeatureValue::Discrete(0), FeatureValue::Continuous(4.0)]),
        ];
        let refs: Vec<&FeatureVector> = units.iter().collect();
        write_feature_vectors(&schema(), &refs, &path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "0 a 5.25\n1 0 4\n");
    }

    #[test]
    fn test_distance_matrix_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wagon.distabs0");
        let units = [
            FeatureVector::new(0, vec![FeatureValue::Discrete(1), FeatureValue::Continuous(0.0)]),
            FeatureVector::new(1, vec![FeatureValue::Discrete(1), FeatureValue::Continuous(0.0)]),
        ];
        let refs: Vec<&FeatureVector> = units.iter().collect();
        let frames = vec![vec![vec![0.0]], vec![vec![2.0]]];
        let matrix = DistanceMatrix::compute(&refs, &frames, &[2.0], &UnitDistance::spectral_only(Alignment::Stretch));
        write_distance_matrix(&matrix, &path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "0 2\n2 0\n");
    }
}
