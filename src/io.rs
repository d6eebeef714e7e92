//! Collaborator I/O: CAFE change/probability tables, trait TSV loading with
//! column auto-detection, and the TSV/JSON output writers.
//!
//! Grounded on the teacher's `io.rs` (`write_matrix_tsv`'s plain
//! `BufWriter`-based TSV emission, `read_beast_trees`'s "parse or skip with
//! a loud warning" stance on malformed rows).

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::correction::QqRow;
use crate::error::{io_err, CafeError, Result};
use crate::tree::canonical_label;

const MISSING_TOKENS: &[&str] = &["", "NA", "N/A", "na", "n/a", "NaN", "nan"];

fn is_missing(token: &str) -> bool {
    MISSING_TOKENS.contains(&token.trim())
}

/// Reads a CAFE-shaped tab-separated table: first column = family id,
/// remaining columns = branch keys (raw node labels, normalized here the
/// same way the tree canonicalizer normalizes them). Missing cells are 0.
pub fn read_cafe_change_table(path: &Path) -> Result<Vec<(String, HashMap<String, i64>)>> {
    let file = File::open(path).map_err(|e| io_err(path.to_path_buf(), e))?;
    let mut lines = BufReader::new(file).lines();
    let header = lines
        .next()
        .ok_or_else(|| CafeError::TreeParse(format!("{path:?} is empty")))?
        .map_err(|e| io_err(path.to_path_buf(), e))?;
    let columns: Vec<String> = header.split('\t').skip(1).map(|c| canonical_label(c).to_string()).collect();

    let mut rows = Vec::new();
    for line in lines {
        let line = line.map_err(|e| io_err(path.to_path_buf(), e))?;
        if line.trim().is_empty() {
            continue;
        }
        let mut cells = line.split('\t');
        let family_id = cells
            .next()
            .ok_or_else(|| CafeError::TreeParse(format!("malformed row in {path:?}")))?
            .to_string();
        let mut row = HashMap::new();
        for (col, cell) in columns.iter().zip(cells) {
            if is_missing(cell) {
                continue;
            }
            let value: i64 = cell
                .trim()
                .parse()
                .map_err(|_| CafeError::TreeParse(format!("non-integer delta '{cell}' in {path:?}")))?;
            row.insert(col.clone(), value);
        }
        rows.push((family_id, row));
    }
    Ok(rows)
}

/// Reads a CAFE branch-probability table (same shape, float values in
/// `[0,1]`).
pub fn read_cafe_probability_table(path: &Path) -> Result<Vec<(String, HashMap<String, f64>)>> {
    let file = File::open(path).map_err(|e| io_err(path.to_path_buf(), e))?;
    let mut lines = BufReader::new(file).lines();
    let header = lines
        .next()
        .ok_or_else(|| CafeError::TreeParse(format!("{path:?} is empty")))?
        .map_err(|e| io_err(path.to_path_buf(), e))?;
    let columns: Vec<String> = header.split('\t').skip(1).map(|c| canonical_label(c).to_string()).collect();

    let mut rows = Vec::new();
    for line in lines {
        let line = line.map_err(|e| io_err(path.to_path_buf(), e))?;
        if line.trim().is_empty() {
            continue;
        }
        let mut cells = line.split('\t');
        let family_id = cells
            .next()
            .ok_or_else(|| CafeError::TreeParse(format!("malformed row in {path:?}")))?
            .to_string();
        let mut row = HashMap::new();
        for (col, cell) in columns.iter().zip(cells) {
            if is_missing(cell) {
                continue;
            }
            let value: f64 = cell
                .trim()
                .parse()
                .map_err(|_| CafeError::TreeParse(format!("non-numeric probability '{cell}' in {path:?}")))?;
            row.insert(col.clone(), value);
        }
        rows.push((family_id, row));
    }
    Ok(rows)
}

const SPECIES_COLUMN_NAMES: &[&str] = &["species", "taxon", "taxon_id", "tip", "label", "name", "scientific_name"];

/// Loaded trait table: selected species and trait columns, plus whether the
/// trait column was auto-detected.
pub struct TraitTable {
    pub species_column: String,
    pub trait_column: String,
    pub trait_column_auto_detected: bool,
    pub values: HashMap<String, bool>,
}

/// Loads the trait TSV, auto-detecting the species column (case-insensitive
/// match against a known name list, falling back to the first column) and
/// the binary trait column (auto-selected only if exactly one other column
/// is entirely `{0,1}`/missing).
pub fn read_trait_tsv(path: &Path, trait_column_override: Option<&str>) -> Result<TraitTable> {
    let file = File::open(path).map_err(|e| io_err(path.to_path_buf(), e))?;
    let mut lines = BufReader::new(file).lines();
    let header = lines
        .next()
        .ok_or_else(|| CafeError::TreeParse(format!("{path:?} is empty")))?
        .map_err(|e| io_err(path.to_path_buf(), e))?;
    let columns: Vec<String> = header.split('\t').map(|c| c.to_string()).collect();
    if columns.is_empty() {
        return Err(CafeError::TreeParse(format!("{path:?} has no columns")));
    }

    let species_idx = columns
        .iter()
        .position(|c| SPECIES_COLUMN_NAMES.iter().any(|n| n.eq_ignore_ascii_case(c)))
        .unwrap_or(0);

    let mut raw_rows: Vec<Vec<String>> = Vec::new();
    for line in lines {
        let line = line.map_err(|e| io_err(path.to_path_buf(), e))?;
        if line.trim().is_empty() {
            continue;
        }
        raw_rows.push(line.split('\t').map(|c| c.to_string()).collect());
    }

    let trait_idx = match trait_column_override {
        Some(name) => columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| CafeError::UnknownTraitColumn(name.to_string()))?,
        None => {
            let candidates: Vec<usize> = (0..columns.len())
                .filter(|&i| i != species_idx)
                .filter(|&i| {
                    raw_rows.iter().all(|row| {
                        row.get(i)
                            .map(|cell| is_missing(cell) || cell.trim() == "0" || cell.trim() == "1")
                            .unwrap_or(false)
                    })
                })
                .collect();
            if candidates.len() != 1 {
                return Err(CafeError::AmbiguousTraitColumn);
            }
            candidates[0]
        }
    };

    let mut values = HashMap::new();
    for row in &raw_rows {
        let species = row
            .get(species_idx)
            .ok_or_else(|| CafeError::TreeParse(format!("row missing species column in {path:?}")))?;
        let cell = row
            .get(trait_idx)
            .ok_or_else(|| CafeError::TreeParse(format!("row missing trait column in {path:?}")))?;
        if is_missing(cell) {
            return Err(CafeError::MissingTraitValue(species.clone()));
        }
        let v = match cell.trim() {
            "0" => false,
            "1" => true,
            other => return Err(CafeError::TreeParse(format!("non-binary trait value '{other}' for '{species}'"))),
        };
        values.insert(species.clone(), v);
    }

    Ok(TraitTable {
        species_column: columns[species_idx].clone(),
        trait_column: columns[trait_idx].clone(),
        trait_column_auto_detected: trait_column_override.is_none(),
        values,
    })
}

/// Writes a TSV with a header row and the given rows (already formatted as
/// strings so writers stay mode-agnostic).
pub fn write_tsv(path: &Path, header: &[&str], rows: &[Vec<String>]) -> Result<()> {
    let file = File::create(path).map_err(|e| io_err(path.to_path_buf(), e))?;
    let mut w = std::io::BufWriter::new(file);
    writeln!(w, "{}", header.join("\t")).map_err(|e| io_err(path.to_path_buf(), e))?;
    for row in rows {
        writeln!(w, "{}", row.join("\t")).map_err(|e| io_err(path.to_path_buf(), e))?;
    }
    Ok(())
}

pub fn write_histogram_tsv(path: &Path, counts: &[u64], hist_bins: usize) -> Result<()> {
    let rows: Vec<Vec<String>> = counts
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            let lo = i as f64 / hist_bins as f64;
            let hi = (i + 1) as f64 / hist_bins as f64;
            vec![format!("{lo:.4}"), format!("{hi:.4}"), c.to_string()]
        })
        .collect();
    write_tsv(path, &["bin_lo", "bin_hi", "count"], &rows)
}

pub fn write_qq_tsv(path: &Path, rows: &[QqRow]) -> Result<()> {
    let formatted: Vec<Vec<String>> = rows
        .iter()
        .map(|r| {
            vec![
                format!("{:.6}", r.expected),
                format!("{:.6}", r.observed),
                format!("{:.6}", r.neg_log10_expected),
                format!("{:.6}", r.neg_log10_observed),
            ]
        })
        .collect();
    write_tsv(path, &["expected_p", "observed_p", "neg_log10_expected", "neg_log10_observed"], &formatted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn reads_change_table_with_missing_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("change.tsv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "family_id\tA\tB").unwrap();
        writeln!(f, "fam1\t2\t").unwrap();
        drop(f);

        let rows = read_cafe_change_table(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.get("A"), Some(&2));
        assert!(!rows[0].1.contains_key("B"));
    }

    #[test]
    fn strips_state_suffix_from_column_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("change.tsv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "family_id\tNode123_1").unwrap();
        writeln!(f, "fam1\t5").unwrap();
        drop(f);

        let rows = read_cafe_change_table(&path).unwrap();
        assert_eq!(rows[0].1.get("Node123"), Some(&5));
    }

    #[test]
    fn trait_tsv_auto_detects_species_and_trait_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trait.tsv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "species\tsomething\tgain").unwrap();
        writeln!(f, "A\t42\t1").unwrap();
        writeln!(f, "B\t7\t0").unwrap();
        drop(f);

        let table = read_trait_tsv(&path, None).unwrap();
        assert_eq!(table.species_column, "species");
        assert_eq!(table.trait_column, "gain");
        assert!(table.trait_column_auto_detected);
        assert_eq!(table.values.get("A"), Some(&true));
        assert_eq!(table.values.get("B"), Some(&false));
    }

    #[test]
    fn trait_tsv_missing_value_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trait.tsv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "species\tgain").unwrap();
        writeln!(f, "A\tNA").unwrap();
        drop(f);

        let err = read_trait_tsv(&path, Some("gain")).unwrap_err();
        assert!(matches!(err, CafeError::MissingTraitValue(_)));
    }

    #[test]
    fn trait_tsv_ambiguous_without_override_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trait.tsv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "species\tgain\tloss").unwrap();
        writeln!(f, "A\t1\t0").unwrap();
        writeln!(f, "B\t0\t1").unwrap();
        drop(f);

        let err = read_trait_tsv(&path, None).unwrap_err();
        assert!(matches!(err, CafeError::AmbiguousTraitColumn));
    }
}
