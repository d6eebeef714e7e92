//! Permutation cache (component G, persistence half).
//!
//! A UTF-8 JSON document, optionally gzip-compressed (selected by a `.gz`
//! path suffix, the same convention the teacher used for its own
//! snapshot I/O). Compatibility is decided purely by field equality on the
//! fingerprint tuple; any mismatch is treated as a cold cache, never an
//! error, per spec §4.G.

use std::fs::File;
use std::io::{Read as _, Write as _};
use std::path::Path;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::bitset::Bitset;
use crate::error::{io_err, Result};
use crate::sampler::Sample;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedSample {
    pub s01: String,
    pub s10: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheFile {
    pub schema_version: u32,
    pub tree_fingerprint: u64,
    pub include_trait_loss: bool,
    pub fg_01_bits: String,
    pub fg_10_bits: String,
    pub seed: u64,
    pub stage: u32,
    pub n_samples: usize,
    pub samples: Vec<CachedSample>,
}

fn encode_bitset(bs: &Bitset) -> String {
    let bytes: Vec<u8> = bs.0.iter().flat_map(|w| w.to_le_bytes()).collect();
    B64.encode(bytes)
}

fn decode_bitset(s: &str, words: usize) -> Option<Bitset> {
    let bytes = B64.decode(s).ok()?;
    if bytes.len() != words * 8 {
        return None;
    }
    let mut out = Bitset::zeros(words);
    for (i, chunk) in bytes.chunks_exact(8).enumerate() {
        out.0[i] = u64::from_le_bytes(chunk.try_into().ok()?);
    }
    Some(out)
}

pub struct Fingerprint {
    pub tree_fingerprint: u64,
    pub include_trait_loss: bool,
    pub fg_01: Bitset,
    pub fg_10: Bitset,
}

impl Fingerprint {
    fn matches(&self, cache: &CacheFile, words: usize) -> bool {
        cache.schema_version == SCHEMA_VERSION
            && cache.tree_fingerprint == self.tree_fingerprint
            && cache.include_trait_loss == self.include_trait_loss
            && decode_bitset(&cache.fg_01_bits, words).as_ref() == Some(&self.fg_01)
            && decode_bitset(&cache.fg_10_bits, words).as_ref() == Some(&self.fg_10)
    }
}

/// Reason a cache load did not produce a reusable sample set, recorded
/// verbatim in run metadata as `cache ignored: <reason>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheMiss {
    NotFound,
    Unreadable(String),
    FingerprintMismatch,
}

pub enum CacheLoad {
    Hit { samples: Vec<Sample>, seed: u64 },
    Miss(CacheMiss),
}

/// Loads a cache file if present and compatible with `fingerprint`/`stage`.
/// Never returns an error for an incompatible or missing cache — only for
/// unexpected I/O failures on a path the caller explicitly named.
pub fn load(path: &Path, fingerprint: &Fingerprint, stage: u32, words: usize) -> Result<CacheLoad> {
    if !path.exists() {
        return Ok(CacheLoad::Miss(CacheMiss::NotFound));
    }
    let raw = read_maybe_gzip(path)?;
    let parsed: Result<CacheFile> = serde_json::from_slice(&raw).map_err(Into::into);
    let cache = match parsed {
        Ok(c) => c,
        Err(e) => return Ok(CacheLoad::Miss(CacheMiss::Unreadable(e.to_string()))),
    };
    if cache.stage != stage || !fingerprint.matches(&cache, words) {
        return Ok(CacheLoad::Miss(CacheMiss::FingerprintMismatch));
    }
    let mut samples = Vec::with_capacity(cache.samples.len());
    for s in &cache.samples {
        let s01 = match decode_bitset(&s.s01, words) {
            Some(b) => b,
            None => return Ok(CacheLoad::Miss(CacheMiss::Unreadable("corrupt sample bits".into()))),
        };
        let s10 = match decode_bitset(&s.s10, words) {
            Some(b) => b,
            None => return Ok(CacheLoad::Miss(CacheMiss::Unreadable("corrupt sample bits".into()))),
        };
        let mut all = s01.clone();
        all.or_assign(&s10);
        samples.push(Sample { s01, s10, all, fallback_dependent_to_independent: false, restarts: 0 });
    }
    Ok(CacheLoad::Hit { samples, seed: cache.seed })
}

/// Writes `samples` to `path`, gzip-compressed when the path ends in `.gz`.
pub fn save(
    path: &Path,
    fingerprint: &Fingerprint,
    seed: u64,
    stage: u32,
    samples: &[Sample],
) -> Result<()> {
    let cache = CacheFile {
        schema_version: SCHEMA_VERSION,
        tree_fingerprint: fingerprint.tree_fingerprint,
        include_trait_loss: fingerprint.include_trait_loss,
        fg_01_bits: encode_bitset(&fingerprint.fg_01),
        fg_10_bits: encode_bitset(&fingerprint.fg_10),
        seed,
        stage,
        n_samples: samples.len(),
        samples: samples
            .iter()
            .map(|s| CachedSample { s01: encode_bitset(&s.s01), s10: encode_bitset(&s.s10) })
            .collect(),
    };
    let json = serde_json::to_vec(&cache)?;
    write_maybe_gzip(path, &json)
}

fn read_maybe_gzip(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| io_err(path.to_path_buf(), e))?;
    let mut raw = Vec::new();
    file.read_to_end(&mut raw).map_err(|e| io_err(path.to_path_buf(), e))?;
    if path.extension().is_some_and(|e| e == "gz") {
        let mut decoder = GzDecoder::new(&raw[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).map_err(|e| io_err(path.to_path_buf(), e))?;
        Ok(out)
    } else {
        Ok(raw)
    }
}

fn write_maybe_gzip(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = File::create(path).map_err(|e| io_err(path.to_path_buf(), e))?;
    if path.extension().is_some_and(|e| e == "gz") {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).map_err(|e| io_err(path.to_path_buf(), e))?;
        let compressed = encoder.finish().map_err(|e| io_err(path.to_path_buf(), e))?;
        file.write_all(&compressed).map_err(|e| io_err(path.to_path_buf(), e))?;
    } else {
        file.write_all(data).map_err(|e| io_err(path.to_path_buf(), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn toy_fingerprint(words: usize) -> Fingerprint {
        Fingerprint {
            tree_fingerprint: 123,
            include_trait_loss: false,
            fg_01: Bitset::from_indices(words, [0, 2]),
            fg_10: Bitset::zeros(words),
        }
    }

    #[test]
    fn round_trip_plain_json() {
        let tmp = NamedTempFile::new().unwrap();
        let fp = toy_fingerprint(1);
        let sample = Sample {
            s01: Bitset::from_indices(1, [1]),
            s10: Bitset::zeros(1),
            all: Bitset::from_indices(1, [1]),
            fallback_dependent_to_independent: false,
            restarts: 0,
        };
        save(tmp.path(), &fp, 7, 1, &[sample]).unwrap();
        let loaded = load(tmp.path(), &fp, 1, 1).unwrap();
        match loaded {
            CacheLoad::Hit { samples, seed } => {
                assert_eq!(seed, 7);
                assert_eq!(samples.len(), 1);
            }
            CacheLoad::Miss(reason) => panic!("expected hit, got {:?}", reason),
        }
    }

    #[test]
    fn fingerprint_mismatch_is_reported_as_miss() {
        let tmp = NamedTempFile::new().unwrap();
        let fp = toy_fingerprint(1);
        save(tmp.path(), &fp, 7, 1, &[]).unwrap();

        let mut other = toy_fingerprint(1);
        other.include_trait_loss = true;
        let loaded = load(tmp.path(), &other, 1, 1).unwrap();
        assert!(matches!(loaded, CacheLoad::Miss(CacheMiss::FingerprintMismatch)));
    }

    #[test]
    fn missing_file_is_not_found() {
        let fp = toy_fingerprint(1);
        let loaded = load(Path::new("/nonexistent/path.json"), &fp, 1, 1).unwrap();
        assert!(matches!(loaded, CacheLoad::Miss(CacheMiss::NotFound)));
    }
}
