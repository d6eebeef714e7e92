//! CLI / run configuration schema (spec §6.2), built on `clap`'s derive
//! macros the same way the teacher's `main.rs` defined `Args`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Serialize;

use crate::error::{CafeError, Result};
use crate::stats::Direction as StatDirection;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Serialize)]
pub enum ModeArg {
    Binary,
    Rate,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Serialize)]
pub enum DirectionArg {
    Gain,
    Loss,
}

impl From<DirectionArg> for StatDirection {
    fn from(d: DirectionArg) -> Self {
        match d {
            DirectionArg::Gain => StatDirection::Gain,
            DirectionArg::Loss => StatDirection::Loss,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Serialize)]
pub enum BinaryTestArg {
    Permutation,
    FisherTarone,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Serialize)]
pub enum AsrMethodArg {
    Ml,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Serialize)]
pub enum CladeBinSchemeArg {
    Log2,
}

/// Tests whether CAFE gene-family copy-number changes concentrate on
/// branches where a binary trait transitioned.
#[derive(Parser, Debug, Clone, Serialize)]
#[command(name = "cafe-trait-assoc", version, about)]
pub struct Config {
    /// Directory containing the CAFE change table (and, when significance
    /// filtering is on, the branch-probability table).
    #[arg(long)]
    pub cafe_dir: PathBuf,

    /// NEXUS tree file.
    #[arg(long)]
    pub tree_file: PathBuf,

    /// Trait TSV.
    #[arg(long)]
    pub trait_tsv: PathBuf,

    /// Name of the binary trait column; auto-detected when omitted.
    #[arg(long)]
    pub trait_column: Option<String>,

    /// Prefix for all output artifacts.
    #[arg(long)]
    pub out_prefix: PathBuf,

    #[arg(long, value_enum, default_value_t = ModeArg::Binary)]
    pub mode: ModeArg,

    #[arg(long, value_enum, default_value_t = DirectionArg::Gain)]
    pub direction: DirectionArg,

    #[arg(long, value_enum, default_value_t = BinaryTestArg::Permutation)]
    pub binary_test: BinaryTestArg,

    #[arg(long, default_value_t = 0.05)]
    pub fwer_alpha: f64,

    #[arg(long, default_value_t = false)]
    pub include_trait_loss: bool,

    #[arg(long, value_enum, default_value_t = AsrMethodArg::Ml)]
    pub asr_method: AsrMethodArg,

    #[arg(long, default_value_t = 0.8)]
    pub asr_posterior_hi: f64,

    #[arg(long, default_value_t = 0.2)]
    pub asr_posterior_lo: f64,

    #[arg(long, default_value_t = false)]
    pub cafe_significant_only: bool,

    #[arg(long, default_value_t = 0.05)]
    pub cafe_alpha: f64,

    #[arg(long, default_value_t = 1000)]
    pub n_perm_initial: usize,

    #[arg(long, default_value_t = 1_000_000)]
    pub n_perm_refine: usize,

    #[arg(long, default_value_t = 0.01)]
    pub refine_p_threshold: f64,

    #[arg(long, value_enum, default_value_t = CladeBinSchemeArg::Log2)]
    pub clade_bin_scheme: CladeBinSchemeArg,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// 0 = auto to CPU count, 1 = sequential, >=2 = worker pool of that size.
    #[arg(long, default_value_t = 0)]
    pub jobs: usize,

    /// Permutation cache path; `.gz` suffix enables gzip compression.
    #[arg(long)]
    pub perm_cache: Option<PathBuf>,

    #[arg(long, default_value_t = 0.05)]
    pub qvalue_threshold: f64,

    #[arg(long, default_value_t = 20)]
    pub hist_bins: usize,

    #[arg(long, default_value_t = 50)]
    pub pvalue_top_n: usize,

    #[arg(long, default_value_t = false)]
    pub make_plots: bool,

    /// Suppress progress output; only warnings and errors are logged.
    #[arg(short = 'q', long, default_value_t = false)]
    pub quiet: bool,
}

impl Config {
    /// Enforces the flag-incompatibility rules from spec §6.2.
    pub fn validate(&self) -> Result<()> {
        if self.binary_test == BinaryTestArg::FisherTarone && self.mode != ModeArg::Binary {
            return Err(CafeError::InvalidConfig(
                "binary_test=fisher-tarone requires mode=binary".to_string(),
            ));
        }
        if self.cafe_significant_only && self.mode != ModeArg::Binary {
            return Err(CafeError::InvalidConfig(
                "cafe_significant_only requires mode=binary".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.asr_posterior_lo)
            || !(0.0..=1.0).contains(&self.asr_posterior_hi)
            || self.asr_posterior_lo > self.asr_posterior_hi
        {
            return Err(CafeError::InvalidConfig(format!(
                "asr_posterior_lo ({}) must be in [0,1] and <= asr_posterior_hi ({})",
                self.asr_posterior_lo, self.asr_posterior_hi
            )));
        }
        if !(0.0..1.0).contains(&self.fwer_alpha) && self.fwer_alpha != 1.0 {
            return Err(CafeError::InvalidConfig(format!(
                "fwer_alpha ({}) must be in (0,1)",
                self.fwer_alpha
            )));
        }
        if self.n_perm_initial == 0 {
            return Err(CafeError::InvalidConfig("n_perm_initial must be > 0".to_string()));
        }
        if self.n_perm_refine == 0 {
            return Err(CafeError::InvalidConfig("n_perm_refine must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.refine_p_threshold) {
            return Err(CafeError::InvalidConfig(format!(
                "refine_p_threshold ({}) must be in (0,1)",
                self.refine_p_threshold
            )));
        }
        if self.hist_bins == 0 {
            return Err(CafeError::InvalidConfig("hist_bins must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.qvalue_threshold) {
            return Err(CafeError::InvalidConfig(format!(
                "qvalue_threshold ({}) must be in [0,1]",
                self.qvalue_threshold
            )));
        }
        Ok(())
    }

    pub fn uses_permutation_path(&self) -> bool {
        self.mode == ModeArg::Rate || self.binary_test == BinaryTestArg::Permutation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            cafe_dir: "cafe".into(),
            tree_file: "tree.nex".into(),
            trait_tsv: "trait.tsv".into(),
            trait_column: None,
            out_prefix: "out".into(),
            mode: ModeArg::Binary,
            direction: DirectionArg::Gain,
            binary_test: BinaryTestArg::Permutation,
            fwer_alpha: 0.05,
            include_trait_loss: false,
            asr_method: AsrMethodArg::Ml,
            asr_posterior_hi: 0.8,
            asr_posterior_lo: 0.2,
            cafe_significant_only: false,
            cafe_alpha: 0.05,
            n_perm_initial: 1000,
            n_perm_refine: 1_000_000,
            refine_p_threshold: 0.01,
            clade_bin_scheme: CladeBinSchemeArg::Log2,
            seed: 0,
            jobs: 0,
            perm_cache: None,
            qvalue_threshold: 0.05,
            hist_bins: 20,
            pvalue_top_n: 50,
            make_plots: false,
            quiet: false,
        }
    }

    #[test]
    fn fisher_tarone_requires_binary_mode() {
        let mut cfg = base_config();
        cfg.mode = ModeArg::Rate;
        cfg.binary_test = BinaryTestArg::FisherTarone;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cafe_significant_only_requires_binary_mode() {
        let mut cfg = base_config();
        cfg.mode = ModeArg::Rate;
        cfg.cafe_significant_only = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn posterior_thresholds_must_be_ordered() {
        let mut cfg = base_config();
        cfg.asr_posterior_lo = 0.9;
        cfg.asr_posterior_hi = 0.1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn valid_binary_config_passes() {
        assert!(base_config().validate().is_ok());
    }
}
