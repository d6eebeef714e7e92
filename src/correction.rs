//! Benjamini-Hochberg correction, ranked reporting, and p-value diagnostics
//! (component H).

/// Benjamini-Hochberg q-values for a set of p-values, computed over the
/// ascending sort order and mapped back to the caller's original order.
/// `q_(i) = min_{j >= i} (m * p_(j)) / j`, clipped to `<= 1`.
pub fn bh_qvalues(pvalues: &[f64]) -> Vec<f64> {
    let m = pvalues.len();
    if m == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| pvalues[a].partial_cmp(&pvalues[b]).unwrap());

    let mut raw = vec![0.0f64; m];
    for (rank, &idx) in order.iter().enumerate() {
        let i = rank + 1;
        raw[rank] = (pvalues[idx] * m as f64 / i as f64).min(1.0);
    }
    // Running minimum from the largest p downward enforces monotonicity.
    for i in (0..m - 1).rev() {
        raw[i] = raw[i].min(raw[i + 1]);
    }

    let mut q = vec![0.0f64; m];
    for (rank, &idx) in order.iter().enumerate() {
        q[idx] = raw[rank];
    }
    q
}

/// One row's worth of ranking fields for the permutation path.
#[derive(Debug, Clone, Copy)]
pub struct PermRankRow {
    pub index: usize,
    pub q_bh: f64,
    pub p_empirical: f64,
    pub stat_obs: f64,
}

/// Ranks permutation-path families by `(q_bh asc, p_empirical asc, stat_obs
/// desc)` and keeps those with `q_bh <= qvalue_threshold`.
pub fn top_hits_permutation(rows: &[PermRankRow], qvalue_threshold: f64) -> Vec<usize> {
    let mut passing: Vec<&PermRankRow> = rows.iter().filter(|r| r.q_bh <= qvalue_threshold).collect();
    passing.sort_by(|a, b| {
        a.q_bh
            .partial_cmp(&b.q_bh)
            .unwrap()
            .then(a.p_empirical.partial_cmp(&b.p_empirical).unwrap())
            .then(b.stat_obs.partial_cmp(&a.stat_obs).unwrap())
    });
    passing.into_iter().map(|r| r.index).collect()
}

/// One row's worth of ranking fields for the Fisher-Tarone path.
#[derive(Debug, Clone, Copy)]
pub struct TaroneRankRow {
    pub index: usize,
    pub reject_tarone: bool,
    pub p_bonf_tarone: f64,
    pub p_fisher: f64,
    pub stat_obs: f64,
}

/// Ranks Fisher-Tarone families with `reject_tarone = true` by
/// `(p_bonf_tarone asc, p_fisher asc, stat_obs desc)`.
pub fn top_hits_tarone(rows: &[TaroneRankRow]) -> Vec<usize> {
    let mut passing: Vec<&TaroneRankRow> = rows.iter().filter(|r| r.reject_tarone).collect();
    passing.sort_by(|a, b| {
        a.p_bonf_tarone
            .partial_cmp(&b.p_bonf_tarone)
            .unwrap()
            .then(a.p_fisher.partial_cmp(&b.p_fisher).unwrap())
            .then(b.stat_obs.partial_cmp(&a.stat_obs).unwrap())
    });
    passing.into_iter().map(|r| r.index).collect()
}

/// A row's fields for primary-p ranking, shared by both test paths.
#[derive(Debug, Clone, Copy)]
pub struct PrimaryRankRow {
    pub index: usize,
    pub p_primary: f64,
    pub p_adjusted: f64,
    pub stat_obs: f64,
}

/// Ranks the top `n` families by `(p_primary asc, p_adjusted asc, stat_obs
/// desc)`. `n = 0` disables the ranking and returns an empty list.
pub fn top_pvalues(rows: &[PrimaryRankRow], n: usize) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let mut sorted: Vec<&PrimaryRankRow> = rows.iter().collect();
    sorted.sort_by(|a, b| {
        a.p_primary
            .partial_cmp(&b.p_primary)
            .unwrap()
            .then(a.p_adjusted.partial_cmp(&b.p_adjusted).unwrap())
            .then(b.stat_obs.partial_cmp(&a.stat_obs).unwrap())
    });
    sorted.into_iter().take(n).map(|r| r.index).collect()
}

/// Equal-width histogram of primary p-values over `[0, 1]`.
pub fn pvalue_histogram(pvalues: &[f64], hist_bins: usize) -> Vec<u64> {
    let mut counts = vec![0u64; hist_bins];
    for &p in pvalues {
        let clamped = p.clamp(0.0, 1.0);
        let mut bin = (clamped * hist_bins as f64) as usize;
        if bin >= hist_bins {
            bin = hist_bins - 1;
        }
        counts[bin] += 1;
    }
    counts
}

/// One row of the expected-vs-observed QQ table, with `-log10` columns for
/// plotting.
#[derive(Debug, Clone, Copy)]
pub struct QqRow {
    pub expected: f64,
    pub observed: f64,
    pub neg_log10_expected: f64,
    pub neg_log10_observed: f64,
}

/// Builds the QQ table: expected quantiles `i / (m + 1)` against the sorted
/// observed p-values.
pub fn qq_table(pvalues: &[f64]) -> Vec<QqRow> {
    let m = pvalues.len();
    let mut sorted = pvalues.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    sorted
        .into_iter()
        .enumerate()
        .map(|(i, observed)| {
            let expected = (i + 1) as f64 / (m as f64 + 1.0);
            QqRow {
                expected,
                observed,
                neg_log10_expected: -expected.log10(),
                neg_log10_observed: -observed.max(f64::MIN_POSITIVE).log10(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bh_qvalues_nondecreasing_and_bounded() {
        let p = vec![0.5, 0.01, 0.2, 0.001, 0.9];
        let q = bh_qvalues(&p);
        let mut order: Vec<usize> = (0..p.len()).collect();
        order.sort_by(|&a, &b| p[a].partial_cmp(&p[b]).unwrap());
        let sorted_q: Vec<f64> = order.iter().map(|&i| q[i]).collect();
        for w in sorted_q.windows(2) {
            assert!(w[0] <= w[1] + 1e-12);
        }
        assert!(q.iter().all(|&x| x <= 1.0));
    }

    #[test]
    fn bh_qvalues_empty_is_empty() {
        assert!(bh_qvalues(&[]).is_empty());
    }

    #[test]
    fn top_pvalues_respects_n_zero_disables() {
        let rows = vec![
            PrimaryRankRow { index: 0, p_primary: 0.1, p_adjusted: 0.2, stat_obs: 3.0 },
            PrimaryRankRow { index: 1, p_primary: 0.05, p_adjusted: 0.1, stat_obs: 1.0 },
        ];
        assert!(top_pvalues(&rows, 0).is_empty());
        let top1 = top_pvalues(&rows, 1);
        assert_eq!(top1, vec![1]);
    }

    #[test]
    fn pvalue_histogram_sums_to_input_len() {
        let p = vec![0.0, 0.5, 0.99, 1.0, 0.33];
        let h = pvalue_histogram(&p, 10);
        assert_eq!(h.iter().sum::<u64>(), p.len() as u64);
    }

    #[test]
    fn qq_table_expected_quantiles_span_unit_interval() {
        let p = vec![0.9, 0.1, 0.5];
        let qq = qq_table(&p);
        assert_eq!(qq.len(), 3);
        assert!(qq[0].expected < qq[1].expected && qq[1].expected < qq[2].expected);
        assert!(qq[0].observed <= qq[1].observed && qq[1].observed <= qq[2].observed);
    }
}
