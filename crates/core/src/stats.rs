//! Small descriptive statistics and the exact binomial test.
//!
//! Every function returns `None` on empty input instead of producing NaN.

use serde::Serialize;

/// Relative tolerance when comparing binomial probabilities, so that
/// outcomes as likely as the observed one are not lost to rounding.
const PMF_RELATIVE_TOLERANCE: f64 = 1e-7;

// ---------------------------------------------------------------------------
// Descriptive
// ---------------------------------------------------------------------------

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Bessel-corrected standard deviation; zero for a single value.
pub fn sample_std(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    if values.len() == 1 {
        return Some(0.0);
    }
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some((ss / (values.len() - 1) as f64).sqrt())
}

/// Summary of a numeric sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Describe {
    pub n: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

pub fn describe(values: &[f64]) -> Option<Describe> {
    Some(Describe {
        n: values.len(),
        mean: mean(values)?,
        std: sample_std(values)?,
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    })
}

// ---------------------------------------------------------------------------
// Binomial test
// ---------------------------------------------------------------------------

/// Two-sided exact binomial test of `successes` out of `trials` against
/// success probability `p`.
///
/// The p-value is the total probability of all outcomes no more likely
/// than the observed one. Returns `None` for zero trials, more successes
/// than trials, or `p` outside `(0, 1)`.
pub fn binomial_two_sided(successes: u64, trials: u64, p: f64) -> Option<f64> {
    if trials == 0 || successes > trials || !(p > 0.0 && p < 1.0) {
        return None;
    }

    let n = trials as usize;
    let ln_fact = ln_factorials(n);
    let (ln_p, ln_q) = (p.ln(), (1.0 - p).ln());
    let ln_pmf = |i: usize| {
        ln_fact[n] - ln_fact[i] - ln_fact[n - i] + i as f64 * ln_p + (n - i) as f64 * ln_q
    };

    let observed = ln_pmf(successes as usize).exp();
    let threshold = observed * (1.0 + PMF_RELATIVE_TOLERANCE);
    let total: f64 = (0..=n)
        .map(|i| ln_pmf(i).exp())
        .filter(|&pmf| pmf <= threshold)
        .sum();
    Some(total.min(1.0))
}

/// `ln(i!)` for `i` in `0..=n`.
fn ln_factorials(n: usize) -> Vec<f64> {
    let mut table = Vec::with_capacity(n + 1);
    let mut acc = 0.0;
    table.push(acc);
    for i in 1..=n {
        acc += (i as f64).ln();
        table.push(acc);
    }
    table
}

/// Signed win-rate difference in percentage points:
/// `(wins_a - wins_b) / total * 100`.
pub fn win_rate_difference(wins_a: u64, wins_b: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some((wins_a as f64 - wins_b as f64) / total as f64 * 100.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    // -- descriptive ----------------------------------------------------------

    #[test]
    fn empty_input_has_no_statistics() {
        assert_eq!(mean(&[]), None);
        assert_eq!(sample_std(&[]), None);
        assert!(describe(&[]).is_none());
    }

    #[test]
    fn single_value_has_zero_std() {
        assert_eq!(sample_std(&[42.0]), Some(0.0));
    }

    #[test]
    fn sample_std_is_bessel_corrected() {
        // mean 5, squared deviations sum to 32, / (8 - 1)
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!(close(sample_std(&values).unwrap(), (32.0f64 / 7.0).sqrt()));
    }

    #[test]
    fn describe_reports_range() {
        let d = describe(&[92.0, 100.0, 80.0]).unwrap();
        assert_eq!(d.n, 3);
        assert_eq!(d.min, 80.0);
        assert_eq!(d.max, 100.0);
        assert!(close(d.mean, 90.666_666_666_666_67));
    }

    // -- binomial_two_sided ---------------------------------------------------

    #[test]
    fn seven_of_ten() {
        assert!(close(binomial_two_sided(7, 10, 0.5).unwrap(), 0.34375));
    }

    #[test]
    fn symmetric_under_p_half() {
        assert!(close(
            binomial_two_sided(3, 10, 0.5).unwrap(),
            binomial_two_sided(7, 10, 0.5).unwrap()
        ));
    }

    #[test]
    fn balanced_outcome_is_one() {
        assert!(close(binomial_two_sided(5, 10, 0.5).unwrap(), 1.0));
    }

    #[test]
    fn extreme_outcome() {
        // 2 / 2^10
        assert!(close(binomial_two_sided(10, 10, 0.5).unwrap(), 2.0 / 1024.0));
    }

    #[test]
    fn asymmetric_p() {
        // Observed 0 of 5 at p = 0.3: pmf(0) = 0.16807; outcomes at most
        // that likely are 0, 3, 4, 5.
        let expected = 0.16807 + 0.1323 + 0.02835 + 0.00243;
        assert!(close(binomial_two_sided(0, 5, 0.3).unwrap(), expected));
    }

    #[test]
    fn degenerate_inputs() {
        assert_eq!(binomial_two_sided(0, 0, 0.5), None);
        assert_eq!(binomial_two_sided(4, 3, 0.5), None);
        assert_eq!(binomial_two_sided(1, 3, 1.0), None);
    }

    // -- win_rate_difference --------------------------------------------------

    #[test]
    fn effect_size_in_points() {
        assert!(close(win_rate_difference(7, 3, 10).unwrap(), 40.0));
        assert!(close(win_rate_difference(2, 5, 10).unwrap(), -30.0));
        assert_eq!(win_rate_difference(0, 0, 0), None);
    }
}
