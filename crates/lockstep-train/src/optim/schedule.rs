//! Linear warmup then linear decay learning-rate multiplier.

/// Multiplier for training progress `x = step / t_total`.
///
/// - `x < warmup`: linear ramp `x / warmup`
/// - otherwise: linear decay reaching 0 at `x = 1`, never negative
pub fn warmup_linear(x: f64, warmup: f64) -> f64 {
    if x < warmup {
        return x / warmup;
    }
    if warmup >= 1.0 {
        return 1.0;
    }
    ((x - 1.0) / (warmup - 1.0)).max(0.0)
}

/// Training progress of optimizer step `step` out of `t_total`.
pub fn progress(step: u64, t_total: u64) -> f64 {
    step as f64 / t_total.max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_ramp() {
        assert!((warmup_linear(0.0, 0.1) - 0.0).abs() < 1e-12);
        assert!((warmup_linear(0.05, 0.1) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_peak_and_decay() {
        assert!((warmup_linear(0.1, 0.1) - 1.0).abs() < 1e-12);
        assert!((warmup_linear(0.55, 0.1) - 0.5).abs() < 1e-12);
        assert!(warmup_linear(1.0, 0.1).abs() < 1e-12);
        assert_eq!(warmup_linear(1.5, 0.1), 0.0);
    }

    #[test]
    fn test_no_warmup() {
        assert!((warmup_linear(0.0, 0.0) - 1.0).abs() < 1e-12);
        assert!((warmup_linear(0.25, 0.0) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_progress_guards_zero_total() {
        assert_eq!(progress(5, 0), 5.0);
        assert_eq!(progress(5, 10), 0.5);
    }
}
