/// Steps between two learning-rate halvings.
pub const STEP_INTERVAL: u64 = 100_000;

/// Piecewise-constant learning rate.
///
/// `values[0]` is used while `step <= boundaries[0]`, `values[i]` while
/// `boundaries[i - 1] < step <= boundaries[i]` and the last value after the
/// last boundary, so `values.len() == boundaries.len() + 1` always holds.
#[derive(Debug, Clone, PartialEq)]
pub struct LrSchedule {
    boundaries: Vec<u64>,
    values: Vec<f64>,
}

impl LrSchedule {
    /// Plateau for the first 300k steps, then halve every 100k steps until
    /// `max_steps`.
    pub fn halving(max_steps: u64, learning_rate: f64) -> Self {
        let n = max_steps / STEP_INTERVAL;
        if n < 3 {
            return Self::constant(learning_rate);
        }
        let boundaries = (3..n).map(|i| i * STEP_INTERVAL).collect();
        let values = (0..n - 2)
            .map(|i| learning_rate / 2f64.powi(i as i32))
            .collect();
        Self { boundaries, values }
    }

    pub fn constant(learning_rate: f64) -> Self {
        Self {
            boundaries: Vec::new(),
            values: vec![learning_rate],
        }
    }

    pub fn boundaries(&self) -> &[u64] {
        &self.boundaries
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn learning_rate(&self, step: u64) -> f64 {
        let idx = self.boundaries.partition_point(|&b| b < step);
        self.values[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_run_has_twelve_boundaries() {
        let s = LrSchedule::halving(1_500_000, 1e-4);
        assert_eq!(s.boundaries().len(), 12);
        assert_eq!(s.values().len(), 13);
        assert_eq!(s.boundaries()[0], 300_000);
        assert_eq!(*s.boundaries().last().unwrap(), 1_400_000);
        assert_eq!(s.values()[0], 1e-4);
        assert_eq!(s.values()[1], 5e-5);
    }

    #[test]
    fn lengths_follow_max_steps() {
        for max_steps in [300_000u64, 450_000, 1_000_000, 2_000_000, 2_999_999] {
            let s = LrSchedule::halving(max_steps, 1e-4);
            let n = (max_steps / STEP_INTERVAL) as usize;
            assert_eq!(s.boundaries().len(), n - 3);
            assert_eq!(s.values().len(), n - 2);
        }
    }

    #[test]
    fn values_never_increase() {
        let s = LrSchedule::halving(1_500_000, 1e-4);
        assert!(s.values().windows(2).all(|w| w[1] <= w[0]));
        assert!(s.boundaries().windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn short_runs_use_a_constant_rate() {
        let s = LrSchedule::halving(250_000, 1e-4);
        assert!(s.boundaries().is_empty());
        assert_eq!(s.values(), &[1e-4]);
        assert_eq!(s.learning_rate(0), 1e-4);
        assert_eq!(s.learning_rate(249_999), 1e-4);
    }

    #[test]
    fn lookup_is_piecewise_constant() {
        let s = LrSchedule::halving(1_500_000, 1e-4);
        assert_eq!(s.learning_rate(0), 1e-4);
        assert_eq!(s.learning_rate(300_000), 1e-4);
        assert_eq!(s.learning_rate(300_001), 5e-5);
        assert_eq!(s.learning_rate(400_000), 5e-5);
        assert_eq!(s.learning_rate(400_001), 2.5e-5);
        assert_eq!(s.learning_rate(10_000_000), 1e-4 / 4096.0);
    }
}
