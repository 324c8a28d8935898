use serde::{Deserialize, Serialize};

/// Running mean and variance of a stream of values (Welford's algorithm).
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    n_vals: usize,
    mean: f64,
    diff_2_sum: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub n_vals: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub sem: f64,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, val: f64) {
        self.n_vals += 1;

        let diff_a = val - self.mean;
        self.mean += diff_a / self.n_vals as f64;

        let diff_b = val - self.mean;
        self.diff_2_sum += diff_a * diff_b;
    }

    pub fn summary(&self) -> Summary {
        let (mean, std_dev) = match self.n_vals {
            0 => (f64::NAN, f64::NAN),
            1 => (self.mean, f64::NAN),
            n_vals => (
                self.mean,
                (self.diff_2_sum / (n_vals as f64 - 1.0)).sqrt(),
            ),
        };
        Summary {
            n_vals: self.n_vals,
            mean,
            std_dev,
            sem: std_dev / (self.n_vals as f64).sqrt(),
        }
    }
}

impl FromIterator<f64> for Accumulator {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut acc = Accumulator::new();
        iter.into_iter().for_each(|val| acc.add(val));
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_two_pass_statistics() {
        let vals = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let summary = vals.iter().copied().collect::<Accumulator>().summary();

        assert_eq!(summary.n_vals, 8);
        assert!((summary.mean - 5.0).abs() < 1e-12);
        let var: f64 = 32.0 / 7.0;
        assert!((summary.std_dev - var.sqrt()).abs() < 1e-12);
        assert!((summary.sem - (var / 8.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn empty_and_single_values() {
        let summary = Accumulator::new().summary();
        assert_eq!(summary.n_vals, 0);
        assert!(summary.mean.is_nan());

        let summary = [3.0].into_iter().collect::<Accumulator>().summary();
        assert_eq!(summary.mean, 3.0);
        assert!(summary.std_dev.is_nan());
    }
}
