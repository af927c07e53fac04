use serde::{Deserialize, Serialize};

/// Running sum with Kahan compensation.
///
/// The carried error term keeps the accumulated rounding error bounded by a
/// few ulps of the magnitude sum independently of the number of terms.
/// Non-finite inputs are not filtered and surface as a non-finite total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CompensatedSummation {
    running_sum: f64,
    carried_error: f64,
}

impl CompensatedSummation {
    /// Creates an accumulator with a zero total.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value to the running total.
    pub fn add(&mut self, value: f64) {
        let corrected = value - self.carried_error;
        let next = self.running_sum + corrected;
        self.carried_error = (next - self.running_sum) - corrected;
        self.running_sum = next;
    }

    /// Returns the compensated total of every value added so far.
    pub fn sum(&self) -> f64 {
        self.running_sum
    }
}

impl Extend<f64> for CompensatedSummation {
    fn extend<I: IntoIterator<Item = f64>>(&mut self, iter: I) {
        for value in iter {
            self.add(value);
        }
    }
}

impl FromIterator<f64> for CompensatedSummation {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut acc = Self::new();
        acc.extend(iter);
        acc
    }
}
