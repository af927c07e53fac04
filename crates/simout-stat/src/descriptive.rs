use serde::{Deserialize, Serialize};
use simout_core::errors::{ErrorInfo, SimoutError};

/// Immutable summary statistics over a numeric sample.
///
/// Instances are produced by [`DescriptiveStatBuilder::build`], which checks
/// the cross-field invariants. Accessors return `None` for an empty sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StatFields")]
pub struct DescriptiveStat {
    mean: f64,
    variance: f64,
    standard_deviation: f64,
    min: f64,
    max: f64,
    size: u64,
}

// Deserialized snapshots are re-validated through the builder.
#[derive(Deserialize)]
struct StatFields {
    mean: f64,
    variance: f64,
    min: f64,
    max: f64,
    size: u64,
}

impl TryFrom<StatFields> for DescriptiveStat {
    type Error = SimoutError;

    fn try_from(fields: StatFields) -> Result<Self, Self::Error> {
        let size = i64::try_from(fields.size).map_err(|err| {
            SimoutError::Serde(ErrorInfo::new("stat.size_overflow", err.to_string()))
        })?;
        DescriptiveStatBuilder::new()
            .mean(fields.mean)
            .variance(fields.variance)
            .min(fields.min)
            .max(fields.max)
            .size(size)
            .build()
    }
}

impl DescriptiveStat {
    /// Returns the statistic of an empty sample.
    pub fn empty() -> Self {
        Self {
            mean: 0.0,
            variance: 0.0,
            standard_deviation: 0.0,
            min: 0.0,
            max: 0.0,
            size: 0,
        }
    }

    fn defined(&self, value: f64) -> Option<f64> {
        (self.size > 0).then_some(value)
    }

    /// Sample mean.
    pub fn mean(&self) -> Option<f64> {
        self.defined(self.mean)
    }

    /// Sample variance.
    pub fn variance(&self) -> Option<f64> {
        self.defined(self.variance)
    }

    /// Square root of the variance, fixed at construction.
    pub fn standard_deviation(&self) -> Option<f64> {
        self.defined(self.standard_deviation)
    }

    /// Smallest observed value.
    pub fn min(&self) -> Option<f64> {
        self.defined(self.min)
    }

    /// Largest observed value.
    pub fn max(&self) -> Option<f64> {
        self.defined(self.max)
    }

    /// Number of samples summarised.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns true when the statistic summarises no samples.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Mutable scaffold for [`DescriptiveStat`].
///
/// Setters perform no validation. [`build`](Self::build) validates and always
/// resets the scaffold, so one builder can produce a sequence of statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DescriptiveStatBuilder {
    mean: f64,
    variance: f64,
    min: f64,
    max: f64,
    size: i64,
}

impl DescriptiveStatBuilder {
    /// Creates an empty scaffold.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the mean.
    pub fn mean(&mut self, mean: f64) -> &mut Self {
        self.mean = mean;
        self
    }

    /// Sets the variance.
    pub fn variance(&mut self, variance: f64) -> &mut Self {
        self.variance = variance;
        self
    }

    /// Sets the minimum.
    pub fn min(&mut self, min: f64) -> &mut Self {
        self.min = min;
        self
    }

    /// Sets the maximum.
    pub fn max(&mut self, max: f64) -> &mut Self {
        self.max = max;
        self
    }

    /// Sets the sample size.
    pub fn size(&mut self, size: i64) -> &mut Self {
        self.size = size;
        self
    }

    /// Validates the scaffold and produces an immutable statistic.
    ///
    /// The scaffold is reset to its empty state whether or not validation
    /// succeeds.
    pub fn build(&mut self) -> Result<DescriptiveStat, SimoutError> {
        let scaffold = std::mem::take(self);
        scaffold.validate()?;
        if scaffold.size == 0 {
            return Ok(DescriptiveStat::empty());
        }
        Ok(DescriptiveStat {
            mean: scaffold.mean,
            variance: scaffold.variance,
            standard_deviation: scaffold.variance.sqrt(),
            min: scaffold.min,
            max: scaffold.max,
            size: scaffold.size as u64,
        })
    }

    fn validate(&self) -> Result<(), SimoutError> {
        if self.size < 0 {
            return Err(SimoutError::Stat(
                self.violation("stat.negative_size", "sample size is negative"),
            ));
        }
        if self.size == 1
            && !(self.min == self.mean && self.mean == self.max && self.variance == 0.0)
        {
            return Err(SimoutError::Stat(
                self.violation(
                    "stat.singleton_inconsistent",
                    "a single sample requires min == mean == max and zero variance",
                )
                .with_hint("check min/max/mean consistency"),
            ));
        }
        if self.size > 1 && !(self.min <= self.mean && self.mean <= self.max) {
            return Err(SimoutError::Stat(
                self.violation("stat.ordering", "expected min <= mean <= max"),
            ));
        }
        if self.size > 1 && !(self.variance >= 0.0) {
            return Err(SimoutError::Stat(
                self.violation("stat.negative_variance", "variance is negative"),
            ));
        }
        Ok(())
    }

    fn violation(&self, code: &str, message: &str) -> ErrorInfo {
        ErrorInfo::new(code, message)
            .with_context("size", self.size.to_string())
            .with_context("mean", self.mean.to_string())
            .with_context("variance", self.variance.to_string())
            .with_context("min", self.min.to_string())
            .with_context("max", self.max.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_build_resets_scaffold() {
        let mut builder = DescriptiveStatBuilder::new();
        builder.size(1).mean(4.0).min(4.0).max(5.0);
        assert!(builder.build().is_err());
        assert_eq!(builder, DescriptiveStatBuilder::default());

        let empty = builder.build().expect("reset scaffold builds");
        assert!(empty.is_empty());
    }

    #[test]
    fn nan_variance_is_rejected_for_larger_samples() {
        let mut builder = DescriptiveStatBuilder::new();
        builder.size(2).mean(1.0).min(0.0).max(2.0).variance(f64::NAN);
        let err = builder.build().unwrap_err();
        assert_eq!(err.code(), "stat.negative_variance");
    }
}
