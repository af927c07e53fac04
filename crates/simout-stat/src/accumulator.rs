use serde::{Deserialize, Serialize};
use simout_core::errors::SimoutError;

use crate::descriptive::{DescriptiveStat, DescriptiveStatBuilder};
use crate::summation::CompensatedSummation;

/// Single pass accumulator over raw samples.
///
/// Mean and squared deviations follow Welford's update; partial accumulators
/// from different runs or threads combine with [`merge`](Self::merge).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleAccumulator {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
    total: CompensatedSummation,
}

impl Default for SampleAccumulator {
    fn default() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            total: CompensatedSummation::new(),
        }
    }
}

impl SampleAccumulator {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Incorporates one sample.
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.total.add(value);
    }

    /// Folds another accumulator into this one.
    pub fn merge(&mut self, other: &SampleAccumulator) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let count = self.count + other.count;
        let delta = other.mean - self.mean;
        let weight = other.count as f64 / count as f64;
        self.mean += delta * weight;
        self.m2 += other.m2 + delta * delta * self.count as f64 * weight;
        self.count = count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.total.add(other.total.sum());
    }

    /// Number of samples pushed so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Compensated total of all samples.
    pub fn sum(&self) -> f64 {
        self.total.sum()
    }

    /// Unbiased sample variance, zero below two samples.
    pub fn variance(&self) -> f64 {
        if self.count > 1 {
            self.m2 / (self.count - 1) as f64
        } else {
            0.0
        }
    }

    /// Returns a builder populated with the accumulated moments.
    pub fn to_builder(&self) -> DescriptiveStatBuilder {
        let mut builder = DescriptiveStatBuilder::new();
        if self.count == 0 {
            return builder;
        }
        // Welford's running mean can drift an ulp outside [min, max].
        let mean = if self.mean < self.min {
            self.min
        } else if self.mean > self.max {
            self.max
        } else {
            self.mean
        };
        let variance = self.variance();
        builder
            .size(self.count as i64)
            .mean(mean)
            .variance(if variance < 0.0 { 0.0 } else { variance })
            .min(self.min)
            .max(self.max);
        builder
    }

    /// Builds the validated summary of the accumulated samples.
    pub fn summarize(&self) -> Result<DescriptiveStat, SimoutError> {
        self.to_builder().build()
    }
}
