//! Antenna pointing sweep.
//!
//! A sweep is the nested enumeration of (azimuth, elevation) positions around
//! a center, azimuth outer and elevation inner. Each axis runs from
//! `center - span/2` up to and including `center + span/2` in `step`
//! increments, so an axis holds `floor(span / step) + 1` positions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance applied to `span / step` before flooring so that spans which are
/// exact multiples of the step in decimal (e.g. 1.0 / 0.1) keep their upper
/// edge.
const DIVISION_TOLERANCE: f64 = 1e-9;

/// Upper bound on positions per axis. Anything larger is a configuration
/// mistake (typically a step of a few nano-degrees).
pub const MAX_POSITIONS_PER_AXIS: u64 = 100_000;

/// Pointing axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Axis {
    Azimuth,
    Elevation,
}

/// Reasons a sweep descriptor cannot be enumerated.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SweepError {
    #[error("{axis} step must be greater than zero")]
    ZeroStep { axis: Axis },

    #[error("{axis} span can't be negative")]
    NegativeSpan { axis: Axis },

    #[error("{axis} center, span and step must be finite numbers")]
    NonFinite { axis: Axis },

    #[error("{axis} sweep would visit {count} positions (limit {})", MAX_POSITIONS_PER_AXIS)]
    TooManyPositions { axis: Axis, count: u64 },
}

/// Pointing sweep parameters, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepDescriptor {
    /// Center azimuth.
    pub az: f64,
    /// Center elevation.
    pub el: f64,
    /// Total azimuth span.
    pub az_range: f64,
    pub az_step: f64,
    /// Total elevation span.
    pub el_range: f64,
    pub el_step: f64,
}

impl SweepDescriptor {
    /// A sweep that visits only the center position.
    pub fn single(az: f64, el: f64) -> Self {
        Self {
            az,
            el,
            az_range: 0.0,
            az_step: 1.0,
            el_range: 0.0,
            el_step: 1.0,
        }
    }
}

/// One pointing position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPoint {
    pub azimuth: f64,
    pub elevation: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct AxisRange {
    start: f64,
    step: f64,
    count: u64,
}

impl AxisRange {
    fn new(axis: Axis, center: f64, span: f64, step: f64) -> Result<Self, SweepError> {
        if !(center.is_finite() && span.is_finite() && step.is_finite()) {
            return Err(SweepError::NonFinite { axis });
        }
        if step <= 0.0 {
            return Err(SweepError::ZeroStep { axis });
        }
        if span < 0.0 {
            return Err(SweepError::NegativeSpan { axis });
        }

        let steps = (span / step + DIVISION_TOLERANCE).floor();
        if steps >= MAX_POSITIONS_PER_AXIS as f64 {
            return Err(SweepError::TooManyPositions {
                axis,
                count: steps as u64 + 1,
            });
        }

        Ok(Self {
            start: center - span / 2.0,
            step,
            count: steps as u64 + 1,
        })
    }

    fn value(&self, index: u64) -> f64 {
        self.start + index as f64 * self.step
    }
}

/// Validated sweep ready for enumeration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepGrid {
    azimuth: AxisRange,
    elevation: AxisRange,
}

impl SweepGrid {
    pub fn new(descriptor: &SweepDescriptor) -> Result<Self, SweepError> {
        Ok(Self {
            azimuth: AxisRange::new(
                Axis::Azimuth,
                descriptor.az,
                descriptor.az_range,
                descriptor.az_step,
            )?,
            elevation: AxisRange::new(
                Axis::Elevation,
                descriptor.el,
                descriptor.el_range,
                descriptor.el_step,
            )?,
        })
    }

    pub fn azimuth_positions(&self) -> u64 {
        self.azimuth.count
    }

    pub fn elevation_positions(&self) -> u64 {
        self.elevation.count
    }

    /// Total number of positions in the sweep.
    pub fn len(&self) -> u64 {
        self.azimuth.count.saturating_mul(self.elevation.count)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Positions in capture order: azimuth outer, elevation inner.
    pub fn points(&self) -> impl Iterator<Item = SweepPoint> + '_ {
        (0..self.azimuth.count).flat_map(move |a| {
            let azimuth = self.azimuth.value(a);
            (0..self.elevation.count).map(move |e| SweepPoint {
                azimuth,
                elevation: self.elevation.value(e),
            })
        })
    }
}
